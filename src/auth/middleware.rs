//! JWT authentication middleware for the operator API.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};

use super::jwt::{Claims, JwtHandler};
use crate::cache::CoordinationCache;

#[derive(Clone)]
pub struct AuthLayerState {
    pub jwt: Arc<JwtHandler>,
    pub cache: Arc<dyn CoordinationCache>,
}

/// Validates the bearer token, rejects blacklisted sessions, and exposes the
/// claims to handlers via request extensions.
pub async fn auth_middleware(
    State(state): State<AuthLayerState>,
    mut req: Request,
    next: Next,
) -> Result<Response, AuthError> {
    let token = req
        .headers()
        .get("Authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(|t| t.to_string())
        .ok_or(AuthError::MissingToken)?;

    let claims = state
        .jwt
        .validate_token(&token)
        .map_err(|_| AuthError::InvalidToken)?;

    if state.cache.is_token_blacklisted(&claims.jti).await {
        return Err(AuthError::RevokedToken);
    }

    req.extensions_mut().insert(claims);
    Ok(next.run(req).await)
}

#[derive(Debug)]
pub enum AuthError {
    MissingToken,
    InvalidToken,
    RevokedToken,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AuthError::MissingToken => (StatusCode::UNAUTHORIZED, "Missing authorization token"),
            AuthError::InvalidToken => (StatusCode::UNAUTHORIZED, "Invalid or expired token"),
            AuthError::RevokedToken => (StatusCode::UNAUTHORIZED, "Token has been revoked"),
        };
        (status, message).into_response()
    }
}
