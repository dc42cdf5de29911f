//! Registration, login, and logout.

use std::collections::HashMap;
use std::time::Duration;

use axum::{extract::State, http::StatusCode, Extension, Json};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use super::ApiError;
use crate::auth::{hash_password, verify_password, Claims};
use crate::cache::CoordinationCache;
use crate::models::{RiskEngineConfig, User};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

/// Resolves the authenticated user from the middleware-injected claims.
pub(crate) async fn current_user(state: &AppState, claims: &Claims) -> Result<User, ApiError> {
    let user_id = Uuid::parse_str(&claims.sub)
        .map_err(|_| ApiError::new(StatusCode::UNAUTHORIZED, "malformed token subject"))?;
    state
        .ctx
        .db
        .get_user(user_id)
        .await?
        .filter(|u| u.is_active)
        .ok_or_else(|| ApiError::new(StatusCode::UNAUTHORIZED, "user not found or inactive"))
}

pub async fn register(
    State(state): State<AppState>,
    Json(body): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    if body.username.trim().is_empty() || body.password.len() < 8 {
        return Err(ApiError::bad_request(
            "username required and password must be at least 8 characters",
        ));
    }
    if state
        .ctx
        .db
        .get_user_by_username(body.username.trim())
        .await?
        .is_some()
    {
        return Err(ApiError::new(
            StatusCode::CONFLICT,
            "username already taken",
        ));
    }

    let user = User {
        id: Uuid::new_v4(),
        username: body.username.trim().to_string(),
        email: body.email.trim().to_string(),
        password_hash: hash_password(&body.password)?,
        is_active: true,
        webhook_secret: Some(Uuid::new_v4().simple().to_string()),
        secure_signals: true,
        exchange_credentials: HashMap::new(),
        risk_config: RiskEngineConfig::default(),
        created_at: Utc::now(),
    };
    state.ctx.db.create_user(&user).await?;

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "id": user.id,
            "username": user.username,
            "webhook_secret": user.webhook_secret,
        })),
    ))
}

pub async fn login(
    State(state): State<AppState>,
    Json(body): Json<LoginRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user = state
        .ctx
        .db
        .get_user_by_username(body.username.trim())
        .await?
        .filter(|u| u.is_active)
        .ok_or_else(|| ApiError::new(StatusCode::UNAUTHORIZED, "invalid credentials"))?;

    if !verify_password(&body.password, &user.password_hash) {
        return Err(ApiError::new(StatusCode::UNAUTHORIZED, "invalid credentials"));
    }

    let (token, _jti, expires_in) = state.jwt.generate_token(&user)?;
    Ok(Json(json!({
        "access_token": token,
        "token_type": "bearer",
        "expires_in": expires_in,
    })))
}

/// Blacklists the session's jti for the remainder of its lifetime.
pub async fn logout(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let remaining = state.jwt.remaining_seconds(&claims);
    if remaining > 0 {
        state
            .ctx
            .cache
            .blacklist_token(&claims.jti, Duration::from_secs(remaining))
            .await;
    }
    Ok(Json(json!({"message": "logged out"})))
}
