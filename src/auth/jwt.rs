//! JWT token handling for the operator surfaces.
//!
//! Tokens carry a unique `jti` so logout can blacklist them through the
//! coordination cache for the remainder of their lifetime.

use anyhow::{Context, Result};
use chrono::Utc;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::User;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User id.
    pub sub: String,
    pub username: String,
    pub exp: usize,
    pub iat: usize,
    pub jti: String,
}

pub struct JwtHandler {
    secret: String,
    expiration_hours: i64,
}

impl JwtHandler {
    pub fn new(secret: String) -> Self {
        Self {
            secret,
            expiration_hours: 24,
        }
    }

    /// Returns (token, jti, expires_in_seconds).
    pub fn generate_token(&self, user: &User) -> Result<(String, String, usize)> {
        let now = Utc::now();
        let expiration = now
            .checked_add_signed(chrono::Duration::hours(self.expiration_hours))
            .context("Invalid timestamp")?
            .timestamp() as usize;
        let jti = Uuid::new_v4().to_string();

        let claims = Claims {
            sub: user.id.to_string(),
            username: user.username.clone(),
            exp: expiration,
            iat: now.timestamp() as usize,
            jti: jti.clone(),
        };

        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )
        .context("Failed to generate JWT")?;

        Ok((token, jti, (self.expiration_hours * 3600) as usize))
    }

    pub fn validate_token(&self, token: &str) -> Result<Claims> {
        let decoded = decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &Validation::default(),
        )
        .context("Invalid or expired token")?;
        Ok(decoded.claims)
    }

    /// Seconds until the token expires (0 for invalid/expired tokens).
    pub fn remaining_seconds(&self, claims: &Claims) -> u64 {
        let now = Utc::now().timestamp();
        (claims.exp as i64 - now).max(0) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RiskEngineConfig;
    use std::collections::HashMap;

    fn test_user() -> User {
        User {
            id: Uuid::new_v4(),
            username: "trader".to_string(),
            email: "trader@example.com".to_string(),
            password_hash: "hash".to_string(),
            is_active: true,
            webhook_secret: None,
            secure_signals: true,
            exchange_credentials: HashMap::new(),
            risk_config: RiskEngineConfig::default(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_generation_and_validation() {
        let handler = JwtHandler::new("test-secret-key-12345".to_string());
        let user = test_user();

        let (token, jti, expires_in) = handler.generate_token(&user).unwrap();
        assert!(!token.is_empty());
        assert_eq!(expires_in, 24 * 3600);

        let claims = handler.validate_token(&token).unwrap();
        assert_eq!(claims.username, user.username);
        assert_eq!(claims.sub, user.id.to_string());
        assert_eq!(claims.jti, jti);
        assert!(handler.remaining_seconds(&claims) > 0);
    }

    #[test]
    fn test_invalid_token_rejected() {
        let handler = JwtHandler::new("test-secret-key-12345".to_string());
        assert!(handler.validate_token("invalid.token.here").is_err());
    }

    #[test]
    fn test_different_secrets_reject() {
        let handler1 = JwtHandler::new("secret1".to_string());
        let handler2 = JwtHandler::new("secret2".to_string());
        let (token, _, _) = handler1.generate_token(&test_user()).unwrap();
        assert!(handler2.validate_token(&token).is_err());
    }

    #[test]
    fn test_unique_jti_per_token() {
        let handler = JwtHandler::new("secret".to_string());
        let user = test_user();
        let (_, jti1, _) = handler.generate_token(&user).unwrap();
        let (_, jti2, _) = handler.generate_token(&user).unwrap();
        assert_ne!(jti1, jti2);
    }
}
