//! User settings: webhook secret, signal security, risk config, API keys.

use axum::{extract::State, Extension, Json};
use serde::Deserialize;
use serde_json::json;

use super::auth_api::current_user;
use super::ApiError;
use crate::auth::Claims;
use crate::models::{ExchangeCredentials, RiskEngineConfig};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct SettingsUpdate {
    pub webhook_secret: Option<String>,
    pub secure_signals: Option<bool>,
    pub risk_config: Option<RiskEngineConfig>,
    /// Exchange key rotation: all three fields together.
    pub api_key: Option<String>,
    pub secret_key: Option<String>,
    pub key_target_exchange: Option<String>,
    pub testnet: Option<bool>,
    pub account_type: Option<String>,
}

pub async fn get_settings(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user = current_user(&state, &claims).await?;
    let configured: Vec<serde_json::Value> = user
        .exchange_credentials
        .iter()
        .map(|(name, creds)| {
            json!({
                "exchange": name,
                "testnet": creds.testnet,
                "account_type": creds.account_type,
            })
        })
        .collect();
    Ok(Json(json!({
        "id": user.id,
        "username": user.username,
        "email": user.email,
        "webhook_secret": user.webhook_secret,
        "secure_signals": user.secure_signals,
        "risk_config": user.risk_config,
        "configured_exchanges": configured,
    })))
}

pub async fn update_settings(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(body): Json<SettingsUpdate>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let mut user = current_user(&state, &claims).await?;

    if let Some(secret) = body.webhook_secret {
        user.webhook_secret = Some(secret);
    }
    if let Some(secure) = body.secure_signals {
        user.secure_signals = secure;
    }
    if let Some(risk_config) = body.risk_config {
        user.risk_config = risk_config;
    }

    match (&body.api_key, &body.secret_key, &body.key_target_exchange) {
        (Some(api_key), Some(secret_key), Some(exchange)) => {
            let sealed = state.cipher.seal_keys(api_key, secret_key)?;
            user.exchange_credentials.insert(
                exchange.to_lowercase(),
                ExchangeCredentials {
                    sealed_keys: sealed,
                    testnet: body.testnet.unwrap_or(false),
                    account_type: body.account_type.clone().unwrap_or_else(|| "UNIFIED".into()),
                },
            );
        }
        (None, None, None) => {}
        _ => {
            return Err(ApiError::bad_request(
                "api_key, secret_key and key_target_exchange must be provided together",
            ));
        }
    }

    state.ctx.db.update_user(&user).await?;
    Ok(Json(json!({"message": "settings updated"})))
}
