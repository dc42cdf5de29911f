//! DCA grid configuration CRUD. One configuration per
//! (user, pair, timeframe, exchange).

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Extension, Json,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use super::auth_api::current_user;
use super::ApiError;
use crate::auth::Claims;
use crate::models::{DcaConfiguration, DcaGridConfig};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct DcaConfigRequest {
    pub pair: String,
    pub timeframe: u32,
    pub exchange: String,
    pub grid: DcaGridConfig,
}

pub async fn list(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<Vec<DcaConfiguration>>, ApiError> {
    let user = current_user(&state, &claims).await?;
    Ok(Json(state.ctx.db.list_dca_configs(user.id).await?))
}

pub async fn create(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(body): Json<DcaConfigRequest>,
) -> Result<(StatusCode, Json<DcaConfiguration>), ApiError> {
    let user = current_user(&state, &claims).await?;
    body.grid
        .validate()
        .map_err(|e| ApiError::bad_request(e.to_string()))?;

    let now = Utc::now();
    let config = DcaConfiguration {
        id: Uuid::new_v4(),
        user_id: user.id,
        pair: body.pair.to_uppercase(),
        timeframe: body.timeframe,
        exchange: body.exchange.to_lowercase(),
        grid: body.grid,
        created_at: now,
        updated_at: now,
    };
    state.ctx.db.upsert_dca_config(&config).await?;

    let stored = state
        .ctx
        .db
        .get_dca_config(user.id, &config.pair, config.timeframe, &config.exchange)
        .await?
        .unwrap_or(config);
    Ok((StatusCode::CREATED, Json(stored)))
}

pub async fn get_one(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<Uuid>,
) -> Result<Json<DcaConfiguration>, ApiError> {
    let user = current_user(&state, &claims).await?;
    state
        .ctx
        .db
        .get_dca_config_by_id(id, user.id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found("DCA configuration not found"))
}

pub async fn update(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<Uuid>,
    Json(body): Json<DcaConfigRequest>,
) -> Result<Json<DcaConfiguration>, ApiError> {
    let user = current_user(&state, &claims).await?;
    let existing = state
        .ctx
        .db
        .get_dca_config_by_id(id, user.id)
        .await?
        .ok_or_else(|| ApiError::not_found("DCA configuration not found"))?;
    body.grid
        .validate()
        .map_err(|e| ApiError::bad_request(e.to_string()))?;

    let config = DcaConfiguration {
        id: existing.id,
        user_id: user.id,
        pair: body.pair.to_uppercase(),
        timeframe: body.timeframe,
        exchange: body.exchange.to_lowercase(),
        grid: body.grid,
        created_at: existing.created_at,
        updated_at: Utc::now(),
    };
    state.ctx.db.upsert_dca_config(&config).await?;
    Ok(Json(config))
}

pub async fn remove(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user = current_user(&state, &claims).await?;
    if state.ctx.db.delete_dca_config(id, user.id).await? {
        Ok(Json(json!({"message": "DCA configuration deleted"})))
    } else {
        Err(ApiError::not_found("DCA configuration not found"))
    }
}
