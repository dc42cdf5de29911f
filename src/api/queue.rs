//! Queue surface: inspection plus operator promote / force-add / remove.

use axum::{
    extract::{Path, Query, State},
    Extension, Json,
};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use super::auth_api::current_user;
use super::ApiError;
use crate::auth::Claims;
use crate::models::QueuedSignal;
use crate::state::AppState;

pub async fn list(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<Vec<QueuedSignal>>, ApiError> {
    let user = current_user(&state, &claims).await?;
    Ok(Json(state.ctx.db.queued_signals_for_user(user.id).await?))
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    50
}

pub async fn history(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<QueuedSignal>>, ApiError> {
    let user = current_user(&state, &claims).await?;
    Ok(Json(
        state
            .ctx
            .db
            .queue_history_for_user(user.id, query.limit)
            .await?,
    ))
}

/// Promotes one signal if a slot is available.
pub async fn promote(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user = current_user(&state, &claims).await?;
    match state
        .queue
        .promote_specific(id, user.id, &state.positions)
        .await?
    {
        Some(signal) => Ok(Json(json!({"promoted": signal.id}))),
        None => Err(ApiError::not_found(
            "queued signal not found or could not be promoted",
        )),
    }
}

/// Forces a signal into the pool, overriding the position cap.
pub async fn force_add(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user = current_user(&state, &claims).await?;
    match state.queue.force_add(id, user.id, &state.positions).await? {
        Some(signal) => Ok(Json(json!({"promoted": signal.id, "forced": true}))),
        None => Err(ApiError::not_found(
            "queued signal not found or could not be forced into the pool",
        )),
    }
}

pub async fn remove(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user = current_user(&state, &claims).await?;
    if state.queue.remove(id, user.id).await? {
        Ok(Json(json!({"message": "queued signal removed"})))
    } else {
        Err(ApiError::not_found("queued signal not found"))
    }
}
