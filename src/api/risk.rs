//! Risk surface: audit log plus the operator verbs
//! (block / unblock / skip / run-evaluation).

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
use crate::models::{PositionGroup, RiskAction};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ActionsQuery {
    pub group_id: Option<Uuid>,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    100
}

pub async fn actions(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Query(query): Query<ActionsQuery>,
) -> Result<Json<Vec<RiskAction>>, ApiError> {
    current_user(&state, &claims).await?;
    Ok(Json(
        state
            .ctx
            .db
            .list_risk_actions(query.group_id, query.limit)
            .await?,
    ))
}

async fn owned_group(
    state: &AppState,
    claims: &Claims,
    group_id: Uuid,
) -> Result<PositionGroup, ApiError> {
    let user = current_user(state, claims).await?;
    state
        .ctx
        .db
        .get_group(group_id)
        .await?
        .filter(|g| g.user_id == user.id)
        .ok_or_else(|| ApiError::not_found("position group not found"))
}

/// Permanently excludes the group from loser selection.
pub async fn block(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(group_id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    owned_group(&state, &claims, group_id).await?;
    state
        .ctx
        .db
        .mutate_group(group_id, |g, _| {
            g.risk_blocked = true;
        })
        .await?;
    Ok(Json(json!({"group_id": group_id, "risk_blocked": true})))
}

pub async fn unblock(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(group_id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    owned_group(&state, &claims, group_id).await?;
    state
        .ctx
        .db
        .mutate_group(group_id, |g, _| {
            g.risk_blocked = false;
        })
        .await?;
    Ok(Json(json!({"group_id": group_id, "risk_blocked": false})))
}

/// Skips the group for exactly one evaluation round.
pub async fn skip(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(group_id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    owned_group(&state, &claims, group_id).await?;
    state
        .ctx
        .db
        .mutate_group(group_id, |g, _| {
            g.risk_skip_once = true;
        })
        .await?;
    Ok(Json(json!({"group_id": group_id, "risk_skip_once": true})))
}

/// Runs a full risk evaluation for the caller immediately.
pub async fn run_evaluation(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user = current_user(&state, &claims).await?;
    state.risk.evaluate_user(&user).await?;
    Ok(Json(json!({"message": "risk evaluation completed"})))
}
