//! Positions surface: list, inspect, operator close.

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
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub include_closed: bool,
}

pub async fn list(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Query(query): Query<ListQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user = current_user(&state, &claims).await?;
    let groups = state
        .ctx
        .db
        .list_groups_for_user(user.id, query.include_closed)
        .await?;
    Ok(Json(json!({"positions": groups})))
}

pub async fn get_one(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user = current_user(&state, &claims).await?;
    let group = state
        .ctx
        .db
        .get_group(id)
        .await?
        .filter(|g| g.user_id == user.id)
        .ok_or_else(|| ApiError::not_found("position group not found"))?;

    let pyramids = state.ctx.db.list_pyramids(group.id).await?;
    let orders = state.ctx.db.get_orders_for_group(group.id).await?;
    Ok(Json(json!({
        "group": group,
        "pyramids": pyramids,
        "orders": orders,
    })))
}

/// POST /api/positions/{id}/close — market-close the whole group and record
/// a manual_close risk action.
pub async fn close(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user = current_user(&state, &claims).await?;
    state
        .ctx
        .db
        .get_group(id)
        .await?
        .filter(|g| g.user_id == user.id)
        .ok_or_else(|| ApiError::not_found("position group not found"))?;

    let closed = state
        .positions
        .force_close(&user, id)
        .await
        .map_err(|e| ApiError::bad_request(e.to_string()))?;
    Ok(Json(json!({
        "group_id": closed.id,
        "status": closed.status.as_str(),
        "realized_pnl_usd": closed.realized_pnl_usd,
    })))
}
