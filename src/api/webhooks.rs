//! TradingView webhook endpoint.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use uuid::Uuid;

use crate::models::WebhookPayload;
use crate::state::AppState;

/// POST /webhooks/{user_id}/tradingview
///
/// 202 on success, 400 short rejection, 403 secret failure, 409 lock
/// contention, 422 schema error, 503 transient exchange trouble.
pub async fn tradingview_webhook(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    Json(body): Json<serde_json::Value>,
) -> Response {
    let payload: WebhookPayload = match serde_json::from_value(body) {
        Ok(p) => p,
        Err(e) => {
            return (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(json!({"detail": format!("schema error: {e}")})),
            )
                .into_response();
        }
    };

    match state.signal_router.route(user_id, &payload).await {
        Ok(outcome) => (
            StatusCode::ACCEPTED,
            Json(json!({
                "status": "success",
                "message": "Signal received and is being processed.",
                "result": outcome,
            })),
        )
            .into_response(),
        Err(e) => {
            let status =
                StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            (status, Json(json!({"detail": e.to_string()}))).into_response()
        }
    }
}
