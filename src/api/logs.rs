//! Log tail surface for operators.

use axum::{
    extract::{Query, State},
    Extension, Json,
};
use serde::Deserialize;
use serde_json::json;

use super::auth_api::current_user;
use super::ApiError;
use crate::auth::Claims;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct TailQuery {
    #[serde(default = "default_lines")]
    pub lines: usize,
}

fn default_lines() -> usize {
    200
}

/// GET /api/logs — last N lines of the application log file.
pub async fn tail(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Query(query): Query<TailQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    current_user(&state, &claims).await?;

    let path = state.config.log_file_path.clone();
    let limit = query.lines.clamp(1, 5_000);
    let lines = tokio::task::spawn_blocking(move || read_tail(&path, limit))
        .await
        .map_err(|e| anyhow::anyhow!("log read task failed: {e}"))?;

    Ok(Json(json!({"lines": lines})))
}

fn read_tail(path: &str, limit: usize) -> Vec<String> {
    let Ok(content) = std::fs::read_to_string(path) else {
        return Vec::new();
    };
    let lines: Vec<&str> = content.lines().collect();
    let start = lines.len().saturating_sub(limit);
    lines[start..].iter().map(|s| s.to_string()).collect()
}
