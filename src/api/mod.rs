//! HTTP surfaces: the TradingView webhook plus the operator API
//! (auth, settings, DCA configs, positions, queue, risk, health).

mod auth_api;
mod dca_configs;
mod logs;
mod positions;
mod queue;
mod risk;
mod settings;
mod webhooks;

use axum::{
    http::{HeaderValue, StatusCode},
    middleware as axum_mw,
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Json, Router,
};
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};

use crate::auth::{auth_middleware, AuthLayerState};
use crate::cache::CoordinationCache;
use crate::state::AppState;

/// Uniform error body for the operator API.
pub struct ApiError {
    pub status: StatusCode,
    pub detail: String,
}

impl ApiError {
    pub fn new(status: StatusCode, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: detail.into(),
        }
    }

    pub fn not_found(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, detail)
    }

    pub fn bad_request(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, detail)
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({"detail": self.detail}))).into_response()
    }
}

async fn health_check(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> impl IntoResponse {
    let mut services = serde_json::Map::new();
    for name in ["order_fill_monitor", "risk_engine", "queue_promoter"] {
        let entry = match state.ctx.cache.get_service_health(name).await {
            Some(h) => json!({"updated_at": h.updated_at.to_rfc3339(), "payload": h.payload}),
            None => json!(null),
        };
        services.insert(name.to_string(), entry);
    }
    Json(json!({"status": "ok", "services": services}))
}

/// Builds the full application router.
pub fn build_router(state: AppState) -> Router {
    let auth_layer = AuthLayerState {
        jwt: state.jwt.clone(),
        cache: state.ctx.cache.clone(),
    };
    let origins: Vec<HeaderValue> = state
        .config
        .cors_origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();
    let cors = CorsLayer::new()
        .allow_origin(origins)
        .allow_methods(Any)
        .allow_headers(Any);

    let protected = Router::new()
        .route("/api/auth/logout", post(auth_api::logout))
        .route("/api/settings", get(settings::get_settings))
        .route("/api/settings", put(settings::update_settings))
        .route("/api/dca-configs", get(dca_configs::list))
        .route("/api/dca-configs", post(dca_configs::create))
        .route("/api/dca-configs/:id", get(dca_configs::get_one))
        .route("/api/dca-configs/:id", put(dca_configs::update))
        .route("/api/dca-configs/:id", delete(dca_configs::remove))
        .route("/api/positions", get(positions::list))
        .route("/api/positions/:id", get(positions::get_one))
        .route("/api/positions/:id/close", post(positions::close))
        .route("/api/queue", get(queue::list))
        .route("/api/queue/history", get(queue::history))
        .route("/api/queue/:id/promote", post(queue::promote))
        .route("/api/queue/:id/force-add", post(queue::force_add))
        .route("/api/queue/:id", delete(queue::remove))
        .route("/api/risk/actions", get(risk::actions))
        .route("/api/risk/run-evaluation", post(risk::run_evaluation))
        .route("/api/risk/:group_id/block", post(risk::block))
        .route("/api/risk/:group_id/unblock", post(risk::unblock))
        .route("/api/risk/:group_id/skip", post(risk::skip))
        .route("/api/logs", get(logs::tail))
        .layer(axum_mw::from_fn_with_state(auth_layer, auth_middleware));

    Router::new()
        .route("/health", get(health_check))
        .route(
            "/webhooks/:user_id/tradingview",
            post(webhooks::tradingview_webhook),
        )
        .route("/api/auth/register", post(auth_api::register))
        .route("/api/auth/login", post(auth_api::login))
        .merge(protected)
        .layer(axum_mw::from_fn(
            crate::middleware::logging::request_logging,
        ))
        .layer(cors)
        .with_state(state)
}
