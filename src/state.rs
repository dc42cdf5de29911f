//! Application state shared across HTTP handlers and background loops.

use std::sync::Arc;

use crate::auth::{CredentialCipher, JwtHandler};
use crate::engine::position::PositionManager;
use crate::engine::queue::QueueManager;
use crate::engine::risk::RiskEngineService;
use crate::engine::router::SignalRouter;
use crate::engine::EngineContext;
use crate::models::Config;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub ctx: EngineContext,
    pub jwt: Arc<JwtHandler>,
    pub cipher: Arc<CredentialCipher>,
    pub signal_router: Arc<SignalRouter>,
    pub positions: Arc<PositionManager>,
    pub queue: Arc<QueueManager>,
    pub risk: Arc<RiskEngineService>,
}

impl AppState {
    pub fn new(config: Config, ctx: EngineContext) -> Self {
        let jwt = Arc::new(JwtHandler::new(config.secret_key.clone()));
        let cipher = Arc::new(CredentialCipher::new(&config.encryption_key));
        let signal_router = Arc::new(SignalRouter::new(ctx.clone()));
        let positions = Arc::new(PositionManager::new(ctx.clone()));
        let queue = Arc::new(QueueManager::new(ctx.clone()));
        let risk = Arc::new(RiskEngineService::new(ctx.clone()));
        Self {
            config: Arc::new(config),
            ctx,
            jwt,
            cipher,
            signal_router,
            positions,
            queue,
            risk,
        }
    }
}
