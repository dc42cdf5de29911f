//! Position manager: creation, continuation, stats, TP placement, exits.

pub mod closer;
pub mod creator;
pub mod stats;
pub mod tp;

use thiserror::Error;
use uuid::Uuid;

use crate::engine::{pool::ExecutionPoolManager, EngineContext};
use crate::exchange::ExchangeError;
use crate::grid::PlanError;
use crate::models::{PositionGroup, RiskActionType, User, WebhookPayload};
use crate::precision::PrecisionError;

pub use creator::{ContinuationOutcome, CreateOutcome};

#[derive(Debug, Error)]
pub enum PositionError {
    #[error("no DCA configuration for {pair} @ {timeframe} on {exchange}")]
    NoDcaConfig {
        pair: String,
        timeframe: u32,
        exchange: String,
    },
    #[error("position group {group_id} not found")]
    GroupNotFound { group_id: Uuid },
    #[error("max pyramids reached ({max_pyramids})")]
    MaxPyramidsReached { max_pyramids: u32 },
    #[error("insufficient free balance: need {needed:.2} {asset}, have {available:.2}")]
    InsufficientBalance {
        needed: f64,
        available: f64,
        asset: String,
    },
    #[error(transparent)]
    Plan(#[from] PlanError),
    #[error(transparent)]
    Precision(#[from] PrecisionError),
    #[error(transparent)]
    Exchange(#[from] ExchangeError),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl PositionError {
    /// Transient exchange trouble surfaces as 503 on the webhook path.
    pub fn is_transient(&self) -> bool {
        match self {
            PositionError::Exchange(e) => e.is_transient(),
            PositionError::Precision(PrecisionError::Exchange(e)) => e.is_transient(),
            _ => false,
        }
    }
}

/// Orchestrates the position lifecycle over the shared store and gateways.
pub struct PositionManager {
    ctx: EngineContext,
    pool: ExecutionPoolManager,
}

impl PositionManager {
    pub fn new(ctx: EngineContext) -> Self {
        let pool = ExecutionPoolManager::new(ctx.db.clone());
        Self { ctx, pool }
    }

    pub fn context(&self) -> &EngineContext {
        &self.ctx
    }

    pub fn pool(&self) -> &ExecutionPoolManager {
        &self.pool
    }

    /// Fresh-entry path: plan, slot-checked admit, submit.
    pub async fn create_from_signal(
        &self,
        user: &User,
        payload: &WebhookPayload,
        force: bool,
    ) -> Result<CreateOutcome, PositionError> {
        creator::create_position_group(&self.ctx, &self.pool, user, payload, force).await
    }

    /// Continuation path: append a pyramid to the existing active group.
    pub async fn continue_pyramid(
        &self,
        user: &User,
        group: &PositionGroup,
        payload: &WebhookPayload,
    ) -> Result<ContinuationOutcome, PositionError> {
        creator::continue_pyramid(&self.ctx, user, group, payload).await
    }

    /// Exit-signal path: no audit row.
    pub async fn handle_exit(
        &self,
        user: &User,
        group_id: Uuid,
    ) -> Result<PositionGroup, PositionError> {
        closer::execute_exit(&self.ctx, user, group_id, None).await
    }

    /// Operator close: records a manual_close action.
    pub async fn force_close(
        &self,
        user: &User,
        group_id: Uuid,
    ) -> Result<PositionGroup, PositionError> {
        closer::execute_exit(&self.ctx, user, group_id, Some(RiskActionType::ManualClose)).await
    }
}
