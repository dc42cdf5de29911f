//! Signal router: webhook validation, secret check, admission classification,
//! and dispatch into the position manager or the queue.

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use super::position::{
    ContinuationOutcome, CreateOutcome, PositionError, PositionManager,
};
use super::queue::QueueManager;
use super::EngineContext;
use crate::auth::security::constant_time_eq;
use crate::cache::CoordinationCache;
use crate::models::{OrderSide, User, WebhookPayload};

/// Lock TTL covering one webhook's processing window.
const WEBHOOK_LOCK_TTL: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum RouteError {
    /// Spot trading: sell without exit intent is a short, and rejected.
    #[error("spot trading does not support short positions; use execution_intent.type='exit' to close a long")]
    ShortNotSupported,
    #[error("webhook secret validation failed")]
    SecretInvalid,
    #[error("user not found or inactive")]
    UserUnavailable,
    #[error("another webhook for this symbol/timeframe is being processed")]
    LockContention,
    #[error("invalid payload: {0}")]
    Validation(String),
    #[error("max pyramids reached ({0})")]
    MaxPyramids(u32),
    #[error("exchange temporarily unavailable: {0}")]
    Transient(String),
    #[error("signal rejected: {0}")]
    Rejected(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

#[derive(Debug, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RouteOutcome {
    Created {
        group_id: Uuid,
        accepted_legs: usize,
        failed_legs: usize,
    },
    Enqueued {
        signal_id: Uuid,
        priority_score: f64,
        replacement_count: u32,
    },
    PyramidAdded {
        group_id: Uuid,
        pyramid_id: Uuid,
    },
    ExitExecuted {
        group_id: Uuid,
        status: String,
    },
    /// Exit signal with nothing open; queued entries were still cancelled.
    ExitNoPosition,
}

pub struct SignalRouter {
    ctx: EngineContext,
    positions: PositionManager,
    queue: QueueManager,
}

impl SignalRouter {
    pub fn new(ctx: EngineContext) -> Self {
        let positions = PositionManager::new(ctx.clone());
        let queue = QueueManager::new(ctx.clone());
        Self {
            ctx,
            positions,
            queue,
        }
    }

    /// Full admission path for one webhook. The per-(user, symbol, timeframe,
    /// side) lock serializes concurrent deliveries; contention is a 409.
    pub async fn route(
        &self,
        user_id: Uuid,
        payload: &WebhookPayload,
    ) -> Result<RouteOutcome, RouteError> {
        payload
            .check_placeholders()
            .map_err(|e| RouteError::Validation(e.to_string()))?;
        if payload.user_id != user_id {
            return Err(RouteError::Validation(
                "payload user_id does not match webhook path".to_string(),
            ));
        }

        let user = self
            .ctx
            .db
            .get_user(user_id)
            .await
            .map_err(RouteError::Internal)?
            .filter(|u| u.is_active)
            .ok_or(RouteError::UserUnavailable)?;

        if user.secure_signals {
            let expected = user.webhook_secret.as_deref().unwrap_or_default();
            if expected.is_empty()
                || !constant_time_eq(expected.as_bytes(), payload.secret.as_bytes())
            {
                warn!(%user_id, "webhook secret mismatch");
                return Err(RouteError::SecretInvalid);
            }
        }

        let action = payload.tv.action.to_lowercase();
        if action == "sell" && !payload.is_exit() {
            info!(%user_id, symbol = %payload.tv.symbol, "short signal rejected");
            return Err(RouteError::ShortNotSupported);
        }

        // Spot: every position is long (buy to enter, sell to exit).
        let lock_name = format!(
            "webhook:{}:{}:{}:long",
            user_id, payload.tv.symbol, payload.tv.timeframe
        );
        let lock_owner = Uuid::new_v4().to_string();
        if !self
            .ctx
            .cache
            .acquire_lock(&lock_name, &lock_owner, WEBHOOK_LOCK_TTL)
            .await
        {
            warn!(%user_id, symbol = %payload.tv.symbol, "webhook lock contention");
            return Err(RouteError::LockContention);
        }

        let result = self.route_locked(&user, payload).await;

        if !self.ctx.cache.release_lock(&lock_name, &lock_owner).await {
            warn!(lock = %lock_name, "failed to release webhook lock");
        }
        result
    }

    async fn route_locked(
        &self,
        user: &User,
        payload: &WebhookPayload,
    ) -> Result<RouteOutcome, RouteError> {
        let exchange = payload.tv.exchange.to_lowercase();
        let symbol = payload.tv.symbol.as_str();
        let timeframe = payload.tv.timeframe;

        if payload.is_exit() {
            // Exit drops any queued entries for the same pair first.
            self.queue
                .cancel_for_symbol(
                    user.id,
                    symbol,
                    &exchange,
                    Some(timeframe),
                    Some(OrderSide::Buy),
                )
                .await
                .map_err(RouteError::Internal)?;

            let group = self
                .ctx
                .db
                .find_active_group(user.id, symbol, timeframe, &exchange, OrderSide::Buy)
                .await
                .map_err(RouteError::Internal)?;
            return match group {
                Some(group) => {
                    let closed = self
                        .positions
                        .handle_exit(user, group.id)
                        .await
                        .map_err(map_position_error)?;
                    Ok(RouteOutcome::ExitExecuted {
                        group_id: closed.id,
                        status: closed.status.as_str().to_string(),
                    })
                }
                None => Ok(RouteOutcome::ExitNoPosition),
            };
        }

        let existing = self
            .ctx
            .db
            .find_active_group(user.id, symbol, timeframe, &exchange, OrderSide::Buy)
            .await
            .map_err(RouteError::Internal)?;

        if let Some(group) = existing {
            // Same pair and timeframe: pyramid continuation, no slot needed.
            return match self.positions.continue_pyramid(user, &group, payload).await {
                Ok(ContinuationOutcome::Added { pyramid_id, .. }) => {
                    Ok(RouteOutcome::PyramidAdded {
                        group_id: group.id,
                        pyramid_id,
                    })
                }
                Ok(ContinuationOutcome::RolledBack) => Err(RouteError::Rejected(
                    "every continuation leg was rejected by the exchange".to_string(),
                )),
                Err(e) => Err(map_position_error(e)),
            };
        }

        match self.positions.create_from_signal(user, payload, false).await {
            Ok(CreateOutcome::Created {
                group,
                accepted_legs,
                failed_legs,
            }) => Ok(RouteOutcome::Created {
                group_id: group.id,
                accepted_legs,
                failed_legs,
            }),
            Ok(CreateOutcome::Denied) => {
                let signal = self
                    .queue
                    .enqueue(user.id, payload, false, None)
                    .await
                    .map_err(RouteError::Internal)?;
                Ok(RouteOutcome::Enqueued {
                    signal_id: signal.id,
                    priority_score: signal.priority_score,
                    replacement_count: signal.replacement_count,
                })
            }
            Err(e) => Err(map_position_error(e)),
        }
    }
}

fn map_position_error(e: PositionError) -> RouteError {
    if e.is_transient() {
        return RouteError::Transient(e.to_string());
    }
    match e {
        PositionError::MaxPyramidsReached { max_pyramids } => {
            RouteError::MaxPyramids(max_pyramids)
        }
        PositionError::Internal(err) => RouteError::Internal(err),
        other => RouteError::Rejected(other.to_string()),
    }
}

impl RouteError {
    /// HTTP status for the webhook surface.
    pub fn status_code(&self) -> u16 {
        match self {
            RouteError::ShortNotSupported => 400,
            RouteError::MaxPyramids(_) => 400,
            RouteError::Rejected(_) => 400,
            RouteError::SecretInvalid => 403,
            RouteError::UserUnavailable => 404,
            RouteError::LockContention => 409,
            RouteError::Validation(_) => 422,
            RouteError::Transient(_) => 503,
            RouteError::Internal(_) => 500,
        }
    }
}
