//! Queue manager: admitted-but-unscheduled signals, priority scoring, and
//! the promoter loop that drains the queue as slots free up.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

use super::position::{CreateOutcome, PositionError, PositionManager};
use super::EngineContext;
use crate::cache::CoordinationCache;
use crate::models::{OrderSide, QueueStatus, QueuedSignal, WebhookPayload};

const TIER_PYRAMID_CONTINUATION: f64 = 10_000_000.0;
const TIER_LOSS_DEPTH: f64 = 1_000_000.0;
const TIER_BASE: f64 = 10_000.0;

/// Priority score plus a human-readable explanation. Higher wins.
///
/// Tier 1: pyramid continuations. Tier 2: current-loss depth (deeper losses
/// promote first so averaging-down resumes). Tier 3: replacement count.
/// Time-in-queue breaks ties inside a tier.
pub fn priority_score(signal: &QueuedSignal, now: DateTime<Utc>) -> (f64, String) {
    let age_seconds = (now - signal.queued_at).num_seconds().max(0) as f64;
    let tiebreak = age_seconds * 0.001;

    if signal.is_pyramid_continuation {
        let score = TIER_PYRAMID_CONTINUATION + tiebreak;
        return (
            score,
            format!("pyramid continuation (queued {age_seconds:.0}s)"),
        );
    }
    if let Some(loss) = signal.current_loss_percent.filter(|l| *l < 0.0) {
        let score = TIER_LOSS_DEPTH + loss.abs() * 10_000.0 + tiebreak;
        return (
            score,
            format!("open loss {loss:.2}% (queued {age_seconds:.0}s)"),
        );
    }
    let score = TIER_BASE + signal.replacement_count as f64 * 100.0 + tiebreak;
    (
        score,
        format!(
            "replacements {} (queued {age_seconds:.0}s)",
            signal.replacement_count
        ),
    )
}

pub struct QueueManager {
    ctx: EngineContext,
}

impl QueueManager {
    pub fn new(ctx: EngineContext) -> Self {
        Self { ctx }
    }

    /// Queues a signal that could not take a slot. Idempotent per queue slot:
    /// a repeat collapses into the existing row (replacement_count++).
    pub async fn enqueue(
        &self,
        user_id: Uuid,
        payload: &WebhookPayload,
        is_pyramid_continuation: bool,
        current_loss_percent: Option<f64>,
    ) -> Result<QueuedSignal> {
        let signal = QueuedSignal {
            id: Uuid::new_v4(),
            user_id,
            exchange: payload.tv.exchange.to_lowercase(),
            symbol: payload.tv.symbol.clone(),
            timeframe: payload.tv.timeframe,
            side: OrderSide::Buy,
            entry_price: payload.tv.entry_price,
            signal_payload: serde_json::to_value(payload).context("serialize signal payload")?,
            queued_at: Utc::now(),
            replacement_count: 0,
            priority_score: 0.0,
            is_pyramid_continuation,
            current_loss_percent,
            priority_explanation: None,
            status: QueueStatus::Queued,
            promoted_at: None,
            rejection_reason: None,
        };
        let (stored, replaced) = self.ctx.db.enqueue_signal(&signal).await?;
        let (score, explanation) = priority_score(&stored, Utc::now());
        self.ctx
            .db
            .update_signal_priority(stored.id, score, &explanation)
            .await?;

        info!(
            signal_id = %stored.id,
            symbol = %stored.symbol,
            replaced,
            score,
            "signal queued"
        );
        self.ctx.db.get_queued_signal(stored.id).await.map(|s| s.unwrap_or(stored))
    }

    /// Drops pending entries for a symbol (exit-signal cleanup).
    pub async fn cancel_for_symbol(
        &self,
        user_id: Uuid,
        symbol: &str,
        exchange: &str,
        timeframe: Option<u32>,
        side: Option<OrderSide>,
    ) -> Result<usize> {
        let cancelled = self
            .ctx
            .db
            .cancel_queued_for_symbol(user_id, symbol, exchange, timeframe, side)
            .await?;
        if cancelled > 0 {
            info!(user_id = %user_id, symbol, cancelled, "queued entries cancelled on exit");
        }
        Ok(cancelled)
    }

    /// Refreshes scores and promotes the user's best signal if a slot opens.
    /// Returns the promoted signal, if any.
    pub async fn promote_highest_priority(
        &self,
        user_id: Uuid,
        positions: &PositionManager,
    ) -> Result<Option<QueuedSignal>> {
        let now = Utc::now();
        let mut queued = self.ctx.db.queued_signals_for_user(user_id).await?;
        for signal in &mut queued {
            let (score, explanation) = priority_score(signal, now);
            signal.priority_score = score;
            self.ctx
                .db
                .update_signal_priority(signal.id, score, &explanation)
                .await?;
        }
        queued.sort_by(|a, b| {
            b.priority_score
                .partial_cmp(&a.priority_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let Some(best) = queued.into_iter().next() else {
            return Ok(None);
        };
        match self.try_promote(&best, positions, false).await? {
            true => Ok(Some(best)),
            false => Ok(None),
        }
    }

    /// Operator-driven promotion of one signal; still respects the slot cap.
    pub async fn promote_specific(
        &self,
        signal_id: Uuid,
        user_id: Uuid,
        positions: &PositionManager,
    ) -> Result<Option<QueuedSignal>> {
        let Some(signal) = self.owned_queued_signal(signal_id, user_id).await? else {
            return Ok(None);
        };
        match self.try_promote(&signal, positions, false).await? {
            true => Ok(Some(signal)),
            false => Ok(None),
        }
    }

    /// Operator override: creates the group even when the pool is full.
    pub async fn force_add(
        &self,
        signal_id: Uuid,
        user_id: Uuid,
        positions: &PositionManager,
    ) -> Result<Option<QueuedSignal>> {
        let Some(signal) = self.owned_queued_signal(signal_id, user_id).await? else {
            return Ok(None);
        };
        match self.try_promote(&signal, positions, true).await? {
            true => Ok(Some(signal)),
            false => Ok(None),
        }
    }

    pub async fn remove(&self, signal_id: Uuid, user_id: Uuid) -> Result<bool> {
        let Some(signal) = self.owned_queued_signal(signal_id, user_id).await? else {
            return Ok(false);
        };
        self.ctx.db.mark_signal_cancelled(signal.id).await?;
        Ok(true)
    }

    async fn owned_queued_signal(
        &self,
        signal_id: Uuid,
        user_id: Uuid,
    ) -> Result<Option<QueuedSignal>> {
        let signal = self.ctx.db.get_queued_signal(signal_id).await?;
        Ok(signal.filter(|s| s.user_id == user_id && s.status == QueueStatus::Queued))
    }

    /// Replays the stored payload through the creation path. Returns true when
    /// the signal left the queue (promoted or rejected), false when it should
    /// stay queued (pool full, transient exchange trouble).
    async fn try_promote(
        &self,
        signal: &QueuedSignal,
        positions: &PositionManager,
        force: bool,
    ) -> Result<bool> {
        let payload: WebhookPayload = match serde_json::from_value(signal.signal_payload.clone()) {
            Ok(p) => p,
            Err(e) => {
                self.ctx
                    .db
                    .mark_signal_rejected(signal.id, &format!("malformed stored payload: {e}"))
                    .await?;
                return Ok(true);
            }
        };
        let Some(user) = self.ctx.db.get_user(signal.user_id).await? else {
            self.ctx
                .db
                .mark_signal_rejected(signal.id, "user no longer exists")
                .await?;
            return Ok(true);
        };

        // A continuation queued behind the same-pair rule re-enters through
        // the pyramid path; anything else is a fresh admission.
        if signal.is_pyramid_continuation {
            let existing = self
                .ctx
                .db
                .find_active_group(
                    user.id,
                    &signal.symbol,
                    signal.timeframe,
                    &signal.exchange,
                    signal.side,
                )
                .await?;
            if let Some(group) = existing {
                return match positions.continue_pyramid(&user, &group, &payload).await {
                    Ok(_) => {
                        self.ctx.db.mark_signal_promoted(signal.id).await?;
                        Ok(true)
                    }
                    Err(e) => self.settle_promotion_error(signal, e).await,
                };
            }
            // The group closed while queued; fall through to a fresh entry.
        }

        match positions.create_from_signal(&user, &payload, force).await {
            Ok(CreateOutcome::Created { group, .. }) => {
                self.ctx.db.mark_signal_promoted(signal.id).await?;
                info!(signal_id = %signal.id, group_id = %group.id, "queued signal promoted");
                Ok(true)
            }
            Ok(CreateOutcome::Denied) => Ok(false),
            Err(e) => self.settle_promotion_error(signal, e).await,
        }
    }

    async fn settle_promotion_error(
        &self,
        signal: &QueuedSignal,
        error: PositionError,
    ) -> Result<bool> {
        if error.is_transient() {
            warn!(signal_id = %signal.id, error = %error, "promotion deferred (transient)");
            return Ok(false);
        }
        warn!(signal_id = %signal.id, error = %error, "queued signal rejected");
        self.ctx
            .db
            .mark_signal_rejected(signal.id, &error.to_string())
            .await?;
        Ok(true)
    }
}

/// Background promoter: scans per-user queues and fills freed slots.
pub struct QueuePromoter {
    ctx: EngineContext,
    queue: QueueManager,
    positions: PositionManager,
}

impl QueuePromoter {
    pub fn new(ctx: EngineContext) -> Self {
        let queue = QueueManager::new(ctx.clone());
        let positions = PositionManager::new(ctx.clone());
        Self {
            ctx,
            queue,
            positions,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(
            self.ctx.settings.queue_promoter_interval_secs.max(1),
        ));
        info!("queue promoter started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.run_iteration().await {
                        warn!(error = %e, "queue promoter iteration failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("queue promoter stopping");
                        return;
                    }
                }
            }
        }
    }

    pub async fn run_iteration(&self) -> Result<()> {
        let users = self.ctx.db.users_with_queued_signals().await?;
        for user_id in users {
            // Keep promoting for this user until the pool refuses.
            loop {
                match self
                    .queue
                    .promote_highest_priority(user_id, &self.positions)
                    .await
                {
                    Ok(Some(_)) => continue,
                    Ok(None) => break,
                    Err(e) => {
                        warn!(user_id = %user_id, error = %e, "promotion sweep failed");
                        break;
                    }
                }
            }
        }
        self.ctx
            .cache
            .set_service_health(
                "queue_promoter",
                serde_json::json!({"last_run": Utc::now().to_rfc3339()}),
            )
            .await;
        Ok(())
    }
}
