//! Order fill monitor: the polling loop that reconciles open orders with the
//! exchange and drives TP placement and stat recomputation.
//!
//! One DB round-trip per concern per iteration, one connector per
//! (user, exchange) group, sequential per user. A single order's failure is
//! logged and deferred to the next iteration; it never aborts the loop.

use std::collections::BTreeMap;

use anyhow::Result;
use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::position::{stats, tp};
use super::EngineContext;
use crate::cache::CoordinationCache;
use crate::exchange::ExchangeConnector;
use crate::models::{
    DcaOrder, OrderSide, OrderStatus, OrderType, PositionGroup, PyramidStatus, RiskAction,
    RiskActionType, TpMode, User, SYNTHETIC_EXIT_LEG,
};
use crate::store::OpenOrderContext;

const QTY_EPSILON: f64 = 1e-9;

pub struct OrderFillMonitor {
    ctx: EngineContext,
}

impl OrderFillMonitor {
    pub fn new(ctx: EngineContext) -> Self {
        Self { ctx }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(
            self.ctx.settings.fill_monitor_interval_secs.max(1),
        ));
        let mut iteration: u64 = 0;
        info!("order fill monitor started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    iteration += 1;
                    if let Err(e) = self.run_iteration(iteration).await {
                        warn!(error = %e, "fill monitor iteration failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("order fill monitor stopping");
                        return;
                    }
                }
            }
        }
    }

    /// One reconciliation sweep across all users.
    pub async fn run_iteration(&self, iteration: u64) -> Result<()> {
        let open = self.ctx.db.open_orders_with_context().await?;
        let tp_checks = self.ctx.db.pending_tp_orders_with_context().await?;
        let tp_retries = self.ctx.db.entries_missing_tp_with_context().await?;
        let aggregate_checks = self.ctx.db.groups_with_live_aggregate_tp().await?;
        let aggregate_retries = self.ctx.db.groups_missing_aggregate_tp().await?;

        // One connector per (user, exchange) for the whole iteration.
        let mut batches: BTreeMap<(Uuid, String), Batch> = BTreeMap::new();
        for octx in open {
            batches
                .entry((octx.user_id, octx.exchange.clone()))
                .or_default()
                .fills
                .push(octx);
        }
        for octx in tp_checks {
            batches
                .entry((octx.user_id, octx.exchange.clone()))
                .or_default()
                .tp_checks
                .push(octx);
        }
        for octx in tp_retries {
            batches
                .entry((octx.user_id, octx.exchange.clone()))
                .or_default()
                .tp_retries
                .push(octx);
        }
        for group in aggregate_checks {
            batches
                .entry((group.user_id, group.exchange.clone()))
                .or_default()
                .aggregate_checks
                .push(group);
        }
        for group in aggregate_retries {
            batches
                .entry((group.user_id, group.exchange.clone()))
                .or_default()
                .aggregate_retries
                .push(group);
        }

        let mut processed = 0usize;
        for ((user_id, exchange), batch) in batches {
            let Some(user) = self.ctx.db.get_user(user_id).await? else {
                warn!(%user_id, "open orders for unknown user, skipping");
                continue;
            };
            let connector = match self.ctx.connectors.connect(&user, &exchange) {
                Ok(c) => c,
                Err(e) => {
                    warn!(%user_id, %exchange, error = %e, "connector unavailable this iteration");
                    continue;
                }
            };

            for octx in &batch.fills {
                processed += 1;
                if let Err(e) = self.process_open_order(&user, connector.as_ref(), octx).await {
                    warn!(order_id = %octx.order.id, error = %e, "order reconciliation failed");
                }
            }
            for octx in &batch.tp_checks {
                if let Err(e) = self.process_tp_order(connector.as_ref(), octx).await {
                    warn!(order_id = %octx.order.id, error = %e, "TP reconciliation failed");
                }
            }
            for octx in &batch.tp_retries {
                if let Err(e) = self.retry_tp_placement(connector.as_ref(), octx).await {
                    warn!(order_id = %octx.order.id, error = %e, "TP placement retry failed");
                }
            }
            for group in &batch.aggregate_checks {
                if let Err(e) = self.process_aggregate_tp(connector.as_ref(), group).await {
                    warn!(group_id = %group.id, error = %e, "aggregate TP reconciliation failed");
                }
            }
            for group in &batch.aggregate_retries {
                if let Err(e) =
                    tp::place_aggregate_tp(&self.ctx, connector.as_ref(), group.id).await
                {
                    warn!(group_id = %group.id, error = %e, "aggregate TP retry failed");
                }
            }
            connector.close().await;
        }

        self.ctx
            .cache
            .set_service_health(
                "order_fill_monitor",
                serde_json::json!({
                    "iteration": iteration,
                    "orders_checked": processed,
                    "last_run": Utc::now().to_rfc3339(),
                }),
            )
            .await;
        Ok(())
    }

    /// Reconciles one open entry/exit order against the venue.
    async fn process_open_order(
        &self,
        _user: &User,
        connector: &dyn ExchangeConnector,
        octx: &OpenOrderContext,
    ) -> Result<()> {
        let order = &octx.order;
        let Some(exchange_order_id) = order.exchange_order_id.as_deref() else {
            return Ok(());
        };
        let venue = connector
            .get_order_status(exchange_order_id, &octx.symbol)
            .await?;
        let new_status = venue.status.to_order_status();

        let unchanged = new_status == order.status
            && (venue.filled_quantity - order.filled_quantity).abs() < QTY_EPSILON;
        if unchanged {
            return Ok(());
        }

        match new_status {
            OrderStatus::Filled | OrderStatus::PartiallyFilled => {
                let mut fee = venue.fee;
                if fee <= 0.0 && venue.filled_quantity > 0.0 {
                    let rate = connector
                        .get_trading_fee_rate(Some(&octx.symbol))
                        .await
                        .unwrap_or(0.001);
                    fee = venue.filled_quantity * venue.avg_fill_price * rate;
                }
                let filled_at = (new_status == OrderStatus::Filled).then(Utc::now);
                self.ctx
                    .db
                    .record_order_fill(
                        order.id,
                        new_status,
                        venue.filled_quantity,
                        venue.avg_fill_price,
                        fee,
                        venue.fee_currency.as_deref(),
                        filled_at,
                    )
                    .await?;
                debug!(
                    order_id = %order.id,
                    status = new_status.as_str(),
                    filled = venue.filled_quantity,
                    "fill recorded"
                );

                let price = connector.get_current_price(&octx.symbol).await.ok();
                stats::recompute_group_stats(&self.ctx.db, order.group_id, price).await?;

                if new_status == OrderStatus::Filled && order.side == OrderSide::Buy {
                    self.after_entry_fill(connector, order).await;
                }
            }
            OrderStatus::Cancelled => {
                self.ctx.db.mark_order_cancelled(order.id, Utc::now()).await?;
                let price = connector.get_current_price(&octx.symbol).await.ok();
                stats::recompute_group_stats(&self.ctx.db, order.group_id, price).await?;
            }
            OrderStatus::Failed => {
                self.ctx.db.mark_order_failed(order.id).await?;
                let price = connector.get_current_price(&octx.symbol).await.ok();
                stats::recompute_group_stats(&self.ctx.db, order.group_id, price).await?;
            }
            _ => {}
        }
        Ok(())
    }

    /// TP placement and pyramid bookkeeping after an entry leg filled.
    /// Failures here leave the fill standing; the retry pass picks them up.
    async fn after_entry_fill(&self, connector: &dyn ExchangeConnector, order: &DcaOrder) {
        let group = match self.ctx.db.get_group(order.group_id).await {
            Ok(Some(g)) => g,
            _ => return,
        };
        let refreshed = match self.ctx.db.get_order(order.id).await {
            Ok(Some(o)) => o,
            _ => return,
        };
        if let Err(e) = tp::place_tp_for_fill(&self.ctx, connector, &group, &refreshed).await {
            warn!(order_id = %order.id, error = %e, "TP placement failed, will retry");
        }
        if let Err(e) = self.advance_pyramid_status(order.pyramid_id).await {
            warn!(pyramid_id = %order.pyramid_id, error = %e, "pyramid status update failed");
        }
    }

    async fn advance_pyramid_status(&self, pyramid_id: Uuid) -> Result<()> {
        let legs = self.ctx.db.get_orders_for_pyramid(pyramid_id).await?;
        let entries: Vec<&DcaOrder> = legs
            .iter()
            .filter(|o| o.side == OrderSide::Buy && o.leg_index != SYNTHETIC_EXIT_LEG)
            .collect();
        if entries.is_empty() {
            return Ok(());
        }
        let all_settled = entries.iter().all(|o| {
            matches!(
                o.status,
                OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Failed
            )
        });
        let any_filled = entries.iter().any(|o| o.status == OrderStatus::Filled);
        if all_settled && any_filled {
            self.ctx
                .db
                .set_pyramid_status(pyramid_id, PyramidStatus::Filled)
                .await?;
        }
        Ok(())
    }

    /// Checks a live TP order; on execution records the synthetic exit row,
    /// settles hybrid/pyramid bookkeeping, and recomputes stats.
    async fn process_tp_order(
        &self,
        connector: &dyn ExchangeConnector,
        octx: &OpenOrderContext,
    ) -> Result<()> {
        let order = &octx.order;
        let Some(tp_order_id) = order.tp_order_id.as_deref() else {
            return Ok(());
        };
        let venue = connector.get_order_status(tp_order_id, &octx.symbol).await?;

        match venue.status.to_order_status() {
            OrderStatus::Filled => {
                let now = Utc::now();
                self.ctx.db.mark_tp_hit(order.id, now).await?;

                let mut fee = venue.fee;
                if fee <= 0.0 && venue.filled_quantity > 0.0 {
                    let rate = connector
                        .get_trading_fee_rate(Some(&octx.symbol))
                        .await
                        .unwrap_or(0.001);
                    fee = venue.filled_quantity * venue.avg_fill_price * rate;
                }
                let synthetic = DcaOrder {
                    id: Uuid::new_v4(),
                    group_id: order.group_id,
                    pyramid_id: order.pyramid_id,
                    leg_index: SYNTHETIC_EXIT_LEG,
                    side: OrderSide::Sell,
                    order_type: OrderType::Limit,
                    price: venue.avg_fill_price,
                    quantity: venue.filled_quantity,
                    quote_amount: None,
                    status: OrderStatus::Filled,
                    filled_quantity: venue.filled_quantity,
                    avg_fill_price: venue.avg_fill_price,
                    fee,
                    fee_currency: venue.fee_currency.clone(),
                    tp_percent: None,
                    tp_price: None,
                    tp_order_id: None,
                    tp_hit: false,
                    tp_executed_at: None,
                    exchange_order_id: Some(tp_order_id.to_string()),
                    submitted_at: Some(now),
                    filled_at: Some(now),
                    cancelled_at: None,
                    created_at: now,
                };
                self.ctx.db.insert_order(&synthetic).await?;

                let group = self.ctx.db.get_group(order.group_id).await?.ok_or_else(|| {
                    anyhow::anyhow!("group {} vanished under TP settlement", order.group_id)
                })?;

                match group.tp_mode {
                    // First target to fire wins; the counterpart is cancelled.
                    TpMode::Hybrid => {
                        tp::cancel_all_group_tps(&self.ctx, connector, group.id, Some(tp_order_id))
                            .await?;
                    }
                    TpMode::PyramidAggregate => {
                        tp::settle_pyramid_tp(
                            &self.ctx,
                            &group,
                            order.pyramid_id,
                            venue.avg_fill_price,
                            venue.filled_quantity,
                        )
                        .await?;
                    }
                    _ => {}
                }

                let action = RiskAction {
                    id: Uuid::new_v4(),
                    action_type: RiskActionType::TpHit,
                    loser_group_id: Some(group.id),
                    winner_group_ids: Vec::new(),
                    quantity: venue.filled_quantity,
                    price: venue.avg_fill_price,
                    pnl_usd: (venue.avg_fill_price - group.weighted_avg_entry)
                        * venue.filled_quantity,
                    duration_seconds: None,
                    details: Some(format!("TP executed for leg {}", order.leg_index)),
                    created_at: now,
                };
                self.ctx.db.insert_risk_action(&action).await?;

                let price = connector.get_current_price(&octx.symbol).await.ok();
                stats::recompute_group_stats(&self.ctx.db, order.group_id, price).await?;
                info!(
                    group_id = %order.group_id,
                    leg = order.leg_index,
                    qty = venue.filled_quantity,
                    price = venue.avg_fill_price,
                    "take-profit executed"
                );
            }
            OrderStatus::Cancelled | OrderStatus::Failed => {
                // Cancelled out from under us (operator or venue): detach so
                // the retry pass can place a fresh one.
                self.ctx.db.clear_order_tp(order.id).await?;
            }
            _ => {}
        }
        Ok(())
    }

    async fn retry_tp_placement(
        &self,
        connector: &dyn ExchangeConnector,
        octx: &OpenOrderContext,
    ) -> Result<()> {
        let group = match self.ctx.db.get_group(octx.order.group_id).await? {
            Some(g) if !g.status.is_terminal() => g,
            _ => return Ok(()),
        };
        tp::place_tp_for_fill(&self.ctx, connector, &group, &octx.order).await
    }

    /// Checks a group's live aggregate TP; on execution records the synthetic
    /// exit for the whole position and (hybrid) cancels the per-leg TPs.
    async fn process_aggregate_tp(
        &self,
        connector: &dyn ExchangeConnector,
        group: &PositionGroup,
    ) -> Result<()> {
        let Some(tp_order_id) = group.aggregate_tp_order_id.as_deref() else {
            return Ok(());
        };
        let venue = connector.get_order_status(tp_order_id, &group.symbol).await?;

        match venue.status.to_order_status() {
            OrderStatus::Filled => {
                let now = Utc::now();
                let mut fee = venue.fee;
                if fee <= 0.0 && venue.filled_quantity > 0.0 {
                    let rate = connector
                        .get_trading_fee_rate(Some(&group.symbol))
                        .await
                        .unwrap_or(0.001);
                    fee = venue.filled_quantity * venue.avg_fill_price * rate;
                }

                let pyramids = self.ctx.db.list_pyramids(group.id).await?;
                let Some(pyramid_id) = pyramids.last().map(|p| p.id) else {
                    anyhow::bail!("group {} has no pyramids", group.id);
                };
                let synthetic = DcaOrder {
                    id: Uuid::new_v4(),
                    group_id: group.id,
                    pyramid_id,
                    leg_index: SYNTHETIC_EXIT_LEG,
                    side: OrderSide::Sell,
                    order_type: OrderType::Limit,
                    price: venue.avg_fill_price,
                    quantity: venue.filled_quantity,
                    quote_amount: None,
                    status: OrderStatus::Filled,
                    filled_quantity: venue.filled_quantity,
                    avg_fill_price: venue.avg_fill_price,
                    fee,
                    fee_currency: venue.fee_currency.clone(),
                    tp_percent: None,
                    tp_price: None,
                    tp_order_id: None,
                    tp_hit: false,
                    tp_executed_at: None,
                    exchange_order_id: Some(tp_order_id.to_string()),
                    submitted_at: Some(now),
                    filled_at: Some(now),
                    cancelled_at: None,
                    created_at: now,
                };
                self.ctx.db.insert_order(&synthetic).await?;
                self.ctx.db.set_group_aggregate_tp(group.id, None).await?;

                // Hybrid: the aggregate won; per-leg TPs come down.
                if group.tp_mode == TpMode::Hybrid {
                    tp::cancel_all_group_tps(&self.ctx, connector, group.id, Some(tp_order_id))
                        .await?;
                }

                let action = RiskAction {
                    id: Uuid::new_v4(),
                    action_type: RiskActionType::TpHit,
                    loser_group_id: Some(group.id),
                    winner_group_ids: Vec::new(),
                    quantity: venue.filled_quantity,
                    price: venue.avg_fill_price,
                    pnl_usd: (venue.avg_fill_price - group.weighted_avg_entry)
                        * venue.filled_quantity,
                    duration_seconds: None,
                    details: Some("aggregate TP executed".to_string()),
                    created_at: now,
                };
                self.ctx.db.insert_risk_action(&action).await?;

                let price = connector.get_current_price(&group.symbol).await.ok();
                stats::recompute_group_stats(&self.ctx.db, group.id, price).await?;
                info!(
                    group_id = %group.id,
                    qty = venue.filled_quantity,
                    price = venue.avg_fill_price,
                    "aggregate take-profit executed"
                );
            }
            OrderStatus::Cancelled | OrderStatus::Failed => {
                // Cancelled externally; the retry pass re-places it.
                self.ctx.db.set_group_aggregate_tp(group.id, None).await?;
            }
            _ => {}
        }
        Ok(())
    }
}

#[derive(Default)]
struct Batch {
    fills: Vec<OpenOrderContext>,
    tp_checks: Vec<OpenOrderContext>,
    tp_retries: Vec<OpenOrderContext>,
    aggregate_checks: Vec<PositionGroup>,
    aggregate_retries: Vec<PositionGroup>,
}
