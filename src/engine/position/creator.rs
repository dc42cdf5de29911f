//! Position group creation and pyramid continuation.
//!
//! Rows first, wire second: the group/pyramid/legs are inserted PENDING in
//! one transaction (slot-checked for fresh entries), then each leg is
//! submitted to the exchange outside any transaction, and a follow-up
//! transaction records what the venue accepted.

use anyhow::Result;
use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use super::{stats, PositionError};
use crate::engine::{pool::ExecutionPoolManager, quote_asset, EngineContext};
use crate::exchange::{ExchangeConnector, OrderRequest};
use crate::grid::{calculate_grid, PlannedLeg};
use crate::models::{
    DcaGridConfig, DcaOrder, GroupStatus, OrderSide, OrderStatus, OrderType, PositionGroup,
    Pyramid, PyramidStatus, User, WebhookPayload,
};
use crate::store::AdmitOutcome;

#[derive(Debug)]
pub enum CreateOutcome {
    /// The execution pool is full; the signal should be queued.
    Denied,
    Created {
        group: PositionGroup,
        accepted_legs: usize,
        failed_legs: usize,
    },
}

#[derive(Debug)]
pub enum ContinuationOutcome {
    Added {
        pyramid_id: Uuid,
        accepted_legs: usize,
        failed_legs: usize,
    },
    /// Every leg was rejected; the pyramid row was rolled back atomically.
    RolledBack,
}

/// Plans the grid, validates balance, admits the group against the pool cap,
/// and submits the entry legs. `force` bypasses the slot cap.
pub async fn create_position_group(
    ctx: &EngineContext,
    pool: &ExecutionPoolManager,
    user: &User,
    payload: &WebhookPayload,
    force: bool,
) -> Result<CreateOutcome, PositionError> {
    let exchange = payload.tv.exchange.to_lowercase();
    let symbol = payload.tv.symbol.clone();
    let timeframe = payload.tv.timeframe;

    let dca = ctx
        .db
        .get_dca_config(user.id, &symbol, timeframe, &exchange)
        .await?
        .ok_or_else(|| PositionError::NoDcaConfig {
            pair: symbol.clone(),
            timeframe,
            exchange: exchange.clone(),
        })?;
    let grid_cfg = dca.grid;

    let connector = ctx.connectors.connect(user, &exchange)?;
    let plan = plan_pyramid(ctx, connector.as_ref(), &exchange, &symbol, &grid_cfg, 0, payload.tv.entry_price)
        .await?;

    let planned_notional: f64 = plan.iter().map(|l| l.notional_usd).sum();
    let free = connector.fetch_free_balance().await?;
    let asset = quote_asset(&symbol);
    let available = free.get(asset).copied().unwrap_or(0.0);
    if available < planned_notional {
        connector.close().await;
        return Err(PositionError::InsufficientBalance {
            needed: planned_notional,
            available,
            asset: asset.to_string(),
        });
    }

    let now = Utc::now();
    let group = PositionGroup {
        id: Uuid::new_v4(),
        user_id: user.id,
        exchange: exchange.clone(),
        symbol: symbol.clone(),
        timeframe,
        side: OrderSide::Buy,
        status: GroupStatus::Waiting,
        pyramid_count: 1,
        max_pyramids: grid_cfg.max_pyramids,
        total_dca_legs: plan.len() as u32,
        filled_dca_legs: 0,
        base_entry_price: payload.tv.entry_price,
        weighted_avg_entry: 0.0,
        total_invested_usd: 0.0,
        total_filled_quantity: 0.0,
        unrealized_pnl_usd: 0.0,
        unrealized_pnl_percent: 0.0,
        realized_pnl_usd: 0.0,
        total_entry_fees_usd: 0.0,
        total_exit_fees_usd: 0.0,
        total_hedged_qty: 0.0,
        total_hedged_value_usd: 0.0,
        tp_mode: grid_cfg.tp_mode,
        tp_aggregate_percent: grid_cfg.tp_aggregate_percent,
        aggregate_tp_order_id: None,
        risk_timer_start: None,
        risk_timer_expires: None,
        risk_eligible: false,
        risk_blocked: false,
        risk_skip_once: false,
        created_at: now,
        updated_at: now,
        closing_started_at: None,
        closed_at: None,
    };
    let pyramid = Pyramid {
        id: Uuid::new_v4(),
        group_id: group.id,
        pyramid_index: 0,
        entry_price: payload.tv.entry_price,
        status: PyramidStatus::Pending,
        dca_config: grid_cfg.levels_for_pyramid(0).to_vec(),
        closed_at: None,
        exit_price: None,
        realized_pnl_usd: None,
        total_quantity: None,
        created_at: now,
    };
    let orders = build_entry_orders(group.id, pyramid.id, &plan);

    match pool.admit(user, &group, &pyramid, &orders, force).await? {
        AdmitOutcome::Denied => {
            connector.close().await;
            Ok(CreateOutcome::Denied)
        }
        AdmitOutcome::Granted => {
            let (accepted, failed) = submit_legs(ctx, connector.as_ref(), &symbol, &orders).await;
            connector.close().await;

            let status = if accepted == 0 {
                GroupStatus::Failed
            } else if failed > 0 {
                GroupStatus::PartiallyFilled
            } else {
                GroupStatus::Live
            };
            let updated = ctx
                .db
                .mutate_group(group.id, move |g, _| {
                    g.status = status;
                    if status == GroupStatus::Failed {
                        g.closed_at = Some(Utc::now());
                    }
                })
                .await?
                .unwrap_or(group);

            info!(
                group_id = %updated.id,
                symbol = %updated.symbol,
                accepted,
                failed,
                status = updated.status.as_str(),
                "position group created"
            );
            Ok(CreateOutcome::Created {
                group: updated,
                accepted_legs: accepted,
                failed_legs: failed,
            })
        }
    }
}

/// Appends a continuation pyramid at the incoming entry price. The pyramid
/// row is rolled back atomically when the venue rejects every leg.
pub async fn continue_pyramid(
    ctx: &EngineContext,
    user: &User,
    group: &PositionGroup,
    payload: &WebhookPayload,
) -> Result<ContinuationOutcome, PositionError> {
    if group.pyramid_count >= group.max_pyramids {
        return Err(PositionError::MaxPyramidsReached {
            max_pyramids: group.max_pyramids,
        });
    }
    let pyramid_index = group.pyramid_count;

    let dca = ctx
        .db
        .get_dca_config(user.id, &group.symbol, group.timeframe, &group.exchange)
        .await?
        .ok_or_else(|| PositionError::NoDcaConfig {
            pair: group.symbol.clone(),
            timeframe: group.timeframe,
            exchange: group.exchange.clone(),
        })?;
    let grid_cfg = dca.grid;

    let connector = ctx.connectors.connect(user, &group.exchange)?;
    let plan = plan_pyramid(
        ctx,
        connector.as_ref(),
        &group.exchange,
        &group.symbol,
        &grid_cfg,
        pyramid_index,
        payload.tv.entry_price,
    )
    .await?;

    let now = Utc::now();
    let pyramid = Pyramid {
        id: Uuid::new_v4(),
        group_id: group.id,
        pyramid_index,
        entry_price: payload.tv.entry_price,
        status: PyramidStatus::Pending,
        dca_config: grid_cfg.levels_for_pyramid(pyramid_index).to_vec(),
        closed_at: None,
        exit_price: None,
        realized_pnl_usd: None,
        total_quantity: None,
        created_at: now,
    };
    let orders = build_entry_orders(group.id, pyramid.id, &plan);

    ctx.db.append_pyramid(&pyramid, &orders).await?;
    let (accepted, failed) = submit_legs(ctx, connector.as_ref(), &group.symbol, &orders).await;
    connector.close().await;

    if accepted == 0 {
        warn!(
            group_id = %group.id,
            pyramid_index,
            "every continuation leg rejected, rolling pyramid back"
        );
        ctx.db.remove_pyramid(pyramid.id).await?;
        return Ok(ContinuationOutcome::RolledBack);
    }

    if user.risk_config.reset_timer_on_replacement {
        ctx.db
            .mutate_group(group.id, |g, _| {
                g.risk_timer_start = None;
                g.risk_timer_expires = None;
                g.risk_eligible = false;
            })
            .await?;
    }
    stats::recompute_group_stats(&ctx.db, group.id, None).await?;

    info!(
        group_id = %group.id,
        pyramid_index,
        accepted,
        failed,
        "continuation pyramid added"
    );
    Ok(ContinuationOutcome::Added {
        pyramid_id: pyramid.id,
        accepted_legs: accepted,
        failed_legs: failed,
    })
}

/// Plans one pyramid's legs against fresh precision rules.
async fn plan_pyramid(
    ctx: &EngineContext,
    connector: &dyn ExchangeConnector,
    exchange: &str,
    symbol: &str,
    grid_cfg: &DcaGridConfig,
    pyramid_index: u32,
    base_price: f64,
) -> Result<Vec<PlannedLeg>, PositionError> {
    let rules = ctx
        .precision
        .get_precision_for_symbol(connector, exchange, symbol)
        .await?;
    let levels = grid_cfg.levels_for_pyramid(pyramid_index);
    let capital = grid_cfg.capital_for_pyramid(pyramid_index);
    Ok(calculate_grid(
        base_price,
        OrderSide::Buy,
        levels,
        &rules,
        capital,
    )?)
}

fn build_entry_orders(group_id: Uuid, pyramid_id: Uuid, plan: &[PlannedLeg]) -> Vec<DcaOrder> {
    let now = Utc::now();
    plan.iter()
        .map(|leg| DcaOrder {
            id: Uuid::new_v4(),
            group_id,
            pyramid_id,
            leg_index: leg.leg_index,
            side: OrderSide::Buy,
            order_type: OrderType::Limit,
            price: leg.price,
            quantity: leg.quantity,
            quote_amount: Some(leg.notional_usd),
            status: OrderStatus::Pending,
            filled_quantity: 0.0,
            avg_fill_price: 0.0,
            fee: 0.0,
            fee_currency: None,
            tp_percent: Some(leg.tp_percent),
            tp_price: Some(leg.tp_price),
            tp_order_id: None,
            tp_hit: false,
            tp_executed_at: None,
            exchange_order_id: None,
            submitted_at: None,
            filled_at: None,
            cancelled_at: None,
            created_at: now,
        })
        .collect()
}

/// Submits each pending leg; accepted rows go OPEN, rejected rows FAILED.
/// Returns (accepted, failed).
async fn submit_legs(
    ctx: &EngineContext,
    connector: &dyn ExchangeConnector,
    symbol: &str,
    orders: &[DcaOrder],
) -> (usize, usize) {
    let mut accepted = 0;
    let mut failed = 0;
    for order in orders {
        let request = OrderRequest::limit(symbol, OrderSide::Buy, order.quantity, order.price);
        match connector.place_order(&request).await {
            Ok(ack) => {
                if let Err(e) = ctx
                    .db
                    .mark_order_submitted(order.id, &ack.order_id, Utc::now())
                    .await
                {
                    warn!(order_id = %order.id, error = %e, "failed to record submission");
                }
                accepted += 1;
            }
            Err(e) => {
                warn!(order_id = %order.id, leg = order.leg_index, error = %e, "leg rejected");
                if let Err(db_err) = ctx.db.mark_order_failed(order.id).await {
                    warn!(order_id = %order.id, error = %db_err, "failed to record rejection");
                }
                failed += 1;
            }
        }
    }
    (accepted, failed)
}
