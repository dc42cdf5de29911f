//! Take-profit placement for filled entry legs.
//!
//! Four modes: per-leg limit sells, a single rolling aggregate target
//! (tracked on the group row), one rolling target per pyramid (tracked on
//! the latest filled leg), and hybrid (per-leg + aggregate, first to fire
//! wins). Placement failures are left for the fill monitor to retry; the
//! entry fill itself is never rolled back.

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::engine::EngineContext;
use crate::exchange::{ExchangeConnector, OrderRequest};
use crate::grid::{aggregate_tp_price, round_down_to_increment, round_half_up_to_increment};
use crate::models::{DcaOrder, OrderSide, OrderStatus, PositionGroup, TpMode, SYNTHETIC_EXIT_LEG};

const QTY_EPSILON: f64 = 1e-9;

/// Places whatever TP orders the group's mode calls for after `filled_order`
/// transitioned to FILLED. Stats must already be recomputed.
pub async fn place_tp_for_fill(
    ctx: &EngineContext,
    connector: &dyn ExchangeConnector,
    group: &PositionGroup,
    filled_order: &DcaOrder,
) -> Result<()> {
    if filled_order.side != OrderSide::Buy || filled_order.leg_index == SYNTHETIC_EXIT_LEG {
        return Ok(());
    }

    match group.tp_mode {
        TpMode::PerLeg => place_per_leg_tp(ctx, connector, group, filled_order).await,
        TpMode::Aggregate => place_aggregate_tp(ctx, connector, group.id).await,
        TpMode::PyramidAggregate => place_pyramid_tp(ctx, connector, group, filled_order).await,
        TpMode::Hybrid => {
            place_per_leg_tp(ctx, connector, group, filled_order).await?;
            place_aggregate_tp(ctx, connector, group.id).await
        }
    }
}

async fn place_per_leg_tp(
    ctx: &EngineContext,
    connector: &dyn ExchangeConnector,
    group: &PositionGroup,
    order: &DcaOrder,
) -> Result<()> {
    if order.tp_order_id.is_some() {
        return Ok(());
    }
    let rules = ctx
        .precision
        .get_precision_for_symbol(connector, &group.exchange, &group.symbol)
        .await?;

    let tp_price = match order.tp_price {
        Some(p) => p,
        None => {
            let pct = order.tp_percent.unwrap_or(group.tp_aggregate_percent);
            round_half_up_to_increment(order.avg_fill_price * (1.0 + pct / 100.0), rules.tick_size)
        }
    };
    let quantity = round_down_to_increment(order.filled_quantity, rules.step_size);
    if quantity <= QTY_EPSILON {
        return Ok(());
    }

    let ack = connector
        .place_order(&OrderRequest::limit(
            &group.symbol,
            OrderSide::Sell,
            quantity,
            tp_price,
        ))
        .await
        .context("place per-leg TP")?;
    ctx.db.set_order_tp_placed(order.id, &ack.order_id).await?;
    info!(
        group_id = %group.id,
        leg = order.leg_index,
        tp_price,
        quantity,
        "placed per-leg TP"
    );
    Ok(())
}

/// Cancels the group's previous aggregate TP (if any) and re-places one sell
/// for the whole filled quantity at the refreshed weighted-average target.
pub async fn place_aggregate_tp(
    ctx: &EngineContext,
    connector: &dyn ExchangeConnector,
    group_id: Uuid,
) -> Result<()> {
    let Some(group) = ctx.db.get_group(group_id).await? else {
        return Ok(());
    };

    if let Some(previous) = group.aggregate_tp_order_id.as_deref() {
        match connector.cancel_order(previous, &group.symbol).await {
            Ok(()) => {
                ctx.db.set_group_aggregate_tp(group.id, None).await?;
            }
            Err(e) => {
                // Keep tracking the old target; try again next iteration.
                warn!(group_id = %group.id, error = %e, "failed to cancel prior aggregate TP");
                return Ok(());
            }
        }
    }

    let rules = ctx
        .precision
        .get_precision_for_symbol(connector, &group.exchange, &group.symbol)
        .await?;
    let quantity = round_down_to_increment(group.total_filled_quantity, rules.step_size);
    if quantity <= QTY_EPSILON || group.weighted_avg_entry <= 0.0 {
        return Ok(());
    }
    let tp_price = aggregate_tp_price(group.weighted_avg_entry, group.tp_aggregate_percent, &rules);

    let ack = connector
        .place_order(&OrderRequest::limit(
            &group.symbol,
            OrderSide::Sell,
            quantity,
            tp_price,
        ))
        .await
        .context("place aggregate TP")?;
    ctx.db
        .set_group_aggregate_tp(group.id, Some(&ack.order_id))
        .await?;
    info!(group_id = %group.id, tp_price, quantity, "placed aggregate TP");
    Ok(())
}

/// One rolling TP per pyramid, carried by the latest filled leg and
/// re-targeted whenever another of its legs fills.
async fn place_pyramid_tp(
    ctx: &EngineContext,
    connector: &dyn ExchangeConnector,
    group: &PositionGroup,
    trigger: &DcaOrder,
) -> Result<()> {
    let legs = ctx.db.get_orders_for_pyramid(trigger.pyramid_id).await?;
    cancel_tracked_tps(
        ctx,
        connector,
        &group.symbol,
        legs.iter()
            .filter(|o| o.id != trigger.id && o.tp_order_id.is_some() && !o.tp_hit),
    )
    .await;

    let mut filled_qty = 0.0;
    let mut cost = 0.0;
    for leg in legs.iter().filter(|o| o.side == OrderSide::Buy) {
        if leg.filled_quantity > 0.0 {
            let price = if leg.avg_fill_price > 0.0 {
                leg.avg_fill_price
            } else {
                leg.price
            };
            filled_qty += leg.filled_quantity;
            cost += leg.filled_quantity * price;
        }
    }
    if filled_qty <= QTY_EPSILON {
        return Ok(());
    }
    let pyramid_avg = cost / filled_qty;

    let rules = ctx
        .precision
        .get_precision_for_symbol(connector, &group.exchange, &group.symbol)
        .await?;
    let quantity = round_down_to_increment(filled_qty, rules.step_size);
    if quantity <= QTY_EPSILON {
        return Ok(());
    }
    let tp_price = aggregate_tp_price(pyramid_avg, group.tp_aggregate_percent, &rules);

    let ack = connector
        .place_order(&OrderRequest::limit(
            &group.symbol,
            OrderSide::Sell,
            quantity,
            tp_price,
        ))
        .await
        .context("place pyramid TP")?;
    ctx.db.set_order_tp_placed(trigger.id, &ack.order_id).await?;
    info!(
        group_id = %group.id,
        pyramid_id = %trigger.pyramid_id,
        tp_price,
        quantity,
        "placed pyramid TP"
    );
    Ok(())
}

/// Cancels the venue orders and detaches them from their rows. Failures are
/// logged and left for the next monitor pass.
async fn cancel_tracked_tps<'a>(
    ctx: &EngineContext,
    connector: &dyn ExchangeConnector,
    symbol: &str,
    carriers: impl Iterator<Item = &'a DcaOrder>,
) {
    for order in carriers {
        let Some(tp_order_id) = order.tp_order_id.as_deref() else {
            continue;
        };
        match connector.cancel_order(tp_order_id, symbol).await {
            Ok(()) => {
                if let Err(e) = ctx.db.clear_order_tp(order.id).await {
                    warn!(order_id = %order.id, error = %e, "failed to detach cancelled TP");
                }
            }
            Err(e) => {
                warn!(tp_order_id, error = %e, "failed to cancel stale TP order");
            }
        }
    }
}

/// Cancels every live TP attached to a group, per-leg and aggregate alike
/// (exit teardown, hybrid first-wins). `except_tp_order_id` spares the one
/// that just executed.
pub async fn cancel_all_group_tps(
    ctx: &EngineContext,
    connector: &dyn ExchangeConnector,
    group_id: Uuid,
    except_tp_order_id: Option<&str>,
) -> Result<()> {
    let Some(group) = ctx.db.get_group(group_id).await? else {
        return Ok(());
    };

    let orders = ctx.db.get_orders_for_group(group.id).await?;
    for order in orders
        .iter()
        .filter(|o| o.tp_order_id.is_some() && !o.tp_hit && o.status == OrderStatus::Filled)
    {
        let tp_id = order.tp_order_id.as_deref().unwrap_or_default();
        if Some(tp_id) == except_tp_order_id {
            continue;
        }
        match connector.cancel_order(tp_id, &group.symbol).await {
            Ok(()) => ctx.db.clear_order_tp(order.id).await?,
            Err(e) => warn!(tp_order_id = tp_id, error = %e, "failed to cancel TP during teardown"),
        }
    }

    if let Some(aggregate_id) = group.aggregate_tp_order_id.as_deref() {
        if Some(aggregate_id) != except_tp_order_id {
            match connector.cancel_order(aggregate_id, &group.symbol).await {
                Ok(()) => ctx.db.set_group_aggregate_tp(group.id, None).await?,
                Err(e) => {
                    warn!(tp_order_id = aggregate_id, error = %e, "failed to cancel aggregate TP")
                }
            }
        } else {
            ctx.db.set_group_aggregate_tp(group.id, None).await?;
        }
    }
    Ok(())
}

/// Records a pyramid-level TP execution: the whole pyramid closes and its
/// realized PnL is pinned on the pyramid row.
pub async fn settle_pyramid_tp(
    ctx: &EngineContext,
    group: &PositionGroup,
    pyramid_id: Uuid,
    exit_price: f64,
    exit_quantity: f64,
) -> Result<()> {
    let legs = ctx.db.get_orders_for_pyramid(pyramid_id).await?;
    let mut cost = 0.0;
    let mut qty = 0.0;
    for leg in legs.iter().filter(|o| o.side == OrderSide::Buy) {
        if leg.filled_quantity > 0.0 {
            let price = if leg.avg_fill_price > 0.0 {
                leg.avg_fill_price
            } else {
                leg.price
            };
            qty += leg.filled_quantity;
            cost += leg.filled_quantity * price;
        }
    }
    let avg = if qty > QTY_EPSILON { cost / qty } else { 0.0 };
    let realized = (exit_price - avg) * exit_quantity;
    ctx.db
        .close_pyramid(pyramid_id, Utc::now(), exit_price, realized, exit_quantity)
        .await?;
    info!(group_id = %group.id, %pyramid_id, exit_price, realized, "pyramid TP settled");
    Ok(())
}
