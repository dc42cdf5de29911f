//! Exit handling: cancel resting entries and their TPs, market-sell the held
//! quantity, and drive the group to CLOSED through a synthetic exit row.

use anyhow::Result;
use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use super::{stats, tp, PositionError};
use crate::engine::EngineContext;
use crate::exchange::{ExchangeOrderStatus, OrderRequest};
use crate::grid::round_down_to_increment;
use crate::models::{
    DcaOrder, GroupStatus, OrderSide, OrderType, PositionGroup, RiskAction, RiskActionType,
    User, SYNTHETIC_EXIT_LEG,
};

const QTY_EPSILON: f64 = 1e-9;

/// Fully closes a group: entries cancelled, TPs torn down, held quantity
/// market-sold. `action_type`, when set, writes the audit row (manual and
/// engine closes; plain exit signals record nothing).
pub async fn execute_exit(
    ctx: &EngineContext,
    user: &User,
    group_id: Uuid,
    action_type: Option<RiskActionType>,
) -> Result<PositionGroup, PositionError> {
    let group = ctx
        .db
        .get_group(group_id)
        .await?
        .ok_or(PositionError::GroupNotFound { group_id })?;
    if group.status.is_terminal() {
        return Ok(group);
    }

    let connector = ctx.connectors.connect(user, &group.exchange)?;

    // Tear down resting entry legs and their venue-side TP orders.
    let orders = ctx.db.get_orders_for_group(group.id).await?;
    for order in orders
        .iter()
        .filter(|o| o.side == OrderSide::Buy && o.status.is_live_on_exchange())
    {
        if let Some(exchange_order_id) = order.exchange_order_id.as_deref() {
            if let Err(e) = connector.cancel_order(exchange_order_id, &group.symbol).await {
                warn!(order_id = %order.id, error = %e, "failed to cancel entry leg");
            }
        }
        ctx.db.mark_order_cancelled(order.id, Utc::now()).await?;
    }
    tp::cancel_all_group_tps(ctx, connector.as_ref(), group.id, None).await?;

    let current_price = connector.get_current_price(&group.symbol).await.ok();
    let refreshed = stats::recompute_group_stats(&ctx.db, group.id, current_price)
        .await?
        .unwrap_or(group);

    let rules = ctx
        .precision
        .get_precision_for_symbol(connector.as_ref(), &refreshed.exchange, &refreshed.symbol)
        .await?;
    let sell_quantity = round_down_to_increment(refreshed.total_filled_quantity, rules.step_size);

    let final_group = if sell_quantity > QTY_EPSILON {
        let prior_status = refreshed.status;
        ctx.db
            .mutate_group(refreshed.id, |g, _| {
                g.status = GroupStatus::Closing;
                g.closing_started_at = Some(Utc::now());
            })
            .await?;

        let request = OrderRequest::market(&refreshed.symbol, OrderSide::Sell, sell_quantity);
        let ack = match connector.place_order(&request).await {
            Ok(ack) => ack,
            Err(e) => {
                // Revert the provisional CLOSING so the risk engine does not
                // treat a never-submitted exit as stuck.
                ctx.db
                    .mutate_group(refreshed.id, move |g, _| {
                        g.status = prior_status;
                        g.closing_started_at = None;
                    })
                    .await?;
                connector.close().await;
                return Err(e.into());
            }
        };

        let mut fee = ack.fee;
        if fee <= 0.0 && ack.filled_quantity > 0.0 {
            let rate = connector.get_trading_fee_rate(Some(&refreshed.symbol)).await.unwrap_or(0.001);
            fee = ack.filled_quantity * ack.avg_fill_price * rate;
        }
        // Synthetic exits hang off the latest pyramid.
        let pyramids = ctx.db.list_pyramids(refreshed.id).await?;
        let pyramid_id = pyramids
            .last()
            .map(|p| p.id)
            .ok_or_else(|| PositionError::Internal(anyhow::anyhow!("group has no pyramids")))?;
        let synthetic =
            synthetic_exit_row(&refreshed, pyramid_id, &ack.order_id, sell_quantity, &ack, fee);
        ctx.db.insert_order(&synthetic).await?;

        stats::recompute_group_stats(&ctx.db, refreshed.id, current_price)
            .await?
            .unwrap_or(refreshed)
    } else {
        // Nothing held: the group closes on cancellation alone.
        ctx.db
            .mutate_group(refreshed.id, |g, _| {
                g.status = GroupStatus::Closed;
                g.closed_at = Some(Utc::now());
                g.closing_started_at = None;
            })
            .await?
            .unwrap_or(refreshed)
    };
    connector.close().await;

    if let Some(action_type) = action_type {
        let action = RiskAction {
            id: Uuid::new_v4(),
            action_type,
            loser_group_id: Some(final_group.id),
            winner_group_ids: Vec::new(),
            quantity: sell_quantity,
            price: current_price.unwrap_or(final_group.weighted_avg_entry),
            pnl_usd: final_group.realized_pnl_usd,
            duration_seconds: Some((Utc::now() - final_group.created_at).num_seconds()),
            details: None,
            created_at: Utc::now(),
        };
        ctx.db.insert_risk_action(&action).await?;
    }

    info!(
        group_id = %final_group.id,
        symbol = %final_group.symbol,
        status = final_group.status.as_str(),
        sold = sell_quantity,
        "exit executed"
    );
    Ok(final_group)
}

fn synthetic_exit_row(
    group: &PositionGroup,
    pyramid_id: Uuid,
    exchange_order_id: &str,
    requested_quantity: f64,
    ack: &crate::exchange::ExchangeOrder,
    fee: f64,
) -> DcaOrder {
    let now = Utc::now();
    let filled = ack.status == ExchangeOrderStatus::Filled
        || ack.status == ExchangeOrderStatus::PartiallyFilled;
    DcaOrder {
        id: Uuid::new_v4(),
        group_id: group.id,
        pyramid_id,
        leg_index: SYNTHETIC_EXIT_LEG,
        side: OrderSide::Sell,
        order_type: OrderType::Market,
        price: ack.avg_fill_price,
        quantity: requested_quantity,
        quote_amount: None,
        status: ack.status.to_order_status(),
        filled_quantity: ack.filled_quantity,
        avg_fill_price: ack.avg_fill_price,
        fee,
        fee_currency: ack.fee_currency.clone(),
        tp_percent: None,
        tp_price: None,
        tp_order_id: None,
        tp_hit: false,
        tp_executed_at: None,
        exchange_order_id: Some(exchange_order_id.to_string()),
        submitted_at: Some(now),
        filled_at: if filled { Some(now) } else { None },
        cancelled_at: None,
        created_at: now,
    }
}
