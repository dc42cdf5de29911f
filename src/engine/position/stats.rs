//! Group stat recomputation.
//!
//! Everything on a `PositionGroup` row is derivable from its order rows plus
//! the latest ticker; `recompute` is the single pure function that does it,
//! and `recompute_group_stats` applies it under the store's group lock.

use anyhow::Result;
use chrono::Utc;
use uuid::Uuid;

use crate::models::{
    DcaOrder, GroupStatus, OrderSide, OrderStatus, PositionGroup, SYNTHETIC_EXIT_LEG,
};
use crate::store::EngineDb;

const QTY_EPSILON: f64 = 1e-9;

/// Recomputes every derived aggregate and advances the status machine.
/// `current_price` refreshes the unrealized PnL when available.
pub fn recompute(group: &mut PositionGroup, orders: &[DcaOrder], current_price: Option<f64>) {
    let mut bought_qty = 0.0;
    let mut bought_cost = 0.0;
    let mut entry_fees = 0.0;
    let mut sold_qty = 0.0;
    let mut sold_proceeds = 0.0;
    let mut exit_fees = 0.0;
    let mut filled_entry_legs = 0u32;
    let mut entry_legs_total = 0u32;
    let mut entry_legs_settled = 0u32;

    for order in orders {
        match order.side {
            OrderSide::Buy => {
                if order.leg_index != SYNTHETIC_EXIT_LEG {
                    entry_legs_total += 1;
                    match order.status {
                        OrderStatus::Filled => {
                            filled_entry_legs += 1;
                            entry_legs_settled += 1;
                        }
                        OrderStatus::Cancelled | OrderStatus::Failed => entry_legs_settled += 1,
                        _ => {}
                    }
                }
                if order.filled_quantity > 0.0 {
                    let fill_price = if order.avg_fill_price > 0.0 {
                        order.avg_fill_price
                    } else {
                        order.price
                    };
                    bought_qty += order.filled_quantity;
                    bought_cost += order.filled_quantity * fill_price;
                    entry_fees += order.fee;
                }
            }
            OrderSide::Sell => {
                if order.filled_quantity > 0.0 {
                    let fill_price = if order.avg_fill_price > 0.0 {
                        order.avg_fill_price
                    } else {
                        order.price
                    };
                    sold_qty += order.filled_quantity;
                    sold_proceeds += order.filled_quantity * fill_price;
                    exit_fees += order.fee;
                }
            }
        }
    }

    let weighted_avg_entry = if bought_qty > QTY_EPSILON {
        bought_cost / bought_qty
    } else {
        0.0
    };
    let net_qty = (bought_qty - sold_qty).max(0.0);

    group.filled_dca_legs = filled_entry_legs;
    group.weighted_avg_entry = weighted_avg_entry;
    group.total_invested_usd = bought_cost;
    group.total_filled_quantity = net_qty;
    group.total_entry_fees_usd = entry_fees;
    group.total_exit_fees_usd = exit_fees;
    group.realized_pnl_usd = sold_proceeds - sold_qty * weighted_avg_entry - exit_fees;

    if let Some(price) = current_price {
        if net_qty > QTY_EPSILON && weighted_avg_entry > 0.0 {
            group.unrealized_pnl_usd = (price - weighted_avg_entry) * net_qty;
            group.unrealized_pnl_percent = (price / weighted_avg_entry - 1.0) * 100.0;
        } else {
            group.unrealized_pnl_usd = 0.0;
            group.unrealized_pnl_percent = 0.0;
        }
    } else if net_qty <= QTY_EPSILON {
        group.unrealized_pnl_usd = 0.0;
        group.unrealized_pnl_percent = 0.0;
    }

    // Status machine. A group only closes once something was actually sold
    // back to zero; a waiting group with no fills has zero quantity too.
    if sold_qty > QTY_EPSILON && net_qty <= QTY_EPSILON && !group.status.is_terminal() {
        group.status = GroupStatus::Closed;
        group.closed_at = Some(Utc::now());
        group.closing_started_at = None;
    } else {
        match group.status {
            GroupStatus::Waiting | GroupStatus::Live if filled_entry_legs > 0 => {
                group.status = GroupStatus::PartiallyFilled;
            }
            _ => {}
        }
        if matches!(
            group.status,
            GroupStatus::PartiallyFilled | GroupStatus::Waiting | GroupStatus::Live
        ) && entry_legs_total > 0
            && entry_legs_settled == entry_legs_total
            && filled_entry_legs > 0
        {
            group.status = GroupStatus::Active;
        }
    }
}

/// Reloads, recomputes, and persists a group's aggregates in one locked
/// transaction. Returns the updated group.
pub async fn recompute_group_stats(
    db: &EngineDb,
    group_id: Uuid,
    current_price: Option<f64>,
) -> Result<Option<PositionGroup>> {
    db.mutate_group(group_id, move |group, orders| {
        recompute(group, orders, current_price);
    })
    .await
}
