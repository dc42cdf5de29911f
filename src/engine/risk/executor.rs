//! Offset execution: sizing the loser close and the per-winner realizations,
//! then driving the market sells and audit rows.

use anyhow::Result;
use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::engine::position::stats;
use crate::engine::EngineContext;
use crate::exchange::{ExchangeConnector, ExchangeOrderStatus, OrderRequest};
use crate::grid::round_down_to_increment;
use crate::models::{
    DcaOrder, GroupStatus, OrderSide, OrderType, PositionGroup, RiskAction, RiskActionType,
    RiskEngineConfig, SYNTHETIC_EXIT_LEG,
};
use crate::precision::PrecisionRules;

const QTY_EPSILON: f64 = 1e-9;

fn round_up_to_increment(value: f64, increment: f64) -> f64 {
    if increment <= 0.0 {
        return value;
    }
    ((value / increment) * (1.0 - 1e-9)).ceil() * increment
}

#[derive(Debug, Clone)]
pub struct WinnerClose {
    pub group: PositionGroup,
    pub quantity: f64,
    pub expected_profit_usd: f64,
}

#[derive(Debug, Clone)]
pub struct OffsetPlan {
    pub loser_close_quantity: f64,
    pub full_close: bool,
    pub winner_closes: Vec<WinnerClose>,
    /// The loss the winners are asked to absorb.
    pub needed_usd: f64,
}

/// Sizes the offset. Winners realize profit proportional to their share of
/// the combined unrealized profit; every order is step-rounded and bumped up
/// to `min_close_notional` (capped by the available quantity).
pub fn build_offset_plan(
    loser: &PositionGroup,
    loser_price: f64,
    loser_rules: &PrecisionRules,
    winners: &[(PositionGroup, f64, PrecisionRules)],
    config: &RiskEngineConfig,
) -> Option<OffsetPlan> {
    if loser.total_filled_quantity <= QTY_EPSILON || loser_price <= 0.0 {
        return None;
    }
    let needed = -loser.unrealized_pnl_usd;
    if needed <= 0.0 {
        return None;
    }
    let combined: f64 = winners.iter().map(|(w, _, _)| w.unrealized_pnl_usd).sum();
    if combined <= 0.0 {
        return None;
    }

    let full_close = combined + QTY_EPSILON >= needed;
    if !full_close && !config.partial_close_enabled {
        return None;
    }

    let loser_close_quantity = if full_close {
        round_down_to_increment(loser.total_filled_quantity, loser_rules.step_size)
    } else {
        let fraction = (combined / needed).clamp(0.0, 1.0);
        let mut qty =
            round_down_to_increment(loser.total_filled_quantity * fraction, loser_rules.step_size);
        if qty * loser_price < config.min_close_notional {
            qty = round_up_to_increment(config.min_close_notional / loser_price, loser_rules.step_size);
        }
        qty.min(loser.total_filled_quantity)
    };
    if loser_close_quantity <= QTY_EPSILON {
        return None;
    }

    // Uniform realization fraction: each winner closes needed/combined of its
    // position, so realized amounts stay proportional to the profit shares.
    let realize_fraction = (needed / combined).min(1.0);
    let mut winner_closes = Vec::with_capacity(winners.len());
    for (winner, price, rules) in winners {
        if *price <= 0.0 || winner.total_filled_quantity <= QTY_EPSILON {
            continue;
        }
        let mut qty = round_down_to_increment(
            winner.total_filled_quantity * realize_fraction,
            rules.step_size,
        );
        if qty * price < config.min_close_notional {
            qty = round_up_to_increment(config.min_close_notional / price, rules.step_size);
        }
        let qty = qty.min(winner.total_filled_quantity);
        if qty <= QTY_EPSILON {
            continue;
        }
        let fraction_of_position = qty / winner.total_filled_quantity;
        winner_closes.push(WinnerClose {
            group: winner.clone(),
            quantity: qty,
            expected_profit_usd: winner.unrealized_pnl_usd * fraction_of_position,
        });
    }
    if winner_closes.is_empty() {
        return None;
    }

    Some(OffsetPlan {
        loser_close_quantity,
        full_close,
        winner_closes,
        needed_usd: needed,
    })
}

/// Drives the plan: loser first, then each winner independently. A loser-side
/// failure reverts the provisional CLOSING and records a hedge_failed action;
/// a winner-side failure is recorded and skipped.
pub async fn execute_offset(
    ctx: &EngineContext,
    connector: &dyn ExchangeConnector,
    loser: &PositionGroup,
    loser_price: f64,
    plan: &OffsetPlan,
) -> Result<()> {
    let winner_ids: Vec<Uuid> = plan.winner_closes.iter().map(|w| w.group.id).collect();

    // Loser leg. CLOSING is provisional until the sell is accepted.
    if plan.full_close {
        ctx.db
            .mutate_group(loser.id, |g, _| {
                g.status = GroupStatus::Closing;
                g.closing_started_at = Some(Utc::now());
            })
            .await?;
    }
    let loser_request = OrderRequest::market(&loser.symbol, OrderSide::Sell, plan.loser_close_quantity);
    let loser_ack = match connector.place_order(&loser_request).await {
        Ok(ack) => ack,
        Err(e) => {
            if plan.full_close {
                ctx.db
                    .mutate_group(loser.id, |g, _| {
                        g.status = GroupStatus::Active;
                        g.closing_started_at = None;
                    })
                    .await?;
            }
            record_failure(ctx, loser.id, &winner_ids, &e.to_string()).await;
            return Err(e.into());
        }
    };

    record_synthetic_exit(ctx, loser, &loser_ack.order_id, plan.loser_close_quantity, loser_ack.avg_fill_price, loser_ack.filled_quantity, loser_ack.fee).await?;
    stats::recompute_group_stats(&ctx.db, loser.id, Some(loser_price)).await?;

    let loser_action = RiskAction {
        id: Uuid::new_v4(),
        action_type: if plan.full_close {
            RiskActionType::FullClose
        } else {
            RiskActionType::PartialClose
        },
        loser_group_id: Some(loser.id),
        winner_group_ids: winner_ids.clone(),
        quantity: plan.loser_close_quantity,
        price: loser_ack.avg_fill_price,
        pnl_usd: loser.unrealized_pnl_usd,
        duration_seconds: Some((Utc::now() - loser.created_at).num_seconds()),
        details: Some(format!(
            "offset close, {:.2} USD loss absorbed by {} winner(s)",
            plan.needed_usd,
            plan.winner_closes.len()
        )),
        created_at: Utc::now(),
    };
    ctx.db.insert_risk_action(&loser_action).await?;

    info!(
        loser_id = %loser.id,
        qty = plan.loser_close_quantity,
        full_close = plan.full_close,
        "loser offset executed"
    );

    // Winner legs: independent; one failure never blocks the rest.
    for close in &plan.winner_closes {
        let winner = &close.group;
        let request = OrderRequest::market(&winner.symbol, OrderSide::Sell, close.quantity);
        let ack = match connector.place_order(&request).await {
            Ok(ack) => ack,
            Err(e) => {
                warn!(winner_id = %winner.id, error = %e, "winner close failed");
                record_failure(ctx, loser.id, &[winner.id], &e.to_string()).await;
                continue;
            }
        };

        record_synthetic_exit(ctx, winner, &ack.order_id, close.quantity, ack.avg_fill_price, ack.filled_quantity, ack.fee).await?;
        let hedged_qty = ack.filled_quantity.max(close.quantity);
        let hedged_value = hedged_qty * ack.avg_fill_price;
        ctx.db
            .mutate_group(winner.id, move |g, _| {
                g.total_hedged_qty += hedged_qty;
                g.total_hedged_value_usd += hedged_value;
            })
            .await?;
        stats::recompute_group_stats(&ctx.db, winner.id, None).await?;

        let action = RiskAction {
            id: Uuid::new_v4(),
            action_type: RiskActionType::HedgeClose,
            loser_group_id: Some(loser.id),
            winner_group_ids: vec![winner.id],
            quantity: close.quantity,
            price: ack.avg_fill_price,
            pnl_usd: close.expected_profit_usd,
            duration_seconds: Some((Utc::now() - winner.created_at).num_seconds()),
            details: None,
            created_at: Utc::now(),
        };
        ctx.db.insert_risk_action(&action).await?;
        info!(
            winner_id = %winner.id,
            qty = close.quantity,
            realized = close.expected_profit_usd,
            "winner hedge close executed"
        );
    }

    Ok(())
}

async fn record_synthetic_exit(
    ctx: &EngineContext,
    group: &PositionGroup,
    exchange_order_id: &str,
    requested_qty: f64,
    fill_price: f64,
    filled_qty: f64,
    fee: f64,
) -> Result<()> {
    let pyramids = ctx.db.list_pyramids(group.id).await?;
    let Some(pyramid_id) = pyramids.last().map(|p| p.id) else {
        anyhow::bail!("group {} has no pyramids", group.id);
    };
    let now = Utc::now();
    let filled = filled_qty > QTY_EPSILON;
    let order = DcaOrder {
        id: Uuid::new_v4(),
        group_id: group.id,
        pyramid_id,
        leg_index: SYNTHETIC_EXIT_LEG,
        side: OrderSide::Sell,
        order_type: OrderType::Market,
        price: fill_price,
        quantity: requested_qty,
        quote_amount: None,
        status: if filled {
            ExchangeOrderStatus::Filled.to_order_status()
        } else {
            ExchangeOrderStatus::New.to_order_status()
        },
        filled_quantity: filled_qty,
        avg_fill_price: fill_price,
        fee,
        fee_currency: None,
        tp_percent: None,
        tp_price: None,
        tp_order_id: None,
        tp_hit: false,
        tp_executed_at: None,
        exchange_order_id: Some(exchange_order_id.to_string()),
        submitted_at: Some(now),
        filled_at: filled.then_some(now),
        cancelled_at: None,
        created_at: now,
    };
    ctx.db.insert_order(&order).await
}

async fn record_failure(ctx: &EngineContext, loser_id: Uuid, winner_ids: &[Uuid], error: &str) {
    let action = RiskAction {
        id: Uuid::new_v4(),
        action_type: RiskActionType::HedgeFailed,
        loser_group_id: Some(loser_id),
        winner_group_ids: winner_ids.to_vec(),
        quantity: 0.0,
        price: 0.0,
        pnl_usd: 0.0,
        duration_seconds: None,
        details: Some(error.to_string()),
        created_at: Utc::now(),
    };
    if let Err(e) = ctx.db.insert_risk_action(&action).await {
        warn!(error = %e, "failed to record hedge failure");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{OrderSide, TpMode};

    fn rules() -> PrecisionRules {
        PrecisionRules {
            tick_size: 0.01,
            step_size: 0.001,
            min_qty: 0.001,
            min_notional: 10.0,
        }
    }

    fn group(qty: f64, pnl_usd: f64, pnl_pct: f64) -> PositionGroup {
        let now = Utc::now();
        PositionGroup {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            exchange: "binance".to_string(),
            symbol: "BTCUSDT".to_string(),
            timeframe: 60,
            side: OrderSide::Buy,
            status: GroupStatus::Active,
            pyramid_count: 5,
            max_pyramids: 5,
            total_dca_legs: 4,
            filled_dca_legs: 4,
            base_entry_price: 50_000.0,
            weighted_avg_entry: 50_000.0,
            total_invested_usd: qty * 50_000.0,
            total_filled_quantity: qty,
            unrealized_pnl_usd: pnl_usd,
            unrealized_pnl_percent: pnl_pct,
            realized_pnl_usd: 0.0,
            total_entry_fees_usd: 0.0,
            total_exit_fees_usd: 0.0,
            total_hedged_qty: 0.0,
            total_hedged_value_usd: 0.0,
            tp_mode: TpMode::PerLeg,
            tp_aggregate_percent: 0.0,
            aggregate_tp_order_id: None,
            risk_timer_start: None,
            risk_timer_expires: None,
            risk_eligible: true,
            risk_blocked: false,
            risk_skip_once: false,
            created_at: now,
            updated_at: now,
            closing_started_at: None,
            closed_at: None,
        }
    }

    fn config() -> RiskEngineConfig {
        RiskEngineConfig {
            partial_close_enabled: true,
            min_close_notional: 10.0,
            ..Default::default()
        }
    }

    #[test]
    fn test_full_close_when_winners_cover_loss() {
        // Scenario: loser down 50 USD, winners +30/+15/+10 (sum 55 >= 50).
        let loser = group(0.02, -50.0, -5.0);
        let winners = vec![
            (group(0.02, 30.0, 3.0), 51_500.0, rules()),
            (group(0.02, 15.0, 1.5), 50_750.0, rules()),
            (group(0.02, 10.0, 1.0), 50_500.0, rules()),
        ];
        let plan = build_offset_plan(&loser, 47_500.0, &rules(), &winners, &config()).unwrap();

        assert!(plan.full_close);
        assert!((plan.loser_close_quantity - 0.02).abs() < 1e-12);
        assert_eq!(plan.winner_closes.len(), 3);

        // Realized amounts stay proportional to (30, 15, 10) / 55.
        let fraction = 50.0 / 55.0;
        for (close, profit) in plan.winner_closes.iter().zip([30.0, 15.0, 10.0]) {
            let expected = profit * fraction;
            assert!(
                (close.expected_profit_usd - expected).abs() < expected * 0.15,
                "expected ~{expected}, got {}",
                close.expected_profit_usd
            );
        }
    }

    #[test]
    fn test_partial_close_when_winners_cover_fraction() {
        let loser = group(0.02, -100.0, -10.0);
        let winners = vec![(group(0.02, 40.0, 4.0), 52_000.0, rules())];
        let plan = build_offset_plan(&loser, 45_000.0, &rules(), &winners, &config()).unwrap();

        assert!(!plan.full_close);
        // 40/100 of the loser's quantity, step-rounded.
        assert!((plan.loser_close_quantity - 0.008).abs() < 1e-12);
    }

    #[test]
    fn test_partial_close_disabled_skips() {
        let loser = group(0.02, -100.0, -10.0);
        let winners = vec![(group(0.02, 40.0, 4.0), 52_000.0, rules())];
        let mut cfg = config();
        cfg.partial_close_enabled = false;
        assert!(build_offset_plan(&loser, 45_000.0, &rules(), &winners, &cfg).is_none());
    }

    #[test]
    fn test_min_notional_bumps_close_quantity() {
        // Winner close would be ~0.0001 BTC (~5 USD) — below the 10 USD floor.
        let loser = group(0.001, -1.0, -2.0);
        let winners = vec![(group(0.01, 500.0, 10.0), 50_000.0, rules())];
        let plan = build_offset_plan(&loser, 49_000.0, &rules(), &winners, &config()).unwrap();
        let close = &plan.winner_closes[0];
        assert!(close.quantity * 50_000.0 >= 10.0 - 1e-6);
        assert!(close.quantity <= 0.01 + 1e-12);
    }

    #[test]
    fn test_no_plan_without_winner_profit() {
        let loser = group(0.02, -50.0, -5.0);
        let winners = vec![(group(0.02, -5.0, -0.5), 49_000.0, rules())];
        assert!(build_offset_plan(&loser, 47_500.0, &rules(), &winners, &config()).is_none());
    }

    #[test]
    fn test_round_up_to_increment() {
        assert!((round_up_to_increment(0.00021, 0.001) - 0.001).abs() < 1e-12);
        assert!((round_up_to_increment(0.001, 0.001) - 0.001).abs() < 1e-12);
    }
}
