//! DCA grid calculator.
//!
//! Pure price/quantity math for a ladder of entry legs: entry prices from
//! percentage gaps, per-leg take-profit prices, and capital-weighted
//! quantities, all rounded to the exchange's precision rules. Deterministic;
//! equal inputs produce identical plans.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{DcaLevel, OrderSide};
use crate::precision::PrecisionRules;

/// Relative guard against f64 division artifacts when snapping to increments.
const ROUND_EPSILON: f64 = 1e-9;

#[derive(Debug, Error, PartialEq)]
pub enum PlanError {
    /// The whole plan is rejected; no partial grids are ever emitted.
    #[error("invalid plan: {reason}")]
    PlanInvalid { reason: String },
}

/// One planned entry leg.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedLeg {
    pub leg_index: u32,
    pub price: f64,
    pub quantity: f64,
    /// Effective notional after rounding: `price * quantity`.
    pub notional_usd: f64,
    pub tp_percent: f64,
    pub tp_price: f64,
}

/// Rounds `value` down to a multiple of `increment`. The relative epsilon
/// keeps exact multiples from slipping a whole increment on f64 noise.
pub fn round_down_to_increment(value: f64, increment: f64) -> f64 {
    if increment <= 0.0 {
        return value;
    }
    ((value / increment) * (1.0 + ROUND_EPSILON)).floor() * increment
}

/// Rounds `value` to a multiple of `increment`, half away from zero.
pub fn round_half_up_to_increment(value: f64, increment: f64) -> f64 {
    if increment <= 0.0 {
        return value;
    }
    ((value / increment) * (1.0 + ROUND_EPSILON) + 0.5).floor() * increment
}

/// Computes the full entry grid for one pyramid.
///
/// For longs, entry prices round DOWN to the tick (buy conservatively) and
/// quantities round DOWN to the step; TP prices round half-up. Any leg that
/// violates `min_qty` or `min_notional` rejects the entire plan.
pub fn calculate_grid(
    base_price: f64,
    side: OrderSide,
    levels: &[DcaLevel],
    rules: &PrecisionRules,
    total_capital_usd: f64,
) -> Result<Vec<PlannedLeg>, PlanError> {
    if side != OrderSide::Buy {
        return Err(PlanError::PlanInvalid {
            reason: "only long (buy) grids are supported".to_string(),
        });
    }
    if !(base_price.is_finite() && base_price > 0.0) {
        return Err(PlanError::PlanInvalid {
            reason: format!("base price must be positive, got {base_price}"),
        });
    }
    if !(total_capital_usd.is_finite() && total_capital_usd > 0.0) {
        return Err(PlanError::PlanInvalid {
            reason: format!("capital must be positive, got {total_capital_usd}"),
        });
    }
    if levels.is_empty() {
        return Err(PlanError::PlanInvalid {
            reason: "no DCA levels configured".to_string(),
        });
    }

    let mut legs = Vec::with_capacity(levels.len());
    for (i, level) in levels.iter().enumerate() {
        let raw_price = base_price * (1.0 + level.gap_percent / 100.0);
        let price = round_down_to_increment(raw_price, rules.tick_size);
        if price <= 0.0 {
            return Err(PlanError::PlanInvalid {
                reason: format!("leg {i}: price {raw_price} rounds to zero"),
            });
        }

        let target_notional = total_capital_usd * level.weight_percent / 100.0;
        let quantity = round_down_to_increment(target_notional / price, rules.step_size);
        let notional_usd = quantity * price;

        if quantity < rules.min_qty - ROUND_EPSILON {
            return Err(PlanError::PlanInvalid {
                reason: format!(
                    "leg {i}: quantity {quantity} below min_qty {}",
                    rules.min_qty
                ),
            });
        }
        if notional_usd < rules.min_notional - ROUND_EPSILON {
            return Err(PlanError::PlanInvalid {
                reason: format!(
                    "leg {i}: notional {notional_usd:.8} below min_notional {}",
                    rules.min_notional
                ),
            });
        }

        let raw_tp = price * (1.0 + level.tp_percent / 100.0);
        let tp_price = round_half_up_to_increment(raw_tp, rules.tick_size);

        legs.push(PlannedLeg {
            leg_index: i as u32,
            price,
            quantity,
            notional_usd,
            tp_percent: level.tp_percent,
            tp_price,
        });
    }

    Ok(legs)
}

/// TP price for an aggregate exit over the weighted average entry.
pub fn aggregate_tp_price(
    weighted_avg_entry: f64,
    tp_aggregate_percent: f64,
    rules: &PrecisionRules,
) -> f64 {
    round_half_up_to_increment(
        weighted_avg_entry * (1.0 + tp_aggregate_percent / 100.0),
        rules.tick_size,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DcaLevel;

    fn rules() -> PrecisionRules {
        PrecisionRules {
            tick_size: 0.01,
            step_size: 0.001,
            min_qty: 0.001,
            min_notional: 10.0,
        }
    }

    fn level(gap: f64, weight: f64, tp: f64) -> DcaLevel {
        DcaLevel {
            gap_percent: gap,
            weight_percent: weight,
            tp_percent: tp,
        }
    }

    #[test]
    fn test_four_leg_reference_grid() {
        let levels = [
            level(0.0, 20.0, 1.0),
            level(-0.5, 20.0, 0.5),
            level(-1.0, 20.0, 0.5),
            level(-2.0, 40.0, 0.5),
        ];
        let legs = calculate_grid(50_000.0, OrderSide::Buy, &levels, &rules(), 1_000.0).unwrap();

        let prices: Vec<f64> = legs.iter().map(|l| l.price).collect();
        for (got, want) in prices.iter().zip([50_000.00, 49_750.00, 49_500.00, 49_000.00]) {
            assert!((got - want).abs() < 1e-6, "price {got} != {want}");
        }

        let qtys: Vec<f64> = legs.iter().map(|l| l.quantity).collect();
        for (got, want) in qtys.iter().zip([0.004, 0.004, 0.004, 0.008]) {
            assert!((got - want).abs() < 1e-12, "qty {got} != {want}");
        }

        let tps: Vec<f64> = legs.iter().map(|l| l.tp_price).collect();
        for (got, want) in tps.iter().zip([50_500.00, 49_998.75, 49_747.50, 49_245.00]) {
            assert!((got - want).abs() < 1e-6, "tp {got} != {want}");
        }
    }

    #[test]
    fn test_min_notional_rejects_whole_plan() {
        let levels = [level(0.0, 99.0, 1.0), level(-1.0, 1.0, 1.0)];
        // Second leg gets 1% of 500 = $5, below min_notional of $10.
        let err = calculate_grid(100.0, OrderSide::Buy, &levels, &rules(), 500.0).unwrap_err();
        match err {
            PlanError::PlanInvalid { reason } => assert!(reason.contains("min_notional")),
        }
    }

    #[test]
    fn test_min_qty_rejects_whole_plan() {
        let r = PrecisionRules {
            tick_size: 0.01,
            step_size: 0.001,
            min_qty: 0.5,
            min_notional: 1.0,
        };
        let levels = [level(0.0, 100.0, 1.0)];
        let err = calculate_grid(1_000.0, OrderSide::Buy, &levels, &r, 100.0).unwrap_err();
        match err {
            PlanError::PlanInvalid { reason } => assert!(reason.contains("min_qty")),
        }
    }

    #[test]
    fn test_short_side_rejected() {
        let levels = [level(0.0, 100.0, 1.0)];
        assert!(calculate_grid(100.0, OrderSide::Sell, &levels, &rules(), 100.0).is_err());
    }

    #[test]
    fn test_determinism() {
        let levels = [
            level(0.0, 30.0, 1.2),
            level(-0.7, 30.0, 0.9),
            level(-1.9, 40.0, 0.4),
        ];
        let a = calculate_grid(23_456.78, OrderSide::Buy, &levels, &rules(), 5_000.0).unwrap();
        let b = calculate_grid(23_456.78, OrderSide::Buy, &levels, &rules(), 5_000.0).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_notional_roundtrip_within_one_step() {
        let levels = [level(0.0, 50.0, 1.0), level(-1.0, 50.0, 1.0)];
        let capital = 1_000.0;
        let legs = calculate_grid(43_219.87, OrderSide::Buy, &levels, &rules(), capital).unwrap();
        for leg in &legs {
            let target = capital * 0.5;
            assert!((target - leg.notional_usd).abs() <= rules().step_size * leg.price + 1e-9);
        }
    }

    #[test]
    fn test_rounding_helpers() {
        assert!((round_down_to_increment(0.0040404, 0.001) - 0.004).abs() < 1e-9);
        assert!((round_down_to_increment(49_750.0, 0.01) - 49_750.0).abs() < 1e-6);
        assert!((round_half_up_to_increment(49_998.745, 0.01) - 49_998.75).abs() < 1e-6);
        // A value that is an exact multiple must not creep upward.
        assert!((round_half_up_to_increment(50_500.0, 0.01) - 50_500.0).abs() < 1e-6);
    }

    #[test]
    fn test_aggregate_tp_price() {
        let tp = aggregate_tp_price(49_583.33, 1.0, &rules());
        assert!((tp - 50_079.16).abs() < 1e-6);
    }
}
