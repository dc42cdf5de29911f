//! Loser and winner selection. Pure functions over in-memory group
//! snapshots; the service recomputes stats before calling in.

use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use super::timer::pyramids_requirement_met;
use crate::models::{GroupStatus, PositionGroup, RiskEngineConfig};

/// Losers that may be offset this cycle: eligible, timer expired, loss at or
/// beyond the threshold, pyramid requirement satisfied.
pub fn filter_eligible_losers<'a>(
    groups: &'a [PositionGroup],
    config: &RiskEngineConfig,
    now: DateTime<Utc>,
    skipped: &HashSet<Uuid>,
) -> Vec<&'a PositionGroup> {
    groups
        .iter()
        .filter(|g| {
            !g.status.is_terminal()
                && g.status != GroupStatus::Closing
                && !g.risk_blocked
                && !skipped.contains(&g.id)
                && g.risk_eligible
                && g.risk_timer_expires.map(|t| t <= now).unwrap_or(false)
                && g.unrealized_pnl_percent <= config.loss_threshold_percent
                && pyramids_requirement_met(g, config)
        })
        .collect()
}

/// The deepest-loss eligible loser.
pub fn select_deepest_loser<'a>(losers: &[&'a PositionGroup]) -> Option<&'a PositionGroup> {
    losers
        .iter()
        .copied()
        .min_by(|a, b| {
            a.unrealized_pnl_percent
                .partial_cmp(&b.unrealized_pnl_percent)
                .unwrap_or(std::cmp::Ordering::Equal)
        })
}

/// Profitable groups to realize against the loser, best first, capped at
/// `max_winners_to_combine`; optionally restricted to aged positions.
pub fn select_winners(
    groups: &[PositionGroup],
    loser_id: Uuid,
    config: &RiskEngineConfig,
    now: DateTime<Utc>,
) -> Vec<PositionGroup> {
    let mut winners: Vec<PositionGroup> = groups
        .iter()
        .filter(|g| {
            g.id != loser_id
                && !g.status.is_terminal()
                && g.status != GroupStatus::Closing
                && !g.risk_blocked
                && g.unrealized_pnl_usd > 0.0
                && g.total_filled_quantity > 0.0
                && (!config.use_trade_age_filter
                    || now - g.created_at >= Duration::minutes(config.age_threshold_minutes))
        })
        .cloned()
        .collect();
    winners.sort_by(|a, b| {
        b.unrealized_pnl_usd
            .partial_cmp(&a.unrealized_pnl_usd)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    winners.truncate(config.max_winners_to_combine);
    winners
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{OrderSide, TpMode};

    fn group(pnl_pct: f64, pnl_usd: f64, status: GroupStatus) -> PositionGroup {
        let now = Utc::now();
        PositionGroup {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            exchange: "binance".to_string(),
            symbol: "BTCUSDT".to_string(),
            timeframe: 60,
            side: OrderSide::Buy,
            status,
            pyramid_count: 5,
            max_pyramids: 5,
            total_dca_legs: 4,
            filled_dca_legs: 4,
            base_entry_price: 100.0,
            weighted_avg_entry: 100.0,
            total_invested_usd: 1000.0,
            total_filled_quantity: 10.0,
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
            risk_timer_start: Some(now - Duration::minutes(120)),
            risk_timer_expires: Some(now - Duration::minutes(60)),
            risk_eligible: true,
            risk_blocked: false,
            risk_skip_once: false,
            created_at: now - Duration::hours(5),
            updated_at: now,
            closing_started_at: None,
            closed_at: None,
        }
    }

    fn config() -> RiskEngineConfig {
        RiskEngineConfig {
            loss_threshold_percent: -5.0,
            ..Default::default()
        }
    }

    #[test]
    fn test_loser_filter_threshold() {
        let groups = vec![
            group(-6.0, -60.0, GroupStatus::Active),
            group(-2.0, -20.0, GroupStatus::Active),
        ];
        let losers = filter_eligible_losers(&groups, &config(), Utc::now(), &HashSet::new());
        assert_eq!(losers.len(), 1);
        assert!((losers[0].unrealized_pnl_percent - (-6.0)).abs() < 1e-9);
    }

    #[test]
    fn test_blocked_and_skipped_excluded() {
        let mut blocked = group(-10.0, -100.0, GroupStatus::Active);
        blocked.risk_blocked = true;
        let skipped_group = group(-10.0, -100.0, GroupStatus::Active);
        let mut skipped = HashSet::new();
        skipped.insert(skipped_group.id);

        let groups = vec![blocked, skipped_group];
        let losers = filter_eligible_losers(&groups, &config(), Utc::now(), &skipped);
        assert!(losers.is_empty());
    }

    #[test]
    fn test_unexpired_timer_excluded() {
        let mut g = group(-10.0, -100.0, GroupStatus::Active);
        g.risk_timer_expires = Some(Utc::now() + Duration::minutes(30));
        let groups = vec![g];
        let losers = filter_eligible_losers(&groups, &config(), Utc::now(), &HashSet::new());
        assert!(losers.is_empty());
    }

    #[test]
    fn test_require_full_pyramids() {
        let mut g = group(-10.0, -100.0, GroupStatus::Active);
        g.pyramid_count = 3;
        let groups = vec![g];
        let losers = filter_eligible_losers(&groups, &config(), Utc::now(), &HashSet::new());
        assert!(losers.is_empty());

        let mut relaxed = config();
        relaxed.require_full_pyramids = false;
        let losers = filter_eligible_losers(&groups, &relaxed, Utc::now(), &HashSet::new());
        assert_eq!(losers.len(), 1);
    }

    #[test]
    fn test_deepest_loser_selected() {
        let groups = vec![
            group(-6.0, -60.0, GroupStatus::Active),
            group(-9.0, -90.0, GroupStatus::Active),
            group(-7.5, -75.0, GroupStatus::Active),
        ];
        let losers = filter_eligible_losers(&groups, &config(), Utc::now(), &HashSet::new());
        let deepest = select_deepest_loser(&losers).unwrap();
        assert!((deepest.unrealized_pnl_percent - (-9.0)).abs() < 1e-9);
    }

    #[test]
    fn test_winner_selection_sorted_and_capped() {
        let loser = group(-6.0, -60.0, GroupStatus::Active);
        let groups = vec![
            loser.clone(),
            group(0.5, 10.0, GroupStatus::Active),
            group(1.5, 30.0, GroupStatus::Active),
            group(1.0, 15.0, GroupStatus::Active),
            group(2.0, 40.0, GroupStatus::Active),
            group(-1.0, -5.0, GroupStatus::Active),
        ];
        let winners = select_winners(&groups, loser.id, &config(), Utc::now());
        assert_eq!(winners.len(), 3);
        assert!((winners[0].unrealized_pnl_usd - 40.0).abs() < 1e-9);
        assert!((winners[1].unrealized_pnl_usd - 30.0).abs() < 1e-9);
        assert!((winners[2].unrealized_pnl_usd - 15.0).abs() < 1e-9);
    }

    #[test]
    fn test_age_filter() {
        let loser = group(-6.0, -60.0, GroupStatus::Active);
        let mut young = group(1.0, 20.0, GroupStatus::Active);
        young.created_at = Utc::now() - Duration::minutes(10);

        let mut cfg = config();
        cfg.use_trade_age_filter = true;
        cfg.age_threshold_minutes = 120;

        let groups = vec![loser.clone(), young];
        let winners = select_winners(&groups, loser.id, &cfg, Utc::now());
        assert!(winners.is_empty());
    }
}
