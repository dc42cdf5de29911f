//! Risk-timer management and stuck-CLOSING recovery.

use std::collections::HashSet;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use tracing::info;
use uuid::Uuid;

use crate::models::{GroupStatus, PositionGroup, RiskEngineConfig, TimerStartCondition};
use crate::store::EngineDb;

pub fn pyramids_requirement_met(group: &PositionGroup, config: &RiskEngineConfig) -> bool {
    !config.require_full_pyramids || group.pyramid_count >= group.max_pyramids
}

pub fn is_fully_filled(group: &PositionGroup) -> bool {
    group.total_dca_legs > 0 && group.filled_dca_legs >= group.total_dca_legs
}

/// Starts timers for groups that just became ready and consumes one-shot
/// skip flags. Returns the ids skipped this round.
pub async fn update_risk_timers(
    db: &EngineDb,
    groups: &[PositionGroup],
    config: &RiskEngineConfig,
    now: DateTime<Utc>,
) -> Result<HashSet<Uuid>> {
    let mut skipped = HashSet::new();

    for group in groups.iter().filter(|g| !g.status.is_terminal()) {
        if group.risk_blocked {
            continue;
        }
        if group.risk_skip_once {
            skipped.insert(group.id);
            db.mutate_group(group.id, |g, _| {
                g.risk_skip_once = false;
            })
            .await?;
            continue;
        }

        let ready = match config.timer_start_condition {
            TimerStartCondition::AfterAllDcaFilled => {
                is_fully_filled(group) && pyramids_requirement_met(group, config)
            }
            TimerStartCondition::AfterFirstFill => group.filled_dca_legs > 0,
        };
        if ready && group.risk_timer_start.is_none() {
            let expires = now + Duration::minutes(config.post_full_wait_minutes);
            db.mutate_group(group.id, move |g, _| {
                g.risk_timer_start = Some(now);
                g.risk_timer_expires = Some(expires);
                g.risk_eligible = true;
            })
            .await?;
            info!(
                group_id = %group.id,
                expires = %expires,
                "risk timer started"
            );
        }
    }
    Ok(skipped)
}

/// Reverts groups stuck in CLOSING past the timeout back to ACTIVE with
/// timers cleared; the prior hedge attempt is treated as failed.
pub async fn recover_stuck_closing(
    db: &EngineDb,
    groups: &[PositionGroup],
    closing_timeout_minutes: i64,
    now: DateTime<Utc>,
) -> Result<usize> {
    let deadline = now - Duration::minutes(closing_timeout_minutes);
    let mut recovered = 0;
    for group in groups.iter().filter(|g| {
        g.status == GroupStatus::Closing
            && g.closing_started_at.map(|t| t < deadline).unwrap_or(true)
    }) {
        db.mutate_group(group.id, |g, _| {
            g.status = GroupStatus::Active;
            g.closing_started_at = None;
            g.risk_timer_start = None;
            g.risk_timer_expires = None;
            g.risk_eligible = false;
        })
        .await?;
        info!(group_id = %group.id, "stuck CLOSING group recovered to ACTIVE");
        recovered += 1;
    }
    Ok(recovered)
}
