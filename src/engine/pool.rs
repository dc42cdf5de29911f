//! Execution pool: the per-user cap on concurrently active position groups.
//!
//! The count and the group insert happen inside one store transaction
//! (`EngineDb::admit_group`), so two racing admissions can never both claim
//! the last slot. Pyramid continuations do not consume a slot.

use anyhow::Result;
use uuid::Uuid;

use crate::models::{DcaOrder, PositionGroup, Pyramid, User};
use crate::store::{AdmitOutcome, EngineDb};

pub struct ExecutionPoolManager {
    db: EngineDb,
}

impl ExecutionPoolManager {
    pub fn new(db: EngineDb) -> Self {
        Self { db }
    }

    pub async fn current_pool_size(&self, user_id: Uuid) -> Result<u32> {
        self.db.count_pool_groups(user_id).await
    }

    /// Slot-checked admission: grants iff the user's pool has room under
    /// `max_open_positions_global`, creating the group atomically with the
    /// check. `force` bypasses the cap (operator force-add).
    pub async fn admit(
        &self,
        user: &User,
        group: &PositionGroup,
        pyramid: &Pyramid,
        orders: &[DcaOrder],
        force: bool,
    ) -> Result<AdmitOutcome> {
        let cap = if force {
            None
        } else {
            Some(user.risk_config.max_open_positions_global)
        };
        self.db.admit_group(group, pyramid, orders, cap).await
    }
}
