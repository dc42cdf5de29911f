//! Position group, pyramid, and DCA order repositories, including the
//! transactional units the engine composes: slot-checked admission, pyramid
//! append/rollback, and locked read-modify-write on a group.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use uuid::Uuid;

use super::{dt, opt_dt, opt_ts, ts, EngineDb};
use crate::models::{
    DcaOrder, GroupStatus, OrderSide, OrderStatus, OrderType, PositionGroup, Pyramid,
    PyramidStatus, TpMode,
};

/// Result of a slot-checked group admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmitOutcome {
    Granted,
    /// The execution pool is full; the caller should enqueue instead.
    Denied,
}

const GROUP_COLUMNS: &str = "id, user_id, exchange, symbol, timeframe, side, status, \
     pyramid_count, max_pyramids, total_dca_legs, filled_dca_legs, base_entry_price, \
     weighted_avg_entry, total_invested_usd, total_filled_quantity, unrealized_pnl_usd, \
     unrealized_pnl_percent, realized_pnl_usd, total_entry_fees_usd, total_exit_fees_usd, \
     total_hedged_qty, total_hedged_value_usd, tp_mode, tp_aggregate_percent, \
     risk_timer_start, risk_timer_expires, risk_eligible, risk_blocked, risk_skip_once, \
     created_at, updated_at, closing_started_at, closed_at, aggregate_tp_order_id";

fn row_to_group(row: &Row<'_>) -> rusqlite::Result<PositionGroup> {
    let id: String = row.get(0)?;
    let user_id: String = row.get(1)?;
    let side: String = row.get(5)?;
    let status: String = row.get(6)?;
    let tp_mode: String = row.get(22)?;
    Ok(PositionGroup {
        id: Uuid::parse_str(&id).unwrap_or_default(),
        user_id: Uuid::parse_str(&user_id).unwrap_or_default(),
        exchange: row.get(2)?,
        symbol: row.get(3)?,
        timeframe: row.get::<_, i64>(4)? as u32,
        side: OrderSide::parse(&side).unwrap_or(OrderSide::Buy),
        status: GroupStatus::parse(&status).unwrap_or(GroupStatus::Failed),
        pyramid_count: row.get::<_, i64>(7)? as u32,
        max_pyramids: row.get::<_, i64>(8)? as u32,
        total_dca_legs: row.get::<_, i64>(9)? as u32,
        filled_dca_legs: row.get::<_, i64>(10)? as u32,
        base_entry_price: row.get(11)?,
        weighted_avg_entry: row.get(12)?,
        total_invested_usd: row.get(13)?,
        total_filled_quantity: row.get(14)?,
        unrealized_pnl_usd: row.get(15)?,
        unrealized_pnl_percent: row.get(16)?,
        realized_pnl_usd: row.get(17)?,
        total_entry_fees_usd: row.get(18)?,
        total_exit_fees_usd: row.get(19)?,
        total_hedged_qty: row.get(20)?,
        total_hedged_value_usd: row.get(21)?,
        tp_mode: TpMode::parse(&tp_mode).unwrap_or(TpMode::PerLeg),
        tp_aggregate_percent: row.get(23)?,
        risk_timer_start: opt_dt(row.get(24)?),
        risk_timer_expires: opt_dt(row.get(25)?),
        risk_eligible: row.get::<_, i64>(26)? != 0,
        risk_blocked: row.get::<_, i64>(27)? != 0,
        risk_skip_once: row.get::<_, i64>(28)? != 0,
        created_at: dt(row.get(29)?),
        updated_at: dt(row.get(30)?),
        closing_started_at: opt_dt(row.get(31)?),
        closed_at: opt_dt(row.get(32)?),
        aggregate_tp_order_id: row.get(33)?,
    })
}

const PYRAMID_COLUMNS: &str = "id, group_id, pyramid_index, entry_price, status, dca_config, \
     closed_at, exit_price, realized_pnl_usd, total_quantity, created_at";

fn row_to_pyramid(row: &Row<'_>) -> rusqlite::Result<Pyramid> {
    let id: String = row.get(0)?;
    let group_id: String = row.get(1)?;
    let status: String = row.get(4)?;
    let dca_config: String = row.get(5)?;
    Ok(Pyramid {
        id: Uuid::parse_str(&id).unwrap_or_default(),
        group_id: Uuid::parse_str(&group_id).unwrap_or_default(),
        pyramid_index: row.get::<_, i64>(2)? as u32,
        entry_price: row.get(3)?,
        status: PyramidStatus::parse(&status).unwrap_or(PyramidStatus::Pending),
        dca_config: serde_json::from_str(&dca_config).unwrap_or_default(),
        closed_at: opt_dt(row.get(6)?),
        exit_price: row.get(7)?,
        realized_pnl_usd: row.get(8)?,
        total_quantity: row.get(9)?,
        created_at: dt(row.get(10)?),
    })
}

const ORDER_COLUMNS: &str = "id, group_id, pyramid_id, leg_index, side, order_type, price, \
     quantity, quote_amount, status, filled_quantity, avg_fill_price, fee, fee_currency, \
     tp_percent, tp_price, tp_order_id, tp_hit, tp_executed_at, exchange_order_id, \
     submitted_at, filled_at, cancelled_at, created_at";

fn row_to_order(row: &Row<'_>) -> rusqlite::Result<DcaOrder> {
    let id: String = row.get(0)?;
    let group_id: String = row.get(1)?;
    let pyramid_id: String = row.get(2)?;
    let side: String = row.get(4)?;
    let order_type: String = row.get(5)?;
    let status: String = row.get(9)?;
    Ok(DcaOrder {
        id: Uuid::parse_str(&id).unwrap_or_default(),
        group_id: Uuid::parse_str(&group_id).unwrap_or_default(),
        pyramid_id: Uuid::parse_str(&pyramid_id).unwrap_or_default(),
        leg_index: row.get::<_, i64>(3)? as u32,
        side: OrderSide::parse(&side).unwrap_or(OrderSide::Buy),
        order_type: OrderType::parse(&order_type).unwrap_or(OrderType::Limit),
        price: row.get(6)?,
        quantity: row.get(7)?,
        quote_amount: row.get(8)?,
        status: OrderStatus::parse(&status).unwrap_or(OrderStatus::Failed),
        filled_quantity: row.get(10)?,
        avg_fill_price: row.get(11)?,
        fee: row.get(12)?,
        fee_currency: row.get(13)?,
        tp_percent: row.get(14)?,
        tp_price: row.get(15)?,
        tp_order_id: row.get(16)?,
        tp_hit: row.get::<_, i64>(17)? != 0,
        tp_executed_at: opt_dt(row.get(18)?),
        exchange_order_id: row.get(19)?,
        submitted_at: opt_dt(row.get(20)?),
        filled_at: opt_dt(row.get(21)?),
        cancelled_at: opt_dt(row.get(22)?),
        created_at: dt(row.get(23)?),
    })
}

fn insert_group(conn: &Connection, group: &PositionGroup) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO position_groups ({GROUP_COLUMNS}) VALUES \
             (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, \
              ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28, ?29, ?30, ?31, ?32, ?33, ?34)"
        ),
        params![
            group.id.to_string(),
            group.user_id.to_string(),
            group.exchange,
            group.symbol,
            group.timeframe as i64,
            group.side.as_str(),
            group.status.as_str(),
            group.pyramid_count as i64,
            group.max_pyramids as i64,
            group.total_dca_legs as i64,
            group.filled_dca_legs as i64,
            group.base_entry_price,
            group.weighted_avg_entry,
            group.total_invested_usd,
            group.total_filled_quantity,
            group.unrealized_pnl_usd,
            group.unrealized_pnl_percent,
            group.realized_pnl_usd,
            group.total_entry_fees_usd,
            group.total_exit_fees_usd,
            group.total_hedged_qty,
            group.total_hedged_value_usd,
            group.tp_mode.as_str(),
            group.tp_aggregate_percent,
            opt_ts(group.risk_timer_start),
            opt_ts(group.risk_timer_expires),
            group.risk_eligible as i64,
            group.risk_blocked as i64,
            group.risk_skip_once as i64,
            ts(group.created_at),
            ts(group.updated_at),
            opt_ts(group.closing_started_at),
            opt_ts(group.closed_at),
            group.aggregate_tp_order_id,
        ],
    )
    .context("insert position group")?;
    Ok(())
}

fn insert_pyramid(conn: &Connection, pyramid: &Pyramid) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO pyramids ({PYRAMID_COLUMNS}) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
        ),
        params![
            pyramid.id.to_string(),
            pyramid.group_id.to_string(),
            pyramid.pyramid_index as i64,
            pyramid.entry_price,
            pyramid.status.as_str(),
            serde_json::to_string(&pyramid.dca_config)?,
            opt_ts(pyramid.closed_at),
            pyramid.exit_price,
            pyramid.realized_pnl_usd,
            pyramid.total_quantity,
            ts(pyramid.created_at),
        ],
    )
    .context("insert pyramid")?;
    Ok(())
}

fn insert_order_row(conn: &Connection, order: &DcaOrder) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO dca_orders ({ORDER_COLUMNS}) VALUES \
             (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, \
              ?18, ?19, ?20, ?21, ?22, ?23, ?24)"
        ),
        params![
            order.id.to_string(),
            order.group_id.to_string(),
            order.pyramid_id.to_string(),
            order.leg_index as i64,
            order.side.as_str(),
            order.order_type.as_str(),
            order.price,
            order.quantity,
            order.quote_amount,
            order.status.as_str(),
            order.filled_quantity,
            order.avg_fill_price,
            order.fee,
            order.fee_currency,
            order.tp_percent,
            order.tp_price,
            order.tp_order_id,
            order.tp_hit as i64,
            opt_ts(order.tp_executed_at),
            order.exchange_order_id,
            opt_ts(order.submitted_at),
            opt_ts(order.filled_at),
            opt_ts(order.cancelled_at),
            ts(order.created_at),
        ],
    )
    .context("insert dca order")?;
    Ok(())
}

fn update_group_row(conn: &Connection, group: &PositionGroup) -> Result<()> {
    conn.execute(
        "UPDATE position_groups SET status = ?2, pyramid_count = ?3, max_pyramids = ?4, \
         total_dca_legs = ?5, filled_dca_legs = ?6, base_entry_price = ?7, \
         weighted_avg_entry = ?8, total_invested_usd = ?9, total_filled_quantity = ?10, \
         unrealized_pnl_usd = ?11, unrealized_pnl_percent = ?12, realized_pnl_usd = ?13, \
         total_entry_fees_usd = ?14, total_exit_fees_usd = ?15, total_hedged_qty = ?16, \
         total_hedged_value_usd = ?17, tp_mode = ?18, tp_aggregate_percent = ?19, \
         risk_timer_start = ?20, risk_timer_expires = ?21, risk_eligible = ?22, \
         risk_blocked = ?23, risk_skip_once = ?24, updated_at = ?25, \
         closing_started_at = ?26, closed_at = ?27, aggregate_tp_order_id = ?28 \
         WHERE id = ?1",
        params![
            group.id.to_string(),
            group.status.as_str(),
            group.pyramid_count as i64,
            group.max_pyramids as i64,
            group.total_dca_legs as i64,
            group.filled_dca_legs as i64,
            group.base_entry_price,
            group.weighted_avg_entry,
            group.total_invested_usd,
            group.total_filled_quantity,
            group.unrealized_pnl_usd,
            group.unrealized_pnl_percent,
            group.realized_pnl_usd,
            group.total_entry_fees_usd,
            group.total_exit_fees_usd,
            group.total_hedged_qty,
            group.total_hedged_value_usd,
            group.tp_mode.as_str(),
            group.tp_aggregate_percent,
            opt_ts(group.risk_timer_start),
            opt_ts(group.risk_timer_expires),
            group.risk_eligible as i64,
            group.risk_blocked as i64,
            group.risk_skip_once as i64,
            ts(Utc::now()),
            opt_ts(group.closing_started_at),
            opt_ts(group.closed_at),
            group.aggregate_tp_order_id,
        ],
    )
    .context("update position group")?;
    Ok(())
}

fn select_orders_for_group(conn: &Connection, group_id: Uuid) -> Result<Vec<DcaOrder>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {ORDER_COLUMNS} FROM dca_orders WHERE group_id = ?1 ORDER BY created_at, leg_index"
    ))?;
    let rows = stmt.query_map(params![group_id.to_string()], row_to_order)?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

/// An open order joined with the identity needed to route it to a connector.
#[derive(Debug, Clone)]
pub struct OpenOrderContext {
    pub order: DcaOrder,
    pub user_id: Uuid,
    pub exchange: String,
    pub symbol: String,
}

impl EngineDb {
    /// Slot-checked group admission: counts the user's pool-occupying groups
    /// and creates the group, first pyramid, and pending legs in the same
    /// transaction. `slot_cap = None` bypasses the cap (operator force-add).
    pub async fn admit_group(
        &self,
        group: &PositionGroup,
        pyramid: &Pyramid,
        orders: &[DcaOrder],
        slot_cap: Option<u32>,
    ) -> Result<AdmitOutcome> {
        let mut conn = self.lock().await;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("begin admission tx")?;

        if let Some(cap) = slot_cap {
            let count: i64 = tx.query_row(
                "SELECT COUNT(*) FROM position_groups WHERE user_id = ?1 \
                 AND status IN ('live', 'partially_filled', 'active', 'closing')",
                params![group.user_id.to_string()],
                |row| row.get(0),
            )?;
            if count >= cap as i64 {
                tx.rollback().ok();
                return Ok(AdmitOutcome::Denied);
            }
        }

        insert_group(&tx, group)?;
        insert_pyramid(&tx, pyramid)?;
        for order in orders {
            insert_order_row(&tx, order)?;
        }
        tx.commit().context("commit admission tx")?;
        Ok(AdmitOutcome::Granted)
    }

    /// Appends a continuation pyramid and its legs, bumping the group counters
    /// in the same transaction.
    pub async fn append_pyramid(&self, pyramid: &Pyramid, orders: &[DcaOrder]) -> Result<()> {
        let mut conn = self.lock().await;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("begin pyramid tx")?;
        insert_pyramid(&tx, pyramid)?;
        for order in orders {
            insert_order_row(&tx, order)?;
        }
        tx.execute(
            "UPDATE position_groups SET pyramid_count = pyramid_count + 1, \
             total_dca_legs = total_dca_legs + ?2, updated_at = ?3 WHERE id = ?1",
            params![
                pyramid.group_id.to_string(),
                orders.len() as i64,
                ts(Utc::now())
            ],
        )?;
        tx.commit().context("commit pyramid tx")?;
        Ok(())
    }

    /// Rolls back a pyramid whose every leg was rejected at submission:
    /// deletes the pyramid (legs cascade) and restores the group counters.
    pub async fn remove_pyramid(&self, pyramid_id: Uuid) -> Result<()> {
        let mut conn = self.lock().await;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("begin pyramid rollback tx")?;
        let found: Option<(String, i64)> = tx
            .query_row(
                "SELECT p.group_id, (SELECT COUNT(*) FROM dca_orders o WHERE o.pyramid_id = p.id) \
                 FROM pyramids p WHERE p.id = ?1",
                params![pyramid_id.to_string()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((group_id, leg_count)) = found else {
            tx.rollback().ok();
            return Ok(());
        };
        tx.execute(
            "DELETE FROM dca_orders WHERE pyramid_id = ?1",
            params![pyramid_id.to_string()],
        )?;
        tx.execute(
            "DELETE FROM pyramids WHERE id = ?1",
            params![pyramid_id.to_string()],
        )?;
        tx.execute(
            "UPDATE position_groups SET pyramid_count = pyramid_count - 1, \
             total_dca_legs = total_dca_legs - ?2, updated_at = ?3 WHERE id = ?1",
            params![group_id, leg_count, ts(Utc::now())],
        )?;
        tx.commit().context("commit pyramid rollback tx")?;
        Ok(())
    }

    pub async fn get_group(&self, id: Uuid) -> Result<Option<PositionGroup>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {GROUP_COLUMNS} FROM position_groups WHERE id = ?1"
        ))?;
        Ok(stmt
            .query_row(params![id.to_string()], row_to_group)
            .optional()?)
    }

    /// The at-most-one non-terminal group for this identity tuple.
    pub async fn find_active_group(
        &self,
        user_id: Uuid,
        symbol: &str,
        timeframe: u32,
        exchange: &str,
        side: OrderSide,
    ) -> Result<Option<PositionGroup>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {GROUP_COLUMNS} FROM position_groups \
             WHERE user_id = ?1 AND symbol = ?2 AND timeframe = ?3 AND exchange = ?4 \
             AND side = ?5 AND status NOT IN ('closed', 'failed')"
        ))?;
        Ok(stmt
            .query_row(
                params![
                    user_id.to_string(),
                    symbol,
                    timeframe as i64,
                    exchange,
                    side.as_str()
                ],
                row_to_group,
            )
            .optional()?)
    }

    pub async fn count_pool_groups(&self, user_id: Uuid) -> Result<u32> {
        let conn = self.lock().await;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM position_groups WHERE user_id = ?1 \
             AND status IN ('live', 'partially_filled', 'active', 'closing')",
            params![user_id.to_string()],
            |row| row.get(0),
        )?;
        Ok(count as u32)
    }

    pub async fn list_groups_for_user(
        &self,
        user_id: Uuid,
        include_terminal: bool,
    ) -> Result<Vec<PositionGroup>> {
        let conn = self.lock().await;
        let sql = if include_terminal {
            format!(
                "SELECT {GROUP_COLUMNS} FROM position_groups WHERE user_id = ?1 \
                 ORDER BY created_at DESC"
            )
        } else {
            format!(
                "SELECT {GROUP_COLUMNS} FROM position_groups WHERE user_id = ?1 \
                 AND status NOT IN ('closed', 'failed') ORDER BY created_at DESC"
            )
        };
        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = stmt.query_map(params![user_id.to_string()], row_to_group)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// All non-terminal groups across users, for the risk engine sweep.
    pub async fn list_non_terminal_groups(&self) -> Result<Vec<PositionGroup>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {GROUP_COLUMNS} FROM position_groups \
             WHERE status NOT IN ('closed', 'failed') ORDER BY user_id, created_at"
        ))?;
        let rows = stmt.query_map([], row_to_group)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub async fn update_group(&self, group: &PositionGroup) -> Result<()> {
        let conn = self.lock().await;
        update_group_row(&conn, group)
    }

    /// Locked read-modify-write: reads the group and its orders, applies `f`,
    /// and writes the group back, all inside one transaction. Returns the
    /// updated group, or None when the group does not exist.
    pub async fn mutate_group<F>(&self, group_id: Uuid, f: F) -> Result<Option<PositionGroup>>
    where
        F: FnOnce(&mut PositionGroup, &[DcaOrder]) + Send,
    {
        let mut conn = self.lock().await;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("begin group mutation tx")?;
        let group = {
            let mut stmt = tx.prepare_cached(&format!(
                "SELECT {GROUP_COLUMNS} FROM position_groups WHERE id = ?1"
            ))?;
            stmt.query_row(params![group_id.to_string()], row_to_group)
                .optional()?
        };
        let Some(mut group) = group else {
            tx.rollback().ok();
            return Ok(None);
        };
        let orders = select_orders_for_group(&tx, group_id)?;
        f(&mut group, &orders);
        update_group_row(&tx, &group)?;
        tx.commit().context("commit group mutation tx")?;
        Ok(Some(group))
    }

    pub async fn list_pyramids(&self, group_id: Uuid) -> Result<Vec<Pyramid>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {PYRAMID_COLUMNS} FROM pyramids WHERE group_id = ?1 ORDER BY pyramid_index"
        ))?;
        let rows = stmt.query_map(params![group_id.to_string()], row_to_pyramid)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub async fn get_pyramid(&self, id: Uuid) -> Result<Option<Pyramid>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {PYRAMID_COLUMNS} FROM pyramids WHERE id = ?1"
        ))?;
        Ok(stmt
            .query_row(params![id.to_string()], row_to_pyramid)
            .optional()?)
    }

    pub async fn set_pyramid_status(&self, id: Uuid, status: PyramidStatus) -> Result<()> {
        let conn = self.lock().await;
        conn.execute(
            "UPDATE pyramids SET status = ?2 WHERE id = ?1",
            params![id.to_string(), status.as_str()],
        )?;
        Ok(())
    }

    /// Records a pyramid-level TP closure.
    pub async fn close_pyramid(
        &self,
        id: Uuid,
        closed_at: DateTime<Utc>,
        exit_price: f64,
        realized_pnl_usd: f64,
        total_quantity: f64,
    ) -> Result<()> {
        let conn = self.lock().await;
        conn.execute(
            "UPDATE pyramids SET status = 'closed', closed_at = ?2, exit_price = ?3, \
             realized_pnl_usd = ?4, total_quantity = ?5 WHERE id = ?1",
            params![
                id.to_string(),
                ts(closed_at),
                exit_price,
                realized_pnl_usd,
                total_quantity
            ],
        )?;
        Ok(())
    }

    pub async fn set_group_aggregate_tp(
        &self,
        group_id: Uuid,
        tp_order_id: Option<&str>,
    ) -> Result<()> {
        let conn = self.lock().await;
        conn.execute(
            "UPDATE position_groups SET aggregate_tp_order_id = ?2, updated_at = ?3 WHERE id = ?1",
            params![group_id.to_string(), tp_order_id, ts(Utc::now())],
        )?;
        Ok(())
    }

    /// Groups whose rolling aggregate TP is live on the venue.
    pub async fn groups_with_live_aggregate_tp(&self) -> Result<Vec<PositionGroup>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {GROUP_COLUMNS} FROM position_groups \
             WHERE aggregate_tp_order_id IS NOT NULL \
             AND status NOT IN ('closed', 'failed') \
             ORDER BY user_id, exchange"
        ))?;
        let rows = stmt.query_map([], row_to_group)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Aggregate-mode groups holding quantity but no live aggregate TP
    /// (an earlier placement failed or was cancelled externally).
    pub async fn groups_missing_aggregate_tp(&self) -> Result<Vec<PositionGroup>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {GROUP_COLUMNS} FROM position_groups \
             WHERE aggregate_tp_order_id IS NULL \
             AND tp_mode IN ('aggregate', 'hybrid') \
             AND total_filled_quantity > 0 \
             AND status NOT IN ('closed', 'failed', 'closing') \
             ORDER BY user_id, exchange"
        ))?;
        let rows = stmt.query_map([], row_to_group)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub async fn get_order(&self, id: Uuid) -> Result<Option<DcaOrder>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {ORDER_COLUMNS} FROM dca_orders WHERE id = ?1"
        ))?;
        Ok(stmt
            .query_row(params![id.to_string()], row_to_order)
            .optional()?)
    }

    pub async fn get_orders_for_group(&self, group_id: Uuid) -> Result<Vec<DcaOrder>> {
        let conn = self.lock().await;
        select_orders_for_group(&conn, group_id)
    }

    pub async fn get_orders_for_pyramid(&self, pyramid_id: Uuid) -> Result<Vec<DcaOrder>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {ORDER_COLUMNS} FROM dca_orders WHERE pyramid_id = ?1 ORDER BY leg_index"
        ))?;
        let rows = stmt.query_map(params![pyramid_id.to_string()], row_to_order)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// One round-trip over every order the fill monitor must reconcile.
    pub async fn open_orders_with_context(&self) -> Result<Vec<OpenOrderContext>> {
        let conn = self.lock().await;
        let sql = format!(
            "SELECT {cols}, g.user_id, g.exchange, g.symbol \
             FROM dca_orders o JOIN position_groups g ON o.group_id = g.id \
             WHERE o.status IN ('open', 'partially_filled') \
             ORDER BY g.user_id, g.exchange, o.created_at",
            cols = ORDER_COLUMNS
                .split(", ")
                .map(|c| format!("o.{c}"))
                .collect::<Vec<_>>()
                .join(", ")
        );
        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = stmt.query_map([], |row| {
            let order = row_to_order(row)?;
            let user_id: String = row.get(24)?;
            Ok(OpenOrderContext {
                order,
                user_id: Uuid::parse_str(&user_id).unwrap_or_default(),
                exchange: row.get(25)?,
                symbol: row.get(26)?,
            })
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Filled entry legs whose TP order is live and unevaluated.
    pub async fn pending_tp_orders_with_context(&self) -> Result<Vec<OpenOrderContext>> {
        let conn = self.lock().await;
        let sql = format!(
            "SELECT {cols}, g.user_id, g.exchange, g.symbol \
             FROM dca_orders o JOIN position_groups g ON o.group_id = g.id \
             WHERE o.tp_order_id IS NOT NULL AND o.tp_hit = 0 \
             AND o.status = 'filled' AND o.side = 'buy' \
             ORDER BY g.user_id, g.exchange, o.created_at",
            cols = ORDER_COLUMNS
                .split(", ")
                .map(|c| format!("o.{c}"))
                .collect::<Vec<_>>()
                .join(", ")
        );
        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = stmt.query_map([], |row| {
            let order = row_to_order(row)?;
            let user_id: String = row.get(24)?;
            Ok(OpenOrderContext {
                order,
                user_id: Uuid::parse_str(&user_id).unwrap_or_default(),
                exchange: row.get(25)?,
                symbol: row.get(26)?,
            })
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Filled entry legs still without a TP order (earlier placement failed),
    /// scoped to groups that can still progress.
    pub async fn entries_missing_tp_with_context(&self) -> Result<Vec<OpenOrderContext>> {
        let conn = self.lock().await;
        let sql = format!(
            "SELECT {cols}, g.user_id, g.exchange, g.symbol \
             FROM dca_orders o JOIN position_groups g ON o.group_id = g.id \
             WHERE o.side = 'buy' AND o.status = 'filled' AND o.tp_order_id IS NULL \
             AND o.tp_hit = 0 AND o.leg_index != 999 \
             AND g.status NOT IN ('closed', 'failed', 'closing') \
             AND (g.tp_mode IN ('per_leg', 'hybrid') \
                  OR (g.tp_mode = 'pyramid_aggregate' AND NOT EXISTS ( \
                      SELECT 1 FROM dca_orders s WHERE s.pyramid_id = o.pyramid_id \
                      AND s.tp_order_id IS NOT NULL AND s.tp_hit = 0))) \
             ORDER BY g.user_id, g.exchange, o.created_at",
            cols = ORDER_COLUMNS
                .split(", ")
                .map(|c| format!("o.{c}"))
                .collect::<Vec<_>>()
                .join(", ")
        );
        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = stmt.query_map([], |row| {
            let order = row_to_order(row)?;
            let user_id: String = row.get(24)?;
            Ok(OpenOrderContext {
                order,
                user_id: Uuid::parse_str(&user_id).unwrap_or_default(),
                exchange: row.get(25)?,
                symbol: row.get(26)?,
            })
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub async fn insert_order(&self, order: &DcaOrder) -> Result<()> {
        let conn = self.lock().await;
        insert_order_row(&conn, order)
    }

    pub async fn mark_order_submitted(
        &self,
        id: Uuid,
        exchange_order_id: &str,
        submitted_at: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.lock().await;
        conn.execute(
            "UPDATE dca_orders SET status = 'open', exchange_order_id = ?2, submitted_at = ?3 \
             WHERE id = ?1",
            params![id.to_string(), exchange_order_id, ts(submitted_at)],
        )?;
        Ok(())
    }

    pub async fn mark_order_failed(&self, id: Uuid) -> Result<()> {
        let conn = self.lock().await;
        conn.execute(
            "UPDATE dca_orders SET status = 'failed' WHERE id = ?1",
            params![id.to_string()],
        )?;
        Ok(())
    }

    /// Idempotent fill transition keyed on the exchange order id: a repeat
    /// observation of the same state writes the same row values.
    pub async fn record_order_fill(
        &self,
        id: Uuid,
        status: OrderStatus,
        filled_quantity: f64,
        avg_fill_price: f64,
        fee: f64,
        fee_currency: Option<&str>,
        filled_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let conn = self.lock().await;
        conn.execute(
            "UPDATE dca_orders SET status = ?2, filled_quantity = ?3, avg_fill_price = ?4, \
             fee = ?5, fee_currency = COALESCE(?6, fee_currency), \
             filled_at = COALESCE(?7, filled_at) WHERE id = ?1",
            params![
                id.to_string(),
                status.as_str(),
                filled_quantity,
                avg_fill_price,
                fee,
                fee_currency,
                opt_ts(filled_at),
            ],
        )?;
        Ok(())
    }

    pub async fn mark_order_cancelled(&self, id: Uuid, cancelled_at: DateTime<Utc>) -> Result<()> {
        let conn = self.lock().await;
        conn.execute(
            "UPDATE dca_orders SET status = 'cancelled', cancelled_at = ?2 WHERE id = ?1",
            params![id.to_string(), ts(cancelled_at)],
        )?;
        Ok(())
    }

    pub async fn set_order_tp_placed(&self, id: Uuid, tp_order_id: &str) -> Result<()> {
        let conn = self.lock().await;
        conn.execute(
            "UPDATE dca_orders SET tp_order_id = ?2 WHERE id = ?1",
            params![id.to_string(), tp_order_id],
        )?;
        Ok(())
    }

    /// Detaches a TP order that was cancelled on the venue (aggregate
    /// re-placement, hybrid first-wins, exit teardown).
    pub async fn clear_order_tp(&self, id: Uuid) -> Result<()> {
        let conn = self.lock().await;
        conn.execute(
            "UPDATE dca_orders SET tp_order_id = NULL WHERE id = ?1",
            params![id.to_string()],
        )?;
        Ok(())
    }

    pub async fn mark_tp_hit(&self, id: Uuid, executed_at: DateTime<Utc>) -> Result<()> {
        let conn = self.lock().await;
        conn.execute(
            "UPDATE dca_orders SET tp_hit = 1, tp_executed_at = ?2 WHERE id = ?1",
            params![id.to_string(), ts(executed_at)],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::temp_db;
    use super::*;
    use crate::models::RiskEngineConfig;
    use crate::models::User;
    use std::collections::HashMap;

    pub(crate) fn sample_group(user_id: Uuid, symbol: &str) -> PositionGroup {
        let now = Utc::now();
        PositionGroup {
            id: Uuid::new_v4(),
            user_id,
            exchange: "binance".to_string(),
            symbol: symbol.to_string(),
            timeframe: 60,
            side: OrderSide::Buy,
            status: GroupStatus::Waiting,
            pyramid_count: 1,
            max_pyramids: 5,
            total_dca_legs: 1,
            filled_dca_legs: 0,
            base_entry_price: 50_000.0,
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
            tp_mode: TpMode::PerLeg,
            tp_aggregate_percent: 0.0,
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
        }
    }

    pub(crate) fn sample_pyramid(group_id: Uuid, index: u32) -> Pyramid {
        Pyramid {
            id: Uuid::new_v4(),
            group_id,
            pyramid_index: index,
            entry_price: 50_000.0,
            status: PyramidStatus::Pending,
            dca_config: Vec::new(),
            closed_at: None,
            exit_price: None,
            realized_pnl_usd: None,
            total_quantity: None,
            created_at: Utc::now(),
        }
    }

    pub(crate) fn sample_order(group_id: Uuid, pyramid_id: Uuid, leg: u32) -> DcaOrder {
        DcaOrder {
            id: Uuid::new_v4(),
            group_id,
            pyramid_id,
            leg_index: leg,
            side: OrderSide::Buy,
            order_type: OrderType::Limit,
            price: 50_000.0,
            quantity: 0.004,
            quote_amount: None,
            status: OrderStatus::Pending,
            filled_quantity: 0.0,
            avg_fill_price: 0.0,
            fee: 0.0,
            fee_currency: None,
            tp_percent: Some(1.0),
            tp_price: Some(50_500.0),
            tp_order_id: None,
            tp_hit: false,
            tp_executed_at: None,
            exchange_order_id: None,
            submitted_at: None,
            filled_at: None,
            cancelled_at: None,
            created_at: Utc::now(),
        }
    }

    async fn insert_user(db: &super::super::EngineDb) -> Uuid {
        let user = User {
            id: Uuid::new_v4(),
            username: format!("u-{}", Uuid::new_v4()),
            email: format!("{}@example.com", Uuid::new_v4()),
            password_hash: "h".to_string(),
            is_active: true,
            webhook_secret: None,
            secure_signals: false,
            exchange_credentials: HashMap::new(),
            risk_config: RiskEngineConfig::default(),
            created_at: Utc::now(),
        };
        db.create_user(&user).await.unwrap();
        user.id
    }

    #[tokio::test]
    async fn test_admit_group_respects_slot_cap() {
        let (db, _dir) = temp_db();
        let user_id = insert_user(&db).await;

        for (i, symbol) in ["BTCUSDT", "ETHUSDT"].iter().enumerate() {
            let mut group = sample_group(user_id, symbol);
            group.status = GroupStatus::Active;
            let pyramid = sample_pyramid(group.id, 0);
            let order = sample_order(group.id, pyramid.id, 0);
            let outcome = db
                .admit_group(&group, &pyramid, &[order], Some(2))
                .await
                .unwrap();
            assert_eq!(outcome, AdmitOutcome::Granted, "group {i}");
        }

        let group = sample_group(user_id, "SOLUSDT");
        let pyramid = sample_pyramid(group.id, 0);
        let order = sample_order(group.id, pyramid.id, 0);
        let outcome = db
            .admit_group(&group, &pyramid, &[order], Some(2))
            .await
            .unwrap();
        assert_eq!(outcome, AdmitOutcome::Denied);
        assert!(db.get_group(group.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_denied_admission_leaves_no_rows() {
        let (db, _dir) = temp_db();
        let user_id = insert_user(&db).await;

        let mut blocker = sample_group(user_id, "BTCUSDT");
        blocker.status = GroupStatus::Active;
        let pyr = sample_pyramid(blocker.id, 0);
        let ord = sample_order(blocker.id, pyr.id, 0);
        db.admit_group(&blocker, &pyr, &[ord], Some(1)).await.unwrap();

        let group = sample_group(user_id, "ETHUSDT");
        let pyramid = sample_pyramid(group.id, 0);
        let orders = vec![
            sample_order(group.id, pyramid.id, 0),
            sample_order(group.id, pyramid.id, 1),
        ];
        let outcome = db
            .admit_group(&group, &pyramid, &orders, Some(1))
            .await
            .unwrap();
        assert_eq!(outcome, AdmitOutcome::Denied);
        assert!(db.get_orders_for_group(group.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_active_uniqueness_enforced() {
        let (db, _dir) = temp_db();
        let user_id = insert_user(&db).await;

        let group = sample_group(user_id, "BTCUSDT");
        let pyramid = sample_pyramid(group.id, 0);
        let order = sample_order(group.id, pyramid.id, 0);
        db.admit_group(&group, &pyramid, &[order], None).await.unwrap();

        let duplicate = sample_group(user_id, "BTCUSDT");
        let dup_pyr = sample_pyramid(duplicate.id, 0);
        let dup_ord = sample_order(duplicate.id, dup_pyr.id, 0);
        assert!(db
            .admit_group(&duplicate, &dup_pyr, &[dup_ord], None)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_pyramid_append_and_rollback() {
        let (db, _dir) = temp_db();
        let user_id = insert_user(&db).await;

        let group = sample_group(user_id, "BTCUSDT");
        let pyramid = sample_pyramid(group.id, 0);
        let order = sample_order(group.id, pyramid.id, 0);
        db.admit_group(&group, &pyramid, &[order], None).await.unwrap();

        let second = sample_pyramid(group.id, 1);
        let legs = vec![
            sample_order(group.id, second.id, 0),
            sample_order(group.id, second.id, 1),
        ];
        db.append_pyramid(&second, &legs).await.unwrap();

        let loaded = db.get_group(group.id).await.unwrap().unwrap();
        assert_eq!(loaded.pyramid_count, 2);
        assert_eq!(loaded.total_dca_legs, 3);

        db.remove_pyramid(second.id).await.unwrap();
        let loaded = db.get_group(group.id).await.unwrap().unwrap();
        assert_eq!(loaded.pyramid_count, 1);
        assert_eq!(loaded.total_dca_legs, 1);
        assert!(db.get_pyramid(second.id).await.unwrap().is_none());
        assert_eq!(db.get_orders_for_group(group.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_mutate_group_persists_changes() {
        let (db, _dir) = temp_db();
        let user_id = insert_user(&db).await;

        let group = sample_group(user_id, "BTCUSDT");
        let pyramid = sample_pyramid(group.id, 0);
        let order = sample_order(group.id, pyramid.id, 0);
        db.admit_group(&group, &pyramid, &[order], None).await.unwrap();

        let updated = db
            .mutate_group(group.id, |g, orders| {
                assert_eq!(orders.len(), 1);
                g.status = GroupStatus::PartiallyFilled;
                g.total_filled_quantity = 0.004;
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.status, GroupStatus::PartiallyFilled);

        let loaded = db.get_group(group.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, GroupStatus::PartiallyFilled);
        assert!((loaded.total_filled_quantity - 0.004).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_open_orders_with_context() {
        let (db, _dir) = temp_db();
        let user_id = insert_user(&db).await;

        let group = sample_group(user_id, "BTCUSDT");
        let pyramid = sample_pyramid(group.id, 0);
        let order = sample_order(group.id, pyramid.id, 0);
        db.admit_group(&group, &pyramid, &[order.clone()], None)
            .await
            .unwrap();

        assert!(db.open_orders_with_context().await.unwrap().is_empty());

        db.mark_order_submitted(order.id, "ex-1", Utc::now())
            .await
            .unwrap();
        let open = db.open_orders_with_context().await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].symbol, "BTCUSDT");
        assert_eq!(open[0].user_id, user_id);
        assert_eq!(open[0].order.exchange_order_id.as_deref(), Some("ex-1"));
    }
}
