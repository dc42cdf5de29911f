//! The engine's single transactional store (SQLite).
//!
//! One connection behind an async mutex: statements never interleave, and
//! multi-statement units run inside `BEGIN IMMEDIATE` transactions so no
//! reader observes a torn group. All position/order/queue state lives here;
//! nothing above this layer caches position state across requests.

mod positions;
mod queue;
mod risk_actions;
mod users;

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use tokio::sync::Mutex;

pub use positions::{AdmitOutcome, OpenOrderContext};

#[derive(Clone)]
pub struct EngineDb {
    conn: Arc<Mutex<Connection>>,
}

impl EngineDb {
    /// Opens (or creates) the database and applies the schema.
    pub fn new(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path).context("open engine db")?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.pragma_update(None, "foreign_keys", "ON").ok();
        conn.busy_timeout(std::time::Duration::from_secs(5)).ok();

        apply_schema(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub(crate) async fn lock(&self) -> tokio::sync::MutexGuard<'_, Connection> {
        self.conn.lock().await
    }
}

fn apply_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS users (
            id TEXT PRIMARY KEY,
            username TEXT NOT NULL UNIQUE,
            email TEXT NOT NULL UNIQUE,
            password_hash TEXT NOT NULL,
            is_active INTEGER NOT NULL DEFAULT 1,
            webhook_secret TEXT,
            secure_signals INTEGER NOT NULL DEFAULT 1,
            exchange_credentials TEXT NOT NULL DEFAULT '{}',
            risk_config TEXT NOT NULL,
            created_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS dca_configurations (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            pair TEXT NOT NULL,
            timeframe INTEGER NOT NULL,
            exchange TEXT NOT NULL,
            grid TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            UNIQUE(user_id, pair, timeframe, exchange)
        );

        CREATE TABLE IF NOT EXISTS position_groups (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            exchange TEXT NOT NULL,
            symbol TEXT NOT NULL,
            timeframe INTEGER NOT NULL,
            side TEXT NOT NULL,
            status TEXT NOT NULL,
            pyramid_count INTEGER NOT NULL DEFAULT 0,
            max_pyramids INTEGER NOT NULL DEFAULT 5,
            total_dca_legs INTEGER NOT NULL DEFAULT 0,
            filled_dca_legs INTEGER NOT NULL DEFAULT 0,
            base_entry_price REAL NOT NULL,
            weighted_avg_entry REAL NOT NULL DEFAULT 0,
            total_invested_usd REAL NOT NULL DEFAULT 0,
            total_filled_quantity REAL NOT NULL DEFAULT 0,
            unrealized_pnl_usd REAL NOT NULL DEFAULT 0,
            unrealized_pnl_percent REAL NOT NULL DEFAULT 0,
            realized_pnl_usd REAL NOT NULL DEFAULT 0,
            total_entry_fees_usd REAL NOT NULL DEFAULT 0,
            total_exit_fees_usd REAL NOT NULL DEFAULT 0,
            total_hedged_qty REAL NOT NULL DEFAULT 0,
            total_hedged_value_usd REAL NOT NULL DEFAULT 0,
            tp_mode TEXT NOT NULL,
            tp_aggregate_percent REAL NOT NULL DEFAULT 0,
            aggregate_tp_order_id TEXT,
            risk_timer_start INTEGER,
            risk_timer_expires INTEGER,
            risk_eligible INTEGER NOT NULL DEFAULT 0,
            risk_blocked INTEGER NOT NULL DEFAULT 0,
            risk_skip_once INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            closing_started_at INTEGER,
            closed_at INTEGER
        );
        CREATE INDEX IF NOT EXISTS idx_position_groups_user_status
            ON position_groups(user_id, status);
        CREATE UNIQUE INDEX IF NOT EXISTS idx_position_groups_active_unique
            ON position_groups(user_id, symbol, exchange, timeframe, side)
            WHERE status NOT IN ('closed', 'failed');

        CREATE TABLE IF NOT EXISTS pyramids (
            id TEXT PRIMARY KEY,
            group_id TEXT NOT NULL REFERENCES position_groups(id) ON DELETE CASCADE,
            pyramid_index INTEGER NOT NULL,
            entry_price REAL NOT NULL,
            status TEXT NOT NULL,
            dca_config TEXT NOT NULL,
            closed_at INTEGER,
            exit_price REAL,
            realized_pnl_usd REAL,
            total_quantity REAL,
            created_at INTEGER NOT NULL,
            UNIQUE(group_id, pyramid_index)
        );

        CREATE TABLE IF NOT EXISTS dca_orders (
            id TEXT PRIMARY KEY,
            group_id TEXT NOT NULL REFERENCES position_groups(id) ON DELETE CASCADE,
            pyramid_id TEXT NOT NULL REFERENCES pyramids(id) ON DELETE CASCADE,
            leg_index INTEGER NOT NULL,
            side TEXT NOT NULL,
            order_type TEXT NOT NULL,
            price REAL NOT NULL,
            quantity REAL NOT NULL,
            quote_amount REAL,
            status TEXT NOT NULL,
            filled_quantity REAL NOT NULL DEFAULT 0,
            avg_fill_price REAL NOT NULL DEFAULT 0,
            fee REAL NOT NULL DEFAULT 0,
            fee_currency TEXT,
            tp_percent REAL,
            tp_price REAL,
            tp_order_id TEXT,
            tp_hit INTEGER NOT NULL DEFAULT 0,
            tp_executed_at INTEGER,
            exchange_order_id TEXT,
            submitted_at INTEGER,
            filled_at INTEGER,
            cancelled_at INTEGER,
            created_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_dca_orders_group_status
            ON dca_orders(group_id, status);
        CREATE INDEX IF NOT EXISTS idx_dca_orders_exchange_order_id
            ON dca_orders(exchange_order_id) WHERE exchange_order_id IS NOT NULL;
        CREATE INDEX IF NOT EXISTS idx_dca_orders_tp_order_id
            ON dca_orders(tp_order_id) WHERE tp_order_id IS NOT NULL;

        CREATE TABLE IF NOT EXISTS queued_signals (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            exchange TEXT NOT NULL,
            symbol TEXT NOT NULL,
            timeframe INTEGER NOT NULL,
            side TEXT NOT NULL,
            entry_price REAL NOT NULL,
            signal_payload TEXT NOT NULL,
            queued_at INTEGER NOT NULL,
            replacement_count INTEGER NOT NULL DEFAULT 0,
            priority_score REAL NOT NULL DEFAULT 0,
            is_pyramid_continuation INTEGER NOT NULL DEFAULT 0,
            current_loss_percent REAL,
            priority_explanation TEXT,
            status TEXT NOT NULL,
            promoted_at INTEGER,
            rejection_reason TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_queued_signals_user_status
            ON queued_signals(user_id, status);
        CREATE INDEX IF NOT EXISTS idx_queued_signals_priority
            ON queued_signals(priority_score);

        CREATE TABLE IF NOT EXISTS risk_actions (
            id TEXT PRIMARY KEY,
            action_type TEXT NOT NULL,
            loser_group_id TEXT,
            winner_group_ids TEXT NOT NULL DEFAULT '[]',
            quantity REAL NOT NULL DEFAULT 0,
            price REAL NOT NULL DEFAULT 0,
            pnl_usd REAL NOT NULL DEFAULT 0,
            duration_seconds INTEGER,
            details TEXT,
            created_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_risk_actions_loser
            ON risk_actions(loser_group_id, created_at);
        ",
    )
    .context("apply schema")?;
    Ok(())
}

pub(crate) fn ts(dt: DateTime<Utc>) -> i64 {
    dt.timestamp()
}

pub(crate) fn opt_ts(dt: Option<DateTime<Utc>>) -> Option<i64> {
    dt.map(|d| d.timestamp())
}

pub(crate) fn dt(ts: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(ts, 0).unwrap_or_else(Utc::now)
}

pub(crate) fn opt_dt(ts: Option<i64>) -> Option<DateTime<Utc>> {
    ts.map(dt)
}
