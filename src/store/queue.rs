//! Queued-signal repository: replacement-aware enqueue, symbol cancellation,
//! and promotion bookkeeping.

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row, TransactionBehavior};
use uuid::Uuid;

use super::{dt, opt_dt, opt_ts, ts, EngineDb};
use crate::models::{OrderSide, QueueStatus, QueuedSignal};

const QUEUE_COLUMNS: &str = "id, user_id, exchange, symbol, timeframe, side, entry_price, \
     signal_payload, queued_at, replacement_count, priority_score, is_pyramid_continuation, \
     current_loss_percent, priority_explanation, status, promoted_at, rejection_reason";

fn row_to_signal(row: &Row<'_>) -> rusqlite::Result<QueuedSignal> {
    let id: String = row.get(0)?;
    let user_id: String = row.get(1)?;
    let side: String = row.get(5)?;
    let payload: String = row.get(7)?;
    let status: String = row.get(14)?;
    Ok(QueuedSignal {
        id: Uuid::parse_str(&id).unwrap_or_default(),
        user_id: Uuid::parse_str(&user_id).unwrap_or_default(),
        exchange: row.get(2)?,
        symbol: row.get(3)?,
        timeframe: row.get::<_, i64>(4)? as u32,
        side: OrderSide::parse(&side).unwrap_or(OrderSide::Buy),
        entry_price: row.get(6)?,
        signal_payload: serde_json::from_str(&payload).unwrap_or(serde_json::Value::Null),
        queued_at: dt(row.get(8)?),
        replacement_count: row.get::<_, i64>(9)? as u32,
        priority_score: row.get(10)?,
        is_pyramid_continuation: row.get::<_, i64>(11)? != 0,
        current_loss_percent: row.get(12)?,
        priority_explanation: row.get(13)?,
        status: QueueStatus::parse(&status).unwrap_or(QueueStatus::Queued),
        promoted_at: opt_dt(row.get(15)?),
        rejection_reason: row.get(16)?,
    })
}

impl EngineDb {
    /// Idempotent enqueue on (user, symbol, timeframe, side, exchange): a
    /// second signal for the same queue slot overwrites the entry price and
    /// payload and bumps `replacement_count`. Returns the stored signal and
    /// whether an existing entry was replaced.
    pub async fn enqueue_signal(&self, signal: &QueuedSignal) -> Result<(QueuedSignal, bool)> {
        let mut conn = self.lock().await;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("begin enqueue tx")?;

        let existing = {
            let mut stmt = tx.prepare_cached(&format!(
                "SELECT {QUEUE_COLUMNS} FROM queued_signals \
                 WHERE user_id = ?1 AND symbol = ?2 AND timeframe = ?3 AND side = ?4 \
                 AND exchange = ?5 AND status = 'queued'"
            ))?;
            stmt.query_row(
                params![
                    signal.user_id.to_string(),
                    signal.symbol,
                    signal.timeframe as i64,
                    signal.side.as_str(),
                    signal.exchange,
                ],
                row_to_signal,
            )
            .optional()?
        };

        let result = if let Some(mut existing) = existing {
            existing.replacement_count += 1;
            existing.entry_price = signal.entry_price;
            existing.signal_payload = signal.signal_payload.clone();
            existing.is_pyramid_continuation = signal.is_pyramid_continuation;
            existing.current_loss_percent = signal.current_loss_percent;
            tx.execute(
                "UPDATE queued_signals SET entry_price = ?2, signal_payload = ?3, \
                 replacement_count = ?4, is_pyramid_continuation = ?5, \
                 current_loss_percent = ?6 WHERE id = ?1",
                params![
                    existing.id.to_string(),
                    existing.entry_price,
                    serde_json::to_string(&existing.signal_payload)?,
                    existing.replacement_count as i64,
                    existing.is_pyramid_continuation as i64,
                    existing.current_loss_percent,
                ],
            )?;
            (existing, true)
        } else {
            tx.execute(
                &format!(
                    "INSERT INTO queued_signals ({QUEUE_COLUMNS}) VALUES \
                     (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)"
                ),
                params![
                    signal.id.to_string(),
                    signal.user_id.to_string(),
                    signal.exchange,
                    signal.symbol,
                    signal.timeframe as i64,
                    signal.side.as_str(),
                    signal.entry_price,
                    serde_json::to_string(&signal.signal_payload)?,
                    ts(signal.queued_at),
                    signal.replacement_count as i64,
                    signal.priority_score,
                    signal.is_pyramid_continuation as i64,
                    signal.current_loss_percent,
                    signal.priority_explanation,
                    signal.status.as_str(),
                    opt_ts(signal.promoted_at),
                    signal.rejection_reason,
                ],
            )?;
            (signal.clone(), false)
        };

        tx.commit().context("commit enqueue tx")?;
        Ok(result)
    }

    pub async fn get_queued_signal(&self, id: Uuid) -> Result<Option<QueuedSignal>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {QUEUE_COLUMNS} FROM queued_signals WHERE id = ?1"
        ))?;
        Ok(stmt
            .query_row(params![id.to_string()], row_to_signal)
            .optional()?)
    }

    pub async fn queued_signals_for_user(&self, user_id: Uuid) -> Result<Vec<QueuedSignal>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {QUEUE_COLUMNS} FROM queued_signals \
             WHERE user_id = ?1 AND status = 'queued' ORDER BY priority_score DESC, queued_at"
        ))?;
        let rows = stmt.query_map(params![user_id.to_string()], row_to_signal)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Users that currently have queued signals, for the promoter sweep.
    pub async fn users_with_queued_signals(&self) -> Result<Vec<Uuid>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT DISTINCT user_id FROM queued_signals WHERE status = 'queued'",
        )?;
        let rows = stmt.query_map([], |row| {
            let id: String = row.get(0)?;
            Ok(Uuid::parse_str(&id).unwrap_or_default())
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub async fn queue_history_for_user(
        &self,
        user_id: Uuid,
        limit: usize,
    ) -> Result<Vec<QueuedSignal>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {QUEUE_COLUMNS} FROM queued_signals \
             WHERE user_id = ?1 AND status != 'queued' \
             ORDER BY promoted_at DESC, queued_at DESC LIMIT ?2"
        ))?;
        let rows = stmt.query_map(
            params![user_id.to_string(), limit.clamp(1, 500) as i64],
            row_to_signal,
        )?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub async fn update_signal_priority(
        &self,
        id: Uuid,
        priority_score: f64,
        explanation: &str,
    ) -> Result<()> {
        let conn = self.lock().await;
        conn.execute(
            "UPDATE queued_signals SET priority_score = ?2, priority_explanation = ?3 \
             WHERE id = ?1",
            params![id.to_string(), priority_score, explanation],
        )?;
        Ok(())
    }

    pub async fn mark_signal_promoted(&self, id: Uuid) -> Result<()> {
        let conn = self.lock().await;
        conn.execute(
            "UPDATE queued_signals SET status = 'promoted', promoted_at = ?2 WHERE id = ?1",
            params![id.to_string(), ts(Utc::now())],
        )?;
        Ok(())
    }

    pub async fn mark_signal_cancelled(&self, id: Uuid) -> Result<()> {
        let conn = self.lock().await;
        conn.execute(
            "UPDATE queued_signals SET status = 'cancelled' WHERE id = ?1",
            params![id.to_string()],
        )?;
        Ok(())
    }

    pub async fn mark_signal_rejected(&self, id: Uuid, reason: &str) -> Result<()> {
        let conn = self.lock().await;
        conn.execute(
            "UPDATE queued_signals SET status = 'rejected', rejection_reason = ?2 WHERE id = ?1",
            params![id.to_string(), reason],
        )?;
        Ok(())
    }

    /// Cancels pending entries for a symbol, optionally narrowed by timeframe
    /// and side. Used when an exit signal arrives.
    pub async fn cancel_queued_for_symbol(
        &self,
        user_id: Uuid,
        symbol: &str,
        exchange: &str,
        timeframe: Option<u32>,
        side: Option<OrderSide>,
    ) -> Result<usize> {
        use rusqlite::types::Value;

        let conn = self.lock().await;
        let mut sql = String::from(
            "UPDATE queued_signals SET status = 'cancelled' \
             WHERE user_id = ?1 AND symbol = ?2 AND exchange = ?3 AND status = 'queued'",
        );
        let mut args: Vec<Value> = vec![
            Value::Text(user_id.to_string()),
            Value::Text(symbol.to_string()),
            Value::Text(exchange.to_string()),
        ];
        if let Some(tf) = timeframe {
            sql.push_str(&format!(" AND timeframe = ?{}", args.len() + 1));
            args.push(Value::Integer(tf as i64));
        }
        if let Some(side) = side {
            sql.push_str(&format!(" AND side = ?{}", args.len() + 1));
            args.push(Value::Text(side.as_str().to_string()));
        }
        let affected = conn.execute(&sql, rusqlite::params_from_iter(args))?;
        Ok(affected)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::temp_db;
    use super::*;
    use crate::models::{RiskEngineConfig, User};
    use std::collections::HashMap;

    async fn insert_user(db: &EngineDb) -> Uuid {
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

    pub(crate) fn sample_signal(user_id: Uuid, symbol: &str) -> QueuedSignal {
        QueuedSignal {
            id: Uuid::new_v4(),
            user_id,
            exchange: "binance".to_string(),
            symbol: symbol.to_string(),
            timeframe: 60,
            side: OrderSide::Buy,
            entry_price: 50_000.0,
            signal_payload: serde_json::json!({"symbol": symbol}),
            queued_at: Utc::now(),
            replacement_count: 0,
            priority_score: 0.0,
            is_pyramid_continuation: false,
            current_loss_percent: None,
            priority_explanation: None,
            status: QueueStatus::Queued,
            promoted_at: None,
            rejection_reason: None,
        }
    }

    #[tokio::test]
    async fn test_enqueue_then_replace() {
        let (db, _dir) = temp_db();
        let user_id = insert_user(&db).await;

        let signal = sample_signal(user_id, "BTCUSDT");
        let (stored, replaced) = db.enqueue_signal(&signal).await.unwrap();
        assert!(!replaced);
        assert_eq!(stored.replacement_count, 0);

        let mut second = sample_signal(user_id, "BTCUSDT");
        second.entry_price = 49_000.0;
        let (stored, replaced) = db.enqueue_signal(&second).await.unwrap();
        assert!(replaced);
        assert_eq!(stored.replacement_count, 1);
        assert_eq!(stored.id, signal.id);
        assert!((stored.entry_price - 49_000.0).abs() < 1e-9);

        assert_eq!(db.queued_signals_for_user(user_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_for_symbol_scoping() {
        let (db, _dir) = temp_db();
        let user_id = insert_user(&db).await;

        db.enqueue_signal(&sample_signal(user_id, "BTCUSDT")).await.unwrap();
        let mut other_tf = sample_signal(user_id, "BTCUSDT");
        other_tf.timeframe = 240;
        db.enqueue_signal(&other_tf).await.unwrap();
        db.enqueue_signal(&sample_signal(user_id, "ETHUSDT")).await.unwrap();

        let cancelled = db
            .cancel_queued_for_symbol(user_id, "BTCUSDT", "binance", Some(60), None)
            .await
            .unwrap();
        assert_eq!(cancelled, 1);

        let remaining = db.queued_signals_for_user(user_id).await.unwrap();
        assert_eq!(remaining.len(), 2);
    }

    #[tokio::test]
    async fn test_status_transitions() {
        let (db, _dir) = temp_db();
        let user_id = insert_user(&db).await;

        let signal = sample_signal(user_id, "BTCUSDT");
        db.enqueue_signal(&signal).await.unwrap();
        db.mark_signal_promoted(signal.id).await.unwrap();

        let loaded = db.get_queued_signal(signal.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, QueueStatus::Promoted);
        assert!(loaded.promoted_at.is_some());

        let history = db.queue_history_for_user(user_id, 10).await.unwrap();
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn test_rejection_records_reason() {
        let (db, _dir) = temp_db();
        let user_id = insert_user(&db).await;

        let signal = sample_signal(user_id, "BTCUSDT");
        db.enqueue_signal(&signal).await.unwrap();
        db.mark_signal_rejected(signal.id, "plan invalid: notional below minimum")
            .await
            .unwrap();

        let loaded = db.get_queued_signal(signal.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, QueueStatus::Rejected);
        assert!(loaded.rejection_reason.unwrap().contains("notional"));
    }
}
