//! Risk-action audit log repository.

use anyhow::Result;
use rusqlite::{params, Row};
use uuid::Uuid;

use super::{dt, ts, EngineDb};
use crate::models::{RiskAction, RiskActionType};

const ACTION_COLUMNS: &str = "id, action_type, loser_group_id, winner_group_ids, quantity, \
     price, pnl_usd, duration_seconds, details, created_at";

fn row_to_action(row: &Row<'_>) -> rusqlite::Result<RiskAction> {
    let id: String = row.get(0)?;
    let action_type: String = row.get(1)?;
    let loser: Option<String> = row.get(2)?;
    let winners: String = row.get(3)?;
    Ok(RiskAction {
        id: Uuid::parse_str(&id).unwrap_or_default(),
        action_type: RiskActionType::parse(&action_type).unwrap_or(RiskActionType::EngineClose),
        loser_group_id: loser.and_then(|s| Uuid::parse_str(&s).ok()),
        winner_group_ids: serde_json::from_str(&winners).unwrap_or_default(),
        quantity: row.get(4)?,
        price: row.get(5)?,
        pnl_usd: row.get(6)?,
        duration_seconds: row.get(7)?,
        details: row.get(8)?,
        created_at: dt(row.get(9)?),
    })
}

impl EngineDb {
    pub async fn insert_risk_action(&self, action: &RiskAction) -> Result<()> {
        let conn = self.lock().await;
        conn.execute(
            &format!(
                "INSERT INTO risk_actions ({ACTION_COLUMNS}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
            ),
            params![
                action.id.to_string(),
                action.action_type.as_str(),
                action.loser_group_id.map(|id| id.to_string()),
                serde_json::to_string(&action.winner_group_ids)?,
                action.quantity,
                action.price,
                action.pnl_usd,
                action.duration_seconds,
                action.details,
                ts(action.created_at),
            ],
        )?;
        Ok(())
    }

    pub async fn list_risk_actions(
        &self,
        group_id: Option<Uuid>,
        limit: usize,
    ) -> Result<Vec<RiskAction>> {
        let conn = self.lock().await;
        let limit = limit.clamp(1, 1000) as i64;
        let mut out = Vec::new();
        if let Some(group_id) = group_id {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {ACTION_COLUMNS} FROM risk_actions \
                 WHERE loser_group_id = ?1 OR winner_group_ids LIKE ?2 \
                 ORDER BY created_at DESC LIMIT ?3"
            ))?;
            let pattern = format!("%{}%", group_id);
            let rows = stmt.query_map(
                params![group_id.to_string(), pattern, limit],
                row_to_action,
            )?;
            out.extend(rows.filter_map(|r| r.ok()));
        } else {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {ACTION_COLUMNS} FROM risk_actions ORDER BY created_at DESC LIMIT ?1"
            ))?;
            let rows = stmt.query_map(params![limit], row_to_action)?;
            out.extend(rows.filter_map(|r| r.ok()));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::temp_db;
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn test_action_roundtrip() {
        let (db, _dir) = temp_db();
        let loser = Uuid::new_v4();
        let winner = Uuid::new_v4();
        let action = RiskAction {
            id: Uuid::new_v4(),
            action_type: RiskActionType::HedgeClose,
            loser_group_id: Some(loser),
            winner_group_ids: vec![winner],
            quantity: 0.02,
            price: 50_000.0,
            pnl_usd: 30.0,
            duration_seconds: Some(3_600),
            details: Some("offset of deepest loser".to_string()),
            created_at: Utc::now(),
        };
        db.insert_risk_action(&action).await.unwrap();

        let all = db.list_risk_actions(None, 10).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].action_type, RiskActionType::HedgeClose);
        assert_eq!(all[0].winner_group_ids, vec![winner]);

        let by_loser = db.list_risk_actions(Some(loser), 10).await.unwrap();
        assert_eq!(by_loser.len(), 1);
        let by_winner = db.list_risk_actions(Some(winner), 10).await.unwrap();
        assert_eq!(by_winner.len(), 1);
    }
}
