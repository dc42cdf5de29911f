//! User and DCA-configuration repositories.

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};
use uuid::Uuid;

use super::{dt, ts, EngineDb};
use crate::models::{DcaConfiguration, User};

const USER_COLUMNS: &str = "id, username, email, password_hash, is_active, webhook_secret, \
     secure_signals, exchange_credentials, risk_config, created_at";

fn row_to_user(row: &Row<'_>) -> rusqlite::Result<User> {
    let id: String = row.get(0)?;
    let credentials_json: String = row.get(7)?;
    let risk_json: String = row.get(8)?;
    Ok(User {
        id: Uuid::parse_str(&id).unwrap_or_default(),
        username: row.get(1)?,
        email: row.get(2)?,
        password_hash: row.get(3)?,
        is_active: row.get::<_, i64>(4)? != 0,
        webhook_secret: row.get(5)?,
        secure_signals: row.get::<_, i64>(6)? != 0,
        exchange_credentials: serde_json::from_str(&credentials_json).unwrap_or_default(),
        risk_config: serde_json::from_str(&risk_json).unwrap_or_default(),
        created_at: dt(row.get(9)?),
    })
}

impl EngineDb {
    pub async fn create_user(&self, user: &User) -> Result<()> {
        let conn = self.lock().await;
        conn.execute(
            "INSERT INTO users (id, username, email, password_hash, is_active, webhook_secret, \
             secure_signals, exchange_credentials, risk_config, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                user.id.to_string(),
                user.username,
                user.email,
                user.password_hash,
                user.is_active as i64,
                user.webhook_secret,
                user.secure_signals as i64,
                serde_json::to_string(&user.exchange_credentials)?,
                serde_json::to_string(&user.risk_config)?,
                ts(user.created_at),
            ],
        )
        .context("insert user")?;
        Ok(())
    }

    pub async fn get_user(&self, id: Uuid) -> Result<Option<User>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE id = ?1"
        ))?;
        Ok(stmt
            .query_row(params![id.to_string()], row_to_user)
            .optional()?)
    }

    pub async fn get_user_by_username(&self, username: &str) -> Result<Option<User>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE username = ?1"
        ))?;
        Ok(stmt.query_row(params![username], row_to_user).optional()?)
    }

    /// Settings-surface update: everything but identity and password.
    pub async fn update_user(&self, user: &User) -> Result<()> {
        let conn = self.lock().await;
        conn.execute(
            "UPDATE users SET email = ?2, is_active = ?3, webhook_secret = ?4, \
             secure_signals = ?5, exchange_credentials = ?6, risk_config = ?7 \
             WHERE id = ?1",
            params![
                user.id.to_string(),
                user.email,
                user.is_active as i64,
                user.webhook_secret,
                user.secure_signals as i64,
                serde_json::to_string(&user.exchange_credentials)?,
                serde_json::to_string(&user.risk_config)?,
            ],
        )
        .context("update user")?;
        Ok(())
    }
}

const DCA_CONFIG_COLUMNS: &str =
    "id, user_id, pair, timeframe, exchange, grid, created_at, updated_at";

fn row_to_dca_config(row: &Row<'_>) -> rusqlite::Result<DcaConfiguration> {
    let id: String = row.get(0)?;
    let user_id: String = row.get(1)?;
    let grid_json: String = row.get(5)?;
    Ok(DcaConfiguration {
        id: Uuid::parse_str(&id).unwrap_or_default(),
        user_id: Uuid::parse_str(&user_id).unwrap_or_default(),
        pair: row.get(2)?,
        timeframe: row.get::<_, i64>(3)? as u32,
        exchange: row.get(4)?,
        grid: serde_json::from_str(&grid_json).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                5,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })?,
        created_at: dt(row.get(6)?),
        updated_at: dt(row.get(7)?),
    })
}

impl EngineDb {
    /// Insert-or-replace on the (user, pair, timeframe, exchange) natural key.
    pub async fn upsert_dca_config(&self, config: &DcaConfiguration) -> Result<()> {
        let conn = self.lock().await;
        conn.execute(
            "INSERT INTO dca_configurations \
             (id, user_id, pair, timeframe, exchange, grid, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8) \
             ON CONFLICT(user_id, pair, timeframe, exchange) DO UPDATE SET \
                grid = excluded.grid, \
                updated_at = excluded.updated_at",
            params![
                config.id.to_string(),
                config.user_id.to_string(),
                config.pair,
                config.timeframe as i64,
                config.exchange,
                serde_json::to_string(&config.grid)?,
                ts(config.created_at),
                ts(Utc::now()),
            ],
        )
        .context("upsert dca config")?;
        Ok(())
    }

    pub async fn get_dca_config(
        &self,
        user_id: Uuid,
        pair: &str,
        timeframe: u32,
        exchange: &str,
    ) -> Result<Option<DcaConfiguration>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {DCA_CONFIG_COLUMNS} FROM dca_configurations \
             WHERE user_id = ?1 AND pair = ?2 AND timeframe = ?3 AND exchange = ?4"
        ))?;
        Ok(stmt
            .query_row(
                params![user_id.to_string(), pair, timeframe as i64, exchange],
                row_to_dca_config,
            )
            .optional()?)
    }

    pub async fn get_dca_config_by_id(
        &self,
        id: Uuid,
        user_id: Uuid,
    ) -> Result<Option<DcaConfiguration>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {DCA_CONFIG_COLUMNS} FROM dca_configurations WHERE id = ?1 AND user_id = ?2"
        ))?;
        Ok(stmt
            .query_row(params![id.to_string(), user_id.to_string()], row_to_dca_config)
            .optional()?)
    }

    pub async fn list_dca_configs(&self, user_id: Uuid) -> Result<Vec<DcaConfiguration>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {DCA_CONFIG_COLUMNS} FROM dca_configurations \
             WHERE user_id = ?1 ORDER BY pair, timeframe"
        ))?;
        let rows = stmt.query_map(params![user_id.to_string()], row_to_dca_config)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub async fn delete_dca_config(&self, id: Uuid, user_id: Uuid) -> Result<bool> {
        let conn = self.lock().await;
        let affected = conn.execute(
            "DELETE FROM dca_configurations WHERE id = ?1 AND user_id = ?2",
            params![id.to_string(), user_id.to_string()],
        )?;
        Ok(affected > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::temp_db;
    use crate::models::{
        DcaConfiguration, DcaGridConfig, DcaLevel, RiskEngineConfig, TpMode, User,
    };
    use chrono::Utc;
    use std::collections::HashMap;
    use uuid::Uuid;

    pub(crate) fn sample_user() -> User {
        User {
            id: Uuid::new_v4(),
            username: format!("trader-{}", Uuid::new_v4()),
            email: format!("{}@example.com", Uuid::new_v4()),
            password_hash: "hash".to_string(),
            is_active: true,
            webhook_secret: Some("whsec".to_string()),
            secure_signals: true,
            exchange_credentials: HashMap::new(),
            risk_config: RiskEngineConfig::default(),
            created_at: Utc::now(),
        }
    }

    fn sample_grid() -> DcaGridConfig {
        DcaGridConfig {
            levels: vec![DcaLevel {
                gap_percent: 0.0,
                weight_percent: 100.0,
                tp_percent: 1.0,
            }],
            tp_mode: TpMode::PerLeg,
            tp_aggregate_percent: 0.0,
            max_pyramids: 5,
            pyramid_level_overrides: HashMap::new(),
            base_capital_usd: 1000.0,
            pyramid_capital_overrides: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn test_user_roundtrip() {
        let (db, _dir) = temp_db();
        let user = sample_user();
        db.create_user(&user).await.unwrap();

        let loaded = db.get_user(user.id).await.unwrap().unwrap();
        assert_eq!(loaded.username, user.username);
        assert_eq!(loaded.webhook_secret, user.webhook_secret);
        assert!(loaded.secure_signals);

        let by_name = db.get_user_by_username(&user.username).await.unwrap();
        assert!(by_name.is_some());
    }

    #[tokio::test]
    async fn test_dca_config_upsert_is_idempotent_on_natural_key() {
        let (db, _dir) = temp_db();
        let user = sample_user();
        db.create_user(&user).await.unwrap();

        let mut config = DcaConfiguration {
            id: Uuid::new_v4(),
            user_id: user.id,
            pair: "BTCUSDT".to_string(),
            timeframe: 60,
            exchange: "binance".to_string(),
            grid: sample_grid(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        db.upsert_dca_config(&config).await.unwrap();

        config.id = Uuid::new_v4();
        config.grid.base_capital_usd = 2000.0;
        db.upsert_dca_config(&config).await.unwrap();

        let configs = db.list_dca_configs(user.id).await.unwrap();
        assert_eq!(configs.len(), 1);
        assert_eq!(configs[0].grid.base_capital_usd, 2000.0);
    }
}
