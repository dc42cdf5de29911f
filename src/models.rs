//! Domain model: configuration, entities, and the webhook payload.
//!
//! Every persisted entity lives here as a plain value record; repository
//! functions in `store/` map them to rows. No active-record behavior.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Application configuration, loaded once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub secret_key: String,
    pub encryption_key: String,
    pub cors_origins: Vec<String>,
    pub environment: String,
    pub log_level: String,
    pub log_file_path: String,
    pub port: u16,
    pub fill_monitor_interval_secs: u64,
    pub risk_engine_interval_secs: u64,
    pub queue_promoter_interval_secs: u64,
}

impl Config {
    /// Reads configuration from the environment. Missing required variables
    /// fail fast so a misconfigured deployment never trades.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let mut missing = Vec::new();
        let database_url = require_env("DATABASE_URL", &mut missing);
        let secret_key = require_env("SECRET_KEY", &mut missing);
        let encryption_key = require_env("ENCRYPTION_KEY", &mut missing);
        if !missing.is_empty() {
            anyhow::bail!(
                "Missing required environment variables: {}",
                missing.join(", ")
            );
        }

        let cors_origins = std::env::var("CORS_ORIGINS")
            .unwrap_or_else(|_| "http://localhost:3000".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(Self {
            database_url,
            secret_key,
            encryption_key,
            cors_origins,
            environment: std::env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string()),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            log_file_path: std::env::var("LOG_FILE_PATH")
                .unwrap_or_else(|_| "logs/app.log".to_string()),
            port: env_parsed("PORT", 8080),
            fill_monitor_interval_secs: env_parsed("FILL_MONITOR_INTERVAL_SECS", 3),
            risk_engine_interval_secs: env_parsed("RISK_ENGINE_INTERVAL_SECS", 30),
            queue_promoter_interval_secs: env_parsed("QUEUE_PROMOTER_INTERVAL_SECS", 10),
        })
    }
}

fn require_env(name: &str, missing: &mut Vec<String>) -> String {
    match std::env::var(name) {
        Ok(v) if !v.trim().is_empty() => v,
        _ => {
            missing.push(name.to_string());
            String::new()
        }
    }
}

fn env_parsed<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Position group lifecycle.
///
/// `waiting → partially_filled → active → closing → closed`, with `failed`
/// reachable from `waiting`/`partially_filled` when every entry is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupStatus {
    Waiting,
    Live,
    PartiallyFilled,
    Active,
    Closing,
    Closed,
    Failed,
}

impl GroupStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GroupStatus::Waiting => "waiting",
            GroupStatus::Live => "live",
            GroupStatus::PartiallyFilled => "partially_filled",
            GroupStatus::Active => "active",
            GroupStatus::Closing => "closing",
            GroupStatus::Closed => "closed",
            GroupStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "waiting" => Some(GroupStatus::Waiting),
            "live" => Some(GroupStatus::Live),
            "partially_filled" => Some(GroupStatus::PartiallyFilled),
            "active" => Some(GroupStatus::Active),
            "closing" => Some(GroupStatus::Closing),
            "closed" => Some(GroupStatus::Closed),
            "failed" => Some(GroupStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, GroupStatus::Closed | GroupStatus::Failed)
    }

    /// Statuses that occupy an execution-pool slot.
    pub fn counts_toward_pool(&self) -> bool {
        matches!(
            self,
            GroupStatus::Live
                | GroupStatus::PartiallyFilled
                | GroupStatus::Active
                | GroupStatus::Closing
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TpMode {
    PerLeg,
    Aggregate,
    Hybrid,
    PyramidAggregate,
}

impl TpMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TpMode::PerLeg => "per_leg",
            TpMode::Aggregate => "aggregate",
            TpMode::Hybrid => "hybrid",
            TpMode::PyramidAggregate => "pyramid_aggregate",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "per_leg" => Some(TpMode::PerLeg),
            "aggregate" => Some(TpMode::Aggregate),
            "hybrid" => Some(TpMode::Hybrid),
            "pyramid_aggregate" => Some(TpMode::PyramidAggregate),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "buy",
            OrderSide::Sell => "sell",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "buy" => Some(OrderSide::Buy),
            "sell" => Some(OrderSide::Sell),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderType {
    Limit,
    Market,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Limit => "LIMIT",
            OrderType::Market => "MARKET",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "LIMIT" => Some(OrderType::Limit),
            "MARKET" => Some(OrderType::Market),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Open,
    PartiallyFilled,
    Filled,
    Cancelled,
    Failed,
    TriggerPending,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Open => "open",
            OrderStatus::PartiallyFilled => "partially_filled",
            OrderStatus::Filled => "filled",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Failed => "failed",
            OrderStatus::TriggerPending => "trigger_pending",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(OrderStatus::Pending),
            "open" => Some(OrderStatus::Open),
            "partially_filled" => Some(OrderStatus::PartiallyFilled),
            "filled" => Some(OrderStatus::Filled),
            "cancelled" => Some(OrderStatus::Cancelled),
            "failed" => Some(OrderStatus::Failed),
            "trigger_pending" => Some(OrderStatus::TriggerPending),
            _ => None,
        }
    }

    pub fn is_live_on_exchange(&self) -> bool {
        matches!(self, OrderStatus::Open | OrderStatus::PartiallyFilled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PyramidStatus {
    Pending,
    Filled,
    Closed,
}

impl PyramidStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PyramidStatus::Pending => "pending",
            PyramidStatus::Filled => "filled",
            PyramidStatus::Closed => "closed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(PyramidStatus::Pending),
            "filled" => Some(PyramidStatus::Filled),
            "closed" => Some(PyramidStatus::Closed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Queued,
    Promoted,
    Cancelled,
    Rejected,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Queued => "queued",
            QueueStatus::Promoted => "promoted",
            QueueStatus::Cancelled => "cancelled",
            QueueStatus::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(QueueStatus::Queued),
            "promoted" => Some(QueueStatus::Promoted),
            "cancelled" => Some(QueueStatus::Cancelled),
            "rejected" => Some(QueueStatus::Rejected),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskActionType {
    HedgeClose,
    PartialClose,
    FullClose,
    ManualClose,
    EngineClose,
    TpHit,
    HedgeFailed,
}

impl RiskActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskActionType::HedgeClose => "hedge_close",
            RiskActionType::PartialClose => "partial_close",
            RiskActionType::FullClose => "full_close",
            RiskActionType::ManualClose => "manual_close",
            RiskActionType::EngineClose => "engine_close",
            RiskActionType::TpHit => "tp_hit",
            RiskActionType::HedgeFailed => "hedge_failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "hedge_close" => Some(RiskActionType::HedgeClose),
            "partial_close" => Some(RiskActionType::PartialClose),
            "full_close" => Some(RiskActionType::FullClose),
            "manual_close" => Some(RiskActionType::ManualClose),
            "engine_close" => Some(RiskActionType::EngineClose),
            "tp_hit" => Some(RiskActionType::TpHit),
            "hedge_failed" => Some(RiskActionType::HedgeFailed),
            _ => None,
        }
    }
}

/// One DCA ladder rung: gap below base, capital weight, and per-leg TP.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DcaLevel {
    pub gap_percent: f64,
    pub weight_percent: f64,
    pub tp_percent: f64,
}

/// Per-(pair, timeframe, exchange) grid configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DcaGridConfig {
    pub levels: Vec<DcaLevel>,
    pub tp_mode: TpMode,
    #[serde(default)]
    pub tp_aggregate_percent: f64,
    #[serde(default = "default_max_pyramids")]
    pub max_pyramids: u32,
    /// Per-pyramid level overrides, keyed by pyramid index.
    #[serde(default)]
    pub pyramid_level_overrides: HashMap<u32, Vec<DcaLevel>>,
    /// Capital per pyramid in quote currency; `base_capital_usd` is the default.
    pub base_capital_usd: f64,
    #[serde(default)]
    pub pyramid_capital_overrides: HashMap<u32, f64>,
}

fn default_max_pyramids() -> u32 {
    5
}

impl DcaGridConfig {
    pub fn levels_for_pyramid(&self, pyramid_index: u32) -> &[DcaLevel] {
        self.pyramid_level_overrides
            .get(&pyramid_index)
            .map(|v| v.as_slice())
            .unwrap_or(&self.levels)
    }

    pub fn capital_for_pyramid(&self, pyramid_index: u32) -> f64 {
        self.pyramid_capital_overrides
            .get(&pyramid_index)
            .copied()
            .unwrap_or(self.base_capital_usd)
    }

    /// Weights must sum to 100 (within rounding noise) for every level set.
    pub fn validate(&self) -> anyhow::Result<()> {
        validate_levels(&self.levels)?;
        for (idx, levels) in &self.pyramid_level_overrides {
            validate_levels(levels).map_err(|e| anyhow::anyhow!("pyramid {idx} override: {e}"))?;
        }
        if self.base_capital_usd <= 0.0 {
            anyhow::bail!("base_capital_usd must be positive");
        }
        if self.max_pyramids == 0 {
            anyhow::bail!("max_pyramids must be at least 1");
        }
        Ok(())
    }
}

fn validate_levels(levels: &[DcaLevel]) -> anyhow::Result<()> {
    if levels.is_empty() {
        anyhow::bail!("at least one DCA level is required");
    }
    let weight_sum: f64 = levels.iter().map(|l| l.weight_percent).sum();
    if (weight_sum - 100.0).abs() > 1e-6 {
        anyhow::bail!("level weights must sum to 100, got {weight_sum}");
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerStartCondition {
    AfterAllDcaFilled,
    AfterFirstFill,
}

/// Per-user risk engine configuration, stored as JSON on the user row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskEngineConfig {
    pub max_open_positions_global: u32,
    pub loss_threshold_percent: f64,
    pub timer_start_condition: TimerStartCondition,
    pub post_full_wait_minutes: i64,
    pub max_winners_to_combine: usize,
    pub use_trade_age_filter: bool,
    pub age_threshold_minutes: i64,
    pub require_full_pyramids: bool,
    pub reset_timer_on_replacement: bool,
    pub partial_close_enabled: bool,
    pub min_close_notional: f64,
}

impl Default for RiskEngineConfig {
    fn default() -> Self {
        Self {
            max_open_positions_global: 10,
            loss_threshold_percent: -5.0,
            timer_start_condition: TimerStartCondition::AfterAllDcaFilled,
            post_full_wait_minutes: 60,
            max_winners_to_combine: 3,
            use_trade_age_filter: false,
            age_threshold_minutes: 120,
            require_full_pyramids: true,
            reset_timer_on_replacement: false,
            partial_close_enabled: true,
            min_close_notional: 10.0,
        }
    }
}

/// Sealed API credentials plus connection flags for one exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeCredentials {
    pub sealed_keys: String,
    #[serde(default)]
    pub testnet: bool,
    #[serde(default = "default_account_type")]
    pub account_type: String,
}

fn default_account_type() -> String {
    "UNIFIED".to_string()
}

/// A registered user of the engine.
#[derive(Debug, Clone)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub is_active: bool,
    pub webhook_secret: Option<String>,
    /// When false, webhook secret validation is skipped.
    pub secure_signals: bool,
    /// exchange name → sealed credentials.
    pub exchange_credentials: HashMap<String, ExchangeCredentials>,
    pub risk_config: RiskEngineConfig,
    pub created_at: DateTime<Utc>,
}

/// Saved grid configuration, unique per (user, pair, timeframe, exchange).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DcaConfiguration {
    pub id: Uuid,
    pub user_id: Uuid,
    pub pair: String,
    pub timeframe: u32,
    pub exchange: String,
    pub grid: DcaGridConfig,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The atomic tradable unit for one (user, symbol, timeframe, side, exchange).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionGroup {
    pub id: Uuid,
    pub user_id: Uuid,
    pub exchange: String,
    pub symbol: String,
    pub timeframe: u32,
    pub side: OrderSide,
    pub status: GroupStatus,
    pub pyramid_count: u32,
    pub max_pyramids: u32,
    pub total_dca_legs: u32,
    pub filled_dca_legs: u32,
    pub base_entry_price: f64,
    pub weighted_avg_entry: f64,
    pub total_invested_usd: f64,
    pub total_filled_quantity: f64,
    pub unrealized_pnl_usd: f64,
    pub unrealized_pnl_percent: f64,
    pub realized_pnl_usd: f64,
    pub total_entry_fees_usd: f64,
    pub total_exit_fees_usd: f64,
    pub total_hedged_qty: f64,
    pub total_hedged_value_usd: f64,
    pub tp_mode: TpMode,
    pub tp_aggregate_percent: f64,
    /// Venue id of the rolling aggregate TP (aggregate/hybrid modes).
    pub aggregate_tp_order_id: Option<String>,
    pub risk_timer_start: Option<DateTime<Utc>>,
    pub risk_timer_expires: Option<DateTime<Utc>>,
    pub risk_eligible: bool,
    pub risk_blocked: bool,
    pub risk_skip_once: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub closing_started_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
}

/// One full DCA plan inside a group, ordered by `pyramid_index`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pyramid {
    pub id: Uuid,
    pub group_id: Uuid,
    pub pyramid_index: u32,
    pub entry_price: f64,
    pub status: PyramidStatus,
    /// Snapshot of the levels this pyramid was planned with.
    pub dca_config: Vec<DcaLevel>,
    pub closed_at: Option<DateTime<Utc>>,
    pub exit_price: Option<f64>,
    pub realized_pnl_usd: Option<f64>,
    pub total_quantity: Option<f64>,
    pub created_at: DateTime<Utc>,
}

/// Reserved leg index for synthetic exit rows (market sells, TP executions).
pub const SYNTHETIC_EXIT_LEG: u32 = 999;

/// A single order leg. Entry legs are buys; exits (including synthetic rows
/// with `leg_index == SYNTHETIC_EXIT_LEG`) are sells.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DcaOrder {
    pub id: Uuid,
    pub group_id: Uuid,
    pub pyramid_id: Uuid,
    pub leg_index: u32,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub price: f64,
    pub quantity: f64,
    pub quote_amount: Option<f64>,
    pub status: OrderStatus,
    pub filled_quantity: f64,
    pub avg_fill_price: f64,
    pub fee: f64,
    pub fee_currency: Option<String>,
    pub tp_percent: Option<f64>,
    pub tp_price: Option<f64>,
    pub tp_order_id: Option<String>,
    pub tp_hit: bool,
    pub tp_executed_at: Option<DateTime<Utc>>,
    pub exchange_order_id: Option<String>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub filled_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl DcaOrder {
    pub fn is_entry(&self) -> bool {
        self.side == OrderSide::Buy
    }
}

/// A deferred admission request waiting for an execution-pool slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedSignal {
    pub id: Uuid,
    pub user_id: Uuid,
    pub exchange: String,
    pub symbol: String,
    pub timeframe: u32,
    pub side: OrderSide,
    pub entry_price: f64,
    pub signal_payload: serde_json::Value,
    pub queued_at: DateTime<Utc>,
    pub replacement_count: u32,
    pub priority_score: f64,
    pub is_pyramid_continuation: bool,
    pub current_loss_percent: Option<f64>,
    pub priority_explanation: Option<String>,
    pub status: QueueStatus,
    pub promoted_at: Option<DateTime<Utc>>,
    pub rejection_reason: Option<String>,
}

/// Audit record for risk-engine and operator close decisions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskAction {
    pub id: Uuid,
    pub action_type: RiskActionType,
    pub loser_group_id: Option<Uuid>,
    pub winner_group_ids: Vec<Uuid>,
    pub quantity: f64,
    pub price: f64,
    pub pnl_usd: f64,
    pub duration_seconds: Option<i64>,
    pub details: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// TradingView-style strategy fields of the webhook body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingViewData {
    pub exchange: String,
    pub symbol: String,
    pub timeframe: u32,
    pub action: String,
    pub market_position: String,
    #[serde(default)]
    pub market_position_size: f64,
    #[serde(default)]
    pub prev_market_position: String,
    #[serde(default)]
    pub prev_market_position_size: f64,
    pub entry_price: f64,
    #[serde(default)]
    pub close_price: f64,
    #[serde(default)]
    pub order_size: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyInfo {
    pub trade_id: String,
    #[serde(default)]
    pub alert_name: String,
    #[serde(default)]
    pub alert_message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionIntent {
    /// signal | exit | reduce | reverse
    #[serde(rename = "type")]
    pub intent_type: String,
    pub side: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskInfo {
    #[serde(default)]
    pub stop_loss: Option<f64>,
    #[serde(default)]
    pub take_profit: Option<f64>,
    pub max_slippage_percent: f64,
}

/// The validated webhook body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookPayload {
    pub user_id: Uuid,
    pub secret: String,
    pub source: String,
    pub timestamp: DateTime<Utc>,
    pub tv: TradingViewData,
    pub strategy_info: StrategyInfo,
    pub execution_intent: ExecutionIntent,
    pub risk: RiskInfo,
}

impl WebhookPayload {
    /// Rejects bodies carrying unreplaced template placeholders.
    pub fn check_placeholders(&self) -> anyhow::Result<()> {
        for v in [
            &self.tv.exchange,
            &self.tv.symbol,
            &self.tv.action,
            &self.tv.market_position,
        ] {
            if v.contains("{{") || v.contains("}}") {
                anyhow::bail!("unreplaced placeholder in field value: {v}");
            }
        }
        Ok(())
    }

    pub fn is_exit(&self) -> bool {
        self.execution_intent.intent_type.eq_ignore_ascii_case("exit")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_status_roundtrip() {
        for s in [
            GroupStatus::Waiting,
            GroupStatus::Live,
            GroupStatus::PartiallyFilled,
            GroupStatus::Active,
            GroupStatus::Closing,
            GroupStatus::Closed,
            GroupStatus::Failed,
        ] {
            assert_eq!(GroupStatus::parse(s.as_str()), Some(s));
        }
        assert!(GroupStatus::parse("bogus").is_none());
    }

    #[test]
    fn test_pool_counting_statuses() {
        assert!(GroupStatus::Live.counts_toward_pool());
        assert!(GroupStatus::PartiallyFilled.counts_toward_pool());
        assert!(GroupStatus::Active.counts_toward_pool());
        assert!(GroupStatus::Closing.counts_toward_pool());
        assert!(!GroupStatus::Waiting.counts_toward_pool());
        assert!(!GroupStatus::Closed.counts_toward_pool());
        assert!(!GroupStatus::Failed.counts_toward_pool());
    }

    #[test]
    fn test_grid_config_weight_validation() {
        let mut cfg = DcaGridConfig {
            levels: vec![
                DcaLevel {
                    gap_percent: 0.0,
                    weight_percent: 50.0,
                    tp_percent: 1.0,
                },
                DcaLevel {
                    gap_percent: -1.0,
                    weight_percent: 50.0,
                    tp_percent: 1.0,
                },
            ],
            tp_mode: TpMode::PerLeg,
            tp_aggregate_percent: 0.0,
            max_pyramids: 5,
            pyramid_level_overrides: HashMap::new(),
            base_capital_usd: 1000.0,
            pyramid_capital_overrides: HashMap::new(),
        };
        assert!(cfg.validate().is_ok());

        cfg.levels[0].weight_percent = 40.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_pyramid_overrides_resolution() {
        let override_levels = vec![DcaLevel {
            gap_percent: 0.0,
            weight_percent: 100.0,
            tp_percent: 2.0,
        }];
        let cfg = DcaGridConfig {
            levels: vec![DcaLevel {
                gap_percent: 0.0,
                weight_percent: 100.0,
                tp_percent: 1.0,
            }],
            tp_mode: TpMode::PerLeg,
            tp_aggregate_percent: 0.0,
            max_pyramids: 3,
            pyramid_level_overrides: HashMap::from([(1, override_levels.clone())]),
            base_capital_usd: 500.0,
            pyramid_capital_overrides: HashMap::from([(1, 250.0)]),
        };

        assert_eq!(cfg.levels_for_pyramid(0)[0].tp_percent, 1.0);
        assert_eq!(cfg.levels_for_pyramid(1)[0].tp_percent, 2.0);
        assert_eq!(cfg.capital_for_pyramid(0), 500.0);
        assert_eq!(cfg.capital_for_pyramid(1), 250.0);
    }

    #[test]
    fn test_placeholder_detection() {
        let payload: WebhookPayload = serde_json::from_value(serde_json::json!({
            "user_id": Uuid::new_v4(),
            "secret": "s",
            "source": "tradingview",
            "timestamp": Utc::now(),
            "tv": {
                "exchange": "binance",
                "symbol": "{{ticker}}",
                "timeframe": 60,
                "action": "buy",
                "market_position": "long",
                "entry_price": 100.0
            },
            "strategy_info": {"trade_id": "t1"},
            "execution_intent": {"type": "signal", "side": "buy"},
            "risk": {"max_slippage_percent": 0.5}
        }))
        .unwrap();
        assert!(payload.check_placeholders().is_err());
    }
}
