//! Exchange gateway: one uniform capability set per exchange account.
//!
//! Connectors are created per (user, exchange) from unsealed credentials,
//! used for a bounded unit of work, and closed. Vendor errors are mapped to
//! the engine taxonomy at the adapter boundary; nothing above this module
//! sees a vendor error shape.

pub mod binance;
pub mod bybit;
pub mod mock;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::auth::security::CredentialCipher;
use crate::models::{OrderSide, OrderStatus, OrderType, User};
use crate::precision::PrecisionRules;

pub use binance::BinanceConnector;
pub use bybit::BybitConnector;
pub use mock::MockConnector;

/// Engine-level exchange error taxonomy. Transient classes are retried by
/// the calling loop on its next iteration; fatal classes mark the affected
/// order/group as failed.
#[derive(Debug, Clone, Error)]
pub enum ExchangeError {
    #[error("invalid exchange credentials: {0}")]
    InvalidCredentials(String),
    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),
    #[error("order validation failed: {0}")]
    OrderValidation(String),
    #[error("rate limited: {0}")]
    RateLimit(String),
    #[error("exchange connection error: {0}")]
    Connection(String),
    #[error("slippage exceeded: {0}")]
    SlippageExceeded(String),
    #[error("exchange error: {0}")]
    Generic(String),
}

impl ExchangeError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ExchangeError::RateLimit(_) | ExchangeError::Connection(_))
    }
}

/// Whether `quantity` is denominated in base or quote currency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AmountType {
    Base,
    Quote,
}

/// A single order submission.
#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub symbol: String,
    pub order_type: OrderType,
    pub side: OrderSide,
    pub quantity: f64,
    /// Limit price; reference price for quote-denominated market orders.
    pub price: Option<f64>,
    pub amount_type: AmountType,
}

impl OrderRequest {
    pub fn limit(symbol: &str, side: OrderSide, quantity: f64, price: f64) -> Self {
        Self {
            symbol: symbol.to_string(),
            order_type: OrderType::Limit,
            side,
            quantity,
            price: Some(price),
            amount_type: AmountType::Base,
        }
    }

    pub fn market(symbol: &str, side: OrderSide, quantity: f64) -> Self {
        Self {
            symbol: symbol.to_string(),
            order_type: OrderType::Market,
            side,
            quantity,
            price: None,
            amount_type: AmountType::Base,
        }
    }
}

/// Exchange-side order state, as reported by the venue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExchangeOrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
    Expired,
}

impl ExchangeOrderStatus {
    /// Maps the venue state onto the persisted order state machine.
    pub fn to_order_status(self) -> OrderStatus {
        match self {
            ExchangeOrderStatus::New => OrderStatus::Open,
            ExchangeOrderStatus::PartiallyFilled => OrderStatus::PartiallyFilled,
            ExchangeOrderStatus::Filled => OrderStatus::Filled,
            ExchangeOrderStatus::Cancelled | ExchangeOrderStatus::Expired => OrderStatus::Cancelled,
            ExchangeOrderStatus::Rejected => OrderStatus::Failed,
        }
    }
}

/// Normalized view of an exchange order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeOrder {
    pub order_id: String,
    pub symbol: String,
    pub status: ExchangeOrderStatus,
    pub filled_quantity: f64,
    pub avg_fill_price: f64,
    pub fee: f64,
    pub fee_currency: Option<String>,
}

/// Uniform capability set over one exchange account.
#[async_trait]
pub trait ExchangeConnector: Send + Sync {
    fn exchange_name(&self) -> &'static str;

    async fn place_order(&self, request: &OrderRequest) -> Result<ExchangeOrder, ExchangeError>;

    async fn get_order_status(
        &self,
        order_id: &str,
        symbol: &str,
    ) -> Result<ExchangeOrder, ExchangeError>;

    async fn cancel_order(&self, order_id: &str, symbol: &str) -> Result<(), ExchangeError>;

    async fn get_current_price(&self, symbol: &str) -> Result<f64, ExchangeError>;

    /// symbol → last price for every listed symbol.
    async fn get_all_tickers(&self) -> Result<HashMap<String, f64>, ExchangeError>;

    /// asset → total balance.
    async fn fetch_balance(&self) -> Result<HashMap<String, f64>, ExchangeError>;

    /// asset → free (available) balance.
    async fn fetch_free_balance(&self) -> Result<HashMap<String, f64>, ExchangeError>;

    /// Taker fee rate as a decimal (0.001 = 0.1%).
    async fn get_trading_fee_rate(&self, symbol: Option<&str>) -> Result<f64, ExchangeError>;

    /// Full symbol → precision rule map.
    async fn get_precision_rules(&self) -> Result<HashMap<String, PrecisionRules>, ExchangeError>;

    /// Releases vendor resources. Idempotent.
    async fn close(&self);
}

/// Builds connectors for a user's configured exchanges. The live factory
/// unseals credentials; tests swap in a factory that hands out mocks.
pub trait ConnectorFactory: Send + Sync {
    fn connect(
        &self,
        user: &User,
        exchange: &str,
    ) -> Result<Arc<dyn ExchangeConnector>, ExchangeError>;
}

/// Production factory: unseals the user's API keys and constructs the
/// matching vendor connector.
pub struct LiveConnectorFactory {
    cipher: Arc<CredentialCipher>,
}

impl LiveConnectorFactory {
    pub fn new(cipher: Arc<CredentialCipher>) -> Self {
        Self { cipher }
    }
}

impl ConnectorFactory for LiveConnectorFactory {
    fn connect(
        &self,
        user: &User,
        exchange: &str,
    ) -> Result<Arc<dyn ExchangeConnector>, ExchangeError> {
        let creds = user.exchange_credentials.get(exchange).ok_or_else(|| {
            ExchangeError::InvalidCredentials(format!(
                "user {} has no credentials for {exchange}",
                user.id
            ))
        })?;
        let (api_key, secret_key) = self
            .cipher
            .unseal_keys(&creds.sealed_keys)
            .map_err(|e| ExchangeError::InvalidCredentials(e.to_string()))?;

        match exchange {
            "binance" => Ok(Arc::new(BinanceConnector::new(
                api_key,
                secret_key,
                creds.testnet,
            )?)),
            "bybit" => Ok(Arc::new(BybitConnector::new(
                api_key,
                secret_key,
                creds.testnet,
            )?)),
            "mock" => Ok(Arc::new(MockConnector::new())),
            other => Err(ExchangeError::Generic(format!(
                "unsupported exchange: {other}"
            ))),
        }
    }
}

pub(crate) fn parse_f64(value: &serde_json::Value) -> f64 {
    match value {
        serde_json::Value::String(s) => s.parse().unwrap_or(0.0),
        serde_json::Value::Number(n) => n.as_f64().unwrap_or(0.0),
        _ => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(ExchangeError::RateLimit("429".into()).is_transient());
        assert!(ExchangeError::Connection("timeout".into()).is_transient());
        assert!(!ExchangeError::InvalidCredentials("bad key".into()).is_transient());
        assert!(!ExchangeError::InsufficientFunds("no USDT".into()).is_transient());
        assert!(!ExchangeError::OrderValidation("lot size".into()).is_transient());
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ExchangeOrderStatus::New.to_order_status(),
            OrderStatus::Open
        );
        assert_eq!(
            ExchangeOrderStatus::Filled.to_order_status(),
            OrderStatus::Filled
        );
        assert_eq!(
            ExchangeOrderStatus::Expired.to_order_status(),
            OrderStatus::Cancelled
        );
        assert_eq!(
            ExchangeOrderStatus::Rejected.to_order_status(),
            OrderStatus::Failed
        );
    }
}
