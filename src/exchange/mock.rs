//! Deterministic in-memory connector for tests and dry runs.
//!
//! Market orders fill immediately at the scripted price; limit orders rest
//! until the test fills or cancels them. Errors can be injected per call.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{
    AmountType, ExchangeConnector, ExchangeError, ExchangeOrder, ExchangeOrderStatus, OrderRequest,
};
use crate::models::{OrderSide, OrderType};
use crate::precision::PrecisionRules;

#[derive(Debug, Clone)]
pub struct MockOrder {
    pub request: OrderRequest,
    pub order: ExchangeOrder,
}

#[derive(Default)]
struct MockState {
    precision: HashMap<String, PrecisionRules>,
    prices: HashMap<String, f64>,
    free_balances: HashMap<String, f64>,
    orders: HashMap<String, MockOrder>,
    order_sequence: Vec<String>,
    injected_place_errors: Vec<ExchangeError>,
    fee_rate: f64,
}

pub struct MockConnector {
    state: Mutex<MockState>,
    next_id: AtomicU64,
    precision_fetches: AtomicU64,
}

impl Default for MockConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl MockConnector {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                fee_rate: 0.001,
                ..Default::default()
            }),
            next_id: AtomicU64::new(1),
            precision_fetches: AtomicU64::new(0),
        }
    }

    pub fn set_precision(&self, symbol: &str, rules: PrecisionRules) {
        self.state.lock().precision.insert(symbol.to_string(), rules);
    }

    pub fn set_price(&self, symbol: &str, price: f64) {
        self.state.lock().prices.insert(symbol.to_string(), price);
    }

    pub fn set_free_balance(&self, asset: &str, amount: f64) {
        self.state
            .lock()
            .free_balances
            .insert(asset.to_string(), amount);
    }

    pub fn set_fee_rate(&self, rate: f64) {
        self.state.lock().fee_rate = rate;
    }

    /// Queues an error returned by the next `place_order` call.
    pub fn fail_next_place(&self, error: ExchangeError) {
        self.state.lock().injected_place_errors.push(error);
    }

    /// Scripts a (partial) fill of a resting order.
    pub fn fill_order(&self, order_id: &str, filled_quantity: f64, fill_price: f64) {
        let mut state = self.state.lock();
        let fee_rate = state.fee_rate;
        if let Some(entry) = state.orders.get_mut(order_id) {
            entry.order.filled_quantity = filled_quantity;
            entry.order.avg_fill_price = fill_price;
            entry.order.fee = filled_quantity * fill_price * fee_rate;
            entry.order.fee_currency = Some("USDT".to_string());
            entry.order.status = if filled_quantity + 1e-12 >= entry.request.quantity {
                ExchangeOrderStatus::Filled
            } else {
                ExchangeOrderStatus::PartiallyFilled
            };
        }
    }

    pub fn precision_fetch_count(&self) -> u64 {
        self.precision_fetches.load(Ordering::SeqCst)
    }

    /// All orders placed on this connector, in submission order.
    pub fn placed_orders(&self) -> Vec<MockOrder> {
        let state = self.state.lock();
        state
            .order_sequence
            .iter()
            .filter_map(|id| state.orders.get(id).cloned())
            .collect()
    }

    pub fn order(&self, order_id: &str) -> Option<MockOrder> {
        self.state.lock().orders.get(order_id).cloned()
    }
}

#[async_trait]
impl ExchangeConnector for MockConnector {
    fn exchange_name(&self) -> &'static str {
        "mock"
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<ExchangeOrder, ExchangeError> {
        let mut state = self.state.lock();
        if let Some(err) = state.injected_place_errors.pop() {
            return Err(err);
        }

        let order_id = format!("mock-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let reference_price = request
            .price
            .or_else(|| state.prices.get(&request.symbol).copied())
            .unwrap_or(0.0);

        let mut order = ExchangeOrder {
            order_id: order_id.clone(),
            symbol: request.symbol.clone(),
            status: ExchangeOrderStatus::New,
            filled_quantity: 0.0,
            avg_fill_price: 0.0,
            fee: 0.0,
            fee_currency: None,
        };

        if request.order_type == OrderType::Market {
            let market_price = state
                .prices
                .get(&request.symbol)
                .copied()
                .unwrap_or(reference_price);
            let base_qty = match request.amount_type {
                AmountType::Base => request.quantity,
                AmountType::Quote if market_price > 0.0 => request.quantity / market_price,
                AmountType::Quote => 0.0,
            };
            order.status = ExchangeOrderStatus::Filled;
            order.filled_quantity = base_qty;
            order.avg_fill_price = market_price;
            order.fee = base_qty * market_price * state.fee_rate;
            order.fee_currency = Some("USDT".to_string());
        }

        state.orders.insert(
            order_id.clone(),
            MockOrder {
                request: request.clone(),
                order: order.clone(),
            },
        );
        state.order_sequence.push(order_id);
        Ok(order)
    }

    async fn get_order_status(
        &self,
        order_id: &str,
        _symbol: &str,
    ) -> Result<ExchangeOrder, ExchangeError> {
        self.state
            .lock()
            .orders
            .get(order_id)
            .map(|e| e.order.clone())
            .ok_or_else(|| ExchangeError::Generic(format!("unknown order {order_id}")))
    }

    async fn cancel_order(&self, order_id: &str, _symbol: &str) -> Result<(), ExchangeError> {
        let mut state = self.state.lock();
        match state.orders.get_mut(order_id) {
            Some(entry) => {
                if entry.order.status == ExchangeOrderStatus::New
                    || entry.order.status == ExchangeOrderStatus::PartiallyFilled
                {
                    entry.order.status = ExchangeOrderStatus::Cancelled;
                }
                Ok(())
            }
            None => Err(ExchangeError::Generic(format!("unknown order {order_id}"))),
        }
    }

    async fn get_current_price(&self, symbol: &str) -> Result<f64, ExchangeError> {
        self.state
            .lock()
            .prices
            .get(symbol)
            .copied()
            .ok_or_else(|| ExchangeError::Generic(format!("no mock price for {symbol}")))
    }

    async fn get_all_tickers(&self) -> Result<HashMap<String, f64>, ExchangeError> {
        Ok(self.state.lock().prices.clone())
    }

    async fn fetch_balance(&self) -> Result<HashMap<String, f64>, ExchangeError> {
        Ok(self.state.lock().free_balances.clone())
    }

    async fn fetch_free_balance(&self) -> Result<HashMap<String, f64>, ExchangeError> {
        Ok(self.state.lock().free_balances.clone())
    }

    async fn get_trading_fee_rate(&self, _symbol: Option<&str>) -> Result<f64, ExchangeError> {
        Ok(self.state.lock().fee_rate)
    }

    async fn get_precision_rules(&self) -> Result<HashMap<String, PrecisionRules>, ExchangeError> {
        self.precision_fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self.state.lock().precision.clone())
    }

    async fn close(&self) {}
}

/// Hands out one shared mock per exchange name; tests script the mock and
/// the engine sees it through the normal factory seam.
#[derive(Default)]
pub struct MockConnectorFactory {
    connectors: Mutex<HashMap<String, std::sync::Arc<MockConnector>>>,
}

impl MockConnectorFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connector(&self, exchange: &str) -> std::sync::Arc<MockConnector> {
        self.connectors
            .lock()
            .entry(exchange.to_string())
            .or_insert_with(|| std::sync::Arc::new(MockConnector::new()))
            .clone()
    }
}

impl super::ConnectorFactory for MockConnectorFactory {
    fn connect(
        &self,
        _user: &crate::models::User,
        exchange: &str,
    ) -> Result<std::sync::Arc<dyn ExchangeConnector>, ExchangeError> {
        Ok(self.connector(exchange))
    }
}
