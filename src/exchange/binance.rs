//! Binance spot REST connector.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::Client;
use sha2::Sha256;
use tracing::debug;

use super::{
    parse_f64, AmountType, ExchangeConnector, ExchangeError, ExchangeOrder, ExchangeOrderStatus,
    OrderRequest,
};
use crate::models::{OrderSide, OrderType};
use crate::precision::PrecisionRules;

const MAINNET_BASE: &str = "https://api.binance.com";
const TESTNET_BASE: &str = "https://testnet.binance.vision";
const RECV_WINDOW_MS: u64 = 5_000;
const DEFAULT_TAKER_FEE: f64 = 0.001;

pub struct BinanceConnector {
    client: Client,
    secret_key: String,
    base_url: String,
}

impl BinanceConnector {
    pub fn new(api_key: String, secret_key: String, testnet: bool) -> Result<Self, ExchangeError> {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            "X-MBX-APIKEY",
            api_key
                .parse()
                .map_err(|_| ExchangeError::InvalidCredentials("malformed api key".into()))?,
        );
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .default_headers(headers)
            .build()
            .map_err(|e| ExchangeError::Connection(e.to_string()))?;

        Ok(Self {
            client,
            secret_key,
            base_url: if testnet { TESTNET_BASE } else { MAINNET_BASE }.to_string(),
        })
    }

    fn sign(&self, query: &str) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(self.secret_key.as_bytes())
            .expect("HMAC accepts any key length");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn signed_query(&self, mut params: Vec<(String, String)>) -> String {
        params.push((
            "timestamp".to_string(),
            chrono::Utc::now().timestamp_millis().to_string(),
        ));
        params.push(("recvWindow".to_string(), RECV_WINDOW_MS.to_string()));
        let query: String = params
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&");
        let signature = self.sign(&query);
        format!("{query}&signature={signature}")
    }

    async fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        query: Option<String>,
    ) -> Result<serde_json::Value, ExchangeError> {
        let url = match query {
            Some(q) => format!("{}{}?{}", self.base_url, path, q),
            None => format!("{}{}", self.base_url, path),
        };
        let response = self
            .client
            .request(method, &url)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = response.status();
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ExchangeError::Generic(format!("malformed response: {e}")))?;

        if !status.is_success() {
            return Err(map_vendor_error(status.as_u16(), &body));
        }
        Ok(body)
    }

    async fn signed(
        &self,
        method: reqwest::Method,
        path: &str,
        params: Vec<(String, String)>,
    ) -> Result<serde_json::Value, ExchangeError> {
        let query = self.signed_query(params);
        self.request(method, path, Some(query)).await
    }

    fn parse_order(&self, body: &serde_json::Value) -> Result<ExchangeOrder, ExchangeError> {
        let order_id = body
            .get("orderId")
            .map(|v| v.to_string())
            .ok_or_else(|| ExchangeError::Generic("order response missing orderId".into()))?;
        let symbol = body
            .get("symbol")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let status = body
            .get("status")
            .and_then(|v| v.as_str())
            .map(parse_vendor_status)
            .unwrap_or(ExchangeOrderStatus::New);
        let filled_quantity = body.get("executedQty").map(parse_f64).unwrap_or(0.0);
        let quote_filled = body
            .get("cummulativeQuoteQty")
            .map(parse_f64)
            .unwrap_or(0.0);
        let avg_fill_price = if filled_quantity > 0.0 {
            quote_filled / filled_quantity
        } else {
            0.0
        };

        // Fee details only appear on fills returned inline with the ack.
        let mut fee = 0.0;
        let mut fee_currency = None;
        if let Some(fills) = body.get("fills").and_then(|v| v.as_array()) {
            for fill in fills {
                fee += fill.get("commission").map(parse_f64).unwrap_or(0.0);
                if fee_currency.is_none() {
                    fee_currency = fill
                        .get("commissionAsset")
                        .and_then(|v| v.as_str())
                        .map(|s| s.to_string());
                }
            }
        }

        Ok(ExchangeOrder {
            order_id,
            symbol,
            status,
            filled_quantity,
            avg_fill_price,
            fee,
            fee_currency,
        })
    }
}

#[async_trait]
impl ExchangeConnector for BinanceConnector {
    fn exchange_name(&self) -> &'static str {
        "binance"
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<ExchangeOrder, ExchangeError> {
        let side = match request.side {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        };
        let mut params = vec![
            ("symbol".to_string(), request.symbol.clone()),
            ("side".to_string(), side.to_string()),
            ("type".to_string(), request.order_type.as_str().to_string()),
        ];
        match request.order_type {
            OrderType::Limit => {
                let price = request.price.ok_or_else(|| {
                    ExchangeError::OrderValidation("limit order requires a price".into())
                })?;
                params.push(("timeInForce".to_string(), "GTC".to_string()));
                params.push(("quantity".to_string(), format_amount(request.quantity)));
                params.push(("price".to_string(), format_amount(price)));
            }
            OrderType::Market => match request.amount_type {
                AmountType::Base => {
                    params.push(("quantity".to_string(), format_amount(request.quantity)));
                }
                AmountType::Quote => {
                    params.push(("quoteOrderQty".to_string(), format_amount(request.quantity)));
                }
            },
        }

        debug!(symbol = %request.symbol, side, order_type = request.order_type.as_str(), "placing binance order");
        let body = self
            .signed(reqwest::Method::POST, "/api/v3/order", params)
            .await?;
        self.parse_order(&body)
    }

    async fn get_order_status(
        &self,
        order_id: &str,
        symbol: &str,
    ) -> Result<ExchangeOrder, ExchangeError> {
        let params = vec![
            ("symbol".to_string(), symbol.to_string()),
            ("orderId".to_string(), order_id.to_string()),
        ];
        let body = self
            .signed(reqwest::Method::GET, "/api/v3/order", params)
            .await?;
        self.parse_order(&body)
    }

    async fn cancel_order(&self, order_id: &str, symbol: &str) -> Result<(), ExchangeError> {
        let params = vec![
            ("symbol".to_string(), symbol.to_string()),
            ("orderId".to_string(), order_id.to_string()),
        ];
        self.signed(reqwest::Method::DELETE, "/api/v3/order", params)
            .await?;
        Ok(())
    }

    async fn get_current_price(&self, symbol: &str) -> Result<f64, ExchangeError> {
        let body = self
            .request(
                reqwest::Method::GET,
                "/api/v3/ticker/price",
                Some(format!("symbol={symbol}")),
            )
            .await?;
        let price = body.get("price").map(parse_f64).unwrap_or(0.0);
        if price <= 0.0 {
            return Err(ExchangeError::Generic(format!(
                "no price returned for {symbol}"
            )));
        }
        Ok(price)
    }

    async fn get_all_tickers(&self) -> Result<HashMap<String, f64>, ExchangeError> {
        let body = self
            .request(reqwest::Method::GET, "/api/v3/ticker/price", None)
            .await?;
        let mut tickers = HashMap::new();
        if let Some(entries) = body.as_array() {
            for entry in entries {
                if let Some(symbol) = entry.get("symbol").and_then(|v| v.as_str()) {
                    tickers.insert(symbol.to_string(), entry.get("price").map(parse_f64).unwrap_or(0.0));
                }
            }
        }
        Ok(tickers)
    }

    async fn fetch_balance(&self) -> Result<HashMap<String, f64>, ExchangeError> {
        let body = self
            .signed(reqwest::Method::GET, "/api/v3/account", Vec::new())
            .await?;
        Ok(parse_balances(&body, |free, locked| free + locked))
    }

    async fn fetch_free_balance(&self) -> Result<HashMap<String, f64>, ExchangeError> {
        let body = self
            .signed(reqwest::Method::GET, "/api/v3/account", Vec::new())
            .await?;
        Ok(parse_balances(&body, |free, _locked| free))
    }

    async fn get_trading_fee_rate(&self, _symbol: Option<&str>) -> Result<f64, ExchangeError> {
        let body = self
            .signed(reqwest::Method::GET, "/api/v3/account", Vec::new())
            .await?;
        let taker = body
            .get("commissionRates")
            .and_then(|r| r.get("taker"))
            .map(parse_f64)
            .unwrap_or(0.0);
        Ok(if taker > 0.0 { taker } else { DEFAULT_TAKER_FEE })
    }

    async fn get_precision_rules(&self) -> Result<HashMap<String, PrecisionRules>, ExchangeError> {
        let body = self
            .request(reqwest::Method::GET, "/api/v3/exchangeInfo", None)
            .await?;
        let mut rules = HashMap::new();
        let Some(symbols) = body.get("symbols").and_then(|v| v.as_array()) else {
            return Ok(rules);
        };
        for market in symbols {
            let Some(symbol) = market.get("symbol").and_then(|v| v.as_str()) else {
                continue;
            };
            let mut tick_size = 0.0;
            let mut step_size = 0.0;
            let mut min_qty = 0.0;
            let mut min_notional = 0.0;
            if let Some(filters) = market.get("filters").and_then(|v| v.as_array()) {
                for filter in filters {
                    match filter.get("filterType").and_then(|v| v.as_str()) {
                        Some("PRICE_FILTER") => {
                            tick_size = filter.get("tickSize").map(parse_f64).unwrap_or(0.0);
                        }
                        Some("LOT_SIZE") => {
                            step_size = filter.get("stepSize").map(parse_f64).unwrap_or(0.0);
                            min_qty = filter.get("minQty").map(parse_f64).unwrap_or(0.0);
                        }
                        Some("NOTIONAL") | Some("MIN_NOTIONAL") => {
                            min_notional = filter.get("minNotional").map(parse_f64).unwrap_or(0.0);
                        }
                        _ => {}
                    }
                }
            }
            rules.insert(
                symbol.to_string(),
                PrecisionRules {
                    tick_size,
                    step_size,
                    min_qty,
                    min_notional,
                },
            );
        }
        Ok(rules)
    }

    async fn close(&self) {
        // reqwest's pool is released on drop; nothing venue-side to tear down.
    }
}

fn parse_balances(
    body: &serde_json::Value,
    combine: impl Fn(f64, f64) -> f64,
) -> HashMap<String, f64> {
    let mut out = HashMap::new();
    if let Some(balances) = body.get("balances").and_then(|v| v.as_array()) {
        for entry in balances {
            let Some(asset) = entry.get("asset").and_then(|v| v.as_str()) else {
                continue;
            };
            let free = entry.get("free").map(parse_f64).unwrap_or(0.0);
            let locked = entry.get("locked").map(parse_f64).unwrap_or(0.0);
            let value = combine(free, locked);
            if value > 0.0 {
                out.insert(asset.to_string(), value);
            }
        }
    }
    out
}

fn parse_vendor_status(status: &str) -> ExchangeOrderStatus {
    match status {
        "NEW" | "PENDING_NEW" | "PENDING_CANCEL" => ExchangeOrderStatus::New,
        "PARTIALLY_FILLED" => ExchangeOrderStatus::PartiallyFilled,
        "FILLED" => ExchangeOrderStatus::Filled,
        "CANCELED" => ExchangeOrderStatus::Cancelled,
        "REJECTED" => ExchangeOrderStatus::Rejected,
        "EXPIRED" | "EXPIRED_IN_MATCH" => ExchangeOrderStatus::Expired,
        _ => ExchangeOrderStatus::New,
    }
}

pub(super) fn map_reqwest_error(e: reqwest::Error) -> ExchangeError {
    if e.is_timeout() || e.is_connect() {
        ExchangeError::Connection(e.to_string())
    } else {
        ExchangeError::Generic(e.to_string())
    }
}

fn map_vendor_error(http_status: u16, body: &serde_json::Value) -> ExchangeError {
    let code = body.get("code").and_then(|v| v.as_i64()).unwrap_or(0);
    let msg = body
        .get("msg")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown error")
        .to_string();

    match (http_status, code) {
        (429, _) | (418, _) => ExchangeError::RateLimit(msg),
        (401, _) | (403, _) => ExchangeError::InvalidCredentials(msg),
        (_, -1003) => ExchangeError::RateLimit(msg),
        (_, -1021) => ExchangeError::Connection(msg),
        (_, -1022) | (_, -2014) | (_, -2015) => ExchangeError::InvalidCredentials(msg),
        (_, -2010) if msg.to_ascii_lowercase().contains("insufficient") => {
            ExchangeError::InsufficientFunds(msg)
        }
        (_, -1013) | (_, -2010) | (_, -1111) => ExchangeError::OrderValidation(msg),
        (status, _) if status >= 500 => ExchangeError::Connection(msg),
        _ => ExchangeError::Generic(msg),
    }
}

/// Formats quantities/prices without scientific notation or trailing zeros.
pub(crate) fn format_amount(value: f64) -> String {
    let mut s = format!("{value:.8}");
    while s.ends_with('0') {
        s.pop();
    }
    if s.ends_with('.') {
        s.pop();
    }
    s
}
