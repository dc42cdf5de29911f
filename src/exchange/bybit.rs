//! Bybit v5 spot REST connector.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::Client;
use sha2::Sha256;
use tracing::debug;

use super::binance::{format_amount, map_reqwest_error};
use super::{
    parse_f64, AmountType, ExchangeConnector, ExchangeError, ExchangeOrder, ExchangeOrderStatus,
    OrderRequest,
};
use crate::models::{OrderSide, OrderType};
use crate::precision::PrecisionRules;

const MAINNET_BASE: &str = "https://api.bybit.com";
const TESTNET_BASE: &str = "https://api-testnet.bybit.com";
const RECV_WINDOW_MS: u64 = 5_000;
const DEFAULT_TAKER_FEE: f64 = 0.001;

pub struct BybitConnector {
    client: Client,
    api_key: String,
    secret_key: String,
    base_url: String,
}

impl BybitConnector {
    pub fn new(api_key: String, secret_key: String, testnet: bool) -> Result<Self, ExchangeError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| ExchangeError::Connection(e.to_string()))?;
        Ok(Self {
            client,
            api_key,
            secret_key,
            base_url: if testnet { TESTNET_BASE } else { MAINNET_BASE }.to_string(),
        })
    }

    fn sign(&self, timestamp: i64, payload: &str) -> String {
        let prehash = format!("{timestamp}{}{RECV_WINDOW_MS}{payload}", self.api_key);
        let mut mac = Hmac::<Sha256>::new_from_slice(self.secret_key.as_bytes())
            .expect("HMAC accepts any key length");
        mac.update(prehash.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    async fn signed_get(
        &self,
        path: &str,
        query: &str,
    ) -> Result<serde_json::Value, ExchangeError> {
        let timestamp = chrono::Utc::now().timestamp_millis();
        let signature = self.sign(timestamp, query);
        let url = if query.is_empty() {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}{}?{}", self.base_url, path, query)
        };
        let response = self
            .client
            .get(&url)
            .header("X-BAPI-API-KEY", &self.api_key)
            .header("X-BAPI-TIMESTAMP", timestamp.to_string())
            .header("X-BAPI-RECV-WINDOW", RECV_WINDOW_MS.to_string())
            .header("X-BAPI-SIGN", signature)
            .send()
            .await
            .map_err(map_reqwest_error)?;
        decode_envelope(response).await
    }

    async fn signed_post(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<serde_json::Value, ExchangeError> {
        let timestamp = chrono::Utc::now().timestamp_millis();
        let body_text = body.to_string();
        let signature = self.sign(timestamp, &body_text);
        let response = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .header("X-BAPI-API-KEY", &self.api_key)
            .header("X-BAPI-TIMESTAMP", timestamp.to_string())
            .header("X-BAPI-RECV-WINDOW", RECV_WINDOW_MS.to_string())
            .header("X-BAPI-SIGN", signature)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body_text)
            .send()
            .await
            .map_err(map_reqwest_error)?;
        decode_envelope(response).await
    }

    async fn public_get(&self, path: &str, query: &str) -> Result<serde_json::Value, ExchangeError> {
        let url = if query.is_empty() {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}{}?{}", self.base_url, path, query)
        };
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(map_reqwest_error)?;
        decode_envelope(response).await
    }

    fn parse_order_entry(&self, entry: &serde_json::Value) -> ExchangeOrder {
        ExchangeOrder {
            order_id: entry
                .get("orderId")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            symbol: entry
                .get("symbol")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            status: entry
                .get("orderStatus")
                .and_then(|v| v.as_str())
                .map(parse_vendor_status)
                .unwrap_or(ExchangeOrderStatus::New),
            filled_quantity: entry.get("cumExecQty").map(parse_f64).unwrap_or(0.0),
            avg_fill_price: entry.get("avgPrice").map(parse_f64).unwrap_or(0.0),
            fee: entry.get("cumExecFee").map(parse_f64).unwrap_or(0.0),
            fee_currency: entry
                .get("feeCurrency")
                .and_then(|v| v.as_str())
                .filter(|s| !s.is_empty())
                .map(|s| s.to_string()),
        }
    }
}

#[async_trait]
impl ExchangeConnector for BybitConnector {
    fn exchange_name(&self) -> &'static str {
        "bybit"
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<ExchangeOrder, ExchangeError> {
        let side = match request.side {
            OrderSide::Buy => "Buy",
            OrderSide::Sell => "Sell",
        };
        let order_type = match request.order_type {
            OrderType::Limit => "Limit",
            OrderType::Market => "Market",
        };
        let mut body = serde_json::json!({
            "category": "spot",
            "symbol": request.symbol,
            "side": side,
            "orderType": order_type,
            "qty": format_amount(request.quantity),
        });
        if let OrderType::Limit = request.order_type {
            let price = request.price.ok_or_else(|| {
                ExchangeError::OrderValidation("limit order requires a price".into())
            })?;
            body["price"] = serde_json::Value::String(format_amount(price));
            body["timeInForce"] = serde_json::Value::String("GTC".to_string());
        } else {
            body["marketUnit"] = serde_json::Value::String(
                match request.amount_type {
                    AmountType::Base => "baseCoin",
                    AmountType::Quote => "quoteCoin",
                }
                .to_string(),
            );
        }

        debug!(symbol = %request.symbol, side, order_type, "placing bybit order");
        let result = self.signed_post("/v5/order/create", &body).await?;
        let order_id = result
            .get("orderId")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ExchangeError::Generic("order ack missing orderId".into()))?
            .to_string();

        // The create ack carries no execution state; report it as accepted.
        Ok(ExchangeOrder {
            order_id,
            symbol: request.symbol.clone(),
            status: ExchangeOrderStatus::New,
            filled_quantity: 0.0,
            avg_fill_price: 0.0,
            fee: 0.0,
            fee_currency: None,
        })
    }

    async fn get_order_status(
        &self,
        order_id: &str,
        symbol: &str,
    ) -> Result<ExchangeOrder, ExchangeError> {
        let query = format!("category=spot&symbol={symbol}&orderId={order_id}");
        let result = self.signed_get("/v5/order/realtime", &query).await?;
        let entry = result
            .get("list")
            .and_then(|v| v.as_array())
            .and_then(|l| l.first())
            .ok_or_else(|| ExchangeError::Generic(format!("order {order_id} not found")))?;
        Ok(self.parse_order_entry(entry))
    }

    async fn cancel_order(&self, order_id: &str, symbol: &str) -> Result<(), ExchangeError> {
        let body = serde_json::json!({
            "category": "spot",
            "symbol": symbol,
            "orderId": order_id,
        });
        self.signed_post("/v5/order/cancel", &body).await?;
        Ok(())
    }

    async fn get_current_price(&self, symbol: &str) -> Result<f64, ExchangeError> {
        let query = format!("category=spot&symbol={symbol}");
        let result = self.public_get("/v5/market/tickers", &query).await?;
        let price = result
            .get("list")
            .and_then(|v| v.as_array())
            .and_then(|l| l.first())
            .and_then(|t| t.get("lastPrice"))
            .map(parse_f64)
            .unwrap_or(0.0);
        if price <= 0.0 {
            return Err(ExchangeError::Generic(format!(
                "no price returned for {symbol}"
            )));
        }
        Ok(price)
    }

    async fn get_all_tickers(&self) -> Result<HashMap<String, f64>, ExchangeError> {
        let result = self.public_get("/v5/market/tickers", "category=spot").await?;
        let mut tickers = HashMap::new();
        if let Some(list) = result.get("list").and_then(|v| v.as_array()) {
            for entry in list {
                if let Some(symbol) = entry.get("symbol").and_then(|v| v.as_str()) {
                    tickers.insert(
                        symbol.to_string(),
                        entry.get("lastPrice").map(parse_f64).unwrap_or(0.0),
                    );
                }
            }
        }
        Ok(tickers)
    }

    async fn fetch_balance(&self) -> Result<HashMap<String, f64>, ExchangeError> {
        self.wallet_balances("walletBalance").await
    }

    async fn fetch_free_balance(&self) -> Result<HashMap<String, f64>, ExchangeError> {
        self.wallet_balances("availableToWithdraw").await
    }

    async fn get_trading_fee_rate(&self, symbol: Option<&str>) -> Result<f64, ExchangeError> {
        let query = match symbol {
            Some(s) => format!("category=spot&symbol={s}"),
            None => "category=spot".to_string(),
        };
        let result = self.signed_get("/v5/account/fee-rate", &query).await?;
        let taker = result
            .get("list")
            .and_then(|v| v.as_array())
            .and_then(|l| l.first())
            .and_then(|e| e.get("takerFeeRate"))
            .map(parse_f64)
            .unwrap_or(0.0);
        Ok(if taker > 0.0 { taker } else { DEFAULT_TAKER_FEE })
    }

    async fn get_precision_rules(&self) -> Result<HashMap<String, PrecisionRules>, ExchangeError> {
        let result = self
            .public_get("/v5/market/instruments-info", "category=spot&limit=1000")
            .await?;
        let mut rules = HashMap::new();
        let Some(list) = result.get("list").and_then(|v| v.as_array()) else {
            return Ok(rules);
        };
        for instrument in list {
            let Some(symbol) = instrument.get("symbol").and_then(|v| v.as_str()) else {
                continue;
            };
            let tick_size = instrument
                .get("priceFilter")
                .and_then(|f| f.get("tickSize"))
                .map(parse_f64)
                .unwrap_or(0.0);
            let lot = instrument.get("lotSizeFilter");
            let step_size = lot
                .and_then(|f| f.get("basePrecision"))
                .map(parse_f64)
                .unwrap_or(0.0);
            let min_qty = lot
                .and_then(|f| f.get("minOrderQty"))
                .map(parse_f64)
                .unwrap_or(0.0);
            let min_notional = lot
                .and_then(|f| f.get("minOrderAmt"))
                .map(parse_f64)
                .unwrap_or(0.0);
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

    async fn close(&self) {}
}

impl BybitConnector {
    async fn wallet_balances(&self, field: &str) -> Result<HashMap<String, f64>, ExchangeError> {
        let result = self
            .signed_get("/v5/account/wallet-balance", "accountType=UNIFIED")
            .await?;
        let mut out = HashMap::new();
        let coins = result
            .get("list")
            .and_then(|v| v.as_array())
            .and_then(|l| l.first())
            .and_then(|a| a.get("coin"))
            .and_then(|v| v.as_array());
        if let Some(coins) = coins {
            for coin in coins {
                let Some(asset) = coin.get("coin").and_then(|v| v.as_str()) else {
                    continue;
                };
                let value = coin.get(field).map(parse_f64).unwrap_or(0.0);
                if value > 0.0 {
                    out.insert(asset.to_string(), value);
                }
            }
        }
        Ok(out)
    }
}

async fn decode_envelope(response: reqwest::Response) -> Result<serde_json::Value, ExchangeError> {
    let status = response.status();
    let body: serde_json::Value = response
        .json()
        .await
        .map_err(|e| ExchangeError::Generic(format!("malformed response: {e}")))?;

    if !status.is_success() {
        return Err(ExchangeError::Connection(format!(
            "HTTP {status}: {body}"
        )));
    }

    let ret_code = body.get("retCode").and_then(|v| v.as_i64()).unwrap_or(-1);
    if ret_code != 0 {
        let msg = body
            .get("retMsg")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown error")
            .to_string();
        return Err(map_ret_code(ret_code, msg));
    }
    Ok(body.get("result").cloned().unwrap_or(serde_json::Value::Null))
}

fn map_ret_code(code: i64, msg: String) -> ExchangeError {
    match code {
        10003 | 10004 | 10005 | 33004 => ExchangeError::InvalidCredentials(msg),
        10006 | 10018 => ExchangeError::RateLimit(msg),
        10016 => ExchangeError::Connection(msg),
        _ if msg.to_ascii_lowercase().contains("insufficient") => {
            ExchangeError::InsufficientFunds(msg)
        }
        170124 | 170131 | 170133 | 170136 | 170140 => ExchangeError::OrderValidation(msg),
        _ => ExchangeError::Generic(msg),
    }
}

fn parse_vendor_status(status: &str) -> ExchangeOrderStatus {
    match status {
        "New" | "Untriggered" | "Triggered" => ExchangeOrderStatus::New,
        "PartiallyFilled" => ExchangeOrderStatus::PartiallyFilled,
        "Filled" => ExchangeOrderStatus::Filled,
        "Cancelled" | "PartiallyFilledCanceled" | "Deactivated" => ExchangeOrderStatus::Cancelled,
        "Rejected" => ExchangeOrderStatus::Rejected,
        _ => ExchangeOrderStatus::New,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ret_code_mapping() {
        assert!(matches!(
            map_ret_code(10003, "invalid api key".into()),
            ExchangeError::InvalidCredentials(_)
        ));
        assert!(matches!(
            map_ret_code(10006, "too many visits".into()),
            ExchangeError::RateLimit(_)
        ));
        assert!(matches!(
            map_ret_code(170131, "Insufficient balance".into()),
            ExchangeError::InsufficientFunds(_)
        ));
        assert!(matches!(
            map_ret_code(170136, "Order qty invalid".into()),
            ExchangeError::OrderValidation(_)
        ));
    }

    #[test]
    fn test_vendor_status_parsing() {
        assert_eq!(parse_vendor_status("New"), ExchangeOrderStatus::New);
        assert_eq!(
            parse_vendor_status("PartiallyFilled"),
            ExchangeOrderStatus::PartiallyFilled
        );
        assert_eq!(
            parse_vendor_status("PartiallyFilledCanceled"),
            ExchangeOrderStatus::Cancelled
        );
    }
}
