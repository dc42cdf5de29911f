//! Per-exchange symbol metadata cache.
//!
//! Tick size, step size, minimum quantity and minimum notional per symbol,
//! refreshed from the exchange on a TTL. Strict mode blocks orders for
//! unknown symbols; lenient mode falls back to configured defaults.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::exchange::{ExchangeConnector, ExchangeError};

/// Complete precision rule set for one symbol.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PrecisionRules {
    pub tick_size: f64,
    pub step_size: f64,
    pub min_qty: f64,
    pub min_notional: f64,
}

impl PrecisionRules {
    /// Decimal places implied by an increment, for exchange-facing formatting.
    pub fn decimals_for(increment: f64) -> usize {
        if increment <= 0.0 || increment >= 1.0 {
            return 0;
        }
        let mut decimals = 0;
        let mut v = increment;
        while v < 0.999_999_9 && decimals < 12 {
            v *= 10.0;
            decimals += 1;
        }
        decimals
    }
}

#[derive(Debug, Error)]
pub enum PrecisionError {
    #[error("no precision metadata for symbol {symbol} on {exchange}")]
    SymbolUnknown { exchange: String, symbol: String },
    #[error(transparent)]
    Exchange(#[from] ExchangeError),
}

#[derive(Debug, Clone)]
pub struct PrecisionCacheConfig {
    pub ttl_minutes: i64,
    /// Strict: unknown symbol blocks the order. Lenient: fall back to defaults.
    pub strict: bool,
    pub fallback: Option<PrecisionRules>,
}

impl Default for PrecisionCacheConfig {
    fn default() -> Self {
        Self {
            ttl_minutes: 60,
            strict: true,
            fallback: None,
        }
    }
}

struct CachedRules {
    fetched_at: DateTime<Utc>,
    rules: HashMap<String, PrecisionRules>,
}

/// TTL-refreshed symbol → rules map, keyed by exchange name.
pub struct PrecisionCache {
    config: PrecisionCacheConfig,
    inner: RwLock<HashMap<String, CachedRules>>,
}

impl PrecisionCache {
    pub fn new(config: PrecisionCacheConfig) -> Self {
        Self {
            config,
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Returns a complete rule set for `symbol`, refreshing the exchange map
    /// if the cached copy is stale or absent.
    pub async fn get_precision_for_symbol(
        &self,
        connector: &dyn ExchangeConnector,
        exchange: &str,
        symbol: &str,
    ) -> Result<PrecisionRules, PrecisionError> {
        if let Some(rules) = self.lookup_fresh(exchange, symbol).await {
            return Ok(rules);
        }

        self.refresh(connector, exchange).await?;

        if let Some(rules) = self.lookup_fresh(exchange, symbol).await {
            return Ok(rules);
        }

        if !self.config.strict {
            if let Some(fallback) = self.config.fallback {
                warn!(exchange, symbol, "precision metadata missing, using fallback rules");
                return Ok(fallback);
            }
        }
        Err(PrecisionError::SymbolUnknown {
            exchange: exchange.to_string(),
            symbol: symbol.to_string(),
        })
    }

    async fn lookup_fresh(&self, exchange: &str, symbol: &str) -> Option<PrecisionRules> {
        let ttl = Duration::minutes(self.config.ttl_minutes);
        let map = self.inner.read().await;
        let cached = map.get(exchange)?;
        if Utc::now() - cached.fetched_at > ttl {
            return None;
        }
        cached.rules.get(symbol).copied()
    }

    async fn refresh(
        &self,
        connector: &dyn ExchangeConnector,
        exchange: &str,
    ) -> Result<(), ExchangeError> {
        let rules = connector.get_precision_rules().await?;
        info!(exchange, symbols = rules.len(), "refreshed precision rules");
        let mut map = self.inner.write().await;
        map.insert(
            exchange.to_string(),
            CachedRules {
                fetched_at: Utc::now(),
                rules,
            },
        );
        Ok(())
    }

    /// Drops the cached map for an exchange, forcing a refetch on next use.
    pub async fn invalidate(&self, exchange: &str) {
        self.inner.write().await.remove(exchange);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::mock::MockConnector;

    fn btc_rules() -> PrecisionRules {
        PrecisionRules {
            tick_size: 0.01,
            step_size: 0.001,
            min_qty: 0.001,
            min_notional: 10.0,
        }
    }

    #[tokio::test]
    async fn test_fetch_and_cache() {
        let connector = MockConnector::new();
        connector.set_precision("BTCUSDT", btc_rules());

        let cache = PrecisionCache::new(PrecisionCacheConfig::default());
        let rules = cache
            .get_precision_for_symbol(&connector, "binance", "BTCUSDT")
            .await
            .unwrap();
        assert_eq!(rules, btc_rules());
        assert_eq!(connector.precision_fetch_count(), 1);

        // Second lookup is served from cache.
        cache
            .get_precision_for_symbol(&connector, "binance", "BTCUSDT")
            .await
            .unwrap();
        assert_eq!(connector.precision_fetch_count(), 1);
    }

    #[tokio::test]
    async fn test_strict_mode_blocks_unknown_symbol() {
        let connector = MockConnector::new();
        let cache = PrecisionCache::new(PrecisionCacheConfig::default());
        let err = cache
            .get_precision_for_symbol(&connector, "binance", "NOPEUSDT")
            .await
            .unwrap_err();
        assert!(matches!(err, PrecisionError::SymbolUnknown { .. }));
    }

    #[tokio::test]
    async fn test_lenient_mode_falls_back() {
        let connector = MockConnector::new();
        let fallback = btc_rules();
        let cache = PrecisionCache::new(PrecisionCacheConfig {
            ttl_minutes: 60,
            strict: false,
            fallback: Some(fallback),
        });
        let rules = cache
            .get_precision_for_symbol(&connector, "binance", "NOPEUSDT")
            .await
            .unwrap();
        assert_eq!(rules, fallback);
    }

    #[test]
    fn test_decimals_for_increment() {
        assert_eq!(PrecisionRules::decimals_for(0.01), 2);
        assert_eq!(PrecisionRules::decimals_for(0.001), 3);
        assert_eq!(PrecisionRules::decimals_for(1.0), 0);
    }
}
