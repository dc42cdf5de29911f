//! The trading-state engine: signal admission, execution-pool limiting, the
//! position/pyramid/DCA state machine, fill monitoring, take-profit
//! placement, and the risk engine. All components coordinate through the
//! transactional store and the coordination cache; none holds position state
//! in memory across requests.

pub mod fill_monitor;
pub mod pool;
pub mod position;
pub mod queue;
pub mod risk;
pub mod router;

use std::sync::Arc;

use crate::cache::CoordinationCache;
use crate::exchange::ConnectorFactory;
use crate::precision::PrecisionCache;
use crate::store::EngineDb;

/// Tunables shared by the engine services.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub fill_monitor_interval_secs: u64,
    pub risk_engine_interval_secs: u64,
    pub queue_promoter_interval_secs: u64,
    /// Groups stuck in CLOSING longer than this are recovered to ACTIVE.
    pub closing_timeout_minutes: i64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            fill_monitor_interval_secs: 3,
            risk_engine_interval_secs: 30,
            queue_promoter_interval_secs: 10,
            closing_timeout_minutes: 30,
        }
    }
}

/// Shared handles every engine service is constructed from.
#[derive(Clone)]
pub struct EngineContext {
    pub db: EngineDb,
    pub cache: Arc<dyn CoordinationCache>,
    pub connectors: Arc<dyn ConnectorFactory>,
    pub precision: Arc<PrecisionCache>,
    pub settings: EngineSettings,
}

/// Quote asset of a spot symbol, for balance checks.
pub fn quote_asset(symbol: &str) -> &str {
    for quote in ["USDT", "USDC", "FDUSD", "BUSD", "USD", "BTC", "ETH"] {
        if let Some(base) = symbol.strip_suffix(quote) {
            if !base.is_empty() {
                return &symbol[base.len()..];
            }
        }
    }
    "USDT"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_asset() {
        assert_eq!(quote_asset("BTCUSDT"), "USDT");
        assert_eq!(quote_asset("ETHUSDC"), "USDC");
        assert_eq!(quote_asset("ETHBTC"), "BTC");
        assert_eq!(quote_asset("UNKNOWN"), "USDT");
    }
}
