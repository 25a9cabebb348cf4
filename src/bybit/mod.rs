// =============================================================================
// Bybit venue access — REST market data, quota tracking, public WebSocket
// =============================================================================

pub mod client;
pub mod rate_limit;
pub mod ws;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::types::Kline;

pub use client::BybitRestClient;

/// REST market-data operations the collector depends on.
#[async_trait]
pub trait MarketRest: Send + Sync {
    /// Current tradable symbols of the configured category.
    async fn tradable_symbols(&self) -> Result<Vec<String>>;

    /// Candles of `symbol` whose start falls in `[start, end]`, oldest first.
    async fn klines(
        &self,
        category: &str,
        symbol: &str,
        interval: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Kline>>;
}
