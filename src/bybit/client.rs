// =============================================================================
// Bybit REST API Client — public V5 market endpoints
// =============================================================================
//
// Only unauthenticated market-data endpoints are used, so no request signing
// is needed.  Every response is wrapped in the V5 envelope
// `{ retCode, retMsg, result, time }`; a non-zero retCode is an error even
// when the HTTP status is 200.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, instrument, warn};

use super::rate_limit::RateLimitTracker;
use super::MarketRest;
use crate::types::{Kline, KlineInterval};

/// Maximum rows Bybit returns per kline / instruments request.
const PAGE_LIMIT: u32 = 1000;

/// Longest we wait for an exhausted quota window to reset.
const MAX_QUOTA_WAIT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Response shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BybitResponse<T> {
    ret_code: i64,
    #[serde(default)]
    ret_msg: String,
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
struct InstrumentList {
    #[serde(default)]
    list: Vec<Instrument>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Instrument {
    symbol: String,
    #[serde(default)]
    base_coin: String,
    #[serde(default)]
    quote_coin: String,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct KlineList {
    #[serde(default)]
    list: Vec<Vec<String>>,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Bybit V5 REST client.
#[derive(Clone)]
pub struct BybitRestClient {
    base_url: String,
    category: String,
    client: reqwest::Client,
    rate_limit: Arc<RateLimitTracker>,
}

impl BybitRestClient {
    /// Create a client; `timeout` bounds every request end to end.
    pub fn new(
        base_url: impl Into<String>,
        category: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build reqwest client")?;

        let base_url = base_url.into().trim_end_matches('/').to_string();
        debug!(base_url = %base_url, "BybitRestClient initialised");

        Ok(Self {
            base_url,
            category: category.into(),
            client,
            rate_limit: Arc::new(RateLimitTracker::new()),
        })
    }

    pub fn rate_limit(&self) -> &RateLimitTracker {
        &self.rate_limit
    }

    /// GET `path` and unwrap the V5 envelope into `T`.
    async fn get_result<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.wait_for_quota().await;

        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {path} request failed"))?;

        self.rate_limit.update_from_headers(resp.headers());

        let status = resp.status();
        let body = resp
            .text()
            .await
            .with_context(|| format!("failed to read {path} response body"))?;

        if !status.is_success() {
            bail!("Bybit GET {path} returned {status}: {body}");
        }

        decode_envelope(&body).with_context(|| format!("Bybit GET {path}"))
    }

    async fn wait_for_quota(&self) {
        if !self.rate_limit.is_exhausted() {
            return;
        }
        let reset_at = self.rate_limit.snapshot().reset_at_ms;
        let wait_ms = (reset_at - Utc::now().timestamp_millis()).max(0) as u64;
        let wait = Duration::from_millis(wait_ms).min(MAX_QUOTA_WAIT);
        if !wait.is_zero() {
            warn!(wait_ms = wait.as_millis() as u64, "bybit quota exhausted -- waiting for reset");
            tokio::time::sleep(wait).await;
        }
    }
}

#[async_trait]
impl MarketRest for BybitRestClient {
    /// GET /v5/market/instruments-info: USDT-quoted instruments, one per base
    /// coin.
    #[instrument(skip(self), name = "bybit::tradable_symbols")]
    async fn tradable_symbols(&self) -> Result<Vec<String>> {
        let path = format!(
            "/v5/market/instruments-info?category={}&limit={PAGE_LIMIT}",
            self.category
        );
        let result: InstrumentList = self.get_result(&path).await?;
        let symbols = select_usdt_symbols(result.list);
        debug!(count = symbols.len(), "tradable symbols fetched");
        Ok(symbols)
    }

    /// GET /v5/market/kline: candles in `[start, end]`, oldest first.
    #[instrument(skip(self), name = "bybit::klines")]
    async fn klines(
        &self,
        category: &str,
        symbol: &str,
        interval: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Kline>> {
        let iv = KlineInterval::parse(interval)?;
        let path = format!(
            "/v5/market/kline?category={}&symbol={}&interval={}&start={}&end={}&limit={PAGE_LIMIT}",
            category,
            symbol,
            iv.api_value(),
            start.timestamp_millis(),
            end.timestamp_millis(),
        );
        let result: KlineList = self.get_result(&path).await?;
        let klines = parse_kline_rows(iv, &result.list, Utc::now().timestamp_millis());
        debug!(symbol, interval, count = klines.len(), "klines fetched");
        Ok(klines)
    }
}

impl std::fmt::Debug for BybitRestClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BybitRestClient")
            .field("base_url", &self.base_url)
            .field("category", &self.category)
            .field("rate_limit", &self.rate_limit)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Decoding helpers
// ---------------------------------------------------------------------------

fn decode_envelope<T: DeserializeOwned>(body: &str) -> Result<T> {
    let envelope: BybitResponse<T> =
        serde_json::from_str(body).context("failed to decode response envelope")?;

    if envelope.ret_code != 0 {
        bail!("retCode {}: {}", envelope.ret_code, envelope.ret_msg);
    }

    envelope.result.context("response has no result")
}

/// Keep USDT-quoted, trading instruments; first symbol per base coin wins.
fn select_usdt_symbols(instruments: Vec<Instrument>) -> Vec<String> {
    let mut seen_base = std::collections::HashSet::new();
    instruments
        .into_iter()
        .filter(|i| i.quote_coin == "USDT")
        .filter(|i| i.status.as_deref().map_or(true, |s| s == "Trading"))
        .filter(|i| seen_base.insert(i.base_coin.clone()))
        .map(|i| i.symbol)
        .collect()
}

/// Convert `[start, open, high, low, close, volume, turnover]` rows.
///
/// Rows that are short or non-numeric are skipped.  Only bars whose interval
/// closed before `now_ms` are marked confirmed.
fn parse_kline_rows(interval: KlineInterval, rows: &[Vec<String>], now_ms: i64) -> Vec<Kline> {
    let mut out: Vec<Kline> = rows
        .iter()
        .filter_map(|row| {
            if row.len() < 7 {
                debug!(len = row.len(), "skipping short kline row");
                return None;
            }
            let start = row[0].parse::<i64>().ok()?;
            if row[1..7].iter().any(|v| v.parse::<f64>().is_err()) {
                debug!(start, "skipping non-numeric kline row");
                return None;
            }
            let end = start + interval.duration_ms() - 1;
            Some(Kline {
                start,
                end,
                interval: interval.api_value().to_string(),
                open: row[1].clone(),
                high: row[2].clone(),
                low: row[3].clone(),
                close: row[4].clone(),
                volume: row[5].clone(),
                turnover: row[6].clone(),
                confirm: end < now_ms,
                timestamp: now_ms,
            })
        })
        .collect();

    // Bybit lists newest first.
    out.sort_by_key(|k| k.start);
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
