// =============================================================================
// Durable Storage — kline records and the idempotent insert seam
// =============================================================================
//
// A record's identity is (symbol, interval, start, confirm).  Stores must
// treat that tuple as unique and turn a conflicting insert into
// `UpsertOutcome::Duplicate`, never into an error.
// =============================================================================

#[cfg(test)]
pub mod memory;
pub mod postgres;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};

use crate::types::{Kline, KlineInterval};

pub use postgres::PgKlineStore;

/// A candle in its persisted form.
#[derive(Debug, Clone, PartialEq)]
pub struct KlineRecord {
    pub symbol: String,
    /// Storage form of the interval ("1m", "1h", ...).
    pub interval: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub open: f64,
    pub close: f64,
    pub high: f64,
    pub low: f64,
    pub volume: f64,
    pub turnover: f64,
    pub confirm: bool,
    pub timestamp: DateTime<Utc>,
}

/// Uniqueness key of a stored kline.
#[cfg(test)]
pub type KlineKey = (String, String, DateTime<Utc>, bool);

impl KlineRecord {
    /// Convert a wire kline for `symbol`, failing on non-numeric fields or an
    /// unknown interval.
    pub fn from_kline(symbol: &str, k: &Kline) -> Result<Self> {
        let interval = KlineInterval::parse(&k.interval)?;
        Ok(Self {
            symbol: symbol.to_string(),
            interval: interval.db_value().to_string(),
            start: millis_to_utc(k.start, "start")?,
            end: millis_to_utc(k.end, "end")?,
            open: parse_decimal(&k.open, "open")?,
            close: parse_decimal(&k.close, "close")?,
            high: parse_decimal(&k.high, "high")?,
            low: parse_decimal(&k.low, "low")?,
            volume: parse_decimal(&k.volume, "volume")?,
            turnover: parse_decimal(&k.turnover, "turnover")?,
            confirm: k.confirm,
            timestamp: millis_to_utc(k.timestamp, "timestamp")?,
        })
    }

    /// Back to the wire shape; prices use the shortest exact decimal text.
    #[cfg(test)]
    pub fn to_kline(&self) -> Result<Kline> {
        let interval = KlineInterval::from_db_value(&self.interval)?;
        Ok(Kline {
            start: self.start.timestamp_millis(),
            end: self.end.timestamp_millis(),
            interval: interval.api_value().to_string(),
            open: self.open.to_string(),
            close: self.close.to_string(),
            high: self.high.to_string(),
            low: self.low.to_string(),
            volume: self.volume.to_string(),
            turnover: self.turnover.to_string(),
            confirm: self.confirm,
            timestamp: self.timestamp.timestamp_millis(),
        })
    }

    #[cfg(test)]
    pub fn key(&self) -> KlineKey {
        (self.symbol.clone(), self.interval.clone(), self.start, self.confirm)
    }
}

fn parse_decimal(value: &str, name: &str) -> Result<f64> {
    value
        .trim()
        .parse::<f64>()
        .with_context(|| format!("failed to parse {name} as f64: {value:?}"))
}

fn millis_to_utc(ms: i64, name: &str) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .with_context(|| format!("{name} is not a valid epoch-ms timestamp: {ms}"))
}

/// What an insert did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    /// A record with the same identity already existed; nothing was written.
    Duplicate,
}

/// Idempotent write side of the durable store.
#[async_trait]
pub trait KlineSink: Send + Sync {
    async fn upsert_kline(&self, record: &KlineRecord) -> Result<UpsertOutcome>;
}
