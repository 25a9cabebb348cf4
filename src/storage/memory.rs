use std::collections::HashSet;

use anyhow::{bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;

use super::{KlineKey, KlineRecord, KlineSink, UpsertOutcome};

/// In-memory sink that enforces the same uniqueness rule as the database.
#[derive(Default)]
pub struct MemoryKlineSink {
    rows: Mutex<Vec<KlineRecord>>,
    keys: Mutex<HashSet<KlineKey>>,
    calls: Mutex<usize>,
    failing_symbol: Option<String>,
}

impl MemoryKlineSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every insert for `symbol` fails with a hard error.
    pub fn failing_for(symbol: &str) -> Self {
        Self {
            failing_symbol: Some(symbol.to_string()),
            ..Self::default()
        }
    }

    pub fn rows(&self) -> Vec<KlineRecord> {
        self.rows.lock().clone()
    }

    pub fn calls(&self) -> usize {
        *self.calls.lock()
    }
}

#[async_trait]
impl KlineSink for MemoryKlineSink {
    async fn upsert_kline(&self, record: &KlineRecord) -> Result<UpsertOutcome> {
        *self.calls.lock() += 1;

        if self.failing_symbol.as_deref() == Some(record.symbol.as_str()) {
            bail!("connection refused");
        }

        if !self.keys.lock().insert(record.key()) {
            return Ok(UpsertOutcome::Duplicate);
        }
        self.rows.lock().push(record.clone());
        Ok(UpsertOutcome::Inserted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn record(confirm: bool) -> KlineRecord {
        let start = Utc.timestamp_millis_opt(1_700_000_000_000).unwrap();
        KlineRecord {
            symbol: "BTCUSDT".into(),
            interval: "1m".into(),
            start,
            end: start + chrono::Duration::milliseconds(59_999),
            open: 1.0,
            close: 2.0,
            high: 3.0,
            low: 0.5,
            volume: 10.0,
            turnover: 20.0,
            confirm,
            timestamp: start,
        }
    }

    #[tokio::test]
    async fn second_insert_is_duplicate() {
        let sink = MemoryKlineSink::new();
        assert_eq!(sink.upsert_kline(&record(true)).await.unwrap(), UpsertOutcome::Inserted);
        assert_eq!(sink.upsert_kline(&record(true)).await.unwrap(), UpsertOutcome::Duplicate);
        assert_eq!(sink.rows().len(), 1);
        assert_eq!(sink.calls(), 2);
    }

    #[tokio::test]
    async fn confirm_flag_is_part_of_identity() {
        let sink = MemoryKlineSink::new();
        sink.upsert_kline(&record(false)).await.unwrap();
        sink.upsert_kline(&record(true)).await.unwrap();
        assert_eq!(sink.rows().len(), 2);
    }
}
