// =============================================================================
// Kline Router — decode stream payloads and fan confirmed candles out
// =============================================================================
//
// Each payload is checked for its control fields first.  Anything without a
// `kline.` topic (pong, subscribe ack) stops there.  Kline pushes are fully
// decoded; confirmed candles go to the in-memory store and then to durable
// storage.  Nothing in here returns an error: every failure is logged and the
// next candle or payload carries on.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, trace, warn};

use super::kline_store::KlineStore;
use super::symbol_registry::KLINE_TOPIC_PREFIX;
use crate::bybit::ws::PayloadHandler;
use crate::storage::{KlineRecord, KlineSink, UpsertOutcome};
use crate::types::Kline;

/// Cheap first pass over a payload.
#[derive(Debug, Deserialize)]
struct Header {
    #[serde(default)]
    topic: Option<String>,
    #[serde(default)]
    op: Option<String>,
    #[serde(default)]
    success: Option<bool>,
    #[serde(default)]
    ret_msg: Option<String>,
}

/// `{ "topic": "kline.1.BTCUSDT", "data": [...], "ts": .., "type": "snapshot" }`
#[derive(Debug, Deserialize)]
struct KlinePush {
    topic: String,
    data: Vec<Kline>,
    #[serde(default)]
    ts: i64,
    #[serde(rename = "type", default)]
    kind: String,
}

/// Symbol of a `kline.<interval>.<symbol>` topic.
pub fn symbol_from_topic(topic: &str) -> Option<&str> {
    let mut parts = topic.split('.');
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some("kline"), Some(interval), Some(symbol), None)
            if !interval.is_empty() && !symbol.is_empty() =>
        {
            Some(symbol)
        }
        _ => None,
    }
}

/// Stream payload handler feeding the candle store and the durable sink.
pub struct KlineRouter {
    store: Arc<KlineStore>,
    sink: Arc<dyn KlineSink>,
    insert_timeout: Duration,
}

impl KlineRouter {
    pub fn new(store: Arc<KlineStore>, sink: Arc<dyn KlineSink>, insert_timeout: Duration) -> Self {
        Self {
            store,
            sink,
            insert_timeout,
        }
    }

    async fn route(&self, payload: &str) {
        let header: Header = match serde_json::from_str(payload) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "discarding undecodable stream payload");
                return;
            }
        };

        let topic = match header.topic.as_deref() {
            Some(t) if t.starts_with(KLINE_TOPIC_PREFIX) => t,
            _ => {
                log_control(&header);
                return;
            }
        };

        let symbol = match symbol_from_topic(topic) {
            Some(s) => s.to_string(),
            None => {
                warn!(topic, "discarding kline push with malformed topic");
                return;
            }
        };

        let push: KlinePush = match serde_json::from_str(payload) {
            Ok(p) => p,
            Err(e) => {
                warn!(topic, error = %e, "discarding malformed kline push");
                return;
            }
        };
        trace!(topic = %push.topic, kind = %push.kind, ts = push.ts, candles = push.data.len(), "kline push");

        for kline in push.data {
            if !kline.confirm {
                continue;
            }
            self.store.add(&symbol, kline.clone());

            let record = match KlineRecord::from_kline(&symbol, &kline) {
                Ok(r) => r,
                Err(e) => {
                    warn!(symbol = %symbol, start = kline.start, error = %e, "skipping unconvertible kline");
                    continue;
                }
            };
            self.persist(&record).await;
        }
    }

    async fn persist(&self, record: &KlineRecord) {
        match tokio::time::timeout(self.insert_timeout, self.sink.upsert_kline(record)).await {
            Ok(Ok(UpsertOutcome::Inserted)) => {
                debug!(symbol = %record.symbol, start = %record.start, "kline stored");
            }
            Ok(Ok(UpsertOutcome::Duplicate)) => {
                debug!(symbol = %record.symbol, start = %record.start, "duplicate kline ignored");
            }
            Ok(Err(e)) => {
                warn!(symbol = %record.symbol, start = %record.start, error = %e, "failed to store kline");
            }
            Err(_) => {
                warn!(
                    symbol = %record.symbol,
                    start = %record.start,
                    timeout_ms = self.insert_timeout.as_millis() as u64,
                    "kline insert timed out"
                );
            }
        }
    }
}

fn log_control(header: &Header) {
    match (header.op.as_deref(), header.success) {
        (Some(op), Some(false)) => {
            warn!(op, ret_msg = header.ret_msg.as_deref().unwrap_or(""), "stream request rejected");
        }
        (Some(op), _) => debug!(op, "stream control message"),
        _ => debug!(topic = header.topic.as_deref().unwrap_or(""), "ignoring non-kline payload"),
    }
}

#[async_trait]
impl PayloadHandler for KlineRouter {
    async fn handle(&self, payload: &str) {
        self.route(payload).await;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryKlineSink;

    fn push(topic: &str, candles: &[(&str, bool)]) -> String {
        let data: Vec<String> = candles
            .iter()
            .enumerate()
            .map(|(i, (close, confirm))| {
                let start = 1_672_324_800_000_i64 + i as i64 * 60_000;
                format!(
                    r#"{{"start":{start},"end":{end},"interval":"1","open":"16649.5","close":"{close}","high":"16677","low":"16608","volume":"2.081","turnover":"34666.4005","confirm":{confirm},"timestamp":1672324988882}}"#,
                    end = start + 59_999,
                )
            })
            .collect();
        format!(
            r#"{{"topic":"{topic}","data":[{}],"ts":1672324988882,"type":"snapshot"}}"#,
            data.join(",")
        )
    }

    fn router() -> (KlineRouter, Arc<KlineStore>, Arc<MemoryKlineSink>) {
        let store = Arc::new(KlineStore::new());
        let sink = Arc::new(MemoryKlineSink::new());
        let router = KlineRouter::new(store.clone(), sink.clone(), Duration::from_secs(1));
        (router, store, sink)
    }

    #[test]
    fn symbol_extraction() {
        assert_eq!(symbol_from_topic("kline.1.BTCUSDT"), Some("BTCUSDT"));
        assert_eq!(symbol_from_topic("kline.D.ETHUSDT"), Some("ETHUSDT"));
        assert_eq!(symbol_from_topic("kline.1"), None);
        assert_eq!(symbol_from_topic("kline.1."), None);
        assert_eq!(symbol_from_topic("kline.1.BTC.USDT"), None);
        assert_eq!(symbol_from_topic("tickers.BTCUSDT"), None);
    }

    #[tokio::test]
    async fn unconfirmed_candle_is_dropped() {
        let (router, store, sink) = router();
        router.handle(&push("kline.1.BTCUSDT", &[("16677", false)])).await;
        assert_eq!(store.count_all(), 0);
        assert_eq!(sink.calls(), 0);
    }

    #[tokio::test]
    async fn confirmed_candle_reaches_store_and_sink() {
        let (router, store, sink) = router();
        router.handle(&push("kline.1.BTCUSDT", &[("16677", true)])).await;

        let stored = store.get_by_symbol("BTCUSDT");
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].close, "16677");

        assert_eq!(sink.calls(), 1);
        let rows = sink.rows();
        assert_eq!(rows[0].symbol, "BTCUSDT");
        assert_eq!(rows[0].interval, "1m");
        assert_eq!(rows[0].start.timestamp_millis(), 1_672_324_800_000);
        assert!((rows[0].close - 16677.0).abs() < f64::EPSILON);
        assert!(rows[0].confirm);
    }

    #[tokio::test]
    async fn bad_candle_does_not_affect_siblings() {
        let (router, store, sink) = router();
        router
            .handle(&push("kline.1.BTCUSDT", &[("oops", true), ("16700", true), ("16710", false)]))
            .await;

        assert_eq!(store.get_by_symbol("BTCUSDT").len(), 2);
        assert_eq!(sink.calls(), 1);
        assert!((sink.rows()[0].close - 16700.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn replayed_push_is_a_duplicate_not_an_error() {
        let (router, store, sink) = router();
        let payload = push("kline.1.BTCUSDT", &[("16677", true)]);
        router.handle(&payload).await;
        router.handle(&payload).await;

        assert_eq!(sink.calls(), 2);
        assert_eq!(sink.rows().len(), 1);
        assert_eq!(store.get_by_symbol("BTCUSDT").len(), 2);
    }

    #[tokio::test]
    async fn control_and_malformed_payloads_are_ignored() {
        let (router, store, sink) = router();
        router
            .handle(r#"{"success":true,"ret_msg":"pong","conn_id":"x","op":"ping"}"#)
            .await;
        router
            .handle(r#"{"success":false,"ret_msg":"error:handler not found","op":"subscribe"}"#)
            .await;
        router.handle("not json").await;
        router.handle(&push("kline.1", &[("16677", true)])).await;
        router.handle(r#"{"topic":"kline.1.BTCUSDT","data":"nope"}"#).await;

        assert_eq!(store.count_all(), 0);
        assert_eq!(sink.calls(), 0);
    }

    #[tokio::test]
    async fn sink_failure_is_swallowed() {
        let store = Arc::new(KlineStore::new());
        let sink = Arc::new(MemoryKlineSink::failing_for("BTCUSDT"));
        let router = KlineRouter::new(store.clone(), sink.clone(), Duration::from_secs(1));

        router.handle(&push("kline.1.BTCUSDT", &[("1", true), ("2", true)])).await;
        assert_eq!(sink.calls(), 2);
        assert_eq!(store.get_by_symbol("BTCUSDT").len(), 2);
    }
}
