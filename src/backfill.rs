// =============================================================================
// Startup Backfill — recent history per symbol under a concurrency cap
// =============================================================================
//
// One pass over a snapshot of the universe.  At most `concurrency` symbols
// are fetched at once; every symbol gets its own REST deadline and every
// insert its own shorter deadline.  A failing symbol is logged and never
// holds up the others.  Cancellation aborts every in-flight symbol before
// `run` returns, so the store can be closed right after.
// =============================================================================

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bybit::MarketRest;
use crate::storage::{KlineRecord, KlineSink, UpsertOutcome};
use crate::types::KlineInterval;

/// Per-symbol result counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SymbolStats {
    pub fetched: usize,
    pub inserted: usize,
    pub duplicates: usize,
    pub errors: usize,
}

/// Summary of one backfill pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackfillReport {
    pub symbols: usize,
    pub failed_symbols: usize,
    pub inserted: usize,
    pub duplicates: usize,
    /// Stopped by cancellation before every symbol finished.
    pub cancelled: bool,
}

pub struct Backfill {
    rest: Arc<dyn MarketRest>,
    sink: Arc<dyn KlineSink>,
    category: String,
    interval: KlineInterval,
    window: chrono::Duration,
    concurrency: usize,
    fetch_timeout: Duration,
    insert_timeout: Duration,
}

impl Backfill {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        rest: Arc<dyn MarketRest>,
        sink: Arc<dyn KlineSink>,
        category: impl Into<String>,
        interval: KlineInterval,
        window: chrono::Duration,
        concurrency: usize,
        fetch_timeout: Duration,
        insert_timeout: Duration,
    ) -> Self {
        Self {
            rest,
            sink,
            category: category.into(),
            interval,
            window,
            concurrency: concurrency.max(1),
            fetch_timeout,
            insert_timeout,
        }
    }

    /// Backfill every symbol in `symbols` and wait for all of them, or until
    /// `cancel` fires.
    pub async fn run(
        self: Arc<Self>,
        symbols: Vec<String>,
        cancel: CancellationToken,
    ) -> BackfillReport {
        let started = Instant::now();
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();

        info!(
            symbols = symbols.len(),
            concurrency = self.concurrency,
            window_hours = self.window.num_hours(),
            interval = %self.interval,
            "backfill started"
        );

        let mut report = BackfillReport {
            symbols: symbols.len(),
            ..BackfillReport::default()
        };

        for symbol in symbols {
            let permit = tokio::select! {
                _ = cancel.cancelled() => break,
                permit = semaphore.clone().acquire_owned() => permit,
            };
            let Ok(permit) = permit else {
                break;
            };
            let job = self.clone();
            tasks.spawn(async move {
                let result = job.backfill_symbol(&symbol).await;
                drop(permit);
                (symbol, result)
            });
        }

        loop {
            let joined = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    report.cancelled = true;
                    break;
                }
                joined = tasks.join_next() => joined,
            };
            let Some(joined) = joined else {
                break;
            };
            match joined {
                Ok((symbol, Ok(stats))) => {
                    debug!(
                        symbol = %symbol,
                        fetched = stats.fetched,
                        inserted = stats.inserted,
                        duplicates = stats.duplicates,
                        errors = stats.errors,
                        "symbol backfilled"
                    );
                    report.inserted += stats.inserted;
                    report.duplicates += stats.duplicates;
                    if stats.errors > 0 {
                        report.failed_symbols += 1;
                    }
                }
                Ok((symbol, Err(e))) => {
                    warn!(symbol = %symbol, error = %e, "symbol backfill failed");
                    report.failed_symbols += 1;
                }
                Err(e) => {
                    warn!(error = %e, "backfill task aborted");
                    report.failed_symbols += 1;
                }
            }
        }

        if report.cancelled {
            warn!(in_flight = tasks.len(), "backfill cancelled -- aborting in-flight symbols");
            tasks.shutdown().await;
        }

        info!(
            symbols = report.symbols,
            failed = report.failed_symbols,
            inserted = report.inserted,
            duplicates = report.duplicates,
            cancelled = report.cancelled,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "backfill finished"
        );
        report
    }

    async fn backfill_symbol(&self, symbol: &str) -> Result<SymbolStats> {
        let end = Utc::now();
        let start = end - self.window;

        let klines = tokio::time::timeout(
            self.fetch_timeout,
            self.rest
                .klines(&self.category, symbol, self.interval.api_value(), start, end),
        )
        .await
        .context("kline fetch timed out")??;

        let mut stats = SymbolStats {
            fetched: klines.len(),
            ..SymbolStats::default()
        };

        for kline in klines.iter().filter(|k| k.confirm) {
            let record = match KlineRecord::from_kline(symbol, kline) {
                Ok(r) => r,
                Err(e) => {
                    warn!(symbol, start = kline.start, error = %e, "skipping unconvertible kline");
                    stats.errors += 1;
                    continue;
                }
            };

            match tokio::time::timeout(self.insert_timeout, self.sink.upsert_kline(&record)).await {
                Ok(Ok(UpsertOutcome::Inserted)) => stats.inserted += 1,
                Ok(Ok(UpsertOutcome::Duplicate)) => stats.duplicates += 1,
                Ok(Err(e)) => {
                    warn!(symbol, start = kline.start, error = %e, "backfill insert failed");
                    stats.errors += 1;
                }
                Err(_) => {
                    warn!(symbol, start = kline.start, "backfill insert timed out");
                    stats.errors += 1;
                }
            }
        }

        Ok(stats)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use anyhow::bail;
    use async_trait::async_trait;
    use chrono::DateTime;
    use parking_lot::Mutex;

    use crate::storage::memory::MemoryKlineSink;
    use crate::types::Kline;

    #[derive(Default)]
    struct FakeRest {
        delay: Duration,
        failing: Option<String>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        windows: Mutex<HashMap<String, (DateTime<Utc>, DateTime<Utc>)>>,
    }

    fn kline(start: i64, confirm: bool) -> Kline {
        Kline {
            start,
            end: start + 59_999,
            interval: "1".into(),
            open: "1".into(),
            close: "2".into(),
            high: "3".into(),
            low: "0.5".into(),
            volume: "10".into(),
            turnover: "20".into(),
            confirm,
            timestamp: start + 60_000,
        }
    }

    #[async_trait]
    impl MarketRest for FakeRest {
        async fn tradable_symbols(&self) -> Result<Vec<String>> {
            Ok(Vec::new())
        }

        async fn klines(
            &self,
            _category: &str,
            symbol: &str,
            _interval: &str,
            start: DateTime<Utc>,
            end: DateTime<Utc>,
        ) -> Result<Vec<Kline>> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            self.windows.lock().insert(symbol.to_string(), (start, end));

            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if self.failing.as_deref() == Some(symbol) {
                bail!("HTTP 502");
            }
            Ok(vec![
                kline(0, true),
                kline(60_000, true),
                kline(120_000, false),
            ])
        }
    }

    fn backfill(rest: Arc<FakeRest>, sink: Arc<MemoryKlineSink>, concurrency: usize) -> Arc<Backfill> {
        Arc::new(Backfill::new(
            rest,
            sink,
            "linear",
            KlineInterval::parse("1").unwrap(),
            chrono::Duration::hours(4),
            concurrency,
            Duration::from_secs(5),
            Duration::from_secs(1),
        ))
    }

    fn symbols(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("SYM{i}USDT")).collect()
    }

    #[tokio::test]
    async fn concurrency_is_capped() {
        let rest = Arc::new(FakeRest {
            delay: Duration::from_millis(20),
            ..FakeRest::default()
        });
        let sink = Arc::new(MemoryKlineSink::new());

        let report = backfill(rest.clone(), sink.clone(), 3).run(symbols(12), CancellationToken::new()).await;

        assert!(rest.max_in_flight.load(Ordering::SeqCst) <= 3);
        assert_eq!(rest.windows.lock().len(), 12);
        assert_eq!(report.symbols, 12);
        assert_eq!(report.failed_symbols, 0);
        assert_eq!(report.inserted, 24);
    }

    #[tokio::test]
    async fn only_confirmed_candles_are_persisted() {
        let rest = Arc::new(FakeRest::default());
        let sink = Arc::new(MemoryKlineSink::new());

        backfill(rest, sink.clone(), 2).run(vec!["BTCUSDT".into()], CancellationToken::new()).await;

        let rows = sink.rows();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.confirm));
    }

    #[tokio::test]
    async fn failures_are_isolated_per_symbol() {
        let rest = Arc::new(FakeRest {
            failing: Some("BADUSDT".into()),
            ..FakeRest::default()
        });
        let sink = Arc::new(MemoryKlineSink::failing_for("ETHUSDT"));

        let report = backfill(rest, sink.clone(), 2)
            .run(
                vec!["BADUSDT".into(), "ETHUSDT".into(), "BTCUSDT".into()],
                CancellationToken::new(),
            )
            .await;

        assert_eq!(report.failed_symbols, 2);
        assert_eq!(report.inserted, 2);
        let rows = sink.rows();
        assert!(rows.iter().all(|r| r.symbol == "BTCUSDT"));
    }

    #[tokio::test]
    async fn rerun_reports_duplicates() {
        let rest = Arc::new(FakeRest::default());
        let sink = Arc::new(MemoryKlineSink::new());
        let job = backfill(rest, sink.clone(), 4);

        job.clone().run(vec!["BTCUSDT".into()], CancellationToken::new()).await;
        let second = job.run(vec!["BTCUSDT".into()], CancellationToken::new()).await;

        assert_eq!(second.inserted, 0);
        assert_eq!(second.duplicates, 2);
        assert_eq!(sink.rows().len(), 2);
    }

    #[tokio::test]
    async fn fetch_window_is_trailing() {
        let rest = Arc::new(FakeRest::default());
        let sink = Arc::new(MemoryKlineSink::new());

        backfill(rest.clone(), sink, 1).run(vec!["BTCUSDT".into()], CancellationToken::new()).await;

        let (start, end) = rest.windows.lock()["BTCUSDT"];
        assert_eq!(end - start, chrono::Duration::hours(4));
        assert!(end <= Utc::now());
    }

    #[tokio::test]
    async fn cancel_aborts_in_flight_symbols() {
        let rest = Arc::new(FakeRest {
            delay: Duration::from_secs(30),
            ..FakeRest::default()
        });
        let sink = Arc::new(MemoryKlineSink::new());
        let cancel = CancellationToken::new();

        let job = backfill(rest.clone(), sink.clone(), 2);
        let run = tokio::spawn(job.run(symbols(5), cancel.clone()));
        while rest.in_flight.load(Ordering::SeqCst) < 2 {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        cancel.cancel();

        let report = tokio::time::timeout(Duration::from_secs(1), run)
            .await
            .expect("backfill ignored cancellation")
            .unwrap();
        assert!(report.cancelled);
        assert_eq!(report.inserted, 0);
        assert_eq!(rest.windows.lock().len(), 2);
        assert!(sink.rows().is_empty());
    }
}
