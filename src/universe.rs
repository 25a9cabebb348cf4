// =============================================================================
// Universe Scheduler — daily symbol refresh at UTC midnight
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::bybit::MarketRest;
use crate::market_data::{SymbolRegistry, SyncOutcome};

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Time left until the next 00:00 UTC strictly after `now`.
pub fn until_next_utc_midnight(now: DateTime<Utc>) -> Duration {
    let next = now
        .date_naive()
        .succ_opt()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc());
    match next {
        Some(next) => (next - now).to_std().unwrap_or(DAY),
        None => DAY,
    }
}

pub struct UniverseScheduler {
    rest: Arc<dyn MarketRest>,
    registry: Arc<SymbolRegistry>,
    timeout: Duration,
}

impl UniverseScheduler {
    pub fn new(rest: Arc<dyn MarketRest>, registry: Arc<SymbolRegistry>, timeout: Duration) -> Self {
        Self {
            rest,
            registry,
            timeout,
        }
    }

    /// Fetch the tradable symbols and sync them into the registry.
    pub async fn refresh(&self) -> Result<SyncOutcome> {
        let symbols = tokio::time::timeout(self.timeout, self.rest.tradable_symbols())
            .await
            .context("symbol list request timed out")??;
        let fetched = symbols.len();
        let outcome = self.registry.sync_from(symbols);
        info!(
            fetched,
            tracked = self.registry.count(),
            changed = matches!(outcome, SyncOutcome::Changed { .. }),
            "symbol universe refreshed"
        );
        Ok(outcome)
    }

    /// Refresh at every UTC midnight until cancelled.  A failed refresh is
    /// logged and the next tick still runs.
    pub async fn run_daily(&self, cancel: CancellationToken) {
        self.run_from(until_next_utc_midnight(Utc::now()), cancel).await
    }

    /// First refresh after `first`, then one every 24h.
    async fn run_from(&self, first: Duration, cancel: CancellationToken) {
        info!(next_in_secs = first.as_secs(), "daily universe refresh scheduled");

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(first) => {}
        }

        let mut ticker = tokio::time::interval(DAY);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }
            if let Err(e) = self.refresh().await {
                error!(error = %e, "daily universe refresh failed");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use tokio::time::Instant;

    use crate::types::Kline;

    struct ScriptedRest {
        responses: Mutex<VecDeque<Result<Vec<String>>>>,
        calls: Mutex<Vec<Instant>>,
    }

    impl ScriptedRest {
        fn new(responses: Vec<Result<Vec<String>>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<Instant> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl MarketRest for ScriptedRest {
        async fn tradable_symbols(&self) -> Result<Vec<String>> {
            self.calls.lock().push(Instant::now());
            match self.responses.lock().pop_front() {
                Some(r) => r,
                None => bail!("no scripted response"),
            }
        }

        async fn klines(
            &self,
            _: &str,
            _: &str,
            _: &str,
            _: DateTime<Utc>,
            _: DateTime<Utc>,
        ) -> Result<Vec<Kline>> {
            Ok(Vec::new())
        }
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn midnight_is_computed_in_utc() {
        let now = Utc.with_ymd_and_hms(2024, 3, 10, 22, 30, 0).unwrap();
        assert_eq!(until_next_utc_midnight(now), Duration::from_secs(90 * 60));

        let at_midnight = Utc.with_ymd_and_hms(2024, 12, 31, 0, 0, 0).unwrap();
        assert_eq!(until_next_utc_midnight(at_midnight), DAY);
    }

    #[tokio::test]
    async fn refresh_syncs_registry_and_survives_errors() {
        let rest = Arc::new(ScriptedRest::new(vec![
            Ok(names(&["BTCUSDT", "ETHUSDT"])),
            Err(anyhow::anyhow!("timeout")),
            Ok(names(&["ETHUSDT", "BTCUSDT"])),
            Ok(names(&["BTCUSDT", "SOLUSDT"])),
        ]));
        let registry = Arc::new(SymbolRegistry::new("1"));
        let scheduler = UniverseScheduler::new(rest, registry.clone(), Duration::from_secs(1));

        assert!(matches!(scheduler.refresh().await.unwrap(), SyncOutcome::Changed { .. }));
        assert!(scheduler.refresh().await.is_err());
        assert_eq!(registry.count(), 2);

        let generation = registry.generation();
        assert_eq!(scheduler.refresh().await.unwrap(), SyncOutcome::Unchanged);
        assert_eq!(registry.generation(), generation);

        assert_eq!(
            scheduler.refresh().await.unwrap(),
            SyncOutcome::Changed {
                added: names(&["SOLUSDT"]),
                removed: names(&["ETHUSDT"]),
            }
        );
        assert!(registry.contains("SOLUSDT"));
    }

    #[tokio::test]
    async fn run_daily_stops_on_cancel() {
        let rest = Arc::new(ScriptedRest::new(Vec::new()));
        let registry = Arc::new(SymbolRegistry::new("1"));
        let scheduler = UniverseScheduler::new(rest, registry, Duration::from_secs(1));

        let cancel = CancellationToken::new();
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), scheduler.run_daily(cancel))
            .await
            .expect("run_daily ignored cancellation");
    }

    #[tokio::test(start_paused = true)]
    async fn daily_refresh_fires_at_midnight_and_survives_a_failed_day() {
        let rest = Arc::new(ScriptedRest::new(vec![
            Ok(names(&["BTCUSDT", "ETHUSDT"])),
            Err(anyhow::anyhow!("bybit unavailable")),
            Ok(names(&["BTCUSDT", "SOLUSDT"])),
        ]));
        let registry = Arc::new(SymbolRegistry::new("1"));
        let scheduler = Arc::new(UniverseScheduler::new(
            rest.clone(),
            registry.clone(),
            Duration::from_secs(1),
        ));
        let to_midnight = Duration::from_secs(90 * 60);
        let started = Instant::now();

        let cancel = CancellationToken::new();
        let task = tokio::spawn({
            let scheduler = scheduler.clone();
            let cancel = cancel.clone();
            async move { scheduler.run_from(to_midnight, cancel).await }
        });

        tokio::time::sleep(to_midnight - Duration::from_secs(1)).await;
        assert!(rest.calls().is_empty());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(rest.calls().len(), 1);
        assert_eq!(registry.count(), 2);

        // Second midnight: the request fails, the registry is untouched.
        tokio::time::sleep(DAY).await;
        assert_eq!(rest.calls().len(), 2);
        assert!(registry.contains("ETHUSDT"));

        tokio::time::sleep(DAY).await;
        let calls = rest.calls();
        assert_eq!(calls.len(), 3);
        assert!(registry.contains("SOLUSDT"));
        assert!(!registry.contains("ETHUSDT"));

        // The paused clock lands on timer ticks, so allow a millisecond or so.
        let near = |actual: Duration, expected: Duration| {
            actual.max(expected) - actual.min(expected) < Duration::from_millis(5)
        };
        assert!(near(calls[0] - started, to_midnight));
        assert!(near(calls[1] - calls[0], DAY));
        assert!(near(calls[2] - calls[1], DAY));

        cancel.cancel();
        task.await.unwrap();
    }
}
