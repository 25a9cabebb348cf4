// =============================================================================
// Bybit Kline Collector — Main Entry Point
// =============================================================================
//
// Startup failures (bad interval, database, first WebSocket connect) end the
// process.  After that every subsystem logs and keeps going until Ctrl+C.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod backfill;
mod bybit;
mod config;
mod market_data;
mod storage;
mod telemetry;
mod types;
mod universe;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::backfill::Backfill;
use crate::bybit::ws::{StreamClient, WsConnector};
use crate::bybit::BybitRestClient;
use crate::config::CollectorConfig;
use crate::market_data::{KlineRouter, KlineStore, SymbolRegistry};
use crate::storage::PgKlineStore;
use crate::universe::UniverseScheduler;

const DEFAULT_CONFIG_PATH: &str = "collector_config.json";
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    let config_path =
        std::env::var("COLLECTOR_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let loaded = CollectorConfig::load(&config_path);
    let load_error = loaded.as_ref().err().map(|e| format!("{e:#}"));
    let mut config = loaded.unwrap_or_default();
    config.apply_env();

    let _log_guard = telemetry::init(&config.log)?;

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Bybit Kline Collector — Starting Up               ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    if let Some(e) = load_error {
        warn!(path = %config_path, error = %e, "Failed to load config, using defaults");
    }

    let interval = config.validate()?;
    info!(
        interval = %interval,
        category = %config.bybit.category,
        ws_url = %config.bybit.ws.url,
        postgres = ?config.postgres,
        "Collector configured"
    );

    // ── 2. Durable storage ───────────────────────────────────────────────
    let pg = Arc::new(
        PgKlineStore::connect_and_migrate(&config.postgres)
            .await
            .context("database startup failed")?,
    );

    // ── 3. Bybit REST client + shared state ──────────────────────────────
    let rest = Arc::new(BybitRestClient::new(
        &config.bybit.rest.base_url,
        &config.bybit.category,
        config.bybit.rest.timeout(),
    )?);
    let registry = Arc::new(SymbolRegistry::new(interval.api_value()));
    let store = Arc::new(KlineStore::new());

    let cancel = CancellationToken::new();
    let mut tasks = JoinSet::new();

    // ── 4. Symbol universe: initial load, then daily at 00:00 UTC ────────
    let scheduler = Arc::new(UniverseScheduler::new(
        rest.clone(),
        registry.clone(),
        config.bybit.rest.timeout(),
    ));
    if let Err(e) = scheduler.refresh().await {
        error!(error = %e, "Initial universe load failed -- waiting for the daily refresh");
    }
    {
        let scheduler = scheduler.clone();
        let cancel = cancel.clone();
        tasks.spawn(async move { scheduler.run_daily(cancel).await });
    }

    // ── 5. Historical backfill (runs alongside the stream) ──────────────
    let job = Arc::new(Backfill::new(
        rest.clone(),
        pg.clone(),
        config.bybit.category.clone(),
        interval,
        config.backfill.window(),
        config.backfill.concurrency,
        config.bybit.rest.timeout(),
        config.backfill.insert_timeout(),
    ));
    {
        let snapshot = registry.sorted();
        let cancel = cancel.clone();
        tasks.spawn(async move {
            job.run(snapshot, cancel).await;
        });
    }

    // ── 6. Live kline stream ─────────────────────────────────────────────
    let router = Arc::new(KlineRouter::new(
        store.clone(),
        pg.clone(),
        config.backfill.insert_timeout(),
    ));
    let mut client = StreamClient::new(
        config.bybit.ws.url.clone(),
        WsConnector,
        registry.clone(),
        config.bybit.ws.retry_delay(),
    )
    .with_handler(router)
    .with_ping_interval(config.bybit.ws.ping_interval());

    client.connect().await.context("kline stream startup failed")?;
    info!(topics = client.topics().len(), "Kline stream live");
    {
        let cancel = cancel.clone();
        tasks.spawn(async move { client.listen(cancel).await });
    }

    // ── 7. Stats ─────────────────────────────────────────────────────────
    {
        let store = store.clone();
        let registry = registry.clone();
        let rest = rest.clone();
        let cancel = cancel.clone();
        let period = Duration::from_secs(config.stats_interval_secs);
        tasks.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let quota = rest.rate_limit().snapshot();
                info!(
                    candles = store.count_all(),
                    symbols_with_candles = store.symbol_count(),
                    universe = registry.count(),
                    rest_quota_remaining = quota.remaining,
                    rest_quota_limit = quota.limit,
                    "collector stats"
                );
            }
        });
    }

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 8. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received -- stopping gracefully");
    cancel.cancel();

    let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
        while tasks.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!("Tasks still running after grace period -- aborting");
        tasks.abort_all();
    }

    if !pg.is_healthy().await {
        warn!("Database was unreachable at shutdown");
    }
    pg.close().await;

    info!("Bybit Kline Collector shut down complete.");
    Ok(())
}
