// =============================================================================
// Collector Configuration — JSON file with serde defaults + env overrides
// =============================================================================
//
// Every field carries `#[serde(default)]` so that a partial config file (or
// none at all) still yields a runnable collector.  Deployment secrets such as
// the Postgres password are normally supplied through the environment.
// =============================================================================

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgConnectOptions, PgSslMode};
use tracing::info;

use crate::types::KlineInterval;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_rest_base_url() -> String {
    "https://api.bybit.com".to_string()
}

fn default_rest_timeout_secs() -> u64 {
    10
}

fn default_ws_url() -> String {
    "wss://stream.bybit.com/v5/public/linear".to_string()
}

fn default_ws_interval() -> String {
    "1".to_string()
}

fn default_retry_delay_secs() -> u64 {
    3
}

fn default_ping_interval_secs() -> u64 {
    20
}

fn default_category() -> String {
    "linear".to_string()
}

fn default_pg_host() -> String {
    "localhost".to_string()
}

fn default_pg_port() -> u16 {
    5432
}

fn default_pg_user() -> String {
    "postgres".to_string()
}

fn default_pg_dbname() -> String {
    "wscollector".to_string()
}

fn default_sslmode() -> String {
    "disable".to_string()
}

fn default_max_connections() -> u32 {
    10
}

fn default_window_hours() -> u64 {
    4
}

fn default_concurrency() -> usize {
    10
}

fn default_insert_timeout_secs() -> u64 {
    2
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "console".to_string()
}

fn default_environment() -> String {
    "dev".to_string()
}

fn default_stats_interval_secs() -> u64 {
    5
}

// =============================================================================
// Sections
// =============================================================================

/// Bybit REST endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestConfig {
    #[serde(default = "default_rest_base_url")]
    pub base_url: String,

    /// Per-request deadline for every REST call.
    #[serde(default = "default_rest_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for RestConfig {
    fn default() -> Self {
        Self {
            base_url: default_rest_base_url(),
            timeout_secs: default_rest_timeout_secs(),
        }
    }
}

impl RestConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Bybit public WebSocket settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsConfig {
    #[serde(default = "default_ws_url")]
    pub url: String,

    /// Kline interval in API form ("1", "5", "60", "D", ...).
    #[serde(default = "default_ws_interval")]
    pub interval: String,

    /// Fixed sleep between reconnect attempts.
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,

    /// Heartbeat ping period; 0 disables the heartbeat.
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            url: default_ws_url(),
            interval: default_ws_interval(),
            retry_delay_secs: default_retry_delay_secs(),
            ping_interval_secs: default_ping_interval_secs(),
        }
    }
}

impl WsConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    pub fn ping_interval(&self) -> Option<Duration> {
        (self.ping_interval_secs > 0).then(|| Duration::from_secs(self.ping_interval_secs))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BybitConfig {
    #[serde(default)]
    pub rest: RestConfig,

    #[serde(default)]
    pub ws: WsConfig,

    /// Market category used for REST calls ("linear", "spot", "inverse").
    #[serde(default = "default_category")]
    pub category: String,
}

impl Default for BybitConfig {
    fn default() -> Self {
        Self {
            rest: RestConfig::default(),
            ws: WsConfig::default(),
            category: default_category(),
        }
    }
}

/// Postgres connection settings.
#[derive(Clone, Serialize, Deserialize)]
pub struct PostgresConfig {
    #[serde(default = "default_pg_host")]
    pub host: String,

    #[serde(default = "default_pg_port")]
    pub port: u16,

    #[serde(default = "default_pg_user")]
    pub user: String,

    #[serde(default)]
    pub password: String,

    #[serde(default = "default_pg_dbname")]
    pub dbname: String,

    #[serde(default = "default_sslmode")]
    pub sslmode: String,

    /// Optional session time zone, e.g. "UTC".
    #[serde(default)]
    pub timezone: Option<String>,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Create the database on startup when it does not exist yet.
    #[serde(default)]
    pub create_database: bool,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            host: default_pg_host(),
            port: default_pg_port(),
            user: default_pg_user(),
            password: String::new(),
            dbname: default_pg_dbname(),
            sslmode: default_sslmode(),
            timezone: None,
            max_connections: default_max_connections(),
            create_database: false,
        }
    }
}

impl PostgresConfig {
    /// Connect options for the collector database.
    pub fn connect_options(&self) -> Result<PgConnectOptions> {
        self.options_for(&self.dbname)
    }

    /// Connect options for the maintenance database, used to create `dbname`.
    pub fn admin_connect_options(&self) -> Result<PgConnectOptions> {
        self.options_for("postgres")
    }

    // Built field by field so credentials never pass through a URL.
    fn options_for(&self, dbname: &str) -> Result<PgConnectOptions> {
        let ssl_mode = PgSslMode::from_str(&self.sslmode)
            .with_context(|| format!("invalid postgres.sslmode {:?}", self.sslmode))?;

        let mut options = PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.user)
            .password(&self.password)
            .database(dbname)
            .ssl_mode(ssl_mode);
        if let Some(tz) = self.timezone.as_deref().filter(|tz| !tz.trim().is_empty()) {
            options = options.options([("TimeZone", tz)]);
        }
        Ok(options)
    }
}

impl std::fmt::Debug for PostgresConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("dbname", &self.dbname)
            .field("sslmode", &self.sslmode)
            .field("timezone", &self.timezone)
            .field("max_connections", &self.max_connections)
            .field("create_database", &self.create_database)
            .finish()
    }
}

/// Startup backfill settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackfillConfig {
    /// Trailing history window fetched per symbol.
    #[serde(default = "default_window_hours")]
    pub window_hours: u64,

    /// Maximum number of symbols fetched at once.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Deadline for each single insert; must be shorter than the REST timeout.
    #[serde(default = "default_insert_timeout_secs")]
    pub insert_timeout_secs: u64,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            window_hours: default_window_hours(),
            concurrency: default_concurrency(),
            insert_timeout_secs: default_insert_timeout_secs(),
        }
    }
}

impl BackfillConfig {
    pub fn window(&self) -> chrono::Duration {
        chrono::Duration::hours(self.window_hours as i64)
    }

    pub fn insert_timeout(&self) -> Duration {
        Duration::from_secs(self.insert_timeout_secs)
    }
}

/// Logging output settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// "trace" | "debug" | "info" | "warn" | "error" (or any EnvFilter directive).
    #[serde(default = "default_log_level")]
    pub level: String,

    /// "console" or "json".
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Optional log file; rotated daily.
    #[serde(default)]
    pub output_file: Option<String>,

    /// "dev" forces console output.
    #[serde(default = "default_environment")]
    pub environment: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            output_file: None,
            environment: default_environment(),
        }
    }
}

impl LogConfig {
    pub fn is_json(&self) -> bool {
        self.environment != "dev" && self.format.eq_ignore_ascii_case("json")
    }
}

// =============================================================================
// CollectorConfig
// =============================================================================

/// Top-level configuration for the collector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectorConfig {
    #[serde(default)]
    pub bybit: BybitConfig,

    #[serde(default)]
    pub postgres: PostgresConfig,

    #[serde(default)]
    pub backfill: BackfillConfig,

    #[serde(default)]
    pub log: LogConfig,

    /// How often the candle count is logged.
    #[serde(default = "default_stats_interval_secs")]
    pub stats_interval_secs: u64,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            bybit: BybitConfig::default(),
            postgres: PostgresConfig::default(),
            backfill: BackfillConfig::default(),
            log: LogConfig::default(),
            stats_interval_secs: default_stats_interval_secs(),
        }
    }
}

impl CollectorConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read collector config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse collector config from {}", path.display()))?;

        info!(
            path = %path.display(),
            interval = %config.bybit.ws.interval,
            ws_url = %config.bybit.ws.url,
            "collector config loaded"
        );

        Ok(config)
    }

    /// Apply environment overrides on top of the file values.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let set = |target: &mut String, key: &str| {
            if let Some(v) = lookup(key).filter(|v| !v.trim().is_empty()) {
                *target = v.trim().to_string();
            }
        };

        set(&mut self.bybit.rest.base_url, "BYBIT_REST_BASE_URL");
        set(&mut self.bybit.ws.url, "BYBIT_WS_URL");
        set(&mut self.bybit.ws.interval, "BYBIT_WS_INTERVAL");
        set(&mut self.bybit.category, "BYBIT_CATEGORY");
        set(&mut self.postgres.host, "POSTGRES_HOST");
        set(&mut self.postgres.user, "POSTGRES_USER");
        set(&mut self.postgres.password, "POSTGRES_PASSWORD");
        set(&mut self.postgres.dbname, "POSTGRES_DBNAME");
        set(&mut self.log.level, "LOG_LEVEL");
        set(&mut self.log.format, "LOG_FORMAT");

        if let Some(port) = lookup("POSTGRES_PORT").and_then(|v| v.trim().parse::<u16>().ok()) {
            self.postgres.port = port;
        }
    }

    /// Reject settings the collector cannot run with.
    pub fn validate(&self) -> Result<KlineInterval> {
        let interval = KlineInterval::parse(&self.bybit.ws.interval)?;

        if self.bybit.category.trim().is_empty() {
            bail!("bybit.category must not be empty");
        }
        if self.bybit.ws.retry_delay_secs == 0 {
            bail!("bybit.ws.retry_delay_secs must be at least 1");
        }
        self.postgres.connect_options()?;

        if self.backfill.concurrency == 0 {
            bail!("backfill.concurrency must be at least 1");
        }
        if self.backfill.insert_timeout_secs >= self.bybit.rest.timeout_secs {
            bail!(
                "backfill.insert_timeout_secs ({}) must be shorter than bybit.rest.timeout_secs ({})",
                self.backfill.insert_timeout_secs,
                self.bybit.rest.timeout_secs
            );
        }
        if self.stats_interval_secs == 0 {
            bail!("stats_interval_secs must be at least 1");
        }

        Ok(interval)
    }
}
