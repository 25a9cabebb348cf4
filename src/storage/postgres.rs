// =============================================================================
// Postgres kline store — sqlx pool, schema bootstrap, insert-ignore
// =============================================================================

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::{debug, info};

use super::{KlineRecord, KlineSink, UpsertOutcome};
use crate::config::PostgresConfig;

const CREATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS kline_record (
    id          BIGSERIAL PRIMARY KEY,
    symbol      TEXT NOT NULL,
    "interval"  VARCHAR(10) NOT NULL,
    "start"     TIMESTAMPTZ NOT NULL,
    "end"       TIMESTAMPTZ NOT NULL,
    open        DOUBLE PRECISION NOT NULL,
    close       DOUBLE PRECISION NOT NULL,
    high        DOUBLE PRECISION NOT NULL,
    low         DOUBLE PRECISION NOT NULL,
    volume      DOUBLE PRECISION NOT NULL,
    turnover    DOUBLE PRECISION NOT NULL,
    confirm     BOOLEAN NOT NULL,
    "timestamp" TIMESTAMPTZ NOT NULL,
    recorded_at TIMESTAMPTZ NOT NULL DEFAULT now()
)
"#;

const CREATE_UNIQUE_INDEX: &str = r#"
CREATE UNIQUE INDEX IF NOT EXISTS idx_symbol_interval_start_confirm
    ON kline_record (symbol, "interval", "start", confirm)
"#;

const CREATE_SYMBOL_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_kline_symbol ON kline_record (symbol)";

const CREATE_TIMESTAMP_INDEX: &str =
    r#"CREATE INDEX IF NOT EXISTS idx_kline_timestamp ON kline_record ("timestamp")"#;

const INSERT_KLINE: &str = r#"
INSERT INTO kline_record
    (symbol, "interval", "start", "end", open, close, high, low, volume, turnover, confirm, "timestamp")
VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
ON CONFLICT (symbol, "interval", "start", confirm) DO NOTHING
"#;

/// Kline persistence backed by a Postgres connection pool.
#[derive(Clone)]
pub struct PgKlineStore {
    pool: PgPool,
}

impl PgKlineStore {
    /// Connect, optionally create the database, and make sure the schema
    /// exists.  Any failure here is fatal to startup.
    pub async fn connect_and_migrate(cfg: &PostgresConfig) -> Result<Self> {
        if cfg.create_database {
            create_database(cfg).await?;
        }

        let pool = PgPoolOptions::new()
            .max_connections(cfg.max_connections.max(1))
            .connect_with(cfg.connect_options()?)
            .await
            .with_context(|| {
                format!("failed to connect to postgres at {}:{}/{}", cfg.host, cfg.port, cfg.dbname)
            })?;

        let store = Self { pool };
        store.migrate().await?;

        info!(host = %cfg.host, dbname = %cfg.dbname, "postgres kline store ready");
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        for statement in [
            CREATE_TABLE,
            CREATE_UNIQUE_INDEX,
            CREATE_SYMBOL_INDEX,
            CREATE_TIMESTAMP_INDEX,
        ] {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .context("kline_record migration failed")?;
        }
        debug!("kline_record schema verified");
        Ok(())
    }

    pub async fn is_healthy(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl KlineSink for PgKlineStore {
    async fn upsert_kline(&self, record: &KlineRecord) -> Result<UpsertOutcome> {
        let result = sqlx::query(INSERT_KLINE)
            .bind(&record.symbol)
            .bind(&record.interval)
            .bind(record.start)
            .bind(record.end)
            .bind(record.open)
            .bind(record.close)
            .bind(record.high)
            .bind(record.low)
            .bind(record.volume)
            .bind(record.turnover)
            .bind(record.confirm)
            .bind(record.timestamp)
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to insert kline for {}", record.symbol))?;

        if result.rows_affected() == 0 {
            Ok(UpsertOutcome::Duplicate)
        } else {
            Ok(UpsertOutcome::Inserted)
        }
    }
}

/// Create `cfg.dbname` through the maintenance database if it is missing.
async fn create_database(cfg: &PostgresConfig) -> Result<()> {
    if cfg.dbname.is_empty() || cfg.dbname.contains('"') {
        bail!("refusing to create database with name {:?}", cfg.dbname);
    }

    let admin = PgPoolOptions::new()
        .max_connections(1)
        .connect_with(cfg.admin_connect_options()?)
        .await
        .context("failed to connect to postgres maintenance database")?;

    let exists: bool =
        sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM pg_database WHERE datname = $1)")
            .bind(&cfg.dbname)
            .fetch_one(&admin)
            .await
            .context("failed to check whether database exists")?;

    if !exists {
        let statement = format!("CREATE DATABASE \"{}\"", cfg.dbname);
        sqlx::query(&statement)
            .execute(&admin)
            .await
            .with_context(|| format!("failed to create database {}", cfg.dbname))?;
        info!(dbname = %cfg.dbname, "database created");
    }

    admin.close().await;
    Ok(())
}
