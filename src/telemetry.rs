// =============================================================================
// Telemetry — tracing subscriber setup (stdout + optional rotated file)
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

use crate::config::LogConfig;

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync + 'static>;

/// Install the global subscriber.
///
/// `RUST_LOG` takes precedence over `cfg.level`. The returned guard flushes
/// the file writer on drop and must be kept alive for the whole process.
pub fn init(cfg: &LogConfig) -> Result<Option<WorkerGuard>> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cfg.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let mut layers: Vec<BoxedLayer> = Vec::new();

    if cfg.is_json() {
        layers.push(fmt::layer().json().with_target(false).boxed());
    } else {
        layers.push(fmt::layer().compact().with_target(false).boxed());
    }

    let guard = match cfg.output_file.as_deref() {
        Some(file) => {
            let (layer, guard) = file_layer(Path::new(file))?;
            layers.push(layer);
            Some(guard)
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(layers)
        .with(env_filter)
        .try_init()
        .context("failed to install tracing subscriber")?;

    Ok(guard)
}

/// JSON lines into `path`, rotated daily.
fn file_layer(path: &Path) -> Result<(BoxedLayer, WorkerGuard)> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create log directory {}", dir.display()))?;

    let file_name = path
        .file_name()
        .context("log output_file has no file name")?;

    let appender = tracing_appender::rolling::daily(dir, file_name);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let layer = fmt::layer()
        .json()
        .with_ansi(false)
        .with_writer(writer)
        .boxed();

    Ok((layer, guard))
}
