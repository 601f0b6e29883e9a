//! Logging setup.
//!
//! Console output through `tracing-subscriber` with local timezone
//! timestamps, optionally as JSON, plus an optional daily-rotated log file.

use std::path::PathBuf;

use chrono::Local;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter, Layer, Registry,
    fmt::{self, format::Writer, time::FormatTime},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

use crate::config::non_blank;
use crate::error::{Error, Result};

/// Default log filter directive.
pub const DEFAULT_LOG_FILTER: &str = "cf_stager=info,cf_api=info";

/// File name prefix for rotated log files.
const LOG_FILE_PREFIX: &str = "cf-stager.log";

/// Custom timer that uses the local timezone via chrono.
#[derive(Debug, Clone, Copy)]
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        let now = Local::now();
        write!(w, "{}", now.format("%Y-%m-%dT%H:%M:%S%.3f%:z"))
    }
}

/// Output options for [`init_logging`].
#[derive(Debug, Clone, Default)]
pub struct LoggingOptions {
    /// Emit JSON lines on the console instead of human-readable text.
    pub json: bool,
    /// Directory for daily-rotated log files. Disabled when `None`.
    pub log_dir: Option<PathBuf>,
    /// Filter used when `RUST_LOG` is unset. Defaults to [`DEFAULT_LOG_FILTER`].
    pub filter: Option<String>,
}

impl LoggingOptions {
    /// Read `CF_LOG_FORMAT`, `CF_LOG_DIR` and `CF_LOG_FILTER`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| non_blank(lookup(key));

        Self {
            json: get("CF_LOG_FORMAT").is_some_and(|v| v.eq_ignore_ascii_case("json")),
            log_dir: get("CF_LOG_DIR").map(PathBuf::from),
            filter: get("CF_LOG_FILTER"),
        }
    }

    fn env_filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            let directive = self.filter.as_deref().unwrap_or(DEFAULT_LOG_FILTER);
            EnvFilter::try_new(directive).unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
        })
    }
}

/// Initialize the global subscriber.
///
/// Returns the file writer's guard when file output is enabled; keep it alive
/// for the lifetime of the process so buffered lines are flushed.
pub fn init_logging(options: &LoggingOptions) -> Result<Option<WorkerGuard>> {
    let console: Box<dyn Layer<Registry> + Send + Sync> = if options.json {
        fmt::layer().json().with_timer(LocalTimer).boxed()
    } else {
        fmt::layer().with_ansi(true).with_timer(LocalTimer).boxed()
    };

    let (file_layer, guard) = match &options.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let file_appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let layer = fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_timer(LocalTimer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(console)
        .with(file_layer)
        .with(options.env_filter())
        .try_init()
        .map_err(|e| Error::Other(format!("Failed to set global default subscriber: {}", e)))?;

    Ok(guard)
}
