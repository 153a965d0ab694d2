use std::sync::Once;

use thiserror::Error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is not set.
const DEFAULT_FILTER: &str = "info";

/// Environment variable selecting the log format, `json` or anything else for text.
const LOG_FORMAT_ENV_NAME: &str = "LOG_FORMAT";

static TEST_TRACING: Once = Once::new();

#[derive(Debug, Error)]
pub enum TracingError {
    #[error("invalid log filter: {0}")]
    Filter(#[from] tracing_subscriber::filter::ParseError),
    #[error("failed to install the global subscriber: {0}")]
    Install(String),
}

/// Flushes buffered log lines when dropped. Keep it alive until the process exits.
#[must_use = "dropping the flusher stops log output"]
pub struct LogFlusher {
    _guard: WorkerGuard,
}

/// Installs the global subscriber writing to stderr through a non-blocking writer.
pub fn init_tracing(app_name: &str) -> Result<LogFlusher, TracingError> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(DEFAULT_FILTER)?,
    };

    let (writer, guard) = tracing_appender::non_blocking(std::io::stderr());
    let json = std::env::var(LOG_FORMAT_ENV_NAME).is_ok_and(|format| format == "json");

    let installed = if json {
        tracing_subscriber::fmt()
            .json()
            .with_current_span(true)
            .with_writer(writer)
            .with_env_filter(filter)
            .try_init()
    } else {
        tracing_subscriber::fmt()
            .with_ansi(false)
            .with_writer(writer)
            .with_env_filter(filter)
            .try_init()
    };
    installed.map_err(|err| TracingError::Install(err.to_string()))?;

    ::tracing::info!(app_name, json, "tracing initialized");

    Ok(LogFlusher { _guard: guard })
}

/// Installs a subscriber that writes through the test harness, once per process.
pub fn init_test_tracing() {
    TEST_TRACING.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("redshift_loader=debug,info"));

        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_env_filter(filter)
            .try_init();
    });
}
