//! Logging infrastructure for CacheFlow.
//!
//! Provides structured logging with console output and an optional
//! non-blocking file writer:
//! - Configurable via the `RUST_LOG` environment variable (default `info`)
//! - Console output for interactive use
//! - Optional file output for long-running services

use std::fs;
use std::io;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Guard that must be kept alive for the duration of logging.
///
/// Dropping this guard flushes and closes the file writer, if one was
/// configured.
pub struct LoggingGuard {
    _file_guard: Option<WorkerGuard>,
}

/// Initialize console-only logging.
///
/// Uses `RUST_LOG` for filtering, defaulting to `info`.
pub fn init_logging() -> LoggingGuard {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(io::stdout))
        .init();

    LoggingGuard { _file_guard: None }
}

/// Initialize logging with both console and file output.
///
/// Creates the log directory if needed and truncates the previous log
/// file on startup.
///
/// # Arguments
///
/// * `log_dir` - Directory for log files (e.g., "logs")
/// * `log_file` - Log filename (e.g., "cacheflow.log")
///
/// # Errors
///
/// Returns an error if the log directory cannot be created or the log
/// file cannot be truncated.
pub fn init_logging_with_file(log_dir: &str, log_file: &str) -> Result<LoggingGuard, io::Error> {
    fs::create_dir_all(log_dir)?;
    fs::write(Path::new(log_dir).join(log_file), "")?;

    let file_appender = tracing_appender::rolling::never(log_dir, log_file);
    let (non_blocking_file, file_guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking_file)
                .with_ansi(false),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(io::stdout))
        .init();

    Ok(LoggingGuard {
        _file_guard: Some(file_guard),
    })
}

/// Default log directory path.
pub fn default_log_dir() -> &'static str {
    "logs"
}

/// Default log file name.
pub fn default_log_file() -> &'static str {
    "cacheflow.log"
}
