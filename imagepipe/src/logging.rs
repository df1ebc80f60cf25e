//! Log output for imagepipe binaries.
//!
//! Writes a fresh log file per session plus a compact copy on stderr, so
//! command output on stdout stays clean. Filtering follows `RUST_LOG` and
//! defaults to `info`.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::{config_directory, DEFAULT_LOG_FILE};

/// Keeps the file writer alive. Dropping it flushes pending lines.
pub struct LoggingGuard {
    _file_guard: WorkerGuard,
}

/// Creates `log_dir/log_file` (truncating an old one) and installs the
/// global subscriber.
///
/// # Errors
///
/// Fails if the directory cannot be created or the file cannot be cleared.
pub fn init_logging(log_dir: &Path, log_file: &str) -> Result<LoggingGuard, io::Error> {
    let file_writer = prepare_log_file(log_dir, log_file)?;
    let (non_blocking_file, file_guard) = tracing_appender::non_blocking(file_writer);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking_file)
        .with_ansi(false)
        .with_span_events(FmtSpan::CLOSE)
        .pretty();

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(io::stderr)
        .with_target(false)
        .compact();

    tracing_subscriber::registry()
        .with(default_filter())
        .with(file_layer)
        .with(stderr_layer)
        .init();

    Ok(LoggingGuard {
        _file_guard: file_guard,
    })
}

fn default_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

fn prepare_log_file(
    log_dir: &Path,
    log_file: &str,
) -> Result<tracing_appender::rolling::RollingFileAppender, io::Error> {
    fs::create_dir_all(log_dir)?;
    fs::write(log_dir.join(log_file), "")?;
    Ok(tracing_appender::rolling::never(log_dir, log_file))
}

/// `~/.imagepipe/logs`
pub fn default_log_dir() -> PathBuf {
    config_directory().join("logs")
}

pub fn default_log_file() -> &'static str {
    DEFAULT_LOG_FILE
}
