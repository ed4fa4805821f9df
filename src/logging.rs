//! Structured logging for the upload service.
//!
//! Two sinks share one `RUST_LOG` filter: a compact ANSI layer on stdout
//! for interactive runs, and a JSON layer writing daily-rotated files for
//! support bundles. Component targets: `client`, `engine`, `engine::chunk`,
//! `store`, `coordinator`, `events`, `api`, `api::sse`, `main` — e.g.
//! `RUST_LOG=engine=debug,client=trace`.

use anyhow::{Context, Result};
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt,
};

/// Rotated log files kept on disk.
const MAX_LOG_FILES: usize = 5;

/// File name prefix for rotated logs.
const LOG_FILE_PREFIX: &str = "medialift";

/// Keeps the background log writer alive; dropping it flushes remaining
/// lines, so hold it for the whole process lifetime.
pub struct LogGuard(WorkerGuard);

/// Install the global subscriber, logging to stdout and to rotated JSON
/// files under `log_dir`.
pub fn init_logging(log_dir: &Path) -> Result<LogGuard> {
    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("failed to create log directory {}", log_dir.display()))?;

    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .filename_suffix("log")
        .max_log_files(MAX_LOG_FILES)
        .build(log_dir)
        .context("failed to create rolling file appender")?;
    let (file_writer, guard) = tracing_appender::non_blocking(appender);

    let filter =
        || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let file_sink = fmt::layer()
        .json()
        .flatten_event(true)
        .with_target(true)
        .with_writer(file_writer)
        .with_filter(filter());
    let stdout_sink = fmt::layer()
        .compact()
        .with_target(true)
        .with_filter(filter());

    tracing_subscriber::registry()
        .with(file_sink)
        .with(stdout_sink)
        .init();

    tracing::info!(
        target: "main",
        dir = %log_dir.display(),
        kept_files = MAX_LOG_FILES,
        "Logging to stdout and rotated files"
    );
    Ok(LogGuard(guard))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_creates_the_log_directory() {
        let dir = tempfile::tempdir().unwrap();
        let logs = dir.path().join("nested").join("logs");

        let guard = init_logging(&logs).unwrap();
        assert!(logs.is_dir());
        drop(guard);
    }
}
