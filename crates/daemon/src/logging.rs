//! Tracing subscriber setup.
//!
//! Logs always go to stderr. When `daemon.log_to_file` is set they are
//! also written, without ANSI colours, to a daily-rotated file under the
//! data directory.

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::Config;

/// File name prefix of rotated log files.
pub const LOG_FILE_PREFIX: &str = "nomacode-daemon.log";

/// Keeps the background log writer alive. Dropping it flushes pending lines.
#[must_use = "dropping the guard stops file logging"]
pub struct LogGuard {
    _file: Option<WorkerGuard>,
}

/// The filter directive for a configured level. `verbose` forces debug.
pub fn filter_directive(level: &str, verbose: bool) -> String {
    if verbose {
        "debug".to_string()
    } else {
        level.to_lowercase()
    }
}

/// Builds the filter. `RUST_LOG` wins over the configured level.
pub fn build_filter(level: &str, verbose: bool) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directive(level, verbose)))
}

/// Installs the global subscriber.
pub fn init(config: &Config, verbose: bool) -> Result<LogGuard> {
    let filter = build_filter(&config.daemon.log_level, verbose);
    let stderr_layer = fmt::layer().with_writer(std::io::stderr);

    let (file_layer, file_guard) = if config.daemon.log_to_file {
        let dir = config.log_dir();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;
        let appender = tracing_appender::rolling::daily(&dir, LOG_FILE_PREFIX);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let layer = fmt::layer().with_writer(writer).with_ansi(false);
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(LogGuard { _file: file_guard })
}
