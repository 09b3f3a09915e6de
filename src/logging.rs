//! Log subscriber setup
//!
//! Lines go to stderr through a non-blocking writer. The returned
//! [`LogGuard`] owns the writer thread; dropping or shutting it down drains
//! whatever is still buffered.

use anyhow::{anyhow, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Environment variable holding the log filter
pub const LOG_ENV: &str = "MAILTS_LOG";
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Keeps the log writer alive until shutdown
#[must_use = "dropping the guard stops the log writer"]
pub struct LogGuard {
    _guard: WorkerGuard,
}

impl LogGuard {
    /// Flush pending lines and stop the writer thread
    pub fn shutdown(self) {
        drop(self);
    }
}

/// Filter precedence: the explicit `level` argument, then `MAILTS_LOG`, then
/// [`DEFAULT_LOG_FILTER`]
pub fn build_filter(level: Option<&str>) -> Result<EnvFilter> {
    match level {
        Some(level) => EnvFilter::try_new(level)
            .map_err(|e| anyhow!("invalid log level '{}': {}", level, e)),
        None => Ok(EnvFilter::try_from_env(LOG_ENV)
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))),
    }
}

/// Install the global subscriber. Call once, from the binary.
pub fn init_logging(level: Option<&str>) -> Result<LogGuard> {
    let filter = build_filter(level)?;
    let (writer, guard) = tracing_appender::non_blocking(std::io::stderr());

    let fmt_layer = fmt::layer()
        .with_writer(writer)
        .with_target(false)
        .with_thread_names(true)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| anyhow!("cannot install log subscriber: {}", e))?;

    Ok(LogGuard { _guard: guard })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_level_is_parsed() {
        assert!(build_filter(Some("debug")).is_ok());
        assert!(build_filter(Some("mailts=trace,warn")).is_ok());
    }

    #[test]
    fn test_invalid_level_is_rejected() {
        let err = build_filter(Some("mailts=loudest")).unwrap_err();
        assert!(err.to_string().contains("invalid log level"));
    }
}
