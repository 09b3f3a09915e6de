//! One complete run: load the configuration, run every valid report, log the
//! outcome of each.

use anyhow::Result;
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::config::{load_config, LoadedConfig};
use crate::mail::Mailer;
use crate::report::{run_reports, RunSummary};

/// Load `config_path` and run it
pub fn run_once(config_path: &Path, mailer: Arc<dyn Mailer>) -> Result<RunSummary> {
    let loaded = load_config(config_path)?;
    run_loaded(loaded, mailer)
}

/// Run the reports of an already loaded configuration
pub fn run_loaded(loaded: LoadedConfig, mailer: Arc<dyn Mailer>) -> Result<RunSummary> {
    for (name, err) in &loaded.rejected {
        error!(kind = err.kind(), report = %name, "{}, report skipped", err);
    }
    if loaded.reports.is_empty() {
        warn!("no runnable report configured");
    }

    let summary = run_reports(loaded.reports, mailer)?;
    for outcome in &summary.reports {
        info!("{}", outcome.summary());
    }
    if summary.fan_in.write_errors > 0 || summary.fan_in.flush_errors > 0 {
        warn!("{}", summary.fan_in.format_stats());
    }
    Ok(summary)
}
