//! Cron-driven repeated runs
//!
//! Each tick reloads the configuration file, so date placeholders and
//! relative metrics windows are resolved against the tick's own instant.

use anyhow::Result;
use chrono::{DateTime, Local};
use croner::Cron;
use crossbeam_channel::{after, select, Receiver};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::error::{PipelineError, PipelineResult};
use crate::mail::Mailer;
use crate::platform::Ctrl;
use crate::runner;

/// A parsed cron expression; 5 fields, or 6 with leading seconds
#[derive(Debug, Clone)]
pub struct Schedule {
    expression: String,
    cron: Cron,
}

impl Schedule {
    pub fn parse(expression: &str) -> PipelineResult<Self> {
        let expression = expression.trim();
        let cron = Cron::new(expression)
            .with_seconds_optional()
            .parse()
            .map_err(|e| PipelineError::config(format!("invalid schedule '{}': {}", expression, e)))?;
        Ok(Self {
            expression: expression.to_string(),
            cron,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// First occurrence strictly after `now`
    pub fn next_after(&self, now: &DateTime<Local>) -> PipelineResult<DateTime<Local>> {
        self.cron.find_next_occurrence(now, false).map_err(|e| {
            PipelineError::config(format!("schedule '{}' has no next run: {}", self.expression, e))
        })
    }
}

/// Why [`wait_until`] returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    Due,
    Shutdown,
}

/// Sleep until `deadline` unless a shutdown request arrives first
pub fn wait_until(deadline: DateTime<Local>, ctrl: &Receiver<Ctrl>) -> Tick {
    let wait = (deadline - Local::now()).to_std().unwrap_or(Duration::ZERO);
    select! {
        recv(ctrl) -> msg => match msg {
            Ok(Ctrl::Shutdown { .. }) => Tick::Shutdown,
            // no signal handler left to wake us; keep the schedule
            Err(_) => {
                std::thread::sleep(wait);
                Tick::Due
            }
        },
        recv(after(wait)) -> _ => Tick::Due,
    }
}

/// Run every report of `config_path` at each occurrence of `schedule` until
/// a shutdown request arrives. Returns the number of ticks executed.
pub fn run_scheduled(
    config_path: &Path,
    schedule: &Schedule,
    mailer: Arc<dyn Mailer>,
    ctrl: &Receiver<Ctrl>,
) -> Result<usize> {
    let mut ticks = 0;
    loop {
        let next = schedule.next_after(&Local::now())?;
        info!(schedule = schedule.expression(), next = %next.to_rfc3339(), "waiting for next run");

        if wait_until(next, ctrl) == Tick::Shutdown {
            info!(ticks, "scheduler stopping");
            return Ok(ticks);
        }

        ticks += 1;
        match runner::run_once(config_path, Arc::clone(&mailer)) {
            Ok(summary) => info!(reports = summary.reports.len(), "scheduled run finished"),
            Err(err) => error!(kind = "config", "{:#}, run skipped", err),
        }

        if let Ok(Ctrl::Shutdown { .. }) = ctrl.try_recv() {
            warn!(ticks, "shutdown requested during run, scheduler stopping");
            return Ok(ticks);
        }
    }
}
