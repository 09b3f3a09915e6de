//! Core library for the mailts report runner

pub mod cli;
pub mod config;
pub mod error;
pub mod logging;
pub mod mail;
pub mod parallel;
pub mod partition;
pub mod platform;
pub mod record;
pub mod report;
pub mod runner;
pub mod scheduler;
pub mod sink;
pub mod source;
pub mod stats;
pub mod timespec;

pub use config::{load_config, LoadedConfig, ReportSpec};
pub use error::{PipelineError, PipelineResult};
pub use mail::{Mailer, SmtpMailer};
pub use report::{run_reports, ReportController, ReportOutcome, ReportState, RunSummary};
