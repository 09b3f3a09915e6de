// Command-line interface definitions

use clap::Parser;
use std::path::PathBuf;

pub const DEFAULT_CONFIG_PATH: &str = "example/mailts_config.yml";

#[derive(Parser, Debug)]
#[command(name = "mailts")]
#[command(about = "Runs configured database and metrics queries and ships the rows as reports")]
#[command(
    long_about = "Runs configured database and metrics queries and ships the rows as reports\n\nEvery report of the configuration runs concurrently; range-partitioned\nqueries are split into windows executed by a pool of workers. Rows go to\nCSV files, XLSX workbooks or the screen, and flagged files are sent by\nemail once the report is done.\n\nMODES:\n  (default)    Run every report once and exit\n  --use-cron   Run every report at each occurrence of the configured schedule\n\nEXAMPLES:\n  mailts --config reports.yml\n  mailts --config reports.yml --use-cron --log-level debug"
)]
#[command(version)]
#[command(args_override_self = true)]
pub struct Cli {
    /// Report configuration file (YAML)
    #[arg(
        long = "config",
        value_name = "PATH",
        default_value = DEFAULT_CONFIG_PATH,
        help_heading = "Run Options"
    )]
    pub config: PathBuf,

    /// Repeat the run at each occurrence of the configuration's `schedule`
    #[arg(long = "use-cron", alias = "use_cron", help_heading = "Run Options")]
    pub use_cron: bool,

    /// Log filter, e.g. `debug` or `mailts=trace` (overrides MAILTS_LOG)
    #[arg(long = "log-level", value_name = "FILTER", help_heading = "Logging Options")]
    pub log_level: Option<String>,
}
