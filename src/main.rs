use clap::Parser;
use crossbeam_channel::unbounded;
use std::sync::Arc;
use tracing::{error, info};

use mailts::cli::Cli;
use mailts::config::load_config;
use mailts::logging::init_logging;
use mailts::mail::{Mailer, SmtpMailer};
use mailts::platform::{Ctrl, ExitCode, SignalHandler};
use mailts::runner;
use mailts::scheduler::{run_scheduled, Schedule};

fn main() {
    // clap exits with status 2 on bad flags
    let cli = Cli::parse();

    let log_guard = match init_logging(cli.log_level.as_deref()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("mailts: Error: {:#}", e);
            ExitCode::InvalidUsage.exit();
        }
    };

    let code = run(&cli);

    // drain buffered log lines before the process goes away
    log_guard.shutdown();
    code.exit();
}

fn run(cli: &Cli) -> ExitCode {
    let loaded = match load_config(&cli.config) {
        Ok(loaded) => loaded,
        Err(e) => {
            error!(kind = "config", "{:#}", e);
            return ExitCode::GeneralError;
        }
    };
    let mailer: Arc<dyn Mailer> = Arc::new(SmtpMailer);

    if !cli.use_cron {
        return match runner::run_loaded(loaded, mailer) {
            Ok(_) => ExitCode::Success,
            Err(e) => {
                error!("{:#}", e);
                ExitCode::GeneralError
            }
        };
    }

    let Some(expression) = loaded.schedule.as_deref() else {
        error!(kind = "config", "--use-cron needs a 'schedule' entry in {}", cli.config.display());
        return ExitCode::GeneralError;
    };
    let schedule = match Schedule::parse(expression) {
        Ok(schedule) => schedule,
        Err(e) => {
            error!(kind = e.kind(), "{}", e);
            return ExitCode::GeneralError;
        }
    };

    let (ctrl_tx, ctrl_rx) = unbounded::<Ctrl>();
    let _signal_handler = match SignalHandler::new(ctrl_tx) {
        Ok(handler) => handler,
        Err(e) => {
            error!("cannot install signal handling: {:#}", e);
            return ExitCode::GeneralError;
        }
    };

    match run_scheduled(&cli.config, &schedule, mailer, &ctrl_rx) {
        Ok(ticks) => {
            info!(ticks, "scheduler stopped");
            ExitCode::Success
        }
        Err(e) => {
            error!("{:#}", e);
            ExitCode::GeneralError
        }
    }
}
