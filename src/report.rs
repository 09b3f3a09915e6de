//! Report lifecycle
//!
//! A [`ReportController`] drives one report through
//! `Configured → Executing → Flushing → Emailing → CleaningTemp → Done`.
//! [`run_reports`] runs every controller on its own thread against one
//! shared fan-in stage and tears that stage down once all reports are done.

use anyhow::{Context, Result};
use chrono::Local;
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use tracing::{debug, error, info, info_span, warn, Span};

use crate::config::{ReportSpec, SourceSpec};
use crate::error::PipelineError;
use crate::mail::{Mailer, OutgoingMail};
use crate::parallel::{
    OutputSender, OutputStage, QueryJob, Route, WorkerPool, QUERY_FLUSH_THRESHOLD,
    RANGE_FLUSH_THRESHOLD,
};
use crate::partition::{parallelism, partition, RangeSpec};
use crate::record::{Columns, HeaderPolicy, Record};
use crate::sink::SinkHandle;
use crate::source::metrics::{self, MetricsQuery};
use crate::source::{connector_for, Connector};
use crate::stats::FanInStats;

/// Lifecycle state of one report
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ReportState {
    Configured,
    Executing,
    Flushing,
    Emailing,
    CleaningTemp,
    Done,
}

impl fmt::Display for ReportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReportState::Configured => "configured",
            ReportState::Executing => "executing",
            ReportState::Flushing => "flushing",
            ReportState::Emailing => "emailing",
            ReportState::CleaningTemp => "cleaning_temp",
            ReportState::Done => "done",
        };
        f.write_str(name)
    }
}

/// What happened during one report run
#[derive(Debug, Clone, PartialEq)]
pub struct ReportOutcome {
    pub name: String,
    pub state: ReportState,
    pub rows_emitted: usize,
    pub rows_skipped: usize,
    pub items_ok: usize,
    pub items_failed: usize,
    pub items_undelivered: usize,
    pub workers_started: usize,
    pub workers_completed: usize,
    pub sinks_opened: usize,
    pub sinks_failed: usize,
    pub mail_sent: bool,
    pub temp_removed: usize,
    /// Failure that stopped execution before any work item ran
    pub error: Option<PipelineError>,
}

impl ReportOutcome {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: ReportState::Configured,
            rows_emitted: 0,
            rows_skipped: 0,
            items_ok: 0,
            items_failed: 0,
            items_undelivered: 0,
            workers_started: 0,
            workers_completed: 0,
            sinks_opened: 0,
            sinks_failed: 0,
            mail_sent: false,
            temp_removed: 0,
            error: None,
        }
    }

    pub fn summary(&self) -> String {
        let mut output = format!(
            "report '{}' {}: {} rows, {}/{} work items ok, {}/{} workers completed",
            self.name,
            self.state,
            self.rows_emitted,
            self.items_ok,
            self.items_ok + self.items_failed + self.items_undelivered,
            self.workers_completed,
            self.workers_started
        );
        if self.rows_skipped > 0 {
            output.push_str(&format!(", {} rows skipped", self.rows_skipped));
        }
        if self.sinks_failed > 0 {
            output.push_str(&format!(", {} sinks failed to open", self.sinks_failed));
        }
        if self.mail_sent {
            output.push_str(", email sent");
        }
        if self.temp_removed > 0 {
            output.push_str(&format!(", {} temporary files removed", self.temp_removed));
        }
        if let Some(err) = &self.error {
            output.push_str(&format!(", failed: {}", err));
        }
        output
    }
}

/// Outcome of a whole run
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub reports: Vec<ReportOutcome>,
    /// Reports whose thread could not be started
    pub not_started: Vec<String>,
    pub fan_in: FanInStats,
}

/// Drives one report from configuration to cleanup
pub struct ReportController {
    spec: ReportSpec,
    sinks: Vec<SinkHandle>,
    connector: Option<Arc<dyn Connector>>,
    mailer: Arc<dyn Mailer>,
    state: ReportState,
    span: Span,
    outcome: ReportOutcome,
}

impl ReportController {
    /// Open the report's sinks. A sink that cannot be opened is logged and
    /// left out of routing, attachments and cleanup.
    pub fn configure(spec: ReportSpec, mailer: Arc<dyn Mailer>) -> Self {
        let span = info_span!("report", name = %spec.name);
        let mut sinks = Vec::with_capacity(spec.outputs.len());
        let mut failed = 0;
        {
            let _entered = span.enter();
            for descriptor in &spec.outputs {
                match SinkHandle::open(descriptor.clone(), spec.delimiter) {
                    Ok(sink) => sinks.push(sink),
                    Err(err) => {
                        failed += 1;
                        error!(kind = err.kind(), "{}", err);
                    }
                }
            }
        }

        let mut controller = Self::with_sinks(spec, sinks, mailer);
        controller.span = span;
        controller.outcome.sinks_failed = failed;
        controller
    }

    /// Controller over sinks opened by the caller
    pub fn with_sinks(spec: ReportSpec, sinks: Vec<SinkHandle>, mailer: Arc<dyn Mailer>) -> Self {
        let span = info_span!("report", name = %spec.name);
        let mut outcome = ReportOutcome::new(&spec.name);
        outcome.sinks_opened = sinks.len();
        Self {
            spec,
            sinks,
            connector: None,
            mailer,
            state: ReportState::Configured,
            span,
            outcome,
        }
    }

    /// Use `connector` instead of the one derived from the connection
    /// descriptor
    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn state(&self) -> ReportState {
        self.state
    }

    pub fn sinks(&self) -> &[SinkHandle] {
        &self.sinks
    }

    /// Run the report to completion
    pub fn run(mut self, output: &OutputSender) -> ReportOutcome {
        let span = self.span.clone();
        let _entered = span.enter();
        info!(source = %self.spec.source.describe(), sinks = self.sinks.len(), "report started");
        if self.sinks.is_empty() {
            warn!("no sink could be opened, rows will be discarded");
        }

        self.enter(ReportState::Executing);
        self.execute(output);

        self.enter(ReportState::Flushing);
        if let Err(err) = output.barrier() {
            error!("{:#}", err);
        }
        self.flush_and_close();

        self.enter(ReportState::Emailing);
        self.send_mail();

        self.enter(ReportState::CleaningTemp);
        self.remove_temporary();

        self.enter(ReportState::Done);
        info!("{}", self.outcome.summary());
        self.outcome
    }

    fn enter(&mut self, next: ReportState) {
        debug!(from = %self.state, to = %next, "report state");
        self.state = next;
        self.outcome.state = next;
    }

    fn header_policy(&self) -> HeaderPolicy {
        match (&self.spec.header, self.spec.source.range()) {
            (Some(header), _) => HeaderPolicy::configured(header.clone()),
            (None, Some(range)) if range.single_header => HeaderPolicy::per_report(),
            _ => HeaderPolicy::PerWorker,
        }
    }

    fn routes(&self, threshold: u64) -> Vec<Route> {
        self.sinks
            .iter()
            .map(|sink| Route::new(sink.clone(), threshold))
            .collect()
    }

    fn execute(&mut self, output: &OutputSender) {
        match self.spec.source.clone() {
            SourceSpec::Relational {
                connection,
                statement,
                range,
                timeout,
            } => {
                let connector = self
                    .connector
                    .clone()
                    .unwrap_or_else(|| connector_for(&connection));
                let job = QueryJob {
                    statement,
                    bind_names: range
                        .as_ref()
                        .map(|r| (r.bind_start.clone(), r.bind_end.clone())),
                    timeout,
                };
                self.execute_relational(connector, job, range.as_ref(), output);
            }
            SourceSpec::Metrics(query) => self.execute_metrics(&query, output),
        }
    }

    fn execute_relational(
        &mut self,
        connector: Arc<dyn Connector>,
        job: QueryJob,
        range: Option<&RangeSpec>,
        output: &OutputSender,
    ) {
        let items = match partition(range) {
            Ok(items) => items,
            Err(err) => {
                error!(kind = err.kind(), "{}", err);
                self.outcome.error = Some(err);
                return;
            }
        };

        let threshold = if range.is_some() {
            RANGE_FLUSH_THRESHOLD
        } else {
            QUERY_FLUSH_THRESHOLD
        };
        let pool = WorkerPool::new(
            parallelism(range),
            connector,
            self.routes(threshold),
            self.header_policy(),
        );

        match pool.run(job, items, output, &self.span) {
            Ok(report) => {
                self.outcome.workers_started = report.workers_started;
                self.outcome.workers_completed = report.completions;
                self.outcome.items_ok = report.stats.items_ok;
                self.outcome.items_failed = report.stats.items_failed;
                self.outcome.items_undelivered = report.items_undelivered;
                self.outcome.rows_emitted = report.stats.rows_emitted;
                self.outcome.rows_skipped = report.stats.rows_skipped;
                debug!("{}", report.stats.format_stats());
            }
            Err(err) => error!("{:#}", err),
        }
    }

    /// Fetch, pivot and emit on this thread; metrics reports use no pool
    fn execute_metrics(&mut self, query: &MetricsQuery, output: &OutputSender) {
        self.outcome.workers_started = 1;
        let result = metrics::run(query);
        self.outcome.workers_completed = 1;

        let table = match result {
            Ok(table) => table,
            Err(err) => {
                error!(kind = err.kind(), "{}", err);
                self.outcome.items_failed = 1;
                return;
            }
        };
        self.outcome.items_ok = 1;
        if table.bad_samples > 0 {
            warn!(bad_samples = table.bad_samples, "some samples were left blank");
        }

        let columns: Columns = table.header.into();
        let routes = self.routes(QUERY_FLUSH_THRESHOLD);
        let mut latch = self.header_policy().latch();

        for row in table.rows {
            let record = match Record::named(Arc::clone(&columns), row) {
                Ok(record) => record,
                Err(err) => {
                    warn!(kind = err.kind(), "{}", err);
                    self.outcome.rows_skipped += 1;
                    continue;
                }
            };
            let sent = latch.stamp(&columns, |header| output.emit(&routes, header, record));
            if let Err(err) = sent {
                error!("{:#}", err);
                break;
            }
            self.outcome.rows_emitted += 1;
        }
    }

    fn flush_and_close(&mut self) {
        for sink in &self.sinks {
            if let Err(err) = sink.flush() {
                error!(kind = err.kind(), "{}", err);
            }
            if let Err(err) = sink.close() {
                error!(kind = err.kind(), "{}", err);
            }
        }
    }

    fn send_mail(&mut self) {
        let attachments: Vec<PathBuf> = self
            .sinks
            .iter()
            .filter(|sink| sink.descriptor().mail && sink.descriptor().is_file())
            .map(|sink| sink.path().to_path_buf())
            .collect();
        if attachments.is_empty() {
            return;
        }

        let Some(mail) = OutgoingMail::compose(&self.spec.email, &attachments, Local::now()) else {
            warn!("no attachment could be read, email not sent");
            return;
        };
        match self.mailer.send(&mail) {
            Ok(()) => {
                self.outcome.mail_sent = true;
                info!(attachments = mail.attachments.len(), to = %mail.to.join(","), "email sent");
            }
            Err(err) => error!(kind = err.kind(), "{}", err),
        }
    }

    fn remove_temporary(&mut self) {
        for sink in &self.sinks {
            let descriptor = sink.descriptor();
            if !(descriptor.temporary && descriptor.is_file()) {
                continue;
            }
            match fs::remove_file(sink.path()) {
                Ok(()) => {
                    self.outcome.temp_removed += 1;
                    debug!(path = %sink.path().display(), "temporary file removed");
                }
                Err(e) => {
                    let err = PipelineError::sink(sink.path(), format!("cannot remove: {}", e));
                    warn!(kind = err.kind(), "{}", err);
                }
            }
        }
    }
}

/// Configure and run `specs` concurrently, then shut the fan-in stage down
pub fn run_reports(specs: Vec<ReportSpec>, mailer: Arc<dyn Mailer>) -> Result<RunSummary> {
    let controllers = specs
        .into_iter()
        .map(|spec| ReportController::configure(spec, Arc::clone(&mailer)))
        .collect();
    run_controllers(controllers)
}

/// Run already configured controllers, one thread each.
///
/// A report that cannot be started is logged and skipped. The reports
/// already running are still joined and the stage is drained before return.
pub fn run_controllers(controllers: Vec<ReportController>) -> Result<RunSummary> {
    let stage = OutputStage::start()?;

    let mut handles = Vec::with_capacity(controllers.len());
    let mut not_started = Vec::new();
    for controller in controllers {
        let name = controller.name().to_string();
        match start_report(&stage, controller) {
            Ok(handle) => handles.push((name, handle)),
            Err(err) => {
                error!(report = %name, "{:#}", err);
                not_started.push(name);
            }
        }
    }

    let mut reports = Vec::with_capacity(handles.len());
    for (name, handle) in handles {
        match handle.join() {
            Ok(outcome) => reports.push(outcome),
            Err(_) => error!(report = %name, "report thread panicked"),
        }
    }

    let fan_in = stage.shutdown()?;
    debug!("{}", fan_in.format_stats());
    Ok(RunSummary {
        reports,
        not_started,
        fan_in,
    })
}

fn start_report(
    stage: &OutputStage,
    controller: ReportController,
) -> Result<thread::JoinHandle<ReportOutcome>> {
    let output = stage.sender()?;
    let name = controller.name().to_string();
    thread::Builder::new()
        .name(thread_name(&name))
        .spawn(move || controller.run(&output))
        .with_context(|| format!("cannot start report '{}'", name))
}

/// Thread names must not contain NUL bytes
fn thread_name(report: &str) -> String {
    format!("report-{}", report.replace('\0', ""))
}
