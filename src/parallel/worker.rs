//! Query worker thread
//!
//! Each worker owns one session for its whole lifetime and executes the work
//! items it pulls from the shared queue.

use crossbeam_channel::{Receiver, Sender};
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn, Span};

use crate::partition::WorkItem;
use crate::record::{normalize, HeaderPolicy};
use crate::source::{Binding, Connector};
use crate::stats::WorkerStats;

use super::types::{OutputSender, Route};

/// What every worker of one report executes
#[derive(Debug, Clone)]
pub struct QueryJob {
    pub statement: String,
    /// Names of the window bind variables, when range partitioned
    pub bind_names: Option<(String, String)>,
    pub timeout: Option<Duration>,
}

impl QueryJob {
    fn binds(&self, item: WorkItem) -> Vec<Binding<'_>> {
        match (item, &self.bind_names) {
            (WorkItem::Window { lo, hi }, Some((start, end))) => {
                vec![(start.as_str(), lo), (end.as_str(), hi)]
            }
            _ => Vec::new(),
        }
    }
}

/// Everything a worker shares with its siblings
#[derive(Clone)]
pub(crate) struct WorkerContext {
    pub job: Arc<QueryJob>,
    pub connector: Arc<dyn Connector>,
    pub routes: Arc<[Route]>,
    pub header: HeaderPolicy,
    pub output: OutputSender,
    /// Parent span of the report this worker belongs to
    pub span: Span,
}

/// Sends the worker's completion exactly once, also when the worker panics
pub(crate) struct CompletionSignal {
    worker_id: usize,
    done: Option<Sender<usize>>,
}

impl CompletionSignal {
    pub fn new(worker_id: usize, done: Sender<usize>) -> Self {
        Self {
            worker_id,
            done: Some(done),
        }
    }

    fn fire(&mut self) {
        if let Some(done) = self.done.take() {
            let _ = done.send(self.worker_id);
        }
    }
}

impl Drop for CompletionSignal {
    fn drop(&mut self) {
        self.fire();
    }
}

/// Worker thread: executes work items until the queue is closed and drained
pub(crate) fn worker_thread(
    worker_id: usize,
    ctx: WorkerContext,
    work_receiver: Receiver<WorkItem>,
    mut completion: CompletionSignal,
) -> WorkerStats {
    let span = tracing::info_span!(parent: &ctx.span, "worker", worker = worker_id);
    let _entered = span.enter();

    let started = Instant::now();
    let mut stats = WorkerStats::default();

    let mut session = match ctx.connector.connect() {
        Ok(session) => session,
        Err(err) => {
            error!(kind = err.kind(), "{}", err);
            completion.fire();
            return stats;
        }
    };
    debug!(target_db = %ctx.connector.describe(), "session opened");

    let mut latch = ctx.header.latch();
    let mut output_closed = false;

    while let Ok(item) = work_receiver.recv() {
        let binds = ctx.job.binds(item);
        let mut rows = 0usize;
        let mut skipped = 0usize;

        let result = session.execute(&ctx.job.statement, &binds, ctx.job.timeout, &mut |columns, row| {
            let record = match row.and_then(|values| normalize(values, columns)) {
                Ok(record) => record,
                Err(err) => {
                    warn!(kind = err.kind(), ?item, "{}", err);
                    skipped += 1;
                    return ControlFlow::Continue(());
                }
            };
            match latch.stamp(columns, |header| ctx.output.emit(&ctx.routes, header, record)) {
                Ok(()) => {
                    rows += 1;
                    ControlFlow::Continue(())
                }
                Err(err) => {
                    error!("{}", err);
                    output_closed = true;
                    ControlFlow::Break(())
                }
            }
        });

        stats.rows_emitted += rows;
        stats.rows_skipped += skipped;
        match result {
            Ok(()) => {
                stats.items_ok += 1;
                debug!(?item, rows, "work item done");
            }
            Err(err) => {
                stats.items_failed += 1;
                error!(kind = err.kind(), ?item, "{}", err);
            }
        }

        if output_closed {
            break;
        }
    }

    // release the connection before signalling completion
    drop(session);
    stats.processing_time = started.elapsed();
    completion.fire();
    stats
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_binds_use_configured_names() {
        let job = QueryJob {
            statement: "select".into(),
            bind_names: Some(("lo".into(), "hi".into())),
            timeout: None,
        };
        assert_eq!(
            job.binds(WorkItem::Window { lo: 10, hi: 19 }),
            vec![("lo", 10), ("hi", 19)]
        );
        assert!(job.binds(WorkItem::Whole).is_empty());
    }

    #[test]
    fn test_completion_signal_fires_once() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut signal = CompletionSignal::new(3, tx);
        signal.fire();
        signal.fire();
        drop(signal);
        assert_eq!(rx.try_iter().collect::<Vec<_>>(), vec![3]);
    }

    #[test]
    fn test_completion_signal_fires_on_drop() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let handle = std::thread::spawn(move || {
            let _signal = CompletionSignal::new(1, tx);
            panic!("worker blew up");
        });
        assert!(handle.join().is_err());
        assert_eq!(rx.recv().unwrap(), 1);
    }
}
