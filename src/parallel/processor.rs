//! Worker pool
//!
//! Runs one report's work items on `P` workers. The work queue is bounded to
//! `P`, so the producer blocks while every worker is busy.

use anyhow::{Context, Result};
use crossbeam_channel::bounded;
use std::sync::Arc;
use std::thread;
use tracing::{debug, error, warn, Span};

use crate::partition::WorkItem;
use crate::record::HeaderPolicy;
use crate::source::Connector;
use crate::stats::WorkerStats;

use super::types::{OutputSender, Route};
use super::worker::{worker_thread, CompletionSignal, QueryJob, WorkerContext};

/// Outcome of one pool run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PoolReport {
    pub workers_started: usize,
    /// Completion signals observed before teardown
    pub completions: usize,
    pub items_dispatched: usize,
    /// Items left over because every worker had stopped
    pub items_undelivered: usize,
    pub stats: WorkerStats,
}

/// Fixed-size pool of query workers
pub struct WorkerPool {
    parallelism: usize,
    connector: Arc<dyn Connector>,
    routes: Arc<[Route]>,
    header: HeaderPolicy,
}

impl WorkerPool {
    pub fn new(
        parallelism: usize,
        connector: Arc<dyn Connector>,
        routes: Vec<Route>,
        header: HeaderPolicy,
    ) -> Self {
        Self {
            parallelism: parallelism.max(1),
            connector,
            routes: routes.into(),
            header,
        }
    }

    /// Execute `job` for every item and wait for all workers to finish
    pub fn run<I>(&self, job: QueryJob, items: I, output: &OutputSender, span: &Span) -> Result<PoolReport>
    where
        I: IntoIterator<Item = WorkItem>,
    {
        let (work_sender, work_receiver) = bounded::<WorkItem>(self.parallelism);
        let (done_sender, done_receiver) = bounded::<usize>(self.parallelism);

        let ctx = WorkerContext {
            job: Arc::new(job),
            connector: Arc::clone(&self.connector),
            routes: Arc::clone(&self.routes),
            header: self.header.clone(),
            output: output.clone(),
            span: span.clone(),
        };

        let mut handles = Vec::with_capacity(self.parallelism);
        for worker_id in 0..self.parallelism {
            let worker_ctx = ctx.clone();
            let work_receiver = work_receiver.clone();
            let completion = CompletionSignal::new(worker_id, done_sender.clone());

            let handle = thread::Builder::new()
                .name(format!("worker-{}", worker_id))
                .spawn(move || worker_thread(worker_id, worker_ctx, work_receiver, completion))
                .with_context(|| format!("cannot start worker {}", worker_id))?;
            handles.push(handle);
        }
        drop(ctx);
        drop(work_receiver);
        drop(done_sender);

        let mut report = PoolReport {
            workers_started: handles.len(),
            ..PoolReport::default()
        };

        let mut items = items.into_iter();
        while let Some(item) = items.next() {
            if work_sender.send(item).is_err() {
                // every receiver is gone: all workers stopped early
                report.items_undelivered = 1 + items.count();
                warn!(
                    undelivered = report.items_undelivered,
                    "all workers stopped, remaining work items were not executed"
                );
                break;
            }
            report.items_dispatched += 1;
        }
        drop(work_sender);

        while report.completions < report.workers_started {
            match done_receiver.recv() {
                Ok(worker_id) => {
                    report.completions += 1;
                    debug!(worker = worker_id, "worker completed");
                }
                Err(_) => break,
            }
        }

        for handle in handles {
            match handle.join() {
                Ok(stats) => report.stats.merge(&stats),
                Err(_) => error!("worker thread panicked"),
            }
        }

        Ok(report)
    }
}
