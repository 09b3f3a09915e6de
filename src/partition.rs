//! Range partitioning
//!
//! Splits one logical query into contiguous, inclusive bind-variable windows
//! that the worker pool executes in parallel.

use crate::error::{PipelineError, PipelineResult};

/// Validated range configuration for a relational report
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeSpec {
    pub start: i64,
    pub step_size: i64,
    pub steps: i64,
    pub parallelism: usize,
    pub bind_start: String,
    pub bind_end: String,
    /// Use one report-wide header latch instead of one per worker
    pub single_header: bool,
}

impl RangeSpec {
    pub fn new(
        start: i64,
        step_size: i64,
        steps: i64,
        parallelism: usize,
        bind_start: impl Into<String>,
        bind_end: impl Into<String>,
    ) -> PipelineResult<Self> {
        let spec = Self {
            start,
            step_size,
            steps,
            parallelism,
            bind_start: bind_start.into(),
            bind_end: bind_end.into(),
            single_header: false,
        };
        spec.validate()?;
        Ok(spec)
    }

    pub fn with_single_header(mut self, single_header: bool) -> Self {
        self.single_header = single_header;
        self
    }

    fn validate(&self) -> PipelineResult<()> {
        if self.step_size <= 0 {
            return Err(PipelineError::config(format!(
                "range stepsize must be positive, got {}",
                self.step_size
            )));
        }
        if self.steps <= 0 {
            return Err(PipelineError::config(format!(
                "range steps must be positive, got {}",
                self.steps
            )));
        }
        if self.parallelism == 0 {
            return Err(PipelineError::config("range parallel must be at least 1"));
        }
        if self.bind_start.trim().is_empty() || self.bind_end.trim().is_empty() {
            return Err(PipelineError::config(
                "range needs both bindvar_start and bindvar_end",
            ));
        }
        self.last()?;
        Ok(())
    }

    /// Inclusive upper bound of the whole range: `start + step_size*steps - 1`
    pub fn last(&self) -> PipelineResult<i64> {
        self.step_size
            .checked_mul(self.steps)
            .and_then(|span| span.checked_sub(1))
            .and_then(|offset| self.start.checked_add(offset))
            .ok_or_else(|| {
                PipelineError::config(format!(
                    "range {} + {}*{} overflows",
                    self.start, self.step_size, self.steps
                ))
            })
    }
}

/// One unit of query work
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkItem {
    /// Non-partitioned query, no bind variables
    Whole,
    /// Inclusive window `[lo, hi]` bound to the range's start/end variables
    Window { lo: i64, hi: i64 },
}

/// Lazy, finite sequence of work items for one report
#[derive(Debug)]
pub struct Partitions {
    cursor: Option<i64>,
    last: i64,
    step: i64,
    whole_pending: bool,
}

impl Iterator for Partitions {
    type Item = WorkItem;

    fn next(&mut self) -> Option<WorkItem> {
        if self.whole_pending {
            self.whole_pending = false;
            return Some(WorkItem::Whole);
        }

        let lo = self.cursor?;
        if lo > self.last {
            self.cursor = None;
            return None;
        }
        let hi = lo.saturating_add(self.step - 1).min(self.last);
        self.cursor = lo.checked_add(self.step);
        Some(WorkItem::Window { lo, hi })
    }
}

/// Derive the work items for a report. Without a range exactly one
/// `WorkItem::Whole` is produced.
pub fn partition(range: Option<&RangeSpec>) -> PipelineResult<Partitions> {
    match range {
        None => Ok(Partitions {
            cursor: None,
            last: 0,
            step: 1,
            whole_pending: true,
        }),
        Some(spec) => {
            spec.validate()?;
            Ok(Partitions {
                cursor: Some(spec.start),
                last: spec.last()?,
                step: spec.step_size,
                whole_pending: false,
            })
        }
    }
}

/// Worker count for a report; forced to 1 without a range
pub fn parallelism(range: Option<&RangeSpec>) -> usize {
    range.map_or(1, |spec| spec.parallelism.max(1))
}
