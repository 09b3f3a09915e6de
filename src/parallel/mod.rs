//! Parallel execution and output fan-in
//!
//! Query workers of every running report push envelopes into one bounded
//! channel drained by a single fan-in thread.
//!
//! # Module Structure
//!
//! - `types`: Envelopes, routes with their flush counters, the output sender
//! - `worker`: Worker thread executing work items on its own session
//! - `fanin`: The single serializing consumer that writes to sinks
//! - `processor`: Worker pool orchestration for one report

mod fanin;
mod processor;
mod types;
mod worker;

pub use fanin::OutputStage;
pub use processor::{PoolReport, WorkerPool};
pub use types::{
    Envelope, FlushCounter, OutputSender, Route, OUTPUT_CHANNEL_CAPACITY, QUERY_FLUSH_THRESHOLD,
    RANGE_FLUSH_THRESHOLD,
};
pub use worker::QueryJob;
