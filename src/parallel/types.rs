//! Type definitions for the output pipeline
//!
//! Contains the envelope that travels from workers to the fan-in stage,
//! routing with its flush policy, and the sending side of the output channel.

use anyhow::{anyhow, Result};
use crossbeam_channel::{bounded, Sender};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::record::{Columns, Record};
use crate::sink::SinkHandle;

/// Capacity of the shared output channel
pub const OUTPUT_CHANNEL_CAPACITY: usize = 2000;
/// Rows between flushes for plain query sinks
pub const QUERY_FLUSH_THRESHOLD: u64 = 50;
/// Rows between flushes for range-partitioned sinks
pub const RANGE_FLUSH_THRESHOLD: u64 = 20;

/// One normalized row addressed to one sink
#[derive(Debug)]
pub struct Envelope {
    pub header: Option<Columns>,
    pub record: Record,
    pub flush: bool,
    pub sink: SinkHandle,
}

/// Message type of the output channel
#[derive(Debug)]
pub(crate) enum OutputMessage {
    Row(Envelope),
    /// Acknowledged once every message sent before it has been written
    Barrier(Sender<()>),
}

/// Row counter of one (report, sink) pair
#[derive(Debug)]
pub struct FlushCounter {
    /// `None` flushes after every write
    threshold: Option<u64>,
    count: AtomicU64,
}

impl FlushCounter {
    pub fn every_write() -> Self {
        Self {
            threshold: None,
            count: AtomicU64::new(0),
        }
    }

    pub fn batched(threshold: u64) -> Self {
        Self {
            threshold: Some(threshold.max(1)),
            count: AtomicU64::new(0),
        }
    }

    /// Count one envelope and report whether it carries a flush request.
    /// Once the count has reached the threshold the next envelope flushes and
    /// counting restarts with it.
    pub fn next(&self) -> bool {
        let Some(threshold) = self.threshold else {
            return true;
        };
        let previous = self
            .count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                Some(if count >= threshold { 1 } else { count + 1 })
            });
        match previous {
            Ok(count) | Err(count) => count >= threshold,
        }
    }
}

/// A report's destination sink plus its flush counter
#[derive(Debug, Clone)]
pub struct Route {
    pub sink: SinkHandle,
    counter: Arc<FlushCounter>,
}

impl Route {
    /// Console sinks flush after every write, others every `threshold` rows
    pub fn new(sink: SinkHandle, threshold: u64) -> Self {
        let counter = if sink.descriptor().is_console() {
            FlushCounter::every_write()
        } else {
            FlushCounter::batched(threshold)
        };
        Self {
            sink,
            counter: Arc::new(counter),
        }
    }

    fn envelope(&self, header: Option<Columns>, record: Record) -> Envelope {
        Envelope {
            header,
            record,
            flush: self.counter.next(),
            sink: self.sink.clone(),
        }
    }
}

/// Sending half of the output channel, cloned into every producer
#[derive(Debug, Clone)]
pub struct OutputSender {
    sender: Sender<OutputMessage>,
}

impl OutputSender {
    pub(crate) fn new(sender: Sender<OutputMessage>) -> Self {
        Self { sender }
    }

    pub fn send(&self, envelope: Envelope) -> Result<()> {
        self.sender
            .send(OutputMessage::Row(envelope))
            .map_err(|_| anyhow!("output stage has shut down"))
    }

    /// Send one envelope per route for `record`. Blocks while the channel is
    /// full.
    pub fn emit(&self, routes: &[Route], header: Option<Columns>, record: Record) -> Result<()> {
        let Some((last, rest)) = routes.split_last() else {
            return Ok(());
        };
        for route in rest {
            self.send(route.envelope(header.clone(), record.clone()))?;
        }
        self.send(last.envelope(header, record))
    }

    /// Wait until everything sent through this channel so far is written
    pub fn barrier(&self) -> Result<()> {
        let (ack_tx, ack_rx) = bounded(1);
        self.sender
            .send(OutputMessage::Barrier(ack_tx))
            .map_err(|_| anyhow!("output stage has shut down"))?;
        ack_rx
            .recv()
            .map_err(|_| anyhow!("output stage stopped before the barrier"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::test_support::SharedBuffer;
    use crate::sink::SinkDescriptor;
    use crossbeam_channel::unbounded;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_batched_counter_flushes_after_threshold() {
        let counter = FlushCounter::batched(3);
        let flags: Vec<bool> = (0..10).map(|_| counter.next()).collect();
        // rows 1-3 fill the batch, row 4 flushes and starts the next one
        assert_eq!(
            flags,
            vec![false, false, false, true, false, false, true, false, false, true]
        );
    }

    #[test]
    fn test_every_write_counter() {
        let counter = FlushCounter::every_write();
        assert!((0..5).all(|_| counter.next()));
    }

    #[test]
    fn test_shared_counter_counts_every_envelope_once() {
        let counter = Arc::new(FlushCounter::batched(QUERY_FLUSH_THRESHOLD));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let counter = Arc::clone(&counter);
                thread::spawn(move || (0..250).filter(|_| counter.next()).count())
            })
            .collect();
        let flushes: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        // 1000 envelopes: flushes at 51, 101, ..., 951
        assert_eq!(flushes, 19);
    }

    #[test]
    fn test_emit_sends_one_envelope_per_route() {
        let (tx, rx) = unbounded();
        let output = OutputSender::new(tx);
        let console = SinkHandle::with_writer(
            SinkDescriptor::console("STDOUT"),
            Box::new(SharedBuffer::default()),
            b',',
        );
        let file_like = SinkHandle::with_writer(
            SinkDescriptor::delimited("x.csv"),
            Box::new(SharedBuffer::default()),
            b',',
        );
        let routes = vec![Route::new(console, 50), Route::new(file_like, 50)];

        let header: Columns = vec!["a".to_string()].into();
        let record = Record::positional(vec!["1".into()]);
        output.emit(&routes, Some(header), record).unwrap();

        let messages: Vec<OutputMessage> = rx.try_iter().collect();
        assert_eq!(messages.len(), 2);
        for (message, expect_flush) in messages.iter().zip([true, false]) {
            match message {
                OutputMessage::Row(envelope) => {
                    assert_eq!(envelope.flush, expect_flush);
                    assert!(envelope.header.is_some());
                    assert_eq!(envelope.record.fields(), &["1"]);
                }
                OutputMessage::Barrier(_) => panic!("unexpected barrier"),
            }
        }
    }

    #[test]
    fn test_send_fails_once_stage_is_gone() {
        let (tx, rx) = bounded(1);
        drop(rx);
        let output = OutputSender::new(tx);
        assert!(output.barrier().is_err());
    }
}
