//! Fan-in stage
//!
//! The single consumer of the output channel. It is the only caller of
//! `SinkHandle::write`; envelopes are written in receipt order.

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{bounded, Receiver, Sender};
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

use crate::stats::FanInStats;

use super::types::{Envelope, OutputMessage, OutputSender, OUTPUT_CHANNEL_CAPACITY};

/// Handle of the running fan-in thread
pub struct OutputStage {
    sender: Option<Sender<OutputMessage>>,
    handle: Option<JoinHandle<FanInStats>>,
}

impl OutputStage {
    pub fn start() -> Result<Self> {
        Self::with_capacity(OUTPUT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Result<Self> {
        let (sender, receiver) = bounded(capacity);
        let handle = thread::Builder::new()
            .name("fan-in".to_string())
            .spawn(move || fan_in_thread(receiver))
            .context("cannot start fan-in thread")?;

        Ok(Self {
            sender: Some(sender),
            handle: Some(handle),
        })
    }

    /// New producer handle for the output channel
    pub fn sender(&self) -> Result<OutputSender> {
        self.sender
            .as_ref()
            .map(|sender| OutputSender::new(sender.clone()))
            .ok_or_else(|| anyhow!("output stage has shut down"))
    }

    /// Close the channel and wait until the remaining messages are drained.
    /// Producer handles still alive keep the stage running until dropped.
    pub fn shutdown(mut self) -> Result<FanInStats> {
        drop(self.sender.take());
        let handle = self
            .handle
            .take()
            .ok_or_else(|| anyhow!("fan-in thread already joined"))?;
        handle
            .join()
            .map_err(|_| anyhow!("fan-in thread panicked"))
    }
}

fn fan_in_thread(receiver: Receiver<OutputMessage>) -> FanInStats {
    let mut stats = FanInStats::default();

    while let Ok(message) = receiver.recv() {
        match message {
            OutputMessage::Row(envelope) => write_envelope(envelope, &mut stats),
            OutputMessage::Barrier(ack) => {
                stats.barriers += 1;
                // the waiting controller may have gone away
                let _ = ack.send(());
            }
        }
    }

    debug!(
        envelopes = stats.envelopes_written,
        flushes = stats.flushes,
        "fan-in stage drained"
    );
    stats
}

fn write_envelope(envelope: Envelope, stats: &mut FanInStats) {
    let Envelope {
        header,
        record,
        flush,
        sink,
    } = envelope;

    match sink.write(header.as_deref(), &record) {
        Ok(()) => stats.envelopes_written += 1,
        Err(err) => {
            stats.write_errors += 1;
            warn!(kind = err.kind(), "{}", err);
        }
    }

    if flush {
        match sink.flush() {
            Ok(()) => stats.flushes += 1,
            Err(err) => {
                stats.flush_errors += 1;
                warn!(kind = err.kind(), "{}", err);
            }
        }
    }
}
