use std::time::Duration;

/// Counters collected by one query worker
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkerStats {
    pub items_ok: usize,
    pub items_failed: usize,
    /// Records handed to the fan-in stage
    pub rows_emitted: usize,
    /// Rows dropped because they could not be decoded
    pub rows_skipped: usize,
    pub processing_time: Duration,
}

impl WorkerStats {
    /// Fold another worker's counters into these. Processing time keeps the
    /// longest worker, since workers run side by side.
    pub fn merge(&mut self, other: &WorkerStats) {
        self.items_ok += other.items_ok;
        self.items_failed += other.items_failed;
        self.rows_emitted += other.rows_emitted;
        self.rows_skipped += other.rows_skipped;
        self.processing_time = self.processing_time.max(other.processing_time);
    }

    pub fn format_stats(&self) -> String {
        let mut output = format!(
            "{} rows from {} work items",
            self.rows_emitted,
            self.items_ok + self.items_failed
        );
        if self.items_failed > 0 {
            output.push_str(&format!(", {} failed", self.items_failed));
        }
        if self.rows_skipped > 0 {
            output.push_str(&format!(", {} rows skipped", self.rows_skipped));
        }
        output.push_str(&format!(" in {}ms", self.processing_time.as_millis()));
        output
    }
}

/// Counters of the fan-in stage
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FanInStats {
    pub envelopes_written: usize,
    pub write_errors: usize,
    pub flushes: usize,
    pub flush_errors: usize,
    pub barriers: usize,
}

impl FanInStats {
    pub fn format_stats(&self) -> String {
        let mut output = format!(
            "{} envelopes written, {} flushes",
            self.envelopes_written, self.flushes
        );
        let errors = self.write_errors + self.flush_errors;
        if errors > 0 {
            output.push_str(&format!(", {} sink errors", errors));
        }
        output
    }
}
