//! Row normalization
//!
//! Driver rows become sink-agnostic [`Record`]s: an ordered list of
//! stringified fields plus the column names they came from.

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{PipelineError, PipelineResult};

/// Column names shared by every record of one result set
pub type Columns = Arc<[String]>;

/// A single cell as decoded by a source driver
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    /// Single precision, rendered at its own precision
    Float32(f32),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    Timestamp(NaiveDateTime),
    TimestampTz(DateTime<Utc>),
    Date(NaiveDate),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float32(x) => write!(f, "{}", x),
            Value::Float(x) => write!(f, "{}", x),
            Value::Text(s) => f.write_str(s),
            Value::Bytes(bytes) => match std::str::from_utf8(bytes) {
                Ok(s) => f.write_str(s),
                Err(_) => f.write_str(&hex::encode(bytes)),
            },
            Value::Timestamp(ts) => write!(f, "{}", ts.format("%Y-%m-%d %H:%M:%S%.f")),
            Value::TimestampTz(ts) => {
                f.write_str(&ts.to_rfc3339_opts(SecondsFormat::AutoSi, true))
            }
            Value::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
        }
    }
}

/// A normalized result row
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    fields: Vec<String>,
    names: Columns,
}

impl Record {
    /// Record from a positional source without column names
    pub fn positional(fields: Vec<String>) -> Self {
        Self {
            fields,
            names: Arc::from(Vec::new()),
        }
    }

    /// Record whose fields line up with `names`
    pub fn named(names: Columns, fields: Vec<String>) -> PipelineResult<Self> {
        if names.len() != fields.len() {
            return Err(PipelineError::row_decode(format!(
                "row has {} values for {} columns",
                fields.len(),
                names.len()
            )));
        }
        Ok(Self { fields, names })
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Field value by column name (first match for duplicated names)
    pub fn get(&self, name: &str) -> Option<&str> {
        self.names
            .iter()
            .position(|n| n == name)
            .map(|idx| self.fields[idx].as_str())
    }
}

/// Convert one driver row into a [`Record`], preserving column order
pub fn normalize(values: Vec<Value>, columns: &Columns) -> PipelineResult<Record> {
    let fields = values.iter().map(Value::to_string).collect();
    Record::named(Arc::clone(columns), fields)
}

/// Where a report's header row comes from and how often it may be emitted
#[derive(Debug, Clone)]
pub enum HeaderPolicy {
    /// Configured override, emitted once per report
    Configured {
        header: Columns,
        gate: Arc<HeaderGate>,
    },
    /// Result-set column names, latched independently by every worker
    PerWorker,
    /// Result-set column names, latched once for the whole report
    PerReport(Arc<HeaderGate>),
}

impl HeaderPolicy {
    pub fn configured(header: Vec<String>) -> Self {
        HeaderPolicy::Configured {
            header: Arc::from(header),
            gate: Arc::default(),
        }
    }

    pub fn per_report() -> Self {
        HeaderPolicy::PerReport(Arc::default())
    }

    /// Create the latch one worker uses for its lifetime
    pub fn latch(&self) -> HeaderLatch {
        HeaderLatch {
            policy: self.clone(),
            worker_emitted: false,
        }
    }
}

/// Report-wide header state shared by all workers.
///
/// The worker that claims the header keeps the lock until its row is
/// handed off, so rows from other workers queue up behind it.
#[derive(Debug, Default)]
pub struct HeaderGate {
    emitted: AtomicBool,
    lock: Mutex<()>,
}

impl HeaderGate {
    fn stamp<R>(
        &self,
        header: impl FnOnce() -> Columns,
        send: impl FnOnce(Option<Columns>) -> R,
    ) -> R {
        if self.emitted.load(Ordering::Acquire) {
            return send(None);
        }

        let _guard = self.lock.lock().unwrap_or_else(|p| p.into_inner());
        if self.emitted.load(Ordering::Acquire) {
            return send(None);
        }
        let result = send(Some(header()));
        self.emitted.store(true, Ordering::Release);
        result
    }
}

/// Decides which row of a worker carries the header
#[derive(Debug)]
pub struct HeaderLatch {
    policy: HeaderPolicy,
    worker_emitted: bool,
}

impl HeaderLatch {
    /// Pass the current row to `send` together with the header, if this is
    /// the first row. Report-wide policies finish the first `send` before
    /// any other row of the report is let through.
    pub fn stamp<R>(&mut self, columns: &Columns, send: impl FnOnce(Option<Columns>) -> R) -> R {
        match &self.policy {
            HeaderPolicy::Configured { header, gate } => gate.stamp(|| Arc::clone(header), send),
            HeaderPolicy::PerReport(gate) => gate.stamp(|| Arc::clone(columns), send),
            HeaderPolicy::PerWorker => {
                if self.worker_emitted {
                    send(None)
                } else {
                    self.worker_emitted = true;
                    send(Some(Arc::clone(columns)))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::thread;

    fn columns(names: &[&str]) -> Columns {
        names.iter().map(|s| s.to_string()).collect::<Vec<_>>().into()
    }

    #[test]
    fn test_value_rendering() {
        assert_eq!(Value::Null.to_string(), "");
        assert_eq!(Value::Bool(true).to_string(), "true");
        assert_eq!(Value::Int(-42).to_string(), "-42");
        assert_eq!(Value::Float(1.0).to_string(), "1");
        assert_eq!(Value::Float(2.5).to_string(), "2.5");
        assert_eq!(Value::Text("a,b".into()).to_string(), "a,b");
        assert_eq!(Value::Bytes(b"abc".to_vec()).to_string(), "abc");
        assert_eq!(Value::Bytes(vec![0xff, 0x00]).to_string(), "ff00");

        let date = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        assert_eq!(Value::Date(date).to_string(), "2024-03-01");
        let ts = date.and_hms_opt(12, 30, 5).unwrap();
        assert_eq!(Value::Timestamp(ts).to_string(), "2024-03-01 12:30:05");
        let tz = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 5).unwrap();
        assert_eq!(Value::TimestampTz(tz).to_string(), "2024-03-01T12:30:05Z");
    }

    #[test]
    fn test_normalize_preserves_column_order() {
        let cols = columns(&["id", "name", "score"]);
        let record = normalize(
            vec![Value::Int(7), Value::Text("x".into()), Value::Null],
            &cols,
        )
        .unwrap();

        assert_eq!(record.fields(), &["7", "x", ""]);
        assert_eq!(record.names(), &["id", "name", "score"]);
        assert_eq!(record.get("name"), Some("x"));
        assert_eq!(record.get("missing"), None);
    }

    #[test]
    fn test_normalize_rejects_width_mismatch() {
        let cols = columns(&["a", "b"]);
        let err = normalize(vec![Value::Int(1)], &cols).unwrap_err();
        assert_eq!(err.kind(), "row_decode");
    }

    #[test]
    fn test_positional_record() {
        let record = Record::positional(vec!["t".into(), "1".into()]);
        assert_eq!(record.len(), 2);
        assert!(record.names().is_empty());
        assert_eq!(record.get("t"), None);
    }

    fn header_of(latch: &mut HeaderLatch, cols: &Columns) -> Option<Columns> {
        latch.stamp(cols, |header| header)
    }

    #[test]
    fn test_float32_renders_at_single_precision() {
        assert_eq!(Value::Float32(0.1).to_string(), "0.1");
        assert_eq!(Value::Float32(1.5).to_string(), "1.5");
        assert_eq!(Value::Float32(3.0).to_string(), "3");
        assert_eq!(Value::Float(f64::from(0.1f32)).to_string(), "0.10000000149011612");
    }

    #[test]
    fn test_per_worker_latch_emits_once_per_worker() {
        let cols = columns(&["a"]);
        let policy = HeaderPolicy::PerWorker;
        let mut first = policy.latch();
        let mut second = policy.latch();

        assert!(header_of(&mut first, &cols).is_some());
        assert!(header_of(&mut first, &cols).is_none());
        // Each worker decides independently
        assert!(header_of(&mut second, &cols).is_some());
        assert!(header_of(&mut second, &cols).is_none());
    }

    #[test]
    fn test_configured_header_wins_over_columns() {
        let cols = columns(&["a", "b"]);
        let policy = HeaderPolicy::configured(vec!["A".into(), "B".into()]);
        let mut latch = policy.latch();

        let header = header_of(&mut latch, &cols).unwrap();
        assert_eq!(&header[..], &["A".to_string(), "B".to_string()]);
        assert!(header_of(&mut latch, &cols).is_none());
        assert!(header_of(&mut policy.latch(), &cols).is_none());
    }

    #[test]
    fn test_per_report_latch_emits_exactly_once_across_threads() {
        let cols = columns(&["a"]);
        let policy = HeaderPolicy::per_report();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let policy = policy.clone();
                let cols = Arc::clone(&cols);
                thread::spawn(move || {
                    let mut latch = policy.latch();
                    (0..10)
                        .filter(|_| header_of(&mut latch, &cols).is_some())
                        .count()
                })
            })
            .collect();

        let total: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total, 1);
    }

    #[test]
    fn test_report_wide_header_is_sent_before_any_row() {
        for policy in [
            HeaderPolicy::per_report(),
            HeaderPolicy::configured(vec!["A".into()]),
        ] {
            let cols = columns(&["a"]);
            let sent = Arc::new(Mutex::new(Vec::new()));

            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let policy = policy.clone();
                    let cols = Arc::clone(&cols);
                    let sent = Arc::clone(&sent);
                    thread::spawn(move || {
                        let mut latch = policy.latch();
                        for _ in 0..50 {
                            latch.stamp(&cols, |header| {
                                // widen the window between claim and send
                                thread::yield_now();
                                let mut sent = sent.lock().unwrap();
                                if header.is_some() {
                                    sent.push("header");
                                }
                                sent.push("row");
                            });
                        }
                    })
                })
                .collect();
            for handle in handles {
                handle.join().unwrap();
            }

            let sent = sent.lock().unwrap();
            assert_eq!(sent[0], "header");
            assert_eq!(sent.iter().filter(|s| **s == "header").count(), 1);
            assert_eq!(sent.len(), 8 * 50 + 1);
        }
    }
}
