//! Writer sinks
//!
//! A closed set of output destinations behind one capability: write a record
//! (optionally preceded by a header row), flush, close. The fan-in stage is
//! the only writer; flush/close may also come from a report controller, so
//! every operation goes through the sink's lock.
//!
//! - `delimited`: CSV/TSV style output for files and console streams
//! - `spreadsheet`: XLSX workbook with a single sheet
//! - `console`: stdout/stderr selection

mod console;
mod delimited;
mod spreadsheet;

use std::fmt;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{PipelineError, PipelineResult};
use crate::record::Record;

pub use console::ConsoleStream;
use delimited::DelimitedWriter;
use spreadsheet::SpreadsheetWriter;

/// What kind of destination a sink writes to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkKind {
    Delimited,
    Spreadsheet { sheet: String },
    Console(ConsoleStream),
}

/// Configured output destination of a report
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkDescriptor {
    pub kind: SinkKind,
    /// File path, or the console target name for console sinks
    pub path: PathBuf,
    pub temporary: bool,
    pub mail: bool,
}

impl SinkDescriptor {
    pub fn delimited(path: impl Into<PathBuf>) -> Self {
        Self {
            kind: SinkKind::Delimited,
            path: path.into(),
            temporary: false,
            mail: false,
        }
    }

    pub fn spreadsheet(path: impl Into<PathBuf>, sheet: impl Into<String>) -> Self {
        Self {
            kind: SinkKind::Spreadsheet {
                sheet: sheet.into(),
            },
            path: path.into(),
            temporary: false,
            mail: false,
        }
    }

    /// Console sink; `STDERR` (any case) selects standard error
    pub fn console(target: &str) -> Self {
        Self {
            kind: SinkKind::Console(ConsoleStream::from_target(target)),
            path: PathBuf::from(target),
            temporary: false,
            mail: false,
        }
    }

    pub fn with_temporary(mut self, temporary: bool) -> Self {
        self.temporary = temporary;
        self
    }

    pub fn with_mail(mut self, mail: bool) -> Self {
        self.mail = mail;
        self
    }

    pub fn is_console(&self) -> bool {
        matches!(self.kind, SinkKind::Console(_))
    }

    /// Sinks that persist to a named file
    pub fn is_file(&self) -> bool {
        !self.is_console()
    }
}

/// The three operations every sink variant provides
trait RecordWriter {
    fn write_record(&mut self, header: Option<&[String]>, record: &Record) -> anyhow::Result<()>;
    fn flush(&mut self) -> anyhow::Result<()>;
    fn finish(self) -> anyhow::Result<()>;
}

enum SinkWriter {
    File(DelimitedWriter<File>),
    Console(DelimitedWriter<Box<dyn Write + Send>>),
    Spreadsheet(SpreadsheetWriter),
}

impl SinkWriter {
    fn write_record(&mut self, header: Option<&[String]>, record: &Record) -> anyhow::Result<()> {
        match self {
            SinkWriter::File(w) => w.write_record(header, record),
            SinkWriter::Console(w) => w.write_record(header, record),
            SinkWriter::Spreadsheet(w) => w.write_record(header, record),
        }
    }

    fn flush(&mut self) -> anyhow::Result<()> {
        match self {
            SinkWriter::File(w) => w.flush(),
            SinkWriter::Console(w) => w.flush(),
            SinkWriter::Spreadsheet(w) => w.flush(),
        }
    }

    fn finish(self) -> anyhow::Result<()> {
        match self {
            SinkWriter::File(w) => w.finish(),
            SinkWriter::Console(w) => w.finish(),
            SinkWriter::Spreadsheet(w) => w.finish(),
        }
    }
}

enum SinkState {
    Open(SinkWriter),
    Closed,
}

struct SinkInner {
    descriptor: SinkDescriptor,
    state: Mutex<SinkState>,
}

/// Live, shareable handle of an opened sink
#[derive(Clone)]
pub struct SinkHandle {
    inner: Arc<SinkInner>,
}

impl fmt::Debug for SinkHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SinkHandle")
            .field("descriptor", &self.inner.descriptor)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl SinkHandle {
    /// Open the destination described by `descriptor`. Files are created
    /// (truncated) immediately.
    pub fn open(descriptor: SinkDescriptor, delimiter: u8) -> PipelineResult<Self> {
        let writer = match &descriptor.kind {
            SinkKind::Delimited => DelimitedWriter::create(&descriptor.path, delimiter)
                .map(SinkWriter::File),
            SinkKind::Spreadsheet { sheet } => {
                SpreadsheetWriter::create(&descriptor.path, sheet).map(SinkWriter::Spreadsheet)
            }
            SinkKind::Console(stream) => Ok(SinkWriter::Console(DelimitedWriter::new(
                stream.writer(),
                delimiter,
            ))),
        }
        .map_err(|e| PipelineError::sink(&descriptor.path, format!("cannot create: {:#}", e)))?;

        Ok(Self::from_parts(descriptor, writer))
    }

    /// Console-style sink writing to an arbitrary stream
    pub fn with_writer(
        descriptor: SinkDescriptor,
        out: Box<dyn Write + Send>,
        delimiter: u8,
    ) -> Self {
        Self::from_parts(
            descriptor,
            SinkWriter::Console(DelimitedWriter::new(out, delimiter)),
        )
    }

    fn from_parts(descriptor: SinkDescriptor, writer: SinkWriter) -> Self {
        Self {
            inner: Arc::new(SinkInner {
                descriptor,
                state: Mutex::new(SinkState::Open(writer)),
            }),
        }
    }

    pub fn descriptor(&self) -> &SinkDescriptor {
        &self.inner.descriptor
    }

    pub fn path(&self) -> &Path {
        &self.inner.descriptor.path
    }

    pub fn is_closed(&self) -> bool {
        matches!(*self.lock(), SinkState::Closed)
    }

    /// Write one record, emitting `header` first when present
    pub fn write(&self, header: Option<&[String]>, record: &Record) -> PipelineResult<()> {
        match &mut *self.lock() {
            SinkState::Open(writer) => writer
                .write_record(header, record)
                .map_err(|e| self.error(format!("write failed: {:#}", e))),
            SinkState::Closed => Err(self.error("write after close")),
        }
    }

    /// Flush buffered output; a no-op once closed
    pub fn flush(&self) -> PipelineResult<()> {
        match &mut *self.lock() {
            SinkState::Open(writer) => writer
                .flush()
                .map_err(|e| self.error(format!("flush failed: {:#}", e))),
            SinkState::Closed => Ok(()),
        }
    }

    /// Flush and finalize. Safe to call more than once.
    pub fn close(&self) -> PipelineResult<()> {
        let previous = std::mem::replace(&mut *self.lock(), SinkState::Closed);
        match previous {
            SinkState::Open(writer) => writer
                .finish()
                .map_err(|e| self.error(format!("close failed: {:#}", e))),
            SinkState::Closed => Ok(()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SinkState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn error(&self, message: impl fmt::Display) -> PipelineError {
        PipelineError::sink(self.path(), message)
    }
}
