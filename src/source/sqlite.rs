use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use rusqlite::types::ValueRef;
use rusqlite::{Connection, InterruptHandle, OpenFlags, ToSql};
use std::path::PathBuf;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::{Binding, Connector, RowHandler, Session};
use crate::error::{PipelineError, PipelineResult};
use crate::record::{Columns, Value};

/// SQLite connector; the database file must already exist
pub struct SqliteConnector {
    path: PathBuf,
}

impl SqliteConnector {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Connector for SqliteConnector {
    fn describe(&self) -> String {
        format!("sqlite://{}", self.path.display())
    }

    fn connect(&self) -> PipelineResult<Box<dyn Session>> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_URI
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(&self.path, flags)
            .map_err(|e| PipelineError::connection(self.describe(), e))?;
        Ok(Box::new(SqliteSession { conn }))
    }
}

struct SqliteSession {
    conn: Connection,
}

impl SqliteSession {
    fn run(
        &mut self,
        statement: &str,
        binds: &[Binding<'_>],
        on_row: &mut RowHandler<'_>,
    ) -> PipelineResult<()> {
        let mut stmt = self
            .conn
            .prepare(statement)
            .map_err(PipelineError::statement)?;
        let columns: Columns = stmt
            .column_names()
            .into_iter()
            .map(String::from)
            .collect::<Vec<_>>()
            .into();

        // only bind the variables the statement actually mentions
        let mut named: Vec<(String, i64)> = Vec::with_capacity(binds.len());
        for (name, value) in binds {
            let key = format!(":{}", name);
            if stmt
                .parameter_index(&key)
                .map_err(PipelineError::statement)?
                .is_some()
            {
                named.push((key, *value));
            }
        }
        let params: Vec<(&str, &dyn ToSql)> = named
            .iter()
            .map(|(key, value)| (key.as_str(), value as &dyn ToSql))
            .collect();

        let mut rows = stmt
            .query(params.as_slice())
            .map_err(PipelineError::statement)?;
        while let Some(row) = rows.next().map_err(PipelineError::statement)? {
            let values = (0..columns.len())
                .map(|idx| row.get_ref(idx).map(to_value))
                .collect::<Result<Vec<_>, _>>()
                .map_err(PipelineError::row_decode);
            if on_row(&columns, values).is_break() {
                break;
            }
        }
        Ok(())
    }
}

impl Session for SqliteSession {
    fn execute(
        &mut self,
        statement: &str,
        binds: &[Binding<'_>],
        deadline: Option<Duration>,
        on_row: &mut RowHandler<'_>,
    ) -> PipelineResult<()> {
        let watchdog = deadline.map(|d| Watchdog::arm(self.conn.get_interrupt_handle(), d));
        let result = self.run(statement, binds, on_row);
        let expired = watchdog.is_some_and(Watchdog::disarm);

        match result {
            Err(_) if expired => Err(PipelineError::statement(format!(
                "deadline of {} exceeded",
                humantime::format_duration(deadline.unwrap_or_default())
            ))),
            other => other,
        }
    }
}

fn to_value(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Int(i),
        ValueRef::Real(f) => Value::Float(f),
        ValueRef::Text(bytes) => Value::Text(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::Bytes(bytes.to_vec()),
    }
}

/// Interrupts the connection's running statement once the deadline passes
struct Watchdog {
    disarm: Option<Sender<()>>,
    handle: Option<JoinHandle<bool>>,
}

impl Watchdog {
    fn arm(interrupt: InterruptHandle, deadline: Duration) -> Self {
        let (disarm, disarmed) = bounded::<()>(1);
        let handle = thread::spawn(move || match disarmed.recv_timeout(deadline) {
            Err(RecvTimeoutError::Timeout) => {
                interrupt.interrupt();
                true
            }
            _ => false,
        });
        Self {
            disarm: Some(disarm),
            handle: Some(handle),
        }
    }

    /// Stop the watchdog; returns whether it fired
    fn disarm(mut self) -> bool {
        drop(self.disarm.take());
        self.handle
            .take()
            .and_then(|handle| handle.join().ok())
            .unwrap_or(false)
    }
}
