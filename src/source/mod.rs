//! Query sources
//!
//! Relational sources sit behind [`Connector`] (one per report) and
//! [`Session`] (one per worker). The metrics source is a single
//! fetch-then-pivot call and lives in [`metrics`].

pub mod metrics;
mod postgres;
mod sqlite;

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{DbConnection, DbDriver};
use crate::error::PipelineResult;
use crate::record::{Columns, Value};

pub use self::postgres::PostgresConnector;
pub use self::sqlite::SqliteConnector;

/// Bind variable name and value for one execution
pub type Binding<'a> = (&'a str, i64);

/// Receives the rows of one execution in result-set order. Returning
/// `ControlFlow::Break` stops the iteration early.
pub type RowHandler<'a> =
    dyn FnMut(&Columns, PipelineResult<Vec<Value>>) -> ControlFlow<()> + 'a;

/// An open connection owned by exactly one worker
pub trait Session: Send {
    /// Prepare and run `statement` with `binds`, feeding every row to
    /// `on_row`. The statement and its result set are released before
    /// this returns.
    fn execute(
        &mut self,
        statement: &str,
        binds: &[Binding<'_>],
        deadline: Option<Duration>,
        on_row: &mut RowHandler<'_>,
    ) -> PipelineResult<()>;
}

/// Opens sessions against one configured data source
pub trait Connector: Send + Sync {
    /// Connection target for log lines, without credentials
    fn describe(&self) -> String;

    fn connect(&self) -> PipelineResult<Box<dyn Session>>;
}

/// Connector for a relational connection descriptor
pub fn connector_for(connection: &DbConnection) -> Arc<dyn Connector> {
    match connection.driver {
        DbDriver::Postgres => Arc::new(PostgresConnector::new(connection)),
        DbDriver::Sqlite => Arc::new(SqliteConnector::new(&connection.database)),
    }
}

/// Rewrite `:name` bind variables into `$n` placeholders.
///
/// Returns the rewritten statement and the variable names in placeholder
/// order. String literals, quoted identifiers, comments and `::` casts are
/// left alone; a repeated name reuses its placeholder.
pub fn rewrite_named_binds(statement: &str) -> (String, Vec<String>) {
    let chars: Vec<char> = statement.chars().collect();
    let mut out = String::with_capacity(statement.len());
    let mut names: Vec<String> = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            '\'' | '"' => {
                // copy the quoted section verbatim, doubled quotes included
                out.push(c);
                i += 1;
                while i < chars.len() {
                    out.push(chars[i]);
                    if chars[i] == c {
                        if chars.get(i + 1) == Some(&c) {
                            out.push(c);
                            i += 2;
                            continue;
                        }
                        break;
                    }
                    i += 1;
                }
                i += 1;
            }
            '-' if chars.get(i + 1) == Some(&'-') => {
                while i < chars.len() && chars[i] != '\n' {
                    out.push(chars[i]);
                    i += 1;
                }
            }
            ':' if chars.get(i + 1) == Some(&':') => {
                out.push_str("::");
                i += 2;
            }
            ':' if chars
                .get(i + 1)
                .is_some_and(|n| n.is_ascii_alphabetic() || *n == '_') =>
            {
                let start = i + 1;
                let mut end = start;
                while end < chars.len() && (chars[end].is_ascii_alphanumeric() || chars[end] == '_')
                {
                    end += 1;
                }
                let name: String = chars[start..end].iter().collect();
                let position = match names.iter().position(|n| *n == name) {
                    Some(idx) => idx + 1,
                    None => {
                        names.push(name);
                        names.len()
                    }
                };
                out.push('$');
                out.push_str(&position.to_string());
                i = end;
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }

    (out, names)
}
