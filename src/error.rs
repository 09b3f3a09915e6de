//! Error taxonomy for report execution
//!
//! Every variant is recovered where it happens and logged with its `kind`;
//! only configuration load failure at startup ends the process.

use std::fmt::Display;
use std::path::Path;

use thiserror::Error;

/// Result type for pipeline operations
pub type PipelineResult<T> = Result<T, PipelineError>;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PipelineError {
    /// Malformed range, missing connection fields, unknown driver
    #[error("configuration error: {0}")]
    Config(String),

    /// The data source could not be reached
    #[error("cannot connect to {target}: {message}")]
    Connection { target: String, message: String },

    /// Prepare or execute failed for one work item
    #[error("statement failed: {0}")]
    Statement(String),

    #[error("cannot decode row: {0}")]
    RowDecode(String),

    /// Create, write, flush or close failed on a sink
    #[error("sink {target}: {message}")]
    Sink { target: String, message: String },

    #[error("email delivery failed: {0}")]
    Delivery(String),
}

impl PipelineError {
    pub fn config(message: impl Display) -> Self {
        PipelineError::Config(message.to_string())
    }

    pub fn connection(target: impl Display, message: impl Display) -> Self {
        PipelineError::Connection {
            target: target.to_string(),
            message: message.to_string(),
        }
    }

    pub fn statement(message: impl Display) -> Self {
        PipelineError::Statement(message.to_string())
    }

    pub fn row_decode(message: impl Display) -> Self {
        PipelineError::RowDecode(message.to_string())
    }

    pub fn sink(target: &Path, message: impl Display) -> Self {
        PipelineError::Sink {
            target: target.display().to_string(),
            message: message.to_string(),
        }
    }

    pub fn delivery(message: impl Display) -> Self {
        PipelineError::Delivery(message.to_string())
    }

    /// Short taxonomy name used as the `kind` field in log lines
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Config(_) => "config",
            PipelineError::Connection { .. } => "connection",
            PipelineError::Statement(_) => "statement",
            PipelineError::RowDecode(_) => "row_decode",
            PipelineError::Sink { .. } => "sink",
            PipelineError::Delivery(_) => "delivery",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names() {
        assert_eq!(PipelineError::config("x").kind(), "config");
        assert_eq!(PipelineError::connection("db", "refused").kind(), "connection");
        assert_eq!(PipelineError::statement("x").kind(), "statement");
        assert_eq!(PipelineError::row_decode("x").kind(), "row_decode");
        assert_eq!(PipelineError::sink(Path::new("a.csv"), "x").kind(), "sink");
        assert_eq!(PipelineError::delivery("x").kind(), "delivery");
    }

    #[test]
    fn test_display_includes_target() {
        let err = PipelineError::connection("postgres://db:5432/app", "connection refused");
        assert_eq!(
            err.to_string(),
            "cannot connect to postgres://db:5432/app: connection refused"
        );

        let err = PipelineError::sink(Path::new("/tmp/out.csv"), "closed");
        assert_eq!(err.to_string(), "sink /tmp/out.csv: closed");
    }
}
