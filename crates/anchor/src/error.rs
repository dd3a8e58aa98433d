//! Error types shared across the Anchor workspace.
//!
//! Adapters wrap native client failures into these kinds so coordinators can
//! classify without knowing the engine: `Transient` is retried with backoff,
//! `Cancelled`/`Timeout` exit loops cleanly, `Unsupported` fails a single
//! operation but never a coordinator, and `Fatal` aborts the surrounding job.

use crate::capability::EngineType;
use std::time::Duration;
use thiserror::Error;

/// A boxed error source preserving the native client failure.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Error type for Anchor operations.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum Error {
    /// Network or handshake failure while opening or using a connection.
    #[error("connection to {engine} at {host}:{port} failed: {source}")]
    Connection {
        /// Engine the connection was addressed to.
        engine: EngineType,
        /// Host from the connection configuration.
        host: String,
        /// Port from the connection configuration.
        port: u16,
        /// Underlying client error.
        #[source]
        source: BoxError,
    },

    /// Operation attempted on a handle that has been closed.
    #[error("connection is closed")]
    ConnectionClosed,

    /// The engine does not implement the requested capability.
    #[error("{engine} does not support {operation}: {reason}")]
    Unsupported {
        /// Engine that lacks the capability.
        engine: EngineType,
        /// Operation that was requested.
        operation: &'static str,
        /// Human-readable explanation of the gap.
        reason: String,
    },

    /// Lookup miss (connection id, table, slot, job, ...).
    #[error("not found: {0}")]
    NotFound(String),

    /// Identifier collision on registration.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Missing or ill-typed configuration field.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Engine-reported query failure.
    #[error("query failed ({summary}): {source}")]
    Query {
        /// Short summary of the offending statement (never the full text).
        summary: String,
        /// Engine error.
        #[source]
        source: BoxError,
    },

    /// The engine tag is not known to the capability registry.
    #[error("unknown engine type: {0}")]
    UnknownEngine(String),

    /// Cancellation token tripped.
    #[error("operation cancelled")]
    Cancelled,

    /// Deadline elapsed.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// Retryable failure (broker unavailable, connection reset, ...).
    #[error("transient failure: {0}")]
    Transient(String),

    /// Serialization failure on a wire or row payload.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Corrupt state; surface up, do not retry.
    #[error("fatal: {0}")]
    Fatal(String),
}

/// Result type for Anchor operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Wrap a native client error with the engine/host/port it was addressed to.
    pub fn connection(
        engine: EngineType,
        host: impl Into<String>,
        port: u16,
        source: impl Into<BoxError>,
    ) -> Self {
        Error::Connection {
            engine,
            host: host.into(),
            port,
            source: source.into(),
        }
    }

    /// Typed capability-gap error.
    pub fn unsupported(
        engine: EngineType,
        operation: &'static str,
        reason: impl Into<String>,
    ) -> Self {
        Error::Unsupported {
            engine,
            operation,
            reason: reason.into(),
        }
    }

    /// Wrap an engine-reported failure with a short statement summary.
    pub fn query(statement: &str, source: impl Into<BoxError>) -> Self {
        Error::Query {
            summary: summarize_statement(statement),
            source: source.into(),
        }
    }

    /// True when the failure is worth a bounded retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transient(_))
    }

    /// True when a capability is missing rather than broken.
    pub fn is_unsupported(&self) -> bool {
        matches!(self, Error::Unsupported { .. })
    }
}

/// First few tokens of a statement, enough to identify it in logs without
/// echoing bind values.
fn summarize_statement(statement: &str) -> String {
    const MAX: usize = 80;
    let trimmed = statement.split_whitespace().collect::<Vec<_>>().join(" ");
    if trimmed.len() <= MAX {
        trimmed
    } else {
        let mut cut = MAX;
        while !trimmed.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}...", &trimmed[..cut])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsupported_carries_engine_and_reason() {
        let err = Error::unsupported(
            EngineType::ClickHouse,
            "update",
            "MergeTree parts are immutable",
        );
        let text = err.to_string();
        assert!(text.contains("clickhouse"));
        assert!(text.contains("update"));
        assert!(text.contains("immutable"));
        assert!(err.is_unsupported());
    }

    #[test]
    fn connection_error_carries_host_and_port() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = Error::connection(EngineType::Postgres, "db.internal", 5432, io);
        let text = err.to_string();
        assert!(text.contains("db.internal"));
        assert!(text.contains("5432"));
    }

    #[test]
    fn query_summary_truncates_long_statements() {
        let stmt = format!("SELECT {} FROM t", "x, ".repeat(100));
        let err = Error::query(&stmt, std::io::Error::other("boom"));
        match err {
            Error::Query { summary, .. } => {
                assert!(summary.len() <= 84);
                assert!(summary.ends_with("..."));
            }
            other => panic!("unexpected error kind: {other}"),
        }
    }

    #[test]
    fn transient_classification() {
        assert!(Error::Transient("broker down".into()).is_transient());
        assert!(!Error::ConnectionClosed.is_transient());
    }
}
