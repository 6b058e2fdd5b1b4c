//! Error types for the audit engine.

use thiserror::Error;

/// Result type for audit operations.
pub type Result<T> = std::result::Result<T, AuditError>;

/// Errors that can occur while capturing, querying or replaying changes.
#[derive(Error, Debug)]
pub enum AuditError {
    /// A relation could not be attached, usually because no identifying
    /// column could be determined. The relation is left unaudited.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The capture hook was invoked with an action/granularity combination it
    /// does not handle. The triggering transaction must be aborted.
    #[error("usage error: {0}")]
    Usage(String),

    /// The relation was never attached for auditing.
    #[error("relation {0} is not attached for auditing")]
    Lookup(String),

    /// No log entry exists with the given event id.
    #[error("audit event {0} not found")]
    NotFound(i64),

    /// The log entry cannot be turned back into a mutation.
    #[error("replay error: {0}")]
    Replay(String),

    /// The system clock cannot produce an entry timestamp.
    #[error("clock error: {0}")]
    Clock(String),

    /// Errors raised by the underlying store, including those from replayed
    /// mutations. These are never rewritten.
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("migration error: {0}")]
    Migration(#[from] rusqlite_migration::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("row decoding error: {0}")]
    RowDecoding(#[from] serde_rusqlite::Error),

    #[error("sql parse error: {0}")]
    SqlParse(#[from] sqlparser::parser::ParserError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
