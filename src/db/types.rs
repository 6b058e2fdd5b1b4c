use std::fmt;
use std::str::FromStr;

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::AuditError;
use crate::row_map::RowMap;

/// Trait for types that can be read back from query results.
pub trait Entity: Serialize + DeserializeOwned {}

// Blanket implementation for any type that meets the requirements
impl<T> Entity for T where T: Serialize + DeserializeOwned {}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Action {
    Insert,
    Update,
    Delete,
    Truncate,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Insert => "Insert",
            Action::Update => "Update",
            Action::Delete => "Delete",
            Action::Truncate => "Truncate",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = AuditError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Insert" => Ok(Action::Insert),
            "Update" => Ok(Action::Update),
            "Delete" => Ok(Action::Delete),
            "Truncate" => Ok(Action::Truncate),
            other => Err(AuditError::Usage(format!("unknown action: {}", other))),
        }
    }
}

/// Whether a capture call describes a single row or a whole statement.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Granularity {
    Row,
    Statement,
}

/// How an attached relation is captured.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CaptureMode {
    RowLevel,
    StatementOnly,
}

impl CaptureMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CaptureMode::RowLevel => "RowLevel",
            CaptureMode::StatementOnly => "StatementOnly",
        }
    }
}

impl FromStr for CaptureMode {
    type Err = AuditError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RowLevel" => Ok(CaptureMode::RowLevel),
            "StatementOnly" => Ok(CaptureMode::StatementOnly),
            other => Err(AuditError::Usage(format!("unknown capture mode: {}", other))),
        }
    }
}

/// A `schema.table` pair. The schema defaults to `main`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RelationName {
    pub schema: String,
    pub table: String,
}

impl RelationName {
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self { schema: schema.into(), table: table.into() }
    }

    /// Parses `table` or `schema.table`.
    pub fn parse(name: &str) -> Self {
        match name.split_once('.') {
            Some((schema, table)) => Self::new(schema, table),
            None => Self::new("main", name),
        }
    }

    /// The relation as a quoted SQL identifier.
    pub fn sql(&self) -> String {
        format!("{}.{}", quote_identifier(&self.schema), quote_identifier(&self.table))
    }
}

impl fmt::Display for RelationName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.table)
    }
}

impl From<&str> for RelationName {
    fn from(name: &str) -> Self {
        RelationName::parse(name)
    }
}

impl From<&RelationName> for RelationName {
    fn from(name: &RelationName) -> Self {
        name.clone()
    }
}

pub(crate) fn quote_identifier(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}

/// An immutable record of one captured change.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub event_id: i64,
    pub schema_name: String,
    pub table_name: String,
    pub relation_id: String,
    /// Best-effort identifying value of the affected row. For statement-level
    /// entries this is taken from the last row the statement touched, when
    /// any was visible, and is not authoritative.
    pub row_id: Option<String>,
    /// Start of the capturing transaction, in ms since the Unix epoch.
    pub timestamp: i64,
    pub transaction_id: String,
    pub session_user: String,
    pub client_query: String,
    pub action: Action,
    pub row_data: Option<RowMap>,
    pub changed_fields: Option<RowMap>,
    pub statement_only: bool,
}

/// A log entry before the store has assigned its event id.
#[derive(Clone, Debug, PartialEq)]
pub struct NewLogEntry {
    pub schema_name: String,
    pub table_name: String,
    pub relation_id: String,
    pub row_id: Option<String>,
    pub timestamp: i64,
    pub transaction_id: String,
    pub session_user: String,
    pub client_query: String,
    pub action: Action,
    pub row_data: Option<RowMap>,
    pub changed_fields: Option<RowMap>,
    pub statement_only: bool,
}

impl NewLogEntry {
    pub(crate) fn into_entry(self, event_id: i64) -> LogEntry {
        LogEntry {
            event_id,
            schema_name: self.schema_name,
            table_name: self.table_name,
            relation_id: self.relation_id,
            row_id: self.row_id,
            timestamp: self.timestamp,
            transaction_id: self.transaction_id,
            session_user: self.session_user,
            client_query: self.client_query,
            action: self.action,
            row_data: self.row_data,
            changed_fields: self.changed_fields,
            statement_only: self.statement_only,
        }
    }
}

impl LogEntry {
    pub fn relation(&self) -> RelationName {
        RelationName::new(&self.schema_name, &self.table_name)
    }
}
