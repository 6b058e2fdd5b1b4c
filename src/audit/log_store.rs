//! Append-only storage for [`LogEntry`] rows.

use rusqlite::types::Value;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Deserialize;

use crate::db::{Action, LogEntry, NewLogEntry, RelationName};
use crate::error::{AuditError, Result};
use crate::row_map::RowMap;

const SELECT_ENTRY: &str = "SELECT event_id, schema_name, table_name, relation_id, row_id,
    timestamp, transaction_id, session_user, client_query, action, row_data,
    changed_fields, statement_only FROM ZA_LOG";

/// Row layout of ZA_LOG, decoded with serde_rusqlite.
#[derive(Debug, Deserialize)]
struct LogEntryRecord {
    event_id: i64,
    schema_name: String,
    table_name: String,
    relation_id: String,
    row_id: Option<String>,
    timestamp: i64,
    transaction_id: String,
    session_user: String,
    client_query: String,
    action: String,
    row_data: Option<String>,
    changed_fields: Option<String>,
    statement_only: i64,
}

impl TryFrom<LogEntryRecord> for LogEntry {
    type Error = AuditError;

    fn try_from(record: LogEntryRecord) -> Result<Self> {
        Ok(LogEntry {
            event_id: record.event_id,
            schema_name: record.schema_name,
            table_name: record.table_name,
            relation_id: record.relation_id,
            row_id: record.row_id,
            timestamp: record.timestamp,
            transaction_id: record.transaction_id,
            session_user: record.session_user,
            client_query: record.client_query,
            action: record.action.parse()?,
            row_data: decode_row_map(record.row_data)?,
            changed_fields: decode_row_map(record.changed_fields)?,
            statement_only: record.statement_only != 0,
        })
    }
}

fn decode_row_map(json: Option<String>) -> Result<Option<RowMap>> {
    json.map(|s| serde_json::from_str(&s)).transpose().map_err(Into::into)
}

fn encode_row_map(map: Option<&RowMap>) -> Result<Option<String>> {
    map.map(serde_json::to_string).transpose().map_err(Into::into)
}

/// Persists `entry` on `conn` and returns it with its event id. The id comes
/// from the store's AUTOINCREMENT sequence, so it is unique and strictly
/// increasing across all writers; ids reserved by aborted transactions are
/// never visible.
pub fn append(conn: &Connection, entry: NewLogEntry) -> Result<LogEntry> {
    let row_data = encode_row_map(entry.row_data.as_ref())?;
    let changed_fields = encode_row_map(entry.changed_fields.as_ref())?;

    log::debug!("SQL EXECUTE: INSERT INTO ZA_LOG (...) VALUES (...)");
    conn.execute(
        "INSERT INTO ZA_LOG (schema_name, table_name, relation_id, row_id, timestamp,
            transaction_id, session_user, client_query, action, row_data, changed_fields,
            statement_only)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            entry.schema_name,
            entry.table_name,
            entry.relation_id,
            entry.row_id,
            entry.timestamp,
            entry.transaction_id,
            entry.session_user,
            entry.client_query,
            entry.action.as_str(),
            row_data,
            changed_fields,
            entry.statement_only,
        ],
    )?;
    let event_id = conn.last_insert_rowid();
    log::debug!("Appended audit event {} ({} on {}.{})",
        event_id, entry.action, entry.schema_name, entry.table_name);

    Ok(entry.into_entry(event_id))
}

pub fn get(conn: &Connection, event_id: i64) -> Result<LogEntry> {
    let sql = format!("{} WHERE event_id = ?", SELECT_ENTRY);
    let mut stmt = conn.prepare(&sql)?;
    let record = serde_rusqlite::from_rows::<LogEntryRecord>(stmt.query([event_id])?)
        .next()
        .transpose()?;
    match record {
        Some(record) => record.try_into(),
        None => Err(AuditError::NotFound(event_id)),
    }
}

pub fn latest_event_id(conn: &Connection) -> Result<Option<i64>> {
    Ok(conn
        .query_row("SELECT MAX(event_id) FROM ZA_LOG", [], |row| row.get::<_, Option<i64>>(0))
        .optional()?
        .flatten())
}

/// Read-only selection over the log. Every criterion is optional and they
/// combine with AND. Results are ordered by event id.
#[derive(Clone, Debug, Default)]
pub struct LogFilter {
    pub relation: Option<RelationName>,
    pub relation_id: Option<String>,
    pub action: Option<Action>,
    pub statement_only: Option<bool>,
    pub transaction_id: Option<String>,
    /// Inclusive lower bound on `timestamp`.
    pub since: Option<i64>,
    /// Exclusive upper bound on `timestamp`.
    pub until: Option<i64>,
    pub after_event_id: Option<i64>,
    pub limit: Option<usize>,
}

impl LogFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn relation(mut self, relation: impl Into<RelationName>) -> Self {
        self.relation = Some(relation.into());
        self
    }

    pub fn relation_id(mut self, relation_id: impl Into<String>) -> Self {
        self.relation_id = Some(relation_id.into());
        self
    }

    pub fn action(mut self, action: Action) -> Self {
        self.action = Some(action);
        self
    }

    pub fn statement_only(mut self, statement_only: bool) -> Self {
        self.statement_only = Some(statement_only);
        self
    }

    pub fn transaction_id(mut self, transaction_id: impl Into<String>) -> Self {
        self.transaction_id = Some(transaction_id.into());
        self
    }

    pub fn since(mut self, timestamp: i64) -> Self {
        self.since = Some(timestamp);
        self
    }

    pub fn until(mut self, timestamp: i64) -> Self {
        self.until = Some(timestamp);
        self
    }

    pub fn after_event_id(mut self, event_id: i64) -> Self {
        self.after_event_id = Some(event_id);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn to_sql(&self) -> (String, Vec<Value>) {
        let mut clauses: Vec<&str> = Vec::new();
        let mut values: Vec<Value> = Vec::new();

        if let Some(relation) = &self.relation {
            clauses.push("schema_name = ? COLLATE NOCASE AND table_name = ? COLLATE NOCASE");
            values.push(Value::Text(relation.schema.clone()));
            values.push(Value::Text(relation.table.clone()));
        }
        if let Some(relation_id) = &self.relation_id {
            clauses.push("relation_id = ?");
            values.push(Value::Text(relation_id.clone()));
        }
        if let Some(action) = self.action {
            clauses.push("action = ?");
            values.push(Value::Text(action.as_str().to_string()));
        }
        if let Some(statement_only) = self.statement_only {
            clauses.push("statement_only = ?");
            values.push(Value::Integer(i64::from(statement_only)));
        }
        if let Some(transaction_id) = &self.transaction_id {
            clauses.push("transaction_id = ?");
            values.push(Value::Text(transaction_id.clone()));
        }
        if let Some(since) = self.since {
            clauses.push("timestamp >= ?");
            values.push(Value::Integer(since));
        }
        if let Some(until) = self.until {
            clauses.push("timestamp < ?");
            values.push(Value::Integer(until));
        }
        if let Some(after) = self.after_event_id {
            clauses.push("event_id > ?");
            values.push(Value::Integer(after));
        }

        let mut sql = SELECT_ENTRY.to_string();
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY event_id ASC");
        if let Some(limit) = self.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }
        (sql, values)
    }
}

pub fn query(conn: &Connection, filter: &LogFilter) -> Result<Vec<LogEntry>> {
    let (sql, values) = filter.to_sql();
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query(rusqlite::params_from_iter(values.iter()))?;
    serde_rusqlite::from_rows::<LogEntryRecord>(rows)
        .map(|record| LogEntry::try_from(record?))
        .collect()
}
