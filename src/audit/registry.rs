//! Durable record of which relations are audited and which columns identify
//! their rows.

use std::collections::BTreeSet;

use rusqlite::{params, Connection};
use serde::Deserialize;
use uuid::Uuid;

use crate::db::{CaptureMode, RelationName};
use crate::error::{AuditError, Result};

/// Capture wiring and identity for one relation.
#[derive(Clone, Debug, PartialEq)]
pub struct Attachment {
    pub relation: RelationName,
    /// Assigned on first attach and kept for the life of the registration,
    /// independent of the relation's name.
    pub relation_id: String,
    pub mode: CaptureMode,
    pub log_query_text: bool,
    pub excluded_columns: BTreeSet<String>,
    pub identity: Vec<String>,
    pub active: bool,
}

#[derive(Debug, Deserialize)]
struct RelationRecord {
    relation_id: String,
    schema_name: String,
    table_name: String,
    mode: String,
    log_query_text: i64,
    excluded_columns: String,
    active: i64,
}

/// Registers `relation` for capture, taking its identity from the declared
/// primary key.
pub fn attach(
    conn: &Connection,
    relation: &RelationName,
    mode: CaptureMode,
    log_query_text: bool,
    excluded_columns: &BTreeSet<String>,
) -> Result<Attachment> {
    reject_internal(relation)?;
    let columns = relation_columns(conn, relation)?;

    let mut primary_key: Vec<(i64, String)> = columns
        .into_iter()
        .filter(|(_, pk)| *pk > 0)
        .map(|(name, pk)| (pk, name))
        .collect();
    primary_key.sort();
    if primary_key.is_empty() {
        return Err(AuditError::Configuration(format!(
            "cannot determine identifying columns for {}: no primary key",
            relation
        )));
    }
    let identity = primary_key.into_iter().map(|(_, name)| name).collect();

    register(conn, relation, mode, log_query_text, excluded_columns, identity)
}

/// Registers a relation with explicitly supplied identifying columns. Used
/// for views, which have no primary key of their own.
pub fn attach_view(
    conn: &Connection,
    relation: &RelationName,
    log_query_text: bool,
    excluded_columns: &BTreeSet<String>,
    identifying_columns: &[String],
) -> Result<Attachment> {
    reject_internal(relation)?;
    if identifying_columns.is_empty() {
        return Err(AuditError::Configuration(format!(
            "no identifying columns supplied for {}",
            relation
        )));
    }
    let unique: BTreeSet<&String> = identifying_columns.iter().collect();
    if unique.len() != identifying_columns.len() {
        return Err(AuditError::Configuration(format!(
            "duplicate identifying column for {}",
            relation
        )));
    }

    let columns = relation_columns(conn, relation)?;
    for column in identifying_columns {
        if !columns.iter().any(|(name, _)| name == column) {
            return Err(AuditError::Configuration(format!(
                "identifying column {} does not exist on {}",
                column, relation
            )));
        }
    }

    register(
        conn,
        relation,
        CaptureMode::RowLevel,
        log_query_text,
        excluded_columns,
        identifying_columns.to_vec(),
    )
}

/// Stops capture for `relation`. The stored identity and all log entries are
/// kept so history remains replayable.
pub fn detach(conn: &Connection, relation: &RelationName) -> Result<()> {
    let attachment = attachment(conn, relation)?
        .ok_or_else(|| AuditError::Lookup(relation.to_string()))?;
    if !attachment.active {
        return Ok(());
    }
    log::debug!("SQL EXECUTE: UPDATE ZA_RELATION SET active = false WHERE relation_name = ?");
    conn.execute(
        "UPDATE ZA_RELATION SET active = false WHERE relation_name = ?",
        [relation.to_string()],
    )?;
    log::info!("Detached {} from auditing", relation);
    Ok(())
}

pub fn identity_of(conn: &Connection, relation: &RelationName) -> Result<Vec<String>> {
    let identity = load_identity(conn, &relation.to_string())?;
    if identity.is_empty() {
        return Err(AuditError::Lookup(relation.to_string()));
    }
    Ok(identity)
}

/// The registration for `relation`, active or not.
pub fn attachment(conn: &Connection, relation: &RelationName) -> Result<Option<Attachment>> {
    let mut stmt = conn.prepare(
        "SELECT relation_id, schema_name, table_name, mode, log_query_text, excluded_columns, active
         FROM ZA_RELATION WHERE relation_name = ?",
    )?;
    let record = serde_rusqlite::from_rows::<RelationRecord>(stmt.query([relation.to_string()])?)
        .next()
        .transpose()?;
    record.map(|record| into_attachment(conn, record)).transpose()
}

/// The registration for `relation` if capture is currently wired.
pub fn active_attachment(conn: &Connection, relation: &RelationName) -> Result<Option<Attachment>> {
    Ok(attachment(conn, relation)?.filter(|a| a.active))
}

pub fn attachments(conn: &Connection) -> Result<Vec<Attachment>> {
    let mut stmt = conn.prepare(
        "SELECT relation_id, schema_name, table_name, mode, log_query_text, excluded_columns, active
         FROM ZA_RELATION ORDER BY relation_name",
    )?;
    let records = serde_rusqlite::from_rows::<RelationRecord>(stmt.query([])?)
        .collect::<std::result::Result<Vec<_>, _>>()?;
    records
        .into_iter()
        .map(|record| into_attachment(conn, record))
        .collect()
}

fn into_attachment(conn: &Connection, record: RelationRecord) -> Result<Attachment> {
    let relation = RelationName::new(record.schema_name, record.table_name);
    let identity = load_identity(conn, &relation.to_string())?;
    Ok(Attachment {
        relation,
        relation_id: record.relation_id,
        mode: record.mode.parse()?,
        log_query_text: record.log_query_text != 0,
        excluded_columns: serde_json::from_str(&record.excluded_columns)?,
        identity,
        active: record.active != 0,
    })
}

fn load_identity(conn: &Connection, relation_name: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT identifying_column FROM ZA_RELATION_IDENTITY
         WHERE relation_name = ? ORDER BY position",
    )?;
    let columns = stmt
        .query_map([relation_name], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(columns)
}

fn register(
    conn: &Connection,
    relation: &RelationName,
    mode: CaptureMode,
    log_query_text: bool,
    excluded_columns: &BTreeSet<String>,
    identity: Vec<String>,
) -> Result<Attachment> {
    for column in &identity {
        if excluded_columns.contains(column) {
            log::warn!(
                "Identifying column {} of {} is excluded from capture; its entries cannot be replayed",
                column, relation
            );
        }
    }

    let existing = attachment(conn, relation)?;
    let relation_id = existing
        .as_ref()
        .map(|a| a.relation_id.clone())
        .unwrap_or_else(|| Uuid::now_v7().to_string());
    let wanted = Attachment {
        relation: existing.as_ref().map_or_else(|| relation.clone(), |a| a.relation.clone()),
        relation_id,
        mode,
        log_query_text,
        excluded_columns: excluded_columns.clone(),
        identity,
        active: true,
    };

    if existing.as_ref() == Some(&wanted) {
        log::debug!("{} is already attached with the same configuration", relation);
        return Ok(wanted);
    }

    let relation_name = wanted.relation.to_string();
    log::debug!("SQL EXECUTE: INSERT INTO ZA_RELATION (...) VALUES (...) ON CONFLICT DO UPDATE");
    conn.execute(
        "INSERT INTO ZA_RELATION (relation_name, relation_id, schema_name, table_name, mode,
            log_query_text, excluded_columns, active)
         VALUES (?, ?, ?, ?, ?, ?, ?, true)
         ON CONFLICT (relation_name) DO UPDATE SET
            mode = excluded.mode,
            log_query_text = excluded.log_query_text,
            excluded_columns = excluded.excluded_columns,
            active = true",
        params![
            relation_name,
            wanted.relation_id,
            wanted.relation.schema,
            wanted.relation.table,
            wanted.mode.as_str(),
            wanted.log_query_text,
            serde_json::to_string(&wanted.excluded_columns)?,
        ],
    )?;

    let identity_changed = existing.as_ref().map_or(true, |a| a.identity != wanted.identity);
    if identity_changed {
        conn.execute(
            "DELETE FROM ZA_RELATION_IDENTITY WHERE relation_name = ?",
            [&relation_name],
        )?;
        for (position, column) in wanted.identity.iter().enumerate() {
            conn.execute(
                "INSERT INTO ZA_RELATION_IDENTITY (relation_name, identifying_column, position)
                 VALUES (?, ?, ?)",
                params![relation_name, column, position as i64],
            )?;
        }
    }

    log::info!(
        "Attached {} ({}) identified by ({})",
        wanted.relation,
        wanted.mode.as_str(),
        wanted.identity.join(", ")
    );
    Ok(wanted)
}

/// `(column name, primary key ordinal)` for every column of `relation`, the
/// ordinal being zero for non key columns.
fn relation_columns(conn: &Connection, relation: &RelationName) -> Result<Vec<(String, i64)>> {
    let mut stmt = conn.prepare("SELECT name, pk FROM pragma_table_info(?, ?) ORDER BY cid")?;
    let columns = stmt
        .query_map(params![relation.table, relation.schema], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    if columns.is_empty() {
        return Err(AuditError::Configuration(format!(
            "relation {} not found or has no columns",
            relation
        )));
    }
    Ok(columns)
}

fn reject_internal(relation: &RelationName) -> Result<()> {
    if relation.table.to_ascii_uppercase().starts_with("ZA_") {
        return Err(AuditError::Configuration(format!(
            "{} is an audit table and cannot be audited",
            relation
        )));
    }
    Ok(())
}
