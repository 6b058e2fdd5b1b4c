//! Turns a logged row-level change back into the mutation that produced it.

use crate::db::{Action, LogEntry, RelationName};
use crate::error::{AuditError, Result};
use crate::row_map::RowMap;

/// A mutation reconstructed from a log entry, ready to run against the
/// entry's relation.
#[derive(Clone, Debug, PartialEq)]
pub enum ReplayMutation {
    Insert { relation: RelationName, values: RowMap },
    Update { relation: RelationName, values: RowMap, selector: RowMap },
    Delete { relation: RelationName, selector: RowMap },
}

impl ReplayMutation {
    pub fn action(&self) -> Action {
        match self {
            ReplayMutation::Insert { .. } => Action::Insert,
            ReplayMutation::Update { .. } => Action::Update,
            ReplayMutation::Delete { .. } => Action::Delete,
        }
    }

    pub fn relation(&self) -> &RelationName {
        match self {
            ReplayMutation::Insert { relation, .. }
            | ReplayMutation::Update { relation, .. }
            | ReplayMutation::Delete { relation, .. } => relation,
        }
    }
}

/// Rebuilds the mutation recorded by `entry`.
///
/// Inserts re-insert the logged row. Updates set the changed fields on the
/// row selected by the pre-update values of `identity`, and deletes remove
/// that row. Statement-level entries carry no row and cannot be replayed.
///
/// BLOB values come back as their logged `\x<hex>` text form (see
/// [`crate::Scalar`]), so replaying them stores TEXT rather than a BLOB.
pub fn reconstruct(entry: &LogEntry, identity: &[String]) -> Result<ReplayMutation> {
    if entry.statement_only {
        return Err(AuditError::Replay(format!(
            "event {} is a statement-level {} and carries no row data",
            entry.event_id, entry.action
        )));
    }

    let relation = entry.relation();
    match entry.action {
        Action::Insert => Ok(ReplayMutation::Insert {
            relation,
            values: row_data(entry)?.clone(),
        }),
        Action::Update => {
            let values = entry.changed_fields.clone().ok_or_else(|| {
                AuditError::Replay(format!("update event {} has no changed fields", entry.event_id))
            })?;
            let selector = selector(entry, identity)?;
            Ok(ReplayMutation::Update { relation, values, selector })
        }
        Action::Delete => Ok(ReplayMutation::Delete {
            relation,
            selector: selector(entry, identity)?,
        }),
        Action::Truncate => Err(AuditError::Replay(format!(
            "event {} is a truncate and cannot be replayed",
            entry.event_id
        ))),
    }
}

fn row_data(entry: &LogEntry) -> Result<&RowMap> {
    entry.row_data.as_ref().ok_or_else(|| {
        AuditError::Replay(format!("{} event {} has no row data", entry.action, entry.event_id))
    })
}

fn selector(entry: &LogEntry, identity: &[String]) -> Result<RowMap> {
    if identity.is_empty() {
        return Err(AuditError::Replay(format!(
            "{} has no identifying columns",
            entry.relation()
        )));
    }
    row_data(entry)?.project(identity).ok_or_else(|| {
        AuditError::Replay(format!(
            "event {} is missing identifying column(s) {} from its row data",
            entry.event_id,
            identity.join(", ")
        ))
    })
}
