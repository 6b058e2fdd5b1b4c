//! The capture hook: turns one host mutation (a row or a statement) into at
//! most one log entry.

use rusqlite::Connection;

use crate::audit::log_store;
use crate::audit::registry::Attachment;
use crate::db::{Action, CaptureMode, Granularity, LogEntry, NewLogEntry};
use crate::error::{AuditError, Result};
use crate::row_map::{diff, snapshot, RowMap};

/// Per transaction values stamped on every entry.
#[derive(Clone, Debug)]
pub struct SessionInfo {
    pub transaction_id: String,
    pub timestamp: i64,
    pub session_user: String,
}

/// Everything the host hands the hook for one invocation. Row images must
/// reflect the mutation as visible inside the current transaction.
#[derive(Clone, Copy, Debug)]
pub struct CaptureContext<'a> {
    pub action: Action,
    pub granularity: Granularity,
    pub old_row: Option<&'a RowMap>,
    pub new_row: Option<&'a RowMap>,
    pub attachment: &'a Attachment,
    pub statement: &'a str,
    pub session: &'a SessionInfo,
}

/// Builds the entry for `ctx` and appends it on `conn`, which must be the
/// connection running the audited mutation so both share one transaction.
/// Returns `None` when an update changed nothing outside the excluded
/// columns.
pub fn capture(conn: &Connection, ctx: &CaptureContext<'_>) -> Result<Option<LogEntry>> {
    match build_entry(ctx)? {
        Some(entry) => Ok(Some(log_store::append(conn, entry)?)),
        None => Ok(None),
    }
}

/// The pure half of [`capture`].
pub fn build_entry(ctx: &CaptureContext<'_>) -> Result<Option<NewLogEntry>> {
    let attachment = ctx.attachment;
    let excluded = &attachment.excluded_columns;
    let identity = &attachment.identity;

    let (row_id, row_data, changed_fields, statement_only) =
        match (ctx.granularity, attachment.mode, ctx.action) {
            (Granularity::Row, CaptureMode::RowLevel, Action::Insert) => {
                let new = required(ctx.new_row, ctx, "new")?;
                (new.identifying_value(identity), Some(snapshot(new, excluded)), None, false)
            }
            (Granularity::Row, CaptureMode::RowLevel, Action::Delete) => {
                let old = required(ctx.old_row, ctx, "old")?;
                (old.identifying_value(identity), Some(snapshot(old, excluded)), None, false)
            }
            (Granularity::Row, CaptureMode::RowLevel, Action::Update) => {
                let old = required(ctx.old_row, ctx, "old")?;
                let new = required(ctx.new_row, ctx, "new")?;
                let row_data = snapshot(old, excluded);
                let changed = diff(&row_data, &snapshot(new, excluded));
                if changed.is_empty() {
                    log::debug!(
                        "Suppressed update on {} ({}): no audited column changed",
                        attachment.relation,
                        new.identifying_value(identity).unwrap_or_default()
                    );
                    return Ok(None);
                }
                (new.identifying_value(identity), Some(row_data), Some(changed), false)
            }
            (Granularity::Statement, CaptureMode::StatementOnly, _)
            | (Granularity::Statement, CaptureMode::RowLevel, Action::Truncate) => {
                // Whatever row the host last saw, if any. Not authoritative.
                let representative = ctx.new_row.or(ctx.old_row);
                (representative.and_then(|row| row.identifying_value(identity)), None, None, true)
            }
            (Granularity::Row, CaptureMode::RowLevel, Action::Truncate)
            | (Granularity::Row, CaptureMode::StatementOnly, _)
            | (Granularity::Statement, CaptureMode::RowLevel, _) => {
                return Err(AuditError::Usage(format!(
                    "{:?}-level {} capture is not supported for {} attached as {}",
                    ctx.granularity,
                    ctx.action,
                    attachment.relation,
                    attachment.mode.as_str()
                )));
            }
        };

    let client_query = if attachment.log_query_text {
        ctx.statement.to_string()
    } else {
        String::new()
    };

    Ok(Some(NewLogEntry {
        schema_name: attachment.relation.schema.clone(),
        table_name: attachment.relation.table.clone(),
        relation_id: attachment.relation_id.clone(),
        row_id,
        timestamp: ctx.session.timestamp,
        transaction_id: ctx.session.transaction_id.clone(),
        session_user: ctx.session.session_user.clone(),
        client_query,
        action: ctx.action,
        row_data,
        changed_fields,
        statement_only,
    }))
}

fn required<'a>(row: Option<&'a RowMap>, ctx: &CaptureContext<'_>, which: &str) -> Result<&'a RowMap> {
    row.ok_or_else(|| {
        AuditError::Usage(format!(
            "row-level {} capture on {} requires the {} row",
            ctx.action, ctx.attachment.relation, which
        ))
    })
}
