use rusqlite::{params_from_iter, Connection, OptionalExtension, Params};

use crate::audit::capture::{self, CaptureContext, SessionInfo};
use crate::audit::log_store::{self, LogFilter};
use crate::audit::registry::{self, Attachment};
use crate::audit::replay::{self, ReplayMutation};
use crate::db::side_effects::indirect_writes;
use crate::db::sql_parser::mutation_targets;
use crate::db::types::quote_identifier;
use crate::db::{Action, CaptureMode, Entity, Granularity, LogEntry, RelationName};
use crate::error::{AuditError, Result};
use crate::row_map::{RowMap, Scalar};

/// A write transaction whose mutations are captured into the audit log as
/// they happen, on the same connection, so a rollback discards the entries
/// together with the changes.
pub struct AuditTransaction<'a> {
    conn: &'a Connection,
    session: SessionInfo,
}

impl<'a> AuditTransaction<'a> {
    pub(crate) fn new(conn: &'a Connection, session: SessionInfo) -> Self {
        Self { conn, session }
    }

    pub(crate) fn connection(&self) -> &Connection {
        self.conn
    }

    /// Transaction id, start time and user stamped on every entry written by
    /// this transaction.
    pub fn session(&self) -> &SessionInfo {
        &self.session
    }

    pub fn insert<R: Into<RelationName>>(&self, relation: R, values: &RowMap) -> Result<usize> {
        self.insert_many(relation, std::slice::from_ref(values))
    }

    /// Inserts rows with a single statement. Every row must supply the same
    /// columns.
    pub fn insert_many<R: Into<RelationName>>(&self, relation: R, rows: &[RowMap]) -> Result<usize> {
        let relation = relation.into();
        let Some(first) = rows.first() else {
            return Ok(0);
        };
        if rows.iter().any(|row| !row.keys().eq(first.keys())) {
            return Err(AuditError::Usage(format!(
                "all rows inserted into {} in one statement must have the same columns",
                relation
            )));
        }

        let sql = if first.is_empty() {
            if rows.len() > 1 {
                return Err(AuditError::Usage(format!(
                    "only one row of default values can be inserted into {} at a time",
                    relation
                )));
            }
            format!("INSERT INTO {} DEFAULT VALUES", relation.sql())
        } else {
            let columns = first.keys().map(|c| quote_identifier(c)).collect::<Vec<_>>().join(", ");
            let placeholders = format!("({})", vec!["?"; first.len()].join(", "));
            let tuples = vec![placeholders; rows.len()].join(", ");
            format!("INSERT INTO {} ({}) VALUES {}", relation.sql(), columns, tuples)
        };
        let params: Vec<&Scalar> = rows.iter().flat_map(|row| row.values()).collect();

        self.check_indirect_writes(&relation, Action::Insert)?;
        let Some(attachment) = registry::active_attachment(self.conn, &relation)? else {
            return self.run(&sql, &params);
        };

        // Views have no RETURNING, so the supplied values stand in for the
        // stored rows.
        let (affected, new_rows) = if self.is_view(&relation)? {
            (self.run(&sql, &params)?, rows.to_vec())
        } else {
            let returned = self.run_returning(&sql, &params)?;
            (returned.len(), returned)
        };

        match attachment.mode {
            CaptureMode::RowLevel => {
                for new in &new_rows {
                    self.capture(Action::Insert, Granularity::Row, None, Some(new), &attachment, &sql)?;
                }
            }
            CaptureMode::StatementOnly => {
                self.capture(Action::Insert, Granularity::Statement, None, new_rows.last(), &attachment, &sql)?;
            }
        }
        Ok(affected)
    }

    /// Sets `values` on every row matching `selector`. Selector columns are
    /// compared with `IS`, so a NULL selects NULLs, and an empty selector
    /// matches every row.
    pub fn update<R: Into<RelationName>>(&self, relation: R, values: &RowMap, selector: &RowMap) -> Result<usize> {
        let relation = relation.into();
        if values.is_empty() {
            return Ok(0);
        }

        let assignments = values
            .keys()
            .map(|c| format!("{} = ?", quote_identifier(c)))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!("UPDATE {} SET {}{}", relation.sql(), assignments, where_clause(selector));
        let params: Vec<&Scalar> = values.values().chain(selector.values()).collect();

        self.check_indirect_writes(&relation, Action::Update)?;
        let Some(attachment) = registry::active_attachment(self.conn, &relation)? else {
            return self.run(&sql, &params);
        };

        match attachment.mode {
            CaptureMode::RowLevel => {
                let old_rows = self.select(&relation, selector)?;
                let affected = self.run(&sql, &params)?;
                for old in &old_rows {
                    let new = self.reselect(&attachment, old, values)?;
                    self.capture(Action::Update, Granularity::Row, Some(old), Some(&new), &attachment, &sql)?;
                }
                Ok(affected)
            }
            CaptureMode::StatementOnly => {
                let (affected, last_seen) = self.run_statement(&relation, &sql, &params)?;
                self.capture(Action::Update, Granularity::Statement, None, last_seen.as_ref(), &attachment, &sql)?;
                Ok(affected)
            }
        }
    }

    /// Deletes every row matching `selector`, compared as in [`Self::update`].
    pub fn delete<R: Into<RelationName>>(&self, relation: R, selector: &RowMap) -> Result<usize> {
        let relation = relation.into();
        let sql = format!("DELETE FROM {}{}", relation.sql(), where_clause(selector));
        let params: Vec<&Scalar> = selector.values().collect();

        self.check_indirect_writes(&relation, Action::Delete)?;
        let Some(attachment) = registry::active_attachment(self.conn, &relation)? else {
            return self.run(&sql, &params);
        };

        match attachment.mode {
            CaptureMode::RowLevel => {
                let old_rows = self.select(&relation, selector)?;
                let affected = self.run(&sql, &params)?;
                for old in &old_rows {
                    self.capture(Action::Delete, Granularity::Row, Some(old), None, &attachment, &sql)?;
                }
                Ok(affected)
            }
            CaptureMode::StatementOnly => {
                let (affected, last_seen) = self.run_statement(&relation, &sql, &params)?;
                self.capture(Action::Delete, Granularity::Statement, last_seen.as_ref(), None, &attachment, &sql)?;
                Ok(affected)
            }
        }
    }

    /// Empties the relation. Captured as a single statement-level truncate,
    /// whatever the relation's capture mode.
    pub fn truncate<R: Into<RelationName>>(&self, relation: R) -> Result<usize> {
        let relation = relation.into();
        let sql = format!("DELETE FROM {}", relation.sql());
        self.check_indirect_writes(&relation, Action::Truncate)?;
        let affected = self.run(&sql, &[])?;
        if let Some(attachment) = registry::active_attachment(self.conn, &relation)? {
            self.capture(Action::Truncate, Granularity::Statement, None, None, &attachment, &sql)?;
        }
        Ok(affected)
    }

    /// Executes a single raw SQL statement. Writes to relations attached
    /// statement-only are captured as one statement-level entry per target.
    /// Raw writes to relations audited per row are refused, since the row
    /// images cannot be observed; use [`Self::insert`], [`Self::update`] or
    /// [`Self::delete`] for those. Statements other than queries, inserts,
    /// updates and deletes are refused as well.
    pub fn execute<P: Params>(&self, sql: &str, params: P) -> Result<usize> {
        let mut audited = Vec::new();
        for target in mutation_targets(sql)? {
            self.check_indirect_writes(&target.relation, target.action)?;
            let Some(attachment) = registry::active_attachment(self.conn, &target.relation)? else {
                continue;
            };
            if attachment.mode == CaptureMode::RowLevel {
                return Err(AuditError::Usage(format!(
                    "{} is audited per row; raw {} statements against it cannot be captured",
                    attachment.relation, target.action
                )));
            }
            audited.push((target.action, attachment));
        }

        log::debug!("SQL EXECUTE: {}", sql);
        let affected = self.conn.execute(sql, params)?;
        for (action, attachment) in &audited {
            self.capture(*action, Granularity::Statement, None, None, attachment, sql)?;
        }
        Ok(affected)
    }

    pub fn query<E: Entity, P: Params>(&self, sql: &str, params: P) -> Result<Vec<E>> {
        let mut stmt = self.conn.prepare(sql)?;
        let entities = serde_rusqlite::from_rows::<E>(stmt.query(params)?)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(entities)
    }

    pub fn query_rows<P: Params>(&self, sql: &str, params: P) -> Result<Vec<RowMap>> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt
            .query_map(params, |row| RowMap::from_row(row))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn get(&self, event_id: i64) -> Result<LogEntry> {
        log_store::get(self.conn, event_id)
    }

    /// Log entries as visible inside this transaction, including its own
    /// uncommitted ones.
    pub fn entries(&self, filter: &LogFilter) -> Result<Vec<LogEntry>> {
        log_store::query(self.conn, filter)
    }

    /// Re-applies the change recorded by `event_id` through this transaction,
    /// so the replay is itself captured if the relation is still attached.
    pub fn replay(&self, event_id: i64) -> Result<usize> {
        let entry = log_store::get(self.conn, event_id)?;
        let identity = registry::identity_of(self.conn, &entry.relation())?;
        let mutation = replay::reconstruct(&entry, &identity)?;
        log::info!("Replaying event {} as {} on {}", event_id, mutation.action(), mutation.relation());
        self.apply(&mutation)
    }

    pub fn apply(&self, mutation: &ReplayMutation) -> Result<usize> {
        match mutation {
            ReplayMutation::Insert { relation, values } => self.insert(relation, values),
            ReplayMutation::Update { relation, values, selector } => self.update(relation, values, selector),
            ReplayMutation::Delete { relation, selector } => self.delete(relation, selector),
        }
    }

    fn capture(
        &self,
        action: Action,
        granularity: Granularity,
        old_row: Option<&RowMap>,
        new_row: Option<&RowMap>,
        attachment: &Attachment,
        statement: &str,
    ) -> Result<Option<LogEntry>> {
        let ctx = CaptureContext {
            action,
            granularity,
            old_row,
            new_row,
            attachment,
            statement,
            session: &self.session,
        };
        capture::capture(self.conn, &ctx)
    }

    /// Refuses a write whose foreign key actions or triggers would change an
    /// attached relation, since those changes never reach the capture hook.
    fn check_indirect_writes(&self, relation: &RelationName, action: Action) -> Result<()> {
        for target in indirect_writes(self.conn, relation, action)? {
            if let Some(attachment) = registry::active_attachment(self.conn, &target.relation)? {
                return Err(AuditError::Usage(format!(
                    "{} on {} would {} rows of audited relation {} through a foreign key action or trigger, \
                     which cannot be captured",
                    action,
                    relation,
                    target.action.as_str().to_lowercase(),
                    attachment.relation
                )));
            }
        }
        Ok(())
    }

    fn run(&self, sql: &str, params: &[&Scalar]) -> Result<usize> {
        log::debug!("SQL EXECUTE: {}", sql);
        let affected = self.conn.execute(sql, params_from_iter(params.iter()))?;
        log::debug!("SQL EXECUTE RESULT: {} rows affected", affected);
        Ok(affected)
    }

    fn run_returning(&self, sql: &str, params: &[&Scalar]) -> Result<Vec<RowMap>> {
        let sql = format!("{} RETURNING *", sql);
        log::debug!("SQL EXECUTE: {}", sql);
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(params.iter()), |row| RowMap::from_row(row))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        log::debug!("SQL EXECUTE RESULT: {} rows affected", rows.len());
        Ok(rows)
    }

    /// Runs a statement-level update or delete, returning the affected count
    /// and, for tables, the last row the statement touched.
    fn run_statement(&self, relation: &RelationName, sql: &str, params: &[&Scalar]) -> Result<(usize, Option<RowMap>)> {
        if self.is_view(relation)? {
            return Ok((self.run(sql, params)?, None));
        }
        let mut returned = self.run_returning(sql, params)?;
        Ok((returned.len(), returned.pop()))
    }

    fn select(&self, relation: &RelationName, selector: &RowMap) -> Result<Vec<RowMap>> {
        let sql = format!("SELECT * FROM {}{}", relation.sql(), where_clause(selector));
        log::debug!("SQL QUERY: {}", sql);
        let params: Vec<&Scalar> = selector.values().collect();
        self.query_rows(&sql, params_from_iter(params.iter()))
    }

    /// Reads back an updated row by its post-update identity. Falls back to
    /// the old row overlaid with the assigned values when the row cannot be
    /// found again.
    fn reselect(&self, attachment: &Attachment, old: &RowMap, values: &RowMap) -> Result<RowMap> {
        let mut overlay = old.clone();
        for (column, value) in values {
            overlay.insert(column.clone(), value.clone());
        }

        if let Some(key) = overlay.project(&attachment.identity) {
            if let Some(row) = self.select(&attachment.relation, &key)?.into_iter().next() {
                return Ok(row);
            }
        }
        log::warn!(
            "Could not read back updated row of {}; logging the assigned values instead",
            attachment.relation
        );
        Ok(overlay)
    }

    fn is_view(&self, relation: &RelationName) -> Result<bool> {
        let sql = format!(
            "SELECT type FROM {}.sqlite_master WHERE name = ? COLLATE NOCASE",
            quote_identifier(&relation.schema)
        );
        let kind: Option<String> = self
            .conn
            .query_row(&sql, [&relation.table], |row| row.get(0))
            .optional()?;
        Ok(kind.as_deref() == Some("view"))
    }
}

fn where_clause(selector: &RowMap) -> String {
    if selector.is_empty() {
        return String::new();
    }
    let conditions = selector
        .keys()
        .map(|c| format!("{} IS ?", quote_identifier(c)))
        .collect::<Vec<_>>()
        .join(" AND ");
    format!(" WHERE {}", conditions)
}
