use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{functions::FunctionFlags, Connection, Params, TransactionBehavior};
use rusqlite_migration::Migrations;
use uuid::Uuid;

use crate::audit::capture::SessionInfo;
use crate::audit::log_store::{self, LogFilter};
use crate::audit::registry::{self, Attachment};
use crate::audit::init_audit_tables;
use crate::config::AuditConfig;
use crate::db::{AuditTransaction, CaptureMode, Entity, LogEntry, RelationName};
use crate::error::{AuditError, Result};
use crate::row_map::RowMap;

/// An SQLite database whose mutations, made through [`AuditTransaction`],
/// are captured into an append-only audit log.
#[derive(Clone)]
pub struct AuditDb {
    pool: Pool<SqliteConnectionManager>,
    config: Arc<AuditConfig>,
    database_uuid: String,
}

impl AuditDb {
    pub fn open_memory() -> Result<Self> {
        Self::open_memory_with_config(AuditConfig::default())
    }

    /// In-memory databases live as long as their one connection, so the pool
    /// holds exactly one and never recycles it.
    pub fn open_memory_with_config(config: AuditConfig) -> Result<Self> {
        let manager = SqliteConnectionManager::memory().with_init(init_connection);
        let pool = Pool::builder()
            .max_size(1)
            .min_idle(Some(1))
            .idle_timeout(None)
            .max_lifetime(None)
            .build(manager)?;
        Self::from_pool(pool, config)
    }

    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with_config(path, AuditConfig::default())
    }

    pub fn open_with_config<P: AsRef<Path>>(path: P, config: AuditConfig) -> Result<Self> {
        let journal_mode = config.journal_mode.clone();
        let busy_timeout = config.busy_timeout();
        let manager = SqliteConnectionManager::file(path).with_init(move |conn| {
            conn.pragma_update(None, "journal_mode", &journal_mode)?;
            conn.busy_timeout(busy_timeout)?;
            init_connection(conn)
        });
        let pool = Pool::builder().max_size(config.pool_size).build(manager)?;
        Self::from_pool(pool, config)
    }

    fn from_pool(pool: Pool<SqliteConnectionManager>, config: AuditConfig) -> Result<Self> {
        let conn = pool.get()?;
        init_audit_tables(&conn)?;
        let database_uuid: String = conn.query_row(
            "SELECT value FROM ZA_METADATA WHERE key = 'database_uuid'",
            [],
            |row| row.get(0),
        )?;
        drop(conn);

        log::info!("Opened audit database {}", database_uuid);
        Ok(AuditDb { pool, config: Arc::new(config), database_uuid })
    }

    pub fn database_uuid(&self) -> &str {
        &self.database_uuid
    }

    pub fn config(&self) -> &AuditConfig {
        &self.config
    }

    /// Applies the host application's schema migrations.
    pub fn migrate(&self, migrations: &Migrations) -> Result<()> {
        let mut conn = self.conn()?;
        migrations.to_latest(&mut conn)?;
        Ok(())
    }

    /// Runs setup SQL directly. Nothing run here is audited.
    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        log::debug!("SQL EXECUTE BATCH: {}", sql);
        self.conn()?.execute_batch(sql)?;
        Ok(())
    }

    /// Calls the supplied closure with a transaction that captures every
    /// mutation made through it. Commits automatically if the closure
    /// returns Ok, otherwise rolls back, discarding the captured entries
    /// along with the mutations.
    ///
    /// The closure must use the transaction rather than `self`: an in-memory
    /// database has a single connection, which the transaction holds.
    pub fn transaction<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&AuditTransaction<'_>) -> Result<R>,
    {
        let mut conn = self.conn()?;
        let txn = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let session = self.session_info()?;
        let result = f(&AuditTransaction::new(&txn, session))?;
        txn.commit()?;
        Ok(result)
    }

    /// Registers a relation for capture, identified by its primary key.
    pub fn attach(
        &self,
        relation: &str,
        mode: CaptureMode,
        log_query_text: bool,
        excluded_columns: &[&str],
    ) -> Result<Attachment> {
        let relation = RelationName::parse(relation);
        let excluded = to_set(excluded_columns);
        self.transaction(|txn| {
            registry::attach(txn.connection(), &relation, mode, log_query_text, &excluded)
        })
    }

    /// Registers a relation, typically a view, with explicit identifying
    /// columns.
    pub fn attach_view(
        &self,
        relation: &str,
        log_query_text: bool,
        excluded_columns: &[&str],
        identifying_columns: &[&str],
    ) -> Result<Attachment> {
        let relation = RelationName::parse(relation);
        let excluded = to_set(excluded_columns);
        let identity: Vec<String> = identifying_columns.iter().map(|c| c.to_string()).collect();
        self.transaction(|txn| {
            registry::attach_view(txn.connection(), &relation, log_query_text, &excluded, &identity)
        })
    }

    pub fn detach(&self, relation: &str) -> Result<()> {
        let relation = RelationName::parse(relation);
        self.transaction(|txn| registry::detach(txn.connection(), &relation))
    }

    pub fn identity_of(&self, relation: &str) -> Result<Vec<String>> {
        let conn = self.conn()?;
        registry::identity_of(&conn, &RelationName::parse(relation))
    }

    pub fn attachments(&self) -> Result<Vec<Attachment>> {
        let conn = self.conn()?;
        registry::attachments(&conn)
    }

    pub fn get(&self, event_id: i64) -> Result<LogEntry> {
        let conn = self.conn()?;
        log_store::get(&conn, event_id)
    }

    pub fn entries(&self, filter: &LogFilter) -> Result<Vec<LogEntry>> {
        let conn = self.conn()?;
        log_store::query(&conn, filter)
    }

    pub fn latest_event_id(&self) -> Result<Option<i64>> {
        let conn = self.conn()?;
        log_store::latest_event_id(&conn)
    }

    /// Reconstructs the mutation recorded by `event_id` and executes it in a
    /// transaction of its own. Returns the number of affected rows.
    pub fn replay(&self, event_id: i64) -> Result<usize> {
        self.transaction(|txn| txn.replay(event_id))
    }

    pub fn query<E: Entity, P: Params>(&self, sql: &str, params: P) -> Result<Vec<E>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(sql)?;
        let entities = serde_rusqlite::from_rows::<E>(stmt.query(params)?)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(entities)
    }

    pub fn query_rows<P: Params>(&self, sql: &str, params: P) -> Result<Vec<RowMap>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
            .query_map(params, |row| RowMap::from_row(row))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    fn session_info(&self) -> Result<SessionInfo> {
        Ok(SessionInfo {
            transaction_id: Uuid::now_v7().to_string(),
            timestamp: epoch_millis(SystemTime::now())?,
            session_user: self
                .config
                .session_user
                .clone()
                .unwrap_or_else(|| self.database_uuid.clone()),
        })
    }
}

/// Milliseconds since the Unix epoch. Clocks set before the epoch, or too far
/// past it for an i64, are an error rather than a silently wrong timestamp.
fn epoch_millis(time: SystemTime) -> Result<i64> {
    let elapsed = time
        .duration_since(UNIX_EPOCH)
        .map_err(|e| AuditError::Clock(format!("system clock is before the Unix epoch: {}", e)))?;
    i64::try_from(elapsed.as_millis())
        .map_err(|_| AuditError::Clock(format!("{}ms since the Unix epoch does not fit a timestamp", elapsed.as_millis())))
}

fn init_connection(conn: &mut Connection) -> rusqlite::Result<()> {
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.create_scalar_function("uuid7", 0, FunctionFlags::SQLITE_UTF8, |_ctx| {
        Ok(Uuid::now_v7().to_string())
    })?;
    Ok(())
}

fn to_set(columns: &[&str]) -> BTreeSet<String> {
    columns.iter().map(|c| c.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use rusqlite_migration::M;
    use serde::{Deserialize, Serialize};

    use std::time::Duration;

    use super::*;
    use crate::row_map::Scalar;

    #[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
    pub struct Artist {
        pub id: i64,
        pub name: String,
        pub disambiguation: Option<String>,
    }

    fn migrations() -> Migrations<'static> {
        Migrations::new(vec![M::up(
            "
            CREATE TABLE Artist (
                id             INTEGER PRIMARY KEY,
                name           TEXT NOT NULL,
                disambiguation TEXT
            );
        ",
        )])
    }

    #[test]
    fn open_memory() -> anyhow::Result<()> {
        let db = AuditDb::open_memory()?;
        assert!(uuid::Uuid::parse_str(db.database_uuid()).is_ok());
        assert_eq!(db.latest_event_id()?, None);
        Ok(())
    }

    #[test]
    fn reopening_a_file_keeps_the_database_uuid() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("audit.db");
        let first = AuditDb::open(&path)?.database_uuid().to_string();
        let second = AuditDb::open(&path)?.database_uuid().to_string();
        assert_eq!(first, second);
        Ok(())
    }

    fn tool() -> RowMap {
        RowMap::from_iter([("id", Scalar::from(1)), ("name", Scalar::from("Tool"))])
    }

    #[test]
    fn session_user_defaults_to_database_uuid() -> anyhow::Result<()> {
        let db = AuditDb::open_memory()?;
        db.migrate(&migrations())?;
        db.attach("Artist", CaptureMode::RowLevel, false, &[])?;
        db.transaction(|txn| txn.insert("Artist", &tool()))?;
        let entry = db.get(1)?;
        assert_eq!(entry.session_user, db.database_uuid());
        Ok(())
    }

    #[test]
    fn configured_session_user() -> anyhow::Result<()> {
        let config = AuditConfig { session_user: Some("alice".to_string()), ..Default::default() };
        let db = AuditDb::open_memory_with_config(config)?;
        db.migrate(&migrations())?;
        db.attach("Artist", CaptureMode::RowLevel, false, &[])?;
        db.transaction(|txn| txn.insert("Artist", &tool()))?;
        assert_eq!(db.get(1)?.session_user, "alice");
        Ok(())
    }

    #[test]
    fn query_maps_entities() -> anyhow::Result<()> {
        let db = AuditDb::open_memory()?;
        db.migrate(&migrations())?;
        db.execute_batch("INSERT INTO Artist (id, name) VALUES (1, 'Metallica'), (2, 'Iron Maiden')")?;
        let artists: Vec<Artist> = db.query("SELECT * FROM Artist ORDER BY name", [])?;
        assert_eq!(artists.len(), 2);
        assert_eq!(artists[0].name, "Iron Maiden");
        assert_eq!(artists[1].disambiguation, None);

        let rows = db.query_rows("SELECT name FROM Artist WHERE id = ?", [1])?;
        assert_eq!(rows, vec![RowMap::from_iter([("name", "Metallica")])]);
        Ok(())
    }

    #[test]
    fn failed_closure_rolls_back() -> anyhow::Result<()> {
        let db = AuditDb::open_memory()?;
        db.migrate(&migrations())?;
        db.attach("Artist", CaptureMode::RowLevel, true, &[])?;
        let result: Result<()> = db.transaction(|txn| {
            txn.insert("Artist", &tool())?;
            Err(AuditError::Usage("abort".to_string()))
        });
        assert!(result.is_err());
        assert!(db.query_rows("SELECT * FROM Artist", [])?.is_empty());
        assert_eq!(db.latest_event_id()?, None);
        Ok(())
    }

    #[test]
    fn read_wrappers_share_the_pool() -> anyhow::Result<()> {
        let db = AuditDb::open_memory()?;
        db.migrate(&migrations())?;
        db.attach("Artist", CaptureMode::RowLevel, false, &["disambiguation"])?;
        db.transaction(|txn| txn.insert("Artist", &tool()))?;

        assert_eq!(db.identity_of("Artist")?, vec!["id".to_string()]);
        let attachments = db.attachments()?;
        assert_eq!(attachments.len(), 1);
        assert_eq!(attachments[0].relation, RelationName::parse("Artist"));
        assert_eq!(db.entries(&LogFilter::new().relation("Artist"))?.len(), 1);
        assert_eq!(db.get(1)?.row_id.as_deref(), Some("1"));
        assert_eq!(db.latest_event_id()?, Some(1));
        Ok(())
    }

    #[test]
    fn epoch_millis_rejects_clocks_before_the_epoch() -> anyhow::Result<()> {
        assert_eq!(epoch_millis(UNIX_EPOCH + Duration::from_millis(1_500))?, 1_500);
        let before = UNIX_EPOCH - Duration::from_secs(1);
        assert!(matches!(epoch_millis(before), Err(AuditError::Clock(_))));
        Ok(())
    }

    #[test]
    fn transactions_are_stamped_with_the_current_time() -> anyhow::Result<()> {
        let db = AuditDb::open_memory()?;
        db.migrate(&migrations())?;
        db.attach("Artist", CaptureMode::RowLevel, false, &[])?;
        let before = epoch_millis(SystemTime::now())?;
        db.transaction(|txn| txn.insert("Artist", &tool()))?;
        let after = epoch_millis(SystemTime::now())?;
        let timestamp = db.get(1)?.timestamp;
        assert!(before <= timestamp && timestamp <= after);
        Ok(())
    }
}
