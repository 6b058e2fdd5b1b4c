pub mod capture;
pub mod log_store;
pub mod registry;
pub mod replay;

use rusqlite::Connection;

use crate::error::Result;

/// ZA is used as a prefix for the audit tables. Z puts them at the end of
/// alphabetical lists and A marks them as audit bookkeeping.
pub(crate) fn init_audit_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS ZA_METADATA (
            key TEXT NOT NULL PRIMARY KEY,
            value TEXT NOT NULL
        );

        INSERT OR IGNORE INTO ZA_METADATA (key, value)
            VALUES ('database_uuid', uuid7());

        CREATE TABLE IF NOT EXISTS ZA_RELATION (
            relation_name TEXT NOT NULL PRIMARY KEY COLLATE NOCASE,
            relation_id TEXT NOT NULL UNIQUE,
            schema_name TEXT NOT NULL,
            table_name TEXT NOT NULL,
            mode TEXT NOT NULL,
            log_query_text BOOL NOT NULL,
            excluded_columns TEXT NOT NULL,
            active BOOL NOT NULL
        );

        CREATE TABLE IF NOT EXISTS ZA_RELATION_IDENTITY (
            relation_name TEXT NOT NULL COLLATE NOCASE,
            identifying_column TEXT NOT NULL,
            position INTEGER NOT NULL,
            PRIMARY KEY (relation_name, identifying_column)
        );

        CREATE TABLE IF NOT EXISTS ZA_LOG (
            event_id INTEGER PRIMARY KEY AUTOINCREMENT,
            schema_name TEXT NOT NULL,
            table_name TEXT NOT NULL,
            relation_id TEXT NOT NULL,
            row_id TEXT,
            timestamp INTEGER NOT NULL,
            transaction_id TEXT NOT NULL,
            session_user TEXT NOT NULL,
            client_query TEXT NOT NULL,
            action TEXT NOT NULL
                CHECK (action IN ('Insert', 'Update', 'Delete', 'Truncate')),
            row_data TEXT,
            changed_fields TEXT,
            statement_only BOOL NOT NULL,
            CHECK (changed_fields IS NULL OR (action = 'Update' AND statement_only = 0)),
            CHECK (statement_only = 0 OR (row_data IS NULL AND changed_fields IS NULL))
        );

        CREATE INDEX IF NOT EXISTS ZA_LOG_RELATION ON ZA_LOG (schema_name, table_name);
        CREATE INDEX IF NOT EXISTS ZA_LOG_RELATION_ID ON ZA_LOG (relation_id);
        CREATE INDEX IF NOT EXISTS ZA_LOG_TIMESTAMP ON ZA_LOG (timestamp);

        CREATE TRIGGER IF NOT EXISTS ZA_LOG_NO_UPDATE BEFORE UPDATE ON ZA_LOG
        BEGIN
            SELECT RAISE(ABORT, 'ZA_LOG is append-only');
        END;

        CREATE TRIGGER IF NOT EXISTS ZA_LOG_NO_DELETE BEFORE DELETE ON ZA_LOG
        BEGIN
            SELECT RAISE(ABORT, 'ZA_LOG is append-only');
        END;
    ",
    )?;
    Ok(())
}
