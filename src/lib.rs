pub mod audit;
pub mod config;
pub mod db;
pub mod error;
pub mod row_map;

pub use audit::capture::{capture, CaptureContext, SessionInfo};
pub use audit::log_store::LogFilter;
pub use audit::registry::Attachment;
pub use audit::replay::{reconstruct, ReplayMutation};
pub use config::AuditConfig;
pub use db::{Action, AuditDb, AuditTransaction, CaptureMode, Granularity, LogEntry, RelationName};
pub use error::{AuditError, Result};
pub use row_map::{diff, snapshot, RowMap, Scalar};
pub use rusqlite;
pub use rusqlite_migration;
pub use serde_rusqlite;
