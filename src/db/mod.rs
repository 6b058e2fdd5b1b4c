// Re-export all public items from the db modules
pub use self::types::*;
pub use self::core::AuditDb;
pub use self::transaction::AuditTransaction;
pub use self::sql_parser::{mutation_targets, StatementTarget};
pub use self::side_effects::indirect_writes;

pub mod types;
pub mod core;
pub mod transaction;
pub mod sql_parser;
pub mod side_effects;
