use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Settings for opening an [`AuditDb`](crate::AuditDb).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Recorded as `session_user` on every log entry. Defaults to the
    /// database uuid when unset.
    pub session_user: Option<String>,
    /// Maximum pooled connections for file databases. In-memory databases
    /// always use a single connection.
    pub pool_size: u32,
    pub busy_timeout_ms: u64,
    pub journal_mode: String,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            session_user: None,
            pool_size: 8,
            busy_timeout_ms: 5_000,
            journal_mode: "WAL".to_string(),
        }
    }
}

impl AuditConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn partial_json_uses_defaults() -> anyhow::Result<()> {
        let config = AuditConfig::from_json_str(r#"{ "session_user": "alice" }"#)?;
        assert_eq!(config.session_user.as_deref(), Some("alice"));
        assert_eq!(config.pool_size, 8);
        assert_eq!(config.busy_timeout(), Duration::from_secs(5));
        assert_eq!(config.journal_mode, "WAL");
        Ok(())
    }

    #[test]
    fn from_file() -> anyhow::Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        write!(file, r#"{{ "pool_size": 2, "busy_timeout_ms": 250 }}"#)?;
        let config = AuditConfig::from_json_file(file.path())?;
        assert_eq!(config.pool_size, 2);
        assert_eq!(config.busy_timeout_ms, 250);
        assert!(config.session_user.is_none());
        Ok(())
    }

    #[test]
    fn invalid_json_is_an_error() {
        assert!(AuditConfig::from_json_str("{ pool_size: }").is_err());
    }
}
