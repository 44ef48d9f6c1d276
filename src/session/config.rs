use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default bound on queued commands for a session thread.
pub const DEFAULT_FEED_CAPACITY: usize = 1024;

/// Default bound on unread quorum events buffered for the host.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Default wait for a read reply from a session thread (5s).
pub const DEFAULT_REPLY_TIMEOUT_MS: u64 = 5000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Configuration for one document session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Branch identifier recorded in summary attributes.
    #[serde(default = "default_branch_id")]
    pub branch_id: String,
    /// Bound on commands queued for the session thread.
    #[serde(default = "default_feed_capacity")]
    pub feed_capacity: usize,
    /// Bound on unread quorum events; newer events are discarded once it is reached.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    #[serde(default = "default_reply_timeout_ms")]
    pub reply_timeout_ms: u64,
    /// `EnvFilter` directive used by the `qp` binary when `RUST_LOG` is unset.
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

fn default_branch_id() -> String {
    "main".to_string()
}

fn default_feed_capacity() -> usize {
    DEFAULT_FEED_CAPACITY
}

fn default_event_capacity() -> usize {
    DEFAULT_EVENT_CAPACITY
}

fn default_reply_timeout_ms() -> u64 {
    DEFAULT_REPLY_TIMEOUT_MS
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            branch_id: default_branch_id(),
            feed_capacity: default_feed_capacity(),
            event_capacity: default_event_capacity(),
            reply_timeout_ms: default_reply_timeout_ms(),
            log_filter: default_log_filter(),
        }
    }
}

impl SessionConfig {
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: SessionConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.branch_id.is_empty() {
            return Err(ConfigError::Invalid("branch_id must not be empty".to_string()));
        }
        if self.feed_capacity == 0 {
            return Err(ConfigError::Invalid("feed_capacity must be at least 1".to_string()));
        }
        if self.event_capacity == 0 {
            return Err(ConfigError::Invalid("event_capacity must be at least 1".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_defaults_fill_missing_fields() {
        let config = SessionConfig::from_toml_str("branch_id = \"doc-7\"\n").unwrap();
        assert_eq!(config.branch_id, "doc-7");
        assert_eq!(config.feed_capacity, DEFAULT_FEED_CAPACITY);
        assert_eq!(config.event_capacity, DEFAULT_EVENT_CAPACITY);
        assert_eq!(config.reply_timeout(), Duration::from_millis(DEFAULT_REPLY_TIMEOUT_MS));
        assert_eq!(config.log_filter, "info");
    }

    #[test]
    fn test_empty_config_is_default() {
        assert_eq!(SessionConfig::from_toml_str("").unwrap(), SessionConfig::default());
    }

    #[test]
    fn test_invalid_capacity() {
        assert!(matches!(
            SessionConfig::from_toml_str("feed_capacity = 0"),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_invalid_event_capacity() {
        assert!(matches!(
            SessionConfig::from_toml_str("event_capacity = 0"),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_parse_error() {
        assert!(matches!(
            SessionConfig::from_toml_str("feed_capacity = \"lots\""),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "branch_id = \"b\"\nreply_timeout_ms = 250\nlog_filter = \"debug\"").unwrap();

        let config = SessionConfig::load(file.path()).unwrap();
        assert_eq!(config.branch_id, "b");
        assert_eq!(config.reply_timeout(), Duration::from_millis(250));
        assert_eq!(config.log_filter, "debug");
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let result = SessionConfig::load(&dir.path().join("absent.toml"));
        assert!(matches!(result, Err(ConfigError::Read { .. })));
    }
}
