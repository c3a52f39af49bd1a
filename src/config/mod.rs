//! Configuration for document stores and replication
//!
//! Handles loading and validating configuration from TOML files. Everything
//! here can also be built in code; the file form exists so host applications
//! can ship tuning without recompiling.

mod defaults;

pub use defaults::*;

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Replication tuning
    #[serde(default)]
    pub replication: ReplicationConfig,

    /// 429 retry policy for the HTTP client
    #[serde(default)]
    pub retry: RetryConfig,
}

/// Replication tuning knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Maximum `_changes` rows requested per batch
    #[serde(default = "default_change_limit_per_batch")]
    pub change_limit_per_batch: usize,

    /// Sub-batch fan-out for bulk-get and force-insert
    #[serde(default = "default_insert_batch_size")]
    pub insert_batch_size: usize,

    /// Request attachments embedded as base64 instead of streaming them
    #[serde(default)]
    pub pull_attachments_inline: bool,

    /// Request timeout in seconds for remote calls
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            change_limit_per_batch: default_change_limit_per_batch(),
            insert_batch_size: default_insert_batch_size(),
            pull_attachments_inline: false,
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

/// Retry policy applied to 429 Too Many Requests responses
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Number of times to replay a request that received a 429
    #[serde(default = "default_number_of_replays")]
    pub number_of_replays: u32,

    /// Initial delay before retrying, doubled per subsequent attempt
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Honour a server-sent Retry-After header over the local backoff
    #[serde(default = "default_prefer_retry_after")]
    pub prefer_retry_after: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            number_of_replays: default_number_of_replays(),
            initial_backoff_ms: default_initial_backoff_ms(),
            prefer_retry_after: default_prefer_retry_after(),
        }
    }
}

impl RetryConfig {
    /// Initial backoff as a [`Duration`]
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        debug!("Loading config from {:?}", path);
        let text = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the loaded values
    pub fn validate(&self) -> Result<()> {
        if self.replication.change_limit_per_batch == 0 {
            return Err(Error::Config(
                "replication.change_limit_per_batch must be positive".to_string(),
            ));
        }
        if self.replication.insert_batch_size == 0 {
            return Err(Error::Config(
                "replication.insert_batch_size must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.replication.change_limit_per_batch, 1000);
        assert_eq!(config.replication.insert_batch_size, 100);
        assert!(!config.replication.pull_attachments_inline);
        assert_eq!(config.retry.number_of_replays, 3);
        assert_eq!(config.retry.initial_backoff_ms, 250);
        assert!(config.retry.prefer_retry_after);
    }

    #[test]
    fn test_partial_toml() {
        let config: Config =
            toml::from_str("[replication]\nchange_limit_per_batch = 50\n").unwrap();
        assert_eq!(config.replication.change_limit_per_batch, 50);
        assert_eq!(config.replication.insert_batch_size, 100);
    }

    #[test]
    fn test_validate_rejects_zero_batch() {
        let config: Config = toml::from_str("[replication]\ninsert_batch_size = 0\n").unwrap();
        assert!(config.validate().is_err());
    }
}
