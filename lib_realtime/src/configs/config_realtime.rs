use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::backoff::RetryPolicy;
use crate::core::connection_manager::{PoolConfig, MAX_POOL_SIZE};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// # Realtime Configuration
///
/// Every field is optional in JSON and falls back to its default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RealtimeConfig {
    pub max_connections: usize,
    pub connection_timeout_ms: u64,
    pub error_grace_period_ms: u64,
    pub health_sweep_interval_ms: u64,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub max_retries: u32,
    pub init_timeout_ms: u64,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            max_connections: 5,
            connection_timeout_ms: 10_000,
            error_grace_period_ms: 60_000,
            health_sweep_interval_ms: 60_000,
            reconnect_base_delay_ms: 1_000,
            reconnect_max_delay_ms: 30_000,
            max_retries: 3,
            init_timeout_ms: 10_000,
        }
    }
}

impl RealtimeConfig {
    /// Reads and validates a JSON config file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connections == 0 || self.max_connections > MAX_POOL_SIZE {
            return Err(ConfigError::Invalid(format!(
                "maxConnections must be between 1 and {}, got {}",
                MAX_POOL_SIZE, self.max_connections
            )));
        }
        if self.reconnect_base_delay_ms == 0 {
            return Err(ConfigError::Invalid("reconnectBaseDelayMs must be positive".into()));
        }
        if self.reconnect_max_delay_ms < self.reconnect_base_delay_ms {
            return Err(ConfigError::Invalid(format!(
                "reconnectMaxDelayMs ({}) is below reconnectBaseDelayMs ({})",
                self.reconnect_max_delay_ms, self.reconnect_base_delay_ms
            )));
        }
        for (name, value) in [
            ("connectionTimeoutMs", self.connection_timeout_ms),
            ("healthSweepIntervalMs", self.health_sweep_interval_ms),
            ("initTimeoutMs", self.init_timeout_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{} must be positive", name)));
            }
        }
        Ok(())
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_connections: self.max_connections,
            connection_timeout: Duration::from_millis(self.connection_timeout_ms),
            error_grace_period: Duration::from_millis(self.error_grace_period_ms),
            sweep_interval: Duration::from_millis(self.health_sweep_interval_ms),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(self.reconnect_base_delay_ms),
            max_delay: Duration::from_millis(self.reconnect_max_delay_ms),
            max_retries: self.max_retries,
        }
    }

    pub fn init_timeout(&self) -> Duration {
        Duration::from_millis(self.init_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults() {
        let config = RealtimeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.pool_config().max_connections, 5);
        assert_eq!(config.retry_policy(), RetryPolicy::default());
        assert_eq!(config.init_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"{{"maxConnections": 8, "maxRetries": 5}}"#).unwrap();

        let config = RealtimeConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.max_connections, 8);
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.reconnect_max_delay_ms, 30_000);
    }

    #[test]
    fn test_pool_above_limit_is_rejected() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"{{"maxConnections": 11}}"#).unwrap();

        let err = RealtimeConfig::from_json_file(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_inverted_delays_are_rejected() {
        let config = RealtimeConfig {
            reconnect_base_delay_ms: 5_000,
            reconnect_max_delay_ms: 1_000,
            ..RealtimeConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_file_and_bad_json() {
        assert!(matches!(
            RealtimeConfig::from_json_file("/definitely/not/here.json"),
            Err(ConfigError::Io { .. })
        ));

        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();
        assert!(matches!(RealtimeConfig::from_json_file(file.path()), Err(ConfigError::Parse(_))));
    }
}
