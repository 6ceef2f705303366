//! RDMA connection configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration for RDMA connections created by an [`RdmaDialer`](crate::RdmaDialer).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RdmaConfig {
    /// Connect timeout used when the dial context carries no deadline.
    #[serde(default = "default_connect_timeout", with = "humantime_compat")]
    pub connect_timeout: Duration,

    /// Longest single wait inside the native transport during a read or
    /// write. Close and deadline changes are observed at this granularity.
    #[serde(default = "default_poll_interval", with = "humantime_compat")]
    pub poll_interval: Duration,

    /// Maximum bytes handed to one native send or receive.
    #[serde(default = "default_max_transfer_size")]
    pub max_transfer_size: u32,
}

fn default_connect_timeout() -> Duration {
    crate::dial::DEFAULT_CONNECT_TIMEOUT
}
fn default_poll_interval() -> Duration {
    Duration::from_millis(10)
}
fn default_max_transfer_size() -> u32 {
    16 * 1024
}

impl Default for RdmaConfig {
    fn default() -> Self {
        Self {
            connect_timeout: default_connect_timeout(),
            poll_interval: default_poll_interval(),
            max_transfer_size: default_max_transfer_size(),
        }
    }
}

/// Errors produced while loading an [`RdmaConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

impl RdmaConfig {
    /// Parse and validate a TOML document. Missing fields take their defaults.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: RdmaConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.connect_timeout.is_zero() {
            return Err(ConfigError::Invalid("connect_timeout must be positive".into()));
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::Invalid("poll_interval must be positive".into()));
        }
        if self.max_transfer_size == 0 {
            return Err(ConfigError::Invalid("max_transfer_size must be positive".into()));
        }
        Ok(())
    }
}

/// Durations as floating-point seconds.
mod humantime_compat {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_f64(duration.as_secs_f64())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
