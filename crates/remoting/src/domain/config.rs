//! Remoting configuration with validation.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default maximum frame size (16 MiB)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Longest timeout a call may carry; larger values are capped to it
pub const MAX_INVOKE_TIMEOUT: Duration = Duration::from_secs(30 * 365 * 24 * 60 * 60);

/// Largest frame the 32-bit length prefix can describe
pub const MAX_FRAME_SIZE_LIMIT: usize = u32::MAX as usize;

/// Main remoting configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RemotingConfig {
    /// Invocation limits and timeouts
    pub invoke: InvokeConfig,
    /// Worker pool sizing
    pub executors: ExecutorConfig,
    /// Timeout reaper schedule
    pub reaper: ReaperConfig,
    /// Reference transport settings
    pub transport: TransportConfig,
}

impl RemotingConfig {
    /// Parse a TOML document; missing sections fall back to defaults.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: RemotingConfig =
            toml::from_str(s).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.invoke.default_timeout.is_zero() {
            return Err(ConfigError::InvalidTimeout(
                "default_timeout cannot be 0".into(),
            ));
        }

        if self.invoke.async_permits == 0 {
            return Err(ConfigError::InvalidLimit(
                "async_permits cannot be 0".into(),
            ));
        }

        if self.invoke.oneway_permits == 0 {
            return Err(ConfigError::InvalidLimit(
                "oneway_permits cannot be 0".into(),
            ));
        }

        // Header length prefix alone needs 8 bytes
        if self.invoke.max_frame_size < 8 {
            return Err(ConfigError::InvalidLimit(
                "max_frame_size must be at least 8 bytes".into(),
            ));
        }

        if self.invoke.max_frame_size > MAX_FRAME_SIZE_LIMIT {
            return Err(ConfigError::InvalidLimit(format!(
                "max_frame_size cannot exceed {} bytes",
                MAX_FRAME_SIZE_LIMIT
            )));
        }

        if self.executors.callback_threads == 0 || self.executors.public_threads == 0 {
            return Err(ConfigError::InvalidExecutor(
                "executor thread counts cannot be 0".into(),
            ));
        }

        if self.executors.queue_capacity == 0 {
            return Err(ConfigError::InvalidExecutor(
                "queue_capacity cannot be 0".into(),
            ));
        }

        if self.reaper.interval.is_zero() {
            return Err(ConfigError::InvalidTimeout(
                "reaper interval cannot be 0".into(),
            ));
        }

        if self.transport.outbound_buffer == 0 {
            return Err(ConfigError::InvalidLimit(
                "outbound_buffer cannot be 0".into(),
            ));
        }

        Ok(())
    }
}

/// Invocation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InvokeConfig {
    /// Timeout used when callers do not supply one
    #[serde(with = "humantime_serde")]
    pub default_timeout: Duration,
    /// Max outstanding async calls
    pub async_permits: usize,
    /// Max concurrent oneway writes
    pub oneway_permits: usize,
    /// Max encoded frame size in bytes
    pub max_frame_size: usize,
}

impl Default for InvokeConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(3),
            async_permits: 65535,
            oneway_permits: 65535,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Concurrent async callbacks
    pub callback_threads: usize,
    /// Concurrent handlers on the shared public executor
    pub public_threads: usize,
    /// Queue capacity of engine-owned executors
    pub queue_capacity: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            callback_threads: 4,
            public_threads: 4,
            queue_capacity: 10_000,
        }
    }
}

/// Timeout reaper configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaperConfig {
    /// Scan interval
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(200),
        }
    }
}

/// Reference transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Frames buffered per peer before sends are rejected
    pub outbound_buffer: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            outbound_buffer: 1024,
        }
    }
}

/// Configuration errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    /// Invalid size or count limit
    #[error("invalid limit: {0}")]
    InvalidLimit(String),
    /// Invalid timeout value
    #[error("invalid timeout: {0}")]
    InvalidTimeout(String),
    /// Invalid executor sizing
    #[error("invalid executor: {0}")]
    InvalidExecutor(String),
    /// Document could not be parsed
    #[error("parse error: {0}")]
    Parse(String),
}

/// Humantime serde module for Duration serialization
mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}ms", duration.as_millis()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    pub(super) fn parse_duration(s: &str) -> Result<Duration, &'static str> {
        let s = s.trim();
        // "ms" must be checked before "s" and "m"
        if let Some(ms) = s.strip_suffix("ms") {
            ms.trim()
                .parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|_| "invalid milliseconds")
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.trim()
                .parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|_| "invalid seconds")
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.trim()
                .parse::<u64>()
                .map(|m| Duration::from_secs(m * 60))
                .map_err(|_| "invalid minutes")
        } else {
            // Try parsing as plain seconds
            s.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|_| "invalid duration format")
        }
    }
}
