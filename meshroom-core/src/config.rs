//! Room configuration
//!
//! Every field has a default, so a config file only needs to name the values
//! it overrides.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Default size of one file-transfer chunk in bytes
pub const DEFAULT_CHUNK_SIZE: usize = 16 * 1024;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("Failed to read config {path}: {source}")]
    Io {
        /// Path that was read
        path: String,
        /// Underlying IO error
        #[source]
        source: std::io::Error,
    },

    /// Config file is not valid JSON for this shape
    #[error("Invalid config: {0}")]
    Parse(#[from] serde_json::Error),

    /// A value is out of range
    #[error("Invalid value for {field}: {reason}")]
    Invalid {
        /// Offending field
        field: &'static str,
        /// Why it was rejected
        reason: String,
    },
}

/// Configuration for one room visit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoomConfig {
    /// STUN/TURN URLs handed to the transport
    pub ice_servers: Vec<String>,
    /// File-transfer chunk size in bytes
    pub chunk_size: usize,
    /// Fixed delay between outgoing chunks
    pub chunk_delay_ms: u64,
    /// Quality metrics tick period
    pub metrics_interval_ms: u64,
    /// Rolling quality history capacity
    pub metrics_history: usize,
    /// Local frame capture period, independent of the metrics tick
    pub frame_capture_interval_ms: u64,
    /// Per-session stats read timeout
    pub stats_timeout_ms: u64,
    /// Attempts while waiting for a local offer before dropping an answer
    pub answer_retry_attempts: u32,
    /// Delay between those attempts
    pub answer_retry_delay_ms: u64,
    /// Target video bitrate in kbps
    pub target_bitrate_kbps: u32,
    /// Maximum number of simultaneous peer sessions
    pub max_peers: usize,
    /// Capacity of the room event broadcast channel
    pub event_channel_capacity: usize,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_delay_ms: 10,
            metrics_interval_ms: 1000,
            metrics_history: 60,
            frame_capture_interval_ms: 200,
            stats_timeout_ms: 500,
            answer_retry_attempts: 5,
            answer_retry_delay_ms: 100,
            target_bitrate_kbps: 500,
            max_peers: 16,
            event_channel_capacity: 1000,
        }
    }
}

impl RoomConfig {
    /// Parse from JSON and validate
    ///
    /// # Errors
    ///
    /// Returns error if the JSON is malformed or a value is out of range
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a JSON file
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or parsed
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&json)
    }

    /// Check value ranges
    ///
    /// # Errors
    ///
    /// Returns the first out-of-range field
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size == 0 {
            return Err(ConfigError::Invalid {
                field: "chunk_size",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.metrics_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "metrics_interval_ms",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.frame_capture_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "frame_capture_interval_ms",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.metrics_history == 0 {
            return Err(ConfigError::Invalid {
                field: "metrics_history",
                reason: "must hold at least one sample".to_string(),
            });
        }
        if self.event_channel_capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "event_channel_capacity",
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }

    /// Inter-chunk delay
    pub fn chunk_delay(&self) -> Duration {
        Duration::from_millis(self.chunk_delay_ms)
    }

    /// Metrics tick period
    pub fn metrics_interval(&self) -> Duration {
        Duration::from_millis(self.metrics_interval_ms)
    }

    /// Local frame capture period
    pub fn frame_capture_interval(&self) -> Duration {
        Duration::from_millis(self.frame_capture_interval_ms)
    }

    /// Per-session stats timeout
    pub fn stats_timeout(&self) -> Duration {
        Duration::from_millis(self.stats_timeout_ms)
    }

    /// Delay between answer retries
    pub fn answer_retry_delay(&self) -> Duration {
        Duration::from_millis(self.answer_retry_delay_ms)
    }
}
