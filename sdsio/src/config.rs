//! Configuration for the client context and the recorder/player
//!
//! Everything deserializes from TOML; missing fields fall back to the
//! defaults below. Ring buffer parameters have no defaults: every slot must
//! state its capacity, threshold and overrun policy explicitly.
//!
//! ```toml
//! [client]
//! open_timeout_ms = 1000
//! max_payload = 16384
//!
//! [recplay]
//! service_interval_ms = 5
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ring_buffer::RingBufferConfig;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Client protocol settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SdsioConfig {
    /// Deadline for establishing the transport at init
    pub connect_timeout_ms: u64,
    /// Deadline for an Open reply
    pub open_timeout_ms: u64,
    /// Deadline for a Read reply
    pub read_timeout_ms: u64,
    /// Deadline for a Close reply
    pub close_timeout_ms: u64,
    /// Deadline for queueing the frames of one Write
    pub write_timeout_ms: u64,
    /// Largest payload of a single frame
    pub max_payload: usize,
    /// Size of the client stream table
    pub max_streams: usize,
    /// Frames that may be queued for transmission before Write waits
    pub tx_queue_depth: usize,
}

impl Default for SdsioConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 3000,
            open_timeout_ms: 1000,
            read_timeout_ms: 1000,
            close_timeout_ms: 1000,
            write_timeout_ms: 1000,
            max_payload: 16 * 1024,
            max_streams: 16,
            tx_queue_depth: 64,
        }
    }
}

impl SdsioConfig {
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    #[must_use]
    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }

    #[must_use]
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    #[must_use]
    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    #[must_use]
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    /// # Errors
    /// Rejects zero-sized limits.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_payload == 0 {
            return Err(ConfigError::Invalid("max_payload must be > 0".into()));
        }
        if self.max_streams == 0 || self.max_streams > usize::from(u16::MAX) {
            return Err(ConfigError::Invalid(format!(
                "max_streams must be in 1..={}",
                u16::MAX
            )));
        }
        if self.tx_queue_depth == 0 {
            return Err(ConfigError::Invalid("tx_queue_depth must be > 0".into()));
        }
        Ok(())
    }
}

/// Recorder/player orchestrator settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecPlayConfig {
    /// Number of slots in the slot table
    pub max_slots: usize,
    /// Period at which each slot task services its buffer
    pub service_interval_ms: u64,
}

impl Default for RecPlayConfig {
    fn default() -> Self {
        Self {
            max_slots: 8,
            service_interval_ms: 10,
        }
    }
}

impl RecPlayConfig {
    #[must_use]
    pub fn service_interval(&self) -> Duration {
        Duration::from_millis(self.service_interval_ms.max(1))
    }
}

/// One recorder or player slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotConfig {
    /// Stream name on the server
    pub name: String,
    /// Ring buffer between the application and the slot task
    pub buffer: RingBufferConfig,
    /// Longest time recorded data may sit unsent (recorder only)
    #[serde(default = "default_max_staleness_ms")]
    pub max_staleness_ms: u64,
}

fn default_max_staleness_ms() -> u64 {
    100
}

impl SlotConfig {
    #[must_use]
    pub fn new(name: &str, buffer: RingBufferConfig) -> Self {
        Self {
            name: name.to_string(),
            buffer,
            max_staleness_ms: default_max_staleness_ms(),
        }
    }

    #[must_use]
    pub fn with_max_staleness(mut self, staleness: Duration) -> Self {
        self.max_staleness_ms = u64::try_from(staleness.as_millis()).unwrap_or(u64::MAX);
        self
    }

    #[must_use]
    pub fn max_staleness(&self) -> Duration {
        Duration::from_millis(self.max_staleness_ms)
    }
}

/// Top-level configuration file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub client: SdsioConfig,
    pub recplay: RecPlayConfig,
    pub recorders: Vec<SlotConfig>,
    pub players: Vec<SlotConfig>,
}

impl Config {
    /// # Errors
    /// Returns a parse error or a validation error.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.client.validate()?;
        Ok(config)
    }

    /// # Errors
    /// Returns a read, parse or validation error.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }
}
