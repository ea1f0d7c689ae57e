//! Link configuration
//!
//! Every knob has an in-code default. Values can be overridden by the caller or loaded
//! from a JSON file; nothing is read from the process environment.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::protocol::{
    DEFAULT_BAUD_RATE, DEFAULT_INTERBYTE_TIMEOUT_MS, DEFAULT_LOG_CAPACITY, DEFAULT_MAX_ERRORS,
    DEFAULT_RESEND_DELAY_MS, DEFAULT_WRITE_TIMEOUT_MS, MIN_RESPONSE_TIMEOUT_MS,
};

/// Errors that can occur while loading a configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config: {0}")]
    Json(#[from] serde_json::Error),
}

/// Complete configuration for one physical link
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowlinkConfig {
    /// Serial transport settings
    pub serial: SerialSettings,
    /// Port timing
    pub port: PortTiming,
    /// Retry behaviour of the connection
    pub retry: RetryPolicy,
}

impl FlowlinkConfig {
    /// Default configuration for the serial device at `path`
    pub fn for_path(path: impl Into<String>) -> Self {
        Self {
            serial: SerialSettings {
                path: path.into(),
                ..SerialSettings::default()
            },
            ..Self::default()
        }
    }

    /// Parse a configuration from JSON. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load a configuration from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }
}

/// Serial port settings. The line is always 8N1 without flow control.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialSettings {
    /// Port name (e.g., "/dev/ttyUSB0" or "COM3")
    pub path: String,
    /// Baud rate
    pub baud_rate: u32,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            path: String::new(),
            baud_rate: DEFAULT_BAUD_RATE,
        }
    }
}

/// Timing applied by a port while collecting a response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortTiming {
    /// Floor for the overall response deadline
    pub min_response_timeout_ms: u64,
    /// Maximum silence between two bytes of the same frame
    pub interbyte_timeout_ms: u64,
    /// Deadline for writing and flushing one request
    pub write_timeout_ms: u64,
    /// Number of received bytes retained for replay
    pub log_capacity: usize,
}

impl PortTiming {
    /// Floor for the overall response deadline
    pub fn min_response_timeout(&self) -> Duration {
        Duration::from_millis(self.min_response_timeout_ms)
    }

    /// Maximum silence between two bytes of the same frame
    pub fn interbyte_timeout(&self) -> Duration {
        Duration::from_millis(self.interbyte_timeout_ms)
    }

    /// Deadline for writing and flushing one request
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    /// Overall deadline for a response the slave declares it answers within `declared`
    pub fn response_deadline(&self, declared: Duration) -> Duration {
        declared
            .saturating_mul(2)
            .max(self.min_response_timeout())
    }
}

impl Default for PortTiming {
    fn default() -> Self {
        Self {
            min_response_timeout_ms: MIN_RESPONSE_TIMEOUT_MS,
            interbyte_timeout_ms: DEFAULT_INTERBYTE_TIMEOUT_MS,
            write_timeout_ms: DEFAULT_WRITE_TIMEOUT_MS,
            log_capacity: DEFAULT_LOG_CAPACITY,
        }
    }
}

/// Error budget and resend behaviour for one logical request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of errors tolerated within one logical request
    pub max_errors: u32,
    /// Delay before re-issuing the original command
    pub resend_delay_ms: u64,
}

impl RetryPolicy {
    /// Delay before re-issuing the original command
    pub fn resend_delay(&self) -> Duration {
        Duration::from_millis(self.resend_delay_ms)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_errors: DEFAULT_MAX_ERRORS,
            resend_delay_ms: DEFAULT_RESEND_DELAY_MS,
        }
    }
}
