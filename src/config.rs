//! Device configuration.
//!
//! Configuration is plain data with serde support so a host can load it
//! from JSON alongside its other settings. Every field has a default
//! matching the stock board.
//!
//! # Example
//!
//! ```
//! use knc_dispatch::DeviceConfig;
//!
//! let config = DeviceConfig::from_json(r#"{ "name": "knc0", "poll_interval_us": 5000 }"#).unwrap();
//! assert_eq!(config.name, "knc0");
//! assert_eq!(config.buffer_size, 0x1000);
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::capacity::DEFAULT_INITIAL_CAPACITY;
use crate::error::{DispatchError, Result};
use crate::protocol::{
    DEFAULT_BUFFER_SIZE, REPLY_RECORD_SIZE, REQUEST_FRAME_SIZE, TRANSACTION_HEADER_SIZE,
};

/// Default steady-state delay between polls (10 ms).
pub const DEFAULT_POLL_INTERVAL_US: u64 = 10_000;

/// Default capacity of the async device loop's command channel.
pub const DEFAULT_COMMAND_CHANNEL_CAPACITY: usize = 256;

/// Settings for one board.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Name used as log prefix.
    pub name: String,
    /// Size of one bus transaction in bytes.
    pub buffer_size: usize,
    /// Steady-state delay between polls, in microseconds.
    pub poll_interval_us: u64,
    /// Starting estimate of the device queue depth.
    pub initial_capacity: usize,
    /// Capacity of the async device loop's command channel.
    pub command_channel_capacity: usize,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name: "knc".to_string(),
            buffer_size: DEFAULT_BUFFER_SIZE,
            poll_interval_us: DEFAULT_POLL_INTERVAL_US,
            initial_capacity: DEFAULT_INITIAL_CAPACITY,
            command_channel_capacity: DEFAULT_COMMAND_CHANNEL_CAPACITY,
        }
    }
}

impl DeviceConfig {
    /// Create the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse and validate a JSON configuration.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Set the log name.
    pub fn name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    /// Set the transaction size.
    pub fn buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    /// Set the steady-state poll interval.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_us = u64::try_from(interval.as_micros()).unwrap_or(u64::MAX);
        self
    }

    /// Set the starting capacity estimate.
    pub fn initial_capacity(mut self, capacity: usize) -> Self {
        self.initial_capacity = capacity;
        self
    }

    /// Set the command channel capacity.
    pub fn command_channel_capacity(mut self, capacity: usize) -> Self {
        self.command_channel_capacity = capacity;
        self
    }

    /// Steady-state poll interval.
    #[inline]
    pub fn poll_interval_duration(&self) -> Duration {
        Duration::from_micros(self.poll_interval_us)
    }

    /// Check that the values describe a usable device.
    ///
    /// The buffer must hold the reply header plus one record, and one
    /// submission frame.
    pub fn validate(&self) -> Result<()> {
        let min = (TRANSACTION_HEADER_SIZE + REPLY_RECORD_SIZE).max(REQUEST_FRAME_SIZE);
        if self.buffer_size < min {
            return Err(DispatchError::Config(format!(
                "buffer_size {} is below minimum {}",
                self.buffer_size, min
            )));
        }
        if self.initial_capacity == 0 {
            return Err(DispatchError::Config(
                "initial_capacity must be at least 1".to_string(),
            ));
        }
        if self.command_channel_capacity == 0 {
            return Err(DispatchError::Config(
                "command_channel_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
