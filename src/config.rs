//! Mediator configuration.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Mediator configuration.
///
/// Every knob the protocol leaves open is a field here: the bounded-buffer
/// capacity used by the ordered forwarders, whether a signed-in user may open
/// a second connector, and whether changing partners force-closes any live
/// forwarding connections.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediatorConfig {
    /// Address to bind to (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind_address: IpAddr,

    /// TCP port to listen on (default: 2125)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Worker refresh interval in milliseconds. Every blocking worker wakes
    /// at this cadence to re-check its run flag (default: 2000).
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_ms: u64,

    /// Capacity of the ordered forwarding buffers (keyboard, mouse,
    /// settings). 0 means unbounded (default: 64).
    #[serde(default = "default_event_buffer_capacity")]
    pub event_buffer_capacity: usize,

    /// Capacity of each connector's command queue (default: 32).
    #[serde(default = "default_connector_queue_capacity")]
    pub connector_queue_capacity: usize,

    /// Maximum accepted wire frame size in bytes (default: 16 MiB).
    #[serde(default = "default_max_frame_len")]
    pub max_frame_len: usize,

    /// Permit a username that is already connected to log in again from a
    /// second device (default: false).
    #[serde(default)]
    pub allow_multiple_connectors: bool,

    /// When set, `set partner` closes any live forwarding connections before
    /// re-assigning. When unset the request is refused while forwarders are
    /// attached (default: false).
    #[serde(default)]
    pub auto_close_forwarders_on_set_partner: bool,

    /// Path of the JSON credential store.
    #[serde(default = "default_store_path")]
    pub store_path: String,
}

fn default_bind_address() -> IpAddr {
    "0.0.0.0".parse().unwrap()
}

fn default_port() -> u16 {
    2125
}

fn default_refresh_interval() -> u64 {
    2000
}

fn default_event_buffer_capacity() -> usize {
    64
}

fn default_connector_queue_capacity() -> usize {
    32
}

fn default_max_frame_len() -> usize {
    16 * 1024 * 1024
}

fn default_store_path() -> String {
    "users.json".to_string()
}

impl Default for MediatorConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            refresh_interval_ms: default_refresh_interval(),
            event_buffer_capacity: default_event_buffer_capacity(),
            connector_queue_capacity: default_connector_queue_capacity(),
            max_frame_len: default_max_frame_len(),
            allow_multiple_connectors: false,
            auto_close_forwarders_on_set_partner: false,
            store_path: default_store_path(),
        }
    }
}

impl MediatorConfig {
    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        serde_json::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Save configuration to a JSON file.
    pub fn to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let content =
            serde_json::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::Io(e.to_string()))
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.refresh_interval_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "refresh_interval_ms cannot be 0".into(),
            ));
        }
        if self.max_frame_len == 0 {
            return Err(ConfigError::InvalidValue("max_frame_len cannot be 0".into()));
        }
        if self.connector_queue_capacity == 0 {
            return Err(ConfigError::InvalidValue(
                "connector_queue_capacity cannot be 0".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(String),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("invalid value: {0}")]
    InvalidValue(String),
}
