//! Link configuration, loaded from TOML.

use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::protocol::constants::{
    DEFAULT_ACCESSORY_PROTOCOL, ERROR_BACKOFF_MS, HANDSHAKE_TIMEOUT_MS, INTERRUPT_TIMEOUT_MS,
    MAX_CONSECUTIVE_ERRORS, PROTOCOL_WRITE_RETRIES, READ_TIMEOUT_MS, READY_WAIT_TIMEOUT_MS,
    NETWORK_POLL_MS, RECONNECT_ATTEMPTS, RECONNECT_INTERVAL_MS, WRITE_TIMEOUT_MS,
};

/// An accessory reachable over a stream session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessoryEntry {
    pub manufacturer: String,
    pub model: String,
    pub serial: String,
    /// `host:port` of the session endpoint.
    pub address: String,
    /// Protocol strings the accessory advertises. Empty means the configured
    /// `accessory_protocol`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub protocols: Vec<String>,
}

/// Restrict USB enumeration to one vendor/product pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceFilter {
    pub vendor_id: u16,
    pub product_id: u16,
}

/// Configuration for a link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Interface claimed on connect.
    pub interface_number: u8,
    /// Background read timeout.
    pub read_timeout_ms: u64,
    /// Outbound bulk write timeout.
    pub write_timeout_ms: u64,
    /// Default interrupt transfer timeout.
    pub interrupt_timeout_ms: u64,
    /// Bound on waiting for the peripheral's init sequence.
    pub handshake_timeout_ms: u64,
    /// Sleep after a failed background read.
    pub error_backoff_ms: u64,
    /// Consecutive read failures before the link is dropped.
    pub max_consecutive_errors: u32,
    /// Whether the peripheral must announce itself before the link is usable.
    pub requires_handshake: bool,
    /// Extra attempts for a failed protocol frame write.
    pub protocol_write_retries: u32,
    pub reconnect_attempts: u32,
    pub reconnect_interval_ms: u64,
    /// Safety-net bound for callers waiting on consumer readiness.
    pub ready_wait_timeout_ms: u64,
    /// Protocol string a compatible accessory advertises.
    pub accessory_protocol: String,
    /// Network interface polling interval; 0 turns the watcher off.
    pub network_poll_ms: u64,
    pub accessories: Vec<AccessoryEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_filter: Option<DeviceFilter>,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            interface_number: 0,
            read_timeout_ms: READ_TIMEOUT_MS,
            write_timeout_ms: WRITE_TIMEOUT_MS,
            interrupt_timeout_ms: INTERRUPT_TIMEOUT_MS,
            handshake_timeout_ms: HANDSHAKE_TIMEOUT_MS,
            error_backoff_ms: ERROR_BACKOFF_MS,
            max_consecutive_errors: MAX_CONSECUTIVE_ERRORS,
            requires_handshake: false,
            protocol_write_retries: PROTOCOL_WRITE_RETRIES,
            reconnect_attempts: RECONNECT_ATTEMPTS,
            reconnect_interval_ms: RECONNECT_INTERVAL_MS,
            ready_wait_timeout_ms: READY_WAIT_TIMEOUT_MS,
            accessory_protocol: DEFAULT_ACCESSORY_PROTOCOL.to_string(),
            network_poll_ms: NETWORK_POLL_MS,
            accessories: Vec::new(),
            device_filter: None,
        }
    }
}

impl LinkConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: LinkConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn interrupt_timeout(&self) -> Duration {
        Duration::from_millis(self.interrupt_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    pub fn ready_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_wait_timeout_ms)
    }

    /// `None` when the network interface watcher is off.
    pub fn network_poll_interval(&self) -> Option<Duration> {
        (self.network_poll_ms > 0).then(|| Duration::from_millis(self.network_poll_ms))
    }
}
