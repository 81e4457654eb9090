//! Event system for consumer decoupling.
//!
//! The link pushes [`LinkEvent`]s into the readiness buffer, which hands
//! [`EventRecord`]s to an [`EventSink`] once the consumer is ready. Platform
//! notifications travel the other way as [`PlatformEvent`]s.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::device::{DeviceDescriptor, DeviceKey};
use crate::protocol::packet::Packet;

/// Log level for events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// How inbound bytes were rendered for the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DataEncoding {
    Utf8,
    Hex,
}

impl fmt::Display for DataEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataEncoding::Utf8 => write!(f, "utf8"),
            DataEncoding::Hex => write!(f, "hex"),
        }
    }
}

/// One chunk read from the peripheral.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InboundData {
    pub text: String,
    pub encoding: DataEncoding,
    pub bytes: Vec<u8>,
    /// Set when the chunk is exactly one well-formed frame.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub packet: Option<Packet>,
}

/// Result of a caller-driven bulk or interrupt transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferOutcome {
    pub endpoint: u8,
    pub bytes_transferred: usize,
    pub success: bool,
    /// Bytes read by an IN transfer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolSend {
    pub message_id: u8,
    pub frame_len: usize,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Events delivered to the consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum LinkEvent {
    DeviceAttached(DeviceDescriptor),
    DeviceDetached(DeviceKey),
    ConnectionStatus(bool),
    DataReceived(InboundData),
    Log { level: LogLevel, message: String },
    WaitingForInit,
    BulkTransferResult(TransferOutcome),
    InterruptTransferResult(TransferOutcome),
    ProtocolDataSent(ProtocolSend),
    ProtocolDataFailed(ProtocolSend),
    ProtocolDataError(ProtocolSend),
    NetworkInterface(String),
}

impl LinkEvent {
    pub fn log(level: LogLevel, message: impl Into<String>) -> Self {
        LinkEvent::Log {
            level,
            message: message.into(),
        }
    }

    /// Wire name of the event type.
    pub fn kind(&self) -> &'static str {
        match self {
            LinkEvent::DeviceAttached(_) => "device_attached",
            LinkEvent::DeviceDetached(_) => "device_detached",
            LinkEvent::ConnectionStatus(_) => "connection_status",
            LinkEvent::DataReceived(_) => "data_received",
            LinkEvent::Log { .. } => "log",
            LinkEvent::WaitingForInit => "waiting_for_init",
            LinkEvent::BulkTransferResult(_) => "bulk_transfer_result",
            LinkEvent::InterruptTransferResult(_) => "interrupt_transfer_result",
            LinkEvent::ProtocolDataSent(_) => "protocol_data_sent",
            LinkEvent::ProtocolDataFailed(_) => "protocol_data_failed",
            LinkEvent::ProtocolDataError(_) => "protocol_data_error",
            LinkEvent::NetworkInterface(_) => "network_interface",
        }
    }
}

/// A timestamped event as the consumer sees it:
/// `{"type": ..., "payload": ..., "timestamp": 1700000000.123}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventRecord {
    #[serde(flatten)]
    pub event: LinkEvent,
    /// Seconds since the epoch.
    pub timestamp: f64,
}

impl EventRecord {
    pub fn at(event: LinkEvent, at: DateTime<Utc>) -> Self {
        Self {
            event,
            timestamp: at.timestamp_millis() as f64 / 1000.0,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SinkError {
    #[error("Event consumer unavailable")]
    Unavailable,
}

/// Consumer boundary for events.
///
/// Implementations dispatch onto the consumer's own execution context; they
/// must not block the caller.
pub trait EventSink: Send + Sync {
    /// Whether the consumer can currently accept deliveries.
    fn is_available(&self) -> bool {
        true
    }

    fn deliver(&self, record: &EventRecord) -> Result<(), SinkError>;
}

/// Forwards records onto an async channel drained by the host task.
pub struct ChannelSink {
    tx: async_channel::Sender<EventRecord>,
}

impl ChannelSink {
    pub fn new(tx: async_channel::Sender<EventRecord>) -> Self {
        Self { tx }
    }

    /// Sink plus the receiving half, unbounded.
    pub fn unbounded() -> (Self, async_channel::Receiver<EventRecord>) {
        let (tx, rx) = async_channel::unbounded();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn is_available(&self) -> bool {
        !self.tx.is_closed()
    }

    fn deliver(&self, record: &EventRecord) -> Result<(), SinkError> {
        self.tx
            .try_send(record.clone())
            .map_err(|_| SinkError::Unavailable)
    }
}

/// Sink that logs events using tracing.
pub struct TracingSink;

impl EventSink for TracingSink {
    fn deliver(&self, record: &EventRecord) -> Result<(), SinkError> {
        trace_event(&record.event);
        Ok(())
    }
}

/// Mirror an event into the tracing log.
pub fn trace_event(event: &LinkEvent) {
    match event {
        LinkEvent::DeviceAttached(dev) => {
            tracing::info!(
                vendor_id = %format!("{:04X}", dev.vendor_id),
                product_id = %format!("{:04X}", dev.product_id),
                name = %dev.display_name(),
                "Device attached"
            );
        }
        LinkEvent::DeviceDetached(key) => {
            tracing::warn!(key = %key, "Device detached");
        }
        LinkEvent::ConnectionStatus(connected) => {
            tracing::info!(connected = connected, "Connection status");
        }
        LinkEvent::DataReceived(data) => {
            tracing::debug!(
                len = data.bytes.len(),
                encoding = %data.encoding,
                message_id = ?data.packet.as_ref().map(|p| p.message_id),
                "Data received"
            );
        }
        LinkEvent::Log { level, message } => match level {
            LogLevel::Debug => tracing::debug!("{}", message),
            LogLevel::Info => tracing::info!("{}", message),
            LogLevel::Warn => tracing::warn!("{}", message),
            LogLevel::Error => tracing::error!("{}", message),
        },
        LinkEvent::WaitingForInit => {
            tracing::info!("Waiting for peripheral init sequence");
        }
        LinkEvent::BulkTransferResult(t) | LinkEvent::InterruptTransferResult(t) => {
            tracing::debug!(
                kind = event.kind(),
                endpoint = %format!("0x{:02X}", t.endpoint),
                bytes = t.bytes_transferred,
                "Transfer complete"
            );
        }
        LinkEvent::ProtocolDataSent(s) => {
            tracing::debug!(message_id = s.message_id, len = s.frame_len, "Protocol frame sent");
        }
        LinkEvent::ProtocolDataFailed(s) | LinkEvent::ProtocolDataError(s) => {
            tracing::warn!(
                kind = event.kind(),
                message_id = s.message_id,
                attempts = s.attempts,
                error = ?s.error,
                "Protocol frame not sent"
            );
        }
        LinkEvent::NetworkInterface(name) => {
            tracing::info!(interface = %name, "Network interface changed");
        }
    }
}

/// Notifications raised by the platform, outside any command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlatformEvent {
    Attached(DeviceDescriptor),
    Detached(DeviceKey),
    PermissionResult { key: DeviceKey, granted: bool },
    NetworkInterface(String),
}
