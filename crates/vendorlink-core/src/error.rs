//! Error taxonomy reported across the command surface.
//!
//! Every variant carries a stable string code so the messaging bridge can
//! forward it unchanged (`PERMISSION_DENIED`, `TRANSFER_FAILED`, ...).

use thiserror::Error;

use crate::protocol::packet::PacketError;
use crate::transport::TransportError;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    #[error("USB manager not initialized")]
    NotInitialized,

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("USB permission denied for {0}")]
    PermissionDenied(String),

    #[error("Failed to request permission: {0}")]
    PermissionError(String),

    #[error("Connection already in progress")]
    ConnectionInProgress,

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Peripheral did not send its init sequence within {timeout_ms}ms")]
    InitHandshakeTimeout { timeout_ms: u64 },

    #[error("Device not connected")]
    NotConnected,

    #[error("No {0} endpoint available")]
    NoEndpointAvailable(String),

    #[error("Transfer failed: {0}")]
    TransferFailed(String),

    #[error("Transfer error: {0}")]
    TransferError(String),

    #[error("Payload of {len} bytes exceeds the {max} byte limit")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),
}

impl LinkError {
    /// Stable code forwarded to the host application.
    pub fn code(&self) -> &'static str {
        match self {
            LinkError::NotInitialized => "NOT_INITIALIZED",
            LinkError::DeviceNotFound(_) => "DEVICE_NOT_FOUND",
            LinkError::PermissionDenied(_) => "PERMISSION_DENIED",
            LinkError::PermissionError(_) => "PERMISSION_ERROR",
            LinkError::ConnectionInProgress => "CONNECTION_IN_PROGRESS",
            LinkError::ConnectionFailed(_) => "CONNECTION_FAILED",
            LinkError::ConnectionError(_) => "CONNECTION_ERROR",
            LinkError::InitHandshakeTimeout { .. } => "INIT_HANDSHAKE_TIMEOUT",
            LinkError::NotConnected => "NOT_CONNECTED",
            LinkError::NoEndpointAvailable(_) => "NO_ENDPOINT",
            LinkError::TransferFailed(_) => "TRANSFER_FAILED",
            LinkError::TransferError(_) => "TRANSFER_ERROR",
            LinkError::PayloadTooLarge { .. } => "PAYLOAD_TOO_LARGE",
            LinkError::InvalidArguments(_) => "INVALID_ARGUMENTS",
        }
    }

    /// Map a transport failure raised by an outbound transfer.
    ///
    /// A transfer the device rejected or timed out is `TransferFailed`; anything
    /// else (handle gone, IO fault) is reported as `TransferError`.
    pub fn from_transfer(err: TransportError) -> Self {
        match err {
            TransportError::Timeout { .. }
            | TransportError::WriteFailed(_)
            | TransportError::ReadFailed(_)
            | TransportError::Stall => LinkError::TransferFailed(err.to_string()),
            other => LinkError::TransferError(other.to_string()),
        }
    }
}

impl From<PacketError> for LinkError {
    fn from(err: PacketError) -> Self {
        match err {
            PacketError::PayloadTooLarge { len, max } => LinkError::PayloadTooLarge { len, max },
            other => LinkError::InvalidArguments(other.to_string()),
        }
    }
}
