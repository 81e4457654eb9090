//! Transport layer abstraction.
//!
//! Defines the `DeviceBackend` trait (enumeration, permission, open) and the
//! `UsbTransport` trait for an opened handle, allowing different
//! implementations (nusb, accessory stream, mock).

use std::time::Duration;

use thiserror::Error;

use crate::device::{DeviceDescriptor, EndpointDescriptor, InterfaceDescriptor, TransportKind};

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Failed to enumerate devices: {0}")]
    EnumerationFailed(String),

    #[error("Failed to open device: {0}")]
    OpenFailed(String),

    #[error("Failed to claim interface {interface}: {message}")]
    ClaimInterfaceFailed { interface: u8, message: String },

    #[error("Endpoint 0x{address:02X} not found on claimed interface")]
    EndpointNotFound { address: u8 },

    #[error("Permission request failed: {0}")]
    PermissionFailed(String),

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Read failed: {0}")]
    ReadFailed(String),

    #[error("Endpoint stalled")]
    Stall,

    #[error("Device disconnected")]
    Disconnected,

    #[error("Timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Everything a backend could learn about one device during enumeration.
#[derive(Debug, Clone, Default)]
pub struct ProbeDetails {
    pub device_name: String,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial: Option<String>,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    pub interfaces: Vec<InterfaceDescriptor>,
    pub protocols: Vec<String>,
}

/// Raw enumeration result for one device.
///
/// Identity is always known; `details` carries the per-device probe outcome so
/// one faulty device cannot abort the whole scan.
#[derive(Debug)]
pub struct DeviceProbe {
    pub device_id: u32,
    pub transport: TransportKind,
    pub vendor_id: u16,
    pub product_id: u16,
    pub details: Result<ProbeDetails, TransportError>,
}

/// Platform access to peripherals.
pub trait DeviceBackend: Send + Sync + 'static {
    type Transport: UsbTransport + 'static;

    /// Enumerate currently visible devices.
    fn probe_devices(&self) -> Result<Vec<DeviceProbe>, TransportError>;

    /// Does the OS already allow us to open this device?
    fn has_permission(&self, device: &DeviceDescriptor) -> bool;

    /// Issue the OS permission prompt.
    ///
    /// Returns once the prompt is issued. The outcome arrives later as a
    /// `PlatformEvent::PermissionResult` keyed by the device key.
    fn request_permission(&self, device: &DeviceDescriptor) -> Result<(), TransportError>;

    /// Open a handle to the device.
    fn open(&self, device: &DeviceDescriptor) -> Result<Self::Transport, TransportError>;
}

/// An opened device handle.
///
/// All methods take `&self`: the read loop and command handlers share one
/// handle, implementations serialize access internally where they must.
pub trait UsbTransport: Send + Sync {
    /// Claim an interface and return its endpoint table.
    fn claim_interface(&self, number: u8) -> Result<InterfaceDescriptor, TransportError>;

    /// Timed read from an IN endpoint. An empty vector means the timeout
    /// elapsed without data.
    fn read(
        &self,
        endpoint: &EndpointDescriptor,
        max_len: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError>;

    /// Timed write to an OUT endpoint; returns bytes written.
    fn write(
        &self,
        endpoint: &EndpointDescriptor,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, TransportError>;

    /// Release the claimed interface.
    fn release_interface(&self) -> Result<(), TransportError>;

    /// Close the handle. Further I/O fails with `Disconnected`.
    fn close(&self) -> Result<(), TransportError>;
}
