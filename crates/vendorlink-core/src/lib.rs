//! VendorLink-Core: host-side link to a vendor USB peripheral or accessory.
//!
//! The crate discovers peripherals, gates access behind the platform
//! permission flow, keeps at most one connection open, runs a background read
//! loop, frames messages with a checksummed packet format and hands every
//! asynchronous happening to a consumer that may not be listening yet.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Protocol**: Wire constants, packet codec, init handshake
//! - **Transport**: Device backends (nusb, accessory stream, mock)
//! - **Catalog / Permission**: Enumeration and the permission gate
//! - **Transfer**: Endpoint selection and the read loop
//! - **State / Session**: Connection state machine and its supervisor
//! - **Events / Buffer**: Event stream and readiness buffering
//! - **Netif**: Network interfaces a peripheral brings up
//! - **Host**: Command surface for the embedding application
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use vendorlink_core::{DeviceRef, LinkConfig, NusbBackend, TracingSink, VendorLink};
//!
//! let (platform_tx, _platform_rx) = async_channel::unbounded();
//! let backend = Arc::new(NusbBackend::new(platform_tx));
//! let link = VendorLink::new(backend, LinkConfig::default(), Arc::new(TracingSink));
//!
//! link.initialize()?;
//! link.mark_ready();
//! let device = link
//!     .connect_to_device(&"1234:0001".parse::<DeviceRef>()?)?
//!     .blocking_wait()?;
//! println!("connected to {}", device.display_name());
//! link.send_protocol_data(0x01, b"hello")?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod buffer;
pub mod catalog;
pub mod config;
pub mod device;
pub mod error;
pub mod events;
pub mod host;
pub mod netif;
pub mod permission;
pub mod protocol;
pub mod session;
pub mod state;
pub mod transfer;
pub mod transport;

// Re-exports for convenience
pub use buffer::ReadinessBuffer;
pub use catalog::DeviceCatalog;
pub use config::{AccessoryEntry, DeviceFilter, LinkConfig};
pub use device::{DeviceDescriptor, DeviceKey, DeviceRef, EndpointDescriptor, TransportKind};
pub use error::LinkError;
pub use events::{ChannelSink, EventRecord, EventSink, LinkEvent, LogLevel, PlatformEvent, TracingSink};
pub use host::VendorLink;
pub use netif::{InterfaceWatcher, watch_network_interfaces};
pub use permission::{PermissionGate, PermissionOutcome};
pub use protocol::{Packet, PacketError};
pub use session::{ConnectTicket, ConnectionSnapshot, ConnectionSupervisor};
pub use state::ConnectionState;
pub use transfer::TransferRequest;
pub use transport::{
    AccessoryBackend, DeviceBackend, MockBackend, NusbBackend, TransportError, UsbTransport,
};
