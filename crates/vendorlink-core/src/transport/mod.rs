//! Transport layer module.

pub mod accessory;
pub mod mock;
pub mod nusb;
pub mod traits;

pub use accessory::{AccessoryBackend, AccessoryTransport};
pub use mock::{MockBackend, MockLink, MockTransport};
pub use nusb::{NusbBackend, NusbTransport};
pub use traits::{DeviceBackend, DeviceProbe, ProbeDetails, TransportError, UsbTransport};
