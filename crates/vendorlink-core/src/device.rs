//! Device, interface and endpoint descriptors.
//!
//! Descriptors are immutable snapshots taken at enumeration time. They go
//! stale as soon as the underlying device detaches; the supervisor re-resolves
//! a [`DeviceRef`] against a fresh scan before every connect.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::protocol::constants::{UNKNOWN, USB_DIR_IN};

/// Endpoint direction, seen from the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    In,
    Out,
}

impl Direction {
    /// Direction encoded in bit 7 of an endpoint address.
    pub fn from_address(address: u8) -> Self {
        if address & USB_DIR_IN != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::In => write!(f, "IN"),
            Direction::Out => write!(f, "OUT"),
        }
    }
}

/// USB transfer type of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TransferKind {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

impl fmt::Display for TransferKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferKind::Control => write!(f, "CONTROL"),
            TransferKind::Isochronous => write!(f, "ISOCHRONOUS"),
            TransferKind::Bulk => write!(f, "BULK"),
            TransferKind::Interrupt => write!(f, "INTERRUPT"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndpointDescriptor {
    pub address: u8,
    pub direction: Direction,
    pub kind: TransferKind,
    pub max_packet_size: u16,
}

impl EndpointDescriptor {
    pub fn new(address: u8, kind: TransferKind, max_packet_size: u16) -> Self {
        Self {
            address,
            direction: Direction::from_address(address),
            kind,
            max_packet_size,
        }
    }

    /// Short label such as `BULK_IN(0x81)`.
    pub fn label(&self) -> String {
        format!("{}_{}(0x{:02x})", self.kind, self.direction, self.address)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceDescriptor {
    pub number: u8,
    pub class: u8,
    pub endpoints: Vec<EndpointDescriptor>,
}

/// How the peripheral is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Host-mode USB with bulk/interrupt endpoints.
    Usb,
    /// Stream session negotiated with an external accessory.
    Accessory,
}

/// Stable identity used for permission records and detach correlation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceKey(String);

impl DeviceKey {
    /// `vendor:product:name` for USB devices.
    pub fn usb(vendor_id: u16, product_id: u16, name: &str) -> Self {
        Self(format!("{}:{}:{}", vendor_id, product_id, name))
    }

    /// `manufacturer:model:serial` for accessories.
    pub fn accessory(manufacturer: &str, model: &str, serial: &str) -> Self {
        Self(format!("{}:{}:{}", manufacturer, model, serial))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Snapshot of a visible peripheral.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceDescriptor {
    pub device_id: u32,
    pub transport: TransportKind,
    /// Bus path (USB) or session address (accessory).
    pub device_name: String,
    pub vendor_id: u16,
    pub product_id: u16,
    pub manufacturer_name: String,
    pub product_name: String,
    pub serial_number: String,
    pub interface_count: u8,
    pub device_class: u8,
    pub device_subclass: u8,
    pub device_protocol: u8,
    pub has_endpoints: bool,
    pub total_endpoints: usize,
    pub endpoint_details: String,
    /// Accessory protocol strings; empty for USB devices.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub protocols: Vec<String>,
}

impl DeviceDescriptor {
    /// Descriptor built when probing a device failed: ids only.
    pub fn minimal(device_id: u32, transport: TransportKind, vendor_id: u16, product_id: u16) -> Self {
        Self {
            device_id,
            transport,
            device_name: UNKNOWN.into(),
            vendor_id,
            product_id,
            manufacturer_name: UNKNOWN.into(),
            product_name: UNKNOWN.into(),
            serial_number: UNKNOWN.into(),
            interface_count: 0,
            device_class: 0,
            device_subclass: 0,
            device_protocol: 0,
            has_endpoints: false,
            total_endpoints: 0,
            endpoint_details: String::new(),
            protocols: Vec::new(),
        }
    }

    pub fn key(&self) -> DeviceKey {
        match self.transport {
            TransportKind::Usb => DeviceKey::usb(self.vendor_id, self.product_id, &self.device_name),
            TransportKind::Accessory => DeviceKey::accessory(
                &self.manufacturer_name,
                &self.product_name,
                &self.serial_number,
            ),
        }
    }

    pub fn display_name(&self) -> &str {
        if self.product_name == UNKNOWN {
            &self.device_name
        } else {
            &self.product_name
        }
    }
}

/// How a command refers to a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged, rename_all_fields = "camelCase")]
pub enum DeviceRef {
    Id { device_id: u32 },
    Key { key: DeviceKey },
    Ids { vendor_id: u16, product_id: u16 },
}

impl DeviceRef {
    pub fn matches(&self, device: &DeviceDescriptor) -> bool {
        match self {
            DeviceRef::Id { device_id } => device.device_id == *device_id,
            DeviceRef::Key { key } => device.key() == *key,
            DeviceRef::Ids {
                vendor_id,
                product_id,
            } => device.vendor_id == *vendor_id && device.product_id == *product_id,
        }
    }
}

impl fmt::Display for DeviceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceRef::Id { device_id } => write!(f, "id {}", device_id),
            DeviceRef::Key { key } => write!(f, "key {}", key),
            DeviceRef::Ids {
                vendor_id,
                product_id,
            } => write!(f, "{:04x}:{:04x}", vendor_id, product_id),
        }
    }
}

impl std::str::FromStr for DeviceRef {
    type Err = String;

    /// Accepts `vvvv:pppp` (hex ids), a decimal device id, or a device key.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err("empty device reference".into());
        }
        if let Ok(device_id) = s.parse::<u32>() {
            return Ok(DeviceRef::Id { device_id });
        }
        if let Some((vid, pid)) = s.split_once(':')
            && !pid.contains(':')
            && let (Ok(vendor_id), Ok(product_id)) =
                (u16::from_str_radix(vid, 16), u16::from_str_radix(pid, 16))
        {
            return Ok(DeviceRef::Ids {
                vendor_id,
                product_id,
            });
        }
        Ok(DeviceRef::Key {
            key: DeviceKey(s.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_from_address() {
        assert_eq!(Direction::from_address(0x81), Direction::In);
        assert_eq!(Direction::from_address(0x02), Direction::Out);
    }

    #[test]
    fn test_endpoint_label() {
        let ep = EndpointDescriptor::new(0x81, TransferKind::Bulk, 64);
        assert_eq!(ep.label(), "BULK_IN(0x81)");
    }

    #[test]
    fn test_keys() {
        let mut dev = DeviceDescriptor::minimal(1, TransportKind::Usb, 0x1234, 0x5678);
        dev.device_name = "/dev/bus/usb/001/004".into();
        assert_eq!(dev.key().as_str(), "4660:22136:/dev/bus/usb/001/004");

        let mut acc = DeviceDescriptor::minimal(2, TransportKind::Accessory, 0, 0);
        acc.manufacturer_name = "Zanis".into();
        acc.product_name = "Probe".into();
        acc.serial_number = "SN1".into();
        assert_eq!(acc.key().as_str(), "Zanis:Probe:SN1");
    }

    #[test]
    fn test_device_ref_parsing() {
        assert_eq!("7".parse::<DeviceRef>(), Ok(DeviceRef::Id { device_id: 7 }));
        assert_eq!(
            "1a86:7523".parse::<DeviceRef>(),
            Ok(DeviceRef::Ids {
                vendor_id: 0x1a86,
                product_id: 0x7523
            })
        );
        assert!(matches!(
            "Zanis:Probe:SN1".parse::<DeviceRef>(),
            Ok(DeviceRef::Key { .. })
        ));
    }
}
