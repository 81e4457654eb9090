//! Device discovery.

use std::sync::Arc;

use tracing::{debug, instrument, warn};

use crate::device::{DeviceDescriptor, DeviceRef, Direction, TransferKind, TransportKind};
use crate::protocol::constants::UNKNOWN;
use crate::transport::{DeviceBackend, DeviceProbe, ProbeDetails};

/// Endpoint census of one device, split by transfer kind and direction.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EndpointCensus {
    pub bulk_in: usize,
    pub bulk_out: usize,
    pub interrupt_in: usize,
    pub interrupt_out: usize,
    pub control: usize,
    pub isochronous: usize,
}

impl EndpointCensus {
    pub fn of(details: &ProbeDetails) -> Self {
        let mut census = Self::default();
        for ep in details.interfaces.iter().flat_map(|i| i.endpoints.iter()) {
            match (ep.kind, ep.direction) {
                (TransferKind::Bulk, Direction::In) => census.bulk_in += 1,
                (TransferKind::Bulk, Direction::Out) => census.bulk_out += 1,
                (TransferKind::Interrupt, Direction::In) => census.interrupt_in += 1,
                (TransferKind::Interrupt, Direction::Out) => census.interrupt_out += 1,
                (TransferKind::Control, _) => census.control += 1,
                (TransferKind::Isochronous, _) => census.isochronous += 1,
            }
        }
        census
    }

    /// Bulk and interrupt endpoints, the ones the link can use.
    pub fn usable(&self) -> usize {
        self.bulk_in + self.bulk_out + self.interrupt_in + self.interrupt_out
    }

    pub fn total(&self) -> usize {
        self.usable() + self.control + self.isochronous
    }
}

/// Build the descriptor for one probe, falling back to ids only when the
/// per-device probe failed.
pub fn describe(probe: DeviceProbe) -> DeviceDescriptor {
    let mut desc = DeviceDescriptor::minimal(
        probe.device_id,
        probe.transport,
        probe.vendor_id,
        probe.product_id,
    );
    let details = match probe.details {
        Ok(details) => details,
        Err(e) => {
            warn!(
                device_id = probe.device_id,
                vendor_id = %format!("{:04X}", probe.vendor_id),
                product_id = %format!("{:04X}", probe.product_id),
                error = %e,
                "Probe failed, reporting minimal descriptor"
            );
            return desc;
        }
    };

    let census = EndpointCensus::of(&details);
    desc.device_name = details.device_name.clone();
    desc.manufacturer_name = details.manufacturer.clone().unwrap_or_else(|| UNKNOWN.into());
    desc.product_name = details.product.clone().unwrap_or_else(|| UNKNOWN.into());
    desc.serial_number = details.serial.clone().unwrap_or_else(|| UNKNOWN.into());
    desc.interface_count = details.interfaces.len().min(u8::MAX as usize) as u8;
    desc.device_class = details.class;
    desc.device_subclass = details.subclass;
    desc.device_protocol = details.protocol;
    desc.has_endpoints = census.total() > 0;
    desc.total_endpoints = census.total();
    desc.endpoint_details = details
        .interfaces
        .iter()
        .flat_map(|i| i.endpoints.iter())
        .map(|ep| ep.label())
        .collect::<Vec<_>>()
        .join(", ");
    desc.protocols = details.protocols;
    desc
}

/// Enumerates visible peripherals through a backend.
pub struct DeviceCatalog<B: DeviceBackend> {
    backend: Arc<B>,
    accessory_protocol: String,
}

impl<B: DeviceBackend> DeviceCatalog<B> {
    pub fn new(backend: Arc<B>, accessory_protocol: impl Into<String>) -> Self {
        Self {
            backend,
            accessory_protocol: accessory_protocol.into(),
        }
    }

    /// Enumerate every visible device. A bus-level failure yields an empty
    /// list.
    #[instrument(level = "debug", skip(self))]
    pub fn scan(&self) -> Vec<DeviceDescriptor> {
        match self.backend.probe_devices() {
            Ok(probes) => {
                let devices: Vec<_> = probes.into_iter().map(describe).collect();
                debug!(count = devices.len(), "Scan complete");
                devices
            }
            Err(e) => {
                warn!(error = %e, "Device enumeration failed");
                Vec::new()
            }
        }
    }

    /// Resolve `device` against a fresh scan.
    pub fn find(&self, device: &DeviceRef) -> Option<DeviceDescriptor> {
        self.scan().into_iter().find(|d| device.matches(d))
    }

    /// First visible accessory advertising the configured protocol string.
    pub fn find_compatible_accessory(&self) -> Option<DeviceDescriptor> {
        self.scan().into_iter().find(|d| {
            d.transport == TransportKind::Accessory
                && d.protocols.iter().any(|p| *p == self.accessory_protocol)
        })
    }
}
