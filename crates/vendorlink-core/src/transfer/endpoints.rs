//! Endpoint selection on the claimed interface.

use crate::device::{Direction, EndpointDescriptor, InterfaceDescriptor, TransferKind};
use crate::error::LinkError;

/// Bulk and interrupt endpoints of the claimed interface.
///
/// When an interface exposes several endpoints of the same kind and
/// direction, the last one listed is kept.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EndpointSet {
    pub bulk_in: Option<EndpointDescriptor>,
    pub bulk_out: Option<EndpointDescriptor>,
    pub interrupt_in: Option<EndpointDescriptor>,
    pub interrupt_out: Option<EndpointDescriptor>,
}

impl EndpointSet {
    pub fn from_interface(interface: &InterfaceDescriptor) -> Self {
        let mut set = Self::default();
        for ep in &interface.endpoints {
            let slot = match (ep.kind, ep.direction) {
                (TransferKind::Bulk, Direction::In) => &mut set.bulk_in,
                (TransferKind::Bulk, Direction::Out) => &mut set.bulk_out,
                (TransferKind::Interrupt, Direction::In) => &mut set.interrupt_in,
                (TransferKind::Interrupt, Direction::Out) => &mut set.interrupt_out,
                _ => continue,
            };
            *slot = Some(*ep);
        }
        set
    }

    pub fn is_empty(&self) -> bool {
        self.bulk_in.is_none()
            && self.bulk_out.is_none()
            && self.interrupt_in.is_none()
            && self.interrupt_out.is_none()
    }

    /// Bulk IN, else interrupt IN.
    pub fn read_endpoint(&self) -> Result<EndpointDescriptor, LinkError> {
        self.bulk_in
            .or(self.interrupt_in)
            .ok_or_else(|| LinkError::NoEndpointAvailable("input".into()))
    }

    /// Bulk OUT, else interrupt OUT.
    pub fn write_endpoint(&self) -> Result<EndpointDescriptor, LinkError> {
        self.bulk_out
            .or(self.interrupt_out)
            .ok_or_else(|| LinkError::NoEndpointAvailable("output".into()))
    }

    /// Endpoint of `kind` whose direction matches bit 7 of `address`.
    pub fn for_transfer(
        &self,
        kind: TransferKind,
        address: u8,
    ) -> Result<EndpointDescriptor, LinkError> {
        let direction = Direction::from_address(address);
        let found = match (kind, direction) {
            (TransferKind::Bulk, Direction::In) => self.bulk_in,
            (TransferKind::Bulk, Direction::Out) => self.bulk_out,
            (TransferKind::Interrupt, Direction::In) => self.interrupt_in,
            (TransferKind::Interrupt, Direction::Out) => self.interrupt_out,
            _ => None,
        };
        found.ok_or_else(|| {
            LinkError::NoEndpointAvailable(format!("{} {}", kind, direction).to_lowercase())
        })
    }
}
