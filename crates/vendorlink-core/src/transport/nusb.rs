//! nusb-based USB backend implementation.
//!
//! Key nusb 0.2 API patterns:
//! - `list_devices().wait()` for enumeration, `device_info.open().wait()` to open
//! - `device.claim_interface(n).wait()` to claim an interface
//! - `interface.endpoint::<Bulk, In>(addr)` to claim an endpoint
//! - `endpoint.submit(buf)` + `endpoint.wait_next_complete(timeout)` for timed I/O

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_channel::Sender;
use futures::StreamExt;
use nusb::descriptors::TransferType;
use nusb::transfer::{Buffer, Bulk, BulkOrInterrupt, Completion, In, Interrupt, Out, TransferError};
use nusb::{Device, DeviceId, DeviceInfo, Endpoint, Interface, MaybeFuture, list_devices};
use parking_lot::Mutex;
use tracing::{debug, info, instrument, warn};

use super::traits::{DeviceBackend, DeviceProbe, ProbeDetails, TransportError, UsbTransport};
use crate::device::{
    DeviceDescriptor, DeviceKey, EndpointDescriptor, InterfaceDescriptor, TransferKind,
    TransportKind,
};
use crate::events::PlatformEvent;

/// Grace period for a cancelled transfer to come back.
const CANCEL_GRACE: Duration = Duration::from_millis(50);

#[derive(Default)]
struct IdTable {
    next: u32,
    by_nusb: HashMap<DeviceId, u32>,
    by_ours: HashMap<u32, DeviceId>,
    keys: HashMap<DeviceId, DeviceKey>,
}

impl IdTable {
    fn id_for(&mut self, id: DeviceId) -> u32 {
        if let Some(ours) = self.by_nusb.get(&id) {
            return *ours;
        }
        self.next += 1;
        self.by_nusb.insert(id, self.next);
        self.by_ours.insert(self.next, id);
        self.next
    }
}

/// Host-mode USB through nusb.
///
/// Desktop platforms have no interactive permission dialog: "permission" means
/// the device node can be opened. A permission request re-checks that and
/// reports the outcome through the platform event channel, like an OS
/// broadcast would.
pub struct NusbBackend {
    ids: Mutex<IdTable>,
    events: Sender<PlatformEvent>,
    filter: Option<(u16, u16)>,
}

impl NusbBackend {
    pub fn new(events: Sender<PlatformEvent>) -> Self {
        Self {
            ids: Mutex::new(IdTable::default()),
            events,
            filter: None,
        }
    }

    /// Only report devices with these ids.
    pub fn with_filter(mut self, vendor_id: u16, product_id: u16) -> Self {
        self.filter = Some((vendor_id, product_id));
        self
    }

    fn wanted(&self, info: &DeviceInfo) -> bool {
        self.filter
            .is_none_or(|(vid, pid)| info.vendor_id() == vid && info.product_id() == pid)
    }

    fn find_info(&self, device_id: u32) -> Result<DeviceInfo, TransportError> {
        let target = self
            .ids
            .lock()
            .by_ours
            .get(&device_id)
            .copied()
            .ok_or_else(|| TransportError::DeviceNotFound(format!("id {}", device_id)))?;

        list_devices()
            .wait()
            .map_err(|e| TransportError::EnumerationFailed(e.to_string()))?
            .find(|d| d.id() == target)
            .ok_or_else(|| TransportError::DeviceNotFound(format!("id {}", device_id)))
    }

    fn descriptor_of(&self, info: &DeviceInfo) -> DeviceDescriptor {
        let device_id = self.ids.lock().id_for(info.id());
        let mut desc =
            DeviceDescriptor::minimal(device_id, TransportKind::Usb, info.vendor_id(), info.product_id());
        desc.device_name = device_name(info);
        if let Some(s) = info.manufacturer_string() {
            desc.manufacturer_name = s.to_string();
        }
        if let Some(s) = info.product_string() {
            desc.product_name = s.to_string();
        }
        if let Some(s) = info.serial_number() {
            desc.serial_number = s.to_string();
        }
        desc
    }

    /// Forward hotplug notifications as platform events until the receiver
    /// goes away.
    pub async fn watch_hotplug(&self) -> Result<(), TransportError> {
        let mut watch =
            nusb::watch_devices().map_err(|e| TransportError::EnumerationFailed(e.to_string()))?;

        while let Some(event) = watch.next().await {
            let platform = match event {
                nusb::hotplug::HotplugEvent::Connected(info) => {
                    if !self.wanted(&info) {
                        continue;
                    }
                    let desc = self.descriptor_of(&info);
                    self.ids.lock().keys.insert(info.id(), desc.key());
                    PlatformEvent::Attached(desc)
                }
                nusb::hotplug::HotplugEvent::Disconnected(id) => {
                    match self.ids.lock().keys.remove(&id) {
                        Some(key) => PlatformEvent::Detached(key),
                        None => continue,
                    }
                }
            };
            if self.events.send(platform).await.is_err() {
                break;
            }
        }
        Ok(())
    }
}

fn device_name(info: &DeviceInfo) -> String {
    format!("usb:{}-{}", info.bus_id(), info.device_address())
}

fn transfer_kind(t: TransferType) -> TransferKind {
    match t {
        TransferType::Control => TransferKind::Control,
        TransferType::Isochronous => TransferKind::Isochronous,
        TransferType::Bulk => TransferKind::Bulk,
        TransferType::Interrupt => TransferKind::Interrupt,
    }
}

/// Walk every interface's first alt setting of the active configuration.
fn read_interfaces(device: &Device) -> Vec<InterfaceDescriptor> {
    let Ok(config) = device.active_configuration() else {
        return Vec::new();
    };
    config
        .interfaces()
        .filter_map(|group| {
            let alt = group.alt_settings().next()?;
            Some(InterfaceDescriptor {
                number: group.interface_number(),
                class: alt.class(),
                endpoints: alt
                    .endpoints()
                    .map(|ep| {
                        EndpointDescriptor::new(
                            ep.address(),
                            transfer_kind(ep.transfer_type()),
                            ep.max_packet_size() as u16,
                        )
                    })
                    .collect(),
            })
        })
        .collect()
}

impl DeviceBackend for NusbBackend {
    type Transport = NusbTransport;

    #[instrument(level = "debug", skip(self))]
    fn probe_devices(&self) -> Result<Vec<DeviceProbe>, TransportError> {
        let devices = list_devices()
            .wait()
            .map_err(|e| TransportError::EnumerationFailed(e.to_string()))?;

        let mut probes = Vec::new();
        for info in devices.filter(|d| self.wanted(d)) {
            let device_id = self.ids.lock().id_for(info.id());
            let desc = self.descriptor_of(&info);
            self.ids.lock().keys.insert(info.id(), desc.key());

            let mut details = ProbeDetails {
                device_name: desc.device_name.clone(),
                manufacturer: info.manufacturer_string().map(str::to_string),
                product: info.product_string().map(str::to_string),
                serial: info.serial_number().map(str::to_string),
                class: info.class(),
                subclass: info.subclass(),
                protocol: info.protocol(),
                interfaces: Vec::new(),
                protocols: Vec::new(),
            };

            // Endpoint tables need an open handle; without access we still
            // report the interface list so the device shows up.
            match info.open().wait() {
                Ok(device) => details.interfaces = read_interfaces(&device),
                Err(e) => {
                    debug!(device = %desc.device_name, error = %e, "Cannot open for descriptor read");
                    details.interfaces = info
                        .interfaces()
                        .map(|i| InterfaceDescriptor {
                            number: i.interface_number(),
                            class: i.class(),
                            endpoints: Vec::new(),
                        })
                        .collect();
                }
            }

            probes.push(DeviceProbe {
                device_id,
                transport: TransportKind::Usb,
                vendor_id: info.vendor_id(),
                product_id: info.product_id(),
                details: Ok(details),
            });
        }
        Ok(probes)
    }

    fn has_permission(&self, device: &DeviceDescriptor) -> bool {
        self.find_info(device.device_id)
            .is_ok_and(|info| info.open().wait().is_ok())
    }

    #[instrument(level = "info", skip(self, device), fields(key = %device.key()))]
    fn request_permission(&self, device: &DeviceDescriptor) -> Result<(), TransportError> {
        let info = self.find_info(device.device_id)?;
        let key = device.key();
        let events = self.events.clone();

        std::thread::Builder::new()
            .name("usb-permission".into())
            .spawn(move || {
                let granted = info.open().wait().is_ok();
                if events
                    .send_blocking(PlatformEvent::PermissionResult { key, granted })
                    .is_err()
                {
                    warn!("Permission result dropped: event channel closed");
                }
            })
            .map_err(|e| TransportError::PermissionFailed(e.to_string()))?;
        Ok(())
    }

    #[instrument(level = "info", skip(self, device), fields(
        vendor_id = %format!("{:04X}", device.vendor_id),
        product_id = %format!("{:04X}", device.product_id),
    ))]
    fn open(&self, device: &DeviceDescriptor) -> Result<NusbTransport, TransportError> {
        let info = self.find_info(device.device_id)?;
        let handle = info
            .open()
            .wait()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?;

        info!(device = %device.device_name, "Device opened");
        Ok(NusbTransport {
            device: Mutex::new(Some(handle)),
            interface: Mutex::new(None),
            endpoints: Mutex::new(HashMap::new()),
        })
    }
}

enum ClaimedEndpoint {
    BulkIn(Endpoint<Bulk, In>),
    BulkOut(Endpoint<Bulk, Out>),
    InterruptIn(Endpoint<Interrupt, In>),
    InterruptOut(Endpoint<Interrupt, Out>),
}

/// An opened nusb device with at most one claimed interface.
///
/// Each endpoint has its own lock so a write is not held up by a read
/// pending on another endpoint.
pub struct NusbTransport {
    device: Mutex<Option<Device>>,
    interface: Mutex<Option<Interface>>,
    endpoints: Mutex<HashMap<u8, Arc<Mutex<ClaimedEndpoint>>>>,
}

impl NusbTransport {
    fn with_endpoint<R>(
        &self,
        endpoint: &EndpointDescriptor,
        f: impl FnOnce(&mut ClaimedEndpoint) -> Result<R, TransportError>,
    ) -> Result<R, TransportError> {
        let claimed = self.claimed(endpoint)?;
        let mut ep = claimed.lock();
        f(&mut ep)
    }

    fn claimed(
        &self,
        endpoint: &EndpointDescriptor,
    ) -> Result<Arc<Mutex<ClaimedEndpoint>>, TransportError> {
        let mut endpoints = self.endpoints.lock();
        if let Some(claimed) = endpoints.get(&endpoint.address) {
            return Ok(claimed.clone());
        }
        let iface = self.interface.lock();
        let iface = iface.as_ref().ok_or(TransportError::Disconnected)?;
        let claim_err = |e: nusb::Error| TransportError::ClaimInterfaceFailed {
            interface: 0,
            message: format!("endpoint 0x{:02X}: {}", endpoint.address, e),
        };
        let claimed = match (endpoint.kind, endpoint.direction) {
            (TransferKind::Bulk, crate::device::Direction::In) => {
                ClaimedEndpoint::BulkIn(iface.endpoint::<Bulk, In>(endpoint.address).map_err(claim_err)?)
            }
            (TransferKind::Bulk, crate::device::Direction::Out) => {
                ClaimedEndpoint::BulkOut(iface.endpoint::<Bulk, Out>(endpoint.address).map_err(claim_err)?)
            }
            (TransferKind::Interrupt, crate::device::Direction::In) => ClaimedEndpoint::InterruptIn(
                iface.endpoint::<Interrupt, In>(endpoint.address).map_err(claim_err)?,
            ),
            (TransferKind::Interrupt, crate::device::Direction::Out) => ClaimedEndpoint::InterruptOut(
                iface.endpoint::<Interrupt, Out>(endpoint.address).map_err(claim_err)?,
            ),
            _ => {
                return Err(TransportError::EndpointNotFound {
                    address: endpoint.address,
                });
            }
        };
        let claimed = Arc::new(Mutex::new(claimed));
        endpoints.insert(endpoint.address, claimed.clone());
        Ok(claimed)
    }
}

fn map_status(err: TransferError) -> TransportError {
    match err {
        TransferError::Stall => TransportError::Stall,
        TransferError::Disconnected => TransportError::Disconnected,
        other => TransportError::ReadFailed(other.to_string()),
    }
}

fn timed_in<E: BulkOrInterrupt>(
    ep: &mut Endpoint<E, In>,
    max_len: usize,
    timeout: Duration,
) -> Result<Vec<u8>, TransportError> {
    // IN requests must be a whole number of packets
    let mps = ep.max_packet_size().max(1);
    let request = max_len.max(1).div_ceil(mps) * mps;
    ep.submit(ep.allocate(request));

    let completion = match ep.wait_next_complete(timeout) {
        Some(c) => c,
        None => {
            ep.cancel_all();
            match ep.wait_next_complete(CANCEL_GRACE) {
                Some(c) if c.actual_len > 0 => c,
                _ => return Ok(Vec::new()),
            }
        }
    };
    finish_in(completion, max_len)
}

fn finish_in(completion: Completion, max_len: usize) -> Result<Vec<u8>, TransportError> {
    let len = completion.actual_len.min(max_len);
    received(completion.status, completion.buffer.into_vec(), len)
}

/// What a finished IN transfer delivered. A cancelled transfer still hands
/// over the bytes that arrived before the cancel.
fn received(
    status: Result<(), TransferError>,
    mut data: Vec<u8>,
    len: usize,
) -> Result<Vec<u8>, TransportError> {
    match status {
        Ok(()) | Err(TransferError::Cancelled) => {
            data.truncate(len);
            Ok(data)
        }
        Err(e) => Err(map_status(e)),
    }
}

fn timed_out<E: BulkOrInterrupt>(
    ep: &mut Endpoint<E, Out>,
    data: &[u8],
    timeout: Duration,
) -> Result<usize, TransportError> {
    ep.submit(Buffer::from(data.to_vec()));
    match ep.wait_next_complete(timeout) {
        Some(c) => c
            .status
            .map(|()| c.actual_len)
            .map_err(|e| TransportError::WriteFailed(e.to_string())),
        None => {
            ep.cancel_all();
            let _ = ep.wait_next_complete(CANCEL_GRACE);
            Err(TransportError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            })
        }
    }
}

impl UsbTransport for NusbTransport {
    #[instrument(level = "debug", skip(self))]
    fn claim_interface(&self, number: u8) -> Result<InterfaceDescriptor, TransportError> {
        let device = self.device.lock();
        let device = device.as_ref().ok_or(TransportError::Disconnected)?;

        let descriptor = read_interfaces(device)
            .into_iter()
            .find(|i| i.number == number)
            .ok_or_else(|| TransportError::ClaimInterfaceFailed {
                interface: number,
                message: "interface not present in active configuration".into(),
            })?;

        let interface = device
            .claim_interface(number)
            .wait()
            .map_err(|e| TransportError::ClaimInterfaceFailed {
                interface: number,
                message: e.to_string(),
            })?;

        *self.interface.lock() = Some(interface);
        info!(interface = number, endpoints = descriptor.endpoints.len(), "Interface claimed");
        Ok(descriptor)
    }

    fn read(
        &self,
        endpoint: &EndpointDescriptor,
        max_len: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        self.with_endpoint(endpoint, |ep| match ep {
            ClaimedEndpoint::BulkIn(ep) => timed_in(ep, max_len, timeout),
            ClaimedEndpoint::InterruptIn(ep) => timed_in(ep, max_len, timeout),
            _ => Err(TransportError::EndpointNotFound {
                address: endpoint.address,
            }),
        })
    }

    #[instrument(level = "debug", skip(self, data), fields(
        endpoint = %format!("0x{:02X}", endpoint.address),
        len = data.len(),
    ))]
    fn write(
        &self,
        endpoint: &EndpointDescriptor,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, TransportError> {
        let written = self.with_endpoint(endpoint, |ep| match ep {
            ClaimedEndpoint::BulkOut(ep) => timed_out(ep, data, timeout),
            ClaimedEndpoint::InterruptOut(ep) => timed_out(ep, data, timeout),
            _ => Err(TransportError::EndpointNotFound {
                address: endpoint.address,
            }),
        })?;
        debug!(bytes_written = written, "Write complete");
        Ok(written)
    }

    fn release_interface(&self) -> Result<(), TransportError> {
        // Endpoints borrow the interface claim; drop them first.
        self.endpoints.lock().clear();
        self.interface.lock().take();
        Ok(())
    }

    fn close(&self) -> Result<(), TransportError> {
        self.endpoints.lock().clear();
        self.interface.lock().take();
        self.device.lock().take();
        Ok(())
    }
}
