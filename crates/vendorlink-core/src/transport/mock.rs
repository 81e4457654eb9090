//! Mock backend and transport for testing.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use super::traits::{DeviceBackend, DeviceProbe, ProbeDetails, TransportError, UsbTransport};
use crate::device::{
    DeviceDescriptor, EndpointDescriptor, InterfaceDescriptor, TransferKind, TransportKind,
};

/// One scripted outcome for a read call.
#[derive(Debug, Clone)]
pub enum MockRead {
    Data(Vec<u8>),
    Timeout,
    Error,
    /// The far end went away.
    Lost,
}

/// Shared state of one simulated device, visible to the test and the handle.
pub struct MockLink {
    reads: Mutex<VecDeque<MockRead>>,
    writes: Mutex<Vec<(u8, Vec<u8>)>>,
    /// Delay applied to reads that find nothing queued.
    idle_delay: Duration,
    fail_writes: AtomicBool,
    unplugged: AtomicBool,
    reads_served: AtomicUsize,
}

impl MockLink {
    fn new() -> Self {
        Self {
            reads: Mutex::new(VecDeque::new()),
            writes: Mutex::new(Vec::new()),
            idle_delay: Duration::from_millis(2),
            fail_writes: AtomicBool::new(false),
            unplugged: AtomicBool::new(false),
            reads_served: AtomicUsize::new(0),
        }
    }

    /// Queue bytes to be returned by the next read.
    pub fn queue_data(&self, bytes: &[u8]) {
        self.reads.lock().push_back(MockRead::Data(bytes.to_vec()));
    }

    /// Queue `n` failing reads.
    pub fn queue_errors(&self, n: usize) {
        let mut reads = self.reads.lock();
        for _ in 0..n {
            reads.push_back(MockRead::Error);
        }
    }

    pub fn queue(&self, read: MockRead) {
        self.reads.lock().push_back(read);
    }

    /// Reads still waiting to be served.
    pub fn pending_reads(&self) -> usize {
        self.reads.lock().len()
    }

    /// Reads that returned scripted data or errors.
    pub fn reads_served(&self) -> usize {
        self.reads_served.load(Ordering::SeqCst)
    }

    /// Captured writes as `(endpoint address, bytes)`.
    pub fn writes(&self) -> Vec<(u8, Vec<u8>)> {
        self.writes.lock().clone()
    }

    pub fn written_bytes(&self) -> Vec<Vec<u8>> {
        self.writes.lock().iter().map(|(_, b)| b.clone()).collect()
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Simulate the cable being pulled: every read and write fails.
    pub fn unplug(&self) {
        self.unplugged.store(true, Ordering::SeqCst);
    }
}

/// A device the mock backend will report.
pub struct MockDevice {
    pub probe_id: u32,
    pub transport: TransportKind,
    pub vendor_id: u16,
    pub product_id: u16,
    pub details: Option<ProbeDetails>,
    pub granted: AtomicBool,
    pub fail_open: AtomicBool,
    pub fail_claim: AtomicBool,
    pub link: Arc<MockLink>,
}

/// Mock backend for unit testing supervisor logic.
pub struct MockBackend {
    devices: Mutex<Vec<Arc<MockDevice>>>,
    prompts: AtomicUsize,
    fail_prompt: AtomicBool,
    open_handles: Arc<AtomicUsize>,
    max_open_handles: Arc<AtomicUsize>,
    open_log: Mutex<Vec<u32>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            devices: Mutex::new(Vec::new()),
            prompts: AtomicUsize::new(0),
            fail_prompt: AtomicBool::new(false),
            open_handles: Arc::new(AtomicUsize::new(0)),
            max_open_handles: Arc::new(AtomicUsize::new(0)),
            open_log: Mutex::new(Vec::new()),
        }
    }

    /// Add a USB device exposing `endpoints` on interface 0.
    pub fn add_usb_device(
        &self,
        device_id: u32,
        vendor_id: u16,
        product_id: u16,
        endpoints: Vec<EndpointDescriptor>,
    ) -> Arc<MockLink> {
        let details = ProbeDetails {
            device_name: format!("/dev/bus/usb/001/{:03}", device_id),
            manufacturer: Some("Zanis".into()),
            product: Some(format!("Probe {}", device_id)),
            serial: Some(format!("SN{:04}", device_id)),
            class: 0xFF,
            subclass: 0,
            protocol: 0,
            interfaces: vec![InterfaceDescriptor {
                number: 0,
                class: 0xFF,
                endpoints,
            }],
            protocols: Vec::new(),
        };
        self.add(device_id, TransportKind::Usb, vendor_id, product_id, Some(details))
    }

    /// Add an accessory advertising `protocol`.
    pub fn add_accessory(&self, device_id: u32, serial: &str, protocol: &str) -> Arc<MockLink> {
        let details = ProbeDetails {
            device_name: format!("accessory-{}", device_id),
            manufacturer: Some("Zanis".into()),
            product: Some("Dock".into()),
            serial: Some(serial.into()),
            interfaces: vec![InterfaceDescriptor {
                number: 0,
                class: 0,
                endpoints: vec![
                    EndpointDescriptor::new(0x81, TransferKind::Bulk, 512),
                    EndpointDescriptor::new(0x01, TransferKind::Bulk, 512),
                ],
            }],
            protocols: vec![protocol.into()],
            ..Default::default()
        };
        let link = self.add(device_id, TransportKind::Accessory, 0, 0, Some(details));
        self.grant(device_id);
        link
    }

    /// Add a device whose probe fails.
    pub fn add_broken_device(&self, device_id: u32, vendor_id: u16, product_id: u16) {
        self.add(device_id, TransportKind::Usb, vendor_id, product_id, None);
    }

    fn add(
        &self,
        device_id: u32,
        transport: TransportKind,
        vendor_id: u16,
        product_id: u16,
        details: Option<ProbeDetails>,
    ) -> Arc<MockLink> {
        let link = Arc::new(MockLink::new());
        self.devices.lock().push(Arc::new(MockDevice {
            probe_id: device_id,
            transport,
            vendor_id,
            product_id,
            details,
            granted: AtomicBool::new(false),
            fail_open: AtomicBool::new(false),
            fail_claim: AtomicBool::new(false),
            link: link.clone(),
        }));
        link
    }

    pub fn device(&self, device_id: u32) -> Option<Arc<MockDevice>> {
        self.devices
            .lock()
            .iter()
            .find(|d| d.probe_id == device_id)
            .cloned()
    }

    /// Remove a device from enumeration (it stays open if someone holds it).
    pub fn remove_device(&self, device_id: u32) {
        self.devices.lock().retain(|d| d.probe_id != device_id);
    }

    pub fn grant(&self, device_id: u32) {
        if let Some(d) = self.device(device_id) {
            d.granted.store(true, Ordering::SeqCst);
        }
    }

    pub fn set_fail_prompt(&self, fail: bool) {
        self.fail_prompt.store(fail, Ordering::SeqCst);
    }

    /// Number of OS permission prompts issued.
    pub fn prompts(&self) -> usize {
        self.prompts.load(Ordering::SeqCst)
    }

    pub fn open_handles(&self) -> usize {
        self.open_handles.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously open handles seen.
    pub fn max_open_handles(&self) -> usize {
        self.max_open_handles.load(Ordering::SeqCst)
    }

    /// Device ids in the order they were opened.
    pub fn open_log(&self) -> Vec<u32> {
        self.open_log.lock().clone()
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceBackend for MockBackend {
    type Transport = MockTransport;

    fn probe_devices(&self) -> Result<Vec<DeviceProbe>, TransportError> {
        Ok(self
            .devices
            .lock()
            .iter()
            .map(|d| DeviceProbe {
                device_id: d.probe_id,
                transport: d.transport,
                vendor_id: d.vendor_id,
                product_id: d.product_id,
                details: d
                    .details
                    .clone()
                    .ok_or_else(|| TransportError::OpenFailed("descriptor read failed".into())),
            })
            .collect())
    }

    fn has_permission(&self, device: &DeviceDescriptor) -> bool {
        self.device(device.device_id)
            .is_some_and(|d| d.granted.load(Ordering::SeqCst))
    }

    fn request_permission(&self, _device: &DeviceDescriptor) -> Result<(), TransportError> {
        self.prompts.fetch_add(1, Ordering::SeqCst);
        if self.fail_prompt.load(Ordering::SeqCst) {
            return Err(TransportError::PermissionFailed("prompt unavailable".into()));
        }
        Ok(())
    }

    fn open(&self, device: &DeviceDescriptor) -> Result<MockTransport, TransportError> {
        let dev = self
            .device(device.device_id)
            .ok_or_else(|| TransportError::DeviceNotFound(device.device_name.clone()))?;
        if dev.fail_open.load(Ordering::SeqCst) {
            return Err(TransportError::OpenFailed("device busy".into()));
        }

        let now_open = self.open_handles.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_open_handles.fetch_max(now_open, Ordering::SeqCst);
        self.open_log.lock().push(dev.probe_id);

        Ok(MockTransport {
            device: dev,
            open_handles: self.open_handles.clone(),
            closed: AtomicBool::new(false),
        })
    }
}

/// Handle returned by [`MockBackend::open`].
pub struct MockTransport {
    device: Arc<MockDevice>,
    open_handles: Arc<AtomicUsize>,
    closed: AtomicBool,
}

impl MockTransport {
    fn check_alive(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) || self.device.link.unplugged.load(Ordering::SeqCst) {
            return Err(TransportError::Disconnected);
        }
        Ok(())
    }
}

impl UsbTransport for MockTransport {
    fn claim_interface(&self, number: u8) -> Result<InterfaceDescriptor, TransportError> {
        self.check_alive()?;
        if self.device.fail_claim.load(Ordering::SeqCst) {
            return Err(TransportError::ClaimInterfaceFailed {
                interface: number,
                message: "interface busy".into(),
            });
        }
        self.device
            .details
            .as_ref()
            .and_then(|d| d.interfaces.iter().find(|i| i.number == number).cloned())
            .ok_or(TransportError::ClaimInterfaceFailed {
                interface: number,
                message: "no such interface".into(),
            })
    }

    fn read(
        &self,
        _endpoint: &EndpointDescriptor,
        max_len: usize,
        _timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        self.check_alive()?;
        let next = self.device.link.reads.lock().pop_front();
        match next {
            Some(MockRead::Data(mut bytes)) => {
                self.device.link.reads_served.fetch_add(1, Ordering::SeqCst);
                bytes.truncate(max_len);
                Ok(bytes)
            }
            Some(MockRead::Error) => {
                self.device.link.reads_served.fetch_add(1, Ordering::SeqCst);
                Err(TransportError::ReadFailed("scripted failure".into()))
            }
            Some(MockRead::Lost) => {
                self.device.link.reads_served.fetch_add(1, Ordering::SeqCst);
                Err(TransportError::Disconnected)
            }
            Some(MockRead::Timeout) | None => {
                thread::sleep(self.device.link.idle_delay);
                Ok(Vec::new())
            }
        }
    }

    fn write(
        &self,
        endpoint: &EndpointDescriptor,
        data: &[u8],
        _timeout: Duration,
    ) -> Result<usize, TransportError> {
        self.check_alive()?;
        if self.device.link.fail_writes.load(Ordering::SeqCst) {
            return Err(TransportError::WriteFailed("scripted failure".into()));
        }
        self.device
            .link
            .writes
            .lock()
            .push((endpoint.address, data.to_vec()));
        Ok(data.len())
    }

    fn release_interface(&self) -> Result<(), TransportError> {
        Ok(())
    }

    fn close(&self) -> Result<(), TransportError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.open_handles.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

impl Drop for MockTransport {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bulk_pair() -> Vec<EndpointDescriptor> {
        vec![
            EndpointDescriptor::new(0x81, TransferKind::Bulk, 64),
            EndpointDescriptor::new(0x02, TransferKind::Bulk, 64),
        ]
    }

    #[test]
    fn test_mock_read_script() {
        let backend = MockBackend::new();
        let link = backend.add_usb_device(1, 0x1234, 0x0001, bulk_pair());
        link.queue_data(b"abc");
        link.queue_errors(1);

        let probes = backend.probe_devices().unwrap();
        assert_eq!(probes.len(), 1);

        let dev = DeviceDescriptor::minimal(1, TransportKind::Usb, 0x1234, 0x0001);
        let t = backend.open(&dev).unwrap();
        let ep = EndpointDescriptor::new(0x81, TransferKind::Bulk, 64);
        assert_eq!(t.read(&ep, 64, Duration::from_millis(1)).unwrap(), b"abc");
        assert!(t.read(&ep, 64, Duration::from_millis(1)).is_err());
        assert!(t.read(&ep, 64, Duration::from_millis(1)).unwrap().is_empty());
    }

    #[test]
    fn test_mock_write_capture() {
        let backend = MockBackend::new();
        let link = backend.add_usb_device(1, 0x1234, 0x0001, bulk_pair());
        let dev = DeviceDescriptor::minimal(1, TransportKind::Usb, 0x1234, 0x0001);
        let t = backend.open(&dev).unwrap();
        let ep = EndpointDescriptor::new(0x02, TransferKind::Bulk, 64);
        t.write(&ep, b"Hello", Duration::from_millis(1)).unwrap();
        t.write(&ep, b"World", Duration::from_millis(1)).unwrap();

        assert_eq!(link.written_bytes(), vec![b"Hello".to_vec(), b"World".to_vec()]);
    }

    #[test]
    fn test_mock_handle_accounting() {
        let backend = MockBackend::new();
        backend.add_usb_device(1, 0x1234, 0x0001, bulk_pair());
        let dev = DeviceDescriptor::minimal(1, TransportKind::Usb, 0x1234, 0x0001);

        let t = backend.open(&dev).unwrap();
        assert_eq!(backend.open_handles(), 1);
        t.close().unwrap();
        t.close().unwrap();
        assert_eq!(backend.open_handles(), 0);
        assert!(t.write(&bulk_pair()[1], b"x", Duration::ZERO).is_err());
    }

    #[test]
    fn test_mock_unplug() {
        let backend = MockBackend::new();
        let link = backend.add_usb_device(1, 0x1234, 0x0001, bulk_pair());
        let dev = DeviceDescriptor::minimal(1, TransportKind::Usb, 0x1234, 0x0001);
        let t = backend.open(&dev).unwrap();

        link.unplug();
        assert!(matches!(
            t.read(&bulk_pair()[0], 64, Duration::ZERO),
            Err(TransportError::Disconnected)
        ));
    }
}
