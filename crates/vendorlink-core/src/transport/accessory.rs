//! Accessory sessions over a TCP stream.
//!
//! An accessory is not a USB device from the host's point of view: it offers a
//! single bidirectional byte stream once a session is opened for its protocol
//! string. The transport maps that stream onto a synthetic bulk endpoint pair
//! so the rest of the link treats both transports the same way.

use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_channel::Sender;
use parking_lot::Mutex;
use tracing::{debug, info, instrument, warn};

use super::traits::{DeviceBackend, DeviceProbe, ProbeDetails, TransportError, UsbTransport};
use crate::config::AccessoryEntry;
use crate::device::{
    DeviceDescriptor, DeviceKey, EndpointDescriptor, InterfaceDescriptor, TransferKind,
    TransportKind,
};
use crate::events::PlatformEvent;
use crate::protocol::constants::ACCESSORY_PACKET_SIZE;

/// IN side of the session stream.
pub const ACCESSORY_IN_ENDPOINT: u8 = 0x81;
/// OUT side of the session stream.
pub const ACCESSORY_OUT_ENDPOINT: u8 = 0x01;

const SESSION_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

fn session_interface() -> InterfaceDescriptor {
    InterfaceDescriptor {
        number: 0,
        class: 0,
        endpoints: vec![
            EndpointDescriptor::new(ACCESSORY_IN_ENDPOINT, TransferKind::Bulk, ACCESSORY_PACKET_SIZE),
            EndpointDescriptor::new(ACCESSORY_OUT_ENDPOINT, TransferKind::Bulk, ACCESSORY_PACKET_SIZE),
        ],
    }
}

/// Accessories listed in the configuration.
///
/// Accessories need no OS permission grant; opening the session is the only
/// gate. A session whose peer goes away reports the accessory as detached on
/// `events`.
pub struct AccessoryBackend {
    entries: Vec<AccessoryEntry>,
    default_protocol: String,
    events: Sender<PlatformEvent>,
}

impl AccessoryBackend {
    pub fn new(
        entries: Vec<AccessoryEntry>,
        default_protocol: impl Into<String>,
        events: Sender<PlatformEvent>,
    ) -> Self {
        Self {
            entries,
            default_protocol: default_protocol.into(),
            events,
        }
    }

    fn entry(&self, device_id: u32) -> Result<&AccessoryEntry, TransportError> {
        (device_id as usize)
            .checked_sub(1)
            .and_then(|i| self.entries.get(i))
            .ok_or_else(|| TransportError::DeviceNotFound(format!("accessory {}", device_id)))
    }
}

impl DeviceBackend for AccessoryBackend {
    type Transport = AccessoryTransport;

    fn probe_devices(&self) -> Result<Vec<DeviceProbe>, TransportError> {
        Ok(self
            .entries
            .iter()
            .enumerate()
            .map(|(i, entry)| {
                let protocols = if entry.protocols.is_empty() {
                    vec![self.default_protocol.clone()]
                } else {
                    entry.protocols.clone()
                };
                DeviceProbe {
                    device_id: i as u32 + 1,
                    transport: TransportKind::Accessory,
                    vendor_id: 0,
                    product_id: 0,
                    details: Ok(ProbeDetails {
                        device_name: entry.address.clone(),
                        manufacturer: Some(entry.manufacturer.clone()),
                        product: Some(entry.model.clone()),
                        serial: Some(entry.serial.clone()),
                        interfaces: vec![session_interface()],
                        protocols,
                        ..Default::default()
                    }),
                }
            })
            .collect())
    }

    fn has_permission(&self, _device: &DeviceDescriptor) -> bool {
        true
    }

    fn request_permission(&self, _device: &DeviceDescriptor) -> Result<(), TransportError> {
        Ok(())
    }

    #[instrument(level = "info", skip(self, device), fields(key = %device.key()))]
    fn open(&self, device: &DeviceDescriptor) -> Result<AccessoryTransport, TransportError> {
        let entry = self.entry(device.device_id)?;
        let addr = entry
            .address
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| TransportError::OpenFailed(format!("unresolvable {}", entry.address)))?;

        let stream = TcpStream::connect_timeout(&addr, SESSION_CONNECT_TIMEOUT)
            .map_err(|e| TransportError::OpenFailed(format!("{}: {}", entry.address, e)))?;
        stream.set_nodelay(true)?;
        let writer = stream.try_clone()?;

        info!(address = %entry.address, "Accessory session opened");
        Ok(AccessoryTransport {
            key: device.key(),
            events: self.events.clone(),
            detached: AtomicBool::new(false),
            reader: Mutex::new(Some(stream)),
            writer: Mutex::new(Some(writer)),
        })
    }
}

/// An open accessory session.
pub struct AccessoryTransport {
    key: DeviceKey,
    events: Sender<PlatformEvent>,
    detached: AtomicBool,
    reader: Mutex<Option<TcpStream>>,
    writer: Mutex<Option<TcpStream>>,
}

impl AccessoryTransport {
    /// The peer closed the session. Reported once per session.
    fn peer_gone(&self) -> TransportError {
        if !self.detached.swap(true, Ordering::SeqCst) {
            info!(key = %self.key, "Accessory session closed by peer");
            if self
                .events
                .try_send(PlatformEvent::Detached(self.key.clone()))
                .is_err()
            {
                warn!("Platform event receiver gone, detach not reported");
            }
        }
        TransportError::Disconnected
    }
}

fn is_peer_gone(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe
    )
}

impl UsbTransport for AccessoryTransport {
    fn claim_interface(&self, number: u8) -> Result<InterfaceDescriptor, TransportError> {
        if number != 0 {
            return Err(TransportError::ClaimInterfaceFailed {
                interface: number,
                message: "accessory sessions expose interface 0 only".into(),
            });
        }
        Ok(session_interface())
    }

    fn read(
        &self,
        endpoint: &EndpointDescriptor,
        max_len: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        if endpoint.address != ACCESSORY_IN_ENDPOINT {
            return Err(TransportError::EndpointNotFound {
                address: endpoint.address,
            });
        }
        let mut guard = self.reader.lock();
        let stream = guard.as_mut().ok_or(TransportError::Disconnected)?;
        // A zero timeout would mean "block forever"
        stream.set_read_timeout(Some(timeout.max(Duration::from_millis(1))))?;

        let mut buf = vec![0u8; max_len.max(1)];
        match stream.read(&mut buf) {
            Ok(0) => Err(self.peer_gone()),
            Ok(n) => {
                buf.truncate(n);
                Ok(buf)
            }
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                Ok(Vec::new())
            }
            Err(e) if is_peer_gone(e.kind()) => Err(self.peer_gone()),
            Err(e) => Err(TransportError::ReadFailed(e.to_string())),
        }
    }

    fn write(
        &self,
        endpoint: &EndpointDescriptor,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, TransportError> {
        if endpoint.address != ACCESSORY_OUT_ENDPOINT {
            return Err(TransportError::EndpointNotFound {
                address: endpoint.address,
            });
        }
        let mut guard = self.writer.lock();
        let stream = guard.as_mut().ok_or(TransportError::Disconnected)?;
        stream.set_write_timeout(Some(timeout.max(Duration::from_millis(1))))?;

        match stream.write_all(data).and_then(|()| stream.flush()) {
            Ok(()) => {
                debug!(len = data.len(), "Accessory write complete");
                Ok(data.len())
            }
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                Err(TransportError::Timeout {
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
            Err(e) if is_peer_gone(e.kind()) => Err(self.peer_gone()),
            Err(e) => Err(TransportError::WriteFailed(e.to_string())),
        }
    }

    fn release_interface(&self) -> Result<(), TransportError> {
        Ok(())
    }

    fn close(&self) -> Result<(), TransportError> {
        // Our own teardown is not a detach
        self.detached.store(true, Ordering::SeqCst);
        if let Some(stream) = self.writer.lock().take() {
            // Peer may already be gone
            let _ = stream.shutdown(Shutdown::Both);
        }
        self.reader.lock().take();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn entry(address: String) -> AccessoryEntry {
        AccessoryEntry {
            manufacturer: "Zanis".into(),
            model: "Dock".into(),
            serial: "SN1".into(),
            address,
            protocols: Vec::new(),
        }
    }

    fn backend(address: String) -> (AccessoryBackend, async_channel::Receiver<PlatformEvent>) {
        let (tx, rx) = async_channel::unbounded();
        (AccessoryBackend::new(vec![entry(address)], "com.zanis.vendor", tx), rx)
    }

    fn descriptor() -> DeviceDescriptor {
        let mut desc = DeviceDescriptor::minimal(1, TransportKind::Accessory, 0, 0);
        desc.manufacturer_name = "Zanis".into();
        desc.product_name = "Dock".into();
        desc.serial_number = "SN1".into();
        desc
    }

    #[test]
    fn test_probe_uses_default_protocol() {
        let (backend, _rx) = backend("127.0.0.1:1".into());
        let probes = backend.probe_devices().unwrap();
        assert_eq!(probes.len(), 1);
        let details = probes[0].details.as_ref().unwrap();
        assert_eq!(details.protocols, vec!["com.zanis.vendor".to_string()]);
        assert_eq!(details.interfaces[0].endpoints.len(), 2);
    }

    #[test]
    fn test_session_read_write() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let peer = std::thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            conn.write_all(b"hello").unwrap();
            let mut buf = [0u8; 6];
            conn.read_exact(&mut buf).unwrap();
            buf
        });

        let (backend, rx) = backend(addr);
        let transport = backend.open(&descriptor()).unwrap();
        let iface = transport.claim_interface(0).unwrap();
        let (ep_in, ep_out) = (iface.endpoints[0], iface.endpoints[1]);

        let mut got = Vec::new();
        while got.len() < 5 {
            got.extend(transport.read(&ep_in, 512, Duration::from_millis(100)).unwrap());
        }
        assert_eq!(got, b"hello");

        transport
            .write(&ep_out, &[0xFF, 0x02, 0x02, 0x00, 0xEE, 0xFF], Duration::from_secs(1))
            .unwrap();
        assert_eq!(peer.join().unwrap(), [0xFF, 0x02, 0x02, 0x00, 0xEE, 0xFF]);

        transport.close().unwrap();
        assert!(matches!(
            transport.read(&ep_in, 512, Duration::from_millis(10)),
            Err(TransportError::Disconnected)
        ));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_peer_close_reports_detach_once() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (backend, rx) = backend(addr);
        let transport = backend.open(&descriptor()).unwrap();
        drop(listener.accept().unwrap());

        let ep_in = session_interface().endpoints[0];
        for _ in 0..3 {
            assert!(matches!(
                transport.read(&ep_in, 512, Duration::from_millis(100)),
                Err(TransportError::Disconnected)
            ));
        }
        assert_eq!(
            rx.try_recv(),
            Ok(PlatformEvent::Detached(descriptor().key()))
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_read_timeout_is_empty() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (backend, _rx) = backend(addr);
        let transport = backend.open(&descriptor()).unwrap();
        let _peer = listener.accept().unwrap();

        let ep_in = session_interface().endpoints[0];
        assert!(transport.read(&ep_in, 512, Duration::from_millis(20)).unwrap().is_empty());
    }
}
