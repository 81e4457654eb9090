//! Command surface consumed by the host application.
//!
//! `VendorLink` is what a messaging bridge talks to: every command returns a
//! `LinkError` with a stable code on failure, and everything that happens
//! asynchronously (data, status changes, logs) is pushed through the
//! readiness buffer to the configured sink.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, instrument};

use crate::buffer::ReadinessBuffer;
use crate::config::LinkConfig;
use crate::device::{DeviceDescriptor, DeviceRef};
use crate::error::LinkError;
use crate::events::{EventSink, LinkEvent, LogLevel, PlatformEvent};
use crate::permission::PermissionOutcome;
use crate::session::{ConnectTicket, ConnectionSnapshot, ConnectionSupervisor};
use crate::state::ConnectionState;
use crate::transfer::TransferRequest;
use crate::transport::DeviceBackend;

pub struct VendorLink<B: DeviceBackend> {
    backend: Arc<B>,
    config: LinkConfig,
    events: Arc<ReadinessBuffer>,
    supervisor: Mutex<Option<ConnectionSupervisor<B>>>,
}

impl<B: DeviceBackend> VendorLink<B> {
    pub fn new(backend: Arc<B>, config: LinkConfig, sink: Arc<dyn EventSink>) -> Self {
        Self {
            backend,
            config,
            events: Arc::new(ReadinessBuffer::new(sink)),
            supervisor: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub fn events(&self) -> &Arc<ReadinessBuffer> {
        &self.events
    }

    fn link(&self) -> Result<ConnectionSupervisor<B>, LinkError> {
        self.supervisor
            .lock()
            .clone()
            .ok_or(LinkError::NotInitialized)
    }

    /// Set up the supervisor. Calling it again is a no-op.
    pub fn initialize(&self) -> Result<(), LinkError> {
        let mut supervisor = self.supervisor.lock();
        if supervisor.is_some() {
            debug!("Already initialized");
            return Ok(());
        }
        *supervisor = Some(ConnectionSupervisor::new(
            self.backend.clone(),
            self.config.clone(),
            self.events.clone(),
        ));
        drop(supervisor);

        info!("Link initialized");
        self.events
            .push(LinkEvent::log(LogLevel::Info, "USB manager initialized"));
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.supervisor.lock().is_some()
    }

    #[instrument(level = "info", skip(self))]
    pub fn scan_devices(&self) -> Result<Vec<DeviceDescriptor>, LinkError> {
        let devices = self.link()?.catalog().scan();
        self.events.push(LinkEvent::log(
            LogLevel::Info,
            format!("Found {} USB devices", devices.len()),
        ));
        Ok(devices)
    }

    pub fn request_permission(&self, device: &DeviceRef) -> Result<PermissionOutcome, LinkError> {
        let link = self.link()?;
        let found = link
            .catalog()
            .find(device)
            .ok_or_else(|| LinkError::DeviceNotFound(device.to_string()))?;
        link.gate().request_permission(&found)
    }

    pub fn connect_to_device(&self, device: &DeviceRef) -> Result<ConnectTicket, LinkError> {
        self.link()?.connect(device)
    }

    pub fn disconnect(&self) -> bool {
        self.link().map(|l| l.disconnect()).unwrap_or(false)
    }

    pub fn connection_state(&self) -> ConnectionSnapshot {
        match self.link() {
            Ok(link) => link.snapshot(),
            Err(_) => ConnectionSnapshot {
                state: ConnectionState::Idle,
                is_connected: false,
                is_connecting: false,
                device_info: None,
            },
        }
    }

    pub fn send_bulk_data(&self, data: &[u8]) -> Result<usize, LinkError> {
        self.link()?.send_bulk_data(data)
    }

    pub fn bulk_transfer(&self, request: TransferRequest) -> Result<bool, LinkError> {
        self.link()?.bulk_transfer(request)
    }

    pub fn interrupt_transfer(&self, request: TransferRequest) -> Result<bool, LinkError> {
        self.link()?.interrupt_transfer(request)
    }

    pub fn send_protocol_data(&self, message_id: u8, payload: &[u8]) -> Result<bool, LinkError> {
        self.link()?.send_protocol_data(message_id, payload)
    }

    /// The consumer is listening; held events are flushed in order.
    pub fn mark_ready(&self) {
        self.events.mark_ready();
    }

    pub fn mark_unavailable(&self) {
        self.events.mark_unavailable();
    }

    /// Wait, bounded by `ready_wait_timeout_ms`, for the consumer to be ready.
    pub async fn wait_until_ready(&self) -> bool {
        self.events
            .wait_until_ready(self.config.ready_wait_timeout())
            .await
    }

    /// Route a notification raised by the platform. Dropped before
    /// `initialize`.
    pub fn handle_platform_event(&self, event: PlatformEvent) {
        let link = match self.link() {
            Ok(link) => link,
            Err(_) => {
                debug!(?event, "Platform event before initialization, ignored");
                return;
            }
        };
        match event {
            PlatformEvent::Attached(device) => link.on_attached(device),
            PlatformEvent::Detached(key) => link.on_detached(&key),
            PlatformEvent::PermissionResult { key, granted } => {
                link.on_permission_result(&key, granted)
            }
            PlatformEvent::NetworkInterface(name) => {
                self.events.push(LinkEvent::NetworkInterface(name))
            }
        }
    }

    /// Handle platform events until the channel closes. Blocks; run it on a
    /// dedicated thread.
    pub fn pump_platform_events(&self, rx: &async_channel::Receiver<PlatformEvent>) {
        while let Ok(event) = rx.recv_blocking() {
            self.handle_platform_event(event);
        }
        debug!("Platform event channel closed");
    }

    /// Disconnect, stop reconnection, forget permissions and stop delivering.
    pub fn shutdown(&self) {
        let supervisor = self.supervisor.lock().take();
        if let Some(link) = supervisor {
            link.shutdown();
        }
        self.events.mark_unavailable();
        info!("Link shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{EndpointDescriptor, TransferKind};
    use crate::events::{ChannelSink, EventRecord};
    use crate::transport::MockBackend;

    fn setup() -> (
        Arc<MockBackend>,
        VendorLink<MockBackend>,
        async_channel::Receiver<EventRecord>,
    ) {
        let backend = Arc::new(MockBackend::new());
        let (sink, rx) = ChannelSink::unbounded();
        let config = LinkConfig {
            read_timeout_ms: 5,
            error_backoff_ms: 1,
            ..Default::default()
        };
        let link = VendorLink::new(backend.clone(), config, Arc::new(sink));
        (backend, link, rx)
    }

    fn kinds(rx: &async_channel::Receiver<EventRecord>) -> Vec<&'static str> {
        std::iter::from_fn(|| rx.try_recv().ok())
            .map(|r| r.event.kind())
            .collect()
    }

    fn bulk_pair() -> Vec<EndpointDescriptor> {
        vec![
            EndpointDescriptor::new(0x81, TransferKind::Bulk, 64),
            EndpointDescriptor::new(0x02, TransferKind::Bulk, 64),
        ]
    }

    #[test]
    fn test_commands_before_initialize() {
        let (_, link, _) = setup();
        assert_eq!(link.scan_devices(), Err(LinkError::NotInitialized));
        assert_eq!(
            link.connect_to_device(&DeviceRef::Id { device_id: 1 }).unwrap_err(),
            LinkError::NotInitialized
        );
        assert_eq!(link.send_bulk_data(b"x"), Err(LinkError::NotInitialized));
        assert!(!link.disconnect());
        assert_eq!(link.connection_state().state, ConnectionState::Idle);
    }

    #[test]
    fn test_events_held_until_ready() {
        let (backend, link, rx) = setup();
        backend.add_usb_device(1, 0x1234, 0x0001, bulk_pair());
        backend.grant(1);
        link.initialize().unwrap();

        link.connect_to_device(&DeviceRef::Id { device_id: 1 })
            .unwrap()
            .blocking_wait()
            .unwrap();
        assert!(kinds(&rx).is_empty());
        assert!(link.events().pending() > 0);

        link.mark_ready();
        let delivered = kinds(&rx);
        assert!(delivered.contains(&"connection_status"));
        assert!(delivered.contains(&"device_attached"));
        assert_eq!(link.events().pending(), 0);
    }

    #[test]
    fn test_permission_request_short_circuits() {
        let (backend, link, _) = setup();
        backend.add_usb_device(1, 0x1234, 0x0001, bulk_pair());
        backend.grant(1);
        link.initialize().unwrap();

        let outcome = link
            .request_permission(&DeviceRef::Ids {
                vendor_id: 0x1234,
                product_id: 0x0001,
            })
            .unwrap();
        assert!(outcome.is_granted());
        assert_eq!(backend.prompts(), 0);
        assert!(matches!(
            link.request_permission(&DeviceRef::Id { device_id: 9 }),
            Err(LinkError::DeviceNotFound(_))
        ));
    }

    #[test]
    fn test_platform_events_routed() {
        let (backend, link, rx) = setup();
        backend.add_usb_device(1, 0x1234, 0x0001, bulk_pair());
        link.initialize().unwrap();
        link.mark_ready();
        kinds(&rx);

        let ticket = link
            .connect_to_device(&DeviceRef::Id { device_id: 1 })
            .unwrap();
        let device = link.scan_devices().unwrap().remove(0);
        link.handle_platform_event(PlatformEvent::PermissionResult {
            key: device.key(),
            granted: true,
        });
        ticket.blocking_wait().unwrap();
        assert!(link.connection_state().is_connected);

        link.handle_platform_event(PlatformEvent::NetworkInterface("usb0".into()));
        link.handle_platform_event(PlatformEvent::Detached(device.key()));
        assert!(!link.connection_state().is_connected);

        let seen = kinds(&rx);
        assert!(seen.contains(&"network_interface"));
        assert!(seen.contains(&"device_detached"));
    }

    #[test]
    fn test_shutdown_requires_new_initialize() {
        let (backend, link, _) = setup();
        backend.add_usb_device(1, 0x1234, 0x0001, bulk_pair());
        backend.grant(1);
        link.initialize().unwrap();
        link.connect_to_device(&DeviceRef::Id { device_id: 1 })
            .unwrap()
            .blocking_wait()
            .unwrap();

        link.shutdown();
        assert_eq!(backend.open_handles(), 0);
        assert!(!link.is_initialized());
        assert!(!link.events().is_ready());
        assert_eq!(link.scan_devices(), Err(LinkError::NotInitialized));
    }

    #[tokio::test]
    async fn test_wait_until_ready() {
        let (_, link, _) = setup();
        link.mark_ready();
        assert!(link.wait_until_ready().await);
    }
}
