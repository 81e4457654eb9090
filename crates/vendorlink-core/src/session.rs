//! Connection supervision: one link, from permission prompt to teardown.
//!
//! All mutable link state sits behind one mutex. Device I/O and reader joins
//! happen outside it; work that outlives a call (the read loop, a pending
//! permission, a reconnection run) carries the generation it was started for
//! and drops out once a teardown has moved the generation on.

use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{debug, info, instrument, warn};

use crate::buffer::ReadinessBuffer;
use crate::catalog::DeviceCatalog;
use crate::config::LinkConfig;
use crate::device::{DeviceDescriptor, DeviceKey, DeviceRef, Direction, TransferKind, TransportKind};
use crate::error::LinkError;
use crate::events::{LinkEvent, LogLevel, ProtocolSend, TransferOutcome};
use crate::permission::{PermissionGate, PermissionOutcome};
use crate::protocol::constants::{DEFAULT_BULK_ENDPOINT, DEFAULT_INTERRUPT_ENDPOINT};
use crate::protocol::handshake::{INIT_RESPONSE, InitScanner};
use crate::protocol::packet::encode;
use crate::state::{ConnectionState, StateMachineContext};
use crate::transfer::{
    EndpointSet, InboundHandler, ReaderConfig, ReaderHandle, TransferRequest, render_inbound,
};
use crate::transport::{DeviceBackend, TransportError, UsbTransport};

type ConnectResult = Result<DeviceDescriptor, LinkError>;

/// Completion handle for a connect attempt.
#[derive(Debug)]
pub struct ConnectTicket {
    rx: oneshot::Receiver<ConnectResult>,
}

impl ConnectTicket {
    fn abandoned() -> LinkError {
        LinkError::ConnectionFailed("connection attempt abandoned".into())
    }

    pub async fn wait(self) -> ConnectResult {
        self.rx.await.unwrap_or_else(|_| Err(Self::abandoned()))
    }

    /// Block until the attempt settles. Must not be called from inside an
    /// async runtime.
    pub fn blocking_wait(self) -> ConnectResult {
        self.rx.blocking_recv().unwrap_or_else(|_| Err(Self::abandoned()))
    }
}

/// Answer to `getConnectionState`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSnapshot {
    pub state: ConnectionState,
    pub is_connected: bool,
    pub is_connecting: bool,
    pub device_info: Option<DeviceDescriptor>,
}

struct Inner<T> {
    ctx: StateMachineContext,
    device: Option<DeviceDescriptor>,
    transport: Option<Arc<T>>,
    endpoints: EndpointSet,
    reader: Option<ReaderHandle>,
    pending: Option<oneshot::Sender<ConnectResult>>,
    handshake_deadline: Option<Instant>,
    init_scanner: InitScanner,
    /// Moves on explicit disconnects and user connects; a reconnection run
    /// stops once it no longer matches.
    reconnect_epoch: u64,
    reconnecting: bool,
}

impl<T> Inner<T> {
    fn new() -> Self {
        Self {
            ctx: StateMachineContext::new(),
            device: None,
            transport: None,
            endpoints: EndpointSet::default(),
            reader: None,
            pending: None,
            handshake_deadline: None,
            init_scanner: InitScanner::new(),
            reconnect_epoch: 0,
            reconnecting: false,
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.ctx.generation == generation
    }
}

struct Shared<B: DeviceBackend> {
    backend: Arc<B>,
    catalog: DeviceCatalog<B>,
    gate: PermissionGate<B>,
    events: Arc<ReadinessBuffer>,
    config: LinkConfig,
    inner: Mutex<Inner<B::Transport>>,
}

/// Owns the single link to a peripheral.
pub struct ConnectionSupervisor<B: DeviceBackend> {
    shared: Arc<Shared<B>>,
}

impl<B: DeviceBackend> Clone for ConnectionSupervisor<B> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<B: DeviceBackend> ConnectionSupervisor<B> {
    pub fn new(backend: Arc<B>, config: LinkConfig, events: Arc<ReadinessBuffer>) -> Self {
        let catalog = DeviceCatalog::new(backend.clone(), config.accessory_protocol.clone());
        let gate = PermissionGate::new(backend.clone());
        Self {
            shared: Arc::new(Shared {
                backend,
                catalog,
                gate,
                events,
                config,
                inner: Mutex::new(Inner::new()),
            }),
        }
    }

    pub fn catalog(&self) -> &DeviceCatalog<B> {
        &self.shared.catalog
    }

    pub fn gate(&self) -> &PermissionGate<B> {
        &self.shared.gate
    }

    pub fn config(&self) -> &LinkConfig {
        &self.shared.config
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.inner.lock().ctx.state
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        let inner = self.shared.inner.lock();
        let state = inner.ctx.state;
        ConnectionSnapshot {
            state,
            is_connected: state == ConnectionState::Connected,
            is_connecting: state.is_in_flight() && state != ConnectionState::Disconnecting,
            device_info: inner.device.clone(),
        }
    }

    pub fn is_reconnecting(&self) -> bool {
        self.shared.inner.lock().reconnecting
    }

    /// Start connecting to `target`.
    ///
    /// Rejected while another attempt is in flight. An established link to a
    /// different device is torn down first. Everything after admission
    /// (permission, open, claim, handshake) settles through the ticket.
    #[instrument(level = "info", skip(self, target), fields(target = %target))]
    pub fn connect(&self, target: &DeviceRef) -> Result<ConnectTicket, LinkError> {
        {
            let mut inner = self.shared.inner.lock();
            if inner.ctx.state.is_in_flight() {
                return Err(LinkError::ConnectionInProgress);
            }
            inner.reconnect_epoch += 1;
        }
        let device = self
            .shared
            .catalog
            .find(target)
            .ok_or_else(|| LinkError::DeviceNotFound(target.to_string()))?;
        self.shared.connect_device(device)
    }

    /// Tear the link down. Returns whether there was anything to tear down.
    pub fn disconnect(&self) -> bool {
        self.shared.inner.lock().reconnect_epoch += 1;
        self.shared.release(
            None,
            ConnectionState::Idle,
            LinkError::ConnectionFailed("disconnected by request".into()),
            "Disconnected",
        )
    }

    /// Disconnect, stop reconnection and forget every permission record.
    pub fn shutdown(&self) {
        self.disconnect();
        self.shared.gate.clear();
        info!("Link shut down");
    }

    /// OS answer to a permission prompt.
    pub fn on_permission_result(&self, key: &DeviceKey, granted: bool) {
        self.shared.gate.on_permission_result(key, granted);
        self.shared.resume_after_permission(key, granted);
    }

    pub fn on_attached(&self, device: DeviceDescriptor) {
        self.shared.events.push(LinkEvent::DeviceAttached(device));
    }

    /// A device went away. Tears the link down if it was ours and, for
    /// accessories, starts the reconnection run.
    pub fn on_detached(&self, key: &DeviceKey) {
        let current = {
            let inner = self.shared.inner.lock();
            inner
                .device
                .as_ref()
                .filter(|d| d.key() == *key)
                .map(|d| (inner.ctx.generation, d.transport))
        };

        if let Some((generation, transport)) = current {
            self.shared.release(
                Some(generation),
                ConnectionState::Idle,
                LinkError::ConnectionFailed("device detached".into()),
                "Device detached, disconnected",
            );
            if transport == TransportKind::Accessory {
                self.shared.start_reconnect();
            }
        }
        self.shared.events.push(LinkEvent::DeviceDetached(key.clone()));
    }

    /// Write `data` to the preferred OUT endpoint.
    #[instrument(level = "debug", skip(self, data), fields(len = data.len()))]
    pub fn send_bulk_data(&self, data: &[u8]) -> Result<usize, LinkError> {
        let (transport, endpoints) = self.shared.connected_link()?;
        let endpoint = endpoints.write_endpoint()?;
        let written = transport
            .write(&endpoint, data, self.shared.config.write_timeout())
            .map_err(LinkError::from_transfer)?;
        self.shared
            .log(LogLevel::Debug, format!("Sent {} bytes", written));
        Ok(written)
    }

    pub fn bulk_transfer(&self, request: TransferRequest) -> Result<bool, LinkError> {
        self.shared.transfer(
            TransferKind::Bulk,
            request,
            DEFAULT_BULK_ENDPOINT,
            self.shared.config.write_timeout(),
        )
    }

    pub fn interrupt_transfer(&self, request: TransferRequest) -> Result<bool, LinkError> {
        self.shared.transfer(
            TransferKind::Interrupt,
            request,
            DEFAULT_INTERRUPT_ENDPOINT,
            self.shared.config.interrupt_timeout(),
        )
    }

    /// Frame `payload` under `message_id` and write it, retrying failed
    /// writes.
    #[instrument(level = "debug", skip(self, payload), fields(len = payload.len()))]
    pub fn send_protocol_data(&self, message_id: u8, payload: &[u8]) -> Result<bool, LinkError> {
        self.shared.send_protocol_data(message_id, payload)
    }
}

struct Released<T> {
    device: Option<DeviceDescriptor>,
    transport: Option<Arc<T>>,
    reader: Option<ReaderHandle>,
    pending: Option<oneshot::Sender<ConnectResult>>,
}

impl<B: DeviceBackend> Shared<B> {
    fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.events.push(LinkEvent::log(level, message));
    }

    fn reader_config(&self) -> ReaderConfig {
        ReaderConfig {
            read_timeout: self.config.read_timeout(),
            error_backoff: self.config.error_backoff(),
            max_consecutive_errors: self.config.max_consecutive_errors,
        }
    }

    fn connect_device(self: &Arc<Self>, device: DeviceDescriptor) -> Result<ConnectTicket, LinkError> {
        if self.inner.lock().ctx.state == ConnectionState::Connected {
            self.release(
                None,
                ConnectionState::Idle,
                LinkError::ConnectionFailed("replaced by a new connection".into()),
                "Disconnected previous device",
            );
        }

        let granted = self.gate.is_granted(&device);
        let (tx, rx) = oneshot::channel();
        let generation = {
            let mut inner = self.inner.lock();
            if inner.ctx.state.is_in_flight() || inner.ctx.state == ConnectionState::Connected {
                return Err(LinkError::ConnectionInProgress);
            }
            let generation = inner.ctx.bump_generation();
            inner.init_scanner.reset();
            inner.device = Some(device.clone());
            inner.pending = Some(tx);
            inner.ctx.goto_state(if granted {
                ConnectionState::Opening
            } else {
                ConnectionState::RequestingPermission
            });
            generation
        };

        if granted {
            self.open_and_claim(generation);
            return Ok(ConnectTicket { rx });
        }

        self.log(
            LogLevel::Info,
            format!("Requesting permission for {}", device.display_name()),
        );
        match self.gate.request_permission(&device) {
            Ok(PermissionOutcome::Granted) => self.open_and_claim(generation),
            // The answer arrives through `resume_after_permission`
            Ok(PermissionOutcome::Pending(_)) => {}
            Err(e) => {
                self.release(Some(generation), ConnectionState::Idle, e, "Permission request failed");
            }
        }
        Ok(ConnectTicket { rx })
    }

    fn resume_after_permission(self: &Arc<Self>, key: &DeviceKey, granted: bool) {
        let generation = {
            let inner = self.inner.lock();
            match &inner.device {
                Some(d)
                    if inner.ctx.state == ConnectionState::RequestingPermission
                        && d.key() == *key =>
                {
                    inner.ctx.generation
                }
                _ => return,
            }
        };

        if granted {
            self.log(LogLevel::Info, format!("Permission granted for {}", key));
            self.open_and_claim(generation);
        } else {
            self.release(
                Some(generation),
                ConnectionState::Idle,
                LinkError::PermissionDenied(key.to_string()),
                "Permission denied",
            );
        }
    }

    fn open_and_claim(self: &Arc<Self>, generation: u64) {
        let device = {
            let mut inner = self.inner.lock();
            if !inner.is_current(generation) {
                return;
            }
            if inner.ctx.state != ConnectionState::Opening {
                inner.ctx.goto_state(ConnectionState::Opening);
            }
            match inner.device.clone() {
                Some(d) => d,
                None => return,
            }
        };

        let transport = match self.backend.open(&device) {
            Ok(t) => Arc::new(t),
            Err(e) => {
                self.release(
                    Some(generation),
                    ConnectionState::Failed,
                    LinkError::ConnectionFailed(e.to_string()),
                    "Failed to open device",
                );
                return;
            }
        };

        {
            let mut inner = self.inner.lock();
            if !inner.is_current(generation) {
                drop(inner);
                let _ = transport.close();
                return;
            }
            inner.ctx.goto_state(ConnectionState::Claiming);
            inner.transport = Some(transport.clone());
        }

        let interface = match transport.claim_interface(self.config.interface_number) {
            Ok(i) => i,
            Err(e) => {
                self.release(
                    Some(generation),
                    ConnectionState::Failed,
                    LinkError::ConnectionFailed(e.to_string()),
                    "Failed to claim interface",
                );
                return;
            }
        };

        let endpoints = EndpointSet::from_interface(&interface);
        if endpoints.is_empty() {
            self.log(
                LogLevel::Warn,
                format!(
                    "No standard endpoints found on interface {}; device may use control transfers only",
                    interface.number
                ),
            );
        }
        let read_endpoint = endpoints.read_endpoint();
        let handshake = self.config.requires_handshake && read_endpoint.is_ok();

        {
            let mut inner = self.inner.lock();
            if !inner.is_current(generation) {
                return;
            }
            inner.endpoints = endpoints;
            if handshake {
                inner.ctx.goto_state(ConnectionState::AwaitingHandshake);
                inner.handshake_deadline = Some(Instant::now() + self.config.handshake_timeout());
            }
        }

        if handshake {
            self.events.push(LinkEvent::WaitingForInit);
        } else {
            self.reach_connected(generation);
        }

        match read_endpoint {
            Ok(endpoint) => self.start_reader(generation, transport, endpoint),
            Err(_) => self.log(LogLevel::Info, "No IN endpoint available for reading"),
        }
    }

    fn start_reader(
        self: &Arc<Self>,
        generation: u64,
        transport: Arc<B::Transport>,
        endpoint: crate::device::EndpointDescriptor,
    ) {
        let handler = Arc::new(LinkInbound {
            shared: Arc::downgrade(self),
            generation,
        });
        match ReaderHandle::spawn(transport, endpoint, self.reader_config(), handler) {
            Ok(handle) => {
                let mut inner = self.inner.lock();
                if inner.is_current(generation) {
                    inner.reader = Some(handle);
                }
                // A stale handle stops when dropped
            }
            Err(e) => {
                self.release(
                    Some(generation),
                    ConnectionState::Failed,
                    LinkError::ConnectionError(e.to_string()),
                    "Failed to start read loop",
                );
            }
        }
    }

    fn reach_connected(&self, generation: u64) {
        let (device, pending) = {
            let mut inner = self.inner.lock();
            if !inner.is_current(generation) {
                return;
            }
            inner.ctx.goto_state(ConnectionState::Connected);
            inner.handshake_deadline = None;
            (inner.device.clone(), inner.pending.take())
        };
        let Some(device) = device else {
            return;
        };

        self.events.push(LinkEvent::ConnectionStatus(true));
        self.events.push(LinkEvent::DeviceAttached(device.clone()));
        self.log(
            LogLevel::Info,
            format!("Connected to {}", device.display_name()),
        );
        if let Some(tx) = pending {
            let _ = tx.send(Ok(device));
        }
    }

    /// Tear down whatever the link holds and settle a pending caller with
    /// `error`. With `generation` set, only acts if that attempt is still the
    /// current one. Teardown errors are logged, never propagated.
    fn release(
        &self,
        generation: Option<u64>,
        final_state: ConnectionState,
        error: LinkError,
        message: &str,
    ) -> bool {
        let released = {
            let mut inner = self.inner.lock();
            if generation.is_some_and(|g| !inner.is_current(g)) {
                return false;
            }
            let active =
                inner.device.is_some() || inner.transport.is_some() || inner.pending.is_some();
            if !active {
                if inner.ctx.state == ConnectionState::Failed {
                    inner.ctx.goto_state(ConnectionState::Idle);
                }
                return false;
            }

            inner.ctx.bump_generation();
            inner.endpoints = EndpointSet::default();
            inner.handshake_deadline = None;
            inner.init_scanner.reset();
            let released = Released {
                device: inner.device.take(),
                transport: inner.transport.take(),
                reader: inner.reader.take(),
                pending: inner.pending.take(),
            };
            if released.transport.is_some() {
                inner.ctx.goto_state(ConnectionState::Disconnecting);
            } else {
                inner.ctx.goto_state(final_state);
            }
            released
        };

        if let Some(reader) = released.reader {
            reader.stop_and_join();
        }
        if let Some(transport) = released.transport {
            if let Err(e) = transport.release_interface() {
                warn!(error = %e, "Error releasing interface");
            }
            if let Err(e) = transport.close() {
                warn!(error = %e, "Error closing device");
            }
            self.inner.lock().ctx.goto_state(final_state);
        }

        let name = released
            .device
            .as_ref()
            .map(|d| d.display_name().to_string())
            .unwrap_or_default();
        self.events.push(LinkEvent::ConnectionStatus(false));
        let level = if final_state == ConnectionState::Failed {
            LogLevel::Error
        } else {
            LogLevel::Info
        };
        self.log(level, format!("{} {}: {}", message, name, error));
        if let Some(tx) = released.pending {
            let _ = tx.send(Err(error));
        }
        true
    }

    fn handshake_expired(&self, generation: u64) -> bool {
        let inner = self.inner.lock();
        inner.is_current(generation)
            && inner.ctx.state == ConnectionState::AwaitingHandshake
            && inner
                .handshake_deadline
                .is_some_and(|deadline| Instant::now() >= deadline)
    }

    fn check_handshake_deadline(&self, generation: u64) -> bool {
        if !self.handshake_expired(generation) {
            return false;
        }
        self.release(
            Some(generation),
            ConnectionState::Idle,
            LinkError::InitHandshakeTimeout {
                timeout_ms: self.config.handshake_timeout_ms,
            },
            "Init handshake timed out",
        );
        true
    }

    fn on_inbound(&self, generation: u64, chunk: &[u8]) {
        if self.check_handshake_deadline(generation) {
            return;
        }
        let (state, announced, transport, write_endpoint) = {
            let mut inner = self.inner.lock();
            if !inner.is_current(generation) {
                return;
            }
            (
                inner.ctx.state,
                inner.init_scanner.feed(chunk),
                inner.transport.clone(),
                inner.endpoints.write_endpoint(),
            )
        };

        self.events
            .push(LinkEvent::DataReceived(render_inbound(chunk)));

        if !announced
            || !matches!(
                state,
                ConnectionState::AwaitingHandshake | ConnectionState::Connected
            )
        {
            return;
        }

        let (Some(transport), Ok(endpoint)) = (transport, write_endpoint) else {
            self.log(
                LogLevel::Error,
                "Init sequence received but there is no OUT endpoint to answer on",
            );
            return;
        };
        match transport.write(&endpoint, INIT_RESPONSE.bytes(), self.config.write_timeout()) {
            Ok(_) => {
                info!(response = %INIT_RESPONSE, "Answered init sequence");
                if state == ConnectionState::AwaitingHandshake {
                    self.reach_connected(generation);
                }
            }
            Err(e) => self.log(
                LogLevel::Error,
                format!("Failed to answer init sequence: {}", e),
            ),
        }
    }

    /// A lost accessory session counts as a detach even when no platform
    /// event reports it.
    fn on_read_escalation(self: &Arc<Self>, generation: u64, errors: u32, last: &TransportError) {
        let accessory = self
            .inner
            .lock()
            .device
            .as_ref()
            .is_some_and(|d| d.transport == TransportKind::Accessory);
        let released = self.release(
            Some(generation),
            ConnectionState::Idle,
            LinkError::ConnectionFailed(format!("{} consecutive read errors ({})", errors, last)),
            "Too many consecutive transfer errors, disconnected",
        );
        if released && accessory && matches!(last, TransportError::Disconnected) {
            self.start_reconnect();
        }
    }

    fn start_reconnect(self: &Arc<Self>) {
        let epoch = {
            let mut inner = self.inner.lock();
            if inner.reconnecting {
                return;
            }
            inner.reconnecting = true;
            inner.reconnect_epoch
        };
        let attempts = self.config.reconnect_attempts;
        let interval = self.config.reconnect_interval();
        let weak = Arc::downgrade(self);

        let spawned = thread::Builder::new()
            .name("vendorlink-reconnect".into())
            .spawn(move || reconnect_run(weak, epoch, attempts, interval));
        if let Err(e) = spawned {
            warn!(error = %e, "Could not start reconnection");
            self.inner.lock().reconnecting = false;
        }
    }

    fn reconnect_cancelled(&self, epoch: u64) -> bool {
        self.inner.lock().reconnect_epoch != epoch
    }

    fn connected_link(&self) -> Result<(Arc<B::Transport>, EndpointSet), LinkError> {
        let inner = self.inner.lock();
        if inner.ctx.state != ConnectionState::Connected {
            return Err(LinkError::NotConnected);
        }
        let transport = inner.transport.clone().ok_or(LinkError::NotConnected)?;
        Ok((transport, inner.endpoints))
    }

    fn transfer(
        &self,
        kind: TransferKind,
        request: TransferRequest,
        default_endpoint: u8,
        default_timeout: Duration,
    ) -> Result<bool, LinkError> {
        let data = request
            .data
            .ok_or_else(|| LinkError::InvalidArguments("Data required".into()))?;
        let (transport, endpoints) = self.connected_link()?;
        let address = request.endpoint.unwrap_or(default_endpoint);
        let endpoint = endpoints.for_transfer(kind, address)?;
        let timeout = request
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(default_timeout);

        let outcome = match endpoint.direction {
            Direction::In => {
                let len = if data.is_empty() {
                    usize::from(endpoint.max_packet_size)
                } else {
                    data.len()
                };
                let bytes = transport
                    .read(&endpoint, len, timeout)
                    .map_err(LinkError::from_transfer)?;
                if bytes.is_empty() {
                    return Err(LinkError::TransferFailed(format!(
                        "no data within {}ms",
                        timeout.as_millis()
                    )));
                }
                TransferOutcome {
                    endpoint: address,
                    bytes_transferred: bytes.len(),
                    success: true,
                    data: Some(bytes),
                }
            }
            Direction::Out => {
                let written = transport
                    .write(&endpoint, &data, timeout)
                    .map_err(LinkError::from_transfer)?;
                TransferOutcome {
                    endpoint: address,
                    bytes_transferred: written,
                    success: true,
                    data: None,
                }
            }
        };

        debug!(kind = %kind, endpoint = %format!("0x{:02X}", address), bytes = outcome.bytes_transferred, "Transfer done");
        self.events.push(match kind {
            TransferKind::Interrupt => LinkEvent::InterruptTransferResult(outcome),
            _ => LinkEvent::BulkTransferResult(outcome),
        });
        Ok(true)
    }

    fn send_protocol_data(&self, message_id: u8, payload: &[u8]) -> Result<bool, LinkError> {
        let report_error = |err: LinkError, frame_len: usize| -> Result<bool, LinkError> {
            self.events.push(LinkEvent::ProtocolDataError(ProtocolSend {
                message_id,
                frame_len,
                attempts: 0,
                error: Some(err.to_string()),
            }));
            Err(err)
        };

        let frame = match encode(message_id, payload) {
            Ok(frame) => frame,
            Err(e) => return report_error(e.into(), 0),
        };
        let link = self
            .connected_link()
            .and_then(|(t, eps)| eps.write_endpoint().map(|ep| (t, ep)));
        let (transport, endpoint) = match link {
            Ok(link) => link,
            Err(e) => return report_error(e, frame.len()),
        };

        let attempts = 1 + self.config.protocol_write_retries;
        let mut last_error = None;
        for attempt in 1..=attempts {
            match transport.write(&endpoint, &frame, self.config.write_timeout()) {
                Ok(_) => {
                    self.events.push(LinkEvent::ProtocolDataSent(ProtocolSend {
                        message_id,
                        frame_len: frame.len(),
                        attempts: attempt,
                        error: None,
                    }));
                    return Ok(true);
                }
                Err(e) => {
                    warn!(attempt, error = %e, "Protocol frame write failed");
                    last_error = Some(e);
                }
            }
        }

        let err = last_error
            .map(LinkError::from_transfer)
            .unwrap_or_else(|| LinkError::TransferFailed("no write attempted".into()));
        self.events.push(LinkEvent::ProtocolDataFailed(ProtocolSend {
            message_id,
            frame_len: frame.len(),
            attempts,
            error: Some(err.to_string()),
        }));
        Err(err)
    }
}

fn reconnect_run<B: DeviceBackend>(
    weak: Weak<Shared<B>>,
    epoch: u64,
    attempts: u32,
    interval: Duration,
) {
    for attempt in 1..=attempts {
        thread::sleep(interval);
        let Some(shared) = weak.upgrade() else {
            return;
        };
        if shared.reconnect_cancelled(epoch) {
            debug!("Reconnection cancelled");
            shared.inner.lock().reconnecting = false;
            return;
        }

        shared.log(
            LogLevel::Info,
            format!("Reconnection attempt {}/{}", attempt, attempts),
        );
        let Some(device) = shared.catalog.find_compatible_accessory() else {
            debug!(attempt, "No compatible accessory visible");
            continue;
        };
        match shared.connect_device(device).map(ConnectTicket::blocking_wait) {
            Ok(Ok(device)) => {
                info!(device = %device.display_name(), "Reconnected");
                shared.inner.lock().reconnecting = false;
                return;
            }
            Ok(Err(e)) | Err(e) => debug!(attempt, error = %e, "Reconnection attempt failed"),
        }
    }

    if let Some(shared) = weak.upgrade() {
        shared.log(
            LogLevel::Warn,
            format!("Reconnection gave up after {} attempts", attempts),
        );
        shared.inner.lock().reconnecting = false;
    }
}

/// Read loop callbacks bound to one connection generation.
struct LinkInbound<B: DeviceBackend> {
    shared: Weak<Shared<B>>,
    generation: u64,
}

impl<B: DeviceBackend> InboundHandler for LinkInbound<B> {
    fn on_chunk(&self, chunk: &[u8]) {
        if let Some(shared) = self.shared.upgrade() {
            shared.on_inbound(self.generation, chunk);
        }
    }

    fn on_idle(&self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.check_handshake_deadline(self.generation);
        }
    }

    fn on_escalation(&self, errors: u32, last: &TransportError) {
        if let Some(shared) = self.shared.upgrade() {
            shared.on_read_escalation(self.generation, errors, last);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::EndpointDescriptor;
    use crate::events::{ChannelSink, EventRecord};
    use crate::protocol::constants::{HANDSHAKE_REQUEST, HANDSHAKE_RESPONSE};
    use crate::transport::MockBackend;
    use crate::transport::mock::MockRead;
    use std::sync::atomic::Ordering;

    struct Harness {
        backend: Arc<MockBackend>,
        link: ConnectionSupervisor<MockBackend>,
        rx: async_channel::Receiver<EventRecord>,
    }

    impl Harness {
        fn new(config: LinkConfig) -> Self {
            let backend = Arc::new(MockBackend::new());
            let (sink, rx) = ChannelSink::unbounded();
            let events = Arc::new(ReadinessBuffer::new(Arc::new(sink)));
            events.mark_ready();
            let link = ConnectionSupervisor::new(backend.clone(), config, events);
            Self { backend, link, rx }
        }

        fn events(&self) -> Vec<LinkEvent> {
            std::iter::from_fn(|| self.rx.try_recv().ok())
                .map(|r| r.event)
                .collect()
        }

        fn key_of(&self, device_id: u32) -> DeviceKey {
            self.link
                .catalog()
                .find(&DeviceRef::Id { device_id })
                .unwrap()
                .key()
        }
    }

    fn config() -> LinkConfig {
        LinkConfig {
            read_timeout_ms: 5,
            error_backoff_ms: 1,
            handshake_timeout_ms: 300,
            reconnect_interval_ms: 20,
            ..Default::default()
        }
    }

    fn bulk_pair() -> Vec<EndpointDescriptor> {
        vec![
            EndpointDescriptor::new(0x81, TransferKind::Bulk, 64),
            EndpointDescriptor::new(0x02, TransferKind::Bulk, 64),
        ]
    }

    fn id(device_id: u32) -> DeviceRef {
        DeviceRef::Id { device_id }
    }

    fn wait_for(what: &str, cond: impl Fn() -> bool) {
        let start = Instant::now();
        while !cond() {
            assert!(start.elapsed() < Duration::from_secs(5), "timed out waiting for {}", what);
            thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn test_connect_granted_device() {
        let h = Harness::new(config());
        h.backend.add_usb_device(1, 0x1234, 0x0001, bulk_pair());
        h.backend.grant(1);

        let device = h.link.connect(&id(1)).unwrap().blocking_wait().unwrap();
        assert_eq!(device.device_id, 1);
        assert_eq!(h.link.state(), ConnectionState::Connected);
        assert_eq!(h.backend.open_handles(), 1);
        assert_eq!(h.backend.prompts(), 0);

        let events = h.events();
        let status = events
            .iter()
            .position(|e| *e == LinkEvent::ConnectionStatus(true))
            .unwrap();
        assert!(matches!(events[status + 1], LinkEvent::DeviceAttached(_)));

        let snapshot = h.link.snapshot();
        assert!(snapshot.is_connected);
        assert!(!snapshot.is_connecting);
        assert_eq!(snapshot.device_info.map(|d| d.device_id), Some(1));
    }

    #[test]
    fn test_unknown_device() {
        let h = Harness::new(config());
        assert!(matches!(
            h.link.connect(&id(42)),
            Err(LinkError::DeviceNotFound(_))
        ));
    }

    #[test]
    fn test_five_consecutive_errors_disconnect() {
        let h = Harness::new(config());
        let link = h.backend.add_usb_device(1, 0x1234, 0x0001, bulk_pair());
        h.backend.grant(1);
        link.queue_errors(5);

        h.link.connect(&id(1)).unwrap().blocking_wait().unwrap();
        wait_for("teardown", || {
            h.link.state() == ConnectionState::Idle && h.backend.open_handles() == 0
        });
        assert_eq!(link.reads_served(), 5);
        assert!(h.events().contains(&LinkEvent::ConnectionStatus(false)));
    }

    #[test]
    fn test_four_errors_then_success_stay_connected() {
        let h = Harness::new(config());
        let link = h.backend.add_usb_device(1, 0x1234, 0x0001, bulk_pair());
        h.backend.grant(1);
        link.queue_errors(4);
        link.queue_data(b"ok");
        link.queue_errors(4);

        h.link.connect(&id(1)).unwrap().blocking_wait().unwrap();
        wait_for("script drained", || link.pending_reads() == 0);
        thread::sleep(Duration::from_millis(30));

        assert_eq!(h.link.state(), ConnectionState::Connected);
        assert_eq!(h.backend.open_handles(), 1);
    }

    #[test]
    fn test_handshake_completes_connection() {
        let h = Harness::new(LinkConfig {
            requires_handshake: true,
            ..config()
        });
        let link = h.backend.add_usb_device(1, 0x1234, 0x0001, bulk_pair());
        h.backend.grant(1);

        let ticket = h.link.connect(&id(1)).unwrap();
        assert_eq!(h.link.state(), ConnectionState::AwaitingHandshake);
        assert!(h.events().contains(&LinkEvent::WaitingForInit));

        link.queue_data(&HANDSHAKE_REQUEST);
        ticket.blocking_wait().unwrap();

        assert_eq!(h.link.state(), ConnectionState::Connected);
        assert_eq!(link.writes(), vec![(0x02, HANDSHAKE_RESPONSE.to_vec())]);
    }

    #[test]
    fn test_handshake_split_across_reads() {
        let h = Harness::new(LinkConfig {
            requires_handshake: true,
            ..config()
        });
        let link = h.backend.add_usb_device(1, 0x1234, 0x0001, bulk_pair());
        h.backend.grant(1);

        let ticket = h.link.connect(&id(1)).unwrap();
        link.queue_data(&HANDSHAKE_REQUEST[..2]);
        link.queue_data(&HANDSHAKE_REQUEST[2..]);
        ticket.blocking_wait().unwrap();

        assert_eq!(h.link.state(), ConnectionState::Connected);
        assert_eq!(link.writes(), vec![(0x02, HANDSHAKE_RESPONSE.to_vec())]);
    }

    #[test]
    fn test_other_sequence_does_not_complete_handshake() {
        let h = Harness::new(LinkConfig {
            requires_handshake: true,
            ..config()
        });
        let link = h.backend.add_usb_device(1, 0x1234, 0x0001, bulk_pair());
        h.backend.grant(1);

        let ticket = h.link.connect(&id(1)).unwrap();
        link.queue_data(&[0xFF, 0x55, 0x02, 0x00, 0xEE, 0x11]);
        wait_for("chunk read", || link.pending_reads() == 0);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(h.link.state(), ConnectionState::AwaitingHandshake);
        assert!(link.writes().is_empty());

        assert_eq!(
            ticket.blocking_wait(),
            Err(LinkError::InitHandshakeTimeout { timeout_ms: 300 })
        );
        wait_for("teardown", || h.backend.open_handles() == 0);
        assert_eq!(h.link.state(), ConnectionState::Idle);
    }

    #[test]
    fn test_handshake_skipped_without_in_endpoint() {
        let h = Harness::new(LinkConfig {
            requires_handshake: true,
            ..config()
        });
        h.backend.add_usb_device(
            1,
            0x1234,
            0x0001,
            vec![EndpointDescriptor::new(0x02, TransferKind::Bulk, 64)],
        );
        h.backend.grant(1);

        h.link.connect(&id(1)).unwrap().blocking_wait().unwrap();
        assert_eq!(h.link.state(), ConnectionState::Connected);
        assert!(!h.events().contains(&LinkEvent::WaitingForInit));
    }

    #[test]
    fn test_connect_replaces_existing_connection() {
        let h = Harness::new(config());
        h.backend.add_usb_device(1, 0x1234, 0x0001, bulk_pair());
        h.backend.add_usb_device(2, 0x1234, 0x0002, bulk_pair());
        h.backend.grant(1);
        h.backend.grant(2);

        h.link.connect(&id(1)).unwrap().blocking_wait().unwrap();
        h.link.connect(&id(2)).unwrap().blocking_wait().unwrap();

        assert_eq!(h.backend.open_log(), vec![1, 2]);
        assert_eq!(h.backend.max_open_handles(), 1);
        assert_eq!(h.backend.open_handles(), 1);
        assert_eq!(h.link.snapshot().device_info.map(|d| d.device_id), Some(2));
    }

    #[test]
    fn test_connect_rejected_while_requesting_permission() {
        let h = Harness::new(config());
        h.backend.add_usb_device(1, 0x1234, 0x0001, bulk_pair());

        let _ticket = h.link.connect(&id(1)).unwrap();
        assert_eq!(h.link.state(), ConnectionState::RequestingPermission);
        assert!(h.link.snapshot().is_connecting);
        assert_eq!(h.link.connect(&id(1)).unwrap_err(), LinkError::ConnectionInProgress);
        assert_eq!(h.backend.prompts(), 1);
    }

    #[test]
    fn test_permission_grant_resumes_connect() {
        let h = Harness::new(config());
        h.backend.add_usb_device(1, 0x1234, 0x0001, bulk_pair());

        let ticket = h.link.connect(&id(1)).unwrap();
        assert_eq!(h.backend.open_handles(), 0);

        h.link.on_permission_result(&h.key_of(1), true);
        ticket.blocking_wait().unwrap();
        assert_eq!(h.link.state(), ConnectionState::Connected);
    }

    #[test]
    fn test_permission_denied() {
        let h = Harness::new(config());
        h.backend.add_usb_device(1, 0x1234, 0x0001, bulk_pair());

        let ticket = h.link.connect(&id(1)).unwrap();
        h.link.on_permission_result(&h.key_of(1), false);

        assert!(matches!(
            ticket.blocking_wait(),
            Err(LinkError::PermissionDenied(_))
        ));
        assert_eq!(h.link.state(), ConnectionState::Idle);
        assert_eq!(h.backend.open_handles(), 0);
        assert!(h.events().contains(&LinkEvent::ConnectionStatus(false)));
    }

    #[test]
    fn test_prompt_failure_settles_ticket() {
        let h = Harness::new(config());
        h.backend.add_usb_device(1, 0x1234, 0x0001, bulk_pair());
        h.backend.set_fail_prompt(true);

        let ticket = h.link.connect(&id(1)).unwrap();
        assert!(matches!(
            ticket.blocking_wait(),
            Err(LinkError::PermissionError(_))
        ));
        assert_eq!(h.link.state(), ConnectionState::Idle);
    }

    #[test]
    fn test_open_failure_then_retry() {
        let h = Harness::new(config());
        h.backend.add_usb_device(1, 0x1234, 0x0001, bulk_pair());
        h.backend.grant(1);
        let device = h.backend.device(1).unwrap();
        device.fail_open.store(true, Ordering::SeqCst);

        let result = h.link.connect(&id(1)).unwrap().blocking_wait();
        assert!(matches!(result, Err(LinkError::ConnectionFailed(_))));
        assert_eq!(h.link.state(), ConnectionState::Failed);

        device.fail_open.store(false, Ordering::SeqCst);
        h.link.connect(&id(1)).unwrap().blocking_wait().unwrap();
        assert_eq!(h.link.state(), ConnectionState::Connected);
    }

    #[test]
    fn test_claim_failure_closes_handle() {
        let h = Harness::new(config());
        h.backend.add_usb_device(1, 0x1234, 0x0001, bulk_pair());
        h.backend.grant(1);
        h.backend.device(1).unwrap().fail_claim.store(true, Ordering::SeqCst);

        let result = h.link.connect(&id(1)).unwrap().blocking_wait();
        assert!(matches!(result, Err(LinkError::ConnectionFailed(_))));
        assert_eq!(h.link.state(), ConnectionState::Failed);
        assert_eq!(h.backend.open_handles(), 0);
    }

    #[test]
    fn test_device_without_endpoints_stays_connected() {
        let h = Harness::new(config());
        let link = h.backend.add_usb_device(1, 0x1234, 0x0001, Vec::new());
        h.backend.grant(1);

        h.link.connect(&id(1)).unwrap().blocking_wait().unwrap();
        assert_eq!(h.link.state(), ConnectionState::Connected);
        assert!(h.events().iter().any(|e| matches!(
            e,
            LinkEvent::Log { level: LogLevel::Warn, .. }
        )));
        thread::sleep(Duration::from_millis(20));
        assert_eq!(link.reads_served(), 0);
        assert_eq!(h.link.send_bulk_data(b"x"), Err(LinkError::NoEndpointAvailable("output".into())));
    }

    #[test]
    fn test_transfers_need_connection() {
        let h = Harness::new(config());
        assert_eq!(h.link.send_bulk_data(b"x"), Err(LinkError::NotConnected));
        assert_eq!(
            h.link.bulk_transfer(TransferRequest::out(b"x".to_vec())),
            Err(LinkError::NotConnected)
        );
        assert_eq!(
            h.link.bulk_transfer(TransferRequest::default()),
            Err(LinkError::InvalidArguments("Data required".into()))
        );
    }

    #[test]
    fn test_bulk_and_interrupt_transfer() {
        let h = Harness::new(config());
        let link = h.backend.add_usb_device(1, 0x1234, 0x0001, bulk_pair());
        h.backend.grant(1);
        h.link.connect(&id(1)).unwrap().blocking_wait().unwrap();
        h.events();

        assert_eq!(h.link.send_bulk_data(b"Hello"), Ok(5));
        assert_eq!(h.link.bulk_transfer(TransferRequest::out(b"hi".to_vec())), Ok(true));
        assert_eq!(
            link.writes(),
            vec![(0x02, b"Hello".to_vec()), (0x02, b"hi".to_vec())]
        );
        assert!(h.events().iter().any(|e| matches!(
            e,
            LinkEvent::BulkTransferResult(TransferOutcome { endpoint: 0x02, bytes_transferred: 2, .. })
        )));

        assert_eq!(
            h.link.interrupt_transfer(TransferRequest::out(vec![1])),
            Err(LinkError::NoEndpointAvailable("interrupt in".into()))
        );
    }

    #[test]
    fn test_send_protocol_data_retries_then_fails() {
        let h = Harness::new(config());
        let link = h.backend.add_usb_device(1, 0x1234, 0x0001, bulk_pair());
        h.backend.grant(1);
        h.link.connect(&id(1)).unwrap().blocking_wait().unwrap();
        h.events();

        assert_eq!(h.link.send_protocol_data(0x01, &[]), Ok(true));
        assert_eq!(
            link.written_bytes(),
            vec![vec![0xFF, 0x02, 0x00, 0x05, 0x01, 0xF9]]
        );

        link.set_fail_writes(true);
        assert!(matches!(
            h.link.send_protocol_data(0x01, b"abc"),
            Err(LinkError::TransferFailed(_))
        ));

        assert_eq!(
            h.link.send_protocol_data(0x01, &[0u8; 51]),
            Err(LinkError::PayloadTooLarge { len: 51, max: 50 })
        );

        let events = h.events();
        assert!(events.iter().any(|e| matches!(e, LinkEvent::ProtocolDataSent(s) if s.attempts == 1)));
        assert!(events.iter().any(|e| matches!(e, LinkEvent::ProtocolDataFailed(s) if s.attempts == 3)));
        assert!(events.iter().any(|e| matches!(e, LinkEvent::ProtocolDataError(_))));
    }

    #[test]
    fn test_inbound_data_reaches_consumer() {
        let h = Harness::new(config());
        let link = h.backend.add_usb_device(1, 0x1234, 0x0001, bulk_pair());
        h.backend.grant(1);
        h.link.connect(&id(1)).unwrap().blocking_wait().unwrap();

        link.queue_data(b"hello");
        let start = Instant::now();
        let mut seen = Vec::new();
        while !seen.iter().any(|e| matches!(e, LinkEvent::DataReceived(d) if d.text == "hello")) {
            assert!(start.elapsed() < Duration::from_secs(5));
            seen.extend(h.events());
            thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn test_detach_tears_down_before_reporting() {
        let h = Harness::new(config());
        h.backend.add_usb_device(1, 0x1234, 0x0001, bulk_pair());
        h.backend.grant(1);
        h.link.connect(&id(1)).unwrap().blocking_wait().unwrap();
        h.events();

        let key = h.key_of(1);
        h.link.on_detached(&key);

        assert_eq!(h.link.state(), ConnectionState::Idle);
        assert_eq!(h.backend.open_handles(), 0);
        assert!(!h.link.is_reconnecting());
        let events = h.events();
        let down = events
            .iter()
            .position(|e| *e == LinkEvent::ConnectionStatus(false))
            .unwrap();
        let detached = events
            .iter()
            .position(|e| *e == LinkEvent::DeviceDetached(key.clone()))
            .unwrap();
        assert!(down < detached);
    }

    #[test]
    fn test_accessory_reconnects_after_detach() {
        let h = Harness::new(config());
        h.backend.add_accessory(5, "SN-A", "com.zanis.vendor");

        h.link.connect(&id(5)).unwrap().blocking_wait().unwrap();
        h.link.on_detached(&h.key_of(5));

        wait_for("reconnect", || {
            h.link.state() == ConnectionState::Connected && !h.link.is_reconnecting()
        });
        assert_eq!(h.backend.open_log(), vec![5, 5]);
    }

    #[test]
    fn test_accessory_session_reconnects_after_peer_closes() {
        use crate::config::AccessoryEntry;
        use crate::events::PlatformEvent;
        use crate::transport::AccessoryBackend;
        use std::net::TcpListener;
        use std::sync::atomic::AtomicUsize;

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let accepts = Arc::new(AtomicUsize::new(0));
        let counter = accepts.clone();
        thread::spawn(move || {
            // First session is dropped at once, the next ones are held
            let mut held = Vec::new();
            for conn in listener.incoming() {
                let Ok(conn) = conn else { return };
                if counter.fetch_add(1, Ordering::SeqCst) > 0 {
                    held.push(conn);
                }
            }
        });

        let (platform_tx, platform_rx) = async_channel::unbounded();
        let entry = AccessoryEntry {
            manufacturer: "Zanis".into(),
            model: "Dock".into(),
            serial: "SN1".into(),
            address,
            protocols: Vec::new(),
        };
        let backend = Arc::new(AccessoryBackend::new(
            vec![entry],
            "com.zanis.vendor",
            platform_tx,
        ));
        let (sink, _rx) = ChannelSink::unbounded();
        let events = Arc::new(ReadinessBuffer::new(Arc::new(sink)));
        let link = ConnectionSupervisor::new(backend, config(), events);

        let pump = link.clone();
        thread::spawn(move || {
            while let Ok(event) = platform_rx.recv_blocking() {
                if let PlatformEvent::Detached(key) = event {
                    pump.on_detached(&key);
                }
            }
        });

        link.connect(&id(1)).unwrap().blocking_wait().unwrap();
        wait_for("reconnect", || {
            accepts.load(Ordering::SeqCst) == 2
                && link.state() == ConnectionState::Connected
                && !link.is_reconnecting()
        });
        assert_eq!(link.snapshot().device_info.map(|d| d.serial_number), Some("SN1".to_string()));
        link.shutdown();
    }

    #[test]
    fn test_lost_accessory_stream_reconnects_without_detach_event() {
        let h = Harness::new(config());
        let link = h.backend.add_accessory(5, "SN-A", "com.zanis.vendor");
        h.link.connect(&id(5)).unwrap().blocking_wait().unwrap();

        for _ in 0..5 {
            link.queue(MockRead::Lost);
        }
        wait_for("reconnect", || h.backend.open_log().len() == 2);
        wait_for("connected", || {
            h.link.state() == ConnectionState::Connected && !h.link.is_reconnecting()
        });
    }

    #[test]
    fn test_disconnect_cancels_reconnect() {
        let h = Harness::new(LinkConfig {
            reconnect_interval_ms: 100,
            ..config()
        });
        h.backend.add_accessory(5, "SN-A", "com.zanis.vendor");

        h.link.connect(&id(5)).unwrap().blocking_wait().unwrap();
        h.link.on_detached(&h.key_of(5));
        assert!(h.link.is_reconnecting());
        assert!(!h.link.disconnect());

        wait_for("reconnection to stop", || !h.link.is_reconnecting());
        assert_eq!(h.link.state(), ConnectionState::Idle);
        assert_eq!(h.backend.open_log(), vec![5]);
    }

    #[test]
    fn test_disconnect_during_permission_prompt() {
        let h = Harness::new(config());
        h.backend.add_usb_device(1, 0x1234, 0x0001, bulk_pair());

        let ticket = h.link.connect(&id(1)).unwrap();
        assert!(h.link.disconnect());
        assert!(matches!(
            ticket.blocking_wait(),
            Err(LinkError::ConnectionFailed(_))
        ));

        // A late grant must not reopen anything
        h.link.on_permission_result(&h.key_of(1), true);
        assert_eq!(h.link.state(), ConnectionState::Idle);
        assert_eq!(h.backend.open_handles(), 0);
    }

    #[test]
    fn test_shutdown_clears_permissions() {
        let h = Harness::new(config());
        h.backend.add_usb_device(1, 0x1234, 0x0001, bulk_pair());
        let key = h.key_of(1);
        h.link.gate().on_permission_result(&key, true);
        let dev = h.link.catalog().find(&id(1)).unwrap();
        assert!(h.link.gate().is_granted(&dev));

        h.link.shutdown();
        assert!(!h.link.gate().is_granted(&dev));
    }
}
