//! Per-device permission tracking.
//!
//! The OS answers a permission prompt asynchronously through a platform
//! broadcast. Waiters are parked in a request table and completed when the
//! matching result arrives.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, info, instrument, warn};

use crate::device::{DeviceDescriptor, DeviceKey};
use crate::error::LinkError;
use crate::transport::DeviceBackend;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(u64);

/// Completion handle for a permission prompt.
#[derive(Debug)]
pub struct PermissionTicket {
    id: RequestId,
    key: DeviceKey,
    rx: oneshot::Receiver<bool>,
}

impl PermissionTicket {
    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn key(&self) -> &DeviceKey {
        &self.key
    }

    fn resolve(key: DeviceKey, answer: Result<bool, oneshot::error::RecvError>) -> Result<(), LinkError> {
        match answer {
            Ok(true) => Ok(()),
            Ok(false) => Err(LinkError::PermissionDenied(key.to_string())),
            Err(_) => Err(LinkError::PermissionError(format!(
                "request for {} was abandoned",
                key
            ))),
        }
    }

    pub async fn wait(self) -> Result<(), LinkError> {
        let answer = self.rx.await;
        Self::resolve(self.key, answer)
    }

    /// Block the current thread until the OS answers. Must not be called from
    /// inside an async runtime.
    pub fn blocking_wait(self) -> Result<(), LinkError> {
        let answer = self.rx.blocking_recv();
        Self::resolve(self.key, answer)
    }
}

#[derive(Debug)]
pub enum PermissionOutcome {
    /// Already allowed; no prompt was shown.
    Granted,
    /// Prompt issued; the ticket completes with the user's answer.
    Pending(PermissionTicket),
}

impl PermissionOutcome {
    pub fn is_granted(&self) -> bool {
        matches!(self, PermissionOutcome::Granted)
    }
}

struct Waiter {
    key: DeviceKey,
    tx: oneshot::Sender<bool>,
}

#[derive(Default)]
struct GateState {
    records: HashMap<DeviceKey, bool>,
    pending: HashMap<RequestId, Waiter>,
    next_id: u64,
}

impl GateState {
    fn prompt_outstanding(&self, key: &DeviceKey) -> bool {
        self.pending.values().any(|w| w.key == *key)
    }
}

pub struct PermissionGate<B: DeviceBackend> {
    backend: Arc<B>,
    state: Mutex<GateState>,
}

impl<B: DeviceBackend> PermissionGate<B> {
    pub fn new(backend: Arc<B>) -> Self {
        Self {
            backend,
            state: Mutex::new(GateState::default()),
        }
    }

    /// Whether `device` may be opened right now, without prompting.
    pub fn is_granted(&self, device: &DeviceDescriptor) -> bool {
        let key = device.key();
        if self.state.lock().records.get(&key) == Some(&true) {
            return true;
        }
        if self.backend.has_permission(device) {
            self.state.lock().records.insert(key, true);
            return true;
        }
        false
    }

    /// Return immediately: granted, or pending on a freshly issued prompt.
    ///
    /// A second request for a device whose prompt is still open joins the
    /// outstanding prompt instead of showing another one.
    #[instrument(level = "debug", skip(self, device), fields(key = %device.key()))]
    pub fn request_permission(
        &self,
        device: &DeviceDescriptor,
    ) -> Result<PermissionOutcome, LinkError> {
        if self.is_granted(device) {
            debug!("Permission already granted");
            return Ok(PermissionOutcome::Granted);
        }

        let key = device.key();
        let (tx, rx) = oneshot::channel();
        let (id, prompt) = {
            let mut state = self.state.lock();
            let prompt = !state.prompt_outstanding(&key);
            state.next_id += 1;
            let id = RequestId(state.next_id);
            state.pending.insert(
                id,
                Waiter {
                    key: key.clone(),
                    tx,
                },
            );
            (id, prompt)
        };

        if prompt {
            info!("Requesting USB permission");
            if let Err(e) = self.backend.request_permission(device) {
                warn!(error = %e, "Permission prompt failed");
                self.state.lock().pending.remove(&id);
                return Err(LinkError::PermissionError(e.to_string()));
            }
        }

        Ok(PermissionOutcome::Pending(PermissionTicket { id, key, rx }))
    }

    /// Record the OS answer and complete every waiter for `key`. Returns the
    /// number of waiters completed.
    pub fn on_permission_result(&self, key: &DeviceKey, granted: bool) -> usize {
        let waiters: Vec<Waiter> = {
            let mut state = self.state.lock();
            state.records.insert(key.clone(), granted);
            let ids: Vec<RequestId> = state
                .pending
                .iter()
                .filter(|(_, w)| w.key == *key)
                .map(|(id, _)| *id)
                .collect();
            ids.iter().filter_map(|id| state.pending.remove(id)).collect()
        };

        info!(key = %key, granted = granted, waiters = waiters.len(), "Permission result");
        let count = waiters.len();
        for waiter in waiters {
            // Receiver may have given up
            let _ = waiter.tx.send(granted);
        }
        count
    }

    /// Forget every record and abandon outstanding prompts.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.records.clear();
        state.pending.clear();
    }

    pub fn pending_requests(&self) -> usize {
        self.state.lock().pending.len()
    }
}
