//! Connection lifecycle states.

use std::fmt;

use serde::Serialize;

/// Lifecycle of the single link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Idle,
    RequestingPermission,
    Opening,
    Claiming,
    AwaitingHandshake,
    Connected,
    Disconnecting,
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Idle => write!(f, "IDLE"),
            ConnectionState::RequestingPermission => write!(f, "REQUESTING_PERMISSION"),
            ConnectionState::Opening => write!(f, "OPENING"),
            ConnectionState::Claiming => write!(f, "CLAIMING"),
            ConnectionState::AwaitingHandshake => write!(f, "AWAITING_HANDSHAKE"),
            ConnectionState::Connected => write!(f, "CONNECTED"),
            ConnectionState::Disconnecting => write!(f, "DISCONNECTING"),
            ConnectionState::Failed => write!(f, "FAILED"),
        }
    }
}

impl ConnectionState {
    /// A connect attempt is underway; a new one must be rejected.
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            ConnectionState::RequestingPermission
                | ConnectionState::Opening
                | ConnectionState::Claiming
                | ConnectionState::AwaitingHandshake
                | ConnectionState::Disconnecting
        )
    }

    /// Whether `self -> next` is a legal step.
    pub fn can_transition_to(&self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (Idle | Failed, RequestingPermission | Opening) => true,
            (RequestingPermission, Opening | Idle) => true,
            (Opening, Claiming | Failed | Idle) => true,
            (Claiming, AwaitingHandshake | Connected | Failed | Disconnecting) => true,
            (AwaitingHandshake, Connected | Disconnecting) => true,
            (Connected, Disconnecting) => true,
            (Disconnecting, Idle | Failed) => true,
            // Reset from anywhere after a teardown
            (_, Idle) => true,
            _ => false,
        }
    }
}

/// State plus a generation counter that changes on every teardown.
///
/// Work started for one generation (a pending permission, a reconnection
/// attempt) checks the generation before acting and drops out if it moved.
#[derive(Debug, Default)]
pub struct StateMachineContext {
    pub state: ConnectionState,
    pub generation: u64,
}

impl StateMachineContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transition to a new state.
    pub fn goto_state(&mut self, new_state: ConnectionState) {
        if !self.state.can_transition_to(new_state) {
            tracing::warn!(from = %self.state, to = %new_state, "Unexpected state transition");
        }
        tracing::info!(from = %self.state, to = %new_state, "State transition");
        self.state = new_state;
    }

    pub fn bump_generation(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }
}
