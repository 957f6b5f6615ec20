//! Lifecycle state and network event queue
//!
//! The lifecycle state is an atomic enum read by many observers; the
//! event queue is a mutex-guarded FIFO drained by a single consumer.
//! Transitions are rare and small, events are frequent and ordered, so
//! the two stores are kept separate.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use tracing::{debug, warn};

/// System lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SystemState {
    /// No active connection, ready for a new one
    Idle = 0,

    /// Hole punching in progress
    Connecting = 1,

    /// Bidirectional path confirmed, tunnel up
    Connected = 2,

    /// Terminal state, system going down
    ShuttingDown = 3,
}

impl SystemState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Idle,
            1 => Self::Connecting,
            2 => Self::Connected,
            _ => Self::ShuttingDown,
        }
    }

    /// Whether moving from `self` to `next` is a legal lifecycle transition
    pub fn can_transition_to(self, next: SystemState) -> bool {
        use SystemState::*;
        matches!(
            (self, next),
            (Idle, Connecting)
                | (Idle, ShuttingDown)
                | (Connecting, Connected)
                | (Connecting, Idle)
                | (Connecting, ShuttingDown)
                | (Connected, Idle)
                | (Connected, ShuttingDown)
                | (ShuttingDown, ShuttingDown)
        )
    }
}

impl fmt::Display for SystemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "IDLE",
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
            Self::ShuttingDown => "SHUTTING_DOWN",
        };
        f.write_str(name)
    }
}

/// Kind of asynchronous network event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkEvent {
    /// First valid inbound datagram confirmed the peer path
    PeerConnected,

    /// The only peer disconnected or timed out
    AllPeersDisconnected,

    /// Full shutdown was requested
    ShutdownRequested,
}

/// A queued network event
#[derive(Debug, Clone)]
pub struct NetworkEventData {
    /// Event kind
    pub event: NetworkEvent,

    /// Peer endpoint as "ip:port", when the event carries one
    pub endpoint: Option<String>,

    /// When the event was created
    pub created: Instant,
}

impl NetworkEventData {
    /// Create an event without an endpoint
    pub fn new(event: NetworkEvent) -> Self {
        Self {
            event,
            endpoint: None,
            created: Instant::now(),
        }
    }

    /// Create an event carrying a peer endpoint
    pub fn with_endpoint(event: NetworkEvent, endpoint: impl Into<String>) -> Self {
        Self {
            event,
            endpoint: Some(endpoint.into()),
            created: Instant::now(),
        }
    }
}

/// Shared lifecycle state plus the FIFO of network events
pub struct StateManager {
    state: AtomicU8,
    events: Mutex<VecDeque<NetworkEventData>>,
}

impl StateManager {
    /// Create a manager starting in [`SystemState::Idle`]
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(SystemState::Idle as u8),
            events: Mutex::new(VecDeque::new()),
        }
    }

    /// Request a state transition.
    ///
    /// Illegal transitions are logged and ignored; setting the current
    /// state again is a silent no-op.
    pub fn set_state(&self, next: SystemState) {
        let current = self.get_state();
        if current == next {
            return;
        }
        if !current.can_transition_to(next) {
            warn!("rejected invalid state transition {} -> {}", current, next);
            return;
        }

        self.state.store(next as u8, Ordering::Release);
        debug!("state transition {} -> {}", current, next);
    }

    /// Current lifecycle state
    pub fn get_state(&self) -> SystemState {
        SystemState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Whether the current state equals `state`
    pub fn is_in_state(&self, state: SystemState) -> bool {
        self.get_state() == state
    }

    /// Append an event to the FIFO
    pub fn queue_event(&self, event: NetworkEventData) {
        debug!("queuing network event: {:?}", event.event);
        self.events
            .lock()
            .expect("event queue mutex poisoned")
            .push_back(event);
    }

    /// Pop the oldest event, if any
    pub fn next_event(&self) -> Option<NetworkEventData> {
        self.events
            .lock()
            .expect("event queue mutex poisoned")
            .pop_front()
    }

    /// Whether any events are pending
    pub fn has_events(&self) -> bool {
        !self
            .events
            .lock()
            .expect("event queue mutex poisoned")
            .is_empty()
    }
}

impl Default for StateManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state_is_idle() {
        let mgr = StateManager::new();
        assert_eq!(mgr.get_state(), SystemState::Idle);
        assert!(mgr.is_in_state(SystemState::Idle));
    }

    #[test]
    fn test_valid_transitions() {
        let mgr = StateManager::new();

        mgr.set_state(SystemState::Connecting);
        assert_eq!(mgr.get_state(), SystemState::Connecting);

        mgr.set_state(SystemState::Connected);
        assert_eq!(mgr.get_state(), SystemState::Connected);

        mgr.set_state(SystemState::Idle);
        assert_eq!(mgr.get_state(), SystemState::Idle);

        mgr.set_state(SystemState::ShuttingDown);
        assert_eq!(mgr.get_state(), SystemState::ShuttingDown);
    }

    #[test]
    fn test_invalid_transition_is_ignored() {
        let mgr = StateManager::new();

        // IDLE -> CONNECTED is not legal
        mgr.set_state(SystemState::Connected);
        assert_eq!(mgr.get_state(), SystemState::Idle);
    }

    #[test]
    fn test_shutting_down_is_terminal() {
        let mgr = StateManager::new();
        mgr.set_state(SystemState::ShuttingDown);

        mgr.set_state(SystemState::Idle);
        assert_eq!(mgr.get_state(), SystemState::ShuttingDown);

        mgr.set_state(SystemState::Connecting);
        assert_eq!(mgr.get_state(), SystemState::ShuttingDown);

        // Self-transition stays legal
        mgr.set_state(SystemState::ShuttingDown);
        assert_eq!(mgr.get_state(), SystemState::ShuttingDown);
    }

    #[test]
    fn test_connecting_can_fall_back_to_idle() {
        let mgr = StateManager::new();
        mgr.set_state(SystemState::Connecting);
        mgr.set_state(SystemState::Idle);
        assert_eq!(mgr.get_state(), SystemState::Idle);
    }

    #[test]
    fn test_event_queue_fifo_order() {
        let mgr = StateManager::new();
        assert!(!mgr.has_events());

        mgr.queue_event(NetworkEventData::with_endpoint(
            NetworkEvent::PeerConnected,
            "1.2.3.4:5000",
        ));
        mgr.queue_event(NetworkEventData::new(NetworkEvent::AllPeersDisconnected));
        mgr.queue_event(NetworkEventData::new(NetworkEvent::ShutdownRequested));

        assert!(mgr.has_events());

        let first = mgr.next_event().unwrap();
        assert_eq!(first.event, NetworkEvent::PeerConnected);
        assert_eq!(first.endpoint.as_deref(), Some("1.2.3.4:5000"));

        assert_eq!(
            mgr.next_event().unwrap().event,
            NetworkEvent::AllPeersDisconnected
        );
        assert_eq!(
            mgr.next_event().unwrap().event,
            NetworkEvent::ShutdownRequested
        );

        assert!(mgr.next_event().is_none());
        assert!(!mgr.has_events());
    }
}
