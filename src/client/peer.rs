//! Per-peer connection state machine.
//!
//! Engines report raw state changes, possibly repeated or out of order
//! around teardown. [`PeerMachine`] turns them into at most one signal of
//! each kind so the pair never reports `Connected` twice and never signals
//! anything after `Closed`.

use crate::engine::PeerState;
use crate::stats::PeerRole;

/// What the connection pair must do in response to a state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Nothing to signal (duplicate, or after close).
    Ignored,
    Connecting,
    /// First arrival in `Connected`.
    Connected,
    /// Connectivity lost, may still recover.
    Disconnected,
    /// Fatal for the run: notify `false` and abort.
    Failed,
    /// Normal teardown: notify `false`, no abort.
    Closed,
}

#[derive(Debug)]
pub struct PeerMachine {
    role: PeerRole,
    state: PeerState,
    connected_reported: bool,
    failed_reported: bool,
    closed: bool,
}

impl PeerMachine {
    pub fn new(role: PeerRole) -> Self {
        Self {
            role,
            state: PeerState::New,
            connected_reported: false,
            failed_reported: false,
            closed: false,
        }
    }

    pub fn role(&self) -> PeerRole {
        self.role
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Feed an engine-reported state and get the transition to act on.
    pub fn apply(&mut self, next: PeerState) -> Transition {
        if self.closed {
            return Transition::Ignored;
        }
        let transition = match next {
            PeerState::New => Transition::Ignored,
            PeerState::Connecting => self.on_connecting(),
            PeerState::Connected => self.on_connected(),
            PeerState::Disconnected => self.on_disconnected(),
            PeerState::Failed => self.on_failed(),
            PeerState::Closed => self.on_closed(),
        };
        self.state = next;
        transition
    }

    fn on_connecting(&mut self) -> Transition {
        Transition::Connecting
    }

    fn on_connected(&mut self) -> Transition {
        if self.connected_reported {
            return Transition::Ignored;
        }
        self.connected_reported = true;
        Transition::Connected
    }

    fn on_disconnected(&mut self) -> Transition {
        Transition::Disconnected
    }

    fn on_failed(&mut self) -> Transition {
        if self.failed_reported {
            return Transition::Ignored;
        }
        self.failed_reported = true;
        Transition::Failed
    }

    fn on_closed(&mut self) -> Transition {
        self.closed = true;
        Transition::Closed
    }
}
