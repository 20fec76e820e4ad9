//! Connection state machine
//!
//! One authoritative [`ConnectionState`] per session. Engine callbacks and
//! commands both funnel through [`ConnectionStateMachine::transition`], which
//! rejects illegal edges and swallows same-state updates so every accepted
//! transition produces exactly one notification.

use serde::{Deserialize, Serialize};

use crate::error::{PlayerError, Result};

/// Consolidated connection state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Idle,
    Negotiating,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    /// A session in this state blocks a new `play_stream`
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ConnectionState::Negotiating | ConnectionState::Connected | ConnectionState::Disconnected
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Failed | ConnectionState::Closed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Negotiating => "negotiating",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Failed => "failed",
            ConnectionState::Closed => "closed",
        }
    }

    fn can_transition_to(&self, to: ConnectionState) -> bool {
        use ConnectionState::*;

        if self.is_terminal() {
            return false;
        }
        matches!(
            (*self, to),
            (Idle, Negotiating)
                | (Negotiating, Connected)
                | (Connected, Disconnected)
                | (Disconnected, Negotiating)
                | (Disconnected, Connected)
                | (_, Failed)
                | (_, Closed)
        )
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Accepted transition
pub type Transition = (ConnectionState, ConnectionState);

/// Guards the state of one session
#[derive(Debug, Default)]
pub struct ConnectionStateMachine {
    state: ConnectionState,
}

impl ConnectionStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Move to `to`.
    ///
    /// Returns `Ok(Some((from, to)))` when the state changed, `Ok(None)` for
    /// a same-state update, and an error for an edge the machine forbids.
    pub fn transition(&mut self, to: ConnectionState) -> Result<Option<Transition>> {
        let from = self.state;
        if from == to {
            return Ok(None);
        }
        if !from.can_transition_to(to) {
            return Err(PlayerError::Negotiation(format!(
                "illegal state transition {} -> {}",
                from, to
            )));
        }
        self.state = to;
        Ok(Some((from, to)))
    }
}
