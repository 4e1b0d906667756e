//! Guarded lobby state machine.
//!
//! ```text
//! NotInLobby -> Joining
//! Joining    -> InLobby
//! InLobby    -> Leaving
//! Leaving    -> NotInLobby
//! any        -> NotInLobby   (force reset)
//! ```
//!
//! Every other transition is rejected and leaves the state untouched.

use std::fmt;
use tracing::trace;

/// Where the local member stands with respect to a lobby.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum LobbyState {
    #[default]
    NotInLobby,
    Joining,
    InLobby,
    Leaving,
}

impl LobbyState {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            LobbyState::NotInLobby => "not_in_lobby",
            LobbyState::Joining => "joining",
            LobbyState::InLobby => "in_lobby",
            LobbyState::Leaving => "leaving",
        }
    }
}

impl fmt::Display for LobbyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Default)]
pub struct LobbyStateMachine {
    state: LobbyState,
}

impl LobbyStateMachine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn current(&self) -> LobbyState {
        self.state
    }

    #[must_use]
    pub fn is(&self, state: LobbyState) -> bool {
        self.state == state
    }

    /// Whether `from -> to` is in the transition table.
    #[must_use]
    pub const fn is_allowed(from: LobbyState, to: LobbyState) -> bool {
        matches!(
            (from, to),
            (LobbyState::NotInLobby, LobbyState::Joining)
                | (LobbyState::Joining, LobbyState::InLobby)
                | (LobbyState::InLobby, LobbyState::Leaving)
                | (_, LobbyState::NotInLobby)
        )
    }

    /// Attempts a guarded transition. Returns `false` (and changes nothing)
    /// when the table rejects it.
    pub fn transition(&mut self, to: LobbyState) -> bool {
        if !Self::is_allowed(self.state, to) {
            trace!(
                target: "lobby.actor.controller",
                from = %self.state,
                to = %to,
                "State transition rejected"
            );
            return false;
        }
        self.state = to;
        true
    }

    /// Unconditionally returns to `NotInLobby`.
    pub fn force_reset(&mut self) {
        self.state = LobbyState::NotInLobby;
    }
}
