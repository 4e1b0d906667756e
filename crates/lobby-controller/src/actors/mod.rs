//! Actor implementation for the lobby session controller.
//!
//! ```text
//! SessionController (one per local user)
//! ├── LobbyStateMachine   NotInLobby / Joining / InLobby / Leaving
//! ├── LobbySession        cached lobby, published as SessionSnapshot
//! ├── HeartbeatTracker    liveness of the members we watch
//! ├── CapabilityModules   optional backend features
//! └── AttachedProvider    current backend (+ obsolete ones still draining)
//! ```
//!
//! # Modules
//!
//! - [`controller`] - `SessionController` actor, its handle and builder
//! - [`messages`] - Mailbox message types
//! - [`state`] - Session state machine
//! - [`session`] - Lobby cache and snapshots
//! - [`heartbeat`] - Heartbeat subscription bookkeeping
//! - [`capabilities`] - Optional capability slots and procedure handlers
//! - [`policies`] - Host-supplied decisions (pre-attach, already-in-lobby, enter failure)

pub mod capabilities;
pub mod controller;
pub mod heartbeat;
pub mod messages;
pub mod policies;
pub mod session;
pub mod state;

// Re-export primary types
pub use capabilities::ProcedureHandler;
pub use controller::{SessionController, SessionControllerBuilder, SessionControllerHandle};
pub use policies::{
    AlreadyInLobbyDecision, AlreadyInLobbyPolicy, EnterFailurePolicy, LeaveCurrentLobby,
    LogEnterFailure, PreAttachPolicy, StayInCurrentLobby,
};
pub use session::SessionSnapshot;
pub use state::LobbyState;
