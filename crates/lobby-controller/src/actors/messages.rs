//! Controller mailbox messages.
//!
//! Every request carries a `respond_to` oneshot; the controller answers
//! after the state change (if any) has been applied and published.

use super::capabilities::ProcedureHandler;
use crate::errors::LobbyError;
use crate::models::{BrowseFilter, EnterResult, LobbyId, LobbyRequest, Member};
use crate::observers::{LobbyObserver, ObserverId};
use crate::provider::{AttachedProvider, LobbyProvider};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

pub enum ControllerMessage {
    /// Create or join a lobby.
    Enter {
        request: LobbyRequest,
        cancel: CancellationToken,
        respond_to: oneshot::Sender<EnterResult>,
    },

    /// Posted by the task running a backend create/join.
    EnterCompleted(EnterCompletion),

    Leave {
        respond_to: oneshot::Sender<bool>,
    },

    CloseAndLeave {
        respond_to: oneshot::Sender<bool>,
    },

    SetOwner {
        member: Member,
        respond_to: oneshot::Sender<bool>,
    },

    KickMember {
        member: Member,
        respond_to: oneshot::Sender<bool>,
    },

    SetLobbyData {
        key: String,
        value: String,
        respond_to: oneshot::Sender<bool>,
    },

    SetMemberData {
        key: String,
        value: String,
        respond_to: oneshot::Sender<bool>,
    },

    /// Lobby data lookup for a lobby other than the current one.
    GetLobbyData {
        lobby_id: LobbyId,
        key: String,
        default: String,
        respond_to: oneshot::Sender<String>,
    },

    /// Member data lookup for a lobby other than the current one.
    GetMemberData {
        lobby_id: LobbyId,
        member: Member,
        key: String,
        default: String,
        respond_to: oneshot::Sender<String>,
    },

    SendInvite {
        member: Member,
        respond_to: oneshot::Sender<bool>,
    },

    SendChat {
        text: String,
        respond_to: oneshot::Sender<bool>,
    },

    CallProcedure {
        name: String,
        payload: String,
        respond_to: oneshot::Sender<bool>,
    },

    RegisterProcedure {
        name: String,
        handler: ProcedureHandler,
        respond_to: oneshot::Sender<bool>,
    },

    UnregisterProcedure {
        name: String,
        respond_to: oneshot::Sender<bool>,
    },

    RequestLobbyList {
        filter: BrowseFilter,
        respond_to: oneshot::Sender<bool>,
    },

    Friends {
        respond_to: oneshot::Sender<Vec<Member>>,
    },

    AttachProvider {
        provider: Arc<dyn LobbyProvider>,
        respond_to: oneshot::Sender<Result<(), LobbyError>>,
    },

    DetachProvider {
        respond_to: oneshot::Sender<()>,
    },

    RegisterObserver {
        observer: Arc<dyn LobbyObserver>,
        respond_to: oneshot::Sender<ObserverId>,
    },

    UnregisterObserver {
        id: ObserverId,
        respond_to: oneshot::Sender<bool>,
    },

    /// Leave, detach the backend and stop the controller task.
    Shutdown {
        respond_to: oneshot::Sender<()>,
    },
}

impl ControllerMessage {
    /// Returns a bounded label for logs.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            ControllerMessage::Enter { .. } => "enter",
            ControllerMessage::EnterCompleted(_) => "enter_completed",
            ControllerMessage::Leave { .. } => "leave",
            ControllerMessage::CloseAndLeave { .. } => "close_and_leave",
            ControllerMessage::SetOwner { .. } => "set_owner",
            ControllerMessage::KickMember { .. } => "kick_member",
            ControllerMessage::SetLobbyData { .. } => "set_lobby_data",
            ControllerMessage::SetMemberData { .. } => "set_member_data",
            ControllerMessage::GetLobbyData { .. } => "get_lobby_data",
            ControllerMessage::GetMemberData { .. } => "get_member_data",
            ControllerMessage::SendInvite { .. } => "send_invite",
            ControllerMessage::SendChat { .. } => "send_chat",
            ControllerMessage::CallProcedure { .. } => "call_procedure",
            ControllerMessage::RegisterProcedure { .. } => "register_procedure",
            ControllerMessage::UnregisterProcedure { .. } => "unregister_procedure",
            ControllerMessage::RequestLobbyList { .. } => "request_lobby_list",
            ControllerMessage::Friends { .. } => "friends",
            ControllerMessage::AttachProvider { .. } => "attach_provider",
            ControllerMessage::DetachProvider { .. } => "detach_provider",
            ControllerMessage::RegisterObserver { .. } => "register_observer",
            ControllerMessage::UnregisterObserver { .. } => "unregister_observer",
            ControllerMessage::Shutdown { .. } => "shutdown",
        }
    }
}

/// Result of a backend create/join, routed back to the controller task.
pub struct EnterCompletion {
    pub request: LobbyRequest,
    /// The instance the call was issued against, not necessarily the
    /// current one.
    pub provider: Arc<AttachedProvider>,
    pub outcome: EnterResult,
    pub elapsed: Duration,
    pub respond_to: oneshot::Sender<EnterResult>,
}

/// A create/join held until a backend attaches.
pub struct PendingEnter {
    pub request: LobbyRequest,
    pub cancel: CancellationToken,
    pub respond_to: oneshot::Sender<EnterResult>,
}
