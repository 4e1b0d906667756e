//! Backend contract consumed by the session controller.
//!
//! A backend implements [`LobbyProvider`] for one matchmaking technology and
//! reports asynchronous happenings (members joining, owner changes, pings)
//! as [`ProviderEvent`]s through the [`EventSink`] it receives in
//! [`LobbyProvider::initialize`].
//!
//! Optional features (heartbeat, chat, friends, procedures, browsing) are
//! exposed through nullable capability accessors. A backend that returns
//! `None` turns the matching controller module into a no-op.

pub mod loopback;

use crate::errors::LobbyError;
use crate::metadata::Metadata;
use crate::models::{
    BrowseFilter, CreateLobbyRequest, EnterResult, Invitation, JoinLobbyRequest, KickCause,
    LobbyId, LobbySummary, Member,
};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

pub use loopback::{LoopbackHub, LoopbackProvider};

/// Something that happened on the backend after `initialize`.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderEvent {
    MemberJoined {
        lobby_id: LobbyId,
        member: Member,
        member_data: Metadata,
    },
    MemberLeft {
        lobby_id: LobbyId,
        member: Member,
    },
    /// The local member was removed by someone else.
    LocalMemberKicked {
        lobby_id: LobbyId,
        cause: KickCause,
    },
    InvitationReceived(Invitation),
    LobbyDataUpdated {
        lobby_id: LobbyId,
        key: String,
        value: String,
    },
    MemberDataUpdated {
        lobby_id: LobbyId,
        member: Member,
        key: String,
        value: String,
    },
    OwnerUpdated {
        lobby_id: LobbyId,
        owner: Member,
    },
    HeartbeatReceived {
        lobby_id: LobbyId,
        member: Member,
    },
    ChatMessage {
        lobby_id: LobbyId,
        from: Member,
        text: String,
    },
    ProcedureInvoked {
        lobby_id: LobbyId,
        from: Member,
        procedure: String,
        payload: String,
    },
    LobbyListReceived {
        lobbies: Vec<LobbySummary>,
    },
    FriendsUpdated {
        friends: Vec<Member>,
    },
}

impl ProviderEvent {
    /// Returns a bounded label for logs.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            ProviderEvent::MemberJoined { .. } => "member_joined",
            ProviderEvent::MemberLeft { .. } => "member_left",
            ProviderEvent::LocalMemberKicked { .. } => "local_member_kicked",
            ProviderEvent::InvitationReceived(_) => "invitation_received",
            ProviderEvent::LobbyDataUpdated { .. } => "lobby_data_updated",
            ProviderEvent::MemberDataUpdated { .. } => "member_data_updated",
            ProviderEvent::OwnerUpdated { .. } => "owner_updated",
            ProviderEvent::HeartbeatReceived { .. } => "heartbeat_received",
            ProviderEvent::ChatMessage { .. } => "chat_message",
            ProviderEvent::ProcedureInvoked { .. } => "procedure_invoked",
            ProviderEvent::LobbyListReceived { .. } => "lobby_list_received",
            ProviderEvent::FriendsUpdated { .. } => "friends_updated",
        }
    }
}

/// Event channel handed to a backend at initialization.
///
/// Every event is tagged with the attach generation of the backend instance
/// so the controller can drop events from instances it has replaced.
#[derive(Debug, Clone)]
pub struct EventSink {
    generation: u64,
    sender: mpsc::UnboundedSender<(u64, ProviderEvent)>,
}

impl EventSink {
    #[must_use]
    pub fn new(generation: u64, sender: mpsc::UnboundedSender<(u64, ProviderEvent)>) -> Self {
        Self { generation, sender }
    }

    /// Creates a detached sink plus its receiving end.
    #[must_use]
    pub fn channel(generation: u64) -> (Self, mpsc::UnboundedReceiver<(u64, ProviderEvent)>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self::new(generation, sender), receiver)
    }

    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Delivers an event. Returns `false` once the controller is gone.
    pub fn emit(&self, event: ProviderEvent) -> bool {
        self.sender.send((self.generation, event)).is_ok()
    }
}

/// Liveness pings.
#[async_trait]
pub trait HeartbeatCapability: Send + Sync {
    /// Broadcasts a ping for the local member to everyone in `lobby_id`.
    async fn send_ping(&self, lobby_id: &LobbyId) -> bool;
}

/// Lobby text chat.
#[async_trait]
pub trait ChatCapability: Send + Sync {
    async fn send_message(&self, lobby_id: &LobbyId, text: &str) -> bool;
}

/// Friends discovery.
#[async_trait]
pub trait FriendsCapability: Send + Sync {
    async fn friends(&self) -> Vec<Member>;
}

/// Turn-based remote procedure calls between lobby members.
#[async_trait]
pub trait ProcedureCapability: Send + Sync {
    async fn invoke(&self, lobby_id: &LobbyId, procedure: &str, payload: &str) -> bool;
}

/// Lobby browsing. Results arrive as [`ProviderEvent::LobbyListReceived`].
#[async_trait]
pub trait BrowseCapability: Send + Sync {
    async fn request_lobby_list(&self, filter: &BrowseFilter) -> bool;
}

/// A lobby backend.
///
/// Methods other than `create`/`join` and the data lookups are expected to
/// answer promptly; the controller awaits them on its own task.
#[async_trait]
pub trait LobbyProvider: Send + Sync + 'static {
    /// Stable key identifying the backend technology (ledger key).
    fn backend_type(&self) -> &str;

    /// Opens the backend's readiness gate and hands it the event sink.
    async fn initialize(&self, events: EventSink) -> Result<(), LobbyError>;

    /// The local user as this backend identifies it.
    fn local_user(&self) -> Member;

    async fn create(&self, request: CreateLobbyRequest) -> EnterResult;

    async fn join(&self, request: JoinLobbyRequest) -> EnterResult;

    async fn send_invite(&self, lobby_id: &LobbyId, member: &Member) -> bool;

    async fn leave(&self, lobby_id: &LobbyId);

    /// Removes every member and tears the lobby down.
    async fn close_and_leave(&self, lobby_id: &LobbyId) -> bool;

    async fn set_owner(&self, lobby_id: &LobbyId, member: &Member) -> bool;

    async fn kick_member(&self, lobby_id: &LobbyId, member: &Member) -> bool;

    async fn set_lobby_data(&self, lobby_id: &LobbyId, key: &str, value: &str) -> bool;

    async fn set_local_member_data(&self, lobby_id: &LobbyId, key: &str, value: &str) -> bool;

    /// Out-of-session lobby data lookup.
    async fn lobby_data(&self, lobby_id: &LobbyId, key: &str) -> Result<Option<String>, LobbyError>;

    /// Out-of-session member data lookup.
    async fn member_data(
        &self,
        lobby_id: &LobbyId,
        member: &Member,
        key: &str,
    ) -> Result<Option<String>, LobbyError>;

    async fn dispose(&self);

    /// Whether orphaned lobbies recorded in the stale-session ledger should
    /// be left when this backend attaches.
    fn should_flush_stale_lobbies(&self) -> bool {
        true
    }

    fn heartbeat(&self) -> Option<Arc<dyn HeartbeatCapability>> {
        None
    }

    fn chat(&self) -> Option<Arc<dyn ChatCapability>> {
        None
    }

    fn friends(&self) -> Option<Arc<dyn FriendsCapability>> {
        None
    }

    fn procedures(&self) -> Option<Arc<dyn ProcedureCapability>> {
        None
    }

    fn browser(&self) -> Option<Arc<dyn BrowseCapability>> {
        None
    }
}

/// One attached backend instance as tracked by the controller.
///
/// Holds the obsolete flag and the in-flight create/join count that decide
/// when a swapped-out instance may be disposed.
pub struct AttachedProvider {
    provider: Arc<dyn LobbyProvider>,
    generation: u64,
    obsolete: AtomicBool,
    disposed: AtomicBool,
    in_flight: AtomicUsize,
}

impl AttachedProvider {
    #[must_use]
    pub fn new(provider: Arc<dyn LobbyProvider>, generation: u64) -> Self {
        Self {
            provider,
            generation,
            obsolete: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn provider(&self) -> &Arc<dyn LobbyProvider> {
        &self.provider
    }

    #[must_use]
    pub fn backend_type(&self) -> &str {
        self.provider.backend_type()
    }

    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    #[must_use]
    pub fn is_obsolete(&self) -> bool {
        self.obsolete.load(Ordering::Acquire)
    }

    pub fn mark_obsolete(&self) {
        self.obsolete.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Counts a create/join issued against this instance.
    pub fn begin_operation(&self) -> usize {
        self.in_flight.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Counts a create/join completion. Returns the number still pending.
    pub fn finish_operation(&self) -> usize {
        let previous = self
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                Some(n.saturating_sub(1))
            })
            .unwrap_or(0);
        previous.saturating_sub(1)
    }

    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Disposes the backend once. Returns `false` if already disposed.
    pub async fn dispose(&self) -> bool {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.provider.dispose().await;
        true
    }
}

impl std::fmt::Debug for AttachedProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttachedProvider")
            .field("backend_type", &self.backend_type())
            .field("generation", &self.generation)
            .field("obsolete", &self.is_obsolete())
            .field("in_flight", &self.in_flight())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_event_sink_tags_generation() {
        let (sink, mut rx) = EventSink::channel(7);
        assert!(sink.emit(ProviderEvent::FriendsUpdated { friends: vec![] }));

        let (generation, event) = rx.recv().await.unwrap();
        assert_eq!(generation, 7);
        assert_eq!(event.name(), "friends_updated");

        drop(rx);
        assert!(!sink.emit(ProviderEvent::FriendsUpdated { friends: vec![] }));
    }

    #[tokio::test]
    async fn test_attached_provider_tracks_in_flight_and_disposes_once() {
        let hub = LoopbackHub::new();
        let provider: Arc<dyn LobbyProvider> =
            Arc::new(LoopbackProvider::new(hub, Member::new("p1", "One")));
        let attached = AttachedProvider::new(provider, 1);

        assert_eq!(attached.begin_operation(), 1);
        assert_eq!(attached.begin_operation(), 2);
        assert_eq!(attached.finish_operation(), 1);
        assert_eq!(attached.finish_operation(), 0);
        // Never underflows
        assert_eq!(attached.finish_operation(), 0);

        assert!(!attached.is_obsolete());
        attached.mark_obsolete();
        assert!(attached.is_obsolete());

        assert!(attached.dispose().await);
        assert!(!attached.dispose().await);
        assert!(attached.is_disposed());
    }
}
