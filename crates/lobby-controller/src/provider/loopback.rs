//! In-process loopback backend.
//!
//! A [`LoopbackHub`] keeps every lobby in shared memory and routes events
//! between the [`LoopbackProvider`]s attached to it, so several controllers
//! in one process can play owner and members without any network. Used by
//! the demo binary and the integration tests.

use super::{
    BrowseCapability, ChatCapability, EventSink, FriendsCapability, HeartbeatCapability,
    LobbyProvider, ProcedureCapability, ProviderEvent,
};
use crate::errors::{EnterFailure, LobbyError};
use crate::metadata::Metadata;
use crate::models::{
    BrowseFilter, CreateLobbyRequest, EnterResult, EnteredLobby, Invitation, JoinLobbyRequest,
    KickCause, LobbyId, LobbySummary, LobbyType, Member,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Backend type key reported by loopback providers.
pub const LOOPBACK_BACKEND_TYPE: &str = "loopback";

struct HubLobby {
    owner: Member,
    capacity: u32,
    lobby_type: LobbyType,
    members: Vec<Member>,
    lobby_data: Metadata,
    member_data: HashMap<Member, Metadata>,
}

impl HubLobby {
    fn contains(&self, member: &Member) -> bool {
        self.members.contains(member)
    }

    fn is_full(&self) -> bool {
        self.members.len() >= usize::try_from(self.capacity).unwrap_or(usize::MAX)
    }

    fn remove(&mut self, member: &Member) {
        self.members.retain(|m| m != member);
        self.member_data.remove(member);
    }

    fn entered(&self, lobby_id: &LobbyId, local_member: &Member) -> EnteredLobby {
        EnteredLobby {
            lobby_id: lobby_id.clone(),
            owner: self.owner.clone(),
            local_member: local_member.clone(),
            capacity: self.capacity,
            lobby_type: self.lobby_type,
            members: self.members.clone(),
            lobby_data: self.lobby_data.clone(),
            member_data: self.member_data.clone(),
        }
    }

    fn summary(&self, lobby_id: &LobbyId) -> LobbySummary {
        LobbySummary {
            lobby_id: lobby_id.clone(),
            owner: self.owner.clone(),
            member_count: u32::try_from(self.members.len()).unwrap_or(u32::MAX),
            capacity: self.capacity,
            lobby_data: self.lobby_data.clone(),
        }
    }
}

struct Peer {
    member: Member,
    sink: EventSink,
}

#[derive(Default)]
struct HubState {
    lobbies: HashMap<LobbyId, HubLobby>,
    peers: HashMap<Uuid, Peer>,
}

impl HubState {
    /// Sends `event` to every peer whose member is in `targets`, except `skip`.
    fn deliver(&self, targets: &[Member], skip: Option<&Member>, event: &ProviderEvent) {
        for peer in self.peers.values() {
            if targets.contains(&peer.member) && skip != Some(&peer.member) {
                peer.sink.emit(event.clone());
            }
        }
    }

    fn deliver_to(&self, member: &Member, event: &ProviderEvent) -> bool {
        let mut delivered = false;
        for peer in self.peers.values().filter(|p| &p.member == member) {
            delivered |= peer.sink.emit(event.clone());
        }
        delivered
    }

    fn friends_of(&self, member: &Member) -> Vec<Member> {
        let mut friends: Vec<Member> = Vec::new();
        for peer in self.peers.values() {
            if &peer.member != member && !friends.contains(&peer.member) {
                friends.push(peer.member.clone());
            }
        }
        friends.sort_by(|a, b| a.id.cmp(&b.id));
        friends
    }

    fn broadcast_friends(&self) {
        for peer in self.peers.values() {
            peer.sink.emit(ProviderEvent::FriendsUpdated {
                friends: self.friends_of(&peer.member),
            });
        }
    }

    /// Removes `member` from `lobby_id`, migrating ownership if needed.
    fn remove_member(&mut self, lobby_id: &LobbyId, member: &Member) {
        let Some(lobby) = self.lobbies.get_mut(lobby_id) else {
            return;
        };
        if !lobby.contains(member) {
            return;
        }
        lobby.remove(member);

        let Some(next_owner) = lobby.members.first().cloned() else {
            self.lobbies.remove(lobby_id);
            debug!(
                target: "lobby.provider.loopback",
                lobby_id = %lobby_id,
                "Last member left, lobby removed"
            );
            return;
        };

        let owner_changed = &lobby.owner == member;
        if owner_changed {
            lobby.owner = next_owner.clone();
        }
        let remaining = lobby.members.clone();

        self.deliver(
            &remaining,
            None,
            &ProviderEvent::MemberLeft {
                lobby_id: lobby_id.clone(),
                member: member.clone(),
            },
        );
        if owner_changed {
            self.deliver(
                &remaining,
                None,
                &ProviderEvent::OwnerUpdated {
                    lobby_id: lobby_id.clone(),
                    owner: next_owner,
                },
            );
        }
    }
}

/// Shared in-memory lobby server.
#[derive(Clone, Default)]
pub struct LoopbackHub {
    state: Arc<Mutex<HubState>>,
}

impl LoopbackHub {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn lobby_count(&self) -> usize {
        self.state.lock().lobbies.len()
    }

    #[must_use]
    pub fn lobby(&self, lobby_id: &LobbyId) -> Option<LobbySummary> {
        self.state
            .lock()
            .lobbies
            .get(lobby_id)
            .map(|lobby| lobby.summary(lobby_id))
    }

    /// Members of `lobby_id` in join order; empty if the lobby is gone.
    #[must_use]
    pub fn members(&self, lobby_id: &LobbyId) -> Vec<Member> {
        self.state
            .lock()
            .lobbies
            .get(lobby_id)
            .map(|lobby| lobby.members.clone())
            .unwrap_or_default()
    }

    fn register(&self, peer_id: Uuid, member: Member, sink: EventSink) {
        let mut state = self.state.lock();
        state.peers.insert(peer_id, Peer { member, sink });
        state.broadcast_friends();
    }

    fn unregister(&self, peer_id: &Uuid) {
        let mut state = self.state.lock();
        if state.peers.remove(peer_id).is_some() {
            state.broadcast_friends();
        }
    }
}

/// The per-provider connection to the hub. Also serves the optional
/// capabilities so they can be handed out as `Arc<dyn ...>`.
struct LoopbackLink {
    hub: LoopbackHub,
    peer_id: Uuid,
    member: Member,
    heartbeat_paused: AtomicBool,
}

impl LoopbackLink {
    /// Broadcasts to the other members of a lobby the local member is in.
    fn broadcast(&self, lobby_id: &LobbyId, event: ProviderEvent) -> bool {
        let state = self.hub.state.lock();
        let Some(lobby) = state.lobbies.get(lobby_id) else {
            return false;
        };
        if !lobby.contains(&self.member) {
            return false;
        }
        state.deliver(&lobby.members, Some(&self.member), &event);
        true
    }
}

#[async_trait]
impl HeartbeatCapability for LoopbackLink {
    async fn send_ping(&self, lobby_id: &LobbyId) -> bool {
        if self.heartbeat_paused.load(Ordering::Acquire) {
            // Silently dropped, like a peer whose process froze
            return true;
        }
        self.broadcast(
            lobby_id,
            ProviderEvent::HeartbeatReceived {
                lobby_id: lobby_id.clone(),
                member: self.member.clone(),
            },
        )
    }
}

#[async_trait]
impl ChatCapability for LoopbackLink {
    async fn send_message(&self, lobby_id: &LobbyId, text: &str) -> bool {
        self.broadcast(
            lobby_id,
            ProviderEvent::ChatMessage {
                lobby_id: lobby_id.clone(),
                from: self.member.clone(),
                text: text.to_string(),
            },
        )
    }
}

#[async_trait]
impl ProcedureCapability for LoopbackLink {
    async fn invoke(&self, lobby_id: &LobbyId, procedure: &str, payload: &str) -> bool {
        self.broadcast(
            lobby_id,
            ProviderEvent::ProcedureInvoked {
                lobby_id: lobby_id.clone(),
                from: self.member.clone(),
                procedure: procedure.to_string(),
                payload: payload.to_string(),
            },
        )
    }
}

#[async_trait]
impl FriendsCapability for LoopbackLink {
    async fn friends(&self) -> Vec<Member> {
        self.hub.state.lock().friends_of(&self.member)
    }
}

#[async_trait]
impl BrowseCapability for LoopbackLink {
    async fn request_lobby_list(&self, filter: &BrowseFilter) -> bool {
        let state = self.hub.state.lock();
        let listing: Vec<LobbySummary> = state
            .lobbies
            .iter()
            .filter(|(_, lobby)| lobby.lobby_type == LobbyType::Public)
            .map(|(id, lobby)| lobby.summary(id))
            .collect();
        let lobbies = filter.apply(listing);

        match state.peers.get(&self.peer_id) {
            Some(peer) => peer.sink.emit(ProviderEvent::LobbyListReceived { lobbies }),
            None => false,
        }
    }
}

/// A backend instance for one local member on a [`LoopbackHub`].
pub struct LoopbackProvider {
    link: Arc<LoopbackLink>,
    backend_type: String,
    initialized: AtomicBool,
    flush_stale_lobbies: bool,
}

impl LoopbackProvider {
    #[must_use]
    pub fn new(hub: LoopbackHub, member: Member) -> Self {
        Self {
            link: Arc::new(LoopbackLink {
                hub,
                peer_id: Uuid::new_v4(),
                member,
                heartbeat_paused: AtomicBool::new(false),
            }),
            backend_type: LOOPBACK_BACKEND_TYPE.to_string(),
            initialized: AtomicBool::new(false),
            flush_stale_lobbies: true,
        }
    }

    /// Overrides the backend type key (e.g. to run two loopback flavours).
    #[must_use]
    pub fn with_backend_type(mut self, backend_type: impl Into<String>) -> Self {
        self.backend_type = backend_type.into();
        self
    }

    /// Opts out of stale-lobby cleanup at attach.
    #[must_use]
    pub fn without_stale_flush(mut self) -> Self {
        self.flush_stale_lobbies = false;
        self
    }

    /// Stops (or resumes) delivering this member's pings.
    pub fn set_heartbeat_paused(&self, paused: bool) {
        self.link.heartbeat_paused.store(paused, Ordering::Release);
    }

    #[must_use]
    pub fn hub(&self) -> &LoopbackHub {
        &self.link.hub
    }

    fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    fn member(&self) -> &Member {
        &self.link.member
    }

    /// Runs `f` on `lobby_id` if the local member is its owner.
    fn with_owned_lobby<F>(&self, lobby_id: &LobbyId, f: F) -> bool
    where
        F: FnOnce(&mut HubState) -> bool,
    {
        let mut state = self.link.hub.state.lock();
        let is_owner = state
            .lobbies
            .get(lobby_id)
            .is_some_and(|lobby| &lobby.owner == self.member());
        is_owner && f(&mut state)
    }
}

#[async_trait]
impl LobbyProvider for LoopbackProvider {
    fn backend_type(&self) -> &str {
        &self.backend_type
    }

    async fn initialize(&self, events: EventSink) -> Result<(), LobbyError> {
        self.link
            .hub
            .register(self.link.peer_id, self.member().clone(), events);
        self.initialized.store(true, Ordering::Release);
        info!(
            target: "lobby.provider.loopback",
            member_id = %self.member().id,
            backend_type = %self.backend_type,
            "Loopback provider initialized"
        );
        Ok(())
    }

    fn local_user(&self) -> Member {
        self.member().clone()
    }

    async fn create(&self, request: CreateLobbyRequest) -> EnterResult {
        if !self.is_initialized() {
            return Err(EnterFailure::BackendNotInitialized);
        }
        if request.capacity == 0 {
            return Err(EnterFailure::General);
        }

        let lobby_id = LobbyId::new(Uuid::new_v4().to_string());
        let member = self.member().clone();
        let lobby = HubLobby {
            owner: member.clone(),
            capacity: request.capacity,
            lobby_type: request.lobby_type,
            members: vec![member.clone()],
            lobby_data: request.lobby_data,
            member_data: HashMap::from([(member.clone(), request.member_data)]),
        };
        let entered = lobby.entered(&lobby_id, &member);

        self.link
            .hub
            .state
            .lock()
            .lobbies
            .insert(lobby_id.clone(), lobby);

        debug!(
            target: "lobby.provider.loopback",
            lobby_id = %lobby_id,
            capacity = request.capacity,
            "Lobby created"
        );
        Ok(entered)
    }

    async fn join(&self, request: JoinLobbyRequest) -> EnterResult {
        if !self.is_initialized() {
            return Err(EnterFailure::BackendNotInitialized);
        }
        if request.lobby_id.as_str().trim().is_empty() {
            return Err(EnterFailure::InvalidId);
        }

        let member = self.member().clone();
        let mut state = self.link.hub.state.lock();
        let lobby = state
            .lobbies
            .get_mut(&request.lobby_id)
            .ok_or(EnterFailure::InvalidId)?;

        if lobby.contains(&member) {
            return Ok(lobby.entered(&request.lobby_id, &member));
        }
        if lobby.is_full() {
            return Err(EnterFailure::General);
        }

        lobby.members.push(member.clone());
        lobby
            .member_data
            .insert(member.clone(), request.member_data.clone());
        let entered = lobby.entered(&request.lobby_id, &member);
        let targets = lobby.members.clone();

        let event = ProviderEvent::MemberJoined {
            lobby_id: request.lobby_id.clone(),
            member: member.clone(),
            member_data: request.member_data,
        };
        state.deliver(&targets, Some(&member), &event);
        Ok(entered)
    }

    async fn send_invite(&self, lobby_id: &LobbyId, member: &Member) -> bool {
        let state = self.link.hub.state.lock();
        if !state
            .lobbies
            .get(lobby_id)
            .is_some_and(|lobby| lobby.contains(self.member()))
        {
            return false;
        }
        state.deliver_to(
            member,
            &ProviderEvent::InvitationReceived(Invitation {
                lobby_id: lobby_id.clone(),
                from: self.member().clone(),
            }),
        )
    }

    async fn leave(&self, lobby_id: &LobbyId) {
        self.link
            .hub
            .state
            .lock()
            .remove_member(lobby_id, self.member());
    }

    async fn close_and_leave(&self, lobby_id: &LobbyId) -> bool {
        self.with_owned_lobby(lobby_id, |state| {
            let Some(lobby) = state.lobbies.remove(lobby_id) else {
                return false;
            };
            state.deliver(
                &lobby.members,
                Some(self.member()),
                &ProviderEvent::LocalMemberKicked {
                    lobby_id: lobby_id.clone(),
                    cause: KickCause::LobbyClosed,
                },
            );
            true
        })
    }

    async fn set_owner(&self, lobby_id: &LobbyId, member: &Member) -> bool {
        self.with_owned_lobby(lobby_id, |state| {
            let Some(lobby) = state.lobbies.get_mut(lobby_id) else {
                return false;
            };
            if !lobby.contains(member) {
                return false;
            }
            lobby.owner = member.clone();
            let targets = lobby.members.clone();
            state.deliver(
                &targets,
                Some(self.member()),
                &ProviderEvent::OwnerUpdated {
                    lobby_id: lobby_id.clone(),
                    owner: member.clone(),
                },
            );
            true
        })
    }

    async fn kick_member(&self, lobby_id: &LobbyId, member: &Member) -> bool {
        if member == self.member() {
            return false;
        }
        self.with_owned_lobby(lobby_id, |state| {
            let Some(lobby) = state.lobbies.get_mut(lobby_id) else {
                return false;
            };
            if !lobby.contains(member) {
                return false;
            }
            lobby.remove(member);
            let remaining = lobby.members.clone();

            state.deliver_to(
                member,
                &ProviderEvent::LocalMemberKicked {
                    lobby_id: lobby_id.clone(),
                    cause: KickCause::General,
                },
            );
            state.deliver(
                &remaining,
                Some(self.member()),
                &ProviderEvent::MemberLeft {
                    lobby_id: lobby_id.clone(),
                    member: member.clone(),
                },
            );
            true
        })
    }

    async fn set_lobby_data(&self, lobby_id: &LobbyId, key: &str, value: &str) -> bool {
        self.with_owned_lobby(lobby_id, |state| {
            let Some(lobby) = state.lobbies.get_mut(lobby_id) else {
                return false;
            };
            lobby.lobby_data.set(key, value);
            let targets = lobby.members.clone();
            state.deliver(
                &targets,
                Some(self.member()),
                &ProviderEvent::LobbyDataUpdated {
                    lobby_id: lobby_id.clone(),
                    key: key.to_string(),
                    value: value.to_string(),
                },
            );
            true
        })
    }

    async fn set_local_member_data(&self, lobby_id: &LobbyId, key: &str, value: &str) -> bool {
        let mut state = self.link.hub.state.lock();
        let member = self.member();
        let Some(lobby) = state.lobbies.get_mut(lobby_id) else {
            return false;
        };
        let Some(data) = lobby.member_data.get_mut(member) else {
            return false;
        };
        data.set(key, value);
        let targets = lobby.members.clone();
        state.deliver(
            &targets,
            Some(member),
            &ProviderEvent::MemberDataUpdated {
                lobby_id: lobby_id.clone(),
                member: member.clone(),
                key: key.to_string(),
                value: value.to_string(),
            },
        );
        true
    }

    async fn lobby_data(&self, lobby_id: &LobbyId, key: &str) -> Result<Option<String>, LobbyError> {
        let state = self.link.hub.state.lock();
        let lobby = state
            .lobbies
            .get(lobby_id)
            .ok_or_else(|| LobbyError::Provider(format!("unknown lobby {lobby_id}")))?;
        Ok(lobby.lobby_data.get(key).map(str::to_string))
    }

    async fn member_data(
        &self,
        lobby_id: &LobbyId,
        member: &Member,
        key: &str,
    ) -> Result<Option<String>, LobbyError> {
        let state = self.link.hub.state.lock();
        let lobby = state
            .lobbies
            .get(lobby_id)
            .ok_or_else(|| LobbyError::Provider(format!("unknown lobby {lobby_id}")))?;
        Ok(lobby
            .member_data
            .get(member)
            .and_then(|data| data.get(key))
            .map(str::to_string))
    }

    async fn dispose(&self) {
        self.initialized.store(false, Ordering::Release);
        self.link.hub.unregister(&self.link.peer_id);
        debug!(
            target: "lobby.provider.loopback",
            member_id = %self.member().id,
            "Loopback provider disposed"
        );
    }

    fn should_flush_stale_lobbies(&self) -> bool {
        self.flush_stale_lobbies
    }

    fn heartbeat(&self) -> Option<Arc<dyn HeartbeatCapability>> {
        Some(Arc::clone(&self.link) as Arc<dyn HeartbeatCapability>)
    }

    fn chat(&self) -> Option<Arc<dyn ChatCapability>> {
        Some(Arc::clone(&self.link) as Arc<dyn ChatCapability>)
    }

    fn friends(&self) -> Option<Arc<dyn FriendsCapability>> {
        Some(Arc::clone(&self.link) as Arc<dyn FriendsCapability>)
    }

    fn procedures(&self) -> Option<Arc<dyn ProcedureCapability>> {
        Some(Arc::clone(&self.link) as Arc<dyn ProcedureCapability>)
    }

    fn browser(&self) -> Option<Arc<dyn BrowseCapability>> {
        Some(Arc::clone(&self.link) as Arc<dyn BrowseCapability>)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::UnboundedReceiver;

    async fn attached(
        hub: &LoopbackHub,
        id: &str,
    ) -> (LoopbackProvider, UnboundedReceiver<(u64, ProviderEvent)>) {
        let provider = LoopbackProvider::new(hub.clone(), Member::new(id, id.to_uppercase()));
        let (sink, rx) = EventSink::channel(1);
        provider.initialize(sink).await.unwrap();
        (provider, rx)
    }

    fn drain(rx: &mut UnboundedReceiver<(u64, ProviderEvent)>) -> Vec<ProviderEvent> {
        let mut events = Vec::new();
        while let Ok((_, event)) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_create_requires_initialize() {
        let provider = LoopbackProvider::new(LoopbackHub::new(), Member::new("a", "A"));
        let result = provider.create(CreateLobbyRequest::new(4)).await;
        assert_eq!(result, Err(EnterFailure::BackendNotInitialized));
    }

    #[tokio::test]
    async fn test_join_unknown_or_blank_id_is_invalid() {
        let hub = LoopbackHub::new();
        let (provider, _rx) = attached(&hub, "a").await;

        assert_eq!(
            provider.join(JoinLobbyRequest::new("missing")).await,
            Err(EnterFailure::InvalidId)
        );
        assert_eq!(
            provider.join(JoinLobbyRequest::new("  ")).await,
            Err(EnterFailure::InvalidId)
        );
    }

    #[tokio::test]
    async fn test_join_notifies_existing_members_and_respects_capacity() {
        let hub = LoopbackHub::new();
        let (owner, mut owner_rx) = attached(&hub, "owner").await;
        let (guest, _guest_rx) = attached(&hub, "guest").await;
        let (late, _late_rx) = attached(&hub, "late").await;
        drain(&mut owner_rx);

        let lobby = owner.create(CreateLobbyRequest::new(2)).await.unwrap();
        let joined = guest
            .join(JoinLobbyRequest::new(lobby.lobby_id.clone()).with_member_data("ready", "1"))
            .await
            .unwrap();

        assert_eq!(joined.owner, owner.local_user());
        assert_eq!(joined.members.len(), 2);
        assert_eq!(joined.member_data.len(), 2);

        let events = drain(&mut owner_rx);
        assert!(events.iter().any(|e| matches!(
            e,
            ProviderEvent::MemberJoined { member, member_data, .. }
                if member.id == "guest" && member_data.get("ready") == Some("1")
        )));

        assert_eq!(
            late.join(JoinLobbyRequest::new(lobby.lobby_id)).await,
            Err(EnterFailure::General)
        );
    }

    #[tokio::test]
    async fn test_owner_leaving_migrates_ownership() {
        let hub = LoopbackHub::new();
        let (owner, _owner_rx) = attached(&hub, "owner").await;
        let (guest, mut guest_rx) = attached(&hub, "guest").await;

        let lobby = owner.create(CreateLobbyRequest::new(4)).await.unwrap();
        guest
            .join(JoinLobbyRequest::new(lobby.lobby_id.clone()))
            .await
            .unwrap();
        drain(&mut guest_rx);

        owner.leave(&lobby.lobby_id).await;

        let summary = hub.lobby(&lobby.lobby_id).unwrap();
        assert_eq!(summary.owner, guest.local_user());
        assert_eq!(summary.member_count, 1);

        let events = drain(&mut guest_rx);
        assert!(matches!(events.first(), Some(ProviderEvent::MemberLeft { .. })));
        assert!(matches!(events.get(1), Some(ProviderEvent::OwnerUpdated { owner, .. }) if owner.id == "guest"));

        guest.leave(&lobby.lobby_id).await;
        assert_eq!(hub.lobby_count(), 0);
    }

    #[tokio::test]
    async fn test_kick_sends_general_kick_to_target_only() {
        let hub = LoopbackHub::new();
        let (owner, _owner_rx) = attached(&hub, "owner").await;
        let (guest, mut guest_rx) = attached(&hub, "guest").await;

        let lobby = owner.create(CreateLobbyRequest::new(4)).await.unwrap();
        guest
            .join(JoinLobbyRequest::new(lobby.lobby_id.clone()))
            .await
            .unwrap();
        drain(&mut guest_rx);

        // Only the owner may kick, and never itself
        assert!(!guest.kick_member(&lobby.lobby_id, &owner.local_user()).await);
        assert!(!owner.kick_member(&lobby.lobby_id, &owner.local_user()).await);
        assert!(owner.kick_member(&lobby.lobby_id, &guest.local_user()).await);

        let events = drain(&mut guest_rx);
        assert_eq!(
            events,
            vec![ProviderEvent::LocalMemberKicked {
                lobby_id: lobby.lobby_id.clone(),
                cause: KickCause::General,
            }]
        );
        assert_eq!(hub.members(&lobby.lobby_id), vec![owner.local_user()]);
    }

    #[tokio::test]
    async fn test_close_and_leave_removes_lobby() {
        let hub = LoopbackHub::new();
        let (owner, _owner_rx) = attached(&hub, "owner").await;
        let (guest, mut guest_rx) = attached(&hub, "guest").await;

        let lobby = owner.create(CreateLobbyRequest::new(4)).await.unwrap();
        guest
            .join(JoinLobbyRequest::new(lobby.lobby_id.clone()))
            .await
            .unwrap();
        drain(&mut guest_rx);

        assert!(!guest.close_and_leave(&lobby.lobby_id).await);
        assert!(owner.close_and_leave(&lobby.lobby_id).await);
        assert!(hub.lobby(&lobby.lobby_id).is_none());
        assert!(drain(&mut guest_rx).contains(&ProviderEvent::LocalMemberKicked {
            lobby_id: lobby.lobby_id,
            cause: KickCause::LobbyClosed,
        }));
    }

    #[tokio::test]
    async fn test_paused_heartbeat_is_not_delivered() {
        let hub = LoopbackHub::new();
        let (owner, mut owner_rx) = attached(&hub, "owner").await;
        let (guest, _guest_rx) = attached(&hub, "guest").await;

        let lobby = owner.create(CreateLobbyRequest::new(4)).await.unwrap();
        guest
            .join(JoinLobbyRequest::new(lobby.lobby_id.clone()))
            .await
            .unwrap();
        drain(&mut owner_rx);

        let heartbeat = guest.heartbeat().unwrap();
        assert!(heartbeat.send_ping(&lobby.lobby_id).await);
        assert_eq!(drain(&mut owner_rx).len(), 1);

        guest.set_heartbeat_paused(true);
        assert!(heartbeat.send_ping(&lobby.lobby_id).await);
        assert!(drain(&mut owner_rx).is_empty());
    }

    #[tokio::test]
    async fn test_out_of_session_lookup() {
        let hub = LoopbackHub::new();
        let (owner, _owner_rx) = attached(&hub, "owner").await;
        let (stranger, _stranger_rx) = attached(&hub, "stranger").await;

        let lobby = owner
            .create(CreateLobbyRequest::new(4).with_lobby_data("map", "harbor"))
            .await
            .unwrap();

        assert_eq!(
            stranger.lobby_data(&lobby.lobby_id, "map").await.unwrap(),
            Some("harbor".to_string())
        );
        assert!(stranger
            .lobby_data(&LobbyId::new("nope"), "map")
            .await
            .is_err());
    }
}
