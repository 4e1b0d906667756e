//! Observers and policies that record what the controller tells them.
//!
//! Events are recorded as short strings such as `member_joined:bob` or
//! `enter_result:join:err:invalid_id`, which keeps assertions readable.

use lobby_controller::actors::{
    AlreadyInLobbyDecision, AlreadyInLobbyPolicy, EnterFailurePolicy, SessionControllerHandle,
    SessionSnapshot,
};
use lobby_controller::errors::EnterFailure;
use lobby_controller::models::{
    EnterResult, Invitation, LeaveReason, LobbyId, LobbyRequest, LobbySummary, Member,
};
use lobby_controller::observers::{
    BrowseObserver, CapabilitySet, ChatObserver, CoreObserver, FriendsObserver, LobbyObserver,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Implements every observer view and records each call.
#[derive(Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<String>>,
    capabilities: Mutex<Vec<CapabilitySet>>,
    notify: Notify,
}

impl RecordingObserver {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn push(&self, event: String) {
        self.events.lock().push(event);
        self.notify.notify_waiters();
    }

    /// All recorded events, in delivery order.
    #[must_use]
    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    /// Events starting with `prefix`.
    #[must_use]
    pub fn events_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.starts_with(prefix))
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn contains(&self, event: &str) -> bool {
        self.events.lock().iter().any(|e| e == event)
    }

    /// Capability sets received through `reset`, one per attach/detach
    /// (recorded from the core view only).
    #[must_use]
    pub fn resets(&self) -> Vec<CapabilitySet> {
        self.capabilities.lock().clone()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
        self.capabilities.lock().clear();
    }

    /// Wait until `event` has been recorded.
    ///
    /// # Panics
    ///
    /// Panics after 5 seconds.
    pub async fn wait_for(&self, event: &str) {
        let wait = async {
            loop {
                let notified = self.notify.notified();
                if self.contains(event) {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(Duration::from_secs(5), wait)
            .await
            .unwrap_or_else(|_| {
                panic!(
                    "timed out waiting for observer event {event:?}, got {:?}",
                    self.events()
                )
            });
    }
}

impl CoreObserver for RecordingObserver {
    fn reset(&self, capabilities: &CapabilitySet) {
        self.capabilities.lock().push(capabilities.clone());
        self.push("reset".to_string());
    }

    fn on_existing_lobby(&self, snapshot: &SessionSnapshot) {
        let lobby = snapshot.lobby_id.as_ref().map_or("-", LobbyId::as_str);
        self.push(format!("existing_lobby:{lobby}"));
    }

    fn on_enter_requested(&self, request: &LobbyRequest) {
        self.push(format!("enter_requested:{}", request.kind()));
    }

    fn on_enter_result(&self, request: &LobbyRequest, result: &EnterResult) {
        let outcome = match result {
            Ok(_) => "ok".to_string(),
            Err(reason) => format!("err:{}", reason.as_str()),
        };
        self.push(format!("enter_result:{}:{outcome}", request.kind()));
    }

    fn on_left(&self, lobby_id: &LobbyId, reason: LeaveReason) {
        self.push(format!("left:{lobby_id}:{}", reason.as_str()));
    }

    fn on_member_joined(&self, member: &Member) {
        self.push(format!("member_joined:{}", member.id));
    }

    fn on_member_left(&self, member: &Member) {
        self.push(format!("member_left:{}", member.id));
    }

    fn on_member_kicked(&self, member: &Member) {
        self.push(format!("member_kicked:{}", member.id));
    }

    fn on_owner_changed(&self, owner: &Member) {
        self.push(format!("owner_changed:{}", owner.id));
    }

    fn on_lobby_data_changed(&self, key: &str, value: &str) {
        self.push(format!("lobby_data:{key}={value}"));
    }

    fn on_member_data_changed(&self, member: &Member, key: &str, value: &str) {
        self.push(format!("member_data:{}:{key}={value}", member.id));
    }

    fn on_invitation(&self, invitation: &Invitation) {
        self.push(format!(
            "invitation:{}:{}",
            invitation.lobby_id, invitation.from.id
        ));
    }
}

impl ChatObserver for RecordingObserver {
    fn on_chat_message(&self, from: &Member, text: &str) {
        self.push(format!("chat:{}:{text}", from.id));
    }
}

impl BrowseObserver for RecordingObserver {
    fn on_lobby_list(&self, lobbies: &[LobbySummary]) {
        self.push(format!("lobby_list:{}", lobbies.len()));
    }
}

impl FriendsObserver for RecordingObserver {
    fn on_friends_updated(&self, friends: &[Member]) {
        self.push(format!("friends:{}", friends.len()));
    }
}

impl LobbyObserver for RecordingObserver {
    fn as_core(&self) -> Option<&dyn CoreObserver> {
        Some(self)
    }

    fn as_chat(&self) -> Option<&dyn ChatObserver> {
        Some(self)
    }

    fn as_browse(&self) -> Option<&dyn BrowseObserver> {
        Some(self)
    }

    fn as_friends(&self) -> Option<&dyn FriendsObserver> {
        Some(self)
    }
}

/// Core observer that panics on every member event.
#[derive(Debug, Default)]
pub struct PanickingObserver;

impl CoreObserver for PanickingObserver {
    fn on_member_joined(&self, _member: &Member) {
        panic!("observer failure on member_joined");
    }

    fn on_enter_result(&self, _request: &LobbyRequest, _result: &EnterResult) {
        panic!("observer failure on enter_result");
    }
}

impl LobbyObserver for PanickingObserver {
    fn as_core(&self) -> Option<&dyn CoreObserver> {
        Some(self)
    }
}

/// Failure policy that records `(kind, reason)` for each call.
#[derive(Debug, Default)]
pub struct RecordingFailurePolicy {
    failures: Mutex<Vec<(&'static str, EnterFailure)>>,
}

impl RecordingFailurePolicy {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    #[must_use]
    pub fn failures(&self) -> Vec<(&'static str, EnterFailure)> {
        self.failures.lock().clone()
    }
}

impl EnterFailurePolicy for RecordingFailurePolicy {
    fn on_failure(
        &self,
        _controller: &SessionControllerHandle,
        reason: EnterFailure,
        request: &LobbyRequest,
    ) {
        self.failures.lock().push((request.kind(), reason));
    }
}

/// Policy that panics whenever the controller consults it.
#[derive(Debug, Default, Clone, Copy)]
pub struct PanickingPolicy;

impl AlreadyInLobbyPolicy for PanickingPolicy {
    fn decide(&self, _request: &LobbyRequest) -> AlreadyInLobbyDecision {
        panic!("policy failure on decide");
    }
}

impl EnterFailurePolicy for PanickingPolicy {
    fn on_failure(
        &self,
        _controller: &SessionControllerHandle,
        _reason: EnterFailure,
        _request: &LobbyRequest,
    ) {
        panic!("policy failure on on_failure");
    }
}
