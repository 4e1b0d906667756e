//! Scriptable lobby backend for controller tests.
//!
//! The mock can be configured to:
//! - Hold create/join until the test releases them (for obsolescence tests)
//! - Return specific outcomes for create and join
//! - Fail initialization
//! - Refuse `close_and_leave`
//! - Offer a heartbeat capability that counts pings
//!
//! Every side-effecting call is recorded for later assertions, and tests can
//! push backend events through [`MockLobbyProvider::emit`].
//!
//! # Example
//!
//! ```rust,ignore
//! use lobby_test_utils::*;
//!
//! let provider = MockLobbyProvider::builder(alice())
//!     .hold_enters()
//!     .with_heartbeat()
//!     .build();
//!
//! handle.attach_provider(provider.clone()).await.unwrap();
//! provider.emit(ProviderEvent::MemberJoined { .. });
//! assert_eq!(provider.leaves(), vec![lobby_id]);
//! ```

use async_trait::async_trait;
use lobby_controller::errors::LobbyError;
use lobby_controller::metadata::Metadata;
use lobby_controller::models::{
    CreateLobbyRequest, EnterResult, EnteredLobby, JoinLobbyRequest, LobbyId, LobbyType, Member,
};
use lobby_controller::provider::{EventSink, HeartbeatCapability, LobbyProvider, ProviderEvent};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Default backend type of the mock.
pub const MOCK_BACKEND_TYPE: &str = "mock";

/// Heartbeat capability that only counts pings.
#[derive(Debug, Default)]
pub struct MockHeartbeat {
    pings: AtomicUsize,
}

impl MockHeartbeat {
    /// Number of pings sent so far.
    #[must_use]
    pub fn pings(&self) -> usize {
        self.pings.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HeartbeatCapability for MockHeartbeat {
    async fn send_ping(&self, _lobby_id: &LobbyId) -> bool {
        self.pings.fetch_add(1, Ordering::SeqCst);
        true
    }
}

/// Calls recorded by the mock.
#[derive(Debug, Default)]
struct Calls {
    leaves: Vec<LobbyId>,
    closes: Vec<LobbyId>,
    kicks: Vec<Member>,
    owner_changes: Vec<Member>,
    lobby_data: Vec<(String, String)>,
    member_data: Vec<(String, String)>,
    invites: Vec<Member>,
    disposals: usize,
}

/// Scriptable [`LobbyProvider`].
pub struct MockLobbyProvider {
    local: Member,
    backend_type: String,
    flush_stale: bool,
    close_succeeds: bool,
    init_error: Option<String>,
    join_owner: Member,
    create_outcome: Mutex<Option<EnterResult>>,
    join_outcome: Mutex<Option<EnterResult>>,
    remote_lobby_data: HashMap<(LobbyId, String), String>,
    heartbeat: Option<Arc<MockHeartbeat>>,
    /// `true` while create/join may complete.
    gate: watch::Sender<bool>,
    /// Number of create/join calls that reached the backend.
    started: watch::Sender<usize>,
    sink: Mutex<Option<EventSink>>,
    calls: Mutex<Calls>,
    lobby_counter: AtomicUsize,
}

impl MockLobbyProvider {
    /// Create a new builder for a backend acting as `local`.
    #[must_use]
    pub fn builder(local: Member) -> MockLobbyProviderBuilder {
        MockLobbyProviderBuilder::new(local)
    }

    /// A mock with default behavior: every create/join succeeds immediately.
    #[must_use]
    pub fn new(local: Member) -> Arc<Self> {
        Self::builder(local).build()
    }

    // ------------------------------------------------------------------
    // Scripting
    // ------------------------------------------------------------------

    /// Block subsequent create/join calls until [`release_enters`](Self::release_enters).
    pub fn hold_enters(&self) {
        self.gate.send_replace(false);
    }

    /// Let held and future create/join calls complete.
    pub fn release_enters(&self) {
        self.gate.send_replace(true);
    }

    pub fn set_create_outcome(&self, outcome: EnterResult) {
        *self.create_outcome.lock() = Some(outcome);
    }

    pub fn set_join_outcome(&self, outcome: EnterResult) {
        *self.join_outcome.lock() = Some(outcome);
    }

    /// Wait until at least `count` create/join calls reached the backend.
    ///
    /// # Panics
    ///
    /// Panics after 5 seconds.
    pub async fn wait_for_enters_started(&self, count: usize) {
        let mut started = self.started.subscribe();
        tokio::time::timeout(Duration::from_secs(5), started.wait_for(|n| *n >= count))
            .await
            .expect("timed out waiting for create/join to reach the backend")
            .expect("mock provider dropped");
    }

    /// Deliver an event as this backend. Returns `false` before
    /// initialization or once the controller is gone.
    pub fn emit(&self, event: ProviderEvent) -> bool {
        self.sink
            .lock()
            .as_ref()
            .is_some_and(|sink| sink.emit(event))
    }

    /// Attach generation assigned by the controller.
    #[must_use]
    pub fn generation(&self) -> Option<u64> {
        self.sink.lock().as_ref().map(EventSink::generation)
    }

    // ------------------------------------------------------------------
    // Recorded calls
    // ------------------------------------------------------------------

    #[must_use]
    pub fn enters_started(&self) -> usize {
        *self.started.borrow()
    }

    #[must_use]
    pub fn leaves(&self) -> Vec<LobbyId> {
        self.calls.lock().leaves.clone()
    }

    #[must_use]
    pub fn closes(&self) -> Vec<LobbyId> {
        self.calls.lock().closes.clone()
    }

    #[must_use]
    pub fn kicks(&self) -> Vec<Member> {
        self.calls.lock().kicks.clone()
    }

    #[must_use]
    pub fn owner_changes(&self) -> Vec<Member> {
        self.calls.lock().owner_changes.clone()
    }

    #[must_use]
    pub fn lobby_data_writes(&self) -> Vec<(String, String)> {
        self.calls.lock().lobby_data.clone()
    }

    #[must_use]
    pub fn member_data_writes(&self) -> Vec<(String, String)> {
        self.calls.lock().member_data.clone()
    }

    #[must_use]
    pub fn invites(&self) -> Vec<Member> {
        self.calls.lock().invites.clone()
    }

    #[must_use]
    pub fn disposals(&self) -> usize {
        self.calls.lock().disposals
    }

    #[must_use]
    pub fn heartbeat_pings(&self) -> usize {
        self.heartbeat.as_ref().map_or(0, |h| h.pings())
    }

    async fn pass_gate(&self) {
        self.started.send_modify(|n| *n += 1);
        let mut gate = self.gate.subscribe();
        let _ = gate.wait_for(|open| *open).await;
    }

    fn entered(
        &self,
        lobby_id: LobbyId,
        owner: Member,
        capacity: u32,
        lobby_type: LobbyType,
        lobby_data: Metadata,
        local_data: Metadata,
    ) -> EnteredLobby {
        let mut members = vec![owner.clone()];
        if owner != self.local {
            members.push(self.local.clone());
        }
        let member_data = members
            .iter()
            .map(|m| {
                let data = if *m == self.local {
                    local_data.clone()
                } else {
                    Metadata::new()
                };
                (m.clone(), data)
            })
            .collect();

        EnteredLobby {
            lobby_id,
            owner,
            local_member: self.local.clone(),
            capacity,
            lobby_type,
            members,
            lobby_data,
            member_data,
        }
    }
}

#[async_trait]
impl LobbyProvider for MockLobbyProvider {
    fn backend_type(&self) -> &str {
        &self.backend_type
    }

    async fn initialize(&self, events: EventSink) -> Result<(), LobbyError> {
        if let Some(message) = &self.init_error {
            return Err(LobbyError::Provider(message.clone()));
        }
        *self.sink.lock() = Some(events);
        Ok(())
    }

    fn local_user(&self) -> Member {
        self.local.clone()
    }

    async fn create(&self, request: CreateLobbyRequest) -> EnterResult {
        self.pass_gate().await;
        if let Some(outcome) = self.create_outcome.lock().clone() {
            return outcome;
        }
        let n = self.lobby_counter.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(self.entered(
            LobbyId::new(format!("mock-lobby-{n}")),
            self.local.clone(),
            request.capacity,
            request.lobby_type,
            request.lobby_data,
            request.member_data,
        ))
    }

    async fn join(&self, request: JoinLobbyRequest) -> EnterResult {
        self.pass_gate().await;
        if let Some(outcome) = self.join_outcome.lock().clone() {
            return outcome;
        }
        Ok(self.entered(
            request.lobby_id,
            self.join_owner.clone(),
            4,
            LobbyType::Public,
            Metadata::new(),
            request.member_data,
        ))
    }

    async fn send_invite(&self, _lobby_id: &LobbyId, member: &Member) -> bool {
        self.calls.lock().invites.push(member.clone());
        true
    }

    async fn leave(&self, lobby_id: &LobbyId) {
        self.calls.lock().leaves.push(lobby_id.clone());
    }

    async fn close_and_leave(&self, lobby_id: &LobbyId) -> bool {
        self.calls.lock().closes.push(lobby_id.clone());
        self.close_succeeds
    }

    async fn set_owner(&self, _lobby_id: &LobbyId, member: &Member) -> bool {
        self.calls.lock().owner_changes.push(member.clone());
        true
    }

    async fn kick_member(&self, _lobby_id: &LobbyId, member: &Member) -> bool {
        self.calls.lock().kicks.push(member.clone());
        true
    }

    async fn set_lobby_data(&self, _lobby_id: &LobbyId, key: &str, value: &str) -> bool {
        self.calls
            .lock()
            .lobby_data
            .push((key.to_string(), value.to_string()));
        true
    }

    async fn set_local_member_data(&self, _lobby_id: &LobbyId, key: &str, value: &str) -> bool {
        self.calls
            .lock()
            .member_data
            .push((key.to_string(), value.to_string()));
        true
    }

    async fn lobby_data(&self, lobby_id: &LobbyId, key: &str) -> Result<Option<String>, LobbyError> {
        Ok(self
            .remote_lobby_data
            .get(&(lobby_id.clone(), key.to_string()))
            .cloned())
    }

    async fn member_data(
        &self,
        _lobby_id: &LobbyId,
        _member: &Member,
        _key: &str,
    ) -> Result<Option<String>, LobbyError> {
        Err(LobbyError::Provider("member lookup not scripted".to_string()))
    }

    async fn dispose(&self) {
        self.calls.lock().disposals += 1;
    }

    fn should_flush_stale_lobbies(&self) -> bool {
        self.flush_stale
    }

    fn heartbeat(&self) -> Option<Arc<dyn HeartbeatCapability>> {
        self.heartbeat
            .as_ref()
            .map(|h| Arc::clone(h) as Arc<dyn HeartbeatCapability>)
    }
}

/// Builder for [`MockLobbyProvider`].
pub struct MockLobbyProviderBuilder {
    local: Member,
    backend_type: String,
    hold_enters: bool,
    flush_stale: bool,
    close_succeeds: bool,
    init_error: Option<String>,
    join_owner: Member,
    create_outcome: Option<EnterResult>,
    join_outcome: Option<EnterResult>,
    remote_lobby_data: HashMap<(LobbyId, String), String>,
    heartbeat: bool,
}

impl MockLobbyProviderBuilder {
    #[must_use]
    pub fn new(local: Member) -> Self {
        Self {
            local,
            backend_type: MOCK_BACKEND_TYPE.to_string(),
            hold_enters: false,
            flush_stale: true,
            close_succeeds: true,
            init_error: None,
            join_owner: Member::new("remote-owner", "Remote Owner"),
            create_outcome: None,
            join_outcome: None,
            remote_lobby_data: HashMap::new(),
            heartbeat: false,
        }
    }

    #[must_use]
    pub fn backend_type(mut self, backend_type: impl Into<String>) -> Self {
        self.backend_type = backend_type.into();
        self
    }

    /// Start with create/join blocked.
    #[must_use]
    pub fn hold_enters(mut self) -> Self {
        self.hold_enters = true;
        self
    }

    #[must_use]
    pub fn without_stale_flush(mut self) -> Self {
        self.flush_stale = false;
        self
    }

    /// Make `close_and_leave` report failure.
    #[must_use]
    pub fn refuse_close(mut self) -> Self {
        self.close_succeeds = false;
        self
    }

    #[must_use]
    pub fn fail_initialize(mut self, message: impl Into<String>) -> Self {
        self.init_error = Some(message.into());
        self
    }

    /// Owner reported for joined lobbies.
    #[must_use]
    pub fn join_owner(mut self, owner: Member) -> Self {
        self.join_owner = owner;
        self
    }

    #[must_use]
    pub fn create_outcome(mut self, outcome: EnterResult) -> Self {
        self.create_outcome = Some(outcome);
        self
    }

    #[must_use]
    pub fn join_outcome(mut self, outcome: EnterResult) -> Self {
        self.join_outcome = Some(outcome);
        self
    }

    /// Lobby data served for out-of-session lookups.
    #[must_use]
    pub fn with_remote_lobby_data(
        mut self,
        lobby_id: impl Into<LobbyId>,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.remote_lobby_data
            .insert((lobby_id.into(), key.into()), value.into());
        self
    }

    #[must_use]
    pub fn with_heartbeat(mut self) -> Self {
        self.heartbeat = true;
        self
    }

    #[must_use]
    pub fn build(self) -> Arc<MockLobbyProvider> {
        let (gate, _) = watch::channel(!self.hold_enters);
        let (started, _) = watch::channel(0);
        Arc::new(MockLobbyProvider {
            local: self.local,
            backend_type: self.backend_type,
            flush_stale: self.flush_stale,
            close_succeeds: self.close_succeeds,
            init_error: self.init_error,
            join_owner: self.join_owner,
            create_outcome: Mutex::new(self.create_outcome),
            join_outcome: Mutex::new(self.join_outcome),
            remote_lobby_data: self.remote_lobby_data,
            heartbeat: self.heartbeat.then(|| Arc::new(MockHeartbeat::default())),
            gate,
            started,
            sink: Mutex::new(None),
            calls: Mutex::new(Calls::default()),
            lobby_counter: AtomicUsize::new(0),
        })
    }
}
