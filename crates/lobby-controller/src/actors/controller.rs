//! `SessionController` - the single owner of lobby session state.
//!
//! The controller is an actor: one task owns the state machine, the session
//! cache, heartbeat subscriptions, capability modules and the observer
//! registry. Callers talk to it through a cloneable
//! [`SessionControllerHandle`].
//!
//! - Backend create/join run as spawned tasks; their completion is posted
//!   back to the mailbox and re-validated against the obsolete flag of the
//!   backend instance they were issued against.
//! - Backend events arrive on a separate channel tagged with the attach
//!   generation; events from replaced instances are dropped.
//! - Heartbeat ticks come from an interval inside the actor's `select!`.
//! - After every mutation a [`SessionSnapshot`] is published through a
//!   `watch` channel, so reads on the handle are synchronous.
//!
//! # Backend swap
//!
//! `attach_provider` leaves the current session, then disposes the old
//! instance right away if it has no create/join in flight. Otherwise the
//! instance is marked obsolete and parked in `draining` until its last
//! pending completion, which reports `StaleRequest` (after leaving any lobby
//! it created) and disposes it.

use super::capabilities::{CapabilityModules, ProcedureHandler};
use super::heartbeat::HeartbeatTracker;
use super::messages::{ControllerMessage, EnterCompletion, PendingEnter};
use super::policies::{
    AlreadyInLobbyDecision, AlreadyInLobbyPolicy, EnterFailurePolicy, LeaveCurrentLobby,
    LogEnterFailure, PreAttachPolicy,
};
use super::session::{LobbySession, SessionSnapshot};
use super::state::{LobbyState, LobbyStateMachine};
use crate::config::Config;
use crate::errors::{EnterFailure, LobbyError};
use crate::ledger::{MemoryLedger, StaleSessionLedger};
use crate::models::{
    BrowseFilter, CreateLobbyRequest, EnterResult, JoinLobbyRequest, KickCause, LeaveReason,
    LobbyId, LobbyRequest, Member,
};
use crate::observability::metrics::{
    record_enter, record_enter_duration, record_heartbeat_timeout, record_leave,
    record_ledger_error, record_policy_fault, record_stale_session_flushed,
    set_providers_draining,
};
use crate::observers::{CapabilitySet, LobbyObserver, ObserverId, ObserverRegistry};
use crate::provider::{AttachedProvider, EventSink, LobbyProvider, ProviderEvent};
use std::collections::{HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Handle to the `SessionController`.
///
/// Mutating methods are async and answered through oneshot channels.
/// `Ok(false)` means the call was a no-op because a local precondition
/// (state, ownership) did not hold; `Err` only reports a dead controller.
#[derive(Clone)]
pub struct SessionControllerHandle {
    sender: mpsc::Sender<ControllerMessage>,
    cancel_token: CancellationToken,
    snapshot: watch::Receiver<Arc<SessionSnapshot>>,
}

impl SessionControllerHandle {
    async fn request<T>(
        &self,
        message: impl FnOnce(oneshot::Sender<T>) -> ControllerMessage,
    ) -> Result<T, LobbyError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(message(tx))
            .await
            .map_err(|e| LobbyError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| LobbyError::Internal(format!("response receive failed: {e}")))
    }

    /// Create a new lobby and enter it.
    pub async fn create(&self, request: CreateLobbyRequest) -> Result<EnterResult, LobbyError> {
        self.create_with_cancellation(request, CancellationToken::new())
            .await
    }

    /// Like [`create`](Self::create); cancelling `cancel` fails the attempt
    /// with `EnterFailure::General`.
    pub async fn create_with_cancellation(
        &self,
        request: CreateLobbyRequest,
        cancel: CancellationToken,
    ) -> Result<EnterResult, LobbyError> {
        self.enter(LobbyRequest::Create(request), cancel).await
    }

    /// Join an existing lobby.
    pub async fn join(&self, request: JoinLobbyRequest) -> Result<EnterResult, LobbyError> {
        self.join_with_cancellation(request, CancellationToken::new())
            .await
    }

    pub async fn join_with_cancellation(
        &self,
        request: JoinLobbyRequest,
        cancel: CancellationToken,
    ) -> Result<EnterResult, LobbyError> {
        self.enter(LobbyRequest::Join(request), cancel).await
    }

    /// Runs a create or join request.
    pub async fn enter(
        &self,
        request: LobbyRequest,
        cancel: CancellationToken,
    ) -> Result<EnterResult, LobbyError> {
        self.request(|respond_to| ControllerMessage::Enter {
            request,
            cancel,
            respond_to,
        })
        .await
    }

    /// Leave the current lobby.
    pub async fn leave(&self) -> Result<bool, LobbyError> {
        self.request(|respond_to| ControllerMessage::Leave { respond_to })
            .await
    }

    /// Close the lobby for everyone (owner only) and leave it.
    ///
    /// Returns `Ok(false)` if the backend refused to close; the local member
    /// has still left in that case.
    pub async fn close_and_leave(&self) -> Result<bool, LobbyError> {
        self.request(|respond_to| ControllerMessage::CloseAndLeave { respond_to })
            .await
    }

    /// Hand ownership to another member (owner only).
    pub async fn set_owner(&self, member: Member) -> Result<bool, LobbyError> {
        self.request(|respond_to| ControllerMessage::SetOwner { member, respond_to })
            .await
    }

    /// Remove another member (owner only).
    pub async fn kick_member(&self, member: Member) -> Result<bool, LobbyError> {
        self.request(|respond_to| ControllerMessage::KickMember { member, respond_to })
            .await
    }

    /// Set a lobby metadata entry (owner only).
    pub async fn set_lobby_data(
        &self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<bool, LobbyError> {
        let (key, value) = (key.into(), value.into());
        self.request(|respond_to| ControllerMessage::SetLobbyData {
            key,
            value,
            respond_to,
        })
        .await
    }

    /// Set a metadata entry on the local member.
    pub async fn set_member_data(
        &self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<bool, LobbyError> {
        let (key, value) = (key.into(), value.into());
        self.request(|respond_to| ControllerMessage::SetMemberData {
            key,
            value,
            respond_to,
        })
        .await
    }

    pub async fn send_invite(&self, member: Member) -> Result<bool, LobbyError> {
        self.request(|respond_to| ControllerMessage::SendInvite { member, respond_to })
            .await
    }

    pub async fn send_chat(&self, text: impl Into<String>) -> Result<bool, LobbyError> {
        let text = text.into();
        self.request(|respond_to| ControllerMessage::SendChat { text, respond_to })
            .await
    }

    /// Invoke `name` on the other lobby members.
    pub async fn call_procedure(
        &self,
        name: impl Into<String>,
        payload: impl Into<String>,
    ) -> Result<bool, LobbyError> {
        let (name, payload) = (name.into(), payload.into());
        self.request(|respond_to| ControllerMessage::CallProcedure {
            name,
            payload,
            respond_to,
        })
        .await
    }

    /// Route incoming calls of `name` to `handler`. Returns `Ok(true)` if an
    /// earlier handler was replaced.
    pub async fn register_procedure<F>(
        &self,
        name: impl Into<String>,
        handler: F,
    ) -> Result<bool, LobbyError>
    where
        F: Fn(&Member, &str) + Send + Sync + 'static,
    {
        let name = name.into();
        let handler: ProcedureHandler = Arc::new(handler);
        self.request(|respond_to| ControllerMessage::RegisterProcedure {
            name,
            handler,
            respond_to,
        })
        .await
    }

    pub async fn unregister_procedure(&self, name: impl Into<String>) -> Result<bool, LobbyError> {
        let name = name.into();
        self.request(|respond_to| ControllerMessage::UnregisterProcedure { name, respond_to })
            .await
    }

    /// Ask the backend for a lobby listing. Results reach browse observers.
    pub async fn request_lobby_list(&self, filter: BrowseFilter) -> Result<bool, LobbyError> {
        self.request(|respond_to| ControllerMessage::RequestLobbyList { filter, respond_to })
            .await
    }

    pub async fn friends(&self) -> Result<Vec<Member>, LobbyError> {
        self.request(|respond_to| ControllerMessage::Friends { respond_to })
            .await
    }

    /// Swap in a new backend.
    ///
    /// # Errors
    ///
    /// Returns `LobbyError::Provider` if the backend fails to initialize;
    /// the controller is then left without a backend.
    pub async fn attach_provider(&self, provider: Arc<dyn LobbyProvider>) -> Result<(), LobbyError> {
        self.request(|respond_to| ControllerMessage::AttachProvider {
            provider,
            respond_to,
        })
        .await?
    }

    /// Leave the current session and release the backend without a
    /// replacement.
    pub async fn detach_provider(&self) -> Result<(), LobbyError> {
        self.request(|respond_to| ControllerMessage::DetachProvider { respond_to })
            .await
    }

    /// Register an observer. If a session is active it immediately receives
    /// `on_existing_lobby`.
    pub async fn register_observer(
        &self,
        observer: Arc<dyn LobbyObserver>,
    ) -> Result<ObserverId, LobbyError> {
        self.request(|respond_to| ControllerMessage::RegisterObserver {
            observer,
            respond_to,
        })
        .await
    }

    pub async fn unregister_observer(&self, id: ObserverId) -> Result<bool, LobbyError> {
        self.request(|respond_to| ControllerMessage::UnregisterObserver { id, respond_to })
            .await
    }

    /// Leave, release the backend and stop the controller task.
    pub async fn shutdown(&self) -> Result<(), LobbyError> {
        self.request(|respond_to| ControllerMessage::Shutdown { respond_to })
            .await
    }

    /// Cancel the actor (for immediate shutdown).
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    // ------------------------------------------------------------------
    // Synchronous reads
    // ------------------------------------------------------------------

    /// Latest published snapshot.
    #[must_use]
    pub fn session(&self) -> Arc<SessionSnapshot> {
        Arc::clone(&self.snapshot.borrow())
    }

    /// Receiver that is notified after every controller mutation.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Arc<SessionSnapshot>> {
        self.snapshot.clone()
    }

    #[must_use]
    pub fn state(&self) -> LobbyState {
        self.snapshot.borrow().state
    }

    #[must_use]
    pub fn is_owner(&self) -> bool {
        self.snapshot.borrow().is_owner()
    }

    #[must_use]
    pub fn lobby_data_or_default(&self, key: &str, default: &str) -> String {
        self.snapshot.borrow().lobby_data_or_default(key, default)
    }

    #[must_use]
    pub fn member_data_or_default(&self, member: &Member, key: &str, default: &str) -> String {
        self.snapshot
            .borrow()
            .member_data_or_default(member, key, default)
    }

    /// Lobby data for `lobby_id`, or the current lobby when `None`.
    ///
    /// The current lobby is served from the cache; any other lobby is looked
    /// up through the backend, falling back to `default` on any failure.
    pub async fn get_lobby_data_or_default(
        &self,
        key: &str,
        default: &str,
        lobby_id: Option<&LobbyId>,
    ) -> String {
        let target = {
            let snapshot = self.snapshot.borrow();
            match lobby_id {
                Some(id) if snapshot.lobby_id.as_ref() != Some(id) => id.clone(),
                _ => return snapshot.lobby_data_or_default(key, default),
            }
        };

        let (key, fallback) = (key.to_string(), default.to_string());
        self.request(|respond_to| ControllerMessage::GetLobbyData {
            lobby_id: target,
            key,
            default: fallback,
            respond_to,
        })
        .await
        .unwrap_or_else(|_| default.to_string())
    }

    /// Member data for `member` in `lobby_id`, or the current lobby when
    /// `None`. Same cache/backend split as
    /// [`get_lobby_data_or_default`](Self::get_lobby_data_or_default).
    pub async fn get_member_data_or_default(
        &self,
        member: &Member,
        key: &str,
        default: &str,
        lobby_id: Option<&LobbyId>,
    ) -> String {
        let target = {
            let snapshot = self.snapshot.borrow();
            match lobby_id {
                Some(id) if snapshot.lobby_id.as_ref() != Some(id) => id.clone(),
                _ => return snapshot.member_data_or_default(member, key, default),
            }
        };

        let (member, key, fallback) = (member.clone(), key.to_string(), default.to_string());
        self.request(|respond_to| ControllerMessage::GetMemberData {
            lobby_id: target,
            member,
            key,
            default: fallback,
            respond_to,
        })
        .await
        .unwrap_or_else(|_| default.to_string())
    }
}

/// Builder for the controller task.
pub struct SessionControllerBuilder {
    config: Config,
    ledger: Arc<dyn StaleSessionLedger>,
    already_in_lobby: Arc<dyn AlreadyInLobbyPolicy>,
    create_failure_policy: Arc<dyn EnterFailurePolicy>,
    join_failure_policy: Arc<dyn EnterFailurePolicy>,
}

impl SessionControllerBuilder {
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            config,
            ledger: Arc::new(MemoryLedger::new()),
            already_in_lobby: Arc::new(LeaveCurrentLobby),
            create_failure_policy: Arc::new(LogEnterFailure),
            join_failure_policy: Arc::new(LogEnterFailure),
        }
    }

    #[must_use]
    pub fn ledger(mut self, ledger: Arc<dyn StaleSessionLedger>) -> Self {
        self.ledger = ledger;
        self
    }

    #[must_use]
    pub fn already_in_lobby_policy(mut self, policy: Arc<dyn AlreadyInLobbyPolicy>) -> Self {
        self.already_in_lobby = policy;
        self
    }

    #[must_use]
    pub fn create_failure_policy(mut self, policy: Arc<dyn EnterFailurePolicy>) -> Self {
        self.create_failure_policy = policy;
        self
    }

    #[must_use]
    pub fn join_failure_policy(mut self, policy: Arc<dyn EnterFailurePolicy>) -> Self {
        self.join_failure_policy = policy;
        self
    }

    /// Spawn the controller task and return a handle plus its `JoinHandle`.
    #[must_use]
    pub fn spawn(self) -> (SessionControllerHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(self.config.mailbox_capacity.max(1));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(Arc::new(SessionSnapshot::default()));
        let cancel_token = CancellationToken::new();

        let controller = SessionController {
            receiver,
            self_sender: sender.downgrade(),
            events_tx,
            events_rx,
            cancel_token: cancel_token.clone(),
            snapshot_tx,
            heartbeat: HeartbeatTracker::new(
                self.config.heartbeat_timeout,
                self.config.heartbeat_grace,
            ),
            config: self.config,
            state: LobbyStateMachine::new(),
            session: LobbySession::new(),
            provider: None,
            draining: HashMap::new(),
            generation: 0,
            session_generation: None,
            joining_events: Vec::new(),
            capabilities: CapabilityModules::new(),
            observers: ObserverRegistry::new(),
            ledger: self.ledger,
            already_in_lobby: self.already_in_lobby,
            create_failure_policy: self.create_failure_policy,
            join_failure_policy: self.join_failure_policy,
            pending: VecDeque::new(),
        };

        let task_handle = tokio::spawn(controller.run());

        (
            SessionControllerHandle {
                sender,
                cancel_token,
                snapshot: snapshot_rx,
            },
            task_handle,
        )
    }
}

/// The controller actor. Constructed through [`SessionControllerBuilder`].
pub struct SessionController {
    receiver: mpsc::Receiver<ControllerMessage>,
    /// Lets enter tasks post completions without keeping the mailbox open.
    self_sender: mpsc::WeakSender<ControllerMessage>,
    events_tx: mpsc::UnboundedSender<(u64, ProviderEvent)>,
    events_rx: mpsc::UnboundedReceiver<(u64, ProviderEvent)>,
    cancel_token: CancellationToken,
    snapshot_tx: watch::Sender<Arc<SessionSnapshot>>,
    config: Config,
    state: LobbyStateMachine,
    session: LobbySession,
    /// Active backend instance.
    provider: Option<Arc<AttachedProvider>>,
    /// Obsolete instances waiting for their in-flight create/join, by generation.
    draining: HashMap<u64, Arc<AttachedProvider>>,
    /// Generation of the most recently attached instance.
    generation: u64,
    /// Generation of the instance the current Joining/InLobby state belongs to.
    session_generation: Option<u64>,
    /// Lobby events that arrived while `Joining`, replayed once the enter lands.
    joining_events: Vec<ProviderEvent>,
    heartbeat: HeartbeatTracker,
    capabilities: CapabilityModules,
    observers: ObserverRegistry,
    ledger: Arc<dyn StaleSessionLedger>,
    already_in_lobby: Arc<dyn AlreadyInLobbyPolicy>,
    create_failure_policy: Arc<dyn EnterFailurePolicy>,
    join_failure_policy: Arc<dyn EnterFailurePolicy>,
    pending: VecDeque<PendingEnter>,
}

impl SessionController {
    #[must_use]
    pub fn builder(config: Config) -> SessionControllerBuilder {
        SessionControllerBuilder::new(config)
    }

    /// Run the actor message loop.
    #[instrument(skip_all, name = "lobby.actor.controller")]
    async fn run(mut self) {
        info!(
            target: "lobby.actor.controller",
            heartbeat_interval_ms = self.config.heartbeat_interval.as_millis() as u64,
            heartbeat_timeout_ms = self.config.heartbeat_timeout.as_millis() as u64,
            "SessionController started"
        );

        let period = self.config.heartbeat_interval.max(Duration::from_millis(1));
        let mut heartbeat_tick = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "lobby.actor.controller",
                        "SessionController received cancellation signal"
                    );
                    self.shutdown().await;
                    break;
                }

                _ = heartbeat_tick.tick() => {
                    self.on_heartbeat_tick().await;
                }

                Some((generation, event)) = self.events_rx.recv() => {
                    self.handle_event(generation, event).await;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(ControllerMessage::Shutdown { respond_to }) => {
                            self.shutdown().await;
                            let _ = respond_to.send(());
                            break;
                        }
                        Some(message) => {
                            self.handle_message(message).await;
                        }
                        None => {
                            info!(
                                target: "lobby.actor.controller",
                                "SessionController channel closed, exiting"
                            );
                            self.shutdown().await;
                            break;
                        }
                    }
                }
            }
        }

        info!(
            target: "lobby.actor.controller",
            observers = self.observers.len(),
            "SessionController stopped"
        );
    }

    /// Handle a single message.
    async fn handle_message(&mut self, message: ControllerMessage) {
        debug!(
            target: "lobby.actor.controller",
            message = message.name(),
            state = %self.state.current(),
            "Handling message"
        );

        match message {
            ControllerMessage::Enter {
                request,
                cancel,
                respond_to,
            } => {
                self.enter(request, cancel, respond_to).await;
            }

            ControllerMessage::EnterCompleted(completion) => {
                self.complete_enter(completion).await;
            }

            ControllerMessage::Leave { respond_to } => {
                let result = self.leave(LeaveReason::UserRequested).await;
                let _ = respond_to.send(result);
            }

            ControllerMessage::CloseAndLeave { respond_to } => {
                let result = self.close_and_leave().await;
                let _ = respond_to.send(result);
            }

            ControllerMessage::SetOwner { member, respond_to } => {
                let result = self.set_owner(member).await;
                let _ = respond_to.send(result);
            }

            ControllerMessage::KickMember { member, respond_to } => {
                let result = self.kick_member(member).await;
                let _ = respond_to.send(result);
            }

            ControllerMessage::SetLobbyData {
                key,
                value,
                respond_to,
            } => {
                let result = self.set_lobby_data(&key, &value).await;
                let _ = respond_to.send(result);
            }

            ControllerMessage::SetMemberData {
                key,
                value,
                respond_to,
            } => {
                let result = self.set_member_data(&key, &value).await;
                let _ = respond_to.send(result);
            }

            ControllerMessage::GetLobbyData {
                lobby_id,
                key,
                default,
                respond_to,
            } => {
                if self.session.is_current(&lobby_id) {
                    let value = self.session_snapshot().lobby_data_or_default(&key, &default);
                    let _ = respond_to.send(value);
                    return;
                }
                let Some(provider) = self.active_provider() else {
                    let _ = respond_to.send(default);
                    return;
                };
                // Out-of-session lookups must not stall the mailbox
                tokio::spawn(async move {
                    let value = match provider.lobby_data(&lobby_id, &key).await {
                        Ok(Some(value)) => value,
                        Ok(None) => default,
                        Err(e) => {
                            debug!(
                                target: "lobby.actor.controller",
                                error = %e,
                                "Lobby data lookup failed, using default"
                            );
                            default
                        }
                    };
                    let _ = respond_to.send(value);
                });
            }

            ControllerMessage::GetMemberData {
                lobby_id,
                member,
                key,
                default,
                respond_to,
            } => {
                if self.session.is_current(&lobby_id) {
                    let value =
                        self.session_snapshot()
                            .member_data_or_default(&member, &key, &default);
                    let _ = respond_to.send(value);
                    return;
                }
                let Some(provider) = self.active_provider() else {
                    let _ = respond_to.send(default);
                    return;
                };
                tokio::spawn(async move {
                    let value = match provider.member_data(&lobby_id, &member, &key).await {
                        Ok(Some(value)) => value,
                        Ok(None) => default,
                        Err(e) => {
                            debug!(
                                target: "lobby.actor.controller",
                                error = %e,
                                "Member data lookup failed, using default"
                            );
                            default
                        }
                    };
                    let _ = respond_to.send(value);
                });
            }

            ControllerMessage::SendInvite { member, respond_to } => {
                let result = self.send_invite(&member).await;
                let _ = respond_to.send(result);
            }

            ControllerMessage::SendChat { text, respond_to } => {
                let result = self.send_chat(&text).await;
                let _ = respond_to.send(result);
            }

            ControllerMessage::CallProcedure {
                name,
                payload,
                respond_to,
            } => {
                let result = self.call_procedure(&name, &payload).await;
                let _ = respond_to.send(result);
            }

            ControllerMessage::RegisterProcedure {
                name,
                handler,
                respond_to,
            } => {
                let replaced = self.capabilities.register_procedure(name, handler);
                let _ = respond_to.send(replaced);
            }

            ControllerMessage::UnregisterProcedure { name, respond_to } => {
                let removed = self.capabilities.unregister_procedure(&name);
                let _ = respond_to.send(removed);
            }

            ControllerMessage::RequestLobbyList { filter, respond_to } => {
                let result = match self.capabilities.browser() {
                    Some(browser) => browser.request_lobby_list(&filter).await,
                    None => false,
                };
                let _ = respond_to.send(result);
            }

            ControllerMessage::Friends { respond_to } => {
                let Some(friends) = self.capabilities.friends() else {
                    let _ = respond_to.send(Vec::new());
                    return;
                };
                tokio::spawn(async move {
                    let _ = respond_to.send(friends.friends().await);
                });
            }

            ControllerMessage::AttachProvider {
                provider,
                respond_to,
            } => {
                let result = self.attach_provider(provider).await;
                let _ = respond_to.send(result);
            }

            ControllerMessage::DetachProvider { respond_to } => {
                self.release_provider().await;
                self.observers.reset_all(&CapabilitySet::default());
                let _ = respond_to.send(());
            }

            ControllerMessage::RegisterObserver {
                observer,
                respond_to,
            } => {
                let id = self.register_observer(observer);
                let _ = respond_to.send(id);
            }

            ControllerMessage::UnregisterObserver { id, respond_to } => {
                let _ = respond_to.send(self.observers.unregister(id));
            }

            ControllerMessage::Shutdown { respond_to } => {
                // Handled in run(); only reachable if routed here directly
                self.shutdown().await;
                let _ = respond_to.send(());
            }
        }
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn active_provider(&self) -> Option<Arc<dyn LobbyProvider>> {
        self.provider.as_ref().map(|p| Arc::clone(p.provider()))
    }

    fn session_snapshot(&self) -> SessionSnapshot {
        self.session.snapshot(
            self.state.current(),
            self.provider.as_ref().map(|p| p.backend_type()),
        )
    }

    /// Publishes the current cache for synchronous readers.
    fn publish(&self) {
        debug_assert!(
            self.state.current() == LobbyState::Joining || self.session.is_consistent(),
            "session cache invariants violated"
        );
        self.snapshot_tx
            .send_replace(Arc::new(self.session_snapshot()));
    }

    /// State is in `allowed` and, if required, the local member owns the lobby.
    fn permitted(&self, allowed: &[LobbyState], requires_ownership: bool) -> bool {
        allowed.contains(&self.state.current()) && (!requires_ownership || self.session.is_owner())
    }

    /// Builds a handle for policies. `None` once every external handle is gone.
    fn handle(&self) -> Option<SessionControllerHandle> {
        self.self_sender
            .upgrade()
            .map(|sender| SessionControllerHandle {
                sender,
                cancel_token: self.cancel_token.clone(),
                snapshot: self.snapshot_tx.subscribe(),
            })
    }

    fn resubscribe_heartbeat(&mut self) {
        if self.capabilities.heartbeat().is_some() {
            self.heartbeat.resubscribe(&self.session, Instant::now());
        } else {
            self.heartbeat.clear();
        }
    }

    // ------------------------------------------------------------------
    // Create / join
    // ------------------------------------------------------------------

    async fn enter(
        &mut self,
        request: LobbyRequest,
        cancel: CancellationToken,
        respond_to: oneshot::Sender<EnterResult>,
    ) {
        let Some(provider) = self.provider.clone() else {
            self.hold_until_attached(PendingEnter {
                request,
                cancel,
                respond_to,
            });
            return;
        };

        if self.state.is(LobbyState::InLobby) {
            let policy = Arc::clone(&self.already_in_lobby);
            let decision = panic::catch_unwind(AssertUnwindSafe(|| policy.decide(&request)))
                .unwrap_or_else(|_| {
                    warn!(
                        target: "lobby.actor.controller",
                        kind = request.kind(),
                        "Already-in-lobby policy panicked, rejecting request"
                    );
                    record_policy_fault("already_in_lobby");
                    AlreadyInLobbyDecision::Reject
                });
            match decision {
                AlreadyInLobbyDecision::LeaveAndProceed => {
                    self.leave(LeaveReason::UserRequested).await;
                }
                AlreadyInLobbyDecision::Reject => {
                    debug!(
                        target: "lobby.actor.controller",
                        kind = request.kind(),
                        "Already in a lobby, request vetoed by policy"
                    );
                    record_enter(request.kind(), EnterFailure::General.as_str());
                    let _ = respond_to.send(Err(EnterFailure::General));
                    return;
                }
            }
        }

        if !self.state.transition(LobbyState::Joining) {
            debug!(
                target: "lobby.actor.controller",
                kind = request.kind(),
                state = %self.state.current(),
                "Enter rejected by state machine"
            );
            record_enter(request.kind(), EnterFailure::General.as_str());
            let _ = respond_to.send(Err(EnterFailure::General));
            return;
        }

        self.session_generation = Some(provider.generation());
        self.publish();
        self.observers
            .core("enter_requested", |o| o.on_enter_requested(&request));

        provider.begin_operation();
        self.spawn_enter(provider, request, cancel, respond_to);
    }

    /// Applies the pre-attach policy to a create/join with no backend.
    fn hold_until_attached(&mut self, pending: PendingEnter) {
        let capacity = match self.config.pre_attach {
            PreAttachPolicy::Reject => 0,
            PreAttachPolicy::Queue { max_pending } => max_pending,
        };

        if self.pending.len() < capacity {
            debug!(
                target: "lobby.actor.controller",
                kind = pending.request.kind(),
                queued = self.pending.len() + 1,
                "No backend attached, request queued"
            );
            self.pending.push_back(pending);
            return;
        }

        debug!(
            target: "lobby.actor.controller",
            kind = pending.request.kind(),
            "No backend attached, request rejected"
        );
        record_enter(
            pending.request.kind(),
            EnterFailure::BackendNotInitialized.as_str(),
        );
        let _ = pending
            .respond_to
            .send(Err(EnterFailure::BackendNotInitialized));
    }

    /// Starts the next queued pre-attach request, one at a time.
    async fn replay_pending(&mut self) {
        if self.provider.is_none() || self.state.is(LobbyState::Joining) {
            return;
        }
        if let Some(next) = self.pending.pop_front() {
            debug!(
                target: "lobby.actor.controller",
                kind = next.request.kind(),
                remaining = self.pending.len(),
                "Replaying queued request"
            );
            self.enter(next.request, next.cancel, next.respond_to).await;
        }
    }

    fn spawn_enter(
        &self,
        provider: Arc<AttachedProvider>,
        request: LobbyRequest,
        cancel: CancellationToken,
        respond_to: oneshot::Sender<EnterResult>,
    ) {
        let mailbox = self.self_sender.clone();
        let shutdown = self.cancel_token.clone();

        tokio::spawn(async move {
            let started = Instant::now();
            let backend = Arc::clone(provider.provider());
            let call_request = request.clone();
            let call = tokio::spawn(async move {
                match call_request {
                    LobbyRequest::Create(r) => backend.create(r).await,
                    LobbyRequest::Join(r) => backend.join(r).await,
                }
            });
            let abort = call.abort_handle();

            let outcome = tokio::select! {
                () = cancel.cancelled() => {
                    abort.abort();
                    Err(EnterFailure::General)
                }
                () = shutdown.cancelled() => {
                    abort.abort();
                    Err(EnterFailure::General)
                }
                joined = call => match joined {
                    Ok(result) => result,
                    Err(e) => {
                        error!(
                            target: "lobby.actor.controller",
                            error = %e,
                            "Backend create/join task panicked"
                        );
                        Err(EnterFailure::General)
                    }
                },
            };

            let completion = EnterCompletion {
                request,
                provider,
                outcome,
                elapsed: started.elapsed(),
                respond_to,
            };

            let Some(mailbox) = mailbox.upgrade() else {
                let _ = completion.respond_to.send(Err(EnterFailure::General));
                return;
            };
            if let Err(mpsc::error::SendError(message)) = mailbox
                .send(ControllerMessage::EnterCompleted(completion))
                .await
            {
                if let ControllerMessage::EnterCompleted(completion) = message {
                    let _ = completion.respond_to.send(Err(EnterFailure::General));
                }
            }
        });
    }

    async fn complete_enter(&mut self, completion: EnterCompletion) {
        let EnterCompletion {
            request,
            provider,
            outcome,
            elapsed,
            respond_to,
        } = completion;
        record_enter_duration(request.kind(), elapsed);
        let remaining = provider.finish_operation();

        if provider.is_obsolete() {
            if let Ok(entered) = &outcome {
                info!(
                    target: "lobby.actor.controller",
                    lobby_id = %entered.lobby_id,
                    generation = provider.generation(),
                    "Create/join succeeded on an obsolete backend, leaving the lobby"
                );
                provider.provider().leave(&entered.lobby_id).await;
            }
            let result = self
                .fail_enter(&provider, &request, EnterFailure::StaleRequest)
                .await;
            if remaining == 0 {
                self.finish_draining(&provider).await;
            }
            let _ = respond_to.send(result);
            self.replay_pending().await;
            return;
        }

        let entered = match outcome {
            Ok(entered) => entered,
            Err(reason) => {
                let result = self.fail_enter(&provider, &request, reason).await;
                let _ = respond_to.send(result);
                self.replay_pending().await;
                return;
            }
        };

        debug_assert!(
            self.state.is(LobbyState::Joining),
            "live enter completion outside Joining"
        );
        if !self.state.transition(LobbyState::InLobby) {
            error!(
                target: "lobby.actor.controller",
                state = %self.state.current(),
                lobby_id = %entered.lobby_id,
                "Enter completed outside Joining, leaving the lobby"
            );
            provider.provider().leave(&entered.lobby_id).await;
            let result = self
                .fail_enter(&provider, &request, EnterFailure::General)
                .await;
            let _ = respond_to.send(result);
            self.replay_pending().await;
            return;
        }
        self.session.initialize(entered.clone());
        self.resubscribe_heartbeat();
        self.record_stale_session(provider.backend_type(), &entered.lobby_id)
            .await;
        self.publish();

        record_enter(request.kind(), "success");
        info!(
            target: "lobby.actor.controller",
            kind = request.kind(),
            lobby_id = %entered.lobby_id,
            members = self.session.members().len(),
            is_owner = self.session.is_owner(),
            "Entered lobby"
        );

        let lobby_id = entered.lobby_id.clone();
        let result: EnterResult = Ok(entered);
        self.observers
            .core("enter_result", |o| o.on_enter_result(&request, &result));
        self.replay_joining_events(provider.generation(), &lobby_id)
            .await;
        let _ = respond_to.send(result);
        self.replay_pending().await;
    }

    /// The single failure path for create/join.
    async fn fail_enter(
        &mut self,
        provider: &AttachedProvider,
        request: &LobbyRequest,
        reason: EnterFailure,
    ) -> EnterResult {
        if self.session_generation == Some(provider.generation()) {
            self.state.force_reset();
            self.session.reset();
            self.heartbeat.clear();
            self.session_generation = None;
            self.joining_events.clear();
            self.publish();
        }

        record_enter(request.kind(), reason.as_str());

        let policy = match request {
            LobbyRequest::Create(_) => Arc::clone(&self.create_failure_policy),
            LobbyRequest::Join(_) => Arc::clone(&self.join_failure_policy),
        };
        match self.handle() {
            Some(handle) => {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                    policy.on_failure(&handle, reason, request);
                }));
                if outcome.is_err() {
                    warn!(
                        target: "lobby.actor.controller",
                        kind = request.kind(),
                        reason = reason.as_str(),
                        "Enter failure policy panicked"
                    );
                    record_policy_fault("enter_failure");
                }
            }
            None => debug!(
                target: "lobby.actor.controller",
                "No handles left, skipping failure policy"
            ),
        }

        let result: EnterResult = Err(reason);
        self.observers
            .core("enter_result", |o| o.on_enter_result(request, &result));
        result
    }

    // ------------------------------------------------------------------
    // Leave
    // ------------------------------------------------------------------

    /// Leaves the current lobby. No-op unless `InLobby`.
    async fn leave(&mut self, reason: LeaveReason) -> bool {
        if !self.state.is(LobbyState::InLobby) {
            return false;
        }
        let Some(lobby_id) = self.session.lobby_id().cloned() else {
            return false;
        };

        self.state.transition(LobbyState::NotInLobby);
        if let Some(provider) = &self.provider {
            provider.provider().leave(&lobby_id).await;
        }
        self.end_session(lobby_id, reason).await;
        true
    }

    async fn close_and_leave(&mut self) -> bool {
        if !self.permitted(&[LobbyState::InLobby], true) {
            return false;
        }
        let (Some(lobby_id), Some(provider)) =
            (self.session.lobby_id().cloned(), self.active_provider())
        else {
            return false;
        };

        self.state.transition(LobbyState::Leaving);
        self.publish();

        let closed = provider.close_and_leave(&lobby_id).await;
        if !closed {
            warn!(
                target: "lobby.actor.controller",
                lobby_id = %lobby_id,
                "Backend refused to close lobby, leaving instead"
            );
            provider.leave(&lobby_id).await;
        }

        self.state.transition(LobbyState::NotInLobby);
        self.end_session(lobby_id, LeaveReason::UserRequested).await;
        closed
    }

    /// Clears everything tied to the session after the state left `InLobby`.
    async fn end_session(&mut self, lobby_id: LobbyId, reason: LeaveReason) {
        self.session.reset();
        self.heartbeat.clear();
        self.session_generation = None;
        self.joining_events.clear();
        if let Some(provider) = self.provider.clone() {
            self.erase_stale_session(provider.backend_type()).await;
        }
        self.publish();

        record_leave(reason.as_str());
        info!(
            target: "lobby.actor.controller",
            lobby_id = %lobby_id,
            reason = reason.as_str(),
            "Left lobby"
        );
        self.observers
            .core("left", |o| o.on_left(&lobby_id, reason));
    }

    // ------------------------------------------------------------------
    // Owner and member operations
    // ------------------------------------------------------------------

    async fn set_owner(&mut self, member: Member) -> bool {
        if !self.permitted(&[LobbyState::InLobby], true)
            || !self.session.contains(&member)
            || &member == self.session.owner()
        {
            return false;
        }
        let (Some(lobby_id), Some(provider)) =
            (self.session.lobby_id().cloned(), self.active_provider())
        else {
            return false;
        };

        if !provider.set_owner(&lobby_id, &member).await {
            return false;
        }
        self.session.set_owner(member.clone());
        self.resubscribe_heartbeat();
        self.publish();
        self.observers
            .core("owner_changed", |o| o.on_owner_changed(&member));
        true
    }

    async fn kick_member(&mut self, member: Member) -> bool {
        if !self.permitted(&[LobbyState::InLobby], true)
            || &member == self.session.local_member()
            || !self.session.contains(&member)
        {
            return false;
        }
        let (Some(lobby_id), Some(provider)) =
            (self.session.lobby_id().cloned(), self.active_provider())
        else {
            return false;
        };

        if !provider.kick_member(&lobby_id, &member).await {
            return false;
        }
        self.session.remove_member(&member);
        self.resubscribe_heartbeat();
        self.publish();
        info!(
            target: "lobby.actor.controller",
            lobby_id = %lobby_id,
            member_id = %member.id,
            "Member kicked"
        );
        self.observers
            .core("member_kicked", |o| o.on_member_kicked(&member));
        true
    }

    async fn set_lobby_data(&mut self, key: &str, value: &str) -> bool {
        if !self.permitted(&[LobbyState::InLobby], true) {
            return false;
        }
        let (Some(lobby_id), Some(provider)) =
            (self.session.lobby_id().cloned(), self.active_provider())
        else {
            return false;
        };

        if !provider.set_lobby_data(&lobby_id, key, value).await {
            return false;
        }
        self.session.set_lobby_data(key, value);
        self.publish();
        self.observers
            .core("lobby_data_changed", |o| o.on_lobby_data_changed(key, value));
        true
    }

    async fn set_member_data(&mut self, key: &str, value: &str) -> bool {
        if !self.permitted(&[LobbyState::InLobby], false) {
            return false;
        }
        let (Some(lobby_id), Some(provider)) =
            (self.session.lobby_id().cloned(), self.active_provider())
        else {
            return false;
        };

        if !provider.set_local_member_data(&lobby_id, key, value).await {
            return false;
        }
        let local = self.session.local_member().clone();
        self.session.set_member_data(&local, key, value);
        self.publish();
        self.observers.core("member_data_changed", |o| {
            o.on_member_data_changed(&local, key, value);
        });
        true
    }

    async fn send_invite(&mut self, member: &Member) -> bool {
        if !self.permitted(&[LobbyState::InLobby], false) {
            return false;
        }
        match (self.session.lobby_id().cloned(), self.active_provider()) {
            (Some(lobby_id), Some(provider)) => provider.send_invite(&lobby_id, member).await,
            _ => false,
        }
    }

    async fn send_chat(&mut self, text: &str) -> bool {
        if !self.permitted(&[LobbyState::InLobby], false) {
            return false;
        }
        match (self.session.lobby_id().cloned(), self.capabilities.chat()) {
            (Some(lobby_id), Some(chat)) => chat.send_message(&lobby_id, text).await,
            _ => false,
        }
    }

    async fn call_procedure(&mut self, name: &str, payload: &str) -> bool {
        if !self.permitted(&[LobbyState::InLobby], false) {
            return false;
        }
        match (self.session.lobby_id().cloned(), self.capabilities.procedures()) {
            (Some(lobby_id), Some(procedures)) => procedures.invoke(&lobby_id, name, payload).await,
            _ => false,
        }
    }

    fn register_observer(&mut self, observer: Arc<dyn LobbyObserver>) -> ObserverId {
        let id = self.observers.register(observer);
        if self.state.is(LobbyState::InLobby) {
            let snapshot = self.session_snapshot();
            self.observers
                .core_one(id, "existing_lobby", |o| o.on_existing_lobby(&snapshot));
        }
        id
    }

    // ------------------------------------------------------------------
    // Backend events
    // ------------------------------------------------------------------

    async fn handle_event(&mut self, generation: u64, event: ProviderEvent) {
        if self.provider.as_ref().map(|p| p.generation()) != Some(generation) {
            debug!(
                target: "lobby.actor.controller",
                event = event.name(),
                generation,
                "Dropping event from a replaced backend"
            );
            return;
        }
        if event_lobby(&event).is_some()
            && self.state.is(LobbyState::Joining)
            && self.session_generation == Some(generation)
        {
            debug!(
                target: "lobby.actor.controller",
                event = event.name(),
                "Holding event until the enter completes"
            );
            self.joining_events.push(event);
            return;
        }
        if let Some(lobby_id) = event_lobby(&event) {
            if !self.session.is_current(lobby_id) {
                debug!(
                    target: "lobby.actor.controller",
                    event = event.name(),
                    lobby_id = %lobby_id,
                    "Dropping event for a lobby we are not in"
                );
                return;
            }
        }

        match event {
            ProviderEvent::MemberJoined {
                member,
                member_data,
                ..
            } => {
                let added = self.session.add_member(member.clone(), member_data);
                self.resubscribe_heartbeat();
                self.publish();
                if added {
                    self.observers
                        .core("member_joined", |o| o.on_member_joined(&member));
                }
            }

            ProviderEvent::MemberLeft { member, .. } => {
                if self.session.remove_member(&member) {
                    self.resubscribe_heartbeat();
                    self.publish();
                    self.observers
                        .core("member_left", |o| o.on_member_left(&member));
                }
            }

            ProviderEvent::LocalMemberKicked { cause, .. } => {
                info!(
                    target: "lobby.actor.controller",
                    cause = ?cause,
                    "Local member removed by backend"
                );
                self.leave(LeaveReason::Kicked(cause)).await;
            }

            ProviderEvent::InvitationReceived(invitation) => {
                self.observers
                    .core("invitation", |o| o.on_invitation(&invitation));
            }

            ProviderEvent::LobbyDataUpdated { key, value, .. } => {
                if self.session.set_lobby_data(&key, &value) {
                    self.publish();
                    self.observers
                        .core("lobby_data_changed", |o| o.on_lobby_data_changed(&key, &value));
                }
            }

            ProviderEvent::MemberDataUpdated {
                member, key, value, ..
            } => {
                if self.session.set_member_data(&member, &key, &value) {
                    self.publish();
                    self.observers.core("member_data_changed", |o| {
                        o.on_member_data_changed(&member, &key, &value);
                    });
                }
            }

            ProviderEvent::OwnerUpdated { owner, .. } => {
                if self.session.set_owner(owner.clone()) {
                    self.resubscribe_heartbeat();
                    self.publish();
                    self.observers
                        .core("owner_changed", |o| o.on_owner_changed(&owner));
                }
            }

            ProviderEvent::HeartbeatReceived { lobby_id, member } => {
                self.heartbeat
                    .record_ping(&member, &lobby_id, Instant::now());
            }

            ProviderEvent::ChatMessage { from, text, .. } => {
                self.observers
                    .chat("chat_message", |o| o.on_chat_message(&from, &text));
            }

            ProviderEvent::ProcedureInvoked {
                from,
                procedure,
                payload,
                ..
            } => {
                self.capabilities
                    .dispatch_procedure(&from, &procedure, &payload);
            }

            ProviderEvent::LobbyListReceived { lobbies } => {
                self.observers
                    .browse("lobby_list", |o| o.on_lobby_list(&lobbies));
            }

            ProviderEvent::FriendsUpdated { friends } => {
                self.observers
                    .friends("friends_updated", |o| o.on_friends_updated(&friends));
            }
        }
    }

    /// Applies events held while `Joining`. Those for another lobby are dropped.
    async fn replay_joining_events(&mut self, generation: u64, lobby_id: &LobbyId) {
        let held = std::mem::take(&mut self.joining_events);
        if held.is_empty() {
            return;
        }
        debug!(
            target: "lobby.actor.controller",
            lobby_id = %lobby_id,
            count = held.len(),
            "Replaying events received while joining"
        );
        for event in held {
            self.handle_event(generation, event).await;
        }
    }

    // ------------------------------------------------------------------
    // Heartbeat
    // ------------------------------------------------------------------

    async fn on_heartbeat_tick(&mut self) {
        if !self.state.is(LobbyState::InLobby) {
            return;
        }
        let (Some(lobby_id), Some(heartbeat)) =
            (self.session.lobby_id().cloned(), self.capabilities.heartbeat())
        else {
            return;
        };

        heartbeat.send_ping(&lobby_id).await;

        for member in self.heartbeat.take_timed_out(Instant::now()) {
            if self.session.is_owner() {
                warn!(
                    target: "lobby.heartbeat",
                    lobby_id = %lobby_id,
                    member_id = %member.id,
                    "Member stopped responding, kicking"
                );
                record_heartbeat_timeout("owner");
                if !self.kick_member(member).await {
                    // Still present: watch it again after a fresh grace period
                    self.resubscribe_heartbeat();
                }
            } else if &member == self.session.owner() {
                warn!(
                    target: "lobby.heartbeat",
                    lobby_id = %lobby_id,
                    owner_id = %member.id,
                    "Owner stopped responding, leaving lobby"
                );
                record_heartbeat_timeout("member");
                self.leave(LeaveReason::Kicked(KickCause::OwnerStoppedResponding))
                    .await;
                break;
            }
        }
    }

    // ------------------------------------------------------------------
    // Stale-session ledger
    // ------------------------------------------------------------------

    async fn record_stale_session(&self, backend_type: &str, lobby_id: &LobbyId) {
        if let Err(e) = self.ledger.record(backend_type, lobby_id).await {
            warn!(
                target: "lobby.ledger",
                error = %e,
                backend_type = %backend_type,
                "Failed to record session in ledger"
            );
            record_ledger_error("record");
        }
    }

    async fn erase_stale_session(&self, backend_type: &str) {
        if let Err(e) = self.ledger.erase(backend_type).await {
            warn!(
                target: "lobby.ledger",
                error = %e,
                backend_type = %backend_type,
                "Failed to erase session from ledger"
            );
            record_ledger_error("erase");
        }
    }

    /// Leaves a lobby orphaned by a previous run of this backend type.
    async fn flush_stale_session(&self, attached: &AttachedProvider) {
        if !attached.provider().should_flush_stale_lobbies() {
            return;
        }
        let backend_type = attached.backend_type();

        match self.ledger.load(backend_type).await {
            Ok(Some(entry)) => {
                info!(
                    target: "lobby.ledger",
                    backend_type = %backend_type,
                    lobby_id = %entry.lobby_id,
                    recorded_at = %entry.recorded_at,
                    "Leaving stale lobby from a previous run"
                );
                attached.provider().leave(&entry.lobby_id).await;
                self.erase_stale_session(backend_type).await;
                record_stale_session_flushed();
            }
            Ok(None) => {}
            Err(e) => {
                warn!(
                    target: "lobby.ledger",
                    error = %e,
                    backend_type = %backend_type,
                    "Failed to load ledger entry"
                );
                record_ledger_error("load");
            }
        }
    }

    // ------------------------------------------------------------------
    // Backend attach / detach
    // ------------------------------------------------------------------

    async fn attach_provider(&mut self, provider: Arc<dyn LobbyProvider>) -> Result<(), LobbyError> {
        self.release_provider().await;

        self.generation += 1;
        let attached = Arc::new(AttachedProvider::new(provider, self.generation));
        let sink = EventSink::new(self.generation, self.events_tx.clone());

        if let Err(e) = attached.provider().initialize(sink).await {
            error!(
                target: "lobby.actor.controller",
                error = %e,
                backend_type = %attached.backend_type(),
                "Backend failed to initialize"
            );
            attached.dispose().await;
            self.observers.reset_all(&CapabilitySet::default());
            return Err(match e {
                LobbyError::Provider(message) => LobbyError::Provider(message),
                other => LobbyError::Provider(other.to_string()),
            });
        }

        self.capabilities.attach(attached.provider().as_ref());
        self.provider = Some(Arc::clone(&attached));
        self.publish();

        info!(
            target: "lobby.actor.controller",
            backend_type = %attached.backend_type(),
            generation = attached.generation(),
            local_member = %attached.provider().local_user(),
            "Backend attached"
        );

        let capabilities = self
            .capabilities
            .capability_set(Some(attached.backend_type()));
        self.observers.reset_all(&capabilities);

        self.flush_stale_session(&attached).await;
        self.replay_pending().await;
        Ok(())
    }

    /// Leaves the session and releases the active backend: disposed now if
    /// idle, otherwise marked obsolete and parked until its last completion.
    async fn release_provider(&mut self) {
        if self.state.is(LobbyState::InLobby) {
            self.leave(LeaveReason::UserRequested).await;
        } else if !self.state.is(LobbyState::NotInLobby) {
            self.state.force_reset();
        }
        self.session.reset();
        self.heartbeat.clear();
        self.session_generation = None;
        self.joining_events.clear();
        self.capabilities.detach();

        let Some(old) = self.provider.take() else {
            return;
        };
        self.publish();

        if old.in_flight() == 0 {
            old.dispose().await;
            debug!(
                target: "lobby.actor.controller",
                generation = old.generation(),
                "Backend disposed"
            );
            return;
        }

        old.mark_obsolete();
        info!(
            target: "lobby.actor.controller",
            generation = old.generation(),
            in_flight = old.in_flight(),
            "Backend marked obsolete, disposal deferred"
        );
        self.draining.insert(old.generation(), old);
        set_providers_draining(self.draining.len());
    }

    async fn finish_draining(&mut self, provider: &AttachedProvider) {
        if let Some(old) = self.draining.remove(&provider.generation()) {
            old.dispose().await;
            debug!(
                target: "lobby.actor.controller",
                generation = old.generation(),
                "Obsolete backend disposed"
            );
            set_providers_draining(self.draining.len());
        }
    }

    async fn shutdown(&mut self) {
        info!(
            target: "lobby.actor.controller",
            state = %self.state.current(),
            draining = self.draining.len(),
            "Shutting down"
        );

        self.release_provider().await;
        for pending in self.pending.drain(..) {
            let _ = pending
                .respond_to
                .send(Err(EnterFailure::BackendNotInitialized));
        }
        for (_, old) in self.draining.drain() {
            old.dispose().await;
        }
        set_providers_draining(0);
        self.observers.reset_all(&CapabilitySet::default());

        // Aborts any create/join still running
        self.cancel_token.cancel();
    }
}

/// The lobby an event refers to, if any.
fn event_lobby(event: &ProviderEvent) -> Option<&LobbyId> {
    match event {
        ProviderEvent::MemberJoined { lobby_id, .. }
        | ProviderEvent::MemberLeft { lobby_id, .. }
        | ProviderEvent::LocalMemberKicked { lobby_id, .. }
        | ProviderEvent::LobbyDataUpdated { lobby_id, .. }
        | ProviderEvent::MemberDataUpdated { lobby_id, .. }
        | ProviderEvent::OwnerUpdated { lobby_id, .. }
        | ProviderEvent::HeartbeatReceived { lobby_id, .. }
        | ProviderEvent::ChatMessage { lobby_id, .. }
        | ProviderEvent::ProcedureInvoked { lobby_id, .. } => Some(lobby_id),
        ProviderEvent::InvitationReceived(_)
        | ProviderEvent::LobbyListReceived { .. }
        | ProviderEvent::FriendsUpdated { .. } => None,
    }
}
