//! Observer registry and capability-filtered fan-out.
//!
//! An observer is registered once and exposes the capability views it
//! supports (`as_core`, `as_chat`, ...). Each notification only reaches
//! observers offering the matching view. Callbacks run on the controller
//! task and must not block.
//!
//! A panicking callback is caught, logged and counted; delivery continues
//! with the next observer.

use crate::actors::session::SessionSnapshot;
use crate::models::{
    EnterResult, Invitation, LeaveReason, LobbyId, LobbyRequest, LobbySummary, Member,
};
use crate::observability::metrics::record_observer_fault;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::warn;

/// Which optional capabilities the attached backend offers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapabilitySet {
    /// `None` when no backend is attached.
    pub backend_type: Option<String>,
    pub heartbeat: bool,
    pub chat: bool,
    pub friends: bool,
    pub procedures: bool,
    pub browse: bool,
}

/// Session lifecycle notifications.
#[allow(unused_variables)]
pub trait CoreObserver {
    /// Called at every backend attach/detach.
    fn reset(&self, capabilities: &CapabilitySet) {}

    /// Delivered on registration when a session is already active.
    fn on_existing_lobby(&self, snapshot: &SessionSnapshot) {}

    fn on_enter_requested(&self, request: &LobbyRequest) {}

    /// Success or failure of a create/join.
    fn on_enter_result(&self, request: &LobbyRequest, result: &EnterResult) {}

    fn on_left(&self, lobby_id: &LobbyId, reason: LeaveReason) {}

    fn on_member_joined(&self, member: &Member) {}

    fn on_member_left(&self, member: &Member) {}

    /// The local owner removed `member`.
    fn on_member_kicked(&self, member: &Member) {}

    fn on_owner_changed(&self, owner: &Member) {}

    fn on_lobby_data_changed(&self, key: &str, value: &str) {}

    fn on_member_data_changed(&self, member: &Member, key: &str, value: &str) {}

    fn on_invitation(&self, invitation: &Invitation) {}
}

#[allow(unused_variables)]
pub trait ChatObserver {
    fn reset(&self, capabilities: &CapabilitySet) {}

    fn on_chat_message(&self, from: &Member, text: &str) {}
}

#[allow(unused_variables)]
pub trait BrowseObserver {
    fn reset(&self, capabilities: &CapabilitySet) {}

    fn on_lobby_list(&self, lobbies: &[LobbySummary]) {}
}

#[allow(unused_variables)]
pub trait FriendsObserver {
    fn reset(&self, capabilities: &CapabilitySet) {}

    fn on_friends_updated(&self, friends: &[Member]) {}
}

/// A registered view. Override the accessors for the capabilities you
/// implement, usually as `Some(self)`.
pub trait LobbyObserver: Send + Sync {
    fn as_core(&self) -> Option<&dyn CoreObserver> {
        None
    }

    fn as_chat(&self) -> Option<&dyn ChatObserver> {
        None
    }

    fn as_browse(&self) -> Option<&dyn BrowseObserver> {
        None
    }

    fn as_friends(&self) -> Option<&dyn FriendsObserver> {
        None
    }
}

/// Registration token returned by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

#[derive(Default)]
pub struct ObserverRegistry {
    observers: Vec<(ObserverId, Arc<dyn LobbyObserver>)>,
    next_id: u64,
}

impl ObserverRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, observer: Arc<dyn LobbyObserver>) -> ObserverId {
        self.next_id += 1;
        let id = ObserverId(self.next_id);
        self.observers.push((id, observer));
        id
    }

    pub fn unregister(&mut self, id: ObserverId) -> bool {
        let before = self.observers.len();
        self.observers.retain(|(existing, _)| *existing != id);
        self.observers.len() != before
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.observers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    /// Delivers to a single observer (late-registration catch-up).
    pub fn core_one(&self, id: ObserverId, event: &'static str, f: impl Fn(&dyn CoreObserver)) {
        for (observer_id, observer) in self.observers.iter().filter(|(oid, _)| *oid == id) {
            if let Some(view) = observer.as_core() {
                guarded(*observer_id, event, || f(view));
            }
        }
    }

    pub fn core(&self, event: &'static str, f: impl Fn(&dyn CoreObserver)) {
        for (id, observer) in &self.observers {
            if let Some(view) = observer.as_core() {
                guarded(*id, event, || f(view));
            }
        }
    }

    pub fn chat(&self, event: &'static str, f: impl Fn(&dyn ChatObserver)) {
        for (id, observer) in &self.observers {
            if let Some(view) = observer.as_chat() {
                guarded(*id, event, || f(view));
            }
        }
    }

    pub fn browse(&self, event: &'static str, f: impl Fn(&dyn BrowseObserver)) {
        for (id, observer) in &self.observers {
            if let Some(view) = observer.as_browse() {
                guarded(*id, event, || f(view));
            }
        }
    }

    pub fn friends(&self, event: &'static str, f: impl Fn(&dyn FriendsObserver)) {
        for (id, observer) in &self.observers {
            if let Some(view) = observer.as_friends() {
                guarded(*id, event, || f(view));
            }
        }
    }

    /// Calls `reset` on every capability view of every observer.
    pub fn reset_all(&self, capabilities: &CapabilitySet) {
        self.core("reset", |o| o.reset(capabilities));
        self.chat("reset", |o| o.reset(capabilities));
        self.browse("reset", |o| o.reset(capabilities));
        self.friends("reset", |o| o.reset(capabilities));
    }
}

fn guarded(id: ObserverId, event: &'static str, f: impl FnOnce()) {
    if panic::catch_unwind(AssertUnwindSafe(f)).is_err() {
        warn!(
            target: "lobby.observers",
            observer_id = id.0,
            event = event,
            "Observer panicked, continuing with remaining observers"
        );
        record_observer_fault();
    }
}
