//! Optional capability modules.
//!
//! Each slot holds the attached backend's capability, swapped explicitly on
//! attach/detach. An empty slot turns the controller call into a no-op.

use crate::models::Member;
use crate::observers::CapabilitySet;
use crate::provider::{
    BrowseCapability, ChatCapability, FriendsCapability, HeartbeatCapability, LobbyProvider,
    ProcedureCapability,
};
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, warn};

/// Handler for an incoming procedure call: `(caller, payload)`.
pub type ProcedureHandler = Arc<dyn Fn(&Member, &str) + Send + Sync>;

#[derive(Default)]
pub struct CapabilityModules {
    heartbeat: Option<Arc<dyn HeartbeatCapability>>,
    chat: Option<Arc<dyn ChatCapability>>,
    friends: Option<Arc<dyn FriendsCapability>>,
    procedures: Option<Arc<dyn ProcedureCapability>>,
    browser: Option<Arc<dyn BrowseCapability>>,
    /// Registered by the application; survives backend swaps.
    handlers: HashMap<String, ProcedureHandler>,
}

impl CapabilityModules {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&mut self, provider: &dyn LobbyProvider) {
        self.heartbeat = provider.heartbeat();
        self.chat = provider.chat();
        self.friends = provider.friends();
        self.procedures = provider.procedures();
        self.browser = provider.browser();
    }

    pub fn detach(&mut self) {
        self.heartbeat = None;
        self.chat = None;
        self.friends = None;
        self.procedures = None;
        self.browser = None;
    }

    #[must_use]
    pub fn capability_set(&self, backend_type: Option<&str>) -> CapabilitySet {
        CapabilitySet {
            backend_type: backend_type.map(str::to_string),
            heartbeat: self.heartbeat.is_some(),
            chat: self.chat.is_some(),
            friends: self.friends.is_some(),
            procedures: self.procedures.is_some(),
            browse: self.browser.is_some(),
        }
    }

    #[must_use]
    pub fn heartbeat(&self) -> Option<Arc<dyn HeartbeatCapability>> {
        self.heartbeat.clone()
    }

    #[must_use]
    pub fn chat(&self) -> Option<Arc<dyn ChatCapability>> {
        self.chat.clone()
    }

    #[must_use]
    pub fn friends(&self) -> Option<Arc<dyn FriendsCapability>> {
        self.friends.clone()
    }

    #[must_use]
    pub fn procedures(&self) -> Option<Arc<dyn ProcedureCapability>> {
        self.procedures.clone()
    }

    #[must_use]
    pub fn browser(&self) -> Option<Arc<dyn BrowseCapability>> {
        self.browser.clone()
    }

    /// Registers `handler` for `name`. Returns `true` if it replaced one.
    pub fn register_procedure(&mut self, name: String, handler: ProcedureHandler) -> bool {
        self.handlers.insert(name, handler).is_some()
    }

    pub fn unregister_procedure(&mut self, name: &str) -> bool {
        self.handlers.remove(name).is_some()
    }

    /// Routes an incoming call to its handler. Returns `false` when nothing
    /// is registered under `name` or the handler panicked.
    pub fn dispatch_procedure(&self, from: &Member, name: &str, payload: &str) -> bool {
        let Some(handler) = self.handlers.get(name) else {
            debug!(
                target: "lobby.actor.controller",
                procedure = %name,
                "No handler for incoming procedure"
            );
            return false;
        };
        if panic::catch_unwind(AssertUnwindSafe(|| handler(from, payload))).is_err() {
            warn!(
                target: "lobby.actor.controller",
                procedure = %name,
                "Procedure handler panicked"
            );
            return false;
        }
        true
    }
}
