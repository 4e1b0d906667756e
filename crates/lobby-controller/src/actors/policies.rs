//! Pluggable decisions the controller delegates to the host application.

use super::controller::SessionControllerHandle;
use crate::errors::EnterFailure;
use crate::models::LobbyRequest;
use tracing::warn;

/// What to do with a create/join issued before any backend is attached.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum PreAttachPolicy {
    /// Answer immediately with `BackendNotInitialized`.
    #[default]
    Reject,
    /// Hold up to `max_pending` requests and replay them in order once a
    /// backend attaches. Overflow is rejected.
    Queue { max_pending: usize },
}

/// Outcome of [`AlreadyInLobbyPolicy::decide`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlreadyInLobbyDecision {
    /// Leave the current lobby, then run the new request.
    LeaveAndProceed,
    /// Drop the new request; the current session is kept.
    Reject,
}

/// Decides what happens to a create/join issued while already in a lobby.
pub trait AlreadyInLobbyPolicy: Send + Sync {
    fn decide(&self, request: &LobbyRequest) -> AlreadyInLobbyDecision;
}

/// Default: leave the current lobby and proceed.
#[derive(Debug, Default, Clone, Copy)]
pub struct LeaveCurrentLobby;

impl AlreadyInLobbyPolicy for LeaveCurrentLobby {
    fn decide(&self, _request: &LobbyRequest) -> AlreadyInLobbyDecision {
        AlreadyInLobbyDecision::LeaveAndProceed
    }
}

/// Keeps the current lobby and refuses the new request.
#[derive(Debug, Default, Clone, Copy)]
pub struct StayInCurrentLobby;

impl AlreadyInLobbyPolicy for StayInCurrentLobby {
    fn decide(&self, _request: &LobbyRequest) -> AlreadyInLobbyDecision {
        AlreadyInLobbyDecision::Reject
    }
}

/// Recovery hook for failed create/join attempts.
///
/// Runs on the controller task after the state has been reset, so it may
/// not await controller calls. Spawn a task with the handle to retry.
pub trait EnterFailurePolicy: Send + Sync {
    fn on_failure(
        &self,
        controller: &SessionControllerHandle,
        reason: EnterFailure,
        request: &LobbyRequest,
    );
}

/// Default: log and give up.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogEnterFailure;

impl EnterFailurePolicy for LogEnterFailure {
    fn on_failure(
        &self,
        _controller: &SessionControllerHandle,
        reason: EnterFailure,
        request: &LobbyRequest,
    ) {
        warn!(
            target: "lobby.actor.controller",
            kind = request.kind(),
            reason = reason.as_str(),
            "Lobby request failed"
        );
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::models::CreateLobbyRequest;

    #[test]
    fn test_default_already_in_lobby_leaves() {
        let request = LobbyRequest::Create(CreateLobbyRequest::new(2));
        assert_eq!(
            LeaveCurrentLobby.decide(&request),
            AlreadyInLobbyDecision::LeaveAndProceed
        );
        assert_eq!(
            StayInCurrentLobby.decide(&request),
            AlreadyInLobbyDecision::Reject
        );
    }

    #[test]
    fn test_pre_attach_default_rejects() {
        assert_eq!(PreAttachPolicy::default(), PreAttachPolicy::Reject);
    }
}
