//! Lobby controller error types.
//!
//! Two families live here:
//!
//! - [`EnterFailure`] is the outcome taxonomy of a create/join attempt. It is a
//!   value handed to callers, observers and failure policies, never a panic.
//! - [`LobbyError`] covers controller plumbing (mailbox, backend initialization,
//!   ledger persistence). Local precondition failures such as "not the owner"
//!   are not errors; those operations return `false`.

use thiserror::Error;

/// Reason a create/join attempt did not produce a usable session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum EnterFailure {
    /// Unclassified backend failure (timeout, network error, cancellation).
    #[error("lobby request failed")]
    General,

    /// The request completed against a backend instance that was swapped out
    /// while the request was in flight.
    #[error("lobby request completed against an obsolete backend")]
    StaleRequest,

    /// The lobby id is malformed or cannot be resolved by the active backend.
    #[error("invalid lobby id")]
    InvalidId,

    /// The backend was used before its own readiness gate opened, or no
    /// backend is attached at all.
    #[error("backend not initialized")]
    BackendNotInitialized,
}

impl EnterFailure {
    /// Returns a bounded label for metrics and logs.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            EnterFailure::General => "general",
            EnterFailure::StaleRequest => "stale_request",
            EnterFailure::InvalidId => "invalid_id",
            EnterFailure::BackendNotInitialized => "backend_not_initialized",
        }
    }
}

/// Lobby controller error type.
#[derive(Debug, Error)]
pub enum LobbyError {
    /// The controller task is gone or did not answer.
    #[error("Internal error: {0}")]
    Internal(String),

    /// A backend rejected initialization.
    #[error("Provider error: {0}")]
    Provider(String),

    /// Stale-session ledger persistence failed (file or serialization).
    #[error("Ledger error: {0}")]
    Ledger(String),

    /// Redis operation failed.
    #[error("Redis error: {0}")]
    Redis(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl LobbyError {
    /// Returns a bounded label for metrics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            LobbyError::Internal(_) => "internal",
            LobbyError::Provider(_) => "provider",
            LobbyError::Ledger(_) => "ledger",
            LobbyError::Redis(_) => "redis",
            LobbyError::Config(_) => "config",
        }
    }
}

impl From<std::io::Error> for LobbyError {
    fn from(err: std::io::Error) -> Self {
        LobbyError::Ledger(err.to_string())
    }
}

impl From<serde_json::Error> for LobbyError {
    fn from(err: serde_json::Error) -> Self {
        LobbyError::Ledger(format!("serialization failed: {err}"))
    }
}

impl From<redis::RedisError> for LobbyError {
    fn from(err: redis::RedisError) -> Self {
        LobbyError::Redis(err.to_string())
    }
}
