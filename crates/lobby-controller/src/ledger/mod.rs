//! Stale-session ledger.
//!
//! A small durable `backend_type -> lobby_id` record. The controller writes
//! it on every successful enter and erases it on every clean leave. When a
//! backend attaches, a leftover entry means the previous process died inside
//! a lobby; the controller leaves that lobby and erases the entry.
//!
//! # Backends
//!
//! - [`MemoryLedger`]: process-local (tests, ephemeral hosts)
//! - [`FileLedger`]: JSON document on disk
//! - [`RedisLedger`]: `lobby:stale-sessions` hash

pub mod file;
pub mod redis;

use crate::config::LedgerConfig;
use crate::errors::LobbyError;
use crate::models::LobbyId;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

pub use self::file::FileLedger;
pub use self::redis::RedisLedger;

/// One persisted ledger entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaleSessionEntry {
    pub lobby_id: LobbyId,
    pub recorded_at: DateTime<Utc>,
}

impl StaleSessionEntry {
    #[must_use]
    pub fn now(lobby_id: LobbyId) -> Self {
        Self {
            lobby_id,
            recorded_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait StaleSessionLedger: Send + Sync {
    /// Records (or overwrites) the lobby currently held on `backend_type`.
    async fn record(&self, backend_type: &str, lobby_id: &LobbyId) -> Result<(), LobbyError>;

    async fn erase(&self, backend_type: &str) -> Result<(), LobbyError>;

    async fn load(&self, backend_type: &str) -> Result<Option<StaleSessionEntry>, LobbyError>;
}

/// In-memory ledger. Cloning shares the same entries.
#[derive(Debug, Clone, Default)]
pub struct MemoryLedger {
    entries: Arc<Mutex<HashMap<String, StaleSessionEntry>>>,
}

impl MemoryLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, backend_type: &str) -> Option<LobbyId> {
        self.entries
            .lock()
            .get(backend_type)
            .map(|entry| entry.lobby_id.clone())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[async_trait]
impl StaleSessionLedger for MemoryLedger {
    async fn record(&self, backend_type: &str, lobby_id: &LobbyId) -> Result<(), LobbyError> {
        self.entries.lock().insert(
            backend_type.to_string(),
            StaleSessionEntry::now(lobby_id.clone()),
        );
        Ok(())
    }

    async fn erase(&self, backend_type: &str) -> Result<(), LobbyError> {
        self.entries.lock().remove(backend_type);
        Ok(())
    }

    async fn load(&self, backend_type: &str) -> Result<Option<StaleSessionEntry>, LobbyError> {
        Ok(self.entries.lock().get(backend_type).cloned())
    }
}

/// Builds the ledger selected by configuration.
///
/// # Errors
///
/// Returns `LobbyError::Redis` if the Redis ledger cannot connect.
pub async fn from_config(config: &LedgerConfig) -> Result<Arc<dyn StaleSessionLedger>, LobbyError> {
    use secrecy::ExposeSecret;

    let ledger: Arc<dyn StaleSessionLedger> = match config {
        LedgerConfig::Memory => Arc::new(MemoryLedger::new()),
        LedgerConfig::File(path) => Arc::new(FileLedger::new(path.clone())),
        LedgerConfig::Redis(url) => Arc::new(RedisLedger::connect(url.expose_secret()).await?),
    };
    Ok(ledger)
}
