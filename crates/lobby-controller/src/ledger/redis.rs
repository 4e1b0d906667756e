//! Redis-backed ledger.
//!
//! # Key Patterns
//!
//! - `lobby:stale-sessions` - HASH of `backend_type -> StaleSessionEntry` (JSON)
//!
//! The `MultiplexedConnection` is cheap to clone and safe to use
//! concurrently, so each operation clones it instead of locking.

use super::{StaleSessionEntry, StaleSessionLedger};
use crate::errors::LobbyError;
use crate::models::LobbyId;
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client};
use tracing::{debug, error, instrument, warn};

/// Hash holding every backend's entry.
pub const STALE_SESSIONS_KEY: &str = "lobby:stale-sessions";

#[derive(Clone)]
pub struct RedisLedger {
    connection: MultiplexedConnection,
}

impl RedisLedger {
    /// Connects to Redis.
    ///
    /// # Errors
    ///
    /// Returns `LobbyError::Redis` if the URL is invalid or the connection fails.
    pub async fn connect(redis_url: &str) -> Result<Self, LobbyError> {
        let client = Client::open(redis_url).map_err(|e| {
            // Do NOT log redis_url, it may contain credentials
            error!(
                target: "lobby.ledger",
                error = %e,
                "Failed to open Redis client"
            );
            LobbyError::Redis(format!("Failed to open Redis client: {e}"))
        })?;

        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| {
                error!(
                    target: "lobby.ledger",
                    error = %e,
                    "Failed to connect to Redis"
                );
                LobbyError::Redis(format!("Failed to connect to Redis: {e}"))
            })?;

        Ok(Self { connection })
    }
}

#[async_trait]
impl StaleSessionLedger for RedisLedger {
    #[instrument(skip_all, fields(backend_type = %backend_type))]
    async fn record(&self, backend_type: &str, lobby_id: &LobbyId) -> Result<(), LobbyError> {
        let mut conn = self.connection.clone();
        let value = serde_json::to_string(&StaleSessionEntry::now(lobby_id.clone()))?;

        conn.hset::<_, _, _, ()>(STALE_SESSIONS_KEY, backend_type, value)
            .await
            .map_err(|e| {
                warn!(
                    target: "lobby.ledger",
                    error = %e,
                    "Failed to record stale session"
                );
                LobbyError::Redis(format!("Failed to record stale session: {e}"))
            })?;

        debug!(
            target: "lobby.ledger",
            lobby_id = %lobby_id,
            "Recorded session in Redis ledger"
        );
        Ok(())
    }

    #[instrument(skip_all, fields(backend_type = %backend_type))]
    async fn erase(&self, backend_type: &str) -> Result<(), LobbyError> {
        let mut conn = self.connection.clone();
        conn.hdel::<_, _, ()>(STALE_SESSIONS_KEY, backend_type)
            .await
            .map_err(|e| {
                warn!(
                    target: "lobby.ledger",
                    error = %e,
                    "Failed to erase stale session"
                );
                LobbyError::Redis(format!("Failed to erase stale session: {e}"))
            })
    }

    #[instrument(skip_all, fields(backend_type = %backend_type))]
    async fn load(&self, backend_type: &str) -> Result<Option<StaleSessionEntry>, LobbyError> {
        let mut conn = self.connection.clone();
        let raw: Option<String> = conn
            .hget(STALE_SESSIONS_KEY, backend_type)
            .await
            .map_err(|e| {
                warn!(
                    target: "lobby.ledger",
                    error = %e,
                    "Failed to load stale session"
                );
                LobbyError::Redis(format!("Failed to load stale session: {e}"))
            })?;

        raw.map(|json| serde_json::from_str(&json).map_err(LobbyError::from))
            .transpose()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_invalid_url_is_redis_error() {
        let result = RedisLedger::connect("not-a-url").await;
        assert!(matches!(result, Err(LobbyError::Redis(_))));
    }

    #[test]
    fn test_entry_json_shape() {
        let entry = StaleSessionEntry::now(LobbyId::new("lobby-9"));
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json.get("lobby_id").unwrap(), "lobby-9");
        assert!(json.get("recorded_at").unwrap().is_string());
    }
}
