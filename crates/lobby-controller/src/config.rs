//! Lobby controller configuration.
//!
//! Configuration is loaded from environment variables. The Redis URL may
//! carry credentials and is redacted in Debug output.

use crate::actors::policies::PreAttachPolicy;
use secrecy::SecretString;
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Default interval between liveness pings.
pub const DEFAULT_HEARTBEAT_INTERVAL_SECONDS: u64 = 2;

/// Default silence after which a subscribed member is considered gone.
pub const DEFAULT_HEARTBEAT_TIMEOUT_SECONDS: u64 = 10;

/// Default grace period before a new subscription is first checked.
pub const DEFAULT_HEARTBEAT_GRACE_SECONDS: u64 = 5;

/// Default file ledger location (relative to the working directory).
pub const DEFAULT_LEDGER_PATH: &str = "stale-lobbies.json";

/// Default number of create/join calls held before a backend attaches.
pub const DEFAULT_PRE_ATTACH_QUEUE_LIMIT: usize = 8;

/// Default controller mailbox capacity.
pub const DEFAULT_MAILBOX_CAPACITY: usize = 256;

/// Where the stale-session ledger is persisted.
#[derive(Clone)]
pub enum LedgerConfig {
    /// Process-local only; nothing survives a restart.
    Memory,
    /// JSON document on disk.
    File(PathBuf),
    /// Redis hash. The URL may contain credentials.
    Redis(SecretString),
}

impl fmt::Debug for LedgerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LedgerConfig::Memory => f.write_str("Memory"),
            LedgerConfig::File(path) => f.debug_tuple("File").field(path).finish(),
            LedgerConfig::Redis(_) => f.debug_tuple("Redis").field(&"[REDACTED]").finish(),
        }
    }
}

/// Lobby controller configuration.
#[derive(Clone, Debug)]
pub struct Config {
    /// Interval between liveness pings.
    pub heartbeat_interval: Duration,

    /// A subscribed member is timed out once silent for longer than this.
    pub heartbeat_timeout: Duration,

    /// Delay before a freshly subscribed member is first checked.
    pub heartbeat_grace: Duration,

    /// Stale-session ledger backend.
    pub ledger: LedgerConfig,

    /// What to do with create/join issued before a backend is attached.
    pub pre_attach: PreAttachPolicy,

    /// Controller mailbox capacity.
    pub mailbox_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(DEFAULT_HEARTBEAT_INTERVAL_SECONDS),
            heartbeat_timeout: Duration::from_secs(DEFAULT_HEARTBEAT_TIMEOUT_SECONDS),
            heartbeat_grace: Duration::from_secs(DEFAULT_HEARTBEAT_GRACE_SECONDS),
            ledger: LedgerConfig::Memory,
            pre_attach: PreAttachPolicy::Reject,
            mailbox_capacity: DEFAULT_MAILBOX_CAPACITY,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let heartbeat_interval_seconds = parse_or(
            vars,
            "LOBBY_HEARTBEAT_INTERVAL_SECONDS",
            DEFAULT_HEARTBEAT_INTERVAL_SECONDS,
        )?;
        let heartbeat_timeout_seconds = parse_or(
            vars,
            "LOBBY_HEARTBEAT_TIMEOUT_SECONDS",
            DEFAULT_HEARTBEAT_TIMEOUT_SECONDS,
        )?;
        let heartbeat_grace_seconds = parse_or(
            vars,
            "LOBBY_HEARTBEAT_GRACE_SECONDS",
            DEFAULT_HEARTBEAT_GRACE_SECONDS,
        )?;

        if heartbeat_interval_seconds == 0 {
            return Err(ConfigError::InvalidValue(
                "LOBBY_HEARTBEAT_INTERVAL_SECONDS must be greater than zero".to_string(),
            ));
        }
        if heartbeat_timeout_seconds <= heartbeat_interval_seconds {
            return Err(ConfigError::InvalidValue(
                "LOBBY_HEARTBEAT_TIMEOUT_SECONDS must exceed the heartbeat interval".to_string(),
            ));
        }

        let ledger = match vars.get("LOBBY_LEDGER").map(String::as_str) {
            None | Some("memory") => LedgerConfig::Memory,
            Some("file") => LedgerConfig::File(
                vars.get("LOBBY_LEDGER_PATH")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_LEDGER_PATH)),
            ),
            Some("redis") => LedgerConfig::Redis(SecretString::from(
                vars.get("LOBBY_REDIS_URL")
                    .ok_or_else(|| ConfigError::MissingEnvVar("LOBBY_REDIS_URL".to_string()))?
                    .clone(),
            )),
            Some(other) => {
                return Err(ConfigError::InvalidValue(format!(
                    "LOBBY_LEDGER must be one of memory, file, redis (got {other})"
                )))
            }
        };

        let queue_limit = parse_or(
            vars,
            "LOBBY_PRE_ATTACH_QUEUE_LIMIT",
            DEFAULT_PRE_ATTACH_QUEUE_LIMIT,
        )?;
        let pre_attach = match vars.get("LOBBY_PRE_ATTACH").map(String::as_str) {
            None | Some("reject") => PreAttachPolicy::Reject,
            Some("queue") => PreAttachPolicy::Queue {
                max_pending: queue_limit,
            },
            Some(other) => {
                return Err(ConfigError::InvalidValue(format!(
                    "LOBBY_PRE_ATTACH must be reject or queue (got {other})"
                )))
            }
        };

        let mailbox_capacity = parse_or(vars, "LOBBY_MAILBOX_CAPACITY", DEFAULT_MAILBOX_CAPACITY)?;
        if mailbox_capacity == 0 {
            return Err(ConfigError::InvalidValue(
                "LOBBY_MAILBOX_CAPACITY must be greater than zero".to_string(),
            ));
        }

        Ok(Config {
            heartbeat_interval: Duration::from_secs(heartbeat_interval_seconds),
            heartbeat_timeout: Duration::from_secs(heartbeat_timeout_seconds),
            heartbeat_grace: Duration::from_secs(heartbeat_grace_seconds),
            ledger,
            pre_attach,
            mailbox_capacity,
        })
    }
}

fn parse_or<T: std::str::FromStr>(
    vars: &HashMap<String, String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError> {
    match vars.get(key) {
        Some(raw) => raw
            .parse()
            .map_err(|_| ConfigError::InvalidValue(format!("{key}={raw}"))),
        None => Ok(default),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    #[test]
    fn test_from_vars_success_with_defaults() {
        let config = Config::from_vars(&HashMap::new()).expect("Config should load successfully");

        assert_eq!(
            config.heartbeat_interval,
            Duration::from_secs(DEFAULT_HEARTBEAT_INTERVAL_SECONDS)
        );
        assert_eq!(
            config.heartbeat_timeout,
            Duration::from_secs(DEFAULT_HEARTBEAT_TIMEOUT_SECONDS)
        );
        assert_eq!(
            config.heartbeat_grace,
            Duration::from_secs(DEFAULT_HEARTBEAT_GRACE_SECONDS)
        );
        assert!(matches!(config.ledger, LedgerConfig::Memory));
        assert_eq!(config.pre_attach, PreAttachPolicy::Reject);
        assert_eq!(config.mailbox_capacity, DEFAULT_MAILBOX_CAPACITY);
    }

    #[test]
    fn test_from_vars_success_with_custom_values() {
        let vars = HashMap::from([
            ("LOBBY_HEARTBEAT_INTERVAL_SECONDS".to_string(), "1".to_string()),
            ("LOBBY_HEARTBEAT_TIMEOUT_SECONDS".to_string(), "4".to_string()),
            ("LOBBY_HEARTBEAT_GRACE_SECONDS".to_string(), "0".to_string()),
            ("LOBBY_LEDGER".to_string(), "file".to_string()),
            ("LOBBY_LEDGER_PATH".to_string(), "/tmp/ledger.json".to_string()),
            ("LOBBY_PRE_ATTACH".to_string(), "queue".to_string()),
            ("LOBBY_PRE_ATTACH_QUEUE_LIMIT".to_string(), "3".to_string()),
            ("LOBBY_MAILBOX_CAPACITY".to_string(), "16".to_string()),
        ]);

        let config = Config::from_vars(&vars).expect("Config should load successfully");

        assert_eq!(config.heartbeat_interval, Duration::from_secs(1));
        assert_eq!(config.heartbeat_timeout, Duration::from_secs(4));
        assert_eq!(config.heartbeat_grace, Duration::ZERO);
        assert!(
            matches!(config.ledger, LedgerConfig::File(ref p) if p == &PathBuf::from("/tmp/ledger.json"))
        );
        assert_eq!(config.pre_attach, PreAttachPolicy::Queue { max_pending: 3 });
        assert_eq!(config.mailbox_capacity, 16);
    }

    #[test]
    fn test_redis_ledger_requires_url() {
        let vars = HashMap::from([("LOBBY_LEDGER".to_string(), "redis".to_string())]);

        let result = Config::from_vars(&vars);
        assert!(matches!(result, Err(ConfigError::MissingEnvVar(v)) if v == "LOBBY_REDIS_URL"));
    }

    #[test]
    fn test_timeout_must_exceed_interval() {
        let vars = HashMap::from([
            ("LOBBY_HEARTBEAT_INTERVAL_SECONDS".to_string(), "5".to_string()),
            ("LOBBY_HEARTBEAT_TIMEOUT_SECONDS".to_string(), "5".to_string()),
        ]);

        assert!(matches!(
            Config::from_vars(&vars),
            Err(ConfigError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_unparseable_value_is_rejected() {
        let vars = HashMap::from([(
            "LOBBY_HEARTBEAT_GRACE_SECONDS".to_string(),
            "soon".to_string(),
        )]);

        let result = Config::from_vars(&vars);
        assert!(matches!(result, Err(ConfigError::InvalidValue(v)) if v.contains("soon")));
    }

    #[test]
    fn test_debug_redacts_redis_url() {
        let vars = HashMap::from([
            ("LOBBY_LEDGER".to_string(), "redis".to_string()),
            (
                "LOBBY_REDIS_URL".to_string(),
                "redis://:hunter2@cache:6379".to_string(),
            ),
        ]);
        let config = Config::from_vars(&vars).expect("Config should load successfully");

        let debug_output = format!("{config:?}");
        assert!(debug_output.contains("[REDACTED]"));
        assert!(!debug_output.contains("hunter2"));

        match config.ledger {
            LedgerConfig::Redis(url) => {
                assert_eq!(url.expose_secret(), "redis://:hunter2@cache:6379");
            }
            other => panic!("expected redis ledger, got {other:?}"),
        }
    }
}
