//! Pre-configured test data: members, configuration and canned lobbies.

use lobby_controller::config::{Config, LedgerConfig};
use lobby_controller::metadata::Metadata;
use lobby_controller::models::{EnteredLobby, LobbyId, LobbyType, Member};
use std::collections::HashMap;
use std::time::Duration;

/// Heartbeat interval used by [`test_config`].
pub const TEST_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// Heartbeat timeout used by [`test_config`].
pub const TEST_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(3);

/// Heartbeat grace used by [`test_config`].
pub const TEST_HEARTBEAT_GRACE: Duration = Duration::from_secs(2);

#[must_use]
pub fn alice() -> Member {
    Member::new("alice", "Alice")
}

#[must_use]
pub fn bob() -> Member {
    Member::new("bob", "Bob")
}

#[must_use]
pub fn carol() -> Member {
    Member::new("carol", "Carol")
}

/// Short heartbeat timings and an in-memory ledger.
#[must_use]
pub fn test_config() -> Config {
    Config {
        heartbeat_interval: TEST_HEARTBEAT_INTERVAL,
        heartbeat_timeout: TEST_HEARTBEAT_TIMEOUT,
        heartbeat_grace: TEST_HEARTBEAT_GRACE,
        ledger: LedgerConfig::Memory,
        ..Config::default()
    }
}

/// A lobby owned by `owner` whose members are `owner` followed by `others`.
#[must_use]
pub fn entered_lobby(
    lobby_id: &str,
    owner: &Member,
    local: &Member,
    others: &[Member],
) -> EnteredLobby {
    let mut members = vec![owner.clone()];
    members.extend(others.iter().cloned());
    let member_data: HashMap<Member, Metadata> = members
        .iter()
        .map(|m| (m.clone(), Metadata::new()))
        .collect();

    EnteredLobby {
        lobby_id: LobbyId::new(lobby_id),
        owner: owner.clone(),
        local_member: local.clone(),
        capacity: 4,
        lobby_type: LobbyType::Public,
        members,
        lobby_data: Metadata::new(),
        member_data,
    }
}
