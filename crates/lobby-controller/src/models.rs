//! Lobby domain types shared by the controller, backends and observers.

use crate::errors::EnterFailure;
use crate::metadata::Metadata;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Identity used by [`Member::unknown`].
pub const UNKNOWN_MEMBER_ID: &str = "unknown";

/// A lobby participant.
///
/// Equality and hashing consider only the backend-scoped `id`; the display
/// name is informational and may change without changing identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Member {
    pub id: String,
    pub display_name: String,
}

impl Member {
    #[must_use]
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
        }
    }

    /// Sentinel used before any backend is attached.
    #[must_use]
    pub fn unknown() -> Self {
        Self::new(UNKNOWN_MEMBER_ID, "Unknown")
    }

    #[must_use]
    pub fn is_unknown(&self) -> bool {
        self.id == UNKNOWN_MEMBER_ID
    }
}

impl PartialEq for Member {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Member {}

impl Hash for Member {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.display_name, self.id)
    }
}

/// Opaque backend-scoped lobby identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LobbyId(String);

impl LobbyId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LobbyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for LobbyId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for LobbyId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Lobby visibility.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LobbyType {
    #[default]
    Public,
    InviteOnly,
}

/// Parameters for creating a new lobby.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateLobbyRequest {
    pub capacity: u32,
    pub lobby_type: LobbyType,
    pub lobby_data: Metadata,
    /// Initial metadata for the local member.
    pub member_data: Metadata,
}

impl CreateLobbyRequest {
    #[must_use]
    pub fn new(capacity: u32) -> Self {
        Self {
            capacity,
            lobby_type: LobbyType::Public,
            lobby_data: Metadata::new(),
            member_data: Metadata::new(),
        }
    }

    #[must_use]
    pub fn invite_only(mut self) -> Self {
        self.lobby_type = LobbyType::InviteOnly;
        self
    }

    #[must_use]
    pub fn with_lobby_data(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.lobby_data.set(key, value);
        self
    }

    #[must_use]
    pub fn with_member_data(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.member_data.set(key, value);
        self
    }
}

/// Parameters for joining an existing lobby.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinLobbyRequest {
    pub lobby_id: LobbyId,
    /// Initial metadata for the local member.
    pub member_data: Metadata,
}

impl JoinLobbyRequest {
    #[must_use]
    pub fn new(lobby_id: impl Into<LobbyId>) -> Self {
        Self {
            lobby_id: lobby_id.into(),
            member_data: Metadata::new(),
        }
    }

    #[must_use]
    pub fn with_member_data(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.member_data.set(key, value);
        self
    }
}

/// A create or join intent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LobbyRequest {
    Create(CreateLobbyRequest),
    Join(JoinLobbyRequest),
}

impl LobbyRequest {
    /// Returns a bounded label for metrics and logs.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            LobbyRequest::Create(_) => "create",
            LobbyRequest::Join(_) => "join",
        }
    }
}

/// Everything a backend reports about a lobby it just created or joined.
#[derive(Debug, Clone, PartialEq)]
pub struct EnteredLobby {
    pub lobby_id: LobbyId,
    pub owner: Member,
    pub local_member: Member,
    pub capacity: u32,
    pub lobby_type: LobbyType,
    pub members: Vec<Member>,
    pub lobby_data: Metadata,
    pub member_data: HashMap<Member, Metadata>,
}

/// Outcome of a create/join attempt.
pub type EnterResult = Result<EnteredLobby, EnterFailure>;

/// Why the local member was removed from a lobby against its will.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KickCause {
    /// Removed by the owner or by the backend.
    General,
    /// The owner stopped answering heartbeats and the local member left.
    OwnerStoppedResponding,
    /// The owner closed the lobby for everyone.
    LobbyClosed,
}

/// Why the local member is no longer in a lobby.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LeaveReason {
    UserRequested,
    Kicked(KickCause),
}

impl LeaveReason {
    /// Returns a bounded label for metrics and logs.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            LeaveReason::UserRequested => "user_requested",
            LeaveReason::Kicked(KickCause::General) => "kicked",
            LeaveReason::Kicked(KickCause::OwnerStoppedResponding) => "owner_stopped_responding",
            LeaveReason::Kicked(KickCause::LobbyClosed) => "lobby_closed",
        }
    }
}

/// An invitation delivered by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invitation {
    pub lobby_id: LobbyId,
    pub from: Member,
}

/// A lobby as seen from a browse listing.
#[derive(Debug, Clone, PartialEq)]
pub struct LobbySummary {
    pub lobby_id: LobbyId,
    pub owner: Member,
    pub member_count: u32,
    pub capacity: u32,
    pub lobby_data: Metadata,
}

/// Filtering and sorting for lobby browsing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BrowseFilter {
    /// Lobby data entries that must match exactly.
    pub equals: Metadata,
    /// Lobby data key to sort by, ascending.
    pub sort_by: Option<String>,
    /// Only lobbies with at least this many free slots.
    pub min_free_slots: u32,
    /// Maximum number of results; `0` means unlimited.
    pub limit: usize,
}

impl BrowseFilter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_equals(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.equals.set(key, value);
        self
    }

    #[must_use]
    pub fn sorted_by(mut self, key: impl Into<String>) -> Self {
        self.sort_by = Some(key.into());
        self
    }

    #[must_use]
    pub fn with_min_free_slots(mut self, slots: u32) -> Self {
        self.min_free_slots = slots;
        self
    }

    #[must_use]
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    /// Applies the filter to a listing: equality match, free slots, sort,
    /// then limit.
    #[must_use]
    pub fn apply(&self, lobbies: Vec<LobbySummary>) -> Vec<LobbySummary> {
        let mut matching: Vec<LobbySummary> = lobbies
            .into_iter()
            .filter(|lobby| {
                self.equals
                    .iter()
                    .all(|(k, v)| lobby.lobby_data.get(k) == Some(v))
            })
            .filter(|lobby| lobby.capacity.saturating_sub(lobby.member_count) >= self.min_free_slots)
            .collect();

        if let Some(key) = &self.sort_by {
            matching.sort_by(|a, b| {
                a.lobby_data
                    .get_or_default(key, "")
                    .cmp(&b.lobby_data.get_or_default(key, ""))
            });
        }

        if self.limit > 0 {
            matching.truncate(self.limit);
        }
        matching
    }
}
