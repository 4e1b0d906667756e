//! Local lobby cache and the read-only snapshot published from it.

use super::state::LobbyState;
use crate::metadata::Metadata;
use crate::models::{EnteredLobby, LobbyId, LobbyType, Member};
use std::collections::HashMap;

/// Mutable lobby cache owned by the controller task.
///
/// While `in_lobby` the owner is always one of `members` and `member_data`
/// has exactly one entry per member. Otherwise every field is at its
/// default.
#[derive(Debug)]
pub struct LobbySession {
    in_lobby: bool,
    lobby_id: Option<LobbyId>,
    owner: Member,
    local_member: Member,
    capacity: u32,
    lobby_type: LobbyType,
    members: Vec<Member>,
    lobby_data: Metadata,
    member_data: HashMap<Member, Metadata>,
}

impl Default for LobbySession {
    fn default() -> Self {
        Self {
            in_lobby: false,
            lobby_id: None,
            owner: Member::unknown(),
            local_member: Member::unknown(),
            capacity: 0,
            lobby_type: LobbyType::default(),
            members: Vec::new(),
            lobby_data: Metadata::new(),
            member_data: HashMap::new(),
        }
    }
}

impl LobbySession {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Repopulates the cache from a successful create/join.
    ///
    /// The backend's member list is normalized so the owner and the local
    /// member are present and every member has a metadata entry.
    pub fn initialize(&mut self, entered: EnteredLobby) {
        let EnteredLobby {
            lobby_id,
            owner,
            local_member,
            capacity,
            lobby_type,
            members,
            lobby_data,
            mut member_data,
        } = entered;

        let mut normalized: Vec<Member> = Vec::with_capacity(members.len() + 2);
        for member in members
            .into_iter()
            .chain([owner.clone(), local_member.clone()])
        {
            if !normalized.contains(&member) {
                normalized.push(member);
            }
        }
        member_data.retain(|member, _| normalized.contains(member));
        for member in &normalized {
            member_data.entry(member.clone()).or_default();
        }

        self.in_lobby = true;
        self.lobby_id = Some(lobby_id);
        self.owner = owner;
        self.local_member = local_member;
        self.capacity = capacity;
        self.lobby_type = lobby_type;
        self.members = normalized;
        self.lobby_data = lobby_data;
        self.member_data = member_data;
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    #[must_use]
    pub fn in_lobby(&self) -> bool {
        self.in_lobby
    }

    #[must_use]
    pub fn lobby_id(&self) -> Option<&LobbyId> {
        self.lobby_id.as_ref()
    }

    #[must_use]
    pub fn owner(&self) -> &Member {
        &self.owner
    }

    #[must_use]
    pub fn local_member(&self) -> &Member {
        &self.local_member
    }

    #[must_use]
    pub fn members(&self) -> &[Member] {
        &self.members
    }

    #[must_use]
    pub fn contains(&self, member: &Member) -> bool {
        self.members.contains(member)
    }

    #[must_use]
    pub fn is_owner(&self) -> bool {
        self.in_lobby && self.owner == self.local_member
    }

    /// Whether `lobby_id` is the lobby this session is in.
    #[must_use]
    pub fn is_current(&self, lobby_id: &LobbyId) -> bool {
        self.in_lobby && self.lobby_id.as_ref() == Some(lobby_id)
    }

    /// Adds a member. Returns `false` if already present (its data is still
    /// refreshed).
    pub fn add_member(&mut self, member: Member, data: Metadata) -> bool {
        if !self.in_lobby {
            return false;
        }
        let added = !self.members.contains(&member);
        if added {
            self.members.push(member.clone());
        }
        self.member_data.insert(member, data);
        added
    }

    /// Removes a remote member and its metadata. If that member owned the
    /// lobby, ownership passes to the first remaining member until the
    /// backend reports the real new owner.
    pub fn remove_member(&mut self, member: &Member) -> bool {
        if !self.in_lobby || member == &self.local_member || !self.members.contains(member) {
            return false;
        }
        self.members.retain(|m| m != member);
        self.member_data.remove(member);
        if member == &self.owner {
            if let Some(next) = self.members.first() {
                self.owner = next.clone();
            }
        }
        true
    }

    pub fn set_owner(&mut self, owner: Member) -> bool {
        if !self.in_lobby || !self.members.contains(&owner) {
            return false;
        }
        self.owner = owner;
        true
    }

    pub fn set_lobby_data(&mut self, key: &str, value: &str) -> bool {
        if !self.in_lobby {
            return false;
        }
        self.lobby_data.set(key, value);
        true
    }

    pub fn set_member_data(&mut self, member: &Member, key: &str, value: &str) -> bool {
        match self.member_data.get_mut(member) {
            Some(data) if self.in_lobby => {
                data.set(key, value);
                true
            }
            _ => false,
        }
    }

    /// Checks the cache invariants.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        if !self.in_lobby {
            return self.lobby_id.is_none()
                && self.owner.is_unknown()
                && self.members.is_empty()
                && self.lobby_data.is_empty()
                && self.member_data.is_empty();
        }
        self.members.contains(&self.owner)
            && self.member_data.len() == self.members.len()
            && self.members.iter().all(|m| self.member_data.contains_key(m))
    }

    #[must_use]
    pub fn snapshot(&self, state: LobbyState, backend_type: Option<&str>) -> SessionSnapshot {
        SessionSnapshot {
            state,
            backend_type: backend_type.map(str::to_string),
            lobby_id: self.lobby_id.clone(),
            owner: self.owner.clone(),
            local_member: self.local_member.clone(),
            capacity: self.capacity,
            lobby_type: self.lobby_type,
            members: self.members.clone(),
            lobby_data: self.lobby_data.clone(),
            member_data: self.member_data.clone(),
        }
    }
}

/// Immutable view of the session as of the last controller mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub state: LobbyState,
    pub backend_type: Option<String>,
    pub lobby_id: Option<LobbyId>,
    pub owner: Member,
    pub local_member: Member,
    pub capacity: u32,
    pub lobby_type: LobbyType,
    pub members: Vec<Member>,
    pub lobby_data: Metadata,
    pub member_data: HashMap<Member, Metadata>,
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        LobbySession::default().snapshot(LobbyState::NotInLobby, None)
    }
}

impl SessionSnapshot {
    #[must_use]
    pub fn is_in_lobby(&self) -> bool {
        self.state == LobbyState::InLobby
    }

    #[must_use]
    pub fn is_owner(&self) -> bool {
        self.is_in_lobby() && self.owner == self.local_member
    }

    #[must_use]
    pub fn lobby_data_or_default(&self, key: &str, default: &str) -> String {
        self.lobby_data.get_or_default(key, default)
    }

    #[must_use]
    pub fn member_data_or_default(&self, member: &Member, key: &str, default: &str) -> String {
        self.member_data
            .get(member)
            .map_or_else(|| default.to_string(), |data| data.get_or_default(key, default))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn entered(members: Vec<Member>, owner: Member, local: Member) -> EnteredLobby {
        EnteredLobby {
            lobby_id: LobbyId::new("lobby-1"),
            owner,
            local_member: local,
            capacity: 4,
            lobby_type: LobbyType::Public,
            members,
            lobby_data: Metadata::new().with("map", "harbor"),
            member_data: HashMap::new(),
        }
    }

    #[test]
    fn test_default_is_consistent() {
        let session = LobbySession::new();
        assert!(!session.in_lobby());
        assert!(session.is_consistent());
        assert!(!session.is_owner());
    }

    #[test]
    fn test_initialize_normalizes_members() {
        let owner = Member::new("o", "Owner");
        let local = Member::new("l", "Local");
        let mut session = LobbySession::new();

        // Backend forgot both owner and local member
        session.initialize(entered(vec![], owner.clone(), local.clone()));

        assert!(session.is_consistent());
        assert_eq!(session.members(), &[owner, local]);
        assert!(!session.is_owner());
    }

    #[test]
    fn test_member_churn_keeps_invariants() {
        let owner = Member::new("o", "Owner");
        let guest = Member::new("g", "Guest");
        let mut session = LobbySession::new();
        session.initialize(entered(vec![owner.clone()], owner.clone(), owner.clone()));
        assert!(session.is_owner());

        assert!(session.add_member(guest.clone(), Metadata::new().with("ready", "1")));
        assert!(!session.add_member(guest.clone(), Metadata::new()));
        assert!(session.is_consistent());
        assert_eq!(session.members().len(), 2);

        assert!(session.set_owner(guest.clone()));
        assert!(!session.is_owner());
        assert!(!session.set_owner(Member::new("x", "Stranger")));

        // Owner leaving hands the lobby to the first remaining member
        assert!(session.remove_member(&guest));
        assert!(session.is_consistent());
        assert!(session.is_owner());
        assert_eq!(session.members(), &[owner.clone()]);

        // The local member only leaves through leave/kick
        assert!(!session.remove_member(&owner));
    }

    #[test]
    fn test_reset_clears_everything() {
        let owner = Member::new("o", "Owner");
        let mut session = LobbySession::new();
        session.initialize(entered(vec![owner.clone()], owner.clone(), owner));
        session.reset();
        assert!(session.is_consistent());
        assert!(session.lobby_id().is_none());
    }

    #[test]
    fn test_snapshot_reads() {
        let owner = Member::new("o", "Owner");
        let mut session = LobbySession::new();
        session.initialize(entered(vec![owner.clone()], owner.clone(), owner.clone()));
        assert!(session.set_member_data(&owner, "ready", "1"));

        let snapshot = session.snapshot(LobbyState::InLobby, Some("loopback"));
        assert!(snapshot.is_owner());
        assert_eq!(snapshot.lobby_data_or_default("map", "_"), "harbor");
        assert_eq!(snapshot.lobby_data_or_default("mode", "_"), "_");
        assert_eq!(snapshot.member_data_or_default(&owner, "ready", "0"), "1");
        assert_eq!(
            snapshot.member_data_or_default(&Member::new("x", "X"), "ready", "0"),
            "0"
        );
    }
}
