//! Heartbeat subscriptions and timeout detection.
//!
//! The owner watches every other member so it can evict the unresponsive;
//! a regular member watches only the owner so it can leave if the owner
//! vanishes. The controller drives this from its own task: pings received
//! as provider events refresh records, and each interval tick collects the
//! members whose silence exceeded the timeout.

use super::session::LobbySession;
use crate::models::{LobbyId, Member};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Liveness record for one subscribed member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatRecord {
    pub lobby_id: LobbyId,
    /// Last ping, or the end of the grace period for a fresh subscription.
    pub last_seen: Instant,
}

#[derive(Debug)]
pub struct HeartbeatTracker {
    timeout: Duration,
    grace: Duration,
    records: HashMap<Member, HeartbeatRecord>,
}

impl HeartbeatTracker {
    #[must_use]
    pub fn new(timeout: Duration, grace: Duration) -> Self {
        Self {
            timeout,
            grace,
            records: HashMap::new(),
        }
    }

    /// Starts watching `member`. An existing subscription for the same
    /// lobby is left untouched.
    pub fn subscribe(&mut self, member: Member, lobby_id: &LobbyId, now: Instant) -> bool {
        if self
            .records
            .get(&member)
            .is_some_and(|record| &record.lobby_id == lobby_id)
        {
            return false;
        }
        self.records.insert(
            member,
            HeartbeatRecord {
                lobby_id: lobby_id.clone(),
                last_seen: now + self.grace,
            },
        );
        true
    }

    pub fn unsubscribe(&mut self, member: &Member) -> bool {
        self.records.remove(member).is_some()
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    /// Re-derives the subscription set for `session`'s current role.
    ///
    /// Members that stay subscribed keep their record, so running this twice
    /// (or after an event that changed nothing) has no effect.
    pub fn resubscribe(&mut self, session: &LobbySession, now: Instant) {
        let Some(lobby_id) = session.lobby_id().filter(|_| session.in_lobby()) else {
            self.clear();
            return;
        };
        let targets = subscription_targets(session);

        self.records
            .retain(|member, record| &record.lobby_id == lobby_id && targets.contains(member));
        for member in targets {
            self.subscribe(member, lobby_id, now);
        }

        debug!(
            target: "lobby.heartbeat",
            lobby_id = %lobby_id,
            is_owner = session.is_owner(),
            subscriptions = self.records.len(),
            "Heartbeat subscriptions re-derived"
        );
    }

    /// Refreshes `member` on a received ping. Returns `false` for pings from
    /// members we are not watching.
    pub fn record_ping(&mut self, member: &Member, lobby_id: &LobbyId, now: Instant) -> bool {
        match self.records.get_mut(member) {
            Some(record) if &record.lobby_id == lobby_id => {
                // A ping inside the grace period must not shorten it
                record.last_seen = record.last_seen.max(now);
                true
            }
            _ => false,
        }
    }

    /// Removes and returns every member silent for longer than the timeout.
    pub fn take_timed_out(&mut self, now: Instant) -> Vec<Member> {
        let timeout = self.timeout;
        let expired: Vec<Member> = self
            .records
            .iter()
            .filter(|(_, record)| now.saturating_duration_since(record.last_seen) > timeout)
            .map(|(member, _)| member.clone())
            .collect();
        for member in &expired {
            self.records.remove(member);
        }
        expired
    }

    #[must_use]
    pub fn is_subscribed(&self, member: &Member) -> bool {
        self.records.contains_key(member)
    }

    #[must_use]
    pub fn record(&self, member: &Member) -> Option<&HeartbeatRecord> {
        self.records.get(member)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Members the local member should watch in its current role.
#[must_use]
pub fn subscription_targets(session: &LobbySession) -> Vec<Member> {
    if !session.in_lobby() {
        return Vec::new();
    }
    let local = session.local_member();
    if session.is_owner() {
        session
            .members()
            .iter()
            .filter(|m| *m != local)
            .cloned()
            .collect()
    } else {
        vec![session.owner().clone()]
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::metadata::Metadata;
    use crate::models::{EnteredLobby, LobbyType};

    const TIMEOUT: Duration = Duration::from_secs(10);
    const GRACE: Duration = Duration::from_secs(5);

    fn session(owner: &Member, local: &Member, others: &[Member]) -> LobbySession {
        let mut members = vec![owner.clone()];
        members.extend(others.iter().cloned());
        let mut session = LobbySession::new();
        session.initialize(EnteredLobby {
            lobby_id: LobbyId::new("lobby"),
            owner: owner.clone(),
            local_member: local.clone(),
            capacity: 8,
            lobby_type: LobbyType::Public,
            members,
            lobby_data: Metadata::new(),
            member_data: HashMap::new(),
        });
        session
    }

    #[test]
    fn test_owner_watches_everyone_else() {
        let owner = Member::new("o", "Owner");
        let a = Member::new("a", "A");
        let b = Member::new("b", "B");
        let s = session(&owner, &owner, &[a.clone(), b.clone()]);

        let mut targets = subscription_targets(&s);
        targets.sort_by(|x, y| x.id.cmp(&y.id));
        assert_eq!(targets, vec![a, b]);
    }

    #[test]
    fn test_member_watches_only_owner() {
        let owner = Member::new("o", "Owner");
        let a = Member::new("a", "A");
        let b = Member::new("b", "B");
        let s = session(&owner, &a, &[a.clone(), b]);

        assert_eq!(subscription_targets(&s), vec![owner]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_grace_period_then_timeout() {
        let member = Member::new("a", "A");
        let lobby = LobbyId::new("lobby");
        let mut tracker = HeartbeatTracker::new(TIMEOUT, GRACE);

        tracker.subscribe(member.clone(), &lobby, Instant::now());

        tokio::time::advance(TIMEOUT + Duration::from_secs(1)).await;
        // Still within grace + timeout
        assert!(tracker.take_timed_out(Instant::now()).is_empty());

        tokio::time::advance(GRACE).await;
        assert_eq!(tracker.take_timed_out(Instant::now()), vec![member.clone()]);
        assert!(!tracker.is_subscribed(&member));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pings_keep_member_alive() {
        let member = Member::new("a", "A");
        let lobby = LobbyId::new("lobby");
        let mut tracker = HeartbeatTracker::new(TIMEOUT, Duration::ZERO);
        tracker.subscribe(member.clone(), &lobby, Instant::now());

        for _ in 0..5 {
            tokio::time::advance(Duration::from_secs(8)).await;
            assert!(tracker.record_ping(&member, &lobby, Instant::now()));
            assert!(tracker.take_timed_out(Instant::now()).is_empty());
        }

        // Pings for another lobby do not count
        assert!(!tracker.record_ping(&member, &LobbyId::new("other"), Instant::now()));
        assert!(!tracker.record_ping(&Member::new("x", "X"), &lobby, Instant::now()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_resubscribe_is_idempotent() {
        let owner = Member::new("o", "Owner");
        let a = Member::new("a", "A");
        let s = session(&owner, &owner, &[a.clone()]);
        let mut tracker = HeartbeatTracker::new(TIMEOUT, GRACE);

        tracker.resubscribe(&s, Instant::now());
        let first = tracker.record(&a).cloned().unwrap();

        tokio::time::advance(Duration::from_secs(3)).await;
        tracker.resubscribe(&s, Instant::now());
        assert_eq!(tracker.record(&a), Some(&first));
        assert_eq!(tracker.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_role_change_swaps_subscriptions() {
        let owner = Member::new("o", "Owner");
        let a = Member::new("a", "A");
        let b = Member::new("b", "B");
        let mut s = session(&owner, &owner, &[a.clone(), b.clone()]);
        let mut tracker = HeartbeatTracker::new(TIMEOUT, GRACE);
        tracker.resubscribe(&s, Instant::now());
        assert_eq!(tracker.len(), 2);

        assert!(s.set_owner(a.clone()));
        tracker.resubscribe(&s, Instant::now());
        assert_eq!(tracker.len(), 1);
        assert!(tracker.is_subscribed(&a));
        assert!(!tracker.is_subscribed(&b));

        s.reset();
        tracker.resubscribe(&s, Instant::now());
        assert!(tracker.is_empty());
    }
}
