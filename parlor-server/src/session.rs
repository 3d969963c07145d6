//! Session state: members, seats, rules payload, expiration, reset votes.
//!
//! All mutation happens through a `SessionGuard` from the registry — the
//! accessors here assume the session's flag is held. The inner mutex exists
//! for memory safety only; the flag is the logical critical section.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use parlor_net::connection::Connection;
use parlor_types::rules::GameRules;
use parlor_types::SeatIndex;

use crate::flag::LockFlag;

/// Transient reset-in-place vote. At most one exists per session.
#[derive(Debug)]
pub struct ResetVote {
    /// Seat that asked for the reset.
    pub requester: SeatIndex,
    /// One slot per seat: `None` until that seat votes.
    votes: Vec<Option<bool>>,
    /// Seats whose explicit vote is still expected. Seats that cannot vote
    /// (bots, clients below the voting protocol version) were pre-counted.
    expected: Vec<SeatIndex>,
}

impl ResetVote {
    pub fn new(seat_count: usize, requester: SeatIndex) -> Self {
        let mut votes = vec![None; seat_count];
        votes[requester.get()] = Some(true);
        Self {
            requester,
            votes,
            expected: Vec::new(),
        }
    }

    /// Pre-count a seat as "yes" (requester, bots, legacy clients).
    pub fn auto_yes(&mut self, seat: SeatIndex) {
        self.votes[seat.get()] = Some(true);
    }

    /// Register a seat whose explicit vote we will wait for.
    pub fn expect(&mut self, seat: SeatIndex) {
        self.expected.push(seat);
    }

    pub fn expected_seats(&self) -> &[SeatIndex] {
        &self.expected
    }

    /// Record a vote. Returns false if the seat was not expected to vote or
    /// already voted — each vote registers exactly once per seat.
    pub fn record(&mut self, seat: SeatIndex, yes: bool) -> bool {
        if !self.expected.contains(&seat) {
            return false;
        }
        if self.votes[seat.get()].is_some() {
            return false;
        }
        self.votes[seat.get()] = Some(yes);
        true
    }

    /// True once every expected seat has voted.
    pub fn complete(&self) -> bool {
        self.expected
            .iter()
            .all(|s| self.votes[s.get()].is_some())
    }

    /// True if any recorded vote is "no".
    pub fn rejected(&self) -> bool {
        self.votes.iter().any(|v| *v == Some(false))
    }
}

/// Everything a session knows, guarded by its flag.
pub struct SessionState {
    pub members: Vec<Arc<Connection>>,
    pub seats: Vec<Option<Arc<Connection>>>,
    pub rules: Box<dyn GameRules>,
    pub expires_at: Instant,
    pub reset_vote: Option<ResetVote>,
}

impl SessionState {
    pub fn new(rules: Box<dyn GameRules>, ttl: Duration) -> Self {
        let seats = (0..rules.seat_count()).map(|_| None).collect();
        Self {
            members: Vec::new(),
            seats,
            rules,
            expires_at: Instant::now() + ttl,
            reset_vote: None,
        }
    }

    pub fn is_member(&self, conn: &Arc<Connection>) -> bool {
        self.members.iter().any(|m| m.id() == conn.id())
    }

    /// Add a member. No-op if already present — a connection appears at most
    /// once per session.
    pub fn add_member(&mut self, conn: Arc<Connection>) -> bool {
        if self.is_member(&conn) {
            return false;
        }
        self.members.push(conn);
        true
    }

    pub fn remove_member(&mut self, conn: &Arc<Connection>) -> bool {
        let before = self.members.len();
        self.members.retain(|m| m.id() != conn.id());
        before != self.members.len()
    }

    /// The seat this connection occupies, if any.
    pub fn seat_of(&self, conn: &Arc<Connection>) -> Option<SeatIndex> {
        self.seats.iter().position(|s| {
            s.as_ref().map(|c| c.id() == conn.id()).unwrap_or(false)
        }).map(SeatIndex::new)
    }

    pub fn occupant(&self, seat: SeatIndex) -> Option<&Arc<Connection>> {
        self.seats.get(seat.get()).and_then(|s| s.as_ref())
    }

    /// Members with no seat.
    pub fn observer_count(&self) -> usize {
        self.members
            .iter()
            .filter(|m| self.seat_of(m).is_none())
            .count()
    }

    /// Human (non-automated) members, seated or observing.
    pub fn human_count(&self) -> usize {
        self.members.iter().filter(|m| !m.is_automated()).count()
    }

    /// Seated humans, as (seat, connection) pairs.
    pub fn seated_humans(&self) -> Vec<(SeatIndex, Arc<Connection>)> {
        self.seats
            .iter()
            .enumerate()
            .filter_map(|(i, s)| match s {
                Some(c) if !c.is_automated() => Some((SeatIndex::new(i), c.clone())),
                _ => None,
            })
            .collect()
    }

    /// Send a line to every member.
    pub fn broadcast(&self, line: &str) {
        for member in &self.members {
            member.put(line);
        }
    }

    /// Send a line to one seat's occupant, if seated.
    pub fn send_seat(&self, seat: SeatIndex, line: &str) {
        if let Some(conn) = self.occupant(seat) {
            conn.put(line);
        }
    }

    pub fn refresh_expiry(&mut self, ttl: Duration) {
        self.expires_at = Instant::now() + ttl;
    }
}

/// One named session: the flag is the lock the registry hands out; the
/// mutex merely keeps the state `Sync`.
pub struct Session {
    name: String,
    pub(crate) flag: LockFlag,
    pub(crate) state: Mutex<SessionState>,
}

impl Session {
    pub fn new(name: &str, rules: Box<dyn GameRules>, ttl: Duration) -> Self {
        Self {
            name: name.to_string(),
            flag: LockFlag::new(),
            state: Mutex::new(SessionState::new(rules, ttl)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::RoundRobinGame;
    use parlor_net::transport::PairTransport;

    fn test_conn() -> Arc<Connection> {
        let (near, _far) = PairTransport::pair("test", "peer");
        Connection::spawn(Arc::new(near), false)
    }

    fn test_state() -> SessionState {
        SessionState::new(
            Box::new(RoundRobinGame::new(4, 2, 1)),
            Duration::from_secs(60),
        )
    }

    #[test]
    fn member_appears_at_most_once() {
        let mut state = test_state();
        let conn = test_conn();
        assert!(state.add_member(conn.clone()));
        assert!(!state.add_member(conn.clone()));
        assert_eq!(state.members.len(), 1);
        assert!(state.remove_member(&conn));
        assert!(!state.remove_member(&conn));
        conn.disconnect();
    }

    #[test]
    fn seat_lookup() {
        let mut state = test_state();
        let conn = test_conn();
        state.add_member(conn.clone());
        state.seats[2] = Some(conn.clone());
        assert_eq!(state.seat_of(&conn), Some(SeatIndex::new(2)));
        assert_eq!(state.observer_count(), 0);
        conn.disconnect();
    }

    #[test]
    fn reset_vote_single_registration() {
        let mut vote = ResetVote::new(4, SeatIndex::new(0));
        vote.expect(SeatIndex::new(1));
        vote.expect(SeatIndex::new(2));
        vote.auto_yes(SeatIndex::new(3));

        assert!(!vote.complete());
        assert!(vote.record(SeatIndex::new(1), true));
        assert!(!vote.record(SeatIndex::new(1), false), "second vote ignored");
        assert!(!vote.record(SeatIndex::new(3), false), "auto-counted seat cannot vote");
        assert!(!vote.complete());
        assert!(vote.record(SeatIndex::new(2), true));
        assert!(vote.complete());
        assert!(!vote.rejected());
    }

    #[test]
    fn reset_vote_any_no_rejects() {
        let mut vote = ResetVote::new(3, SeatIndex::new(1));
        vote.expect(SeatIndex::new(0));
        vote.expect(SeatIndex::new(2));
        vote.record(SeatIndex::new(0), true);
        vote.record(SeatIndex::new(2), false);
        assert!(vote.complete());
        assert!(vote.rejected());
    }
}
