//! # parlor-types
//!
//! Shared type definitions for the Parlor game-server ecosystem.
//! This crate contains the vocabulary used across parlor-net and
//! parlor-server: seat and version primitives, plus the traits behind
//! which the game rules engine and the account store live.

pub mod rules;
pub mod store;

pub use rules::{GameRules, RuleEvent, RulesError};
pub use store::{AccountStore, SeatOutcome, StoreError};

/// Protocol version of a connection before the client has announced one.
pub const VERSION_UNKNOWN: i32 = -1;

/// Absolute minimum protocol version the server will talk to at all.
/// Clients below this are rejected and disconnected at negotiation time;
/// individual sessions may demand more (see `GameRules::min_version`).
pub const SERVER_FLOOR_VERSION: i32 = 1;

/// Minimum protocol version that understands reset-vote prompts.
/// Seats held by older clients are auto-counted as "yes" when a vote opens,
/// since the prompt cannot reach them and silence must not become a veto.
pub const VOTE_MIN_VERSION: i32 = 2;

/// Seat position at a session's table.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(transparent)]
pub struct SeatIndex(usize);

impl SeatIndex {
    pub fn new(index: usize) -> Self {
        Self(index)
    }
    pub fn get(self) -> usize {
        self.0
    }
}

impl std::fmt::Display for SeatIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seat_index_roundtrip() {
        let seat = SeatIndex::new(3);
        assert_eq!(seat.get(), 3);
        assert_eq!(seat.to_string(), "3");
    }

    #[test]
    fn version_floor_is_above_unknown() {
        assert!(SERVER_FLOOR_VERSION > VERSION_UNKNOWN);
        assert!(VOTE_MIN_VERSION >= SERVER_FLOOR_VERSION);
    }
}
