//! Rules-engine abstraction.
//!
//! The session core never interprets game moves. Everything a session knows
//! about its game lives behind [`GameRules`]: seat occupancy, whose turn it
//! is, whether a vacated seat needs a substitute, and how to rebuild the game
//! for a reset-in-place. Implementations can be anything from the bundled
//! round-robin reference game to a full rules engine in another crate.

use crate::SeatIndex;

/// A player-visible event produced by the rules engine while applying a move.
///
/// The lifecycle layer relays these to connections; the engine never writes
/// to the network itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleEvent {
    /// Deliver to a single seat.
    Seat(SeatIndex, String),
    /// Deliver to every member of the session (seated or observing).
    All(String),
}

/// Error type for rules-engine operations.
#[derive(Debug)]
pub enum RulesError {
    /// The move is not legal in the current game state.
    IllegalMove(String),
    /// The seat is out of range or not in a state that allows the operation.
    BadSeat(SeatIndex),
    /// The operation makes no sense right now (e.g. advancing a finished game).
    BadState(String),
}

impl std::fmt::Display for RulesError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::IllegalMove(m) => write!(f, "illegal move: {}", m),
            Self::BadSeat(seat) => write!(f, "bad seat: {}", seat),
            Self::BadState(m) => write!(f, "bad state: {}", m),
        }
    }
}

impl std::error::Error for RulesError {}

/// The external game-rules collaborator, one instance per session payload.
///
/// Contract notes:
/// - All calls happen with the owning session's lock held; implementations
///   need no internal synchronization beyond being `Send`.
/// - Errors are reported to the offending participant and never tear down
///   the session.
pub trait GameRules: Send {
    /// Number of seats at the table (fixed for the life of the game).
    fn seat_count(&self) -> usize;

    /// Minimum protocol version a client needs to join this game.
    fn min_version(&self) -> i32;

    /// True once the game has reached a terminal state.
    fn is_over(&self) -> bool;

    /// True if nobody (human or substitute) holds the seat.
    fn is_seat_vacant(&self, seat: SeatIndex) -> bool;

    /// True if the seat was vacated mid-game and play cannot continue until
    /// someone fills it.
    fn seat_needs_substitute(&self, seat: SeatIndex) -> bool;

    /// The seat whose turn it is, if the game has started and is not over.
    fn current_turn_seat(&self) -> Option<SeatIndex>;

    /// Mark a seat as occupied. Called by the lifecycle layer on sit-down.
    fn occupy(&mut self, seat: SeatIndex) -> Result<(), RulesError>;

    /// Mark a seat as vacated. Called by the lifecycle layer on leave.
    fn vacate(&mut self, seat: SeatIndex) -> Result<(), RulesError>;

    /// Apply one opaque move command for the given seat.
    fn apply_command(&mut self, seat: SeatIndex, command: &str)
        -> Result<Vec<RuleEvent>, RulesError>;

    /// Whether the turn can be advanced past the current seat without input
    /// from it (used when a seat empties and no substitute is available).
    fn can_advance_turn(&self) -> bool;

    /// Advance the turn past the current seat.
    fn advance_turn(&mut self) -> Result<Vec<RuleEvent>, RulesError>;

    /// Forcibly terminate the in-flight portion of the current turn,
    /// discarding any partial action state. Always succeeds.
    fn abort_turn(&mut self) -> Vec<RuleEvent>;

    /// Serialize enough state for a client to render the game.
    fn serialize_state(&self) -> String;

    /// Final `(score, won)` per seat, indexed by seat. Meaningful once
    /// `is_over()` returns true; used for outcome recording.
    fn final_standings(&self) -> Vec<(i64, bool)>;

    /// Build the successor game for a reset-in-place, carrying forward
    /// whatever survives a reset (e.g. cumulative scores). Seat occupancy is
    /// NOT carried; the lifecycle layer re-seats participants.
    fn renewed(&self) -> Box<dyn GameRules>;
}
