//! Account/persistence store abstraction.
//!
//! Invoked only at login and session-end boundaries; never inside a locked
//! critical section longer than the single call.

/// Per-seat result reported when a game ends.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SeatOutcome {
    pub player: String,
    pub score: i64,
    pub won: bool,
}

/// Error type for account-store operations.
#[derive(Debug)]
pub enum StoreError {
    /// The credential did not match the stored one.
    BadCredential,
    /// The backing store failed (I/O, SQL, ...).
    Backend(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BadCredential => write!(f, "bad credential"),
            Self::Backend(m) => write!(f, "store backend error: {}", m),
        }
    }
}

impl std::error::Error for StoreError {}

/// The account/persistence collaborator.
///
/// `authenticate` registers unknown names on first sight (storing the
/// presented credential); an existing name with a different credential is a
/// `BadCredential` rejection.
pub trait AccountStore: Send + Sync {
    fn authenticate(&self, name: &str, credential: &str) -> Result<(), StoreError>;

    /// Record the final standings of a finished game.
    fn record_outcome(&self, session: &str, outcomes: &[SeatOutcome]) -> Result<(), StoreError>;
}
