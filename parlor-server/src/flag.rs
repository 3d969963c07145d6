//! Cooperative per-entity locking primitive.
//!
//! A `LockFlag` is one boolean "held" state with wait/notify semantics,
//! built on a native mutex + condvar. Waiters use a bounded wait and then
//! re-check the flag, so a missed notify (or a holder that died without
//! releasing) degrades to a short stall, never an indefinite deadlock.
//! Spurious wakeups are harmless for the same reason.

use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Upper bound on a single condvar wait before the flag is re-checked.
const WAIT_SLICE: Duration = Duration::from_millis(100);

/// Why an acquisition attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireError {
    /// The flag stayed held past the caller's deadline.
    Timeout,
    /// The owning entity was destroyed; nobody will ever release this flag.
    Gone,
}

impl std::fmt::Display for AcquireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout => write!(f, "lock acquisition timed out"),
            Self::Gone => write!(f, "lock owner destroyed"),
        }
    }
}

impl std::error::Error for AcquireError {}

struct FlagState {
    held: bool,
    dead: bool,
}

pub struct LockFlag {
    state: Mutex<FlagState>,
    cond: Condvar,
}

impl LockFlag {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FlagState {
                held: false,
                dead: false,
            }),
            cond: Condvar::new(),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, FlagState> {
        // A panic while holding the state mutex leaves the data consistent
        // (two booleans); recover rather than cascade.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Take the flag, waiting up to `timeout`. Callers must pair every
    /// success with `release` on every exit path (the registry's guards do
    /// this structurally).
    pub fn acquire(&self, timeout: Duration) -> Result<(), AcquireError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock_state();
        loop {
            if state.dead {
                return Err(AcquireError::Gone);
            }
            if !state.held {
                state.held = true;
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(AcquireError::Timeout);
            }
            let slice = WAIT_SLICE.min(deadline - now);
            let (next, _) = self
                .cond
                .wait_timeout(state, slice)
                .unwrap_or_else(|e| e.into_inner());
            state = next;
        }
    }

    /// Release the flag and wake all waiters.
    pub fn release(&self) {
        let mut state = self.lock_state();
        state.held = false;
        drop(state);
        self.cond.notify_all();
    }

    /// Mark the owning entity destroyed: the flag is force-released, every
    /// current and future waiter gets `Gone`.
    pub fn kill(&self) {
        let mut state = self.lock_state();
        state.held = false;
        state.dead = true;
        drop(state);
        self.cond.notify_all();
    }

    pub fn is_held(&self) -> bool {
        self.lock_state().held
    }

    /// Release without notifying anyone. Test hook for the missed-notify
    /// scenario; the bounded wait slice must still make waiters progress.
    #[cfg(test)]
    fn release_silently(&self) {
        self.lock_state().held = false;
    }
}

impl Default for LockFlag {
    fn default() -> Self {
        Self::new()
    }
}
