//! Named session registry with two lock tiers.
//!
//! The global flag serializes structural operations (create / destroy /
//! enumerate); each session's own flag serializes work inside it, and flags
//! of different sessions are independent — two unrelated sessions mutate in
//! parallel.
//!
//! Lock ordering rules (the deadlock discipline):
//! - never hold the global guard while blocking on a session guard
//!   (`destroy_session` is the one exception and uses a short bounded
//!   attempt that aborts instead of blocking);
//! - never hold two session guards at once;
//! - registry-wide broadcasts visit sessions one at a time, never nested.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{error, info};

use parlor_types::rules::GameRules;

use crate::flag::{AcquireError, LockFlag};
use crate::session::{Session, SessionState};

/// Default bound on waiting for any flag; a crashed holder costs at most
/// this much, not forever.
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);
/// Bound on the destroy path's session-flag attempt while the global guard
/// is held; it must not block, only try briefly and abort.
const DESTROY_ACQUIRE_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockError {
    /// The flag stayed held past the bound.
    Timeout,
    /// The session was destroyed while (or before) we waited.
    Gone,
    /// No session by that name.
    NoSuchSession,
}

impl std::fmt::Display for LockError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout => write!(f, "lock timed out"),
            Self::Gone => write!(f, "session destroyed"),
            Self::NoSuchSession => write!(f, "no such session"),
        }
    }
}

impl std::error::Error for LockError {}

impl From<AcquireError> for LockError {
    fn from(e: AcquireError) -> Self {
        match e {
            AcquireError::Timeout => Self::Timeout,
            AcquireError::Gone => Self::Gone,
        }
    }
}

/// RAII witness that the global flag is held.
pub struct GlobalGuard<'a> {
    registry: &'a SessionRegistry,
}

impl Drop for GlobalGuard<'_> {
    fn drop(&mut self) {
        self.registry.global.release();
    }
}

/// RAII witness that one session's flag is held. `state()` is the only way
/// to touch session internals, so release-on-every-exit-path is structural.
pub struct SessionGuard {
    session: Arc<Session>,
}

impl SessionGuard {
    pub fn name(&self) -> &str {
        self.session.name()
    }

    pub fn state(&self) -> std::sync::MutexGuard<'_, SessionState> {
        self.session.lock_state()
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.session.flag.release();
    }
}

impl std::fmt::Debug for SessionGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionGuard")
            .field("session", &self.session.name())
            .finish()
    }
}

pub struct SessionRegistry {
    global: LockFlag,
    sessions: Mutex<HashMap<String, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            global: LockFlag::new(),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn map(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<Session>>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Serialize structural operations across the whole registry.
    pub fn lock_global(&self) -> Result<GlobalGuard<'_>, LockError> {
        self.global.acquire(ACQUIRE_TIMEOUT)?;
        Ok(GlobalGuard { registry: self })
    }

    /// Serialize operations within one named session.
    pub fn lock_session(&self, name: &str) -> Result<SessionGuard, LockError> {
        let session = self
            .map()
            .get(name)
            .cloned()
            .ok_or(LockError::NoSuchSession)?;
        session.flag.acquire(ACQUIRE_TIMEOUT)?;
        Ok(SessionGuard { session })
    }

    /// Create a session. Idempotent: returns false if the name exists.
    pub fn create_session(
        &self,
        _global: &GlobalGuard<'_>,
        name: &str,
        rules: Box<dyn GameRules>,
        ttl: Duration,
    ) -> bool {
        let mut map = self.map();
        if map.contains_key(name) {
            return false;
        }
        map.insert(name.to_string(), Arc::new(Session::new(name, rules, ttl)));
        info!(target: "session", "created session '{}'", name);
        true
    }

    /// Destroy a session: briefly take its flag (abort on failure — an
    /// entity is never deleted while its flag is held), clear members, wake
    /// every waiter with `Gone`, remove the record.
    pub fn destroy_session(&self, _global: &GlobalGuard<'_>, name: &str) -> bool {
        let session = match self.map().get(name).cloned() {
            Some(s) => s,
            None => return false,
        };

        if let Err(e) = session.flag.acquire(DESTROY_ACQUIRE_TIMEOUT) {
            // Someone is wedged inside the session; aborting beats
            // corrupting shared state.
            error!(target: "session", "cannot destroy '{}': {}", name, e);
            return false;
        }

        {
            let mut state = session.lock_state();
            state.members.clear();
            for seat in state.seats.iter_mut() {
                *seat = None;
            }
            state.reset_vote = None;
        }
        session.flag.kill();
        self.map().remove(name);
        info!(target: "session", "destroyed session '{}'", name);
        true
    }

    pub fn contains(&self, name: &str) -> bool {
        self.map().contains_key(name)
    }

    /// Snapshot of session names for one-at-a-time visits.
    pub fn session_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.map().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn session_count(&self) -> usize {
        self.map().len()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
