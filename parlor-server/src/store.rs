//! Account store implementations.
//!
//! `MemoryStore` backs tests and credential-less deployments; `SqliteStore`
//! persists accounts and game outcomes. Both auto-register unknown names on
//! first login; a wrong credential on a known name is a rejection.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use log::info;
use rusqlite::OptionalExtension;

use parlor_types::store::{AccountStore, SeatOutcome, StoreError};

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryStore {
    accounts: Mutex<HashMap<String, String>>,
    outcomes: Mutex<Vec<(String, SeatOutcome)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Recorded outcomes for one session, oldest first.
    pub fn outcomes_for(&self, session: &str) -> Vec<SeatOutcome> {
        self.outcomes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|(s, _)| s == session)
            .map(|(_, o)| o.clone())
            .collect()
    }
}

impl AccountStore for MemoryStore {
    fn authenticate(&self, name: &str, credential: &str) -> Result<(), StoreError> {
        let mut accounts = self.accounts.lock().unwrap_or_else(|e| e.into_inner());
        match accounts.get(name) {
            Some(stored) if stored == credential => Ok(()),
            Some(_) => Err(StoreError::BadCredential),
            None => {
                accounts.insert(name.to_string(), credential.to_string());
                Ok(())
            }
        }
    }

    fn record_outcome(&self, session: &str, outcomes: &[SeatOutcome]) -> Result<(), StoreError> {
        let mut recorded = self.outcomes.lock().unwrap_or_else(|e| e.into_inner());
        for outcome in outcomes {
            recorded.push((session.to_string(), outcome.clone()));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// SQLite
// ---------------------------------------------------------------------------

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS accounts (
    name TEXT PRIMARY KEY,
    credential TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS outcomes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session TEXT NOT NULL,
    player TEXT NOT NULL,
    score INTEGER NOT NULL,
    won INTEGER NOT NULL,
    finished_at TEXT NOT NULL DEFAULT (datetime('now'))
);
";

pub struct SqliteStore {
    conn: Mutex<rusqlite::Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = rusqlite::Connection::open(path)
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        conn.execute_batch(SCHEMA_SQL)
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        info!(target: "store", "account store at {}", path.display());
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl AccountStore for SqliteStore {
    fn authenticate(&self, name: &str, credential: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let stored: Option<String> = conn
            .query_row(
                "SELECT credential FROM accounts WHERE name = ?1",
                [name],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        match stored {
            Some(c) if c == credential => Ok(()),
            Some(_) => Err(StoreError::BadCredential),
            None => {
                conn.execute(
                    "INSERT INTO accounts (name, credential) VALUES (?1, ?2)",
                    [name, credential],
                )
                .map_err(|e| StoreError::Backend(e.to_string()))?;
                Ok(())
            }
        }
    }

    fn record_outcome(&self, session: &str, outcomes: &[SeatOutcome]) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        for outcome in outcomes {
            conn.execute(
                "INSERT INTO outcomes (session, player, score, won) VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![session, outcome.player, outcome.score, outcome.won as i64],
            )
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_outcomes() -> Vec<SeatOutcome> {
        vec![
            SeatOutcome {
                player: "alice".into(),
                score: 12,
                won: true,
            },
            SeatOutcome {
                player: "bob".into(),
                score: 7,
                won: false,
            },
        ]
    }

    #[test]
    fn memory_auto_registers_then_checks() {
        let store = MemoryStore::new();
        store.authenticate("alice", "secret").unwrap();
        store.authenticate("alice", "secret").unwrap();
        assert!(matches!(
            store.authenticate("alice", "wrong"),
            Err(StoreError::BadCredential)
        ));
    }

    #[test]
    fn memory_records_outcomes() {
        let store = MemoryStore::new();
        store.record_outcome("lounge", &sample_outcomes()).unwrap();
        let recorded = store.outcomes_for("lounge");
        assert_eq!(recorded.len(), 2);
        assert_eq!(recorded[0].player, "alice");
        assert!(recorded[0].won);
        assert!(store.outcomes_for("other").is_empty());
    }

    #[test]
    fn sqlite_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("parlor.sqlite");
        let store = SqliteStore::open(&path).unwrap();

        store.authenticate("alice", "secret").unwrap();
        store.authenticate("alice", "secret").unwrap();
        assert!(matches!(
            store.authenticate("alice", "wrong"),
            Err(StoreError::BadCredential)
        ));

        store.record_outcome("lounge", &sample_outcomes()).unwrap();

        // Accounts and outcomes survive a reopen.
        drop(store);
        let store = SqliteStore::open(&path).unwrap();
        assert!(matches!(
            store.authenticate("alice", "wrong"),
            Err(StoreError::BadCredential)
        ));
        let count: i64 = store
            .conn
            .lock()
            .unwrap()
            .query_row("SELECT COUNT(*) FROM outcomes WHERE session = 'lounge'", [], |r| {
                r.get(0)
            })
            .unwrap();
        assert_eq!(count, 2);
    }
}
