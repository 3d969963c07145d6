//! Application handler: the treat loop's view of the game server.
//!
//! Parses inbound lines, gates them on version and login, and routes
//! session work into the lifecycle layer. Runs entirely on the dispatcher's
//! treat thread; nothing here blocks.

use std::sync::{Arc, Mutex, MutexGuard};

use log::{info, warn};

use parlor_net::connection::Connection;
use parlor_net::dispatcher::{DispatcherHandle, NameError, ServerHandler};
use parlor_types::store::{AccountStore, StoreError};
use parlor_types::{SERVER_FLOOR_VERSION, VERSION_UNKNOWN};

use crate::codec::{self, Command};
use crate::lifecycle::Lifecycle;

pub struct GameHandler {
    dispatcher: DispatcherHandle,
    lifecycle: Arc<Mutex<Lifecycle>>,
    store: Arc<dyn AccountStore>,
}

impl GameHandler {
    pub fn new(
        dispatcher: DispatcherHandle,
        lifecycle: Arc<Mutex<Lifecycle>>,
        store: Arc<dyn AccountStore>,
    ) -> Self {
        Self {
            dispatcher,
            lifecycle,
            store,
        }
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn login(&mut self, conn: &Arc<Connection>, name: &str, credential: &str) {
        if conn.version() == VERSION_UNKNOWN {
            conn.put("error version-first announce your protocol version before login");
            return;
        }
        if conn.key().is_some() {
            conn.put("error already-logged-in");
            return;
        }
        match self.store.authenticate(name, credential) {
            Ok(()) => {}
            Err(StoreError::BadCredential) => {
                conn.put("error bad-credential");
                return;
            }
            Err(e) => {
                warn!(target: "handler", "authenticate '{}': {}", name, e);
                conn.put("error store-unavailable");
                return;
            }
        }
        match self.dispatcher.claim_name(conn, name) {
            Ok(()) => {
                info!(target: "handler", "{} logged in as '{}'", conn.id(), name);
                conn.put(&format!("ok login {}", name));
            }
            Err(NameError::Taken) => conn.put("error name-taken"),
            Err(NameError::AlreadyNamed) => conn.put("error already-logged-in"),
            Err(NameError::Disconnected) => {}
        }
    }
}

impl ServerHandler for GameHandler {
    fn connection_opened(&mut self, conn: &Arc<Connection>) {
        conn.put(&format!("welcome parlor {}", SERVER_FLOOR_VERSION));
    }

    fn command(&mut self, conn: &Arc<Connection>, line: &str) {
        // A late line from a connection already being torn down.
        if conn.is_closing() {
            return;
        }

        let command = match codec::parse(line) {
            Ok(c) => c,
            Err(e) => {
                conn.put(&format!("error bad-command {}", e));
                return;
            }
        };

        // Only version negotiation, login, and keepalives are open to
        // unnamed connections.
        let pre_login = matches!(
            command,
            Command::Version(_) | Command::Login { .. } | Command::Ping | Command::Quit
        );
        if !pre_login && conn.key().is_none() {
            conn.put("error login-required");
            return;
        }

        match command {
            Command::Version(v) => {
                if v < SERVER_FLOOR_VERSION {
                    // Below the absolute floor: reject, then soft-disconnect.
                    conn.put(&format!(
                        "error version-too-low server floor is {}",
                        SERVER_FLOOR_VERSION
                    ));
                    self.dispatcher.remove(conn);
                } else {
                    self.dispatcher.note_version(conn, v);
                    conn.put(&format!("ok version {}", v));
                }
            }
            Command::Login { name, credential } => self.login(conn, &name, &credential),
            Command::Ping => conn.put("pong"),
            Command::Quit => {
                conn.put("bye");
                self.dispatcher.remove(conn);
            }
            Command::Enlist => {
                if conn.is_automated() {
                    self.lifecycle().register_bot(conn);
                } else {
                    conn.put("error enlist-is-for-automated-clients");
                }
            }
            Command::Join { session, seat } => self.lifecycle().join(conn, &session, seat),
            Command::Sit { session, seat } => self.lifecycle().sit(conn, &session, seat),
            Command::Leave { session } => self.lifecycle().leave(conn, &session),
            Command::Move { session, text } => self.lifecycle().apply_move(conn, &session, &text),
            Command::Reset { session } => self.lifecycle().reset_request(conn, &session),
            Command::Vote { session, yes } => self.lifecycle().reset_vote(conn, &session, yes),
            Command::Say { session, text } => self.lifecycle().say(conn, &session, &text),
        }
    }

    fn connection_closed(&mut self, conn: &Arc<Connection>) {
        self.lifecycle().connection_closed(conn);
    }
}
