//! In-process automated participants.
//!
//! A bot is an ordinary client that happens to share the server process:
//! it attaches over a paired transport, logs in, enlists as a substitute,
//! and then answers the two prompts it understands — `sub` (sit down where
//! asked) and `your-turn` (pass). Everything else it reads is ignored.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{debug, info};

use parlor_net::connection::{Connection, ReadEvent};
use parlor_net::dispatcher::DispatcherHandle;
use parlor_types::VOTE_MIN_VERSION;

/// Credential shared by bundled bots. They authenticate like anyone else.
const BOT_CREDENTIAL: &str = "automaton";

pub struct BotHandle {
    conn: Arc<Connection>,
    thread: Option<JoinHandle<()>>,
}

impl BotHandle {
    pub fn conn(&self) -> &Arc<Connection> {
        &self.conn
    }

    /// Disconnect the bot and wait for its thread.
    pub fn stop(mut self) {
        self.conn.disconnect();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Attach a bot to the dispatcher and start its reader thread.
pub fn spawn_bot(dispatcher: &DispatcherHandle, name: &str) -> BotHandle {
    let conn = dispatcher.attach_local(name, true);
    conn.put(&format!("version {}", VOTE_MIN_VERSION));
    conn.put(&format!("login {} {}", name, BOT_CREDENTIAL));
    conn.put("enlist");
    info!(target: "bots", "bot '{}' attached as {}", name, conn.id());

    let bot_conn = conn.clone();
    let bot_name = name.to_string();
    let thread = thread::Builder::new()
        .name(format!("bot-{}", name))
        .spawn(move || {
            loop {
                match bot_conn.read_blocking() {
                    ReadEvent::Line(line) => respond(&bot_conn, &line),
                    ReadEvent::Eof => break,
                }
            }
            debug!(target: "bots", "bot '{}' finished", bot_name);
        })
        .expect("spawn bot thread");

    BotHandle {
        conn,
        thread: Some(thread),
    }
}

/// React to one server line.
fn respond(conn: &Arc<Connection>, line: &str) {
    let mut parts = line.split_whitespace();
    match parts.next() {
        Some("sub") => {
            // "sub <session> <seat>": join the session at the vacated seat.
            if let (Some(session), Some(seat)) = (parts.next(), parts.next()) {
                conn.put(&format!("join {} {}", session, seat));
            }
        }
        Some("event") => {
            // "event <session> your-turn" is the only event a bot acts on.
            if let Some(session) = parts.next() {
                if parts.next() == Some("your-turn") {
                    conn.put(&format!("move {} pass", session));
                }
            }
        }
        _ => {}
    }
}
