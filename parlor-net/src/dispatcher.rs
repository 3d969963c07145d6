//! Connection acceptance and the single-consumer command pipeline.
//!
//! Architecture: thread-per-reader with one central bounded channel.
//!
//! - **Accept thread**: blocks on `TcpListener::accept` (non-blocking poll so
//!   shutdown is observed) and hands each stream to `admit`.
//! - **Reader threads** (one per connection): block on the transport, and on
//!   the first successful read run the two-phase admission — phase 1 under
//!   the connection-table lock may reject (connection limit) with a soft
//!   disconnect; phase 2, lock released, enqueues the opened event. Every
//!   subsequent line goes through `submit` untouched.
//! - **Treat thread**: the only consumer. Dequeues one event at a time and
//!   invokes the handler, so all session mutation triggered by commands is
//!   serialized without further locking. Handlers must not block; a handler
//!   panic is caught and logged, never allowed to stop the loop.
//!
//! Event order per connection is opened → commands (in send order) → closed.
//! A command already in the queue when its connection is removed may still
//! reach the handler after the closed event; handlers ignore lines from
//! closing connections.

use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, TcpListener};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use log::{error, info, warn};

use parlor_types::VERSION_UNKNOWN;

use crate::connection::{ConnId, Connection, ReadEvent};
use crate::transport::{PairTransport, TcpTransport, Transport};

/// How long the treat loop waits on an empty queue before re-checking the
/// shutdown flag.
const TREAT_POLL: Duration = Duration::from_secs(1);
/// Accept-thread poll interval while the listener has nothing pending.
const ACCEPT_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Hard cap on simultaneously admitted connections.
    pub max_connections: usize,
    /// Capacity of the shared inbound queue; readers block when it fills,
    /// which is the backpressure.
    pub queue_capacity: usize,
    /// Line sent to a connection rejected at admission.
    pub reject_full_message: String,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_connections: 64,
            queue_capacity: 1024,
            reject_full_message: "error server-full".into(),
        }
    }
}

/// Application hook invoked only from the treat thread.
///
/// Contract: implementations must not sleep or perform blocking I/O — the
/// treat loop is the serialization point for every client, and anything slow
/// here stalls all of them.
pub trait ServerHandler: Send {
    /// Phase-2 admission: the connection passed the limit check and sent its
    /// first line. Welcome messages go here; no dispatcher lock is held.
    fn connection_opened(&mut self, conn: &Arc<Connection>);
    /// One inbound command line.
    fn command(&mut self, conn: &Arc<Connection>, line: &str);
    /// The connection left the table; it is already disconnected.
    fn connection_closed(&mut self, conn: &Arc<Connection>);
}

/// Why `claim_name` refused.
#[derive(Debug, PartialEq, Eq)]
pub enum NameError {
    /// Another live connection already holds this identity.
    Taken,
    /// This connection was already named; naming is irreversible.
    AlreadyNamed,
    /// The connection was removed before it could be named.
    Disconnected,
}

impl std::fmt::Display for NameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Taken => write!(f, "identity already in use"),
            Self::AlreadyNamed => write!(f, "connection already named"),
            Self::Disconnected => write!(f, "connection gone"),
        }
    }
}

impl std::error::Error for NameError {}

enum Inbound {
    Opened(Arc<Connection>),
    Command(Arc<Connection>, String),
    Closed(Arc<Connection>),
}

/// Named vs. unnamed connections plus per-version tallies. All mutation
/// happens under one lock; nothing here blocks.
#[derive(Default)]
struct ConnectionTable {
    unnamed: HashMap<ConnId, Arc<Connection>>,
    named: HashMap<String, Arc<Connection>>,
    version_counts: HashMap<i32, usize>,
}

impl ConnectionTable {
    fn total(&self) -> usize {
        self.unnamed.len() + self.named.len()
    }

    fn remove(&mut self, conn: &Arc<Connection>) -> bool {
        let found = if self.unnamed.remove(&conn.id()).is_some() {
            true
        } else if let Some(key) = conn.key() {
            match self.named.get(key) {
                Some(existing) if existing.id() == conn.id() => {
                    self.named.remove(key);
                    true
                }
                _ => false,
            }
        } else {
            false
        };

        if found {
            let v = conn.version();
            if v != VERSION_UNKNOWN {
                if let Some(count) = self.version_counts.get_mut(&v) {
                    *count = count.saturating_sub(1);
                    if *count == 0 {
                        self.version_counts.remove(&v);
                    }
                }
            }
        }
        found
    }
}

struct Inner {
    config: DispatcherConfig,
    table: Mutex<ConnectionTable>,
    inbound_tx: Sender<Inbound>,
    keep_running: AtomicBool,
}

impl Inner {
    /// Start reader + writer machinery for an established transport and run
    /// it through admission on its first line.
    fn admit(self: &Arc<Self>, transport: Arc<dyn Transport>, automated: bool) -> Arc<Connection> {
        let conn = Connection::spawn(transport, automated);
        info!(target: "net", "{} connecting from {}", conn.id(), conn.host());

        let inner = self.clone();
        let reader_conn = conn.clone();
        thread::Builder::new()
            .name(format!("reader-{}", conn.id().get()))
            .spawn(move || inner.reader_loop(reader_conn))
            .expect("spawn reader thread");
        conn
    }

    fn reader_loop(self: Arc<Self>, conn: Arc<Connection>) {
        // Admission happens on the first successful read, so peers that
        // connect and never speak hold no slot.
        let first = match conn.read_blocking() {
            ReadEvent::Line(line) => line,
            ReadEvent::Eof => {
                conn.disconnect();
                return;
            }
        };

        // Phase 1: limit check under the table lock.
        let admitted = match self.table.lock() {
            Ok(mut table) => {
                if table.total() >= self.config.max_connections {
                    false
                } else {
                    table.unnamed.insert(conn.id(), conn.clone());
                    true
                }
            }
            Err(_) => false,
        };

        if !admitted {
            warn!(target: "net", "{} rejected: connection limit reached", conn.id());
            conn.put(&self.config.reject_full_message);
            conn.disconnect();
            return;
        }

        // Phase 2: no lock held; the handler greets from the treat thread.
        if self.inbound_tx.send(Inbound::Opened(conn.clone())).is_err() {
            return;
        }
        if self
            .inbound_tx
            .send(Inbound::Command(conn.clone(), first))
            .is_err()
        {
            return;
        }

        loop {
            match conn.read_blocking() {
                ReadEvent::Line(line) => {
                    if self
                        .inbound_tx
                        .send(Inbound::Command(conn.clone(), line))
                        .is_err()
                    {
                        break;
                    }
                }
                ReadEvent::Eof => break,
            }
        }
        self.remove(&conn);
    }

    fn remove(&self, conn: &Arc<Connection>) {
        let removed = match self.table.lock() {
            Ok(mut table) => table.remove(conn),
            Err(_) => false,
        };
        if removed {
            // Disconnect first so cleanup always sees a disconnected
            // connection.
            conn.disconnect();
            let _ = self.inbound_tx.send(Inbound::Closed(conn.clone()));
            if let Some(e) = conn.last_error() {
                info!(target: "net", "{} removed ({})", conn.id(), e);
            } else {
                info!(target: "net", "{} removed", conn.id());
            }
        }
    }

    fn claim_name(&self, conn: &Arc<Connection>, key: &str) -> Result<(), NameError> {
        let mut table = self.table.lock().map_err(|_| NameError::Disconnected)?;
        if table.named.contains_key(key) {
            return Err(NameError::Taken);
        }
        if conn.key().is_some() {
            return Err(NameError::AlreadyNamed);
        }
        if table.unnamed.remove(&conn.id()).is_none() {
            return Err(NameError::Disconnected);
        }
        conn.set_key(key).map_err(|_| NameError::AlreadyNamed)?;
        table.named.insert(key.to_string(), conn.clone());
        Ok(())
    }

    fn treat_loop(&self, rx: Receiver<Inbound>, mut handler: Box<dyn ServerHandler>) {
        while self.keep_running.load(Ordering::SeqCst) {
            let event = match rx.recv_timeout(TREAT_POLL) {
                Ok(event) => event,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };
            // One erroring command must never stop the pipeline.
            let outcome = catch_unwind(AssertUnwindSafe(|| match &event {
                Inbound::Opened(conn) => handler.connection_opened(conn),
                Inbound::Command(conn, line) => handler.command(conn, line),
                Inbound::Closed(conn) => handler.connection_closed(conn),
            }));
            if outcome.is_err() {
                error!(target: "net", "command handler panicked; continuing");
            }
        }
    }
}

/// Cloneable, thread-safe view of the dispatcher for application layers.
#[derive(Clone)]
pub struct DispatcherHandle {
    inner: Arc<Inner>,
}

impl DispatcherHandle {
    /// Create an in-process connection pair: the far side is admitted like
    /// any accepted socket, the near side is returned for the caller (bot,
    /// practice client, test) to drive.
    pub fn attach_local(&self, label: &str, automated: bool) -> Arc<Connection> {
        let (near, far) = PairTransport::pair(&format!("local:{}", label), "server");
        self.inner.admit(Arc::new(far), automated);
        Connection::spawn(Arc::new(near), automated)
    }

    /// Atomically bind an identity key to a connection: at most one live
    /// connection holds any key.
    pub fn claim_name(&self, conn: &Arc<Connection>, key: &str) -> Result<(), NameError> {
        self.inner.claim_name(conn, key)
    }

    /// Record a connection's negotiated protocol version and move it between
    /// version tallies.
    pub fn note_version(&self, conn: &Arc<Connection>, version: i32) {
        if let Ok(mut table) = self.inner.table.lock() {
            let old = conn.version();
            if old != VERSION_UNKNOWN {
                if let Some(count) = table.version_counts.get_mut(&old) {
                    *count = count.saturating_sub(1);
                    if *count == 0 {
                        table.version_counts.remove(&old);
                    }
                }
            }
            conn.set_version(version);
            *table.version_counts.entry(version).or_insert(0) += 1;
        }
    }

    /// Remove a connection from whichever set holds it, disconnect it, and
    /// queue the cleanup event. Idempotent.
    pub fn remove(&self, conn: &Arc<Connection>) {
        self.inner.remove(conn);
    }

    pub fn find_named(&self, key: &str) -> Option<Arc<Connection>> {
        self.inner.table.lock().ok()?.named.get(key).cloned()
    }

    /// Send a line to every named connection.
    pub fn broadcast(&self, line: &str) {
        let conns: Vec<Arc<Connection>> = match self.inner.table.lock() {
            Ok(table) => table.named.values().cloned().collect(),
            Err(_) => return,
        };
        for conn in conns {
            conn.put(line);
        }
    }

    pub fn named_count(&self) -> usize {
        self.inner.table.lock().map(|t| t.named.len()).unwrap_or(0)
    }

    pub fn unnamed_count(&self) -> usize {
        self.inner.table.lock().map(|t| t.unnamed.len()).unwrap_or(0)
    }

    /// Current connection tally per protocol version.
    pub fn version_counts(&self) -> Vec<(i32, usize)> {
        let mut counts: Vec<(i32, usize)> = self
            .inner
            .table
            .lock()
            .map(|t| t.version_counts.iter().map(|(v, c)| (*v, *c)).collect())
            .unwrap_or_default();
        counts.sort_unstable();
        counts
    }
}

/// Owner of the accept, reader, and treat threads.
pub struct Dispatcher {
    inner: Arc<Inner>,
    inbound_rx: Option<Receiver<Inbound>>,
    treat: Option<JoinHandle<()>>,
    accept: Option<JoinHandle<()>>,
}

impl Dispatcher {
    /// Build the dispatcher without starting the treat loop, so the handler
    /// can be constructed with a `DispatcherHandle` first.
    pub fn new(config: DispatcherConfig) -> Self {
        let (inbound_tx, inbound_rx) = bounded(config.queue_capacity);
        let inner = Arc::new(Inner {
            config,
            table: Mutex::new(ConnectionTable::default()),
            inbound_tx,
            keep_running: AtomicBool::new(true),
        });
        Self {
            inner,
            inbound_rx: Some(inbound_rx),
            treat: None,
            accept: None,
        }
    }

    /// Start the treat loop. Call exactly once.
    pub fn run(&mut self, handler: Box<dyn ServerHandler>) {
        let inbound_rx = self
            .inbound_rx
            .take()
            .expect("treat loop already started");
        let treat_inner = self.inner.clone();
        self.treat = Some(
            thread::Builder::new()
                .name("treat".into())
                .spawn(move || treat_inner.treat_loop(inbound_rx, handler))
                .expect("spawn treat thread"),
        );
    }

    /// `new` + `run` in one step, for servers that build their handler
    /// without a dispatcher handle. Listening is separate — an embedded
    /// server (bots and tests only) never calls `listen`.
    pub fn start(config: DispatcherConfig, handler: Box<dyn ServerHandler>) -> Self {
        let mut dispatcher = Self::new(config);
        dispatcher.run(handler);
        dispatcher
    }

    /// Bind the listen socket and start the accept thread. Returns the bound
    /// address (port 0 lets the OS pick).
    pub fn listen(&mut self, addr: &str) -> io::Result<SocketAddr> {
        let listener = TcpListener::bind(addr)?;
        let bound = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let inner = self.inner.clone();
        let accept = thread::Builder::new()
            .name("accept".into())
            .spawn(move || {
                while inner.keep_running.load(Ordering::SeqCst) {
                    match listener.accept() {
                        Ok((stream, _addr)) => {
                            stream.set_nonblocking(false).ok();
                            match TcpTransport::from_stream(stream) {
                                Ok(transport) => {
                                    inner.admit(Arc::new(transport), false);
                                }
                                Err(e) => {
                                    warn!(target: "net", "failed to wrap stream: {}", e)
                                }
                            }
                        }
                        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                            thread::sleep(ACCEPT_POLL);
                        }
                        Err(e) => {
                            error!(target: "net", "accept failed: {}", e);
                            break;
                        }
                    }
                }
            })
            .expect("spawn accept thread");
        self.accept = Some(accept);

        info!(target: "net", "listening on {}", bound);
        Ok(bound)
    }

    pub fn handle(&self) -> DispatcherHandle {
        DispatcherHandle {
            inner: self.inner.clone(),
        }
    }

    /// Stop accepting, disconnect everyone, and join the worker threads.
    pub fn stop(mut self) {
        self.inner.keep_running.store(false, Ordering::SeqCst);

        let conns: Vec<Arc<Connection>> = match self.inner.table.lock() {
            Ok(mut table) => {
                let mut all: Vec<_> = table.unnamed.values().cloned().collect();
                all.extend(table.named.values().cloned());
                table.unnamed.clear();
                table.named.clear();
                table.version_counts.clear();
                all
            }
            Err(_) => Vec::new(),
        };
        for conn in conns {
            conn.disconnect();
        }

        if let Some(accept) = self.accept.take() {
            let _ = accept.join();
        }
        if let Some(treat) = self.treat.take() {
            let _ = treat.join();
        }
    }
}
