//! One connected peer: identity, version, outbound queue, EOF tracking.
//!
//! A `Connection` owns exactly one writer thread draining its outbound
//! queue; the matching blocking read loop runs on whatever thread owns the
//! connection (the dispatcher spawns one per accepted peer, a bot runs its
//! own). Inbound and outbound EOF are tracked independently — a peer that
//! stopped sending may still be receiving, and queued outbound messages are
//! delivered before the write side closes.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, warn};

use parlor_types::VERSION_UNKNOWN;

use crate::transport::{RecvOutcome, Transport};

/// How long the writer sleeps on an empty queue before re-checking flags.
const WRITER_POLL: Duration = Duration::from_millis(500);
/// How long `read_blocking` waits per transport poll.
const READER_POLL: Duration = Duration::from_millis(250);

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique connection identifier, stable across naming. Application
/// layers key their per-connection state on this instead of a payload
/// pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(u64);

impl ConnId {
    fn next() -> Self {
        Self(NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed))
    }
    pub fn get(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ConnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What a blocking read produced.
#[derive(Debug, PartialEq, Eq)]
pub enum ReadEvent {
    Line(String),
    /// Inbound direction is finished: peer EOF, transport error, or local
    /// disconnect. The error field holds details when there are any.
    Eof,
}

enum WriterCmd {
    Line(String),
    /// Travels the queue behind already-enqueued lines, so pending output
    /// drains before the write side closes.
    Close,
}

pub struct Connection {
    id: ConnId,
    transport: Arc<dyn Transport>,
    host: String,
    automated: bool,
    /// Identity key; naming happens exactly once and is irreversible.
    key: OnceLock<String>,
    version: AtomicI32,
    outbound: Mutex<Option<Sender<WriterCmd>>>,
    inbound_eof: AtomicBool,
    outbound_eof: AtomicBool,
    closing: AtomicBool,
    error: Mutex<Option<String>>,
}

impl Connection {
    /// Wrap an established transport and start its writer thread.
    pub fn spawn(transport: Arc<dyn Transport>, automated: bool) -> Arc<Self> {
        let (tx, rx) = unbounded();
        let conn = Arc::new(Self {
            id: ConnId::next(),
            host: transport.peer_label(),
            transport,
            automated,
            key: OnceLock::new(),
            version: AtomicI32::new(VERSION_UNKNOWN),
            outbound: Mutex::new(Some(tx)),
            inbound_eof: AtomicBool::new(false),
            outbound_eof: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            error: Mutex::new(None),
        });

        let writer_conn = conn.clone();
        thread::Builder::new()
            .name(format!("writer-{}", conn.id.get()))
            .spawn(move || writer_conn.writer_loop(rx))
            .expect("spawn writer thread");

        conn
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// True for in-process automated participants (bots).
    pub fn is_automated(&self) -> bool {
        self.automated
    }

    /// The identity key, once named.
    pub fn key(&self) -> Option<&str> {
        self.key.get().map(|s| s.as_str())
    }

    /// Set the identity key. Fails if this connection was already named —
    /// naming is irreversible. Uniqueness across connections is the
    /// dispatcher's job (`claim_name`), which calls this under its table
    /// lock.
    pub(crate) fn set_key(&self, key: &str) -> Result<(), ()> {
        self.key.set(key.to_string()).map_err(|_| ())
    }

    pub fn version(&self) -> i32 {
        self.version.load(Ordering::SeqCst)
    }

    pub(crate) fn set_version(&self, version: i32) {
        self.version.store(version, Ordering::SeqCst);
    }

    /// Queue a message for asynchronous delivery. Never blocks; FIFO per
    /// connection. Messages queued after `disconnect` are dropped.
    pub fn put(&self, line: &str) {
        let guard = match self.outbound.lock() {
            Ok(g) => g,
            Err(_) => return,
        };
        match guard.as_ref() {
            Some(tx) => {
                let _ = tx.send(WriterCmd::Line(line.to_string()));
            }
            None => debug!(target: "net", "{} dropped outbound line (closed)", self.id),
        }
    }

    /// Close both directions. Idempotent and safe from any thread. Output
    /// already queued is still delivered: the close request rides the queue
    /// behind it.
    pub fn disconnect(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Ok(mut guard) = self.outbound.lock() {
            if let Some(tx) = guard.take() {
                let _ = tx.send(WriterCmd::Close);
            }
        }
    }

    /// True until both directions have reached EOF. A half-closed
    /// connection (inbound done, outbound still draining) is still
    /// connected.
    pub fn is_connected(&self) -> bool {
        !(self.inbound_eof.load(Ordering::SeqCst) && self.outbound_eof.load(Ordering::SeqCst))
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Last transport error, if any.
    pub fn last_error(&self) -> Option<String> {
        self.error.lock().ok().and_then(|g| g.clone())
    }

    fn record_error(&self, context: &str, e: &std::io::Error) {
        if let Ok(mut guard) = self.error.lock() {
            if guard.is_none() {
                *guard = Some(format!("{}: {}", context, e));
            }
        }
    }

    /// Blocking read loop step for the owning thread. Polls the transport
    /// with a bounded wait so local disconnects are observed; transport
    /// errors are recorded, never propagated.
    pub fn read_blocking(&self) -> ReadEvent {
        loop {
            if self.closing.load(Ordering::SeqCst) && self.inbound_eof.load(Ordering::SeqCst) {
                return ReadEvent::Eof;
            }
            match self.transport.recv_line(READER_POLL) {
                Ok(RecvOutcome::Line(line)) => return ReadEvent::Line(line),
                Ok(RecvOutcome::TimedOut) => {
                    if self.closing.load(Ordering::SeqCst) {
                        self.inbound_eof.store(true, Ordering::SeqCst);
                        return ReadEvent::Eof;
                    }
                }
                Ok(RecvOutcome::Eof) => {
                    self.inbound_eof.store(true, Ordering::SeqCst);
                    return ReadEvent::Eof;
                }
                Err(e) => {
                    self.record_error("read", &e);
                    self.inbound_eof.store(true, Ordering::SeqCst);
                    return ReadEvent::Eof;
                }
            }
        }
    }

    /// Deliver one queued command. Returns true when the writer should stop.
    fn write_cmd(&self, cmd: WriterCmd) -> bool {
        match cmd {
            WriterCmd::Line(line) => match self.transport.send_line(&line) {
                Ok(()) => false,
                Err(e) => {
                    warn!(target: "net", "{} write failed: {}", self.id, e);
                    self.record_error("write", &e);
                    true
                }
            },
            WriterCmd::Close => true,
        }
    }

    fn writer_loop(&self, rx: Receiver<WriterCmd>) {
        'main: loop {
            match rx.recv_timeout(WRITER_POLL) {
                Ok(cmd) => {
                    if self.write_cmd(cmd) {
                        break 'main;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    // Queue empty; re-check shutdown and keep waiting.
                    if self.closing.load(Ordering::SeqCst) {
                        // Deliver anything that raced in ahead of the close
                        // request before stopping.
                        while let Ok(cmd) = rx.try_recv() {
                            if self.write_cmd(cmd) {
                                break;
                            }
                        }
                        break 'main;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break 'main,
            }
        }
        self.outbound_eof.store(true, Ordering::SeqCst);
        self.closing.store(true, Ordering::SeqCst);
        self.transport.shutdown();
        debug!(target: "net", "{} writer finished", self.id);
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("host", &self.host)
            .field("key", &self.key())
            .field("version", &self.version())
            .field("automated", &self.automated)
            .finish()
    }
}
