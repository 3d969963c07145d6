//! Transport abstraction: one send/receive contract, two backings.
//!
//! [`TcpTransport`] frames messages over a real socket; [`PairTransport`]
//! cross-wires two in-process queues so a bot or practice client can share
//! the server process. Both honor the same timeout, EOF, and FIFO ordering
//! semantics, so everything above this module is transport-agnostic. The
//! conformance suite at the bottom runs the same assertions against both.

use std::io::{self, BufReader, BufWriter, Read};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};

use crate::framing::{write_message, MAX_FRAME_BYTES};

/// Result of one bounded receive attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum RecvOutcome {
    /// One complete message arrived.
    Line(String),
    /// Nothing arrived within the wait; the caller should re-check its
    /// shutdown flags and try again.
    TimedOut,
    /// The peer closed its sending direction; no more messages will arrive.
    Eof,
}

/// A bidirectional, ordered, string-message channel.
///
/// `recv_line` must return `TimedOut` (not block forever) so owning threads
/// can observe disconnect flags; `Eof` is terminal. `send_line` after either
/// side shut down is an error, reported to the caller and never escalated.
pub trait Transport: Send + Sync {
    fn send_line(&self, line: &str) -> io::Result<()>;
    fn recv_line(&self, wait: Duration) -> io::Result<RecvOutcome>;
    /// Close both directions. Idempotent.
    fn shutdown(&self);
    /// Human-readable peer description for logs.
    fn peer_label(&self) -> String;
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

// ---------------------------------------------------------------------------
// TCP
// ---------------------------------------------------------------------------

/// Socket-backed transport. The reader and writer halves are cloned handles
/// to the same stream, each behind its own lock.
pub struct TcpTransport {
    stream: TcpStream,
    reader: Mutex<BufReader<TcpStream>>,
    writer: Mutex<BufWriter<TcpStream>>,
    peer: String,
}

impl TcpTransport {
    /// Wrap an accepted stream.
    pub fn from_stream(stream: TcpStream) -> io::Result<Self> {
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let read_half = stream.try_clone()?;
        let write_half = stream.try_clone()?;
        Ok(Self {
            stream,
            reader: Mutex::new(BufReader::new(read_half)),
            writer: Mutex::new(BufWriter::new(write_half)),
            peer,
        })
    }

    /// Establish an outbound connection. Failure is a `Result`, not a panic;
    /// the caller must not register a connection it could not establish.
    pub fn connect(addr: &str) -> io::Result<Self> {
        let stream = TcpStream::connect(addr)?;
        Self::from_stream(stream)
    }
}

/// Fill `buf` even across read timeouts: once the first byte of a frame has
/// arrived we are mid-frame, and giving up would desynchronize the stream.
fn read_remaining<R: Read>(reader: &mut R, mut buf: &mut [u8]) -> io::Result<()> {
    while !buf.is_empty() {
        match reader.read(buf) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "peer closed mid-frame",
                ))
            }
            Ok(n) => buf = &mut buf[n..],
            Err(e) if is_timeout(&e) || e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

impl Transport for TcpTransport {
    fn send_line(&self, line: &str) -> io::Result<()> {
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "writer lock poisoned"))?;
        write_message(&mut *writer, &line)
    }

    fn recv_line(&self, wait: Duration) -> io::Result<RecvOutcome> {
        let mut reader = self
            .reader
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "reader lock poisoned"))?;
        self.stream.set_read_timeout(Some(wait)).ok();

        // The first byte decides between "nothing yet" and "frame underway".
        let mut len_buf = [0u8; 4];
        match reader.read(&mut len_buf[..1]) {
            Ok(0) => return Ok(RecvOutcome::Eof),
            Ok(_) => {}
            Err(e) if is_timeout(&e) || e.kind() == io::ErrorKind::Interrupted => {
                return Ok(RecvOutcome::TimedOut)
            }
            Err(e) => return Err(e),
        }
        read_remaining(&mut *reader, &mut len_buf[1..])?;

        let len = u32::from_be_bytes(len_buf) as usize;
        if len > MAX_FRAME_BYTES {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("message too large: {} bytes", len),
            ));
        }

        let mut payload = vec![0u8; len];
        read_remaining(&mut *reader, &mut payload)?;

        let line: String = serde_json::from_slice(&payload)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        Ok(RecvOutcome::Line(line))
    }

    fn shutdown(&self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }

    fn peer_label(&self) -> String {
        self.peer.clone()
    }
}

// ---------------------------------------------------------------------------
// In-process pair
// ---------------------------------------------------------------------------

/// In-process transport: two endpoints share a pair of queues, output of A
/// is input of B. Dropping an endpoint's sender is its EOF — the peer still
/// drains whatever was already queued, matching socket half-close behavior.
pub struct PairTransport {
    tx: Mutex<Option<Sender<String>>>,
    rx: Receiver<String>,
    closed: AtomicBool,
    peer: String,
}

impl PairTransport {
    /// Create a connected endpoint pair.
    pub fn pair(label_a: &str, label_b: &str) -> (Self, Self) {
        let (a_tx, b_rx) = unbounded();
        let (b_tx, a_rx) = unbounded();
        let a = Self {
            tx: Mutex::new(Some(a_tx)),
            rx: a_rx,
            closed: AtomicBool::new(false),
            peer: label_b.to_string(),
        };
        let b = Self {
            tx: Mutex::new(Some(b_tx)),
            rx: b_rx,
            closed: AtomicBool::new(false),
            peer: label_a.to_string(),
        };
        (a, b)
    }
}

impl Transport for PairTransport {
    fn send_line(&self, line: &str) -> io::Result<()> {
        let guard = self
            .tx
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "pair lock poisoned"))?;
        match guard.as_ref() {
            Some(tx) => tx
                .send(line.to_string())
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "peer gone")),
            None => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "transport shut down",
            )),
        }
    }

    fn recv_line(&self, wait: Duration) -> io::Result<RecvOutcome> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(RecvOutcome::Eof);
        }
        match self.rx.recv_timeout(wait) {
            Ok(line) => Ok(RecvOutcome::Line(line)),
            Err(RecvTimeoutError::Timeout) => Ok(RecvOutcome::TimedOut),
            Err(RecvTimeoutError::Disconnected) => Ok(RecvOutcome::Eof),
        }
    }

    fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Ok(mut guard) = self.tx.lock() {
            guard.take();
        }
    }

    fn peer_label(&self) -> String {
        self.peer.clone()
    }
}

// ---------------------------------------------------------------------------
// Conformance suite — both implementations, same contract
// ---------------------------------------------------------------------------
