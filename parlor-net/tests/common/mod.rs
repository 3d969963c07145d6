#![allow(dead_code)]
//! Test harness utilities for parlor-net integration tests.

use std::io::{BufReader, BufWriter};
use std::net::TcpStream;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use parlor_net::connection::{ConnId, Connection};
use parlor_net::dispatcher::ServerHandler;
use parlor_net::framing::{read_message, write_message};

/// Everything the handler saw, in treat-loop order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recorded {
    Opened(ConnId),
    Command(ConnId, String),
    Closed(ConnId),
}

/// Shared log of handler events plus the server-side connection handles.
#[derive(Clone, Default)]
pub struct Journal {
    pub events: Arc<Mutex<Vec<Recorded>>>,
    pub opened: Arc<Mutex<Vec<Arc<Connection>>>>,
}

impl Journal {
    pub fn events(&self) -> Vec<Recorded> {
        self.events.lock().unwrap().clone()
    }

    pub fn commands_for(&self, id: ConnId) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Recorded::Command(cid, line) if cid == id => Some(line),
                _ => None,
            })
            .collect()
    }

    pub fn command_count(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, Recorded::Command(..)))
            .count()
    }

    pub fn opened_conns(&self) -> Vec<Arc<Connection>> {
        self.opened.lock().unwrap().clone()
    }

    /// Spin until `pred` holds or the timeout expires.
    pub fn wait_until<F: Fn(&Journal) -> bool>(&self, pred: F, timeout: Duration) {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if pred(self) {
                return;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        panic!("timed out waiting; journal: {:?}", self.events());
    }
}

/// Handler that records every event and greets admitted connections.
pub struct RecordingHandler {
    pub journal: Journal,
}

impl RecordingHandler {
    pub fn new() -> (Self, Journal) {
        let journal = Journal::default();
        (
            Self {
                journal: journal.clone(),
            },
            journal,
        )
    }
}

impl ServerHandler for RecordingHandler {
    fn connection_opened(&mut self, conn: &Arc<Connection>) {
        self.journal
            .events
            .lock()
            .unwrap()
            .push(Recorded::Opened(conn.id()));
        self.journal.opened.lock().unwrap().push(conn.clone());
        conn.put("welcome");
    }

    fn command(&mut self, conn: &Arc<Connection>, line: &str) {
        self.journal
            .events
            .lock()
            .unwrap()
            .push(Recorded::Command(conn.id(), line.to_string()));
    }

    fn connection_closed(&mut self, conn: &Arc<Connection>) {
        self.journal
            .events
            .lock()
            .unwrap()
            .push(Recorded::Closed(conn.id()));
    }
}

/// Raw framed TCP client for protocol-level tests.
pub struct RawClient {
    pub reader: BufReader<TcpStream>,
    pub writer: BufWriter<TcpStream>,
}

impl RawClient {
    pub fn connect(addr: &str) -> std::io::Result<Self> {
        let stream = TcpStream::connect(addr)?;
        stream.set_read_timeout(Some(Duration::from_secs(5)))?;
        let read_stream = stream.try_clone()?;
        Ok(Self {
            reader: BufReader::new(read_stream),
            writer: BufWriter::new(stream),
        })
    }

    pub fn send(&mut self, line: &str) -> std::io::Result<()> {
        write_message(&mut self.writer, &line.to_string())
    }

    pub fn recv(&mut self) -> std::io::Result<String> {
        read_message(&mut self.reader)
    }
}
