//! Blocking client for connecting to a Parlor server over TCP.
//!
//! Used by practice clients and the integration tests. One background
//! reader thread feeds received lines into a channel the caller polls.

use std::io::{self, BufReader, BufWriter};
use std::net::TcpStream;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, TryRecvError};
use std::thread;
use std::time::Duration;

use log::{info, warn};

use crate::framing::{read_message, write_message};

/// Something the reader thread saw.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Line(String),
    /// Server closed the connection (or the transport failed).
    Closed,
}

/// A connected client endpoint.
pub struct ServerLink {
    writer: BufWriter<TcpStream>,
    events_rx: Receiver<LinkEvent>,
    closed: bool,
}

impl ServerLink {
    /// Connect and start the background reader.
    pub fn connect(addr: &str) -> io::Result<Self> {
        info!(target: "net", "connecting to server at {}", addr);
        let stream = TcpStream::connect(addr)?;
        let read_stream = stream.try_clone()?;
        let writer = BufWriter::new(stream);

        let (events_tx, events_rx) = mpsc::channel();
        thread::spawn(move || {
            let mut reader = BufReader::new(read_stream);
            loop {
                match read_message::<_, String>(&mut reader) {
                    Ok(line) => {
                        if events_tx.send(LinkEvent::Line(line)).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        if e.kind() != io::ErrorKind::UnexpectedEof {
                            warn!(target: "net", "server read error: {}", e);
                        }
                        let _ = events_tx.send(LinkEvent::Closed);
                        break;
                    }
                }
            }
        });

        Ok(Self {
            writer,
            events_rx,
            closed: false,
        })
    }

    /// Send one command line.
    pub fn send(&mut self, line: &str) -> io::Result<()> {
        write_message(&mut self.writer, &line)
    }

    /// Drain everything received so far without blocking.
    pub fn poll(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        loop {
            match self.events_rx.try_recv() {
                Ok(LinkEvent::Line(line)) => lines.push(line),
                Ok(LinkEvent::Closed) => {
                    self.closed = true;
                    break;
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.closed = true;
                    break;
                }
            }
        }
        lines
    }

    /// Wait up to `timeout` for the next line.
    pub fn recv_timeout(&mut self, timeout: Duration) -> Option<String> {
        match self.events_rx.recv_timeout(timeout) {
            Ok(LinkEvent::Line(line)) => Some(line),
            Ok(LinkEvent::Closed) => {
                self.closed = true;
                None
            }
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => {
                self.closed = true;
                None
            }
        }
    }

    /// True once the server side has gone away.
    pub fn is_closed(&self) -> bool {
        self.closed
    }
}
