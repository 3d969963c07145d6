//! Network layer for the Parlor game server.
//!
//! This crate provides the transport abstraction (real sockets and
//! in-process paired channels behind one trait), the per-connection
//! reader/writer machinery, and the dispatcher that serializes every inbound
//! command into a single processing stream.

pub mod client;
pub mod connection;
pub mod dispatcher;
pub mod framing;
pub mod transport;

pub use client::{LinkEvent, ServerLink};
pub use connection::{ConnId, Connection, ReadEvent};
pub use dispatcher::{Dispatcher, DispatcherConfig, DispatcherHandle, NameError, ServerHandler};
pub use transport::{PairTransport, RecvOutcome, TcpTransport, Transport};
