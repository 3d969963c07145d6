//! # parlor-server
//!
//! Session registry, lifecycle management, and the application layer of the
//! Parlor turn-based game server.
//!
//! ## Module Overview
//!
//! - [`flag`] — `LockFlag`, the cooperative wait/notify primitive behind all
//!   per-entity locking
//! - [`registry`] — `SessionRegistry` with a global structural lock and
//!   independent per-session locks handed out as RAII guards
//! - [`session`] — `Session` state: members, seat table, rules payload,
//!   expiration, reset votes
//! - [`lifecycle`] — join/leave orchestration, substitute backfill with a
//!   fairness shuffle, the reset-in-place voting protocol, expiration sweeps
//! - [`codec`] — the textual command vocabulary
//! - [`handler`] — glue between the dispatcher's treat loop and the lifecycle
//! - [`game`] — `RoundRobinGame`, the bundled reference rules engine
//! - [`bots`] — in-process automated participants over paired transports
//! - [`store`] — account store implementations (in-memory and SQLite)
//! - [`config`] — TOML configuration (embedded defaults + user override)

pub mod bots;
pub mod codec;
pub mod config;
pub mod flag;
pub mod game;
pub mod handler;
pub mod lifecycle;
pub mod registry;
pub mod session;
pub mod store;

pub use config::Config;
pub use flag::{AcquireError, LockFlag};
pub use handler::GameHandler;
pub use lifecycle::{Lifecycle, LifecycleConfig};
pub use registry::{GlobalGuard, LockError, SessionGuard, SessionRegistry};
