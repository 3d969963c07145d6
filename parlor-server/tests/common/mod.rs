#![allow(dead_code)]
//! Test harness: a fully wired embedded server plus in-process clients.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::SeedableRng;

use parlor_net::connection::{Connection, ReadEvent};
use parlor_net::dispatcher::{Dispatcher, DispatcherConfig, DispatcherHandle};
use parlor_server::game::RoundRobinGame;
use parlor_server::handler::GameHandler;
use parlor_server::lifecycle::{Lifecycle, LifecycleConfig};
use parlor_server::registry::SessionRegistry;
use parlor_server::store::MemoryStore;
use parlor_types::rules::GameRules;
use parlor_types::store::AccountStore;

pub const WAIT: Duration = Duration::from_secs(5);
pub const QUIET: Duration = Duration::from_millis(200);

pub struct TestServer {
    pub dispatcher: Dispatcher,
    pub handle: DispatcherHandle,
    pub lifecycle: Arc<Mutex<Lifecycle>>,
    pub registry: Arc<SessionRegistry>,
    pub store: Arc<MemoryStore>,
}

impl TestServer {
    /// Embedded server with the given game shape; no TCP listener.
    pub fn start(seats: usize, rounds: usize, min_version: i32) -> Self {
        Self::start_with(seats, rounds, min_version, LifecycleConfig::default())
    }

    pub fn start_with(
        seats: usize,
        rounds: usize,
        min_version: i32,
        lifecycle_config: LifecycleConfig,
    ) -> Self {
        let store = Arc::new(MemoryStore::new());
        let dyn_store: Arc<dyn AccountStore> = store.clone();
        let registry = Arc::new(SessionRegistry::new());
        let mut dispatcher = Dispatcher::new(DispatcherConfig::default());
        let handle = dispatcher.handle();

        let lifecycle = Arc::new(Mutex::new(Lifecycle::with_rng(
            registry.clone(),
            handle.clone(),
            dyn_store.clone(),
            Box::new(move |_| {
                Box::new(RoundRobinGame::new(seats, rounds, min_version)) as Box<dyn GameRules>
            }),
            lifecycle_config,
            StdRng::seed_from_u64(42),
        )));

        dispatcher.run(Box::new(GameHandler::new(
            handle.clone(),
            lifecycle.clone(),
            dyn_store,
        )));

        Self {
            dispatcher,
            handle,
            lifecycle,
            registry,
            store,
        }
    }

    pub fn lifecycle(&self) -> std::sync::MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Wait until `pred` holds against the lifecycle.
    pub fn wait_for<F: Fn(&Lifecycle) -> bool>(&self, pred: F) {
        let start = Instant::now();
        while start.elapsed() < WAIT {
            if pred(&self.lifecycle()) {
                return;
            }
            thread::sleep(Duration::from_millis(5));
        }
        panic!("timed out waiting on lifecycle state");
    }
}

/// An in-process client: a near-side connection plus a pump thread feeding
/// received lines into a channel.
pub struct LocalClient {
    pub conn: Arc<Connection>,
    rx: Receiver<String>,
}

impl LocalClient {
    pub fn attach(handle: &DispatcherHandle, label: &str) -> Self {
        Self::attach_kind(handle, label, false)
    }

    pub fn attach_kind(handle: &DispatcherHandle, label: &str, automated: bool) -> Self {
        let conn = handle.attach_local(label, automated);
        let (tx, rx) = mpsc::channel();
        let pump = conn.clone();
        thread::spawn(move || loop {
            match pump.read_blocking() {
                ReadEvent::Line(line) => {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
                ReadEvent::Eof => break,
            }
        });
        Self { conn, rx }
    }

    pub fn send(&self, line: &str) {
        self.conn.put(line);
    }

    pub fn recv(&self, timeout: Duration) -> Option<String> {
        match self.rx.recv_timeout(timeout) {
            Ok(line) => Some(line),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Read lines until one starts with `prefix`, returning it. Panics on
    /// timeout with everything that did arrive.
    pub fn expect(&self, prefix: &str) -> String {
        let deadline = Instant::now() + WAIT;
        let mut seen = Vec::new();
        while Instant::now() < deadline {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.recv(remaining) {
                Some(line) if line.starts_with(prefix) => return line,
                Some(line) => seen.push(line),
                None => break,
            }
        }
        panic!("never saw '{}...'; got {:?}", prefix, seen);
    }

    /// Assert that nothing starting with `prefix` arrives within a quiet
    /// window.
    pub fn expect_absent(&self, prefix: &str) {
        let deadline = Instant::now() + QUIET;
        while Instant::now() < deadline {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if let Some(line) = self.recv(remaining) {
                assert!(
                    !line.starts_with(prefix),
                    "unexpected '{}' (matched '{}')",
                    line,
                    prefix
                );
            }
        }
    }

    /// Version handshake + login, consuming the acks.
    pub fn login(&self, name: &str) {
        self.login_versioned(name, 2)
    }

    pub fn login_versioned(&self, name: &str, version: i32) {
        self.send(&format!("version {}", version));
        self.expect("ok version");
        self.send(&format!("login {} pw-{}", name, name));
        self.expect("ok login");
    }
}
