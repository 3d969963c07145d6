//! Parlor server binary.
//!
//! Usage:
//!   parlor-server [OPTIONS]
//!     --port <PORT>              Listen port (default: from config)
//!     --max-connections <N>      Connection cap
//!     --bots <N>                 In-process practice bots to start
//!     --store <PATH>             SQLite account store ("" = in-memory)

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Instant;

use log::info;

use parlor_net::dispatcher::Dispatcher;
use parlor_server::bots::spawn_bot;
use parlor_server::game::RoundRobinGame;
use parlor_server::handler::GameHandler;
use parlor_server::lifecycle::Lifecycle;
use parlor_server::registry::SessionRegistry;
use parlor_server::store::{MemoryStore, SqliteStore};
use parlor_server::Config;
use parlor_types::rules::GameRules;
use parlor_types::store::AccountStore;

fn main() {
    env_logger::init();
    let config = parse_args(Config::load());

    let store: Arc<dyn AccountStore> = match config.store_path() {
        Some(path) => match SqliteStore::open(&path) {
            Ok(store) => Arc::new(store),
            Err(e) => {
                eprintln!("Failed to open account store: {}", e);
                std::process::exit(1);
            }
        },
        None => Arc::new(MemoryStore::new()),
    };

    let registry = Arc::new(SessionRegistry::new());
    let mut dispatcher = Dispatcher::new(config.dispatcher_config());
    let handle = dispatcher.handle();

    let seats = config.seats();
    let rounds = config.rounds();
    let min_version = config.session_min_version();
    let lifecycle = Arc::new(Mutex::new(Lifecycle::new(
        registry.clone(),
        handle.clone(),
        store.clone(),
        Box::new(move |_name| {
            Box::new(RoundRobinGame::new(seats, rounds, min_version)) as Box<dyn GameRules>
        }),
        config.lifecycle_config(),
    )));

    dispatcher.run(Box::new(GameHandler::new(
        handle.clone(),
        lifecycle.clone(),
        store,
    )));

    let addr = match dispatcher.listen(&format!("0.0.0.0:{}", config.port())) {
        Ok(addr) => addr,
        Err(e) => {
            eprintln!("Failed to listen on port {}: {}", config.port(), e);
            std::process::exit(1);
        }
    };
    println!("Parlor server listening on {}", addr);

    // Session reaper: periodic expiration sweep.
    let sweep = config.sweep_interval();
    let reaper_lifecycle = lifecycle.clone();
    thread::Builder::new()
        .name("reaper".into())
        .spawn(move || loop {
            thread::sleep(sweep);
            reaper_lifecycle
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .check_expired(Instant::now());
        })
        .expect("spawn reaper thread");

    // Practice bots share the process over paired transports.
    let mut bots = Vec::new();
    for i in 0..config.bot_count() {
        bots.push(spawn_bot(&handle, &format!("bot-{}", i + 1)));
    }
    info!(target: "server", "{} practice bots ready", bots.len());

    // The process exits on SIGINT/SIGTERM; worker threads are torn down
    // with it.
    loop {
        thread::sleep(std::time::Duration::from_secs(60));
    }
}

/// Apply command-line overrides on top of the loaded config. Simple
/// `std::env::args()` matching.
fn parse_args(mut config: Config) -> Config {
    let args: Vec<String> = std::env::args().collect();
    let mut i = 1;

    while i < args.len() {
        match args[i].as_str() {
            "--port" => {
                i += 1;
                match args.get(i).and_then(|s| s.parse().ok()) {
                    Some(port) => config.set_port(port),
                    None => die("--port requires a valid port number"),
                }
            }
            "--max-connections" => {
                i += 1;
                match args.get(i).and_then(|s| s.parse().ok()) {
                    Some(max) => config.set_max_connections(max),
                    None => die("--max-connections requires a number"),
                }
            }
            "--bots" => {
                i += 1;
                match args.get(i).and_then(|s| s.parse().ok()) {
                    Some(bots) => config.set_bot_count(bots),
                    None => die("--bots requires a number"),
                }
            }
            "--store" => {
                i += 1;
                match args.get(i) {
                    Some(path) => config.set_store_path(path),
                    None => die("--store requires a path"),
                }
            }
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            other => {
                eprintln!("Unknown argument: {}", other);
                print_usage();
                std::process::exit(1);
            }
        }
        i += 1;
    }

    config
}

fn die(message: &str) -> ! {
    eprintln!("{}", message);
    std::process::exit(1);
}

fn print_usage() {
    println!("Usage: parlor-server [OPTIONS]");
    println!();
    println!("Options:");
    println!("  --port <PORT>              Listen port");
    println!("  --max-connections <N>      Connection cap");
    println!("  --bots <N>                 In-process practice bots");
    println!("  --store <PATH>             SQLite account store path");
    println!("  --help, -h                 Show this help");
}
