//! TOML configuration: embedded defaults plus a user override file.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use parlor_net::dispatcher::DispatcherConfig;

use crate::lifecycle::LifecycleConfig;

const DEFAULT_CONFIG: &str = include_str!("../config.toml");

#[derive(Deserialize, Default)]
struct ConfigFile {
    #[serde(default)]
    server: ServerSection,
    #[serde(default)]
    session: SessionSection,
    #[serde(default)]
    store: StoreSection,
}

#[derive(Deserialize, Default)]
struct ServerSection {
    port: Option<u16>,
    max_connections: Option<usize>,
    bots: Option<usize>,
}

#[derive(Deserialize, Default)]
struct SessionSection {
    ttl_minutes: Option<u64>,
    warning_minutes: Option<u64>,
    shuffle_swaps: Option<usize>,
    seats: Option<usize>,
    rounds: Option<usize>,
    min_version: Option<i32>,
    sweep_seconds: Option<u64>,
}

#[derive(Deserialize, Default)]
struct StoreSection {
    path: Option<String>,
}

pub struct Config {
    server: ServerSection,
    session: SessionSection,
    store: StoreSection,
}

impl Config {
    pub fn load() -> Self {
        let mut base: ConfigFile =
            toml::from_str(DEFAULT_CONFIG).expect("Failed to parse embedded config.toml");

        if let Some(path) = user_config_path() {
            if path.exists() {
                match std::fs::read_to_string(&path) {
                    Ok(contents) => match toml::from_str::<ConfigFile>(&contents) {
                        Ok(user) => {
                            merge_server(&mut base.server, user.server);
                            merge_session(&mut base.session, user.session);
                            merge_store(&mut base.store, user.store);
                        }
                        Err(e) => {
                            log::warn!(target: "config", "ignoring malformed config {}: {}", path.display(), e)
                        }
                    },
                    Err(e) => {
                        log::warn!(target: "config", "could not read config {}: {}", path.display(), e)
                    }
                }
            }
        }

        Config {
            server: base.server,
            session: base.session,
            store: base.store,
        }
    }

    pub fn port(&self) -> u16 {
        self.server.port.unwrap_or(4755)
    }

    pub fn set_port(&mut self, port: u16) {
        self.server.port = Some(port);
    }

    pub fn max_connections(&self) -> usize {
        self.server.max_connections.unwrap_or(64)
    }

    pub fn set_max_connections(&mut self, max: usize) {
        self.server.max_connections = Some(max);
    }

    pub fn bot_count(&self) -> usize {
        self.server.bots.unwrap_or(2)
    }

    pub fn set_bot_count(&mut self, bots: usize) {
        self.server.bots = Some(bots);
    }

    pub fn seats(&self) -> usize {
        self.session.seats.unwrap_or(4)
    }

    pub fn rounds(&self) -> usize {
        self.session.rounds.unwrap_or(4)
    }

    pub fn session_min_version(&self) -> i32 {
        self.session.min_version.unwrap_or(1)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.session.sweep_seconds.unwrap_or(60).clamp(1, 3600))
    }

    /// Path to the SQLite store; `None` (or an empty string) keeps accounts
    /// in memory.
    pub fn store_path(&self) -> Option<PathBuf> {
        self.store
            .path
            .as_deref()
            .filter(|p| !p.is_empty())
            .map(PathBuf::from)
    }

    pub fn set_store_path(&mut self, path: &str) {
        self.store.path = Some(path.to_string());
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            max_connections: self.max_connections(),
            ..DispatcherConfig::default()
        }
    }

    pub fn lifecycle_config(&self) -> LifecycleConfig {
        let fallback = LifecycleConfig::default();
        LifecycleConfig {
            session_ttl: self
                .session
                .ttl_minutes
                .map(|m| Duration::from_secs(m * 60))
                .unwrap_or(fallback.session_ttl),
            warning_window: self
                .session
                .warning_minutes
                .map(|m| Duration::from_secs(m * 60))
                .unwrap_or(fallback.warning_window),
            shuffle_swaps: self.session.shuffle_swaps.unwrap_or(fallback.shuffle_swaps),
        }
    }
}

fn user_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("parlor").join("config.toml"))
}

fn merge_server(base: &mut ServerSection, user: ServerSection) {
    if user.port.is_some() {
        base.port = user.port;
    }
    if user.max_connections.is_some() {
        base.max_connections = user.max_connections;
    }
    if user.bots.is_some() {
        base.bots = user.bots;
    }
}

fn merge_session(base: &mut SessionSection, user: SessionSection) {
    if user.ttl_minutes.is_some() {
        base.ttl_minutes = user.ttl_minutes;
    }
    if user.warning_minutes.is_some() {
        base.warning_minutes = user.warning_minutes;
    }
    if user.shuffle_swaps.is_some() {
        base.shuffle_swaps = user.shuffle_swaps;
    }
    if user.seats.is_some() {
        base.seats = user.seats;
    }
    if user.rounds.is_some() {
        base.rounds = user.rounds;
    }
    if user.min_version.is_some() {
        base.min_version = user.min_version;
    }
    if user.sweep_seconds.is_some() {
        base.sweep_seconds = user.sweep_seconds;
    }
}

fn merge_store(base: &mut StoreSection, user: StoreSection) {
    if user.path.is_some() {
        base.path = user.path;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedded_defaults_parse() {
        let file: ConfigFile = toml::from_str(DEFAULT_CONFIG).unwrap();
        let config = Config {
            server: file.server,
            session: file.session,
            store: file.store,
        };
        assert_eq!(config.port(), 4755);
        assert_eq!(config.max_connections(), 64);
        assert_eq!(config.bot_count(), 2);
        assert_eq!(config.seats(), 4);
        assert_eq!(config.rounds(), 4);
        assert_eq!(config.store_path(), None);
        assert_eq!(config.sweep_interval(), Duration::from_secs(60));
    }

    #[test]
    fn user_fields_override() {
        let mut base: ConfigFile = toml::from_str(DEFAULT_CONFIG).unwrap();
        let user: ConfigFile = toml::from_str(
            "[server]\nport = 9999\n[store]\npath = \"/tmp/parlor.sqlite\"\n",
        )
        .unwrap();
        merge_server(&mut base.server, user.server);
        merge_session(&mut base.session, user.session);
        merge_store(&mut base.store, user.store);

        let config = Config {
            server: base.server,
            session: base.session,
            store: base.store,
        };
        assert_eq!(config.port(), 9999);
        // Untouched fields keep their defaults.
        assert_eq!(config.max_connections(), 64);
        assert_eq!(
            config.store_path(),
            Some(PathBuf::from("/tmp/parlor.sqlite"))
        );
    }

    #[test]
    fn lifecycle_config_from_minutes() {
        let file: ConfigFile = toml::from_str(DEFAULT_CONFIG).unwrap();
        let config = Config {
            server: file.server,
            session: file.session,
            store: file.store,
        };
        let lifecycle = config.lifecycle_config();
        assert_eq!(lifecycle.session_ttl, Duration::from_secs(30 * 60));
        assert_eq!(lifecycle.warning_window, Duration::from_secs(5 * 60));
        assert_eq!(lifecycle.shuffle_swaps, 8);
    }
}
