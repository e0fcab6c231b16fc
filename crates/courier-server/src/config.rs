//! Server configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the server can start with zero
//! configuration for local development.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use courier_engine::HubConfig;
use courier_shared::constants::DEFAULT_HTTP_PORT;
use courier_shared::UserId;

/// Where messages are persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageMode {
    /// SQLite in the platform data directory.
    DefaultSqlite,
    /// SQLite at an explicit path.
    Sqlite(PathBuf),
    /// Process-local, lost on restart.
    Memory,
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP (axum) API server.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:8080`
    pub http_addr: SocketAddr,

    /// Env: `DATABASE_PATH` (`memory` / `in-memory` for a volatile store)
    /// Default: `courier.db` in the platform data directory.
    pub storage: StorageMode,

    /// Identities allowed to connect, comma separated.
    /// Env: `ALLOWED_USERS`
    /// Default: empty (any well-formed identity is accepted).
    pub allowed_users: Vec<UserId>,

    /// Engine timings and limits.
    /// Env: `WRITE_TIMEOUT_SECS`, `READ_IDLE_TIMEOUT_SECS`,
    /// `PING_INTERVAL_SECS`, `TYPING_STALE_SECS`, `TYPING_SWEEP_SECS`,
    /// `RECOVERY_PAGE_SIZE`, `FRAME_RATE`, `FRAME_BURST`
    pub hub: HubConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], DEFAULT_HTTP_PORT).into(),
            storage: StorageMode::DefaultSqlite,
            allowed_users: Vec::new(),
            hub: HubConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) but reads values through `get`.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(addr) = get("HTTP_ADDR") {
            if let Ok(parsed) = addr.parse::<SocketAddr>() {
                config.http_addr = parsed;
            } else {
                tracing::warn!(value = %addr, "Invalid HTTP_ADDR, using default");
            }
        }

        if let Some(path) = get("DATABASE_PATH") {
            let path = path.trim();
            config.storage = match path {
                "" => StorageMode::DefaultSqlite,
                "memory" | "in-memory" | ":memory:" => StorageMode::Memory,
                other => StorageMode::Sqlite(PathBuf::from(other)),
            };
        }

        if let Some(users) = get("ALLOWED_USERS") {
            config.allowed_users = users
                .split(',')
                .map(str::trim)
                .filter(|u| !u.is_empty())
                .map(UserId::from)
                .collect();
        }

        let hub = &mut config.hub;
        set_secs(&get, "WRITE_TIMEOUT_SECS", &mut hub.write_timeout);
        set_secs(&get, "READ_IDLE_TIMEOUT_SECS", &mut hub.read_idle_timeout);
        set_secs(&get, "PING_INTERVAL_SECS", &mut hub.ping_interval);
        set_secs(&get, "TYPING_STALE_SECS", &mut hub.typing_stale);
        set_secs(&get, "TYPING_SWEEP_SECS", &mut hub.typing_sweep);
        set_positive(&get, "RECOVERY_PAGE_SIZE", &mut hub.recovery_page_size);
        set_positive(&get, "FRAME_RATE", &mut hub.frame_rate);
        set_positive(&get, "FRAME_BURST", &mut hub.frame_burst);

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter,
        // so we do not store it here.

        config
    }

    /// Engine configuration derived from the environment.
    pub fn hub_config(&self) -> HubConfig {
        self.hub.clone()
    }
}

fn set_secs(get: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut Duration) {
    let mut secs = slot.as_secs();
    set_positive(get, key, &mut secs);
    *slot = Duration::from_secs(secs);
}

/// Overwrite `slot` with a strictly positive parsed value; anything else
/// keeps the default.
fn set_positive<T>(get: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T)
where
    T: FromStr + PartialOrd + Default,
{
    let Some(raw) = get(key) else {
        return;
    };
    match raw.trim().parse::<T>() {
        Ok(v) if v > T::default() => *slot = v,
        _ => tracing::warn!(key = key, value = %raw, "Invalid value, using default"),
    }
}
