//! # courier-server
//!
//! Real-time messaging server.
//!
//! This binary provides:
//! - **WebSocket endpoint** (`/ws`) admitting one live connection per
//!   identity, with typing indicators, delivery/read receipts and replay of
//!   undelivered messages on reconnect
//! - **REST API** (axum) for groups, membership, history and search
//! - **SQLite persistence** (or an in-memory store for development)

mod api;
mod config;
mod error;
mod ws;

use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use courier_engine::{ChatHub, ChatService, IdentityDirectory, OpenDirectory, StaticDirectory};
use courier_store::{MemoryStore, SharedStore, SqliteStore};

use crate::api::AppState;
use crate::config::{ServerConfig, StorageMode};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                EnvFilter::new("info,courier_server=debug,courier_engine=debug")
            }),
        )
        .init();

    info!("Starting courier server v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");

    // -----------------------------------------------------------------------
    // 3. Initialize subsystems
    // -----------------------------------------------------------------------
    let store: SharedStore = match &config.storage {
        StorageMode::Memory => {
            info!("Using in-memory message store; data is lost on exit");
            Arc::new(MemoryStore::new())
        }
        StorageMode::Sqlite(path) => {
            info!(path = %path.display(), "Opening SQLite message store");
            Arc::new(SqliteStore::open(path)?)
        }
        StorageMode::DefaultSqlite => Arc::new(SqliteStore::open_default()?),
    };

    let directory: Arc<dyn IdentityDirectory> = if config.allowed_users.is_empty() {
        info!("No ALLOWED_USERS set; accepting any well-formed identity");
        Arc::new(OpenDirectory)
    } else {
        info!(count = config.allowed_users.len(), "Restricting connections to allow-list");
        Arc::new(StaticDirectory::new(config.allowed_users.clone()))
    };

    let hub = ChatHub::new(store, directory, config.hub_config());
    let app_state = AppState {
        service: ChatService::new(hub.clone()),
    };

    // -----------------------------------------------------------------------
    // 4. Run the HTTP API server (blocks until shutdown)
    // -----------------------------------------------------------------------
    let result = tokio::select! {
        result = api::serve(app_state, config.http_addr) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
            Ok(())
        }
    };

    // -----------------------------------------------------------------------
    // 5. Close live connections and wait for background tasks
    // -----------------------------------------------------------------------
    hub.shutdown().await;

    if let Err(e) = &result {
        tracing::error!(error = %e, "HTTP server failed");
    }
    result
}
