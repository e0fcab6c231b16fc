//! # courier-store
//!
//! Durable groups and messages for the courier messaging engine.
//!
//! The engine talks to storage only through the async [`MessageStore`] trait.
//! Two backends are provided: [`SqliteStore`], which wraps the synchronous
//! [`Database`] handle (typed CRUD helpers over a `rusqlite::Connection`),
//! and [`MemoryStore`] for tests and ephemeral deployments.

pub mod database;
pub mod groups;
pub mod memory;
pub mod messages;
pub mod migrations;
pub mod models;
pub mod sqlite;
pub mod store;

mod error;

pub use database::Database;
pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use models::*;
pub use sqlite::SqliteStore;
pub use store::{MessageStore, SharedStore};
