//! # courier-engine
//!
//! Real-time side of courier: one live connection per identity, a runtime
//! index of which identities are subscribed to which groups, group fan-out
//! with bounded writes, typing indicators, delivery/read bookkeeping and
//! replay of undelivered messages on reconnect.
//!
//! [`ChatHub`] owns the runtime state and every background task;
//! [`ChatService`] layers request-level operations on top of it for the
//! HTTP surface.

pub mod broadcast;
pub mod budget;
pub mod config;
pub mod connection;
pub mod delivery;
pub mod directory;
pub mod hub;
pub mod membership;
pub mod recovery;
pub mod registry;
pub mod service;
pub mod transport;
pub mod typing;

mod error;

pub use broadcast::BroadcastReport;
pub use config::HubConfig;
pub use directory::{IdentityDirectory, OpenDirectory, StaticDirectory};
pub use error::{EngineError, Result};
pub use hub::ChatHub;
pub use recovery::RecoveryReport;
pub use service::{ChatService, GroupUpdate, MessageEdit, NewGroup, NewMessage, SendOutcome};
pub use transport::{pipe, Frame, FrameSink, FrameStream, PipeClient, TransportError};
