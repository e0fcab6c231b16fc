//! Identifiers, wire protocol and protocol constants shared by every
//! courier crate.

pub mod constants;
pub mod error;
pub mod protocol;
pub mod types;

pub use error::ProtocolError;
pub use protocol::{ClientFrame, Envelope, EventKind, ReadReceiptPayload};
pub use types::{GroupId, MessageId, UserId};
