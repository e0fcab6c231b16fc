use thiserror::Error;

use courier_shared::ProtocolError;
use courier_store::StoreError;

use crate::transport::TransportError;

/// Errors surfaced by the engine to its callers.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Unknown identity, group, message or connection; also a broadcast with
    /// no active recipient.
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    /// The caller is not allowed to act on the group or message.
    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Transport failed: {0}")]
    TransportFailed(#[from] TransportError),

    #[error("Store failed: {0}")]
    StoreFailed(StoreError),
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound => EngineError::NotFound("record".into()),
            other => EngineError::StoreFailed(other),
        }
    }
}

impl From<ProtocolError> for EngineError {
    fn from(e: ProtocolError) -> Self {
        EngineError::ValidationFailed(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
