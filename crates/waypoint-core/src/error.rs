use std::io;
use thiserror::Error;

use crate::types::Position;

#[derive(Error, Debug)]
pub enum WaypointError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Ledger error: {0}")]
    Ledger(String),

    #[error("Commit of position {position} for '{name}' failed: {reason}")]
    Commit {
        name: String,
        position: Position,
        reason: String,
    },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Handler failed at position {position}: {source}")]
    Handler {
        position: Position,
        #[source]
        source: HandlerError,
    },

    #[error("Lease for '{name}' is held by {holder}")]
    LeaseHeld { name: String, holder: String },

    #[error("Lease error: {0}")]
    Lease(String),

    #[error("Dead letter error: {0}")]
    DeadLetter(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl WaypointError {
    /// Transient failures are retried by the stream source wrapper; everything
    /// else is surfaced to the consumer.
    pub fn is_transient(&self) -> bool {
        matches!(self, WaypointError::Transport(_))
    }
}

impl From<serde_json::Error> for WaypointError {
    fn from(e: serde_json::Error) -> Self {
        WaypointError::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, WaypointError>;

/// Failure reported by a [`MessageHandler`](crate::traits::MessageHandler).
///
/// Handlers return this instead of panicking; the consumer branches on it to
/// decide whether the position may be committed.
#[derive(Error, Debug)]
pub enum HandlerError {
    #[error("payload decode failed: {0}")]
    Decode(String),

    #[error("message rejected: {0}")]
    Rejected(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl HandlerError {
    pub fn rejected(reason: impl Into<String>) -> Self {
        HandlerError::Rejected(reason.into())
    }
}

impl From<WaypointError> for HandlerError {
    fn from(err: WaypointError) -> Self {
        match err {
            WaypointError::Serialization(msg) => HandlerError::Decode(msg),
            other => HandlerError::Other(other.into()),
        }
    }
}
