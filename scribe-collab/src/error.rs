//! Error types for the collaboration crate.

use thiserror::Error;

use crate::listeners::ListenerId;

/// Result type alias for collaboration operations.
pub type CollabResult<T> = Result<T, CollabError>;

/// Errors produced by the sync core.
///
/// None of these ever reach the embedding editor as a panic: session
/// construction and teardown log them and degrade to local-only editing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CollabError {
    /// Frame or payload could not be encoded.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Frame or payload could not be decoded.
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// Payload accessor called on a frame of another type.
    #[error("Invalid message type")]
    InvalidMessageType,

    #[error("Connection closed")]
    ConnectionClosed,

    /// The endpoint could not be resolved or parsed.
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// The CRDT rejected an update or state vector.
    #[error("Replica error: {0}")]
    Replica(String),

    #[error("Replica has been released")]
    ReplicaReleased,

    /// `off` was called with an id that is not (or no longer) registered.
    #[error("Unknown listener: {0}")]
    UnknownListener(ListenerId),

    #[error("Transport destroyed")]
    TransportDestroyed,

    /// The offline queue reached its capacity.
    #[error("Offline queue full ({0} updates)")]
    QueueFull(usize),

    /// Sessions spawn tasks and need a Tokio runtime.
    #[error("No async runtime available: {0}")]
    NoRuntime(String),
}

impl From<yrs::encoding::read::Error> for CollabError {
    fn from(e: yrs::encoding::read::Error) -> Self {
        CollabError::Replica(e.to_string())
    }
}

impl From<serde_json::Error> for CollabError {
    fn from(e: serde_json::Error) -> Self {
        CollabError::Deserialization(e.to_string())
    }
}
