//! Network error types.

use std::time::Duration;

/// Errors that can occur in the farm_network crate.
///
/// Only [`NetworkError::Storage`] raised while opening the message store is
/// fatal; everything else is recovered from by the node runtime.
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    /// Wire bytes could not be decoded into an envelope.
    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// The envelope carried a kind this node does not understand.
    #[error("Unknown message kind: {0}")]
    UnknownKind(String),

    /// A send to a neighbor failed at the transport level.
    #[error("Peer unreachable: {0}")]
    PeerUnreachable(String),

    /// An operation timed out.
    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    /// A single persisted record could not be parsed.
    #[error("Store corruption in record {message_id}: {reason}")]
    StoreCorruption { message_id: String, reason: String },

    /// A queued message ran out of retry attempts.
    #[error("Delivery exhausted for {message_id} after {attempts} attempts")]
    DeliveryExhausted { message_id: String, attempts: u32 },

    /// The durable store could not be opened or written.
    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// JSON serialization / deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid configuration value.
    #[error("Invalid config: {0}")]
    Config(String),

    /// A transport-level error not tied to a single send.
    #[error("Transport error: {0}")]
    Transport(String),

    /// No stored message has the given id.
    #[error("Unknown message: {0}")]
    UnknownMessage(String),

    /// The caller asked for something the node cannot do with that input.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The node is not running.
    #[error("Node not running")]
    NotRunning,

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
