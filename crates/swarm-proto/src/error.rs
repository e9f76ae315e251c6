//! Error types for swarm-proto.

use thiserror::Error;

/// Reasons an inbound datagram could not be decoded into an envelope.
///
/// Decode errors are never fatal: the receiver drops the message and carries on.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Bytes were not valid JSON, or a payload did not match its type's shape.
    #[error("malformed envelope: {0}")]
    Json(#[from] serde_json::Error),

    /// The top-level JSON value was not an object.
    #[error("envelope is not a JSON object")]
    NotAnObject,

    /// The `t` field was missing or not an unsigned integer.
    #[error("envelope has no numeric type code")]
    MissingType,
}
