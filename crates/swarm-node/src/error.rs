//! Error types for swarm-node.

use thiserror::Error;

/// Result type for swarm-node operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced to the host process.
///
/// Nothing on the merge or receive path returns these: malformed input is
/// dropped there, and rejected merges are normal outcomes.
#[derive(Debug, Error)]
pub enum Error {
    /// Socket setup or I/O failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// An outbound envelope could not be serialized.
    #[error("Encode error: {0}")]
    Encode(#[from] serde_json::Error),

    /// A configuration value could not be parsed.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// The service task has stopped and no longer accepts calls.
    #[error("swarm service is no longer running")]
    ServiceClosed,
}
