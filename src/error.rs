//! Error types.

use thiserror::Error;

/// Errors surfaced by the client handle and its collaborators.
///
/// Transport, protocol and domain failures are recovered or logged inside the
/// connection layer and never show up here.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The connection task has stopped.
    #[error("connection task has shut down")]
    Shutdown,

    /// Payload could not be serialized.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Session store failure.
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Session store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Backing file could not be read or written.
    #[error("store I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// Backing file is not a JSON object of strings.
    #[error("store contents are not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}
