//! Error types for the task broker
//!
//! All errors implement the `std::error::Error` trait via `thiserror::Error`.
//!
//! Soft business outcomes (an unknown task id, a push refused by a capacity
//! limit) are not errors: the engine reports them as `bool`/`Option` values
//! and the HTTP layer translates them into `{"error": ...}` envelopes with
//! status 200. The variants below cover the cases where an operation cannot
//! proceed at all.

use thiserror::Error;

/// Task broker error type
#[derive(Error, Debug)]
pub enum HopperError {
    /// The multiplexer refused the operation because a shutdown save is in
    /// progress or has completed.
    #[error("broker is shutting down, not accepting new operations")]
    ShutdownInProgress,

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Snapshot file I/O failure
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Snapshot JSON encoding/decoding failure
    #[error("snapshot encoding error: {0}")]
    Json(#[from] serde_json::Error),

    /// Snapshot container failure
    #[error("snapshot archive error: {0}")]
    Archive(#[from] zip::result::ZipError),
}

/// Result type alias using HopperError
pub type Result<T> = std::result::Result<T, HopperError>;
