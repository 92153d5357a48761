//! Error types for efu-core.

use thiserror::Error;

/// Result type alias for event formation operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for event formation.
///
/// Steady-state conditions (out-of-window timestamps, cluster pool
/// exhaustion, idle input) are counted, never reported through this type.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error.
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// Unknown event type name or code.
    #[error("invalid event type: {0}")]
    InvalidEventType(String),

    /// Unrecoverable readout buffer error.
    #[error("parse error: {0}")]
    ParseError(String),

    /// Worker pool could not be created.
    #[error("thread pool error: {0}")]
    ThreadPool(String),

    /// File I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed JSON configuration.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
