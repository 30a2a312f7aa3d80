//! Error types for genpool.

use thiserror::Error;

/// Main error type for genpool.
#[derive(Error, Debug)]
pub enum GenError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Worker error: {0}")]
    Worker(String),

    #[error("Failed to spawn worker: {0}")]
    Spawn(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Endpoint '{0}' is disconnected")]
    Disconnected(String),

    #[error("Renderer error: {0}")]
    Renderer(String),

    #[error("Invalid payload for service '{service}': {message}")]
    InvalidPayload { service: String, message: String },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("No workers could be started")]
    NoWorkers,
}

/// Result type alias for genpool operations.
pub type Result<T> = std::result::Result<T, GenError>;
