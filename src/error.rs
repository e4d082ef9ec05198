// src/error.rs

use std::io;
use thiserror::Error;

/// Custom error types for the application
#[derive(Error, Debug)]
pub enum AppError {
    /// Error for missing external programs (download agent, player)
    #[error("Missing dependency: {0}")]
    MissingDependency(String),

    /// Error during download process
    #[error("Download error: {0}")]
    DownloadError(String),

    /// Error raised by the player process or its control connection
    #[error("Player error: {0}")]
    PlayerError(String),

    /// Error on the player IPC protocol boundary
    #[error("IPC error: {0}")]
    IpcError(String),

    /// Error propagated verbatim from the persistent store
    #[error("Store error: {0}")]
    StoreError(String),

    /// Error for invalid input validation
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Error for a playlist entry that no longer exists
    #[error("No such entry: {0}")]
    EntryNotFound(String),

    /// Error for enqueue attempts after shutdown began
    #[error("Download queue is closed")]
    QueueClosed,

    /// I/O related errors
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),

    /// JSON parsing errors
    #[error("JSON parsing error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// General application errors
    #[error("Application error: {0}")]
    General(String),
}

/// Convert a string error to AppError::General
impl From<String> for AppError {
    fn from(error: String) -> Self {
        AppError::General(error)
    }
}

/// Convert a &str error to AppError::General
impl From<&str> for AppError {
    fn from(error: &str) -> Self {
        AppError::General(error.to_string())
    }
}
