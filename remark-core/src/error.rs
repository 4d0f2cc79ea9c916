//! Error types for remark-core

use thiserror::Error;

/// Main error type for the remark-core library
#[derive(Error, Debug)]
pub enum Error {
    /// Outbox store error
    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Collector/delivery error
    #[error("delivery error: {0}")]
    Delivery(String),

    /// Cross-process relay error
    #[error("relay error: {0}")]
    Relay(String),
}

/// Result type alias for remark-core
pub type Result<T> = std::result::Result<T, Error>;
