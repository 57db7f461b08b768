//! Core error types

use thiserror::Error;

/// Errors raised by the persisted store and identifier parsing.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying SQLite failure
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Stored value could not be (de)serialized
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The store connection was poisoned by a panicking transaction
    #[error("Store lock poisoned")]
    Poisoned,

    /// A stored key or identifier did not parse
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// Configuration could not be loaded
    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;
