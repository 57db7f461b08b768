//! Crypto error types

use thiserror::Error;

/// Errors raised by key handling, token encoding and hashing.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Signing failed: {0}")]
    SigningFailed(String),

    #[error("Malformed token: {0}")]
    MalformedToken(String),

    #[error("Malformed claim id: {0}")]
    MalformedClaimId(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CryptoError>;
