//! Gestalt graph error types

use thiserror::Error;
use trellis_core::{NodeId, StoreError};
use trellis_crypto::CryptoError;

#[derive(Debug, Error)]
pub enum GestaltError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Link requested without a signed claim backing it
    #[error("Missing link evidence: {0}")]
    MissingEvidence(String),

    /// Claim does not describe the requested link
    #[error("Link evidence does not match: {0}")]
    EvidenceMismatch(String),

    #[error("Link evidence is not signed by {node_id}")]
    VerificationFailed { node_id: NodeId },

    #[error("Vertex not found: {0}")]
    VertexNotFound(String),

    #[error("Corrupt graph record: {0}")]
    Corrupt(String),
}

impl GestaltError {
    /// Evidence rejections, as opposed to store faults.
    pub fn is_untrusted(&self) -> bool {
        matches!(
            self,
            GestaltError::MissingEvidence(_)
                | GestaltError::EvidenceMismatch(_)
                | GestaltError::VerificationFailed { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, GestaltError>;
