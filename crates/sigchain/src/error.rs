//! Sigchain error types

use thiserror::Error;
use trellis_core::{NodeId, StoreError};
use trellis_crypto::CryptoError;

#[derive(Debug, Error)]
pub enum SigchainError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Invalid claim: {0}")]
    InvalidClaim(String),

    #[error("Signature verification failed for {node_id}")]
    VerificationFailed { node_id: NodeId },

    #[error("No prepared claim to commit")]
    NoDraft,

    #[error("Committed claim does not match the prepared draft")]
    DraftMismatch,

    #[error("Chain tail moved: expected seq {expected}, got {actual}")]
    ChainConflict { expected: u64, actual: u64 },

    #[error("Sigchain corrupted at seq {seq}: {reason}")]
    CorruptChain { seq: u64, reason: String },
}

impl SigchainError {
    /// Security rejections, as opposed to IO or usage faults.
    pub fn is_untrusted(&self) -> bool {
        matches!(
            self,
            SigchainError::InvalidClaim(_)
                | SigchainError::VerificationFailed { .. }
                | SigchainError::DraftMismatch
                | SigchainError::CorruptChain { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, SigchainError>;
