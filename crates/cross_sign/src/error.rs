//! Cross-sign handshake errors

use thiserror::Error;
use trellis_core::NodeId;
use trellis_crypto::CryptoError;
use trellis_sigchain::SigchainError;

#[derive(Debug, Error)]
pub enum HandshakeError {
    /// Message absent, empty or not a decodable token
    #[error("Malformed handshake message: {0}")]
    MalformedMessage(String),

    /// Well-formed token carrying the wrong claim
    #[error("Unexpected claim: {0}")]
    UnexpectedClaim(String),

    #[error("Claim is not signed by {node_id}")]
    VerificationFailed { node_id: NodeId },

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Channel closed before the handshake completed")]
    ChannelClosed,

    #[error("Timed out waiting for {step}")]
    Timeout { step: &'static str },

    #[error("Peer aborted the handshake: {0}")]
    Remote(String),

    #[error("Sigchain error: {0}")]
    Sigchain(#[from] SigchainError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl HandshakeError {
    /// True when the peer sent something that must not be trusted.
    ///
    /// Everything else is a transport or local fault that may be retried.
    pub fn is_untrusted(&self) -> bool {
        match self {
            HandshakeError::MalformedMessage(_)
            | HandshakeError::UnexpectedClaim(_)
            | HandshakeError::VerificationFailed { .. }
            | HandshakeError::ProtocolViolation(_) => true,
            HandshakeError::Sigchain(e) => e.is_untrusted(),
            _ => false,
        }
    }

    /// Whether the peer should be told about this failure.
    pub(crate) fn notify_peer(&self) -> bool {
        !matches!(
            self,
            HandshakeError::Remote(_) | HandshakeError::ChannelClosed | HandshakeError::Io(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, HandshakeError>;
