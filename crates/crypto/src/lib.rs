//! Cryptographic primitives for the Trellis trust graph.
//!
//! # Core Capabilities
//!
//! - **Key management**: ed25519 key pairs behind the [`KeyManager`] trait
//! - **Tokens**: claim payloads carrying any number of signatures
//! - **Claim ids**: time-ordered, per-issuer unique identifiers
//! - **Digests**: BLAKE3 hashes for sigchain back-links
//!
//! # Security Principles
//!
//! - Never roll custom cryptographic primitives
//! - Node ids are public keys; verification needs nothing else
//! - Verification reports `false`, callers decide how to reject
//! - Seeds are zeroized after use

pub mod claim_id;
pub mod error;
pub mod hash;
pub mod keys;
pub mod token;

pub use claim_id::{ClaimId, ClaimIdGenerator};
pub use error::{CryptoError, Result};
pub use hash::Digest;
pub use keys::{verify, KeyManager, KeyPair, SIGNATURE_LEN};
pub use token::{SignedToken, SignedTokenSignature, Token, TokenHeader, TokenSignature};
