//! Ed25519 key management.
//!
//! The rest of the workspace only ever sees a [`KeyManager`]: something that
//! knows its node id and can sign bytes. Private key material stays inside
//! the implementation.

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::RngCore;
use std::path::Path;
use tracing::info;
use trellis_core::NodeId;
use zeroize::Zeroize;

use crate::error::{CryptoError, Result};

/// Ed25519 signature length in bytes.
pub const SIGNATURE_LEN: usize = 64;

/// Signing capability of a local node.
pub trait KeyManager: Send + Sync {
    /// Node id (public key) matching the signing key
    fn node_id(&self) -> NodeId;

    /// Sign `message`, returning raw signature bytes
    fn sign(&self, message: &[u8]) -> Result<Vec<u8>>;
}

/// In-process ed25519 key pair.
#[derive(Clone)]
pub struct KeyPair {
    signing_key: SigningKey,
}

impl KeyPair {
    /// Generates a fresh key pair from the OS random source.
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut seed);
        let signing_key = SigningKey::from_bytes(&seed);
        seed.zeroize();
        Self { signing_key }
    }

    /// Builds a key pair from a 32 byte seed.
    ///
    /// # Security
    /// The intermediate copy of the seed is zeroized.
    pub fn from_seed(seed: &[u8]) -> Result<Self> {
        if seed.len() != 32 {
            return Err(CryptoError::InvalidKey(format!(
                "Invalid seed length: {} (expected 32)",
                seed.len()
            )));
        }
        let mut seed_array = [0u8; 32];
        seed_array.copy_from_slice(seed);
        let signing_key = SigningKey::from_bytes(&seed_array);
        seed_array.zeroize();
        Ok(Self { signing_key })
    }

    /// Loads the hex encoded seed at `path`, or generates and persists one.
    pub fn load_or_generate(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            let mut encoded = std::fs::read_to_string(path)?;
            let decoded = hex::decode(encoded.trim());
            encoded.zeroize();
            let mut seed = decoded.map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
            let key_pair = Self::from_seed(&seed);
            seed.zeroize();
            return key_pair;
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let key_pair = Self::generate();
        let mut encoded = hex::encode(key_pair.signing_key.to_bytes());
        let written = std::fs::write(path, &encoded);
        encoded.zeroize();
        written?;

        info!(node_id = %key_pair.node_id(), path = %path.display(), "Generated node key");
        Ok(key_pair)
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }
}

impl KeyManager for KeyPair {
    fn node_id(&self) -> NodeId {
        NodeId::from_public_key(self.verifying_key().to_bytes())
    }

    fn sign(&self, message: &[u8]) -> Result<Vec<u8>> {
        let signature: Signature = self.signing_key.sign(message);
        Ok(signature.to_bytes().to_vec())
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("node_id", &self.node_id())
            .finish_non_exhaustive()
    }
}

/// Verifies `signature` over `message` against the key embedded in `node_id`.
///
/// Malformed keys and signatures verify as `false`.
pub fn verify(node_id: &NodeId, message: &[u8], signature: &[u8]) -> bool {
    let Ok(verifying_key) = VerifyingKey::from_bytes(node_id.as_bytes()) else {
        return false;
    };
    let Ok(signature) = Signature::from_slice(signature) else {
        return false;
    };
    verifying_key.verify_strict(message, &signature).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    // RFC 8032 test 1 secret key. Publicly known, test only.
    const RFC8032_SEED: &str = "9d61b19deffd5a60ba844af492ec2cc44449c5697b326919703bac031cae7f60";
    const RFC8032_PUBLIC: &str =
        "d75a980182b10ab7d54bfed3c964073a0ee172f3daa62325af021a68f707511a";

    #[test]
    fn test_node_id_is_public_key() {
        let seed = hex::decode(RFC8032_SEED).unwrap();
        let key_pair = KeyPair::from_seed(&seed).unwrap();
        assert_eq!(key_pair.node_id().encode(), RFC8032_PUBLIC);
    }

    #[test]
    fn test_sign_and_verify() {
        let key_pair = KeyPair::generate();
        let signature = key_pair.sign(b"claim").unwrap();
        assert_eq!(signature.len(), SIGNATURE_LEN);
        assert!(verify(&key_pair.node_id(), b"claim", &signature));
        assert!(!verify(&key_pair.node_id(), b"other", &signature));
        assert!(!verify(&KeyPair::generate().node_id(), b"claim", &signature));
        assert!(!verify(&key_pair.node_id(), b"claim", &signature[..10]));
    }

    #[test]
    fn test_rejects_short_seed() {
        assert!(matches!(
            KeyPair::from_seed(&[1u8; 16]),
            Err(CryptoError::InvalidKey(_))
        ));
    }

    #[test]
    fn test_load_or_generate_is_stable() {
        let path = std::env::temp_dir().join(format!("test_key_{}.key", uuid::Uuid::new_v4()));
        let first = KeyPair::load_or_generate(&path).unwrap();
        let second = KeyPair::load_or_generate(&path).unwrap();
        assert_eq!(first.node_id(), second.node_id());
        std::fs::remove_file(path).ok();
    }
}
