//! BLAKE3 digests used for chain back-links.

use blake3::Hasher;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

use crate::error::{CryptoError, Result};

/// A BLAKE3 hash represented as a 32-byte array.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Digest([u8; 32]);

impl Digest {
    pub fn of(data: &[u8]) -> Self {
        let mut hasher = Hasher::new();
        hasher.update(data);
        Self(*hasher.finalize().as_bytes())
    }

    /// Digest of the canonical JSON serialization of `value`.
    pub fn of_json<T: Serialize>(value: &T) -> Result<Self> {
        let serialized = serde_json::to_vec(value)?;
        Ok(Self::of(&serialized))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn encode(&self) -> String {
        hex::encode(self.0)
    }

    pub fn decode(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).map_err(|e| CryptoError::MalformedToken(e.to_string()))?;
        let array: [u8; 32] = bytes
            .try_into()
            .map_err(|_| CryptoError::MalformedToken("digest must be 32 bytes".to_string()))?;
        Ok(Self(array))
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.encode())
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.encode())
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Digest::decode(&s).map_err(serde::de::Error::custom)
    }
}
