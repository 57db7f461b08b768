//! Time-ordered claim identifiers.
//!
//! Layout (16 bytes, big-endian):
//! - 6 bytes: unix timestamp in milliseconds
//! - 4 bytes: counter, reset when the timestamp advances
//! - 6 bytes: issuer tag, BLAKE3 of the issuing node id
//!
//! Ids from one generator are strictly increasing even when the wall clock
//! stalls or moves backwards, so claims from one issuer sort causally.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};
use trellis_core::NodeId;

use crate::error::CryptoError;

const TIMESTAMP_MASK: u64 = (1 << 48) - 1;

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClaimId([u8; 16]);

impl ClaimId {
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn timestamp_ms(&self) -> u64 {
        let mut raw = [0u8; 8];
        raw[2..].copy_from_slice(&self.0[..6]);
        u64::from_be_bytes(raw)
    }

    pub fn counter(&self) -> u32 {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&self.0[6..10]);
        u32::from_be_bytes(raw)
    }

    pub fn issuer_tag(&self) -> &[u8] {
        &self.0[10..]
    }

    /// Canonical string form (lowercase hex, preserves byte order).
    pub fn encode(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for ClaimId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl fmt::Debug for ClaimId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClaimId({})", self.encode())
    }
}

impl FromStr for ClaimId {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|e| CryptoError::MalformedClaimId(e.to_string()))?;
        let array: [u8; 16] = bytes.try_into().map_err(|_| {
            CryptoError::MalformedClaimId(format!("claim id must be 16 bytes: {}", s))
        })?;
        Ok(Self(array))
    }
}

impl Serialize for ClaimId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.encode())
    }
}

impl<'de> Deserialize<'de> for ClaimId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Monotonic claim id generator keyed by the issuing node.
#[derive(Debug, Clone)]
pub struct ClaimIdGenerator {
    tag: [u8; 6],
    last_ms: u64,
    counter: u32,
}

impl ClaimIdGenerator {
    pub fn new(issuer: &NodeId) -> Self {
        let hash = blake3::hash(issuer.as_bytes());
        let mut tag = [0u8; 6];
        tag.copy_from_slice(&hash.as_bytes()[..6]);
        Self {
            tag,
            last_ms: 0,
            counter: 0,
        }
    }

    /// Generator that only produces ids greater than `last`.
    pub fn resume_after(issuer: &NodeId, last: &ClaimId) -> Self {
        let mut generator = Self::new(issuer);
        generator.last_ms = last.timestamp_ms();
        generator.counter = last.counter();
        generator
    }

    pub fn next_id(&mut self) -> ClaimId {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        self.next_id_at(now_ms)
    }

    /// Next id given an explicit clock reading.
    pub fn next_id_at(&mut self, now_ms: u64) -> ClaimId {
        let now_ms = now_ms & TIMESTAMP_MASK;
        if now_ms > self.last_ms {
            self.last_ms = now_ms;
            self.counter = 0;
        } else if self.counter == u32::MAX {
            self.last_ms += 1;
            self.counter = 0;
        } else {
            self.counter += 1;
        }

        let mut bytes = [0u8; 16];
        bytes[..6].copy_from_slice(&self.last_ms.to_be_bytes()[2..]);
        bytes[6..10].copy_from_slice(&self.counter.to_be_bytes());
        bytes[10..].copy_from_slice(&self.tag);
        ClaimId(bytes)
    }
}
