//! Vertex identifiers shared across the trust graph.
//!
//! A [`NodeId`] is the node's ed25519 public key, so a node id alone is enough
//! to verify anything the node signed. Provider identities are opaque
//! `(provider, identity)` pairs owned by an external identity provider.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use crate::error::StoreError;

/// Length of an ed25519 public key in bytes.
pub const NODE_ID_LEN: usize = 32;

const NODE_PREFIX: &str = "node-";
const IDENTITY_PREFIX: &str = "identity-";

/// Node identity: the raw ed25519 public key of the node.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId([u8; NODE_ID_LEN]);

impl NodeId {
    pub fn from_public_key(bytes: [u8; NODE_ID_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, StoreError> {
        let array: [u8; NODE_ID_LEN] = bytes.try_into().map_err(|_| {
            StoreError::InvalidKey(format!(
                "node id must be {} bytes, got {}",
                NODE_ID_LEN,
                bytes.len()
            ))
        })?;
        Ok(Self(array))
    }

    pub fn as_bytes(&self) -> &[u8; NODE_ID_LEN] {
        &self.0
    }

    /// Canonical string form (lowercase hex).
    pub fn encode(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.encode())
    }
}

impl FromStr for NodeId {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s)
            .map_err(|e| StoreError::InvalidKey(format!("invalid node id {}: {}", s, e)))?;
        Self::from_slice(&bytes)
    }
}

impl Serialize for NodeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.encode())
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Identity provider name, e.g. `github.com`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProviderId(pub String);

/// Account name at an identity provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityId(pub String);

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for IdentityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A `(provider, identity)` pair. Serialized as a two element array.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "(ProviderId, IdentityId)", into = "(ProviderId, IdentityId)")]
pub struct ProviderIdentityId {
    pub provider_id: ProviderId,
    pub identity_id: IdentityId,
}

impl ProviderIdentityId {
    pub fn new(provider_id: impl Into<String>, identity_id: impl Into<String>) -> Self {
        Self {
            provider_id: ProviderId(provider_id.into()),
            identity_id: IdentityId(identity_id.into()),
        }
    }

    /// Canonical string form: `["provider","identity"]`.
    pub fn encode(&self) -> String {
        // Serializing two strings into a JSON array cannot fail.
        serde_json::to_string(&(&self.provider_id, &self.identity_id)).unwrap_or_default()
    }

    pub fn decode(s: &str) -> Result<Self, StoreError> {
        let (provider_id, identity_id): (ProviderId, IdentityId) = serde_json::from_str(s)?;
        Ok(Self {
            provider_id,
            identity_id,
        })
    }
}

impl From<(ProviderId, IdentityId)> for ProviderIdentityId {
    fn from((provider_id, identity_id): (ProviderId, IdentityId)) -> Self {
        Self {
            provider_id,
            identity_id,
        }
    }
}

impl From<ProviderIdentityId> for (ProviderId, IdentityId) {
    fn from(id: ProviderIdentityId) -> Self {
        (id.provider_id, id.identity_id)
    }
}

impl fmt::Display for ProviderIdentityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

/// A vertex of the gestalt graph.
///
/// Ordering follows the canonical key string, which is also the order used to
/// pick a component's representative vertex.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum GestaltId {
    Node(NodeId),
    Identity(ProviderIdentityId),
}

impl GestaltId {
    /// Canonical key used by the graph store.
    pub fn key(&self) -> String {
        match self {
            GestaltId::Node(node_id) => format!("{}{}", NODE_PREFIX, node_id.encode()),
            GestaltId::Identity(id) => format!("{}{}", IDENTITY_PREFIX, id.encode()),
        }
    }

    pub fn from_key(key: &str) -> Result<Self, StoreError> {
        if let Some(rest) = key.strip_prefix(NODE_PREFIX) {
            return Ok(GestaltId::Node(rest.parse()?));
        }
        if let Some(rest) = key.strip_prefix(IDENTITY_PREFIX) {
            return Ok(GestaltId::Identity(ProviderIdentityId::decode(rest)?));
        }
        Err(StoreError::InvalidKey(format!("unknown gestalt key: {}", key)))
    }

    pub fn is_node(&self) -> bool {
        matches!(self, GestaltId::Node(_))
    }

    pub fn as_node(&self) -> Option<&NodeId> {
        match self {
            GestaltId::Node(node_id) => Some(node_id),
            GestaltId::Identity(_) => None,
        }
    }

    pub fn as_identity(&self) -> Option<&ProviderIdentityId> {
        match self {
            GestaltId::Node(_) => None,
            GestaltId::Identity(id) => Some(id),
        }
    }
}

impl From<NodeId> for GestaltId {
    fn from(node_id: NodeId) -> Self {
        GestaltId::Node(node_id)
    }
}

impl From<ProviderIdentityId> for GestaltId {
    fn from(id: ProviderIdentityId) -> Self {
        GestaltId::Identity(id)
    }
}

impl Ord for GestaltId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

impl PartialOrd for GestaltId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for GestaltId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

impl Serialize for GestaltId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.key())
    }
}

impl<'de> Deserialize<'de> for GestaltId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        GestaltId::from_key(&s).map_err(serde::de::Error::custom)
    }
}
