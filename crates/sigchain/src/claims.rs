//! Claim payload types.
//!
//! Every claim carries the chain header (`jti`, `iat`, `nbf`, `seq`,
//! `prevClaimId`, `prevDigest`) plus a kind-specific body tagged by `typ`.
//! The issuer of a claim is always the owner of the chain it is stored in.

use serde::{Deserialize, Serialize};
use trellis_core::{GestaltId, NodeId, ProviderIdentityId};
use trellis_crypto::{ClaimId, Digest, Token};

/// Node to node link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimLinkNode {
    pub iss: NodeId,
    pub sub: NodeId,
}

/// Node to provider identity link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimLinkIdentity {
    pub iss: NodeId,
    pub sub: ProviderIdentityId,
}

/// Grants `sub` authority over `network`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimNetworkAuthority {
    pub iss: NodeId,
    pub sub: NodeId,
    pub network: String,
}

/// Grants `sub` access to `network`, optionally chained to an authority claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimNetworkAccess {
    pub iss: NodeId,
    pub sub: NodeId,
    pub network: String,
    /// Encoded token of the authority claim this access derives from
    pub signed_claim_network_authority_encoded: Option<String>,
    pub is_private: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "typ")]
pub enum ClaimKind {
    #[serde(rename = "ClaimLinkNode")]
    LinkNode(ClaimLinkNode),
    #[serde(rename = "ClaimLinkIdentity")]
    LinkIdentity(ClaimLinkIdentity),
    #[serde(rename = "ClaimNetworkAuthority")]
    NetworkAuthority(ClaimNetworkAuthority),
    #[serde(rename = "ClaimNetworkAccess")]
    NetworkAccess(ClaimNetworkAccess),
}

impl ClaimKind {
    pub fn typ(&self) -> &'static str {
        match self {
            ClaimKind::LinkNode(_) => "ClaimLinkNode",
            ClaimKind::LinkIdentity(_) => "ClaimLinkIdentity",
            ClaimKind::NetworkAuthority(_) => "ClaimNetworkAuthority",
            ClaimKind::NetworkAccess(_) => "ClaimNetworkAccess",
        }
    }

    pub fn issuer(&self) -> NodeId {
        match self {
            ClaimKind::LinkNode(c) => c.iss,
            ClaimKind::LinkIdentity(c) => c.iss,
            ClaimKind::NetworkAuthority(c) => c.iss,
            ClaimKind::NetworkAccess(c) => c.iss,
        }
    }

    /// Subject as a gestalt vertex.
    pub fn subject(&self) -> GestaltId {
        match self {
            ClaimKind::LinkNode(c) => GestaltId::Node(c.sub),
            ClaimKind::LinkIdentity(c) => GestaltId::Identity(c.sub.clone()),
            ClaimKind::NetworkAuthority(c) => GestaltId::Node(c.sub),
            ClaimKind::NetworkAccess(c) => GestaltId::Node(c.sub),
        }
    }

    pub fn link_node(iss: NodeId, sub: NodeId) -> Self {
        ClaimKind::LinkNode(ClaimLinkNode { iss, sub })
    }

    pub fn link_identity(iss: NodeId, sub: ProviderIdentityId) -> Self {
        ClaimKind::LinkIdentity(ClaimLinkIdentity { iss, sub })
    }
}

/// A chain-anchored claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Claim {
    pub jti: ClaimId,
    /// Issued at, unix seconds
    pub iat: u64,
    /// Not before, unix seconds
    pub nbf: u64,
    /// 1-based position in the issuer's chain
    pub seq: u64,
    pub prev_claim_id: Option<ClaimId>,
    pub prev_digest: Option<Digest>,
    #[serde(flatten)]
    pub kind: ClaimKind,
}

impl Claim {
    pub fn issuer(&self) -> NodeId {
        self.kind.issuer()
    }

    pub fn subject(&self) -> GestaltId {
        self.kind.subject()
    }

    pub fn is_genesis(&self) -> bool {
        self.seq == 1 && self.prev_claim_id.is_none() && self.prev_digest.is_none()
    }
}

pub type SignedClaim = Token<Claim>;

/// Digest linking the next claim to `token`.
pub fn claim_digest(token: &SignedClaim) -> trellis_crypto::Result<Digest> {
    Digest::of_json(&token.to_signed()?)
}
