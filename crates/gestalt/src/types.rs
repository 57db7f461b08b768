//! Gestalt graph records and read views.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use trellis_core::{GestaltId, IdentityId, NodeId, ProviderId, ProviderIdentityId};
use trellis_crypto::SignedToken;
use trellis_sigchain::SignedClaim;

use crate::error::{GestaltError, Result};

/// Permission granted to a whole gestalt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GestaltAction {
    Notify,
    Scan,
    Claim,
}

impl GestaltAction {
    pub const ALL: [GestaltAction; 3] = [GestaltAction::Notify, GestaltAction::Scan, GestaltAction::Claim];

    pub fn as_str(&self) -> &'static str {
        match self {
            GestaltAction::Notify => "notify",
            GestaltAction::Scan => "scan",
            GestaltAction::Claim => "claim",
        }
    }
}

impl fmt::Display for GestaltAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GestaltAction {
    type Err = GestaltError;

    fn from_str(s: &str) -> Result<Self> {
        GestaltAction::ALL
            .into_iter()
            .find(|action| action.as_str() == s)
            .ok_or_else(|| GestaltError::Corrupt(format!("unknown action: {}", s)))
    }
}

pub type GestaltActions = BTreeSet<GestaltAction>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfo {
    pub node_id: NodeId,
}

impl NodeInfo {
    pub fn new(node_id: NodeId) -> Self {
        Self { node_id }
    }

    pub fn gestalt_id(&self) -> GestaltId {
        GestaltId::Node(self.node_id)
    }
}

/// An account at an identity provider, with optional profile data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityInfo {
    pub provider_id: ProviderId,
    pub identity_id: IdentityId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl IdentityInfo {
    pub fn new(provider_id: impl Into<String>, identity_id: impl Into<String>) -> Self {
        Self {
            provider_id: ProviderId(provider_id.into()),
            identity_id: IdentityId(identity_id.into()),
            name: None,
            email: None,
            url: None,
        }
    }

    pub fn provider_identity_id(&self) -> ProviderIdentityId {
        ProviderIdentityId {
            provider_id: self.provider_id.clone(),
            identity_id: self.identity_id.clone(),
        }
    }

    pub fn gestalt_id(&self) -> GestaltId {
        GestaltId::Identity(self.provider_identity_id())
    }
}

/// Stored vertex record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub(crate) enum VertexInfo {
    Node(NodeInfo),
    Identity(IdentityInfo),
}

impl VertexInfo {
    pub(crate) fn gestalt_id(&self) -> GestaltId {
        match self {
            VertexInfo::Node(info) => info.gestalt_id(),
            VertexInfo::Identity(info) => info.gestalt_id(),
        }
    }
}

/// Provider side data for an identity link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkIdentityMeta {
    /// Id of the post or record at the provider publishing the claim
    pub provider_identity_claim_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// Evidence for a node to node edge: a link claim signed by both nodes.
#[derive(Debug, Clone, PartialEq)]
pub struct GestaltLinkNode {
    pub claim: SignedClaim,
}

/// Evidence for a node to identity edge: a link claim signed by the node.
#[derive(Debug, Clone, PartialEq)]
pub struct GestaltLinkIdentity {
    pub claim: SignedClaim,
    pub meta: LinkIdentityMeta,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GestaltLink {
    Node(GestaltLinkNode),
    Identity(GestaltLinkIdentity),
}

impl GestaltLink {
    pub fn claim(&self) -> &SignedClaim {
        match self {
            GestaltLink::Node(link) => &link.claim,
            GestaltLink::Identity(link) => &link.claim,
        }
    }
}

/// Persisted form of [`GestaltLink`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub(crate) enum StoredLink {
    Node {
        claim: SignedToken,
    },
    Identity {
        claim: SignedToken,
        meta: LinkIdentityMeta,
    },
}

impl StoredLink {
    pub(crate) fn from_link(link: &GestaltLink) -> Result<Self> {
        Ok(match link {
            GestaltLink::Node(link) => StoredLink::Node {
                claim: link.claim.to_signed()?,
            },
            GestaltLink::Identity(link) => StoredLink::Identity {
                claim: link.claim.to_signed()?,
                meta: link.meta.clone(),
            },
        })
    }

    pub(crate) fn into_link(self) -> Result<GestaltLink> {
        Ok(match self {
            StoredLink::Node { claim } => GestaltLink::Node(GestaltLinkNode {
                claim: SignedClaim::from_signed(&claim)?,
            }),
            StoredLink::Identity { claim, meta } => GestaltLink::Identity(GestaltLinkIdentity {
                claim: SignedClaim::from_signed(&claim)?,
                meta,
            }),
        })
    }
}

/// One connected component, keyed by vertex key.
///
/// `matrix` lists every member with its neighbours, so isolated vertices
/// appear with an empty set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gestalt {
    pub matrix: BTreeMap<String, BTreeSet<String>>,
    pub nodes: BTreeMap<String, NodeInfo>,
    pub identities: BTreeMap<String, IdentityInfo>,
}

impl Gestalt {
    pub fn contains(&self, id: &GestaltId) -> bool {
        self.matrix.contains_key(&id.key())
    }

    pub fn len(&self) -> usize {
        self.matrix.len()
    }

    pub fn is_empty(&self) -> bool {
        self.matrix.is_empty()
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.values().map(|info| info.node_id).collect()
    }

    pub fn identity_ids(&self) -> Vec<ProviderIdentityId> {
        self.identities
            .values()
            .map(IdentityInfo::provider_identity_id)
            .collect()
    }

    /// Smallest member key; the component's action set is stored under it.
    pub fn representative(&self) -> Option<&str> {
        self.matrix.keys().next().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_names() {
        assert_eq!(serde_json::to_string(&GestaltAction::Notify).unwrap(), "\"notify\"");
        for action in GestaltAction::ALL {
            assert_eq!(action.as_str().parse::<GestaltAction>().unwrap(), action);
        }
        assert!("admin".parse::<GestaltAction>().is_err());
    }

    #[test]
    fn test_identity_info_omits_empty_profile() {
        let info = IdentityInfo::new("github.com", "alice");
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["providerId"], "github.com");
        assert!(json.get("email").is_none());
        assert_eq!(
            info.gestalt_id(),
            GestaltId::Identity(ProviderIdentityId::new("github.com", "alice"))
        );
    }

    #[test]
    fn test_vertex_record_is_tagged() {
        let record = VertexInfo::Identity(IdentityInfo::new("github.com", "bob"));
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["type"], "identity");
        let back: VertexInfo = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }
}
