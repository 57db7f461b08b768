//! Persisted graph of nodes and identities.
//!
//! Vertices are linked by edges backed by signed claims. A connected
//! component is a gestalt: one trusted party, granted actions as a whole.
//!
//! Store layout under `["gestalt"]`:
//! - `vertices/<key>`: vertex record
//! - `matrix/<a>/<b>`: adjacency, always written in symmetric pairs
//! - `links/<min>/<max>`: claim evidence for the edge
//! - `actions/<rep>/<action>`: action set of the component whose smallest
//!   vertex key is `rep`
//!
//! Components are recomputed by traversal on each query. Merging two
//! components unions their action sets. Removing an edge or vertex that
//! splits a component copies the prior action set to every resulting
//! component; actions are never re-derived from edges.
//!
//! Every operation runs in one store transaction.

use std::collections::{BTreeSet, HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, info};
use trellis_core::{
    GestaltId, KeyPath, NodeId, ProviderIdentityId, Segment, Store, StoreError, StoreTx,
};
use trellis_sigchain::ClaimKind;

use crate::error::{GestaltError, Result};
use crate::types::{
    Gestalt, GestaltAction, GestaltActions, GestaltLink, GestaltLinkIdentity, GestaltLinkNode,
    IdentityInfo, NodeInfo, StoredLink, VertexInfo,
};

/// Vertices fetched per store round trip by [`GestaltIter`].
pub const DEFAULT_PAGE_SIZE: usize = 64;

fn root() -> KeyPath {
    KeyPath::of(&["gestalt"])
}

fn vertices_prefix() -> KeyPath {
    root().push("vertices")
}

fn vertex_key(id: &GestaltId) -> KeyPath {
    vertices_prefix().push(id.key())
}

fn matrix_prefix(id: &GestaltId) -> KeyPath {
    root().push("matrix").push(id.key())
}

fn matrix_key(a: &GestaltId, b: &GestaltId) -> KeyPath {
    matrix_prefix(a).push(b.key())
}

fn link_key(a: &GestaltId, b: &GestaltId) -> KeyPath {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    root().push("links").push(lo.key()).push(hi.key())
}

fn actions_prefix(rep: &GestaltId) -> KeyPath {
    root().push("actions").push(rep.key())
}

fn action_key(rep: &GestaltId, action: GestaltAction) -> KeyPath {
    actions_prefix(rep).push(action.as_str())
}

fn last_segment(key: &KeyPath) -> Result<&str> {
    key.last()
        .and_then(Segment::as_str)
        .ok_or_else(|| GestaltError::Corrupt(format!("malformed graph key {:?}", key)))
}

fn read_vertex(tx: &StoreTx<'_>, id: &GestaltId) -> Result<Option<VertexInfo>> {
    Ok(tx.get_json(&vertex_key(id))?)
}

fn neighbours(tx: &StoreTx<'_>, id: &GestaltId) -> Result<Vec<GestaltId>> {
    tx.scan_all(&matrix_prefix(id))?
        .into_iter()
        .map(|(key, _)| Ok(GestaltId::from_key(last_segment(&key)?)?))
        .collect()
}

/// Breadth-first traversal of the component containing `start`.
fn component(tx: &StoreTx<'_>, start: &GestaltId) -> Result<BTreeSet<GestaltId>> {
    let mut members = BTreeSet::new();
    let mut queue = VecDeque::new();
    members.insert(start.clone());
    queue.push_back(start.clone());
    while let Some(id) = queue.pop_front() {
        for next in neighbours(tx, &id)? {
            if members.insert(next.clone()) {
                queue.push_back(next);
            }
        }
    }
    Ok(members)
}

fn representative(members: &BTreeSet<GestaltId>) -> Result<GestaltId> {
    members
        .iter()
        .next()
        .cloned()
        .ok_or_else(|| GestaltError::Corrupt("empty component".to_string()))
}

fn read_actions(tx: &StoreTx<'_>, rep: &GestaltId) -> Result<GestaltActions> {
    tx.scan_all(&actions_prefix(rep))?
        .into_iter()
        .map(|(key, _)| last_segment(&key)?.parse())
        .collect()
}

fn write_actions(tx: &StoreTx<'_>, rep: &GestaltId, actions: &GestaltActions) -> Result<()> {
    tx.delete_prefix(&actions_prefix(rep))?;
    for action in actions {
        tx.put(&action_key(rep, *action), &[])?;
    }
    Ok(())
}

fn require_vertex(tx: &StoreTx<'_>, id: &GestaltId) -> Result<()> {
    if tx.exists(&vertex_key(id))? {
        Ok(())
    } else {
        Err(GestaltError::VertexNotFound(id.key()))
    }
}

/// Component representative and its actions.
fn component_actions(tx: &StoreTx<'_>, id: &GestaltId) -> Result<(GestaltId, GestaltActions)> {
    let rep = representative(&component(tx, id)?)?;
    let actions = read_actions(tx, &rep)?;
    Ok((rep, actions))
}

/// Returns true when the vertex was newly created.
fn put_vertex(tx: &StoreTx<'_>, info: &VertexInfo) -> Result<bool> {
    let key = vertex_key(&info.gestalt_id());
    let created = !tx.exists(&key)?;
    tx.put_json(&key, info)?;
    Ok(created)
}

/// Inserts the edge and merges components. Returns true on a merge.
fn link_vertices(tx: &StoreTx<'_>, a: &GestaltId, b: &GestaltId, evidence: &StoredLink) -> Result<bool> {
    let component_a = component(tx, a)?;
    let merged = if component_a.contains(b) {
        false
    } else {
        let rep_a = representative(&component_a)?;
        let rep_b = representative(&component(tx, b)?)?;
        let mut actions = read_actions(tx, &rep_a)?;
        actions.extend(read_actions(tx, &rep_b)?);
        tx.delete_prefix(&actions_prefix(&rep_a))?;
        tx.delete_prefix(&actions_prefix(&rep_b))?;
        write_actions(tx, &rep_a.min(rep_b), &actions)?;
        true
    };

    tx.put(&matrix_key(a, b), &[])?;
    tx.put(&matrix_key(b, a), &[])?;
    tx.put_json(&link_key(a, b), evidence)?;
    Ok(merged)
}

/// Writes `actions` to the component of every surviving seed.
fn redistribute(tx: &StoreTx<'_>, seeds: &[GestaltId], actions: &GestaltActions) -> Result<()> {
    let mut seen = HashSet::new();
    for seed in seeds {
        if seen.contains(seed) || !tx.exists(&vertex_key(seed))? {
            continue;
        }
        let members = component(tx, seed)?;
        write_actions(tx, &representative(&members)?, actions)?;
        seen.extend(members);
    }
    Ok(())
}

fn remove_edge(tx: &StoreTx<'_>, a: &GestaltId, b: &GestaltId) -> Result<()> {
    tx.delete(&matrix_key(a, b))?;
    tx.delete(&matrix_key(b, a))?;
    tx.delete(&link_key(a, b))?;
    Ok(())
}

fn unlink_vertices(tx: &StoreTx<'_>, a: &GestaltId, b: &GestaltId) -> Result<bool> {
    if !tx.exists(&matrix_key(a, b))? {
        return Ok(false);
    }
    let (rep, actions) = component_actions(tx, a)?;
    remove_edge(tx, a, b)?;
    tx.delete_prefix(&actions_prefix(&rep))?;
    redistribute(tx, &[a.clone(), b.clone()], &actions)?;
    Ok(true)
}

fn unset_vertex(tx: &StoreTx<'_>, id: &GestaltId) -> Result<bool> {
    if !tx.exists(&vertex_key(id))? {
        return Ok(false);
    }
    let (rep, actions) = component_actions(tx, id)?;
    let adjacent = neighbours(tx, id)?;
    for other in &adjacent {
        remove_edge(tx, id, other)?;
    }
    tx.delete(&vertex_key(id))?;
    tx.delete_prefix(&actions_prefix(&rep))?;
    redistribute(tx, &adjacent, &actions)?;
    Ok(true)
}

fn build_gestalt(tx: &StoreTx<'_>, members: &BTreeSet<GestaltId>) -> Result<Gestalt> {
    let mut gestalt = Gestalt::default();
    for id in members {
        let key = id.key();
        let adjacent = neighbours(tx, id)?.iter().map(GestaltId::key).collect();
        gestalt.matrix.insert(key.clone(), adjacent);
        match read_vertex(tx, id)? {
            Some(VertexInfo::Node(info)) => {
                gestalt.nodes.insert(key, info);
            }
            Some(VertexInfo::Identity(info)) => {
                gestalt.identities.insert(key, info);
            }
            None => {
                return Err(GestaltError::Corrupt(format!("edge to missing vertex {}", key)));
            }
        }
    }
    Ok(gestalt)
}

fn read_gestalt(tx: &StoreTx<'_>, id: &GestaltId) -> Result<Option<(BTreeSet<GestaltId>, Gestalt)>> {
    if !tx.exists(&vertex_key(id))? {
        return Ok(None);
    }
    let members = component(tx, id)?;
    let gestalt = build_gestalt(tx, &members)?;
    Ok(Some((members, gestalt)))
}

fn validate_node_link(a: &NodeId, b: &NodeId, link: &GestaltLinkNode) -> Result<()> {
    if a == b {
        return Err(GestaltError::EvidenceMismatch(
            "a node cannot link to itself".to_string(),
        ));
    }
    if !link.claim.is_signed() {
        return Err(GestaltError::MissingEvidence(
            "node link claim carries no signatures".to_string(),
        ));
    }
    match &link.claim.payload().kind {
        ClaimKind::LinkNode(claim)
            if (claim.iss == *a && claim.sub == *b) || (claim.iss == *b && claim.sub == *a) => {}
        ClaimKind::LinkNode(claim) => {
            return Err(GestaltError::EvidenceMismatch(format!(
                "claim links {} and {}",
                claim.iss, claim.sub
            )))
        }
        other => {
            return Err(GestaltError::EvidenceMismatch(format!(
                "expected ClaimLinkNode, got {}",
                other.typ()
            )))
        }
    }
    for node_id in [a, b] {
        if !link.claim.verify_with_public_key(node_id) {
            return Err(GestaltError::VerificationFailed { node_id: *node_id });
        }
    }
    Ok(())
}

fn validate_identity_link(
    node_id: &NodeId,
    identity: &ProviderIdentityId,
    link: &GestaltLinkIdentity,
) -> Result<()> {
    if !link.claim.is_signed() {
        return Err(GestaltError::MissingEvidence(
            "identity link claim carries no signatures".to_string(),
        ));
    }
    match &link.claim.payload().kind {
        ClaimKind::LinkIdentity(claim) if claim.iss == *node_id && claim.sub == *identity => {}
        ClaimKind::LinkIdentity(claim) => {
            return Err(GestaltError::EvidenceMismatch(format!(
                "claim links {} to {}",
                claim.iss, claim.sub
            )))
        }
        other => {
            return Err(GestaltError::EvidenceMismatch(format!(
                "expected ClaimLinkIdentity, got {}",
                other.typ()
            )))
        }
    }
    if !link.claim.verify_with_public_key(node_id) {
        return Err(GestaltError::VerificationFailed { node_id: *node_id });
    }
    Ok(())
}

pub struct GestaltGraph {
    store: Arc<Store>,
    page_size: usize,
}

impl GestaltGraph {
    pub fn new(store: Arc<Store>) -> Self {
        Self::with_page_size(store, DEFAULT_PAGE_SIZE)
    }

    pub fn with_page_size(store: Arc<Store>, page_size: usize) -> Self {
        Self {
            store,
            page_size: page_size.max(1),
        }
    }

    pub fn set_node(&self, info: &NodeInfo) -> Result<()> {
        let record = VertexInfo::Node(info.clone());
        if self.store.transaction(|tx| put_vertex(tx, &record))? {
            debug!(node_id = %info.node_id, "Gestalt node added");
        }
        Ok(())
    }

    pub fn set_identity(&self, info: &IdentityInfo) -> Result<()> {
        let record = VertexInfo::Identity(info.clone());
        if self.store.transaction(|tx| put_vertex(tx, &record))? {
            debug!(identity = %info.provider_identity_id(), "Gestalt identity added");
        }
        Ok(())
    }

    pub fn get_node(&self, node_id: &NodeId) -> Result<Option<NodeInfo>> {
        let id = GestaltId::Node(*node_id);
        match self.store.transaction(|tx| read_vertex(tx, &id))? {
            Some(VertexInfo::Node(info)) => Ok(Some(info)),
            Some(VertexInfo::Identity(_)) => Err(GestaltError::Corrupt(id.key())),
            None => Ok(None),
        }
    }

    pub fn get_identity(&self, identity: &ProviderIdentityId) -> Result<Option<IdentityInfo>> {
        let id = GestaltId::Identity(identity.clone());
        match self.store.transaction(|tx| read_vertex(tx, &id))? {
            Some(VertexInfo::Identity(info)) => Ok(Some(info)),
            Some(VertexInfo::Node(_)) => Err(GestaltError::Corrupt(id.key())),
            None => Ok(None),
        }
    }

    fn all_vertices(&self) -> Result<Vec<VertexInfo>> {
        self.store.transaction(|tx| {
            tx.scan_all(&vertices_prefix())?
                .into_iter()
                .map(|(_, value)| {
                    serde_json::from_slice(&value).map_err(|e| GestaltError::Store(StoreError::from(e)))
                })
                .collect()
        })
    }

    pub fn get_nodes(&self) -> Result<Vec<NodeInfo>> {
        Ok(self
            .all_vertices()?
            .into_iter()
            .filter_map(|vertex| match vertex {
                VertexInfo::Node(info) => Some(info),
                VertexInfo::Identity(_) => None,
            })
            .collect())
    }

    pub fn get_identities(&self) -> Result<Vec<IdentityInfo>> {
        Ok(self
            .all_vertices()?
            .into_iter()
            .filter_map(|vertex| match vertex {
                VertexInfo::Identity(info) => Some(info),
                VertexInfo::Node(_) => None,
            })
            .collect())
    }

    /// Link two nodes on the strength of a claim signed by both.
    ///
    /// Creates missing vertices and merges their gestalts.
    pub fn link_node_and_node(
        &self,
        node1: &NodeInfo,
        node2: &NodeInfo,
        link: &GestaltLinkNode,
    ) -> Result<()> {
        validate_node_link(&node1.node_id, &node2.node_id, link)?;
        let evidence = StoredLink::from_link(&GestaltLink::Node(link.clone()))?;
        let (a, b) = (node1.gestalt_id(), node2.gestalt_id());

        let merged = self.store.transaction(|tx| {
            put_vertex(tx, &VertexInfo::Node(node1.clone()))?;
            put_vertex(tx, &VertexInfo::Node(node2.clone()))?;
            link_vertices(tx, &a, &b, &evidence)
        })?;

        info!(node1 = %node1.node_id, node2 = %node2.node_id, merged, "Linked nodes");
        Ok(())
    }

    /// Link a node to an identity on the strength of a claim signed by the node.
    pub fn link_node_and_identity(
        &self,
        node: &NodeInfo,
        identity: &IdentityInfo,
        link: &GestaltLinkIdentity,
    ) -> Result<()> {
        validate_identity_link(&node.node_id, &identity.provider_identity_id(), link)?;
        let evidence = StoredLink::from_link(&GestaltLink::Identity(link.clone()))?;
        let (a, b) = (node.gestalt_id(), identity.gestalt_id());

        let merged = self.store.transaction(|tx| {
            put_vertex(tx, &VertexInfo::Node(node.clone()))?;
            put_vertex(tx, &VertexInfo::Identity(identity.clone()))?;
            link_vertices(tx, &a, &b, &evidence)
        })?;

        info!(
            node = %node.node_id,
            identity = %identity.provider_identity_id(),
            merged,
            "Linked node and identity"
        );
        Ok(())
    }

    pub fn unlink_node_and_node(&self, node1: &NodeId, node2: &NodeId) -> Result<()> {
        let (a, b) = (GestaltId::Node(*node1), GestaltId::Node(*node2));
        if self.store.transaction(|tx| unlink_vertices(tx, &a, &b))? {
            info!(node1 = %node1, node2 = %node2, "Unlinked nodes");
        }
        Ok(())
    }

    pub fn unlink_node_and_identity(&self, node: &NodeId, identity: &ProviderIdentityId) -> Result<()> {
        let (a, b) = (GestaltId::Node(*node), GestaltId::Identity(identity.clone()));
        if self.store.transaction(|tx| unlink_vertices(tx, &a, &b))? {
            info!(node = %node, identity = %identity, "Unlinked node and identity");
        }
        Ok(())
    }

    /// Remove a node with all its edges.
    pub fn unset_node(&self, node_id: &NodeId) -> Result<()> {
        let id = GestaltId::Node(*node_id);
        if self.store.transaction(|tx| unset_vertex(tx, &id))? {
            info!(node_id = %node_id, "Gestalt node removed");
        }
        Ok(())
    }

    pub fn unset_identity(&self, identity: &ProviderIdentityId) -> Result<()> {
        let id = GestaltId::Identity(identity.clone());
        if self.store.transaction(|tx| unset_vertex(tx, &id))? {
            info!(identity = %identity, "Gestalt identity removed");
        }
        Ok(())
    }

    /// Evidence stored for the edge between `a` and `b`.
    pub fn get_link(&self, a: &GestaltId, b: &GestaltId) -> Result<Option<GestaltLink>> {
        let stored: Option<StoredLink> = self.store.transaction(|tx| tx.get_json(&link_key(a, b)))?;
        stored.map(StoredLink::into_link).transpose()
    }

    pub fn get_gestalt(&self, id: &GestaltId) -> Result<Option<Gestalt>> {
        Ok(self
            .store
            .transaction(|tx| read_gestalt(tx, id))?
            .map(|(_, gestalt)| gestalt))
    }

    pub fn get_gestalt_by_node(&self, node_id: &NodeId) -> Result<Option<Gestalt>> {
        self.get_gestalt(&GestaltId::Node(*node_id))
    }

    pub fn get_gestalt_by_identity(&self, identity: &ProviderIdentityId) -> Result<Option<Gestalt>> {
        self.get_gestalt(&GestaltId::Identity(identity.clone()))
    }

    /// Every gestalt exactly once, in order of their first vertex key.
    pub fn get_gestalts(&self) -> GestaltIter {
        GestaltIter {
            store: Arc::clone(&self.store),
            page_size: self.page_size,
            after: None,
            buffer: VecDeque::new(),
            visited: HashSet::new(),
            done: false,
        }
    }

    /// Actions of the gestalt containing `id`; empty for an unknown vertex.
    pub fn get_gestalt_actions(&self, id: &GestaltId) -> Result<GestaltActions> {
        self.store.transaction(|tx| {
            if !tx.exists(&vertex_key(id))? {
                return Ok(GestaltActions::new());
            }
            Ok(component_actions(tx, id)?.1)
        })
    }

    pub fn get_gestalt_actions_by_node(&self, node_id: &NodeId) -> Result<GestaltActions> {
        self.get_gestalt_actions(&GestaltId::Node(*node_id))
    }

    pub fn get_gestalt_actions_by_identity(&self, identity: &ProviderIdentityId) -> Result<GestaltActions> {
        self.get_gestalt_actions(&GestaltId::Identity(identity.clone()))
    }

    pub fn set_gestalt_action(&self, id: &GestaltId, action: GestaltAction) -> Result<()> {
        self.store.transaction(|tx| {
            require_vertex(tx, id)?;
            let rep = representative(&component(tx, id)?)?;
            tx.put(&action_key(&rep, action), &[])?;
            Ok::<_, GestaltError>(())
        })?;
        debug!(vertex = %id, action = %action, "Gestalt action set");
        Ok(())
    }

    pub fn set_gestalt_action_by_node(&self, node_id: &NodeId, action: GestaltAction) -> Result<()> {
        self.set_gestalt_action(&GestaltId::Node(*node_id), action)
    }

    pub fn set_gestalt_action_by_identity(
        &self,
        identity: &ProviderIdentityId,
        action: GestaltAction,
    ) -> Result<()> {
        self.set_gestalt_action(&GestaltId::Identity(identity.clone()), action)
    }

    pub fn unset_gestalt_action(&self, id: &GestaltId, action: GestaltAction) -> Result<()> {
        self.store.transaction(|tx| {
            require_vertex(tx, id)?;
            let rep = representative(&component(tx, id)?)?;
            tx.delete(&action_key(&rep, action))?;
            Ok::<_, GestaltError>(())
        })?;
        debug!(vertex = %id, action = %action, "Gestalt action unset");
        Ok(())
    }

    pub fn unset_gestalt_action_by_node(&self, node_id: &NodeId, action: GestaltAction) -> Result<()> {
        self.unset_gestalt_action(&GestaltId::Node(*node_id), action)
    }

    pub fn unset_gestalt_action_by_identity(
        &self,
        identity: &ProviderIdentityId,
        action: GestaltAction,
    ) -> Result<()> {
        self.unset_gestalt_action(&GestaltId::Identity(identity.clone()), action)
    }

    /// Replace the whole action set of the gestalt containing `id`.
    pub fn set_gestalt_actions(&self, id: &GestaltId, actions: &GestaltActions) -> Result<()> {
        self.store.transaction(|tx| {
            require_vertex(tx, id)?;
            let rep = representative(&component(tx, id)?)?;
            write_actions(tx, &rep, actions)
        })
    }
}

/// Restartable enumeration of all gestalts.
///
/// Walks vertex keys in pages; each gestalt is read in its own transaction
/// and all of its members are skipped afterwards.
pub struct GestaltIter {
    store: Arc<Store>,
    page_size: usize,
    after: Option<KeyPath>,
    buffer: VecDeque<GestaltId>,
    visited: HashSet<GestaltId>,
    done: bool,
}

impl GestaltIter {
    fn fill(&mut self) -> Result<()> {
        let prefix = vertices_prefix();
        let rows = self
            .store
            .transaction(|tx| tx.scan(&prefix, self.after.as_ref(), self.page_size))?;
        let Some((last, _)) = rows.last() else {
            self.done = true;
            return Ok(());
        };
        self.after = Some(last.clone());
        for (key, _) in &rows {
            self.buffer.push_back(GestaltId::from_key(last_segment(key)?)?);
        }
        Ok(())
    }
}

impl Iterator for GestaltIter {
    type Item = Result<Gestalt>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.buffer.is_empty() {
                if self.done {
                    return None;
                }
                if let Err(e) = self.fill() {
                    self.done = true;
                    return Some(Err(e));
                }
                continue;
            }

            let id = self.buffer.pop_front()?;
            if self.visited.contains(&id) {
                continue;
            }
            match self.store.transaction(|tx| read_gestalt(tx, &id)) {
                Ok(Some((members, gestalt))) => {
                    self.visited.extend(members);
                    return Some(Ok(gestalt));
                }
                // Removed since the page was read.
                Ok(None) => continue,
                Err(e) => {
                    self.done = true;
                    self.buffer.clear();
                    return Some(Err(e));
                }
            }
        }
    }
}
