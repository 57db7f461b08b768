//! Handshake to gestalt graph end-to-end tests
//!
//! 1. Two nodes cross-sign and each commit a doubly-signed link claim
//! 2. The claims are ingested into a gestalt graph as evidence
//! 3. Actions granted to one side apply to the whole gestalt

use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use trellis_core::{GestaltId, ProviderIdentityId, Store};
use trellis_cross_sign::LineClaimStream;
use trellis_gestalt::{
    GestaltAction, GestaltGraph, GestaltLink, GestaltLinkIdentity, GestaltLinkNode, IdentityInfo,
    LinkIdentityMeta,
};
use trellis_sigchain::{claim_digest, ClaimKind};

use crate::test_utils::{cross_sign, init_tracing, TestNode};

fn graph() -> GestaltGraph {
    GestaltGraph::new(Arc::new(Store::open_in_memory().unwrap()))
}

#[tokio::test]
async fn test_handshake_claims_become_gestalt_evidence() {
    init_tracing();
    let x = TestNode::new();
    let y = TestNode::new();

    let (y_claim, x_claim) = cross_sign(&y, &x).await;
    assert_eq!(x.chain_len(), 1);
    assert_eq!(y.chain_len(), 1);
    for claim in [&x_claim, &y_claim] {
        assert_eq!(claim.payload().seq, 1);
        assert!(claim.verify_with_public_key(&x.node_id()));
        assert!(claim.verify_with_public_key(&y.node_id()));
    }

    let g = graph();
    g.link_node_and_node(&x.info(), &y.info(), &GestaltLinkNode { claim: x_claim.clone() })
        .unwrap();
    // The peer's copy of the same edge is accepted too.
    g.link_node_and_node(&y.info(), &x.info(), &GestaltLinkNode { claim: y_claim })
        .unwrap();

    let gestalt = g.get_gestalt_by_node(&x.node_id()).unwrap().unwrap();
    assert_eq!(gestalt.nodes.len(), 2);
    assert!(gestalt.contains(&GestaltId::Node(y.node_id())));
    assert_eq!(g.get_gestalts().count(), 1);

    x.cleanup();
    y.cleanup();
}

#[tokio::test]
async fn test_identity_notify_flows_to_node() {
    init_tracing();
    let n1 = TestNode::new();
    let alice = ProviderIdentityId::new("github.com", "alice");

    let (_, claim) = n1
        .chain
        .add_claim(ClaimKind::link_identity(n1.node_id(), alice.clone()), None)
        .await
        .unwrap();

    let g = graph();
    let i1 = IdentityInfo::new("github.com", "alice");
    g.set_node(&n1.info()).unwrap();
    g.set_identity(&i1).unwrap();
    g.set_gestalt_action_by_identity(&alice, GestaltAction::Notify).unwrap();

    let link = GestaltLinkIdentity {
        claim,
        meta: LinkIdentityMeta {
            provider_identity_claim_id: "gist-42".to_string(),
            url: Some("https://gist.github.com/alice/42".to_string()),
        },
    };
    g.link_node_and_identity(&n1.info(), &i1, &link).unwrap();

    let actions = g.get_gestalt_actions_by_node(&n1.node_id()).unwrap();
    assert!(actions.contains(&GestaltAction::Notify));
    assert_eq!(actions.len(), 1);
    match g.get_link(&n1.info().gestalt_id(), &i1.gestalt_id()).unwrap() {
        Some(GestaltLink::Identity(stored)) => assert_eq!(stored.meta, link.meta),
        other => panic!("unexpected link {:?}", other),
    }

    n1.cleanup();
}

#[tokio::test]
async fn test_chain_continues_after_restart() {
    init_tracing();
    let x = TestNode::new();
    let y = TestNode::new();
    let z = TestNode::new();

    let (_, first) = cross_sign(&y, &x).await;
    let x = x.reopen();
    assert_eq!(x.chain.verify_chain().unwrap(), 1);

    let (_, second) = cross_sign(&z, &x).await;
    assert_eq!(second.payload().seq, 2);
    assert_eq!(second.payload().prev_claim_id, Some(first.payload().jti));
    assert_eq!(second.payload().prev_digest, Some(claim_digest(&first).unwrap()));
    assert_eq!(x.chain.verify_chain().unwrap(), 2);

    let peers: Vec<_> = x
        .chain
        .get_claims()
        .map(|entry| entry.unwrap().1.payload().subject())
        .collect();
    assert_eq!(peers, vec![GestaltId::Node(y.node_id()), GestaltId::Node(z.node_id())]);

    for node in [&x, &y, &z] {
        node.cleanup();
    }
}

#[tokio::test]
async fn test_handshake_over_tcp() {
    init_tracing();
    let x = TestNode::new();
    let y = TestNode::new();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let responder = async {
        let (socket, _) = listener.accept().await.unwrap();
        let (reader, writer) = socket.into_split();
        let mut stream = LineClaimStream::new(reader, writer);
        x.signer.handle_claim_node(&mut stream, y.node_id()).await
    };
    let initiator = async {
        let socket = TcpStream::connect(addr).await.unwrap();
        let (reader, writer) = socket.into_split();
        let mut stream = LineClaimStream::new(reader, writer);
        y.signer.claim_node(&mut stream, x.node_id()).await
    };

    let (initiated, answered) = tokio::join!(initiator, responder);
    let (_, y_claim) = initiated.unwrap();
    let (_, x_claim) = answered.unwrap();

    assert_eq!(y_claim.payload().kind, ClaimKind::link_node(y.node_id(), x.node_id()));
    assert_eq!(x_claim.payload().kind, ClaimKind::link_node(x.node_id(), y.node_id()));
    assert_eq!(x.chain_len(), 1);
    assert_eq!(y.chain_len(), 1);

    x.cleanup();
    y.cleanup();
}

#[tokio::test]
async fn test_separate_gestalts_until_bridged() {
    init_tracing();
    let nodes: Vec<TestNode> = (0..4).map(|_| TestNode::new()).collect();
    let g = graph();

    let (_, left) = cross_sign(&nodes[0], &nodes[1]).await;
    let (_, right) = cross_sign(&nodes[2], &nodes[3]).await;
    g.link_node_and_node(&nodes[1].info(), &nodes[0].info(), &GestaltLinkNode { claim: left })
        .unwrap();
    g.link_node_and_node(&nodes[3].info(), &nodes[2].info(), &GestaltLinkNode { claim: right })
        .unwrap();
    g.set_gestalt_action_by_node(&nodes[0].node_id(), GestaltAction::Scan).unwrap();
    g.set_gestalt_action_by_node(&nodes[3].node_id(), GestaltAction::Notify).unwrap();
    assert_eq!(g.get_gestalts().count(), 2);

    let (_, bridge) = cross_sign(&nodes[1], &nodes[2]).await;
    g.link_node_and_node(&nodes[2].info(), &nodes[1].info(), &GestaltLinkNode { claim: bridge })
        .unwrap();

    assert_eq!(g.get_gestalts().count(), 1);
    let actions = g.get_gestalt_actions_by_node(&nodes[0].node_id()).unwrap();
    assert!(actions.contains(&GestaltAction::Scan));
    assert!(actions.contains(&GestaltAction::Notify));
    assert_eq!(nodes[1].chain_len(), 2);
    assert_eq!(nodes[2].chain_len(), 2);

    for node in &nodes {
        node.cleanup();
    }
}
