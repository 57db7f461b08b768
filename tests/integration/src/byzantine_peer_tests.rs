//! Misbehaving peer tests
//!
//! A peer that replays, tampers with, or omits handshake messages must be
//! rejected with an explicit error and must never cause a commit.

use std::sync::Arc;
use trellis_core::Store;
use trellis_cross_sign::{ClaimStream, CrossSignMessage, HandshakeError, MemoryClaimStream};
use trellis_crypto::Token;
use trellis_gestalt::{GestaltError, GestaltGraph, GestaltLinkNode};
use trellis_sigchain::ClaimKind;

use crate::test_utils::{cross_sign, init_tracing, TestNode};

#[tokio::test]
async fn test_replayed_claim_commits_nothing() {
    init_tracing();
    let x = TestNode::new();
    let y = TestNode::new();
    let (y_claim, _) = cross_sign(&y, &x).await;
    assert_eq!(x.chain_len(), 1);

    // Replay Y's committed claim as the opening message of a new session.
    let (mut rogue, mut xs) = MemoryClaimStream::pair();
    rogue.send(CrossSignMessage::from_token(&y_claim).unwrap()).await.unwrap();

    let replay = async {
        let _cosigned = rogue.recv().await.unwrap();
        let _intermediary = rogue.recv().await.unwrap();
        rogue.close().await.unwrap();
    };
    let ((), result) = tokio::join!(replay, x.signer.handle_claim_node(&mut xs, y.node_id()));

    assert!(matches!(result, Err(HandshakeError::ChannelClosed)));
    assert_eq!(x.chain_len(), 1);
    assert_eq!(x.chain.verify_chain().unwrap(), 1);

    x.cleanup();
    y.cleanup();
}

#[tokio::test]
async fn test_tampered_cosignature_is_rejected() {
    init_tracing();
    let x = TestNode::new();
    let y = TestNode::new();
    let (mut ys, mut rogue) = MemoryClaimStream::pair();

    let tamper = async {
        let opening = rogue.recv().await.unwrap().unwrap().decode_token().unwrap();
        let mut claim = opening.into_payload();
        claim.seq += 1;
        let mut forged = Token::from_payload(claim);
        x.chain.co_sign(&mut forged).unwrap();
        rogue.send(CrossSignMessage::from_token(&forged).unwrap()).await.unwrap();
        rogue.recv().await
    };
    let (result, rogue_outcome) = tokio::join!(y.signer.claim_node(&mut ys, x.node_id()), tamper);

    let err = result.unwrap_err();
    assert!(matches!(err, HandshakeError::UnexpectedClaim(_)));
    assert!(err.is_untrusted());
    assert!(matches!(rogue_outcome, Err(HandshakeError::Remote(_))));
    assert_eq!(y.chain_len(), 0);

    // The append lock was released.
    y.chain
        .add_claim(ClaimKind::link_node(y.node_id(), x.node_id()), None)
        .await
        .unwrap();

    x.cleanup();
    y.cleanup();
}

#[tokio::test]
async fn test_empty_step_two_message_is_rejected() {
    init_tracing();
    let x = TestNode::new();
    let y = TestNode::new();
    let (mut ys, mut rogue) = MemoryClaimStream::pair();

    let silent = async {
        let _opening = rogue.recv().await.unwrap();
        rogue.send(CrossSignMessage::default()).await.unwrap();
        rogue.recv().await
    };
    let (result, rogue_outcome) = tokio::join!(y.signer.claim_node(&mut ys, x.node_id()), silent);

    assert!(matches!(result, Err(HandshakeError::MalformedMessage(_))));
    assert!(matches!(rogue_outcome, Err(HandshakeError::Remote(_))));
    assert_eq!(y.chain_len(), 0);

    x.cleanup();
    y.cleanup();
}

#[tokio::test]
async fn test_graph_refuses_claim_for_another_edge() {
    init_tracing();
    let x = TestNode::new();
    let y = TestNode::new();
    let z = TestNode::new();
    let (_, x_claim) = cross_sign(&y, &x).await;

    let g = GestaltGraph::new(Arc::new(Store::open_in_memory().unwrap()));
    let err = g
        .link_node_and_node(&x.info(), &z.info(), &GestaltLinkNode { claim: x_claim })
        .unwrap_err();
    assert!(matches!(err, GestaltError::EvidenceMismatch(_)));
    assert!(err.is_untrusted());
    assert!(g.get_nodes().unwrap().is_empty());

    for node in [&x, &y, &z] {
        node.cleanup();
    }
}
