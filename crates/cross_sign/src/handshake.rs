//! Interactive cross-signing of node link claims.
//!
//! Produces one `ClaimLinkNode` in each party's own chain, both signed by
//! both parties. Each side's claim is issued by itself and names the other
//! as subject.
//!
//! # Protocol Flow
//!
//! 1. Initiator → Responder: initiator's claim, signed by the initiator
//! 2. Responder → Initiator: the same claim, co-signed by the responder
//! 3. Responder → Initiator: responder's claim, signed by the responder
//! 4. Initiator → Responder: responder's claim, co-signed; initiator commits
//!    its own claim and closes the channel (a close failure after the commit
//!    is logged, not reported)
//! 5. Responder sees the close and commits its own claim
//!
//! Each side holds its chain's append lock from preparing its claim until
//! it commits or the handshake fails. A failure at any step commits nothing
//! on the failing side and sends an abort to the peer.
//!
//! # Timing Constraints
//!
//! - Every receive is bounded by the step timeout
//! - The whole session is bounded by the total timeout
//! - Dropping the session future releases the lock without committing

use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use trellis_core::config::HandshakeConfig;
use trellis_core::NodeId;
use trellis_crypto::{ClaimId, KeyManager};
use trellis_sigchain::{ClaimKind, Sigchain, SignedClaim};

use crate::error::{HandshakeError, Result};
use crate::stream::{ClaimStream, CrossSignMessage};

/// Runs cross-sign sessions against one local sigchain.
pub struct CrossSigner<K: KeyManager> {
    sigchain: Arc<Sigchain<K>>,
    step_timeout: Duration,
    total_timeout: Duration,
}

impl<K: KeyManager> CrossSigner<K> {
    pub fn new(sigchain: Arc<Sigchain<K>>, config: &HandshakeConfig) -> Self {
        Self {
            sigchain,
            step_timeout: config.step_timeout(),
            total_timeout: config.total_timeout(),
        }
    }

    pub fn with_timeouts(sigchain: Arc<Sigchain<K>>, step: Duration, total: Duration) -> Self {
        Self {
            sigchain,
            step_timeout: step,
            total_timeout: total,
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.sigchain.node_id()
    }

    pub fn sigchain(&self) -> &Arc<Sigchain<K>> {
        &self.sigchain
    }

    /// Initiate a cross-sign session claiming `target`.
    ///
    /// Returns the claim committed to the local chain.
    pub async fn claim_node<S>(&self, stream: &mut S, target: NodeId) -> Result<(ClaimId, SignedClaim)>
    where
        S: ClaimStream + ?Sized,
    {
        info!(node_id = %self.node_id(), target = %target, "Starting cross-sign handshake");
        let outcome = timeout(self.total_timeout, self.run_initiator(stream, target)).await;
        let committed = self.conclude(stream, target, outcome).await?;

        // The claim is on the chain now; a failed close cannot undo that.
        match timeout(self.step_timeout, stream.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(peer = %target, error = %e, "Could not close channel after commit"),
            Err(_) => warn!(peer = %target, "Timed out closing channel after commit"),
        }
        Ok(committed)
    }

    /// Answer a cross-sign session opened by `requesting`.
    pub async fn handle_claim_node<S>(
        &self,
        stream: &mut S,
        requesting: NodeId,
    ) -> Result<(ClaimId, SignedClaim)>
    where
        S: ClaimStream + ?Sized,
    {
        info!(node_id = %self.node_id(), peer = %requesting, "Answering cross-sign handshake");
        let outcome = timeout(self.total_timeout, self.run_responder(stream, requesting)).await;
        self.conclude(stream, requesting, outcome).await
    }

    async fn conclude<S>(
        &self,
        stream: &mut S,
        peer: NodeId,
        outcome: std::result::Result<Result<(ClaimId, SignedClaim)>, tokio::time::error::Elapsed>,
    ) -> Result<(ClaimId, SignedClaim)>
    where
        S: ClaimStream + ?Sized,
    {
        let error = match outcome {
            Ok(Ok((claim_id, token))) => {
                info!(
                    node_id = %self.node_id(),
                    peer = %peer,
                    claim_id = %claim_id,
                    seq = token.payload().seq,
                    "Cross-sign handshake completed"
                );
                return Ok((claim_id, token));
            }
            Ok(Err(e)) => e,
            Err(_) => HandshakeError::Timeout { step: "handshake" },
        };

        warn!(
            node_id = %self.node_id(),
            peer = %peer,
            error = %error,
            untrusted = error.is_untrusted(),
            "Cross-sign handshake failed"
        );
        if error.notify_peer() {
            if let Err(e) = stream.abort(&error.to_string()).await {
                debug!(error = %e, "Could not deliver abort to peer");
            }
        }
        Err(error)
    }

    async fn run_initiator<S>(&self, stream: &mut S, target: NodeId) -> Result<(ClaimId, SignedClaim)>
    where
        S: ClaimStream + ?Sized,
    {
        let me = self.node_id();
        if target == me {
            return Err(HandshakeError::UnexpectedClaim(
                "a node cannot cross-sign with itself".to_string(),
            ));
        }

        let mut guard = self.sigchain.begin_append().await;
        let ours = guard.prepare(ClaimKind::link_node(me, target), None)?;
        stream.send(CrossSignMessage::from_token(&ours)?).await?;
        debug!(seq = ours.payload().seq, "Sent intermediary claim");

        let doubly = self.recv_token(stream, "co-signed claim").await?;
        if doubly.payload() != ours.payload() {
            return Err(HandshakeError::UnexpectedClaim(
                "co-signed claim differs from the claim sent".to_string(),
            ));
        }
        require_signature(&doubly, &me)?;
        require_signature(&doubly, &target)?;

        let mut theirs = self.recv_token(stream, "peer intermediary claim").await?;
        expect_link(&theirs, target, me)?;
        require_signature(&theirs, &target)?;
        self.sigchain.co_sign(&mut theirs)?;
        stream.send(CrossSignMessage::from_token(&theirs)?).await?;
        debug!("Returned co-signed peer claim");

        Ok(guard.commit(doubly)?)
    }

    async fn run_responder<S>(
        &self,
        stream: &mut S,
        requesting: NodeId,
    ) -> Result<(ClaimId, SignedClaim)>
    where
        S: ClaimStream + ?Sized,
    {
        let me = self.node_id();

        let mut theirs = self.recv_token(stream, "peer intermediary claim").await?;
        expect_link(&theirs, requesting, me)?;
        require_signature(&theirs, &requesting)?;

        let mut guard = self.sigchain.begin_append().await;
        self.sigchain.co_sign(&mut theirs)?;
        stream.send(CrossSignMessage::from_token(&theirs)?).await?;
        debug!("Returned co-signed peer claim");

        let ours = guard.prepare(ClaimKind::link_node(me, requesting), None)?;
        stream.send(CrossSignMessage::from_token(&ours)?).await?;
        debug!(seq = ours.payload().seq, "Sent intermediary claim");

        let doubly = self.recv_token(stream, "co-signed claim").await?;
        if doubly.payload() != ours.payload() {
            return Err(HandshakeError::UnexpectedClaim(
                "co-signed claim differs from the claim sent".to_string(),
            ));
        }
        require_signature(&doubly, &me)?;
        require_signature(&doubly, &requesting)?;

        if self.recv_step(stream, "close").await?.is_some() {
            return Err(HandshakeError::ProtocolViolation(
                "message received after the final claim".to_string(),
            ));
        }

        Ok(guard.commit(doubly)?)
    }

    async fn recv_step<S>(&self, stream: &mut S, step: &'static str) -> Result<Option<CrossSignMessage>>
    where
        S: ClaimStream + ?Sized,
    {
        timeout(self.step_timeout, stream.recv())
            .await
            .map_err(|_| HandshakeError::Timeout { step })?
    }

    async fn recv_token<S>(&self, stream: &mut S, step: &'static str) -> Result<SignedClaim>
    where
        S: ClaimStream + ?Sized,
    {
        match self.recv_step(stream, step).await? {
            Some(message) => message.decode_token(),
            None => Err(HandshakeError::ChannelClosed),
        }
    }
}

fn expect_link(token: &SignedClaim, iss: NodeId, sub: NodeId) -> Result<()> {
    match &token.payload().kind {
        ClaimKind::LinkNode(link) if link.iss == iss && link.sub == sub => Ok(()),
        ClaimKind::LinkNode(link) => Err(HandshakeError::UnexpectedClaim(format!(
            "link {} -> {} where {} -> {} was expected",
            link.iss, link.sub, iss, sub
        ))),
        other => Err(HandshakeError::UnexpectedClaim(format!(
            "expected ClaimLinkNode, got {}",
            other.typ()
        ))),
    }
}

fn require_signature(token: &SignedClaim, node_id: &NodeId) -> Result<()> {
    if token.verify_with_public_key(node_id) {
        Ok(())
    } else {
        Err(HandshakeError::VerificationFailed { node_id: *node_id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::MemoryClaimStream;
    use async_trait::async_trait;
    use trellis_core::config::SigchainConfig;
    use trellis_core::Store;
    use trellis_crypto::{KeyPair, Token};

    fn signer(step_ms: u64) -> CrossSigner<KeyPair> {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let chain = Sigchain::open(
            store,
            Arc::new(KeyPair::generate()),
            &SigchainConfig { page_size: 16 },
        )
        .unwrap();
        CrossSigner::with_timeouts(
            Arc::new(chain),
            Duration::from_millis(step_ms),
            Duration::from_millis(step_ms * 10),
        )
    }

    fn chain_len(signer: &CrossSigner<KeyPair>) -> u64 {
        signer.sigchain().len().unwrap()
    }

    #[tokio::test]
    async fn test_handshake_links_both_chains() {
        let y = signer(1_000);
        let x = signer(1_000);
        let (mut ys, mut xs) = MemoryClaimStream::pair();

        let (y_result, x_result) = tokio::join!(
            y.claim_node(&mut ys, x.node_id()),
            x.handle_claim_node(&mut xs, y.node_id()),
        );
        let (y_id, y_claim) = y_result.unwrap();
        let (x_id, x_claim) = x_result.unwrap();

        for (claim, owner, peer) in [
            (&y_claim, y.node_id(), x.node_id()),
            (&x_claim, x.node_id(), y.node_id()),
        ] {
            assert_eq!(claim.payload().seq, 1);
            assert_eq!(claim.payload().kind, ClaimKind::link_node(owner, peer));
            assert!(claim.verify_with_public_key(&owner));
            assert!(claim.verify_with_public_key(&peer));
        }

        assert_eq!(y.sigchain().get_last_claim_id().unwrap(), Some(y_id));
        assert_eq!(x.sigchain().get_last_claim_id().unwrap(), Some(x_id));
        assert_eq!(y.sigchain().verify_chain().unwrap(), 1);
        assert_eq!(x.sigchain().verify_chain().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_responder_rejects_empty_message() {
        let x = signer(1_000);
        let (mut peer, mut xs) = MemoryClaimStream::pair();

        peer.send(CrossSignMessage::default()).await.unwrap();
        let err = x
            .handle_claim_node(&mut xs, KeyPair::generate().node_id())
            .await
            .unwrap_err();

        assert!(matches!(err, HandshakeError::MalformedMessage(_)));
        assert!(err.is_untrusted());
        assert_eq!(chain_len(&x), 0);
        assert!(matches!(peer.recv().await, Err(HandshakeError::Remote(_))));
    }

    #[tokio::test]
    async fn test_responder_rejects_wrong_subject() {
        let x = signer(1_000);
        let y_keys = KeyPair::generate();
        let (mut peer, mut xs) = MemoryClaimStream::pair();

        let y_chain = Sigchain::open(
            Arc::new(Store::open_in_memory().unwrap()),
            Arc::new(y_keys.clone()),
            &SigchainConfig { page_size: 16 },
        )
        .unwrap();
        let mut guard = y_chain.begin_append().await;
        let elsewhere = KeyPair::generate().node_id();
        let claim = guard
            .prepare(ClaimKind::link_node(y_keys.node_id(), elsewhere), None)
            .unwrap();
        peer.send(CrossSignMessage::from_token(&claim).unwrap()).await.unwrap();

        let err = x
            .handle_claim_node(&mut xs, y_keys.node_id())
            .await
            .unwrap_err();
        assert!(matches!(err, HandshakeError::UnexpectedClaim(_)));
        assert_eq!(chain_len(&x), 0);
    }

    #[tokio::test]
    async fn test_responder_rejects_forged_signature() {
        let x = signer(1_000);
        let claimed = KeyPair::generate();
        let forger = KeyPair::generate();
        let (mut peer, mut xs) = MemoryClaimStream::pair();

        let template = {
            let chain = Sigchain::open(
                Arc::new(Store::open_in_memory().unwrap()),
                Arc::new(claimed.clone()),
                &SigchainConfig { page_size: 16 },
            )
            .unwrap();
            let mut guard = chain.begin_append().await;
            guard
                .prepare(ClaimKind::link_node(claimed.node_id(), x.node_id()), None)
                .unwrap()
        };
        let mut forged = Token::from_payload(template.into_payload());
        forged.sign_with(&forger).unwrap();
        peer.send(CrossSignMessage::from_token(&forged).unwrap()).await.unwrap();

        let err = x
            .handle_claim_node(&mut xs, claimed.node_id())
            .await
            .unwrap_err();
        assert!(matches!(err, HandshakeError::VerificationFailed { .. }));
        assert_eq!(chain_len(&x), 0);
    }

    #[tokio::test]
    async fn test_responder_times_out_without_commit() {
        let y = signer(50);
        let x = signer(50);
        let (mut ys, mut xs) = MemoryClaimStream::pair();

        // Initiator sends step 1 then goes silent.
        let mut guard = y.sigchain().begin_append().await;
        let claim = guard
            .prepare(ClaimKind::link_node(y.node_id(), x.node_id()), None)
            .unwrap();
        ys.send(CrossSignMessage::from_token(&claim).unwrap()).await.unwrap();

        let err = x.handle_claim_node(&mut xs, y.node_id()).await.unwrap_err();
        assert!(matches!(err, HandshakeError::Timeout { .. }));
        assert!(!err.is_untrusted());
        assert_eq!(chain_len(&x), 0);

        // Lock was released.
        x.sigchain()
            .add_claim(ClaimKind::link_node(x.node_id(), y.node_id()), None)
            .await
            .unwrap();
        drop(guard);
    }

    #[tokio::test]
    async fn test_cancelled_initiator_leaves_chain_unchanged() {
        let y = signer(1_000);
        let x_id = KeyPair::generate().node_id();
        let (mut ys, _silent_peer) = MemoryClaimStream::pair();

        let cancelled =
            tokio::time::timeout(Duration::from_millis(30), y.claim_node(&mut ys, x_id)).await;
        assert!(cancelled.is_err());
        assert_eq!(chain_len(&y), 0);

        let (_, token) = y
            .sigchain()
            .add_claim(ClaimKind::link_node(y.node_id(), x_id), None)
            .await
            .unwrap();
        assert_eq!(token.payload().seq, 1);
    }

    #[tokio::test]
    async fn test_responder_rejects_extra_message_after_final_claim() {
        let y = signer(1_000);
        let x = signer(1_000);
        let (mut ys, mut xs) = MemoryClaimStream::pair();

        let rogue_initiator = async {
            let mut guard = y.sigchain().begin_append().await;
            let ours = guard
                .prepare(ClaimKind::link_node(y.node_id(), x.node_id()), None)
                .unwrap();
            ys.send(CrossSignMessage::from_token(&ours).unwrap()).await.unwrap();
            let _doubly = ys.recv().await.unwrap().unwrap();
            let mut theirs = ys.recv().await.unwrap().unwrap().decode_token().unwrap();
            y.sigchain().co_sign(&mut theirs).unwrap();
            let reply = CrossSignMessage::from_token(&theirs).unwrap();
            ys.send(reply.clone()).await.unwrap();
            ys.send(reply).await.unwrap();
            ys.recv().await
        };

        let (rogue_outcome, x_result) =
            tokio::join!(rogue_initiator, x.handle_claim_node(&mut xs, y.node_id()));
        assert!(matches!(x_result, Err(HandshakeError::ProtocolViolation(_))));
        assert!(matches!(rogue_outcome, Err(HandshakeError::Remote(_))));
        assert_eq!(chain_len(&x), 0);
    }

    #[tokio::test]
    async fn test_initiator_aborted_by_peer() {
        let y = signer(1_000);
        let (mut ys, mut peer) = MemoryClaimStream::pair();

        let x_id = KeyPair::generate().node_id();
        let refusing_peer = async {
            let _ = peer.recv().await;
            peer.abort("not interested").await.unwrap();
        };
        let (result, ()) = tokio::join!(y.claim_node(&mut ys, x_id), refusing_peer);

        match result {
            Err(HandshakeError::Remote(reason)) => assert_eq!(reason, "not interested"),
            other => panic!("unexpected {:?}", other.map(|(id, _)| id)),
        }
        assert_eq!(chain_len(&y), 0);
    }

    #[tokio::test]
    async fn test_concurrent_sessions_serialize_on_the_lock() {
        let x = signer(1_000);
        let a = signer(1_000);
        let b = signer(1_000);
        let (mut a_stream, mut xa) = MemoryClaimStream::pair();
        let (mut b_stream, mut xb) = MemoryClaimStream::pair();

        let (ra, xra, rb, xrb) = tokio::join!(
            a.claim_node(&mut a_stream, x.node_id()),
            x.handle_claim_node(&mut xa, a.node_id()),
            b.claim_node(&mut b_stream, x.node_id()),
            x.handle_claim_node(&mut xb, b.node_id()),
        );
        ra.unwrap();
        rb.unwrap();
        let mut seqs = vec![xra.unwrap().1.payload().seq, xrb.unwrap().1.payload().seq];
        seqs.sort();
        assert_eq!(seqs, vec![1, 2]);
        assert_eq!(x.sigchain().verify_chain().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_self_claim_is_refused() {
        let y = signer(1_000);
        let (mut ys, _peer) = MemoryClaimStream::pair();
        let err = y.claim_node(&mut ys, y.node_id()).await.unwrap_err();
        assert!(matches!(err, HandshakeError::UnexpectedClaim(_)));
        assert_eq!(chain_len(&y), 0);
    }

    /// Delivers everything but reports a broken pipe on close.
    struct BrokenClose(MemoryClaimStream);

    #[async_trait]
    impl ClaimStream for BrokenClose {
        async fn send(&mut self, message: CrossSignMessage) -> Result<()> {
            self.0.send(message).await
        }

        async fn recv(&mut self) -> Result<Option<CrossSignMessage>> {
            self.0.recv().await
        }

        async fn close(&mut self) -> Result<()> {
            self.0.close().await?;
            Err(HandshakeError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "reset",
            )))
        }

        async fn abort(&mut self, reason: &str) -> Result<()> {
            self.0.abort(reason).await
        }
    }

    #[tokio::test]
    async fn test_initiator_reports_commit_when_close_fails() {
        let y = signer(1_000);
        let x = signer(1_000);
        let (ys, mut xs) = MemoryClaimStream::pair();
        let mut ys = BrokenClose(ys);

        let (y_result, x_result) = tokio::join!(
            y.claim_node(&mut ys, x.node_id()),
            x.handle_claim_node(&mut xs, y.node_id()),
        );
        let (y_id, _) = y_result.unwrap();
        x_result.unwrap();

        assert_eq!(y.sigchain().get_last_claim_id().unwrap(), Some(y_id));
        assert_eq!(chain_len(&y), 1);
        assert_eq!(chain_len(&x), 1);
    }
}
