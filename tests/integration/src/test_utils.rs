//! Test utilities for cross-crate integration tests

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use trellis_core::config::SigchainConfig;
use trellis_core::{NodeId, Store};
use trellis_cross_sign::{CrossSigner, MemoryClaimStream};
use trellis_crypto::{KeyManager, KeyPair};
use trellis_gestalt::NodeInfo;
use trellis_sigchain::{Sigchain, SignedClaim};

/// Initialize tracing only if not already initialized
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt::try_init();
}

/// A node with its own key, on-disk store and sigchain
pub struct TestNode {
    pub keys: Arc<KeyPair>,
    pub store: Arc<Store>,
    pub chain: Arc<Sigchain<KeyPair>>,
    pub signer: CrossSigner<KeyPair>,
    pub db_path: PathBuf,
}

impl TestNode {
    /// Create a node with a fresh key and an empty temporary database
    pub fn new() -> Self {
        let db_path = std::env::temp_dir().join(format!("test_trellis_{}.db", uuid::Uuid::new_v4()));
        Self::open(Arc::new(KeyPair::generate()), db_path)
    }

    fn open(keys: Arc<KeyPair>, db_path: PathBuf) -> Self {
        let store = Arc::new(Store::open(&db_path).expect("Failed to open store"));
        let chain = Arc::new(
            Sigchain::open(Arc::clone(&store), Arc::clone(&keys), &SigchainConfig { page_size: 4 })
                .expect("Failed to open sigchain"),
        );
        let signer = CrossSigner::with_timeouts(
            Arc::clone(&chain),
            Duration::from_millis(500),
            Duration::from_secs(5),
        );
        Self {
            keys,
            store,
            chain,
            signer,
            db_path,
        }
    }

    /// Open the same database and key again, as after a restart
    pub fn reopen(&self) -> Self {
        Self::open(Arc::clone(&self.keys), self.db_path.clone())
    }

    pub fn node_id(&self) -> NodeId {
        self.keys.node_id()
    }

    pub fn info(&self) -> NodeInfo {
        NodeInfo::new(self.node_id())
    }

    pub fn chain_len(&self) -> u64 {
        self.chain.len().expect("Failed to read chain length")
    }

    /// Remove the database files
    pub fn cleanup(&self) {
        for suffix in ["", "-wal", "-shm"] {
            let mut path = self.db_path.clone().into_os_string();
            path.push(suffix);
            std::fs::remove_file(path).ok();
        }
    }
}

impl Default for TestNode {
    fn default() -> Self {
        Self::new()
    }
}

/// Run a complete handshake with `initiator` claiming `responder`.
///
/// Returns the claims committed by initiator and responder.
pub async fn cross_sign(initiator: &TestNode, responder: &TestNode) -> (SignedClaim, SignedClaim) {
    let (mut initiator_stream, mut responder_stream) = MemoryClaimStream::pair();
    let (initiated, answered) = tokio::join!(
        initiator
            .signer
            .claim_node(&mut initiator_stream, responder.node_id()),
        responder
            .signer
            .handle_claim_node(&mut responder_stream, initiator.node_id()),
    );
    (
        initiated.expect("Initiator failed").1,
        answered.expect("Responder failed").1,
    )
}
