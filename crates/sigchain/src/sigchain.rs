//! Per-node append-only claim chain.
//!
//! Each local node identity owns one chain of signed claims, persisted in the
//! shared store under `["sigchain", <node>]`:
//! - `claims/<seq>`: the claim's signed token
//! - `ids/<claim id>`: seq index
//! - `meta/tail`: seq, id and digest of the last claim
//!
//! # Guarantees
//!
//! - `seq` starts at 1 and increases by exactly 1
//! - every claim links to its predecessor by claim id and digest
//! - appends are serialized by an exclusive per-chain lock
//! - an append either persists entry, index and tail together or nothing
//!
//! # Two-phase append
//!
//! [`Sigchain::begin_append`] takes the lock and returns an [`AppendGuard`].
//! The guard prepares a draft with `seq` and back-links filled in and signed
//! by the local key. Other parties may add signatures to the draft before
//! [`AppendGuard::commit`] persists it. Dropping the guard without committing
//! releases the lock and leaves the chain untouched.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, info};
use trellis_core::config::SigchainConfig;
use trellis_core::{KeyPath, NodeId, Segment, Store, StoreError, StoreTx};
use trellis_crypto::{ClaimId, ClaimIdGenerator, Digest, KeyManager, SignedToken, Token};

use crate::claims::{claim_digest, Claim, ClaimKind, SignedClaim};
use crate::error::{Result, SigchainError};

/// Position of the last claim in a chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainTail {
    pub seq: u64,
    pub claim_id: ClaimId,
    pub digest: Digest,
}

#[derive(Debug, Clone)]
struct ChainLayout {
    root: KeyPath,
}

impl ChainLayout {
    fn new(node_id: &NodeId) -> Self {
        Self {
            root: KeyPath::of(&["sigchain"]).push(node_id.encode()),
        }
    }

    fn claims(&self) -> KeyPath {
        self.root.clone().push("claims")
    }

    fn claim(&self, seq: u64) -> KeyPath {
        self.claims().push_u64(seq)
    }

    fn id(&self, claim_id: &ClaimId) -> KeyPath {
        self.root.clone().push("ids").push(claim_id.encode())
    }

    fn tail(&self) -> KeyPath {
        self.root.clone().push("meta").push("tail")
    }
}

fn read_tail(tx: &StoreTx<'_>, layout: &ChainLayout) -> trellis_core::Result<Option<ChainTail>> {
    tx.get_json(&layout.tail())
}

fn decode_entry(bytes: &[u8]) -> Result<SignedClaim> {
    let signed: SignedToken = serde_json::from_slice(bytes).map_err(StoreError::from)?;
    Ok(Token::from_signed(&signed)?)
}

fn unix_now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub struct Sigchain<K: KeyManager> {
    node_id: NodeId,
    keys: Arc<K>,
    store: Arc<Store>,
    layout: ChainLayout,
    page_size: usize,
    append_lock: Arc<Mutex<ClaimIdGenerator>>,
}

impl<K: KeyManager> Sigchain<K> {
    /// Open the chain owned by `keys`, running a continuity check first.
    pub fn open(store: Arc<Store>, keys: Arc<K>, config: &SigchainConfig) -> Result<Self> {
        let node_id = keys.node_id();
        let layout = ChainLayout::new(&node_id);

        let tail = store.transaction(|tx| read_tail(tx, &layout))?;
        let generator = match &tail {
            Some(tail) => ClaimIdGenerator::resume_after(&node_id, &tail.claim_id),
            None => ClaimIdGenerator::new(&node_id),
        };

        let sigchain = Self {
            node_id,
            keys,
            store,
            layout,
            page_size: config.page_size.max(1),
            append_lock: Arc::new(Mutex::new(generator)),
        };

        let count = sigchain.verify_chain()?;
        info!(node_id = %sigchain.node_id, claims = count, "Sigchain opened");

        Ok(sigchain)
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn key_manager(&self) -> &K {
        &self.keys
    }

    /// Adds the local signature to a token produced by someone else.
    pub fn co_sign(&self, token: &mut SignedClaim) -> Result<()> {
        token.sign_with(self.keys.as_ref())?;
        Ok(())
    }

    /// Acquire the exclusive append lock.
    ///
    /// Waits (does not fail) while another append is in flight.
    pub async fn begin_append(&self) -> AppendGuard<K> {
        let generator = Arc::clone(&self.append_lock).lock_owned().await;
        debug!(node_id = %self.node_id, "Sigchain append lock acquired");
        AppendGuard {
            generator,
            node_id: self.node_id,
            keys: Arc::clone(&self.keys),
            store: Arc::clone(&self.store),
            layout: self.layout.clone(),
            draft: None,
        }
    }

    /// Append a claim signed only by the local key.
    pub async fn add_claim(
        &self,
        kind: ClaimKind,
        timestamp: Option<u64>,
    ) -> Result<(ClaimId, SignedClaim)> {
        let mut guard = self.begin_append().await;
        let token = guard.prepare(kind, timestamp)?;
        guard.commit(token)
    }

    /// Lazy iterator over the whole chain, oldest first.
    pub fn get_claims(&self) -> ClaimCursor {
        self.get_claims_from(1)
    }

    /// Lazy iterator starting at `seq` (inclusive).
    pub fn get_claims_from(&self, seq: u64) -> ClaimCursor {
        ClaimCursor::new(
            Arc::clone(&self.store),
            self.layout.claims(),
            seq,
            self.page_size,
        )
    }

    pub fn get_claim(&self, claim_id: &ClaimId) -> Result<Option<SignedClaim>> {
        let entry = self.store.transaction(|tx| {
            let seq: Option<u64> = tx.get_json(&self.layout.id(claim_id))?;
            match seq {
                Some(seq) => tx.get(&self.layout.claim(seq)),
                None => Ok(None),
            }
        })?;
        entry.as_deref().map(decode_entry).transpose()
    }

    pub fn get_last_claim(&self) -> Result<Option<(ClaimId, SignedClaim)>> {
        let entry = self.store.transaction(|tx| match read_tail(tx, &self.layout)? {
            Some(tail) => Ok(tx
                .get(&self.layout.claim(tail.seq))?
                .map(|bytes| (tail.claim_id, bytes))),
            None => Ok::<_, StoreError>(None),
        })?;
        match entry {
            Some((claim_id, bytes)) => Ok(Some((claim_id, decode_entry(&bytes)?))),
            None => Ok(None),
        }
    }

    pub fn get_tail(&self) -> Result<Option<ChainTail>> {
        Ok(self.store.transaction(|tx| read_tail(tx, &self.layout))?)
    }

    /// Sequence number of the last claim, 0 for an empty chain.
    pub fn get_last_sequence_number(&self) -> Result<u64> {
        Ok(self.get_tail()?.map_or(0, |tail| tail.seq))
    }

    pub fn get_last_claim_id(&self) -> Result<Option<ClaimId>> {
        Ok(self.get_tail()?.map(|tail| tail.claim_id))
    }

    pub fn len(&self) -> Result<u64> {
        self.get_last_sequence_number()
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Full continuity check of the stored chain.
    ///
    /// Returns the number of claims, or the first violation found.
    pub fn verify_chain(&self) -> Result<u64> {
        let result = verify_claims(&self.node_id, self.get_claims());
        match &result {
            Ok(count) => debug!(node_id = %self.node_id, claims = count, "Sigchain continuity check passed"),
            Err(e) => error!(node_id = %self.node_id, error = %e, "Sigchain corruption detected"),
        }
        let count = result?;

        let tail_seq = self.get_last_sequence_number()?;
        if tail_seq != count {
            return Err(SigchainError::CorruptChain {
                seq: tail_seq,
                reason: format!("tail records seq {} but chain holds {} claims", tail_seq, count),
            });
        }
        Ok(count)
    }
}

/// Verifies a sequence of claims as the complete chain of `owner`.
///
/// Checks gap-free `seq` from 1, increasing claim ids, id and digest
/// back-links, issuer, and the owner's signature on every claim. Usable on
/// chain data fetched from a remote node.
pub fn verify_claims<I>(owner: &NodeId, claims: I) -> Result<u64>
where
    I: IntoIterator<Item = Result<(ClaimId, SignedClaim)>>,
{
    let mut expected_seq = 1u64;
    let mut prev: Option<(ClaimId, Digest)> = None;

    for item in claims {
        let (claim_id, token) = item?;
        let claim = token.payload();
        let corrupt = |reason: String| SigchainError::CorruptChain {
            seq: claim.seq,
            reason,
        };

        if claim.seq != expected_seq {
            return Err(corrupt(format!("expected seq {}", expected_seq)));
        }
        if claim.jti != claim_id {
            return Err(corrupt("claim id does not match its index".to_string()));
        }
        if claim.issuer() != *owner {
            return Err(corrupt(format!("issuer {} is not {}", claim.issuer(), owner)));
        }
        if let Some((prev_id, _)) = prev {
            if claim.jti <= prev_id {
                return Err(corrupt("claim id is not after its predecessor".to_string()));
            }
        }
        if claim.prev_claim_id != prev.map(|(id, _)| id) {
            return Err(corrupt("prevClaimId does not match predecessor".to_string()));
        }
        if claim.prev_digest != prev.map(|(_, digest)| digest) {
            return Err(corrupt("prevDigest does not match predecessor".to_string()));
        }
        if !token.verify_with_public_key(owner) {
            return Err(corrupt("owner signature does not verify".to_string()));
        }

        prev = Some((claim.jti, claim_digest(&token)?));
        expected_seq += 1;
    }

    Ok(expected_seq - 1)
}

/// Exclusive right to append one claim.
///
/// Holds the chain lock until committed or dropped.
pub struct AppendGuard<K: KeyManager> {
    generator: OwnedMutexGuard<ClaimIdGenerator>,
    node_id: NodeId,
    keys: Arc<K>,
    store: Arc<Store>,
    layout: ChainLayout,
    draft: Option<Claim>,
}

impl<K: KeyManager> AppendGuard<K> {
    /// Build the next claim from the current tail and sign it locally.
    ///
    /// `timestamp` (unix seconds) defaults to now.
    pub fn prepare(&mut self, kind: ClaimKind, timestamp: Option<u64>) -> Result<SignedClaim> {
        if kind.issuer() != self.node_id {
            return Err(SigchainError::InvalidClaim(format!(
                "issuer {} is not the chain owner {}",
                kind.issuer(),
                self.node_id
            )));
        }

        let tail = self.store.transaction(|tx| read_tail(tx, &self.layout))?;
        let now = timestamp.unwrap_or_else(unix_now_secs);
        let claim = Claim {
            jti: self.generator.next_id(),
            iat: now,
            nbf: now,
            seq: tail.as_ref().map_or(1, |t| t.seq + 1),
            prev_claim_id: tail.as_ref().map(|t| t.claim_id),
            prev_digest: tail.as_ref().map(|t| t.digest),
            kind,
        };

        let mut token = Token::from_payload(claim.clone());
        token.sign_with(self.keys.as_ref())?;
        self.draft = Some(claim);

        Ok(token)
    }

    pub fn draft(&self) -> Option<&Claim> {
        self.draft.as_ref()
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Persist `token` as the prepared claim and release the lock.
    ///
    /// `token` must carry the prepared payload unchanged and a valid local
    /// signature; it may carry further signatures.
    pub fn commit(self, token: SignedClaim) -> Result<(ClaimId, SignedClaim)> {
        let draft = self.draft.as_ref().ok_or(SigchainError::NoDraft)?;
        if token.payload() != draft {
            return Err(SigchainError::DraftMismatch);
        }
        if !token.verify_with_public_key(&self.node_id) {
            return Err(SigchainError::VerificationFailed {
                node_id: self.node_id,
            });
        }

        let signed = token.to_signed()?;
        let digest = claim_digest(&token)?;
        let claim_id = draft.jti;
        let seq = draft.seq;

        self.store.transaction(|tx| {
            let tail = read_tail(tx, &self.layout)?;
            let expected = tail.as_ref().map_or(1, |t| t.seq + 1);
            let linked = tail.as_ref().map(|t| t.claim_id) == draft.prev_claim_id
                && tail.as_ref().map(|t| t.digest) == draft.prev_digest;
            if expected != seq || !linked {
                return Err(SigchainError::ChainConflict {
                    expected,
                    actual: seq,
                });
            }

            tx.put_json(&self.layout.claim(seq), &signed)?;
            tx.put_json(&self.layout.id(&claim_id), &seq)?;
            tx.put_json(
                &self.layout.tail(),
                &ChainTail {
                    seq,
                    claim_id,
                    digest,
                },
            )?;
            Ok(())
        })?;

        debug!(
            node_id = %self.node_id,
            seq = seq,
            claim_id = %claim_id,
            typ = draft.kind.typ(),
            signatures = token.signatures().len(),
            "Claim appended to sigchain"
        );

        Ok((claim_id, token))
    }
}

/// Paged, restartable forward iterator over a stored chain.
///
/// Each page is read in its own store transaction, so the cursor never holds
/// the store across iterations and sees claims appended while it runs.
pub struct ClaimCursor {
    store: Arc<Store>,
    prefix: KeyPath,
    page_size: usize,
    yielded_seq: u64,
    fetched_seq: u64,
    buffer: VecDeque<(u64, Vec<u8>)>,
    done: bool,
}

impl ClaimCursor {
    fn new(store: Arc<Store>, prefix: KeyPath, from_seq: u64, page_size: usize) -> Self {
        let start = from_seq.max(1) - 1;
        Self {
            store,
            prefix,
            page_size,
            yielded_seq: start,
            fetched_seq: start,
            buffer: VecDeque::new(),
            done: false,
        }
    }

    /// Seq of the next claim this cursor would yield.
    ///
    /// Passing it to [`Sigchain::get_claims_from`] resumes iteration.
    pub fn position(&self) -> u64 {
        self.yielded_seq + 1
    }

    fn fill(&mut self) -> Result<()> {
        let after = self.prefix.clone().push_u64(self.fetched_seq);
        let rows = self
            .store
            .transaction(|tx| tx.scan(&self.prefix, Some(&after), self.page_size))?;
        if rows.is_empty() {
            self.done = true;
            return Ok(());
        }
        for (key, value) in rows {
            let seq = key
                .last()
                .and_then(Segment::as_u64)
                .ok_or_else(|| SigchainError::CorruptChain {
                    seq: self.fetched_seq + 1,
                    reason: "malformed entry key".to_string(),
                })?;
            self.fetched_seq = seq;
            self.buffer.push_back((seq, value));
        }
        Ok(())
    }
}

impl Iterator for ClaimCursor {
    type Item = Result<(ClaimId, SignedClaim)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.done {
            if let Err(e) = self.fill() {
                self.done = true;
                return Some(Err(e));
            }
        }
        let (seq, bytes) = self.buffer.pop_front()?;
        self.yielded_seq = seq;
        match decode_entry(&bytes) {
            Ok(token) => Some(Ok((token.payload().jti, token))),
            Err(e) => {
                self.done = true;
                self.buffer.clear();
                Some(Err(e))
            }
        }
    }
}
