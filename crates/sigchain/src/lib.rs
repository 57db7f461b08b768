//! Append-only, hash-linked claim chains.
//!
//! Every node keeps one [`Sigchain`] of claims it has issued. Claims link
//! node to node, node to identity, and grant network authority or access.
//! Link claims between two nodes carry both nodes' signatures; see the
//! cross-sign crate for the handshake that produces them.

pub mod claims;
pub mod error;
pub mod sigchain;

pub use claims::{
    claim_digest, Claim, ClaimKind, ClaimLinkIdentity, ClaimLinkNode, ClaimNetworkAccess,
    ClaimNetworkAuthority, SignedClaim,
};
pub use error::{Result, SigchainError};
pub use sigchain::{verify_claims, AppendGuard, ChainTail, ClaimCursor, Sigchain};
