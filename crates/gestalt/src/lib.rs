//! Trust graph of nodes and provider identities.
//!
//! Edges are only created from verified link claims. Connected components
//! (gestalts) are treated as one party and carry a shared set of
//! [`GestaltAction`] permissions.

pub mod error;
pub mod graph;
pub mod types;

pub use error::{GestaltError, Result};
pub use graph::{GestaltGraph, GestaltIter, DEFAULT_PAGE_SIZE};
pub use types::{
    Gestalt, GestaltAction, GestaltActions, GestaltLink, GestaltLinkIdentity, GestaltLinkNode,
    IdentityInfo, LinkIdentityMeta, NodeInfo,
};
