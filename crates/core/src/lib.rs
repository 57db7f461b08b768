//! Core functionality for the Trellis trust graph.
//!
//! This crate provides the vertex identifiers, the persisted transactional
//! key-value store, configuration and logging shared by the sigchain,
//! cross-sign and gestalt crates.

pub mod config;
pub mod error;
pub mod ids;
pub mod logging;
pub mod store;

pub use config::Config;
pub use error::{Result, StoreError};
pub use ids::{GestaltId, IdentityId, NodeId, ProviderId, ProviderIdentityId};
pub use store::{KeyPath, Segment, Store, StoreTx};
