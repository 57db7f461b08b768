//! Integration tests across the Trellis crates
//!
//! This test suite validates:
//! - Cross-sign handshakes between independently persisted nodes
//! - Ingesting handshake results into the gestalt graph
//! - Handshakes over a real socket transport
//! - Rejection of forged, replayed and malformed peer input

pub mod test_utils;

#[cfg(test)]
mod trust_graph_tests;

#[cfg(test)]
mod byzantine_peer_tests;
