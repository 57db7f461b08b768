//! Cross-sign claim handshake.
//!
//! Two nodes exchange tokens over a duplex [`ClaimStream`] until each holds,
//! at the tail of its own sigchain, a link claim to the other carrying both
//! signatures. Those doubly-signed claims are the evidence the gestalt graph
//! accepts for node to node links.

pub mod error;
pub mod handshake;
pub mod stream;

pub use error::{HandshakeError, Result};
pub use handshake::CrossSigner;
pub use stream::{ClaimStream, CrossSignMessage, LineClaimStream, MemoryClaimStream};
