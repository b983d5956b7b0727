//! Forwarding transport for onion envelopes
//!
//! The engine never opens sockets itself. Serialized envelopes are handed
//! to a [`ForwardTransport`], which reports only whether the next hop
//! accepted them. Relays use [`RelayNode`] to peel their layer and decide
//! whether to forward or deliver.

pub mod forward;
pub mod relay;

pub use forward::{ForwardTransport, HopPool, MemoryTransport};
pub use relay::{RelayAction, RelayNode};

use crate::crypto::CryptoError;
use thiserror::Error;

/// Errors raised while forwarding envelopes
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ForwardError {
    #[error("Circuit {circuit_id} unreachable via {node_id}")]
    Unreachable { circuit_id: u32, node_id: String },

    #[error("No substitute hop available for circuit {0}")]
    NoSubstitute(u32),

    #[error("Relay has no context for circuit {0}")]
    UnknownCircuit(u32),

    #[error("Crypto error while forwarding: {0}")]
    Crypto(#[from] CryptoError),
}
