// Circuit Multiplexing — streams, flow control and fair queuing over one path
//
// Provides per-stream and per-circuit windows, SENDME replenishment,
// round-robin cell emission, load balancing across circuits and
// key-rotation bookkeeping.

pub mod mux;
pub mod pool;
pub mod secrecy;
pub mod stream;

pub use mux::{Circuit, CircuitStats, HopRoute, MuxConfig};
pub use pool::{CircuitPool, PoolConfig, PoolStats};
pub use secrecy::{ForwardSecrecyManager, SecrecyConfig};
pub use stream::{Stream, StreamState};

use thiserror::Error;

/// Multiplexer errors
///
/// `FlowControlBlocked` and `StreamNotOpen` are ordinary control-flow
/// signals for the immediate caller; the rest indicate terminal state.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MuxError {
    #[error("Flow control blocked on stream {stream_id}")]
    FlowControlBlocked { stream_id: u16 },

    #[error("Stream {0} is not open")]
    StreamNotOpen(u16),

    #[error("Circuit {0} is inactive")]
    CircuitInactive(u32),

    #[error("Unknown circuit {0}")]
    UnknownCircuit(u32),

    #[error("No free stream ids on circuit")]
    StreamIdsExhausted,

    #[error("Circuit pool is full")]
    PoolFull,

    #[error("No circuit has spare capacity")]
    NoCapacity,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}
