// Shroud Core — onion transport engine
//
// Layered hybrid-KEM encryption, stream multiplexing with flow control,
// forward-secret key rotation and traffic shaping, driven by one
// cooperative session per node.

pub mod circuit;
pub mod config;
pub mod crypto;
pub mod privacy;
pub mod rng;
pub mod session;
pub mod transport;
pub mod wire;

use thiserror::Error;

pub use circuit::{
    Circuit, CircuitPool, CircuitStats, ForwardSecrecyManager, HopRoute, MuxConfig, MuxError,
    PoolConfig, PoolStats, SecrecyConfig, Stream, StreamState,
};
pub use config::EngineConfig;
pub use crypto::{
    CryptoError, HopDescriptor, HopHandshake, HopPublicKeys, HopSecretKeys, OnionCryptoEngine,
    OnionLayer, PeeledLayer, QuantumRatchet, SharedSecret, CIPHER_SUITE, KEM_ALGORITHMS,
};
pub use privacy::{
    ActivityState, AdaptiveCover, ChunkReassembler, RotationPack, ShapeReport, ShapingConfig,
    ShapingError, StealthProfile, TrafficShaper,
};
pub use rng::RngHandle;
pub use session::{OnionSession, SweepReport};
pub use transport::{ForwardError, ForwardTransport, HopPool, MemoryTransport, RelayAction, RelayNode};
pub use wire::{Cell, CellCommand, CellError, EnvelopeError, OnionEnvelope};

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Error, Clone, PartialEq)]
pub enum CoreError {
    #[error(transparent)]
    Cell(#[from] CellError),

    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Mux(#[from] MuxError),

    #[error(transparent)]
    Shaping(#[from] ShapingError),

    #[error(transparent)]
    Forward(#[from] ForwardError),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Install a fmt subscriber honouring `RUST_LOG` (default `warn`)
///
/// Safe to call more than once; later calls are ignored.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .try_init();
}
