// Onion Crypto — hybrid key agreement and layered AEAD
//
// Per hop: ML-KEM-768 + X25519 → HKDF → shared secret
// Per layer: HKDF(shared secret, layer index) → independent ENC and MAC keys
// Per message: XChaCha20-Poly1305 seal per layer, innermost first

pub mod kem;
pub mod layer;
pub mod onion;
pub mod ratchet;

pub use kem::{
    derive_shared_secret, respond_shared_secret, HopHandshake, HopPublicKeys, HopSecretKeys,
    SharedSecret,
};
pub use layer::LayerKeys;
pub use onion::{
    HopDescriptor, OnionCryptoEngine, OnionLayer, PeeledLayer, RelayLayerContext, RelayOutcome,
    MIN_CIRCUIT_HOPS,
};
pub use ratchet::{ratchet_secret, QuantumRatchet};

use thiserror::Error;

/// KEM algorithm identifiers advertised at session start
pub const KEM_ALGORITHMS: &[&str] = &["ML-KEM-768", "X25519"];

/// Cipher suite advertised at session start
pub const CIPHER_SUITE: &str = "XChaCha20-Poly1305 / HKDF-SHA256 / HMAC-SHA256";

/// Cryptographic failures; none of these are recoverable at the layer
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Insufficient hops: onion routing requires at least {min}, got {got}", min = MIN_CIRCUIT_HOPS)]
    InsufficientHops { got: usize },

    #[error("No key material for hop {node_id}: need an ML-KEM and/or X25519 public key")]
    NoKeyMaterial { node_id: String },

    #[error("Layer authentication failed at layer {layer}")]
    LayerAuthFailure { layer: u8 },

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Circuit not established")]
    CircuitNotEstablished,

    #[error("Encoding error: {0}")]
    Encoding(String),
}
