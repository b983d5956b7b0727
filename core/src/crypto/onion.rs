// Onion Engine — circuit key schedule, layered encryption and per-hop peeling
//
// Sealed innermost first. Each layer body is a bincode `LayerContent`:
// relays find a `Forward` with the next hop, that hop's header tag and the
// inner blob; the final hop finds `Deliver` with the payload and its
// metadata. The variant tag is the terminal-layer marker, so no payload
// byte pattern is ever interpreted as routing.
//
// Rotation ratchets every layer secret one key epoch forward. The epoch
// rides in the envelope header; a relay that sees a later epoch ratchets its
// own secret to match once the tag verifies, so rotation needs no new
// handshake. Only a replaced hop is keyed from scratch.

use super::kem::{derive_shared_secret, HopHandshake, HopPublicKeys, SharedSecret};
use super::layer::LayerKeys;
use super::ratchet::ratchet_secret;
use super::CryptoError;
use crate::rng::RngHandle;
use crate::wire::{OnionEnvelope, LAYER_TAG_SIZE};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// Minimum hops per circuit
pub const MIN_CIRCUIT_HOPS: usize = 3;

/// Furthest a relay will ratchet ahead to match an envelope's epoch
pub const MAX_EPOCH_SKIP: u32 = 16;

/// A candidate hop: where it lives and which keys it advertises
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HopDescriptor {
    pub node_id: String,
    pub endpoint: String,
    pub public_keys: HopPublicKeys,
}

impl HopDescriptor {
    pub fn new(
        node_id: impl Into<String>,
        endpoint: impl Into<String>,
        public_keys: HopPublicKeys,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            endpoint: endpoint.into(),
            public_keys,
        }
    }
}

/// One established layer of a circuit
#[derive(Debug, Clone)]
pub struct OnionLayer {
    pub node_id: String,
    pub endpoint: String,
    pub layer_index: u8,
    /// Values the hop needs to derive the same secret
    pub handshake: HopHandshake,
    /// Key epoch at which `handshake` was made
    pub keyed_epoch: u32,
    shared_secret: SharedSecret,
}

impl OnionLayer {
    pub fn shared_secret(&self) -> &SharedSecret {
        &self.shared_secret
    }
}

/// Sealed body of one layer
#[derive(Serialize, Deserialize)]
enum LayerContent {
    Forward {
        next_hop: String,
        next_tag: [u8; LAYER_TAG_SIZE],
        blob: Vec<u8>,
    },
    Deliver {
        data: Vec<u8>,
        metadata: BTreeMap<String, String>,
    },
}

/// Result of removing one layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeeledLayer {
    /// Intermediate hop: pass `blob` to `next_hop`, tagged with `next_tag`
    Forward {
        next_hop: String,
        next_tag: [u8; LAYER_TAG_SIZE],
        blob: Vec<u8>,
    },
    /// Final hop: the original payload
    Deliver {
        payload: Vec<u8>,
        metadata: BTreeMap<String, String>,
    },
}

/// Initiator-side onion engine for one circuit
///
/// Holds the ordered layer secrets. Only `ForwardSecrecyManager` replaces
/// them; every replacement overwrites the previous secrets with random
/// bytes first.
pub struct OnionCryptoEngine {
    circuit_id: u32,
    layers: Vec<OnionLayer>,
    key_epoch: u32,
    rng: RngHandle,
}

impl OnionCryptoEngine {
    pub fn new(circuit_id: u32, rng: RngHandle) -> Self {
        Self {
            circuit_id,
            layers: Vec::new(),
            key_epoch: 0,
            rng,
        }
    }

    pub fn circuit_id(&self) -> u32 {
        self.circuit_id
    }

    pub fn key_epoch(&self) -> u32 {
        self.key_epoch
    }

    pub fn layers(&self) -> &[OnionLayer] {
        &self.layers
    }

    pub fn is_established(&self) -> bool {
        self.layers.len() >= MIN_CIRCUIT_HOPS
    }

    /// Establish a fresh secret with every hop
    ///
    /// All-or-nothing: on error the previous layers are left untouched.
    pub fn create_circuit(&mut self, hops: &[HopDescriptor]) -> Result<&[OnionLayer], CryptoError> {
        if hops.len() < MIN_CIRCUIT_HOPS {
            return Err(CryptoError::InsufficientHops { got: hops.len() });
        }
        if hops.len() > u8::MAX as usize {
            return Err(CryptoError::InvalidKey(format!("{} hops", hops.len())));
        }

        let mut layers = Vec::with_capacity(hops.len());
        for (index, hop) in hops.iter().enumerate() {
            let (shared_secret, handshake) =
                derive_shared_secret(&hop.node_id, &hop.public_keys, &mut self.rng)?;
            debug!(
                "Circuit {} layer {} keyed for {} ({})",
                self.circuit_id,
                index,
                hop.node_id,
                hop.public_keys.fingerprint()
            );
            layers.push(OnionLayer {
                node_id: hop.node_id.clone(),
                endpoint: hop.endpoint.clone(),
                layer_index: index as u8,
                handshake,
                keyed_epoch: 0,
                shared_secret,
            });
        }

        self.wipe();
        self.layers = layers;
        self.key_epoch = 0;
        Ok(&self.layers)
    }

    /// Key a substitute hop into `position`, keeping every other layer
    ///
    /// The new layer joins at the current key epoch. On error nothing changes.
    pub fn replace_layer(&mut self, position: usize, hop: &HopDescriptor) -> Result<&OnionLayer, CryptoError> {
        if position >= self.layers.len() {
            return Err(CryptoError::CircuitNotEstablished);
        }
        let (shared_secret, handshake) =
            derive_shared_secret(&hop.node_id, &hop.public_keys, &mut self.rng)?;
        let replacement = OnionLayer {
            node_id: hop.node_id.clone(),
            endpoint: hop.endpoint.clone(),
            layer_index: position as u8,
            handshake,
            keyed_epoch: self.key_epoch,
            shared_secret,
        };
        let mut retired = std::mem::replace(&mut self.layers[position], replacement);
        retired.shared_secret.wipe(&mut self.rng);
        debug!(
            "Circuit {} layer {} re-keyed for {} at epoch {}",
            self.circuit_id, position, hop.node_id, self.key_epoch
        );
        Ok(&self.layers[position])
    }

    /// Ratchet every layer secret into the next key epoch
    ///
    /// Retired secrets are overwritten with random bytes. All-or-nothing.
    pub fn advance_epoch(&mut self) -> Result<u32, CryptoError> {
        if !self.is_established() {
            return Err(CryptoError::CircuitNotEstablished);
        }
        let epoch = self
            .key_epoch
            .checked_add(1)
            .ok_or_else(|| CryptoError::InvalidKey("key epoch exhausted".to_string()))?;
        let next = self
            .layers
            .iter()
            .map(|layer| ratchet_secret(&layer.shared_secret))
            .collect::<Result<Vec<_>, _>>()?;
        for (layer, secret) in self.layers.iter_mut().zip(next) {
            let mut retired = std::mem::replace(&mut layer.shared_secret, secret);
            retired.wipe(&mut self.rng);
        }
        self.key_epoch = epoch;
        Ok(epoch)
    }

    /// Wrap `plaintext` in one AEAD layer per hop
    pub fn encrypt_onion(
        &mut self,
        plaintext: &[u8],
        metadata: &BTreeMap<String, String>,
    ) -> Result<Vec<u8>, CryptoError> {
        self.seal_onion(plaintext, metadata, &BTreeMap::new())
            .map(|(blob, _)| blob)
    }

    /// Build the envelope addressed to the first hop
    pub fn wrap_envelope(
        &mut self,
        plaintext: &[u8],
        payload_metadata: &BTreeMap<String, String>,
        header_metadata: BTreeMap<String, String>,
    ) -> Result<OnionEnvelope, CryptoError> {
        let (blob, tag) = self.seal_onion(plaintext, payload_metadata, &header_metadata)?;
        let first = self
            .layers
            .first()
            .ok_or(CryptoError::CircuitNotEstablished)?;
        Ok(OnionEnvelope {
            next_hop: first.node_id.clone(),
            circuit_id: self.circuit_id,
            hop_num: 0,
            key_epoch: self.key_epoch,
            layer_auth_tag: tag,
            metadata: header_metadata,
            encrypted_payload: blob,
        })
    }

    fn seal_onion(
        &mut self,
        plaintext: &[u8],
        payload_metadata: &BTreeMap<String, String>,
        header_metadata: &BTreeMap<String, String>,
    ) -> Result<(Vec<u8>, [u8; LAYER_TAG_SIZE]), CryptoError> {
        if !self.is_established() {
            return Err(CryptoError::CircuitNotEstablished);
        }

        let mut content = LayerContent::Deliver {
            data: plaintext.to_vec(),
            metadata: payload_metadata.clone(),
        };
        let mut sealed: Option<(Vec<u8>, [u8; LAYER_TAG_SIZE])> = None;

        for layer in self.layers.iter().rev() {
            if let Some((blob, tag)) = sealed.take() {
                content = LayerContent::Forward {
                    next_hop: next_hop_of(&self.layers, layer.layer_index)?,
                    next_tag: tag,
                    blob,
                };
            }

            let body =
                bincode::serialize(&content).map_err(|e| CryptoError::Encoding(e.to_string()))?;
            let keys = LayerKeys::derive(&layer.shared_secret, layer.layer_index)?;
            let blob = keys.seal(layer.layer_index, &layer.node_id, &body, &mut self.rng)?;
            let tag = keys.tag(&OnionEnvelope::authenticated_bytes(
                &layer.node_id,
                self.circuit_id,
                layer.layer_index,
                self.key_epoch,
                header_metadata,
                &blob,
            ))?;
            sealed = Some((blob, tag));
        }

        sealed.ok_or(CryptoError::CircuitNotEstablished)
    }

    /// Remove exactly one layer using that hop's secret
    pub fn decrypt_layer(
        blob: &[u8],
        secret: &SharedSecret,
        layer_index: u8,
        node_id: &str,
    ) -> Result<PeeledLayer, CryptoError> {
        let keys = LayerKeys::derive(secret, layer_index)?;
        peel(&keys, layer_index, node_id, blob)
    }

    /// Overwrite every layer secret with random bytes and forget the layers
    pub fn wipe(&mut self) {
        for layer in self.layers.iter_mut() {
            layer.shared_secret.wipe(&mut self.rng);
        }
        self.layers.clear();
        self.key_epoch = 0;
    }
}

impl Drop for OnionCryptoEngine {
    fn drop(&mut self) {
        self.wipe();
    }
}

impl std::fmt::Debug for OnionCryptoEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OnionCryptoEngine")
            .field("circuit_id", &self.circuit_id)
            .field("layers", &self.layers.len())
            .field("key_epoch", &self.key_epoch)
            .finish()
    }
}

fn next_hop_of(layers: &[OnionLayer], layer_index: u8) -> Result<String, CryptoError> {
    layers
        .get(layer_index as usize + 1)
        .map(|l| l.node_id.clone())
        .ok_or(CryptoError::CircuitNotEstablished)
}

fn peel(keys: &LayerKeys, layer_index: u8, node_id: &str, blob: &[u8]) -> Result<PeeledLayer, CryptoError> {
    let body = keys.open(layer_index, node_id, blob)?;
    let content: LayerContent = bincode::deserialize(&body)
        .map_err(|_| CryptoError::LayerAuthFailure { layer: layer_index })?;
    Ok(match content {
        LayerContent::Forward {
            next_hop,
            next_tag,
            blob,
        } => PeeledLayer::Forward {
            next_hop,
            next_tag,
            blob,
        },
        LayerContent::Deliver { data, metadata } => PeeledLayer::Deliver {
            payload: data,
            metadata,
        },
    })
}

/// What a relay does with an envelope after peeling its layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    Forward(OnionEnvelope),
    Deliver {
        payload: Vec<u8>,
        metadata: BTreeMap<String, String>,
    },
}

/// Relay-side key state for one circuit
pub struct RelayLayerContext {
    node_id: String,
    layer_index: u8,
    key_epoch: u32,
    secret: SharedSecret,
    keys: LayerKeys,
}

impl RelayLayerContext {
    pub fn new(node_id: impl Into<String>, layer_index: u8, secret: &SharedSecret) -> Result<Self, CryptoError> {
        Self::at_epoch(node_id, layer_index, 0, secret)
    }

    /// Context for a hop keyed after the circuit had already rotated
    pub fn at_epoch(
        node_id: impl Into<String>,
        layer_index: u8,
        key_epoch: u32,
        secret: &SharedSecret,
    ) -> Result<Self, CryptoError> {
        Ok(Self {
            node_id: node_id.into(),
            layer_index,
            key_epoch,
            secret: secret.clone(),
            keys: LayerKeys::derive(secret, layer_index)?,
        })
    }

    pub fn layer_index(&self) -> u8 {
        self.layer_index
    }

    pub fn key_epoch(&self) -> u32 {
        self.key_epoch
    }

    /// Verify the header tag, open one layer and build the next envelope
    ///
    /// An envelope from a later epoch is checked against keys ratcheted
    /// forward; they replace the current ones only if it verifies. Earlier
    /// epochs are gone and always fail.
    pub fn process(&mut self, envelope: &OnionEnvelope) -> Result<RelayOutcome, CryptoError> {
        let failure = CryptoError::LayerAuthFailure {
            layer: self.layer_index,
        };
        if envelope.hop_num != self.layer_index || envelope.next_hop != self.node_id {
            return Err(failure);
        }
        let skip = envelope
            .key_epoch
            .checked_sub(self.key_epoch)
            .filter(|skip| *skip <= MAX_EPOCH_SKIP)
            .ok_or_else(|| failure.clone())?;

        let staged = if skip == 0 {
            None
        } else {
            let mut secret = ratchet_secret(&self.secret)?;
            for _ in 1..skip {
                secret = ratchet_secret(&secret)?;
            }
            let keys = LayerKeys::derive(&secret, self.layer_index)?;
            Some((secret, keys))
        };
        let keys = staged.as_ref().map_or(&self.keys, |(_, keys)| keys);

        keys.verify_tag(self.layer_index, &envelope.tagged_bytes(), &envelope.layer_auth_tag)?;
        let outcome = match peel(keys, self.layer_index, &self.node_id, &envelope.encrypted_payload)? {
            PeeledLayer::Forward {
                next_hop,
                next_tag,
                blob,
            } => RelayOutcome::Forward(OnionEnvelope {
                next_hop,
                circuit_id: envelope.circuit_id,
                hop_num: self.layer_index.checked_add(1).ok_or(failure)?,
                key_epoch: envelope.key_epoch,
                layer_auth_tag: next_tag,
                metadata: envelope.metadata.clone(),
                encrypted_payload: blob,
            }),
            PeeledLayer::Deliver { payload, metadata } => RelayOutcome::Deliver { payload, metadata },
        };

        if let Some((secret, keys)) = staged {
            debug!(
                "Relay {} circuit {} ratcheted to epoch {}",
                self.node_id, envelope.circuit_id, envelope.key_epoch
            );
            self.secret = secret;
            self.keys = keys;
            self.key_epoch = envelope.key_epoch;
        }
        Ok(outcome)
    }
}

impl std::fmt::Debug for RelayLayerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayLayerContext")
            .field("node_id", &self.node_id)
            .field("layer_index", &self.layer_index)
            .field("key_epoch", &self.key_epoch)
            .finish()
    }
}
