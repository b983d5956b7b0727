//! Relay node: accepts circuit handshakes and peels one layer per envelope

use super::ForwardError;
use crate::crypto::{
    respond_shared_secret, HopHandshake, HopPublicKeys, HopSecretKeys, RelayLayerContext,
    RelayOutcome,
};
use crate::rng::RngHandle;
use crate::wire::OnionEnvelope;
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// What the relay does with a processed envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayAction {
    /// Pass the re-tagged envelope to `envelope.next_hop`
    Forward(OnionEnvelope),
    /// This relay is the exit; hand the payload up
    Deliver {
        payload: Vec<u8>,
        metadata: BTreeMap<String, String>,
    },
}

/// One relay's identity and per-circuit layer state
pub struct RelayNode {
    node_id: String,
    endpoint: String,
    keys: HopSecretKeys,
    contexts: BTreeMap<u32, RelayLayerContext>,
}

impl RelayNode {
    pub fn new(node_id: impl Into<String>, endpoint: impl Into<String>, keys: HopSecretKeys) -> Self {
        Self {
            node_id: node_id.into(),
            endpoint: endpoint.into(),
            keys,
            contexts: BTreeMap::new(),
        }
    }

    /// Relay with fresh ML-KEM-768 and X25519 keys
    pub fn generate(node_id: impl Into<String>, endpoint: impl Into<String>, rng: &mut RngHandle) -> Self {
        Self::new(node_id, endpoint, HopSecretKeys::generate(rng, true, true))
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn public_keys(&self) -> HopPublicKeys {
        self.keys.public_keys()
    }

    pub fn circuit_count(&self) -> usize {
        self.contexts.len()
    }

    /// Derive this hop's secret for a circuit; replaces any previous context
    pub fn accept_handshake(
        &mut self,
        circuit_id: u32,
        layer_index: u8,
        handshake: &HopHandshake,
    ) -> Result<(), ForwardError> {
        self.accept_handshake_at(circuit_id, layer_index, 0, handshake)
    }

    /// `accept_handshake` for a hop spliced into an already rotated circuit
    pub fn accept_handshake_at(
        &mut self,
        circuit_id: u32,
        layer_index: u8,
        key_epoch: u32,
        handshake: &HopHandshake,
    ) -> Result<(), ForwardError> {
        let secret = respond_shared_secret(&self.node_id, &self.keys, handshake)?;
        let context = RelayLayerContext::at_epoch(self.node_id.clone(), layer_index, key_epoch, &secret)?;
        self.contexts.insert(circuit_id, context);
        debug!(
            "Relay {} keyed circuit {} at layer {} epoch {}",
            self.node_id, circuit_id, layer_index, key_epoch
        );
        Ok(())
    }

    /// Key epoch this relay currently holds for a circuit
    pub fn key_epoch(&self, circuit_id: u32) -> Option<u32> {
        self.contexts.get(&circuit_id).map(|c| c.key_epoch())
    }

    /// Verify, peel and route one envelope
    pub fn process_envelope(&mut self, envelope: &OnionEnvelope) -> Result<RelayAction, ForwardError> {
        let context = self
            .contexts
            .get_mut(&envelope.circuit_id)
            .ok_or(ForwardError::UnknownCircuit(envelope.circuit_id))?;
        match context.process(envelope) {
            Ok(RelayOutcome::Forward(next)) => Ok(RelayAction::Forward(next)),
            Ok(RelayOutcome::Deliver { payload, metadata }) => {
                Ok(RelayAction::Deliver { payload, metadata })
            }
            Err(e) => {
                warn!(
                    "Relay {} dropped envelope on circuit {}: {}",
                    self.node_id, envelope.circuit_id, e
                );
                Err(e.into())
            }
        }
    }

    /// Forget a circuit (DESTROY)
    pub fn drop_circuit(&mut self, circuit_id: u32) -> bool {
        self.contexts.remove(&circuit_id).is_some()
    }
}

impl std::fmt::Debug for RelayNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayNode")
            .field("node_id", &self.node_id)
            .field("endpoint", &self.endpoint)
            .field("circuits", &self.contexts.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{CryptoError, HopDescriptor, OnionCryptoEngine};

    fn make_net(rng: &mut RngHandle) -> (Vec<RelayNode>, OnionCryptoEngine) {
        let mut relays: Vec<RelayNode> = (0..3)
            .map(|i| RelayNode::generate(format!("relay-{}", i), format!("10.0.0.{}:9001", i), rng))
            .collect();
        let hops: Vec<HopDescriptor> = relays
            .iter()
            .map(|r| HopDescriptor::new(r.node_id(), r.endpoint(), r.public_keys()))
            .collect();
        let mut engine = OnionCryptoEngine::new(42, rng.fork());
        engine.create_circuit(&hops).unwrap();
        for (relay, layer) in relays.iter_mut().zip(engine.layers()) {
            relay
                .accept_handshake(42, layer.layer_index, &layer.handshake)
                .unwrap();
        }
        (relays, engine)
    }

    #[test]
    fn test_three_relays_deliver() {
        let mut rng = RngHandle::from_seed(11);
        let (mut relays, mut engine) = make_net(&mut rng);
        let mut meta = BTreeMap::new();
        meta.insert("kind".to_string(), "cell".to_string());
        let mut envelope = engine.wrap_envelope(b"payload", &meta, BTreeMap::new()).unwrap();

        for (i, relay) in relays.iter_mut().enumerate() {
            assert_eq!(envelope.next_hop, relay.node_id());
            match relay.process_envelope(&envelope).unwrap() {
                RelayAction::Forward(next) => {
                    assert!(i < 2);
                    envelope = next;
                }
                RelayAction::Deliver { payload, metadata } => {
                    assert_eq!(i, 2);
                    assert_eq!(payload, b"payload");
                    assert_eq!(metadata, meta);
                    return;
                }
            }
        }
        panic!("exit relay never delivered");
    }

    #[test]
    fn test_out_of_order_relay_rejects() {
        let mut rng = RngHandle::from_seed(12);
        let (mut relays, mut engine) = make_net(&mut rng);
        let envelope = engine
            .wrap_envelope(b"x", &BTreeMap::new(), BTreeMap::new())
            .unwrap();
        assert_eq!(
            relays[1].process_envelope(&envelope),
            Err(ForwardError::Crypto(CryptoError::LayerAuthFailure { layer: 1 }))
        );
    }

    #[test]
    fn test_tampered_header_rejected() {
        let mut rng = RngHandle::from_seed(13);
        let (mut relays, mut engine) = make_net(&mut rng);
        let mut envelope = engine
            .wrap_envelope(b"x", &BTreeMap::new(), BTreeMap::new())
            .unwrap();
        envelope
            .metadata
            .insert("injected".to_string(), "1".to_string());
        assert!(matches!(
            relays[0].process_envelope(&envelope),
            Err(ForwardError::Crypto(CryptoError::LayerAuthFailure { layer: 0 }))
        ));
    }

    #[test]
    fn test_unknown_circuit() {
        let mut rng = RngHandle::from_seed(14);
        let (mut relays, mut engine) = make_net(&mut rng);
        let envelope = engine
            .wrap_envelope(b"x", &BTreeMap::new(), BTreeMap::new())
            .unwrap();
        assert!(relays[0].drop_circuit(42));
        assert_eq!(
            relays[0].process_envelope(&envelope),
            Err(ForwardError::UnknownCircuit(42))
        );
    }

    #[test]
    fn test_rotated_circuit_needs_no_new_handshake() {
        let mut rng = RngHandle::from_seed(15);
        let (mut relays, mut engine) = make_net(&mut rng);
        engine.advance_epoch().unwrap();
        let mut envelope = engine
            .wrap_envelope(b"after rotation", &BTreeMap::new(), BTreeMap::new())
            .unwrap();
        for relay in relays.iter_mut() {
            match relay.process_envelope(&envelope).unwrap() {
                RelayAction::Forward(next) => envelope = next,
                RelayAction::Deliver { payload, .. } => assert_eq!(payload, b"after rotation"),
            }
        }
        assert!(relays.iter().all(|r| r.key_epoch(42) == Some(1)));
        assert_eq!(relays[0].key_epoch(7), None);
    }
}
