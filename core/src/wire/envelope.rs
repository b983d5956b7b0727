//! Onion Envelope — variable-length, self-describing hop container

use super::EnvelopeError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Size of the HMAC-SHA256 layer tag (bytes)
pub const LAYER_TAG_SIZE: usize = 32;

/// Envelope handed between hops
///
/// The header is readable by the receiving relay; `encrypted_payload` is
/// the onion blob for this hop. The relay checks `layer_auth_tag` with its
/// layer MAC key before opening exactly one AEAD layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnionEnvelope {
    /// Node id of the hop this envelope is addressed to
    pub next_hop: String,
    /// Circuit the envelope travels on
    pub circuit_id: u32,
    /// Position of the addressed hop (0 = first relay)
    pub hop_num: u8,
    /// Ratchet epoch the layer keys were taken from
    pub key_epoch: u32,
    /// HMAC over the header and payload, keyed for the addressed hop
    pub layer_auth_tag: [u8; LAYER_TAG_SIZE],
    /// Free-form, non-secret header metadata
    pub metadata: BTreeMap<String, String>,
    /// Onion blob for the addressed hop
    pub encrypted_payload: Vec<u8>,
}

impl OnionEnvelope {
    /// Serialize to wire bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, EnvelopeError> {
        bincode::serialize(self).map_err(|e| EnvelopeError::Encoding(e.to_string()))
    }

    /// Deserialize from wire bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self, EnvelopeError> {
        bincode::deserialize(data).map_err(|e| EnvelopeError::Encoding(e.to_string()))
    }

    /// Bytes covered by `layer_auth_tag`
    pub fn authenticated_bytes(
        next_hop: &str,
        circuit_id: u32,
        hop_num: u8,
        key_epoch: u32,
        metadata: &BTreeMap<String, String>,
        encrypted_payload: &[u8],
    ) -> Vec<u8> {
        let mut buf = Vec::with_capacity(20 + next_hop.len() + encrypted_payload.len());
        buf.extend_from_slice(&circuit_id.to_be_bytes());
        buf.push(hop_num);
        buf.extend_from_slice(&key_epoch.to_be_bytes());
        buf.extend_from_slice(&(next_hop.len() as u32).to_be_bytes());
        buf.extend_from_slice(next_hop.as_bytes());
        for (key, value) in metadata {
            buf.extend_from_slice(&(key.len() as u32).to_be_bytes());
            buf.extend_from_slice(key.as_bytes());
            buf.extend_from_slice(&(value.len() as u32).to_be_bytes());
            buf.extend_from_slice(value.as_bytes());
        }
        buf.extend_from_slice(&(encrypted_payload.len() as u64).to_be_bytes());
        buf.extend_from_slice(encrypted_payload);
        buf
    }

    /// Bytes covered by this envelope's own tag
    pub fn tagged_bytes(&self) -> Vec<u8> {
        Self::authenticated_bytes(
            &self.next_hop,
            self.circuit_id,
            self.hop_num,
            self.key_epoch,
            &self.metadata,
            &self.encrypted_payload,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_envelope() -> OnionEnvelope {
        let mut metadata = BTreeMap::new();
        metadata.insert("v".to_string(), "1".to_string());
        OnionEnvelope {
            next_hop: "guard-001".to_string(),
            circuit_id: 42,
            hop_num: 0,
            key_epoch: 0,
            layer_auth_tag: [9u8; LAYER_TAG_SIZE],
            metadata,
            encrypted_payload: vec![1, 2, 3, 4, 5],
        }
    }

    #[test]
    fn test_envelope_bytes_restore() {
        let envelope = make_envelope();
        let bytes = envelope.to_bytes().unwrap();
        assert_eq!(OnionEnvelope::from_bytes(&bytes).unwrap(), envelope);
    }

    #[test]
    fn test_envelope_garbage_rejected() {
        assert!(OnionEnvelope::from_bytes(&[0xFF; 3]).is_err());
    }

    #[test]
    fn test_tagged_bytes_bind_header_fields() {
        let base = make_envelope();
        let mut moved = base.clone();
        moved.hop_num = 1;
        assert_ne!(base.tagged_bytes(), moved.tagged_bytes());

        let mut rerouted = base.clone();
        rerouted.next_hop = "guard-002".to_string();
        assert_ne!(base.tagged_bytes(), rerouted.tagged_bytes());

        let mut other_circuit = base.clone();
        other_circuit.circuit_id = 43;
        assert_ne!(base.tagged_bytes(), other_circuit.tagged_bytes());

        let mut later_epoch = base.clone();
        later_epoch.key_epoch = 1;
        assert_ne!(base.tagged_bytes(), later_epoch.tagged_bytes());
    }

    #[test]
    fn test_tagged_bytes_ignore_tag_itself() {
        let base = make_envelope();
        let mut retagged = base.clone();
        retagged.layer_auth_tag = [0u8; LAYER_TAG_SIZE];
        assert_eq!(base.tagged_bytes(), retagged.tagged_bytes());
    }
}
