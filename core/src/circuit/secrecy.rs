// Forward Secrecy — circuit key bindings, timed rotation and secure discard
//
// The manager is the only owner allowed to replace a circuit's layer secrets.
// Rotation ratchets every layer secret one key epoch forward; relays follow
// from the epoch in the envelope header. Replacing a hop runs the hybrid
// handshake for that position only. Retired secrets are overwritten with
// random bytes before they are dropped.

use super::MuxError;
use crate::crypto::{CryptoError, HopDescriptor, OnionCryptoEngine, OnionLayer};
use crate::rng::RngHandle;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Key rotation policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecrecyConfig {
    /// Seconds between automatic re-keys of each circuit
    pub rotation_interval_secs: u64,
}

impl Default for SecrecyConfig {
    fn default() -> Self {
        Self {
            rotation_interval_secs: 600,
        }
    }
}

impl SecrecyConfig {
    pub fn validate(&self) -> Result<(), MuxError> {
        if self.rotation_interval_secs == 0 {
            return Err(MuxError::InvalidConfig(
                "rotation_interval_secs must be non-zero".into(),
            ));
        }
        Ok(())
    }

    pub fn rotation_interval(&self) -> Duration {
        Duration::from_secs(self.rotation_interval_secs)
    }
}

struct Binding {
    engine: OnionCryptoEngine,
    hops: Vec<HopDescriptor>,
    last_rotation: Instant,
}

/// Owns circuit → crypto-context bindings
pub struct ForwardSecrecyManager {
    config: SecrecyConfig,
    bindings: BTreeMap<u32, Binding>,
    rng: RngHandle,
}

impl ForwardSecrecyManager {
    pub fn new(config: SecrecyConfig, rng: RngHandle) -> Self {
        Self {
            config,
            bindings: BTreeMap::new(),
            rng,
        }
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Key a new circuit; replaces (and wipes) any previous binding
    pub fn register_circuit(
        &mut self,
        circuit_id: u32,
        hops: Vec<HopDescriptor>,
        now: Instant,
    ) -> Result<&[OnionLayer], CryptoError> {
        let mut engine = OnionCryptoEngine::new(circuit_id, self.rng.fork());
        engine.create_circuit(&hops)?;
        info!("Circuit {} keyed with {} hops", circuit_id, hops.len());

        let binding = Binding {
            engine,
            hops,
            last_rotation: now,
        };
        if let Some(mut old) = self.bindings.insert(circuit_id, binding) {
            old.engine.wipe();
        }
        self.bindings
            .get(&circuit_id)
            .map(|b| b.engine.layers())
            .ok_or(CryptoError::CircuitNotEstablished)
    }

    pub fn engine(&self, circuit_id: u32) -> Option<&OnionCryptoEngine> {
        self.bindings.get(&circuit_id).map(|b| &b.engine)
    }

    pub fn engine_mut(&mut self, circuit_id: u32) -> Option<&mut OnionCryptoEngine> {
        self.bindings.get_mut(&circuit_id).map(|b| &mut b.engine)
    }

    pub fn hops(&self, circuit_id: u32) -> Option<&[HopDescriptor]> {
        self.bindings.get(&circuit_id).map(|b| b.hops.as_slice())
    }

    pub fn last_rotation(&self, circuit_id: u32) -> Option<Instant> {
        self.bindings.get(&circuit_id).map(|b| b.last_rotation)
    }

    pub fn should_rotate(&self, circuit_id: u32, now: Instant) -> bool {
        self.bindings.get(&circuit_id).map_or(false, |b| {
            now.saturating_duration_since(b.last_rotation) >= self.config.rotation_interval()
        })
    }

    pub fn key_epoch(&self, circuit_id: u32) -> Option<u32> {
        self.bindings.get(&circuit_id).map(|b| b.engine.key_epoch())
    }

    /// Ratchet the circuit's keys into the next epoch
    pub fn rotate_keys(&mut self, circuit_id: u32, now: Instant) -> Result<(), CryptoError> {
        let binding = self
            .bindings
            .get_mut(&circuit_id)
            .ok_or(CryptoError::CircuitNotEstablished)?;
        let epoch = binding.engine.advance_epoch()?;
        binding.last_rotation = now;
        info!("Circuit {} keys rotated to epoch {}", circuit_id, epoch);
        Ok(())
    }

    /// Rotate every circuit whose interval has elapsed
    pub fn rotate_due(&mut self, now: Instant) -> Vec<(u32, Result<(), CryptoError>)> {
        let due: Vec<u32> = self
            .bindings
            .keys()
            .copied()
            .filter(|id| self.should_rotate(*id, now))
            .collect();
        due.into_iter()
            .map(|id| {
                let result = self.rotate_keys(id, now);
                if let Err(e) = &result {
                    warn!("Circuit {} rotation failed: {}", id, e);
                }
                (id, result)
            })
            .collect()
    }

    /// Swap the hop at `position` and key only that layer
    ///
    /// The other hops keep their secrets, so only the substitute needs the
    /// returned layer's handshake. On failure the previous hop and keys stay
    /// in place.
    pub fn replace_hop(
        &mut self,
        circuit_id: u32,
        position: usize,
        substitute: HopDescriptor,
    ) -> Result<&OnionLayer, CryptoError> {
        let binding = self
            .bindings
            .get_mut(&circuit_id)
            .ok_or(CryptoError::CircuitNotEstablished)?;
        let slot = binding
            .hops
            .get_mut(position)
            .ok_or(CryptoError::CircuitNotEstablished)?;
        debug!(
            "Circuit {} replacing hop {} ({} -> {})",
            circuit_id, position, slot.node_id, substitute.node_id
        );

        binding.engine.replace_layer(position, &substitute)?;
        *slot = substitute;
        binding
            .engine
            .layers()
            .get(position)
            .ok_or(CryptoError::CircuitNotEstablished)
    }

    /// Wipe and forget a circuit's keys
    pub fn destroy_circuit(&mut self, circuit_id: u32) -> bool {
        match self.bindings.remove(&circuit_id) {
            Some(mut binding) => {
                binding.engine.wipe();
                debug!("Circuit {} keys discarded", circuit_id);
                true
            }
            None => false,
        }
    }
}

impl std::fmt::Debug for ForwardSecrecyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForwardSecrecyManager")
            .field("circuits", &self.bindings.len())
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{ratchet_secret, HopPublicKeys, HopSecretKeys, SharedSecret};

    fn make_hops(rng: &mut RngHandle, prefix: &str) -> Vec<HopDescriptor> {
        (0..3)
            .map(|i| {
                let keys = HopSecretKeys::generate(rng, false, true);
                HopDescriptor::new(format!("{}-{}", prefix, i), "", keys.public_keys())
            })
            .collect()
    }

    fn secrets(manager: &ForwardSecrecyManager, id: u32) -> Vec<SharedSecret> {
        manager
            .engine(id)
            .unwrap()
            .layers()
            .iter()
            .map(|l| l.shared_secret().clone())
            .collect()
    }

    #[test]
    fn test_register_and_destroy() {
        let mut rng = RngHandle::from_seed(1);
        let hops = make_hops(&mut rng, "n");
        let mut manager = ForwardSecrecyManager::new(SecrecyConfig::default(), rng);
        assert_eq!(manager.register_circuit(5, hops, Instant::now()).unwrap().len(), 3);
        assert_eq!(manager.len(), 1);
        assert!(manager.destroy_circuit(5));
        assert!(manager.engine(5).is_none());
        assert!(!manager.destroy_circuit(5));
    }

    #[test]
    fn test_rotation_changes_every_secret() {
        let mut rng = RngHandle::from_seed(2);
        let hops = make_hops(&mut rng, "n");
        let mut manager = ForwardSecrecyManager::new(SecrecyConfig::default(), rng);
        let start = Instant::now();
        manager.register_circuit(1, hops, start).unwrap();
        let before = secrets(&manager, 1);

        assert!(!manager.should_rotate(1, start + Duration::from_secs(599)));
        let later = start + Duration::from_secs(600);
        let rotated = manager.rotate_due(later);
        assert_eq!(rotated.len(), 1);
        assert!(rotated[0].1.is_ok());

        let after = secrets(&manager, 1);
        for (old, new) in before.iter().zip(&after) {
            assert_ne!(old, new);
            // Next epoch comes off the ratchet chain, not a new handshake
            assert_eq!(&ratchet_secret(old).unwrap(), new);
        }
        assert_eq!(manager.last_rotation(1), Some(later));
        assert_eq!(manager.key_epoch(1), Some(1));
    }

    #[test]
    fn test_replace_hop_rekeys() {
        let mut rng = RngHandle::from_seed(3);
        let hops = make_hops(&mut rng, "n");
        let spare = make_hops(&mut rng, "spare").remove(0);
        let mut manager = ForwardSecrecyManager::new(SecrecyConfig::default(), rng);
        manager.register_circuit(1, hops, Instant::now()).unwrap();

        let before = secrets(&manager, 1);

        let layer = manager.replace_hop(1, 0, spare.clone()).unwrap();
        assert_eq!(layer.node_id, "spare-0");
        assert_eq!(layer.layer_index, 0);
        assert_eq!(manager.hops(1).unwrap()[0].node_id, "spare-0");

        let after = secrets(&manager, 1);
        assert_ne!(after[0], before[0]);
        assert_eq!(after[1..], before[1..]);
        assert!(manager.replace_hop(1, 3, spare).is_err());
    }

    #[test]
    fn test_replace_with_keyless_hop_keeps_old_state() {
        let mut rng = RngHandle::from_seed(4);
        let hops = make_hops(&mut rng, "n");
        let mut manager = ForwardSecrecyManager::new(SecrecyConfig::default(), rng);
        manager.register_circuit(1, hops, Instant::now()).unwrap();
        let before = secrets(&manager, 1);

        let bare = HopDescriptor::new("bare", "", HopPublicKeys::default());
        assert!(matches!(
            manager.replace_hop(1, 0, bare),
            Err(CryptoError::NoKeyMaterial { .. })
        ));
        assert_eq!(manager.hops(1).unwrap()[0].node_id, "n-0");
        assert_eq!(secrets(&manager, 1), before);
    }
}
