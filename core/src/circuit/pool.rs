// Circuit Pool — load balancing new streams across circuits

use super::mux::{Circuit, CircuitStats, HopRoute, MuxConfig};
use super::MuxError;
use crate::wire::Cell;
use serde::{Deserialize, Serialize};
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// Pool sizing and lifetime policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum concurrently held circuits
    pub max_circuits: usize,
    /// A circuit needs more than this many cells of send window to take new streams
    pub min_send_window: u32,
    /// Circuits older than this are torn down regardless of activity
    pub max_lifetime_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_circuits: 10,
            min_send_window: 100,
            max_lifetime_secs: 3600,
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> Result<(), MuxError> {
        if self.max_circuits == 0 {
            return Err(MuxError::InvalidConfig("max_circuits must be non-zero".into()));
        }
        if self.max_lifetime_secs == 0 {
            return Err(MuxError::InvalidConfig(
                "max_lifetime_secs must be non-zero".into(),
            ));
        }
        Ok(())
    }

    pub fn max_lifetime(&self) -> Duration {
        Duration::from_secs(self.max_lifetime_secs)
    }
}

/// Aggregate counters across the pool
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    pub total_circuits: usize,
    pub active_circuits: usize,
    pub open_streams: usize,
    pub cells_sent: u64,
    pub cells_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub circuits: Vec<CircuitStats>,
}

/// Owns every live circuit
#[derive(Debug, Default)]
pub struct CircuitPool {
    config: PoolConfig,
    mux_config: MuxConfig,
    circuits: BTreeMap<u32, Circuit>,
}

impl CircuitPool {
    pub fn new(config: PoolConfig, mux_config: MuxConfig) -> Self {
        Self {
            config,
            mux_config,
            circuits: BTreeMap::new(),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.circuits.len()
    }

    pub fn is_full(&self) -> bool {
        self.circuits.len() >= self.config.max_circuits
    }

    pub fn is_empty(&self) -> bool {
        self.circuits.is_empty()
    }

    pub fn circuit_ids(&self) -> Vec<u32> {
        self.circuits.keys().copied().collect()
    }

    pub fn get(&self, circuit_id: u32) -> Option<&Circuit> {
        self.circuits.get(&circuit_id)
    }

    pub fn get_mut(&mut self, circuit_id: u32) -> Option<&mut Circuit> {
        self.circuits.get_mut(&circuit_id)
    }

    /// Build and register a circuit over `route`
    pub fn open_circuit(&mut self, circuit_id: u32, route: Vec<HopRoute>) -> Result<&mut Circuit, MuxError> {
        let circuit = Circuit::new(circuit_id, route, self.mux_config.clone());
        self.add_circuit(circuit)
    }

    pub fn add_circuit(&mut self, circuit: Circuit) -> Result<&mut Circuit, MuxError> {
        let circuit_id = circuit.circuit_id();
        if !self.circuits.contains_key(&circuit_id) && self.is_full() {
            return Err(MuxError::PoolFull);
        }
        debug!("Pool holds circuit {}", circuit_id);
        let slot = match self.circuits.entry(circuit_id) {
            Entry::Occupied(mut entry) => {
                entry.insert(circuit);
                entry.into_mut()
            }
            Entry::Vacant(entry) => entry.insert(circuit),
        };
        Ok(slot)
    }

    pub fn remove(&mut self, circuit_id: u32) -> Option<Circuit> {
        self.circuits.remove(&circuit_id)
    }

    /// Active circuit with spare window and the fewest open streams
    pub fn get_best_circuit(&self) -> Option<u32> {
        self.circuits
            .values()
            .filter(|c| c.is_active() && c.circuit_send_window() > self.config.min_send_window)
            .min_by_key(|c| c.stream_count())
            .map(|c| c.circuit_id())
    }

    /// Open a stream on the best circuit
    pub fn create_stream(&mut self) -> Result<(u32, u16), MuxError> {
        let circuit_id = self.get_best_circuit().ok_or(MuxError::NoCapacity)?;
        let circuit = self
            .circuits
            .get_mut(&circuit_id)
            .ok_or(MuxError::UnknownCircuit(circuit_id))?;
        let stream_id = circuit.create_stream()?;
        Ok((circuit_id, stream_id))
    }

    /// Tear down circuits past their maximum lifetime
    ///
    /// Returns the DESTROY cell of every circuit removed.
    pub fn expire_circuits(&mut self, now: Instant) -> Vec<Cell> {
        let max_lifetime = self.config.max_lifetime();
        let expired: Vec<u32> = self
            .circuits
            .values()
            .filter(|c| c.age(now) >= max_lifetime)
            .map(|c| c.circuit_id())
            .collect();

        let mut destroys = Vec::with_capacity(expired.len());
        for circuit_id in expired {
            if let Some(mut circuit) = self.circuits.remove(&circuit_id) {
                info!("Circuit {} reached max lifetime, tearing down", circuit_id);
                if circuit.is_active() {
                    destroys.push(circuit.teardown());
                }
            }
        }
        destroys
    }

    /// Drop circuits that are no longer active
    pub fn reap_inactive(&mut self) -> Vec<u32> {
        let inactive: Vec<u32> = self
            .circuits
            .values()
            .filter(|c| !c.is_active())
            .map(|c| c.circuit_id())
            .collect();
        for circuit_id in &inactive {
            self.circuits.remove(circuit_id);
        }
        inactive
    }

    pub fn cleanup_idle_streams(&mut self, now: Instant) -> usize {
        self.circuits
            .values_mut()
            .map(|c| c.cleanup_idle_streams(now))
            .sum()
    }

    pub fn stats(&self, now: Instant) -> PoolStats {
        let circuits: Vec<CircuitStats> = self.circuits.values().map(|c| c.stats(now)).collect();
        PoolStats {
            total_circuits: circuits.len(),
            active_circuits: circuits.iter().filter(|c| c.active).count(),
            open_streams: circuits.iter().map(|c| c.open_streams).sum(),
            cells_sent: circuits.iter().map(|c| c.cells_sent).sum(),
            cells_received: circuits.iter().map(|c| c.cells_received).sum(),
            bytes_sent: circuits.iter().map(|c| c.bytes_sent).sum(),
            bytes_received: circuits.iter().map(|c| c.bytes_received).sum(),
            circuits,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_pool() -> CircuitPool {
        CircuitPool::new(PoolConfig::default(), MuxConfig::default())
    }

    #[test]
    fn test_best_circuit_balances_streams() {
        let mut pool = make_pool();
        pool.open_circuit(1, Vec::new()).unwrap();
        pool.open_circuit(2, Vec::new()).unwrap();

        let (first, _) = pool.create_stream().unwrap();
        let (second, _) = pool.create_stream().unwrap();
        assert_ne!(first, second);
        let (third, _) = pool.create_stream().unwrap();
        assert_eq!(third, first);
    }

    #[test]
    fn test_inactive_and_drained_circuits_skipped() {
        let mut pool = make_pool();
        pool.open_circuit(1, Vec::new()).unwrap().teardown();
        assert_eq!(pool.get_best_circuit(), None);
        assert_eq!(pool.create_stream(), Err(MuxError::NoCapacity));

        pool.open_circuit(2, Vec::new()).unwrap();
        assert_eq!(pool.get_best_circuit(), Some(2));
        assert_eq!(pool.reap_inactive(), vec![1]);
    }

    #[test]
    fn test_pool_full() {
        let mut pool = CircuitPool::new(
            PoolConfig {
                max_circuits: 1,
                ..Default::default()
            },
            MuxConfig::default(),
        );
        pool.open_circuit(1, Vec::new()).unwrap();
        assert!(matches!(pool.open_circuit(2, Vec::new()), Err(MuxError::PoolFull)));
    }

    #[test]
    fn test_expire_circuits() {
        let mut pool = make_pool();
        pool.open_circuit(1, Vec::new()).unwrap();
        let now = Instant::now();
        assert!(pool.expire_circuits(now).is_empty());
        assert!(pool.expire_circuits(now + Duration::from_secs(3599)).is_empty());
        let destroys = pool.expire_circuits(now + Duration::from_secs(3601));
        assert_eq!(destroys.len(), 1);
        assert_eq!(destroys[0].circuit_id, 1);
        assert!(pool.is_empty());
    }

    #[test]
    fn test_stats_aggregate() {
        let mut pool = make_pool();
        pool.open_circuit(1, Vec::new()).unwrap();
        pool.open_circuit(2, Vec::new()).unwrap();
        pool.create_stream().unwrap();
        let stats = pool.stats(Instant::now());
        assert_eq!(stats.total_circuits, 2);
        assert_eq!(stats.active_circuits, 2);
        assert_eq!(stats.open_streams, 1);
    }
}
