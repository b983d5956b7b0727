//! Transport trait, spare hop pool and an in-process transport

use crate::crypto::HopDescriptor;
use async_trait::async_trait;
use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// Delivers serialized envelopes to the next hop
///
/// Implementers wrap a real network stack. `send` returns `false` when the
/// destination could not be reached; the caller decides whether to heal.
#[async_trait]
pub trait ForwardTransport: Send + Sync {
    async fn send(&self, bytes: Vec<u8>, destination: &str) -> bool;
}

/// Spare hops for circuit healing
#[derive(Debug, Default, Clone)]
pub struct HopPool {
    spares: VecDeque<HopDescriptor>,
}

impl HopPool {
    pub fn new(spares: Vec<HopDescriptor>) -> Self {
        Self {
            spares: spares.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.spares.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spares.is_empty()
    }

    pub fn add(&mut self, hop: HopDescriptor) {
        self.spares.push_back(hop);
    }

    /// Take the first spare that is not already part of `in_use`
    pub fn take_substitute(&mut self, in_use: &[HopDescriptor]) -> Option<HopDescriptor> {
        let taken: BTreeSet<&str> = in_use.iter().map(|h| h.node_id.as_str()).collect();
        let position = self
            .spares
            .iter()
            .position(|h| !taken.contains(h.node_id.as_str()))?;
        self.spares.remove(position)
    }
}

/// In-process transport that records every accepted envelope
///
/// Destinations marked unreachable reject sends. Used for local test nets.
#[derive(Debug, Clone, Default)]
pub struct MemoryTransport {
    inner: Arc<Mutex<MemoryState>>,
}

#[derive(Debug, Default)]
struct MemoryState {
    delivered: Vec<(String, Vec<u8>)>,
    unreachable: BTreeSet<String>,
    rejected: usize,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_unreachable(&self, destination: &str, unreachable: bool) {
        let mut state = self.inner.lock().await;
        if unreachable {
            state.unreachable.insert(destination.to_string());
        } else {
            state.unreachable.remove(destination);
        }
    }

    /// Take everything delivered so far
    pub async fn drain(&self) -> Vec<(String, Vec<u8>)> {
        std::mem::take(&mut self.inner.lock().await.delivered)
    }

    pub async fn rejected(&self) -> usize {
        self.inner.lock().await.rejected
    }
}

#[async_trait]
impl ForwardTransport for MemoryTransport {
    async fn send(&self, bytes: Vec<u8>, destination: &str) -> bool {
        let mut state = self.inner.lock().await;
        if state.unreachable.contains(destination) {
            state.rejected += 1;
            debug!("Memory transport rejected {} bytes to {}", bytes.len(), destination);
            return false;
        }
        state.delivered.push((destination.to_string(), bytes));
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::HopPublicKeys;

    fn hop(id: &str) -> HopDescriptor {
        HopDescriptor::new(id, format!("{}:9001", id), HopPublicKeys::default())
    }

    #[test]
    fn test_take_substitute_skips_hops_in_use() {
        let mut pool = HopPool::new(vec![hop("a"), hop("b"), hop("c")]);
        let in_use = vec![hop("a"), hop("x"), hop("y")];
        assert_eq!(pool.take_substitute(&in_use).unwrap().node_id, "b");
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.take_substitute(&in_use).unwrap().node_id, "c");
        assert!(pool.take_substitute(&in_use).is_none());
    }

    #[tokio::test]
    async fn test_memory_transport_records_and_rejects() {
        let transport = MemoryTransport::new();
        assert!(transport.send(vec![1, 2], "r1").await);
        transport.set_unreachable("r2", true).await;
        assert!(!transport.send(vec![3], "r2").await);
        assert_eq!(transport.rejected().await, 1);

        let delivered = transport.drain().await;
        assert_eq!(delivered, vec![("r1".to_string(), vec![1, 2])]);
        assert!(transport.drain().await.is_empty());
    }
}
