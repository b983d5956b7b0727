// Onion Session — single-owner send/receive loop over a circuit pool
//
// Outbound path per application write:
//   send → TrafficShaper (chunk, jitter, mix) → due packets →
//   Circuit::send_data → process_outbound → onion envelope → transport
//
// The session is the only owner of the pool, the key bindings and the
// shaper. It suspends only on transport sends, the next mix due time and
// the sweep timer.
//
// A due real packet that meets an exhausted send window waits in its flow's
// backlog until SENDME credit arrives; backlogged packets always go before
// newer ones of the same flow. Cover is never backlogged.

use crate::circuit::{Circuit, CircuitPool, ForwardSecrecyManager, HopRoute, MuxError, PoolStats};
use crate::config::EngineConfig;
use crate::crypto::{CryptoError, HopDescriptor, OnionLayer, CIPHER_SUITE, KEM_ALGORITHMS};
use crate::privacy::{ChunkReassembler, RotationPack, ShapeReport, TrafficShaper};
use crate::rng::RngHandle;
use crate::transport::{ForwardError, ForwardTransport, HopPool};
use crate::wire::{Cell, CellCommand};
use crate::CoreError;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Mix label for one stream
fn flow_of(circuit_id: u32, stream_id: u16) -> u64 {
    ((circuit_id as u64) << 16) | stream_id as u64
}

fn split_flow(flow: u64) -> (u32, u16) {
    ((flow >> 16) as u32, (flow & 0xffff) as u16)
}

/// Outcome of one maintenance pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub streams_reaped: usize,
    pub circuits_expired: Vec<u32>,
    pub circuits_rekeyed: Vec<u32>,
    pub circuits_failed: Vec<u32>,
}

pub struct OnionSession<T: ForwardTransport> {
    config: EngineConfig,
    pool: CircuitPool,
    secrecy: ForwardSecrecyManager,
    shaper: TrafficShaper,
    spares: HopPool,
    transport: T,
    reassemblers: BTreeMap<(u32, u16), ChunkReassembler>,
    backlog: BTreeMap<u64, VecDeque<Vec<u8>>>,
    closing: BTreeSet<u64>,
    last_flow: Option<u64>,
    next_circuit_id: u32,
    last_sweep: Instant,
}

/// Feed held packets to a stream in order until its window shuts again
fn drain_backlog(circuit: &mut Circuit, stream_id: u16, queue: &mut VecDeque<Vec<u8>>) -> Result<(), MuxError> {
    while let Some(payload) = queue.front() {
        match circuit.try_send_data(stream_id, payload) {
            Ok(()) => {
                queue.pop_front();
            }
            Err(MuxError::FlowControlBlocked { .. }) => return Ok(()),
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

impl<T: ForwardTransport> OnionSession<T> {
    pub fn new(
        config: EngineConfig,
        transport: T,
        spares: Vec<HopDescriptor>,
        mut rng: RngHandle,
    ) -> Result<Self, CoreError> {
        config.validate()?;
        let now = Instant::now();
        let shaper = TrafficShaper::new_at(config.shaping.clone(), rng.fork(), now)?;
        let secrecy = ForwardSecrecyManager::new(config.secrecy.clone(), rng.fork());
        let pool = CircuitPool::new(config.pool.clone(), config.mux.clone());

        info!(
            "Onion session starting: kem={} cipher={} shaping: {}",
            KEM_ALGORITHMS.join("+"),
            CIPHER_SUITE,
            shaper.config().summary()
        );

        Ok(Self {
            config,
            pool,
            secrecy,
            shaper,
            spares: HopPool::new(spares),
            transport,
            reassemblers: BTreeMap::new(),
            backlog: BTreeMap::new(),
            closing: BTreeSet::new(),
            last_flow: None,
            next_circuit_id: 1,
            last_sweep: now,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn pool(&self) -> &CircuitPool {
        &self.pool
    }

    pub fn secrecy(&self) -> &ForwardSecrecyManager {
        &self.secrecy
    }

    pub fn shaper(&self) -> &TrafficShaper {
        &self.shaper
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn spares_mut(&mut self) -> &mut HopPool {
        &mut self.spares
    }

    /// Established layers of an originated circuit (handshakes for the hops)
    ///
    /// After healing, the substitute's layer carries a new handshake and
    /// the epoch it was keyed at; the other layers are unchanged.
    pub fn layers(&self, circuit_id: u32) -> Option<&[OnionLayer]> {
        self.secrecy.engine(circuit_id).map(|e| e.layers())
    }

    /// Real packets held back by flow control across all streams
    pub fn blocked_packets(&self) -> usize {
        self.backlog.values().map(VecDeque::len).sum()
    }

    fn pending_real(&self, flow: u64) -> usize {
        self.shaper.pending_real(flow) + self.backlog.get(&flow).map_or(0, VecDeque::len)
    }

    pub fn stats(&self, now: Instant) -> PoolStats {
        self.pool.stats(now)
    }

    fn allocate_circuit_id(&mut self) -> u32 {
        loop {
            let candidate = self.next_circuit_id;
            self.next_circuit_id = self.next_circuit_id.checked_add(1).unwrap_or(1);
            if candidate != 0 && self.pool.get(candidate).is_none() {
                return candidate;
            }
        }
    }

    /// Key a new circuit over `hops` and add it to the pool
    pub fn open_circuit(&mut self, hops: Vec<HopDescriptor>) -> Result<u32, CoreError> {
        if self.pool.is_full() {
            return Err(MuxError::PoolFull.into());
        }
        let circuit_id = self.allocate_circuit_id();
        let route: Vec<HopRoute> = hops
            .iter()
            .map(|h| HopRoute {
                node_id: h.node_id.clone(),
                endpoint: h.endpoint.clone(),
            })
            .collect();

        self.secrecy
            .register_circuit(circuit_id, hops, Instant::now())?;
        if let Err(e) = self.pool.open_circuit(circuit_id, route) {
            self.secrecy.destroy_circuit(circuit_id);
            return Err(e.into());
        }
        Ok(circuit_id)
    }

    /// Register the far end of a circuit someone else keyed
    pub fn accept_circuit(&mut self, circuit_id: u32) -> Result<(), CoreError> {
        self.pool.open_circuit(circuit_id, Vec::new())?;
        Ok(())
    }

    /// Open a stream on the least loaded circuit
    pub fn open_stream(&mut self) -> Result<(u32, u16), CoreError> {
        Ok(self.pool.create_stream()?)
    }

    pub fn open_stream_on(&mut self, circuit_id: u32) -> Result<u16, CoreError> {
        let circuit = self
            .pool
            .get_mut(circuit_id)
            .ok_or(MuxError::UnknownCircuit(circuit_id))?;
        Ok(circuit.create_stream()?)
    }

    /// Shape `data` into the mix for a stream
    pub fn send(&mut self, circuit_id: u32, stream_id: u16, data: &[u8]) -> Result<ShapeReport, CoreError> {
        let circuit = self
            .pool
            .get(circuit_id)
            .ok_or(MuxError::UnknownCircuit(circuit_id))?;
        if !circuit.is_active() {
            return Err(MuxError::CircuitInactive(circuit_id).into());
        }
        let flow = flow_of(circuit_id, stream_id);
        if !circuit.stream(stream_id).map_or(false, |s| s.is_open()) || self.closing.contains(&flow) {
            return Err(MuxError::StreamNotOpen(stream_id).into());
        }
        self.last_flow = Some(flow);
        Ok(self.shaper.shape(data, flow, Instant::now()))
    }

    /// Close once everything already shaped for the stream has left the mix
    pub fn close_stream(&mut self, circuit_id: u32, stream_id: u16) -> Result<(), CoreError> {
        let circuit = self
            .pool
            .get_mut(circuit_id)
            .ok_or(MuxError::UnknownCircuit(circuit_id))?;
        let flow = flow_of(circuit_id, stream_id);
        let pending = self.shaper.pending_real(flow) + self.backlog.get(&flow).map_or(0, VecDeque::len);
        if pending == 0 {
            circuit.close_stream(stream_id)?;
            self.shaper.discard_flow(flow);
        } else if circuit.stream(stream_id).map_or(false, |s| s.is_open()) {
            self.closing.insert(flow);
        } else {
            return Err(MuxError::StreamNotOpen(stream_id).into());
        }
        if self.last_flow == Some(flow) {
            self.last_flow = None;
        }
        Ok(())
    }

    /// Mark the application idle so cover pumping resumes
    pub fn notify_idle(&mut self) {
        self.shaper.notify_idle();
    }

    /// Queue idle cover on the most recently used open stream
    pub fn pump_cover(&mut self, now: Instant) -> usize {
        let Some(flow) = self.last_flow else {
            return 0;
        };
        let (circuit_id, stream_id) = split_flow(flow);
        let open = self
            .pool
            .get(circuit_id)
            .and_then(|c| c.stream(stream_id))
            .map_or(false, |s| s.is_open());
        if !open {
            self.last_flow = None;
            return 0;
        }
        self.shaper.pump_cover(now, flow)
    }

    /// Apply a rotation pack to the shaping pipeline
    pub fn apply_rotation(&mut self, pack: &RotationPack, now_unix: u64) -> Result<(), CoreError> {
        Ok(self.shaper.apply(pack, now_unix)?)
    }

    /// Move due mix packets into their streams and forward every ready cell
    ///
    /// Held packets go first; real packets a shut window refuses are held
    /// rather than dropped. Returns the number of cells forwarded. A circuit
    /// whose forwarding fails is torn down; the first such error is returned
    /// after the remaining circuits have been served.
    pub async fn flush_due(&mut self, now: Instant) -> Result<usize, CoreError> {
        self.retry_backlog();
        for packet in self.shaper.due(now) {
            self.admit(packet.flow, packet.payload, packet.is_cover);
        }
        self.finish_closes();

        let mut forwarded = 0;
        let mut first_error = None;
        let originated: Vec<u32> = self
            .pool
            .circuit_ids()
            .into_iter()
            .filter(|id| self.secrecy.engine(*id).is_some())
            .collect();
        for circuit_id in originated {
            match self.drain_circuit(circuit_id).await {
                Ok(n) => forwarded += n,
                Err(e) => {
                    warn!("Circuit {} failed: {}", circuit_id, e);
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(forwarded),
        }
    }

    /// Hand one mix packet to its stream, or hold it if the window is shut
    fn admit(&mut self, flow: u64, payload: Vec<u8>, is_cover: bool) {
        let (circuit_id, stream_id) = split_flow(flow);
        if let Some(queue) = self.backlog.get_mut(&flow) {
            if !is_cover {
                queue.push_back(payload);
            }
            return;
        }
        let result = match self.pool.get_mut(circuit_id) {
            Some(circuit) => circuit.try_send_data(stream_id, &payload),
            None => Err(MuxError::UnknownCircuit(circuit_id)),
        };
        match result {
            Ok(()) => {}
            Err(MuxError::FlowControlBlocked { .. }) if !is_cover => {
                debug!(
                    "Circuit {} stream {} blocked, holding data",
                    circuit_id, stream_id
                );
                self.backlog.entry(flow).or_default().push_back(payload);
            }
            Err(e) => debug!(
                "Dropping {} mix packet for circuit {} stream {}: {}",
                if is_cover { "cover" } else { "data" },
                circuit_id,
                stream_id,
                e
            ),
        }
    }

    /// Move held packets into streams whose window has reopened
    fn retry_backlog(&mut self) {
        let flows: Vec<u64> = self.backlog.keys().copied().collect();
        for flow in flows {
            let (circuit_id, stream_id) = split_flow(flow);
            let Some(queue) = self.backlog.get_mut(&flow) else {
                continue;
            };
            let outcome = match self.pool.get_mut(circuit_id) {
                Some(circuit) => drain_backlog(circuit, stream_id, queue),
                None => Err(MuxError::UnknownCircuit(circuit_id)),
            };
            match outcome {
                Ok(()) if queue.is_empty() => {
                    self.backlog.remove(&flow);
                }
                Ok(()) => {}
                Err(e) => {
                    debug!(
                        "Dropping {} held packets for circuit {} stream {}: {}",
                        queue.len(),
                        circuit_id,
                        stream_id,
                        e
                    );
                    self.backlog.remove(&flow);
                }
            }
        }
    }

    fn finish_closes(&mut self) {
        let ready: Vec<u64> = self
            .closing
            .iter()
            .copied()
            .filter(|flow| self.pending_real(*flow) == 0)
            .collect();
        for flow in ready {
            self.closing.remove(&flow);
            self.shaper.discard_flow(flow);
            let (circuit_id, stream_id) = split_flow(flow);
            if let Some(circuit) = self.pool.get_mut(circuit_id) {
                if let Err(e) = circuit.close_stream(stream_id) {
                    debug!("Deferred close of stream {} skipped: {}", stream_id, e);
                }
            }
        }
    }

    async fn drain_circuit(&mut self, circuit_id: u32) -> Result<usize, CoreError> {
        let mut sent = 0;
        while let Some(cell) = self
            .pool
            .get_mut(circuit_id)
            .and_then(|c| c.process_outbound())
        {
            self.forward_cell(circuit_id, &cell).await?;
            sent += 1;
        }
        Ok(sent)
    }

    /// Seal `cell` for the circuit's first hop; returns (bytes, endpoint, node id)
    fn seal_cell(&mut self, circuit_id: u32, cell: &Cell) -> Result<(Vec<u8>, String, String), CoreError> {
        let engine = self
            .secrecy
            .engine_mut(circuit_id)
            .ok_or(CryptoError::CircuitNotEstablished)?;
        let envelope = engine.wrap_envelope(&cell.to_bytes(), &BTreeMap::new(), BTreeMap::new())?;
        let first = engine
            .layers()
            .first()
            .ok_or(CryptoError::CircuitNotEstablished)?;
        Ok((envelope.to_bytes()?, first.endpoint.clone(), first.node_id.clone()))
    }

    /// Send one cell, healing the first hop once on failure
    async fn forward_cell(&mut self, circuit_id: u32, cell: &Cell) -> Result<(), CoreError> {
        let (bytes, endpoint, node_id) = match self.seal_cell(circuit_id, cell) {
            Ok(sealed) => sealed,
            Err(e) => {
                self.teardown_circuit(circuit_id);
                return Err(e);
            }
        };
        if self.transport.send(bytes, &endpoint).await {
            return Ok(());
        }

        warn!(
            "Circuit {} first hop {} unreachable, healing",
            circuit_id, node_id
        );
        let healed = self
            .heal_first_hop(circuit_id)
            .and_then(|()| self.seal_cell(circuit_id, cell));
        let (bytes, endpoint, node_id) = match healed {
            Ok(sealed) => sealed,
            Err(e) => {
                self.teardown_circuit(circuit_id);
                return Err(e);
            }
        };
        if self.transport.send(bytes, &endpoint).await {
            info!("Circuit {} healed via {}", circuit_id, node_id);
            return Ok(());
        }

        self.teardown_circuit(circuit_id);
        Err(ForwardError::Unreachable {
            circuit_id,
            node_id,
        }
        .into())
    }

    fn heal_first_hop(&mut self, circuit_id: u32) -> Result<(), CoreError> {
        let hops = self
            .secrecy
            .hops(circuit_id)
            .ok_or(CryptoError::CircuitNotEstablished)?
            .to_vec();
        let substitute = self
            .spares
            .take_substitute(&hops)
            .ok_or(ForwardError::NoSubstitute(circuit_id))?;
        let route = HopRoute {
            node_id: substitute.node_id.clone(),
            endpoint: substitute.endpoint.clone(),
        };
        let layer = self.secrecy.replace_hop(circuit_id, 0, substitute)?;
        debug!(
            "Circuit {} first hop {} keyed at epoch {}",
            circuit_id, layer.node_id, layer.keyed_epoch
        );
        if let Some(circuit) = self.pool.get_mut(circuit_id) {
            circuit.replace_route_hop(0, route);
        }
        Ok(())
    }

    /// Drop a circuit locally and wipe its keys; returns its DESTROY cell
    pub fn teardown_circuit(&mut self, circuit_id: u32) -> Option<Cell> {
        let destroy = self.pool.remove(circuit_id).map(|mut c| c.teardown());
        self.forget_circuit(circuit_id);
        destroy
    }

    fn forget_circuit(&mut self, circuit_id: u32) {
        self.secrecy.destroy_circuit(circuit_id);
        self.reassemblers.retain(|(cid, _), _| *cid != circuit_id);
        self.backlog.retain(|flow, _| split_flow(*flow).0 != circuit_id);
        let flows: Vec<u64> = self
            .closing
            .iter()
            .copied()
            .filter(|f| split_flow(*f).0 == circuit_id)
            .collect();
        for flow in flows {
            self.closing.remove(&flow);
            self.shaper.discard_flow(flow);
        }
        if self.last_flow.map_or(false, |f| split_flow(f).0 == circuit_id) {
            self.last_flow = None;
        }
    }

    /// Dispatch one inbound cell
    pub fn receive(&mut self, cell_bytes: &[u8]) -> Result<(), CoreError> {
        let cell = Cell::from_bytes(cell_bytes)?;
        let circuit_id = cell.circuit_id;
        let destroy = cell.command == CellCommand::Destroy;
        let circuit = self
            .pool
            .get_mut(circuit_id)
            .ok_or(MuxError::UnknownCircuit(circuit_id))?;
        circuit.process_inbound(cell)?;
        if destroy {
            self.pool.remove(circuit_id);
            self.forget_circuit(circuit_id);
        }
        Ok(())
    }

    /// Application bytes received on a stream so far; cover is dropped
    pub fn read(&mut self, circuit_id: u32, stream_id: u16) -> Result<Vec<u8>, CoreError> {
        let stream = self
            .pool
            .get_mut(circuit_id)
            .ok_or(MuxError::UnknownCircuit(circuit_id))?
            .stream_mut(stream_id)
            .ok_or(MuxError::StreamNotOpen(stream_id))?;
        let raw = stream.read_all();
        let reassembler = self.reassemblers.entry((circuit_id, stream_id)).or_default();
        Ok(reassembler.push(&raw).concat())
    }

    /// Cells queued on a circuit this session did not key (the far end)
    pub fn take_outbound(&mut self, circuit_id: u32) -> Vec<Cell> {
        let mut cells = Vec::new();
        if self.secrecy.engine(circuit_id).is_some() {
            return cells;
        }
        if let Some(circuit) = self.pool.get_mut(circuit_id) {
            while let Some(cell) = circuit.process_outbound() {
                cells.push(cell);
            }
        }
        cells
    }

    /// Idle-stream cleanup, lifetime expiry and key rotation
    pub async fn sweep(&mut self, now: Instant) -> SweepReport {
        let mut report = SweepReport {
            streams_reaped: self.pool.cleanup_idle_streams(now),
            ..Default::default()
        };

        for destroy in self.pool.expire_circuits(now) {
            let circuit_id = destroy.circuit_id;
            match self.seal_cell(circuit_id, &destroy) {
                Ok((bytes, endpoint, _)) => {
                    if !self.transport.send(bytes, &endpoint).await {
                        debug!("DESTROY for circuit {} not delivered", circuit_id);
                    }
                }
                Err(e) => debug!("DESTROY for circuit {} not sealed: {}", circuit_id, e),
            }
            self.forget_circuit(circuit_id);
            report.circuits_expired.push(circuit_id);
        }

        for circuit_id in self.pool.reap_inactive() {
            self.forget_circuit(circuit_id);
        }

        for (circuit_id, result) in self.secrecy.rotate_due(now) {
            match result {
                Ok(()) => report.circuits_rekeyed.push(circuit_id),
                Err(_) => {
                    self.teardown_circuit(circuit_id);
                    report.circuits_failed.push(circuit_id);
                }
            }
        }

        self.last_sweep = now;
        if report != SweepReport::default() {
            debug!("Sweep: {:?}", report);
        }
        report
    }

    /// Drive the session until `deadline`
    ///
    /// Each pass flushes due packets, sweeps when the interval has elapsed
    /// and pumps idle cover, then sleeps until the next mix due time, the
    /// next sweep or the deadline, whichever comes first.
    pub async fn run_until(&mut self, deadline: Instant) -> Result<(), CoreError> {
        let sweep_interval = self.config.sweep_interval();
        loop {
            let now = Instant::now();
            self.flush_due(now).await?;
            if now.saturating_duration_since(self.last_sweep) >= sweep_interval {
                self.sweep(now).await;
            }
            self.pump_cover(now);
            if now >= deadline {
                return Ok(());
            }

            let next_sweep = self.last_sweep + sweep_interval;
            let wake = self
                .shaper
                .next_due()
                .map_or(next_sweep, |due| due.min(next_sweep))
                .min(deadline)
                .max(now + Duration::from_millis(1));
            tokio::time::sleep_until(wake).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MemoryTransport, RelayAction, RelayNode};
    use crate::wire::OnionEnvelope;

    fn make_relays(rng: &mut RngHandle, n: usize, prefix: &str) -> Vec<RelayNode> {
        (0..n)
            .map(|i| RelayNode::generate(format!("{}-{}", prefix, i), format!("{}-{}:9001", prefix, i), rng))
            .collect()
    }

    fn descriptors(relays: &[RelayNode]) -> Vec<HopDescriptor> {
        relays
            .iter()
            .map(|r| HopDescriptor::new(r.node_id(), r.endpoint(), r.public_keys()))
            .collect()
    }

    fn make_session(spares: Vec<HopDescriptor>) -> OnionSession<MemoryTransport> {
        OnionSession::new(
            EngineConfig::default(),
            MemoryTransport::new(),
            spares,
            RngHandle::from_seed(99),
        )
        .unwrap()
    }

    #[test]
    fn test_flow_labels_roundtrip() {
        assert_eq!(split_flow(flow_of(7, 3)), (7, 3));
        assert_eq!(split_flow(flow_of(u32::MAX, u16::MAX)), (u32::MAX, u16::MAX));
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_reaches_exit_relay() {
        let mut rng = RngHandle::from_seed(1);
        let mut relays = make_relays(&mut rng, 3, "r");
        let mut session = make_session(Vec::new());
        let circuit_id = session.open_circuit(descriptors(&relays)).unwrap();
        for (relay, layer) in relays.iter_mut().zip(session.layers(circuit_id).unwrap()) {
            relay
                .accept_handshake(circuit_id, layer.layer_index, &layer.handshake)
                .unwrap();
        }

        let stream_id = session.open_stream_on(circuit_id).unwrap();
        session.send(circuit_id, stream_id, b"hello onion").unwrap();
        let forwarded = session
            .flush_due(Instant::now() + Duration::from_secs(60))
            .await
            .unwrap();
        assert!(forwarded >= 2);

        let mut commands = Vec::new();
        for (destination, bytes) in session.transport().drain().await {
            assert_eq!(destination, "r-0:9001");
            let mut envelope = OnionEnvelope::from_bytes(&bytes).unwrap();
            let mut hop = 0;
            let cell = loop {
                match relays[hop].process_envelope(&envelope).unwrap() {
                    RelayAction::Forward(next) => {
                        envelope = next;
                        hop += 1;
                    }
                    RelayAction::Deliver { payload, .. } => break Cell::from_bytes(&payload).unwrap(),
                }
            };
            commands.push(cell.command);
        }
        assert_eq!(commands[0], CellCommand::Begin);
        assert!(commands[1..].iter().all(|c| *c == CellCommand::Data));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_circuit_errors() {
        let mut session = make_session(Vec::new());
        assert!(matches!(
            session.send(5, 1, b"x"),
            Err(CoreError::Mux(MuxError::UnknownCircuit(5)))
        ));
        assert!(matches!(
            session.open_stream(),
            Err(CoreError::Mux(MuxError::NoCapacity))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_waits_for_mix() {
        let mut rng = RngHandle::from_seed(2);
        let relays = make_relays(&mut rng, 3, "c");
        let mut session = make_session(Vec::new());
        let circuit_id = session.open_circuit(descriptors(&relays)).unwrap();
        let stream_id = session.open_stream_on(circuit_id).unwrap();
        session.send(circuit_id, stream_id, &[7u8; 2000]).unwrap();
        session.close_stream(circuit_id, stream_id).unwrap();

        let stream = session.pool().get(circuit_id).unwrap().stream(stream_id).unwrap();
        assert!(stream.is_open());
        assert!(session.send(circuit_id, stream_id, b"late").is_err());

        session
            .flush_due(Instant::now() + Duration::from_secs(60))
            .await
            .unwrap();
        let circuit = session.pool().get(circuit_id).unwrap();
        assert!(!circuit.stream(stream_id).unwrap().is_open());
        assert_eq!(session.shaper().pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_expires_and_rekeys() {
        let mut rng = RngHandle::from_seed(3);
        let relays = make_relays(&mut rng, 3, "s");
        let mut config = EngineConfig::default();
        config.secrecy.rotation_interval_secs = 10;
        config.pool.max_lifetime_secs = 30;
        let mut session = OnionSession::new(
            config,
            MemoryTransport::new(),
            Vec::new(),
            RngHandle::from_seed(4),
        )
        .unwrap();
        let circuit_id = session.open_circuit(descriptors(&relays)).unwrap();
        let start = Instant::now();

        let report = session.sweep(start + Duration::from_secs(11)).await;
        assert_eq!(report.circuits_rekeyed, vec![circuit_id]);

        let report = session.sweep(start + Duration::from_secs(31)).await;
        assert_eq!(report.circuits_expired, vec![circuit_id]);
        assert!(session.pool().is_empty());
        assert!(session.secrecy().is_empty());
        // DESTROY went out to the first hop
        assert_eq!(session.transport().drain().await.len(), 1);
    }
}
