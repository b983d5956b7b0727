// Circuit Multiplexer — many streams over one onion path
//
// Outbound priority: queued control cells first, then one DATA cell from the
// next sendable stream after the last one served (round robin by stream id).
// Only DATA consumes window; control cells always go out so SENDMEs can never
// deadlock behind an exhausted window.

use super::stream::{Stream, StreamState};
use super::MuxError;
use crate::wire::{Cell, CellCommand, CELL_PAYLOAD_SIZE, CIRCUIT_LEVEL_STREAM};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::ops::Bound::{Excluded, Unbounded};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Flow-control and lifecycle parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MuxConfig {
    /// Initial per-stream send and receive window (cells)
    pub stream_window: u32,
    /// Initial per-circuit send and receive window (cells)
    pub circuit_window: u32,
    /// Cells credited by one stream-level SENDME
    pub stream_sendme_increment: u32,
    /// Cells credited by one circuit-level SENDME
    pub circuit_sendme_increment: u32,
    /// Open streams idle this long are reaped
    pub stream_idle_timeout_secs: u64,
    /// Closed streams linger this long before removal
    pub closed_stream_grace_ms: u64,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            stream_window: 500,
            circuit_window: 1000,
            stream_sendme_increment: 50,
            circuit_sendme_increment: 100,
            stream_idle_timeout_secs: 60,
            closed_stream_grace_ms: 1000,
        }
    }
}

impl MuxConfig {
    pub fn validate(&self) -> Result<(), MuxError> {
        if self.stream_window == 0 || self.circuit_window == 0 {
            return Err(MuxError::InvalidConfig("windows must be non-zero".into()));
        }
        if self.stream_sendme_increment == 0 || self.stream_sendme_increment > self.stream_window {
            return Err(MuxError::InvalidConfig(
                "stream SENDME increment must be in 1..=stream_window".into(),
            ));
        }
        if self.circuit_sendme_increment == 0 || self.circuit_sendme_increment > self.circuit_window
        {
            return Err(MuxError::InvalidConfig(
                "circuit SENDME increment must be in 1..=circuit_window".into(),
            ));
        }
        Ok(())
    }

    pub fn stream_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_idle_timeout_secs)
    }

    pub fn closed_stream_grace(&self) -> Duration {
        Duration::from_millis(self.closed_stream_grace_ms)
    }
}

/// Public routing information for one hop; secrets live with the
/// forward-secrecy manager
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HopRoute {
    pub node_id: String,
    pub endpoint: String,
}

/// Point-in-time counters for one circuit
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitStats {
    pub circuit_id: u32,
    pub active: bool,
    pub cells_sent: u64,
    pub data_cells_sent: u64,
    pub control_cells_sent: u64,
    pub cells_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub circuit_send_window: u32,
    pub circuit_recv_window: u32,
    pub open_streams: usize,
    pub age_secs: u64,
}

#[derive(Debug, Default)]
struct Counters {
    data_cells_sent: u64,
    control_cells_sent: u64,
    cells_received: u64,
    bytes_sent: u64,
    bytes_received: u64,
}

/// One circuit's multiplexing state
#[derive(Debug)]
pub struct Circuit {
    circuit_id: u32,
    config: MuxConfig,
    route: Vec<HopRoute>,
    streams: BTreeMap<u16, Stream>,
    circuit_send_window: u32,
    circuit_recv_window: u32,
    outbound_cells: VecDeque<Cell>,
    active: bool,
    next_stream_id: u16,
    last_served: Option<u16>,
    created_at: Instant,
    counters: Counters,
}

impl Circuit {
    pub fn new(circuit_id: u32, route: Vec<HopRoute>, config: MuxConfig) -> Self {
        Self::new_at(circuit_id, route, config, Instant::now())
    }

    pub fn new_at(circuit_id: u32, route: Vec<HopRoute>, config: MuxConfig, now: Instant) -> Self {
        Self {
            circuit_id,
            circuit_send_window: config.circuit_window,
            circuit_recv_window: config.circuit_window,
            config,
            route,
            streams: BTreeMap::new(),
            outbound_cells: VecDeque::new(),
            active: true,
            next_stream_id: 1,
            last_served: None,
            created_at: now,
            counters: Counters::default(),
        }
    }

    pub fn circuit_id(&self) -> u32 {
        self.circuit_id
    }

    pub fn route(&self) -> &[HopRoute] {
        &self.route
    }

    /// Swap one hop's routing entry (healing)
    pub fn replace_route_hop(&mut self, position: usize, hop: HopRoute) -> bool {
        match self.route.get_mut(position) {
            Some(slot) => {
                *slot = hop;
                true
            }
            None => false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn circuit_send_window(&self) -> u32 {
        self.circuit_send_window
    }

    pub fn circuit_recv_window(&self) -> u32 {
        self.circuit_recv_window
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.created_at)
    }

    pub fn stream(&self, stream_id: u16) -> Option<&Stream> {
        self.streams.get(&stream_id)
    }

    pub fn stream_mut(&mut self, stream_id: u16) -> Option<&mut Stream> {
        self.streams.get_mut(&stream_id)
    }

    /// Number of streams still open
    pub fn stream_count(&self) -> usize {
        self.streams.values().filter(|s| s.is_open()).count()
    }

    pub fn pending_control_cells(&self) -> usize {
        self.outbound_cells.len()
    }

    /// Allocate a stream id, open the stream and queue BEGIN
    pub fn create_stream(&mut self) -> Result<u16, MuxError> {
        if !self.active {
            return Err(MuxError::CircuitInactive(self.circuit_id));
        }
        let stream_id = self.allocate_stream_id()?;
        self.streams.insert(
            stream_id,
            Stream::new(stream_id, self.config.stream_window, Instant::now()),
        );
        self.queue_control(CellCommand::Begin, stream_id);
        debug!("Circuit {} opened stream {}", self.circuit_id, stream_id);
        Ok(stream_id)
    }

    fn allocate_stream_id(&mut self) -> Result<u16, MuxError> {
        for _ in 0..u16::MAX {
            let candidate = self.next_stream_id;
            self.next_stream_id = if candidate == u16::MAX { 1 } else { candidate + 1 };
            if candidate != CIRCUIT_LEVEL_STREAM && !self.streams.contains_key(&candidate) {
                return Ok(candidate);
            }
        }
        Err(MuxError::StreamIdsExhausted)
    }

    /// Queue bytes on a stream; false means nothing was buffered
    pub fn send_data(&mut self, stream_id: u16, data: &[u8]) -> bool {
        match self.try_send_data(stream_id, data) {
            Ok(()) => true,
            Err(e) => {
                debug!("Circuit {} rejected send: {}", self.circuit_id, e);
                false
            }
        }
    }

    /// `send_data` with the rejection reason
    pub fn try_send_data(&mut self, stream_id: u16, data: &[u8]) -> Result<(), MuxError> {
        if !self.active {
            return Err(MuxError::CircuitInactive(self.circuit_id));
        }
        let circuit_window = self.circuit_send_window;
        let stream = self
            .streams
            .get_mut(&stream_id)
            .filter(|s| s.state() == StreamState::Open)
            .ok_or(MuxError::StreamNotOpen(stream_id))?;

        if stream.send_window == 0 || circuit_window == 0 {
            return Err(MuxError::FlowControlBlocked { stream_id });
        }

        for chunk in data.chunks(CELL_PAYLOAD_SIZE) {
            stream.send_queue.push_back(chunk.to_vec());
        }
        stream.touch(Instant::now());
        Ok(())
    }

    /// Close a stream; END follows once its queued data has drained
    pub fn close_stream(&mut self, stream_id: u16) -> Result<(), MuxError> {
        let stream = self
            .streams
            .get_mut(&stream_id)
            .filter(|s| s.is_open())
            .ok_or(MuxError::StreamNotOpen(stream_id))?;
        stream.close(Instant::now());
        if stream.send_queue.is_empty() {
            self.queue_control(CellCommand::End, stream_id);
        } else {
            stream.end_pending = true;
        }
        Ok(())
    }

    /// Next cell to put on the wire, if any
    pub fn process_outbound(&mut self) -> Option<Cell> {
        if !self.active {
            return None;
        }

        if let Some(cell) = self.outbound_cells.pop_front() {
            self.counters.control_cells_sent += 1;
            return Some(cell);
        }

        if self.circuit_send_window == 0 {
            return None;
        }

        let stream_id = self.next_sendable()?;
        let half = self.config.stream_window / 2;
        let circuit_id = self.circuit_id;
        let stream = self.streams.get_mut(&stream_id)?;
        let payload = stream.send_queue.pop_front()?;
        let len = payload.len() as u64;
        let cell = match Cell::new(circuit_id, CellCommand::Data, stream_id, payload) {
            Ok(cell) => cell,
            Err(e) => {
                warn!("Circuit {} stream {} dropped chunk: {}", circuit_id, stream_id, e);
                return None;
            }
        };

        let before = stream.send_window;
        stream.send_window -= 1;
        stream.bytes_sent += len;
        stream.touch(Instant::now());
        let crossed_half = before >= half && stream.send_window < half;
        let finish = stream.end_pending && stream.send_queue.is_empty();
        if finish {
            stream.end_pending = false;
        }

        self.circuit_send_window -= 1;
        self.last_served = Some(stream_id);
        self.counters.data_cells_sent += 1;
        self.counters.bytes_sent += len;

        if crossed_half {
            self.queue_control(CellCommand::Sendme, stream_id);
        }
        if finish {
            self.queue_control(CellCommand::End, stream_id);
        }

        Some(cell)
    }

    fn next_sendable(&self) -> Option<u16> {
        let after_last = self.last_served.and_then(|last| {
            self.streams
                .range((Excluded(last), Unbounded))
                .find(|(_, s)| s.is_sendable())
                .map(|(id, _)| *id)
        });
        after_last.or_else(|| {
            self.streams
                .iter()
                .find(|(_, s)| s.is_sendable())
                .map(|(id, _)| *id)
        })
    }

    /// Dispatch one inbound cell
    pub fn process_inbound(&mut self, cell: Cell) -> Result<(), MuxError> {
        if cell.circuit_id != self.circuit_id {
            return Err(MuxError::UnknownCircuit(cell.circuit_id));
        }
        if !self.active {
            return Err(MuxError::CircuitInactive(self.circuit_id));
        }
        self.counters.cells_received += 1;
        let now = Instant::now();

        match cell.command {
            CellCommand::Data => self.receive_data(cell, now),
            CellCommand::Begin => {
                if cell.is_circuit_level() {
                    return Err(MuxError::StreamNotOpen(CIRCUIT_LEVEL_STREAM));
                }
                if self.streams.contains_key(&cell.stream_id) {
                    debug!(
                        "Circuit {} ignoring BEGIN for existing stream {}",
                        self.circuit_id, cell.stream_id
                    );
                } else {
                    self.streams.insert(
                        cell.stream_id,
                        Stream::new(cell.stream_id, self.config.stream_window, now),
                    );
                }
                Ok(())
            }
            CellCommand::End => {
                let stream = self
                    .streams
                    .get_mut(&cell.stream_id)
                    .ok_or(MuxError::StreamNotOpen(cell.stream_id))?;
                stream.abort(now);
                Ok(())
            }
            CellCommand::Sendme => {
                if cell.is_circuit_level() {
                    self.circuit_send_window = self
                        .circuit_send_window
                        .saturating_add(self.config.circuit_sendme_increment)
                        .min(self.config.circuit_window);
                } else if let Some(stream) = self.streams.get_mut(&cell.stream_id) {
                    stream.send_window = stream
                        .send_window
                        .saturating_add(self.config.stream_sendme_increment)
                        .min(stream.initial_window());
                } else {
                    debug!(
                        "Circuit {} SENDME for unknown stream {}",
                        self.circuit_id, cell.stream_id
                    );
                }
                Ok(())
            }
            CellCommand::Destroy => {
                warn!("Circuit {} destroyed by peer", self.circuit_id);
                self.shut_down(now);
                Ok(())
            }
            CellCommand::Relay | CellCommand::Create | CellCommand::Created => {
                debug!(
                    "Circuit {} ignoring {:?} cell at the multiplexer",
                    self.circuit_id, cell.command
                );
                Ok(())
            }
        }
    }

    fn receive_data(&mut self, cell: Cell, now: Instant) -> Result<(), MuxError> {
        let stream_id = cell.stream_id;
        if self.circuit_recv_window == 0 {
            return Err(MuxError::FlowControlBlocked { stream_id });
        }
        let stream = self
            .streams
            .get_mut(&stream_id)
            .filter(|s| s.is_open())
            .ok_or(MuxError::StreamNotOpen(stream_id))?;
        if stream.recv_window == 0 {
            return Err(MuxError::FlowControlBlocked { stream_id });
        }

        let len = cell.payload().len() as u64;
        stream.recv_window -= 1;
        stream.bytes_received += len;
        stream.recv_queue.push_back(cell.into_payload());
        stream.touch(now);

        let mut stream_sendme = false;
        if stream.recv_window < self.config.stream_window / 2 {
            stream.recv_window = stream
                .recv_window
                .saturating_add(self.config.stream_sendme_increment)
                .min(stream.initial_window());
            stream_sendme = true;
        }

        self.circuit_recv_window -= 1;
        self.counters.bytes_received += len;

        if stream_sendme {
            self.queue_control(CellCommand::Sendme, stream_id);
        }
        if self.circuit_recv_window < self.config.circuit_window / 2 {
            self.circuit_recv_window = self
                .circuit_recv_window
                .saturating_add(self.config.circuit_sendme_increment)
                .min(self.config.circuit_window);
            self.queue_control(CellCommand::Sendme, CIRCUIT_LEVEL_STREAM);
        }
        Ok(())
    }

    /// Reap closed streams past the grace period and idle open streams
    pub fn cleanup_idle_streams(&mut self, now: Instant) -> usize {
        let idle = self.config.stream_idle_timeout();
        let grace = self.config.closed_stream_grace();

        let mut expired = Vec::new();
        for (id, stream) in &self.streams {
            let reap = match stream.closed_at() {
                Some(closed) => {
                    stream.send_queue.is_empty()
                        && !stream.end_pending
                        && now.saturating_duration_since(closed) >= grace
                }
                None => now.saturating_duration_since(stream.last_activity()) >= idle,
            };
            if reap {
                expired.push((*id, stream.is_open()));
            }
        }

        for (id, was_open) in &expired {
            self.streams.remove(id);
            if *was_open && self.active {
                self.queue_control(CellCommand::End, *id);
            }
        }
        if !expired.is_empty() {
            debug!(
                "Circuit {} reaped {} streams",
                self.circuit_id,
                expired.len()
            );
        }
        expired.len()
    }

    /// Tear the circuit down locally; returns the DESTROY cell for the peer
    pub fn teardown(&mut self) -> Cell {
        self.shut_down(Instant::now());
        Cell::control(self.circuit_id, CellCommand::Destroy, CIRCUIT_LEVEL_STREAM)
    }

    fn shut_down(&mut self, now: Instant) {
        self.active = false;
        self.outbound_cells.clear();
        for stream in self.streams.values_mut() {
            stream.abort(now);
        }
    }

    fn queue_control(&mut self, command: CellCommand, stream_id: u16) {
        self.outbound_cells
            .push_back(Cell::control(self.circuit_id, command, stream_id));
    }

    pub fn stats(&self, now: Instant) -> CircuitStats {
        CircuitStats {
            circuit_id: self.circuit_id,
            active: self.active,
            cells_sent: self.counters.data_cells_sent + self.counters.control_cells_sent,
            data_cells_sent: self.counters.data_cells_sent,
            control_cells_sent: self.counters.control_cells_sent,
            cells_received: self.counters.cells_received,
            bytes_sent: self.counters.bytes_sent,
            bytes_received: self.counters.bytes_received,
            circuit_send_window: self.circuit_send_window,
            circuit_recv_window: self.circuit_recv_window,
            open_streams: self.stream_count(),
            age_secs: self.age(now).as_secs(),
        }
    }
}
