// Stream — one logical data flow inside a circuit

use std::collections::VecDeque;
use tokio::time::Instant;

/// Stream lifecycle; `Closed` is terminal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Open,
    Closed,
}

/// A multiplexed stream, owned exclusively by its circuit
#[derive(Debug)]
pub struct Stream {
    stream_id: u16,
    state: StreamState,
    initial_window: u32,
    pub(crate) send_window: u32,
    pub(crate) recv_window: u32,
    pub(crate) send_queue: VecDeque<Vec<u8>>,
    pub(crate) recv_queue: VecDeque<Vec<u8>>,
    /// END is owed once the send queue drains
    pub(crate) end_pending: bool,
    created_at: Instant,
    last_activity: Instant,
    closed_at: Option<Instant>,
    pub(crate) bytes_sent: u64,
    pub(crate) bytes_received: u64,
}

impl Stream {
    pub fn new(stream_id: u16, window: u32, now: Instant) -> Self {
        Self {
            stream_id,
            state: StreamState::Open,
            initial_window: window,
            send_window: window,
            recv_window: window,
            send_queue: VecDeque::new(),
            recv_queue: VecDeque::new(),
            end_pending: false,
            created_at: now,
            last_activity: now,
            closed_at: None,
            bytes_sent: 0,
            bytes_received: 0,
        }
    }

    pub fn stream_id(&self) -> u16 {
        self.stream_id
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == StreamState::Open
    }

    pub fn initial_window(&self) -> u32 {
        self.initial_window
    }

    pub fn send_window(&self) -> u32 {
        self.send_window
    }

    pub fn recv_window(&self) -> u32 {
        self.recv_window
    }

    /// Chunks waiting to be emitted as DATA cells
    pub fn queued_chunks(&self) -> usize {
        self.send_queue.len()
    }

    /// Chunks delivered but not yet read
    pub fn pending_reads(&self) -> usize {
        self.recv_queue.len()
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    pub fn closed_at(&self) -> Option<Instant> {
        self.closed_at
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    /// Eligible for fair-queue emission
    pub(crate) fn is_sendable(&self) -> bool {
        !self.send_queue.is_empty() && self.send_window > 0
    }

    pub(crate) fn touch(&mut self, now: Instant) {
        self.last_activity = now;
    }

    /// Transition to `Closed`; idempotent
    pub(crate) fn close(&mut self, now: Instant) {
        if self.state == StreamState::Open {
            self.state = StreamState::Closed;
            self.closed_at = Some(now);
        }
    }

    /// Close and discard anything not yet sent
    pub(crate) fn abort(&mut self, now: Instant) {
        self.close(now);
        self.send_queue.clear();
        self.end_pending = false;
    }

    /// Pop the next delivered chunk
    pub fn read(&mut self) -> Option<Vec<u8>> {
        self.recv_queue.pop_front()
    }

    /// Drain every delivered chunk into one buffer
    pub fn read_all(&mut self) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(chunk) = self.recv_queue.pop_front() {
            out.extend_from_slice(&chunk);
        }
        out
    }
}
