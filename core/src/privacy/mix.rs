// Mix Queue — delay-ordered release of real and cover packets
//
// Real packets wait at least `min_delay_ms` plus an exponential draw.
// Cover arrival times come from a non-homogeneous Poisson process by
// thinning: candidates at the supremum rate, each kept with probability
// rate(t) / supremum.

use super::ShapingError;
use crate::rng::RngHandle;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::Duration;
use tokio::time::Instant;

/// Highest idle cover rate a config may ask for (1/s)
pub const MAX_COVER_RATE_HZ: f64 = 50.0;

/// Highest mix delay rate (1/s)
pub const MAX_MIX_RATE_HZ: f64 = 1000.0;

/// Longest minimum mix delay (ms)
pub const MAX_MIX_DELAY_MS: f64 = 60_000.0;

/// Longest cover scheduling horizon (ms)
pub const MAX_COVER_HORIZON_MS: u64 = 60_000;

/// Mix delay and cover rate parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MixConfig {
    /// Rate of the exponential mix delay (1/s)
    pub base_rate_hz: f64,
    /// Minimum time any packet spends in the mix (ms)
    pub min_delay_ms: f64,
    /// Mean rate of idle cover arrivals (1/s)
    pub cover_rate_hz: f64,
    /// How far ahead cover arrivals are scheduled per pump (ms)
    pub cover_horizon_ms: u64,
}

impl Default for MixConfig {
    fn default() -> Self {
        Self {
            base_rate_hz: 10.0,
            min_delay_ms: 20.0,
            cover_rate_hz: 2.5,
            cover_horizon_ms: 1000,
        }
    }
}

impl MixConfig {
    pub fn validate(&self) -> Result<(), ShapingError> {
        if !(self.base_rate_hz > 0.0 && self.base_rate_hz <= MAX_MIX_RATE_HZ) {
            return Err(ShapingError::InvalidConfig(format!(
                "base_rate_hz must be in (0, {}]",
                MAX_MIX_RATE_HZ
            )));
        }
        if !(0.0..=MAX_MIX_DELAY_MS).contains(&self.min_delay_ms) {
            return Err(ShapingError::InvalidConfig(format!(
                "min_delay_ms must be in [0, {}]",
                MAX_MIX_DELAY_MS
            )));
        }
        if !(0.0..=MAX_COVER_RATE_HZ).contains(&self.cover_rate_hz) {
            return Err(ShapingError::InvalidConfig(format!(
                "cover_rate_hz must be in [0, {}]",
                MAX_COVER_RATE_HZ
            )));
        }
        if !(1..=MAX_COVER_HORIZON_MS).contains(&self.cover_horizon_ms) {
            return Err(ShapingError::InvalidConfig(format!(
                "cover_horizon_ms must be in [1, {}]",
                MAX_COVER_HORIZON_MS
            )));
        }
        Ok(())
    }

    /// One mix delay draw
    pub fn sample_delay(&self, rng: &mut RngHandle) -> Duration {
        let secs = rng.exp(self.base_rate_hz).max(self.min_delay_ms / 1000.0);
        Duration::from_secs_f64(secs)
    }
}

/// Entry in the mix heap
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MixPacket {
    pub due: Instant,
    /// Insertion order; breaks ties between equal due times
    pub seq: u64,
    /// Caller-chosen label naming where the packet goes
    pub flow: u64,
    pub payload: Vec<u8>,
    pub is_cover: bool,
}

// Reversed so `BinaryHeap` pops the earliest due time first
impl Ord for MixPacket {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for MixPacket {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Min-heap of pending packets
#[derive(Debug, Default)]
pub struct MixQueue {
    heap: BinaryHeap<MixPacket>,
    next_seq: u64,
}

impl MixQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn push(&mut self, due: Instant, flow: u64, payload: Vec<u8>, is_cover: bool) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(MixPacket {
            due,
            seq,
            flow,
            payload,
            is_cover,
        });
    }

    /// Earliest pending due time
    pub fn next_due(&self) -> Option<Instant> {
        self.heap.peek().map(|p| p.due)
    }

    /// Pop every packet whose due time has passed, earliest first
    pub fn due(&mut self, now: Instant) -> Vec<MixPacket> {
        let mut out = Vec::new();
        while self.heap.peek().map_or(false, |p| p.due <= now) {
            if let Some(packet) = self.heap.pop() {
                out.push(packet);
            }
        }
        out
    }

    pub fn clear(&mut self) {
        self.heap.clear();
    }

    /// Real (non-cover) packets still queued for `flow`
    pub fn pending_real(&self, flow: u64) -> usize {
        self.heap
            .iter()
            .filter(|p| p.flow == flow && !p.is_cover)
            .count()
    }

    /// Drop every packet labelled `flow`; returns how many were dropped
    pub fn discard_flow(&mut self, flow: u64) -> usize {
        let before = self.heap.len();
        self.heap.retain(|p| p.flow != flow);
        before - self.heap.len()
    }
}

/// Diurnal target rate: base · (1 + amplitude · sin(2π (t / period + phase)))
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DiurnalRate {
    pub base_hz: f64,
    pub amplitude: f64,
    pub period_secs: f64,
    pub phase: f64,
}

impl DiurnalRate {
    pub fn rate_at(&self, t_secs: f64) -> f64 {
        let angle = 2.0 * std::f64::consts::PI * (t_secs / self.period_secs.max(1e-9) + self.phase);
        (self.base_hz * (1.0 + self.amplitude * angle.sin())).max(0.0)
    }

    pub fn supremum(&self) -> f64 {
        self.base_hz * (1.0 + self.amplitude.abs())
    }
}

/// NHPP arrival times in [start, end) seconds, by thinning
pub fn thin_arrivals(rate: &DiurnalRate, start_secs: f64, end_secs: f64, rng: &mut RngHandle) -> Vec<f64> {
    let sup = rate.supremum();
    let mut arrivals = Vec::new();
    if sup <= 0.0 || end_secs <= start_secs {
        return arrivals;
    }
    let mut t = start_secs;
    loop {
        t += rng.exp(sup);
        if t >= end_secs {
            break;
        }
        if rng.u01() * sup <= rate.rate_at(t) {
            arrivals.push(t);
        }
    }
    arrivals
}
