// Traffic Shaper — chunk, jitter, de-periodize and mix outbound data
//
// Pipeline per `shape` call:
// 1. Chunker frames the data with random padding
// 2. Each frame gets an exponential, grid-quantized inter-send gap
// 3. The gap sequence is de-periodized
// 4. Frames enter the mix at now + cumulative gap + mix delay, never ahead
//    of a real frame already queued for the same flow
// 5. Cover frames are added according to the adaptive ratio
//
// Between sends, `pump_cover` schedules NHPP cover arrivals ahead of time.

use super::cover::{compute_cover_count, ActivityState, AdaptiveCover, CoverConfig};
use super::mix::{thin_arrivals, DiurnalRate, MixConfig, MixPacket, MixQueue};
use super::padding::{Chunker, PaddingConfig};
use super::rotation::{RotationLedger, RotationPack};
use super::spectral::{deperiodize, DeperiodizeConfig};
use super::timing::{JitterConfig, TimingJitter};
use super::ShapingError;
use crate::rng::RngHandle;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Preset trade-offs between latency and unobservability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StealthProfile {
    /// 5 ms mean jitter, light cover
    LowLatency,
    /// 20 ms mean jitter
    Balanced,
    /// 50 ms mean jitter, baseline-matched sizes, heavier cover
    Stealth,
}

impl Default for StealthProfile {
    fn default() -> Self {
        StealthProfile::Balanced
    }
}

/// Complete shaping configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShapingConfig {
    pub profile: StealthProfile,
    pub padding: PaddingConfig,
    pub jitter: JitterConfig,
    pub mix: MixConfig,
    pub deperiodize: DeperiodizeConfig,
    pub cover: CoverConfig,
}

impl Default for ShapingConfig {
    fn default() -> Self {
        Self::for_profile(StealthProfile::Balanced)
    }
}

impl ShapingConfig {
    pub fn for_profile(profile: StealthProfile) -> Self {
        match profile {
            StealthProfile::LowLatency => Self {
                profile,
                padding: PaddingConfig {
                    min_chunk: 400,
                    max_chunk: 1400,
                    min_padding: 10,
                    max_padding: 30,
                    ..Default::default()
                },
                jitter: JitterConfig {
                    mean_delay_ms: 5.0,
                    grid_ms: 10.0,
                    grid_jitter_ms: 3.0,
                    min_delay_ms: 1.0,
                },
                mix: MixConfig {
                    base_rate_hz: 50.0,
                    min_delay_ms: 5.0,
                    cover_rate_hz: 1.0,
                    ..Default::default()
                },
                deperiodize: DeperiodizeConfig {
                    max_shift_ms: 4.0,
                    ..Default::default()
                },
                cover: CoverConfig {
                    idle_ratio: 0.30,
                    on_send_min: 0.10,
                    on_send_max: 0.15,
                    min_ratio: 0.05,
                    max_ratio: 0.40,
                    ..Default::default()
                },
            },
            StealthProfile::Balanced => Self {
                profile,
                padding: PaddingConfig::default(),
                jitter: JitterConfig::default(),
                mix: MixConfig::default(),
                deperiodize: DeperiodizeConfig::default(),
                cover: CoverConfig::default(),
            },
            StealthProfile::Stealth => Self {
                profile,
                padding: PaddingConfig {
                    match_baseline: true,
                    ..Default::default()
                },
                jitter: JitterConfig {
                    mean_delay_ms: 50.0,
                    ..Default::default()
                },
                mix: MixConfig {
                    base_rate_hz: 5.0,
                    min_delay_ms: 50.0,
                    cover_rate_hz: 4.0,
                    ..Default::default()
                },
                deperiodize: DeperiodizeConfig::default(),
                cover: CoverConfig {
                    idle_ratio: 0.55,
                    on_send_min: 0.20,
                    on_send_max: 0.30,
                    ..Default::default()
                },
            },
        }
    }

    pub fn validate(&self) -> Result<(), ShapingError> {
        self.padding.validate()?;
        self.jitter.validate()?;
        self.mix.validate()?;
        self.deperiodize.validate()?;
        self.cover.validate()
    }

    /// One-line parameter summary for the session log
    pub fn summary(&self) -> String {
        format!(
            "profile={:?} chunk={}..{}B pad={}..{}B jitter_mean={}ms grid={}ms mix_rate={}Hz mix_min={}ms \
             cover_rate={}Hz cover_idle={} cover_send={}..{} cover_bounds={}..{} deperiodize={}(max {}ms)",
            self.profile,
            self.padding.min_chunk,
            self.padding.max_chunk,
            self.padding.min_padding,
            self.padding.max_padding,
            self.jitter.mean_delay_ms,
            self.jitter.grid_ms,
            self.mix.base_rate_hz,
            self.mix.min_delay_ms,
            self.mix.cover_rate_hz,
            self.cover.idle_ratio,
            self.cover.on_send_min,
            self.cover.on_send_max,
            self.cover.min_ratio,
            self.cover.max_ratio,
            self.deperiodize.enabled,
            self.deperiodize.max_shift_ms,
        )
    }
}

/// What one `shape` call scheduled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ShapeReport {
    pub real_chunks: usize,
    pub cover_chunks: usize,
    /// Latest due time among the scheduled real chunks
    pub last_due: Option<Instant>,
}

/// The shaping pipeline; a pure transform into a delay-ordered queue
#[derive(Debug)]
pub struct TrafficShaper {
    config: ShapingConfig,
    chunker: Chunker,
    jitter: TimingJitter,
    cover: AdaptiveCover,
    mix: MixQueue,
    ledger: RotationLedger,
    rng: RngHandle,
    /// Due time of the newest real frame still queued per flow
    last_real_due: BTreeMap<u64, Instant>,
    started: Instant,
    cover_scheduled_until: Instant,
}

impl TrafficShaper {
    pub fn new(config: ShapingConfig, rng: RngHandle) -> Result<Self, ShapingError> {
        Self::new_at(config, rng, Instant::now())
    }

    pub fn new_at(config: ShapingConfig, mut rng: RngHandle, now: Instant) -> Result<Self, ShapingError> {
        config.validate()?;
        let chunker = Chunker::new(config.padding.clone(), &mut rng)?;
        let jitter = TimingJitter::new(config.jitter.clone())?;
        let cover = AdaptiveCover::new_at(config.cover.clone(), rng.fork(), now)?;
        Ok(Self {
            config,
            chunker,
            jitter,
            cover,
            mix: MixQueue::new(),
            ledger: RotationLedger::new(),
            rng,
            last_real_due: BTreeMap::new(),
            started: now,
            cover_scheduled_until: now,
        })
    }

    pub fn config(&self) -> &ShapingConfig {
        &self.config
    }

    pub fn activity_state(&self) -> ActivityState {
        self.cover.state()
    }

    /// Packets waiting in the mix
    pub fn pending(&self) -> usize {
        self.mix.len()
    }

    pub fn next_due(&self) -> Option<Instant> {
        self.mix.next_due()
    }

    pub fn current_ratio(&mut self, now: Instant) -> f64 {
        self.cover.ratio_at(now)
    }

    /// Schedule `data` (and its cover) into the mix under `flow`
    pub fn shape(&mut self, data: &[u8], flow: u64, now: Instant) -> ShapeReport {
        self.cover.update_state(true);
        let frames = self.chunker.chunk(data, &mut self.rng);
        if frames.is_empty() {
            return ShapeReport::default();
        }

        let gaps = self.jitter.intervals_ms(frames.len(), &mut self.rng);
        let gaps = deperiodize(&gaps, &self.config.deperiodize, &mut self.rng);

        let mut report = ShapeReport {
            real_chunks: frames.len(),
            ..Default::default()
        };
        let mut offset_ms = 0.0;
        let mut floor = self.last_real_due.get(&flow).copied();
        for (frame, gap) in frames.into_iter().zip(gaps) {
            offset_ms += gap;
            let drawn = now + millis(offset_ms) + self.config.mix.sample_delay(&mut self.rng);
            // Real frames of one flow leave in order, across sends too
            let due = floor.map_or(drawn, |prev| drawn.max(prev));
            floor = Some(due);
            self.mix.push(due, flow, frame, false);
        }
        report.last_due = floor;
        if let Some(due) = floor {
            self.last_real_due.insert(flow, due);
        }

        if self.config.cover.enabled {
            let ratio = self.cover.ratio_at(now);
            report.cover_chunks = compute_cover_count(report.real_chunks, ratio);
            for _ in 0..report.cover_chunks {
                let at = self.rng.uniform(0.0, offset_ms);
                let due = now + millis(at) + self.config.mix.sample_delay(&mut self.rng);
                let frame = self.chunker.cover_chunk(&mut self.rng);
                self.mix.push(due, flow, frame, true);
            }
        }

        debug!(
            "Shaped {} bytes into {} real + {} cover chunks",
            data.len(),
            report.real_chunks,
            report.cover_chunks
        );
        report
    }

    /// Mark the sender idle; cover pumping resumes
    pub fn notify_idle(&mut self) {
        self.cover.update_state(false);
    }

    /// Schedule NHPP cover arrivals on `flow` up to `now + cover_horizon`
    ///
    /// Only injects while idle; returns the number of cover frames queued.
    pub fn pump_cover(&mut self, now: Instant, flow: u64) -> usize {
        let horizon_end = now + Duration::from_millis(self.config.mix.cover_horizon_ms);
        let start = self.cover_scheduled_until.max(now);
        self.cover_scheduled_until = horizon_end.max(self.cover_scheduled_until);

        if !self.config.cover.enabled
            || self.cover.state() != ActivityState::Idle
            || start >= horizon_end
        {
            return 0;
        }

        let rate = DiurnalRate {
            base_hz: self.config.mix.cover_rate_hz,
            amplitude: self.config.cover.amplitude,
            period_secs: self.cover.period_secs(),
            phase: 0.0,
        };
        let t0 = start.saturating_duration_since(self.started).as_secs_f64();
        let t1 = horizon_end.saturating_duration_since(self.started).as_secs_f64();
        let arrivals = thin_arrivals(&rate, t0, t1, &mut self.rng);

        for t in &arrivals {
            let frame = self.chunker.cover_chunk(&mut self.rng);
            self.mix
                .push(self.started + Duration::from_secs_f64(*t), flow, frame, true);
        }
        arrivals.len()
    }

    /// Pop every packet due at `now`
    pub fn due(&mut self, now: Instant) -> Vec<MixPacket> {
        // A floor at or before `now` has been released with everything under it
        self.last_real_due.retain(|_, due| *due > now);
        self.mix.due(now)
    }

    pub fn pending_real(&self, flow: u64) -> usize {
        self.mix.pending_real(flow)
    }

    /// Forget everything still queued for `flow`
    pub fn discard_flow(&mut self, flow: u64) -> usize {
        self.last_real_due.remove(&flow);
        self.mix.discard_flow(flow)
    }

    /// Apply a rotation pack; all-or-nothing
    pub fn apply(&mut self, pack: &RotationPack, now_unix: u64) -> Result<(), ShapingError> {
        let staged = self.ledger.apply(&self.config, pack, now_unix)?;
        self.reconfigure(staged)
    }

    fn reconfigure(&mut self, config: ShapingConfig) -> Result<(), ShapingError> {
        config.validate()?;
        let chunker = Chunker::new(config.padding.clone(), &mut self.rng)?;
        let jitter = TimingJitter::new(config.jitter.clone())?;
        self.cover.set_config(config.cover.clone())?;
        self.chunker = chunker;
        self.jitter = jitter;
        self.config = config;
        Ok(())
    }
}

fn millis(ms: f64) -> Duration {
    Duration::from_secs_f64(ms.max(0.0) / 1000.0)
}
