// Adaptive Cover — cover ratio that never settles on a fixed value
//
// ratio = base(activity) · (1 + amplitude · sin(2π · elapsed / period))
// clamped to [min_ratio, max_ratio]. The base is higher when idle and a
// fresh uniform draw from a sub-range while sending; the period is drawn
// once per session.

use super::ShapingError;
use crate::rng::RngHandle;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Cover ratio parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoverConfig {
    pub enabled: bool,
    /// Base ratio while idle
    pub idle_ratio: f64,
    /// Lower bound of the base ratio while sending
    pub on_send_min: f64,
    /// Upper bound of the base ratio while sending
    pub on_send_max: f64,
    /// Relative diurnal swing (0.15 = ±15%)
    pub amplitude: f64,
    /// Per-session period is drawn from [period_min_secs, period_max_secs]
    pub period_min_secs: f64,
    pub period_max_secs: f64,
    pub min_ratio: f64,
    pub max_ratio: f64,
}

impl Default for CoverConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            idle_ratio: 0.50,
            on_send_min: 0.15,
            on_send_max: 0.25,
            amplitude: 0.15,
            period_min_secs: 90.0,
            period_max_secs: 150.0,
            min_ratio: 0.10,
            max_ratio: 0.60,
        }
    }
}

impl CoverConfig {
    pub fn validate(&self) -> Result<(), ShapingError> {
        let in_unit = |x: f64| x.is_finite() && (0.0..1.0).contains(&x);
        if !in_unit(self.min_ratio) || !in_unit(self.max_ratio) || self.min_ratio > self.max_ratio {
            return Err(ShapingError::InvalidConfig(
                "ratio bounds must satisfy 0 <= min_ratio <= max_ratio < 1".to_string(),
            ));
        }
        if !in_unit(self.idle_ratio) || !in_unit(self.on_send_min) || !in_unit(self.on_send_max) {
            return Err(ShapingError::InvalidConfig(
                "base ratios must lie in [0, 1)".to_string(),
            ));
        }
        if self.on_send_min > self.on_send_max {
            return Err(ShapingError::InvalidConfig(
                "on_send_min must not exceed on_send_max".to_string(),
            ));
        }
        if !(self.amplitude.is_finite() && (0.0..1.0).contains(&self.amplitude)) {
            return Err(ShapingError::InvalidConfig(
                "amplitude must lie in [0, 1)".to_string(),
            ));
        }
        if !(self.period_min_secs > 0.0 && self.period_min_secs <= self.period_max_secs) {
            return Err(ShapingError::InvalidConfig(
                "period range must satisfy 0 < min <= max".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActivityState {
    Idle,
    OnSend,
}

/// Adaptive cover state for one session
#[derive(Debug)]
pub struct AdaptiveCover {
    config: CoverConfig,
    state: ActivityState,
    period_secs: f64,
    started: Instant,
    rng: RngHandle,
}

impl AdaptiveCover {
    pub fn new(config: CoverConfig, rng: RngHandle) -> Result<Self, ShapingError> {
        Self::new_at(config, rng, Instant::now())
    }

    pub fn new_at(config: CoverConfig, mut rng: RngHandle, started: Instant) -> Result<Self, ShapingError> {
        config.validate()?;
        let period_secs = rng.uniform(config.period_min_secs, config.period_max_secs);
        Ok(Self {
            config,
            state: ActivityState::Idle,
            period_secs,
            started,
            rng,
        })
    }

    pub fn config(&self) -> &CoverConfig {
        &self.config
    }

    /// Swap parameters, keeping state and the session period
    pub fn set_config(&mut self, config: CoverConfig) -> Result<(), ShapingError> {
        config.validate()?;
        self.config = config;
        Ok(())
    }

    pub fn state(&self) -> ActivityState {
        self.state
    }

    pub fn period_secs(&self) -> f64 {
        self.period_secs
    }

    pub fn update_state(&mut self, is_sending: bool) {
        self.state = if is_sending {
            ActivityState::OnSend
        } else {
            ActivityState::Idle
        };
    }

    /// Diurnal phase (in periods) at `now`
    pub fn phase_at(&self, now: Instant) -> f64 {
        now.saturating_duration_since(self.started).as_secs_f64() / self.period_secs
    }

    pub fn get_current_ratio(&mut self) -> f64 {
        self.ratio_at(Instant::now())
    }

    pub fn ratio_at(&mut self, now: Instant) -> f64 {
        let base = match self.state {
            ActivityState::Idle => self.config.idle_ratio,
            ActivityState::OnSend => self
                .rng
                .uniform(self.config.on_send_min, self.config.on_send_max),
        };
        let diurnal = 1.0
            + self.config.amplitude * (2.0 * std::f64::consts::PI * self.phase_at(now)).sin();
        (base * diurnal).clamp(self.config.min_ratio, self.config.max_ratio)
    }
}

/// Largest ratio `compute_cover_count` honours
const MAX_COUNT_RATIO: f64 = 0.99;

/// floor(real · ratio / (1 − ratio)), never negative
pub fn compute_cover_count(real_count: usize, ratio: f64) -> usize {
    if !ratio.is_finite() || ratio <= 0.0 {
        return 0;
    }
    let ratio = ratio.min(MAX_COUNT_RATIO);
    (real_count as f64 * ratio / (1.0 - ratio)).floor().max(0.0) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn make_cover(seed: u64) -> AdaptiveCover {
        AdaptiveCover::new_at(CoverConfig::default(), RngHandle::from_seed(seed), Instant::now())
            .unwrap()
    }

    #[test]
    fn test_default_config_valid() {
        assert!(CoverConfig::default().validate().is_ok());
        let bad = CoverConfig {
            min_ratio: 0.7,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_period_drawn_in_range() {
        for seed in 0..50 {
            let cover = make_cover(seed);
            assert!((90.0..=150.0).contains(&cover.period_secs()));
        }
    }

    #[test]
    fn test_idle_ratio_higher_than_sending() {
        let mut cover = make_cover(1);
        let start = Instant::now();
        cover.update_state(false);
        let idle = cover.ratio_at(start);
        cover.update_state(true);
        let sending = cover.ratio_at(start);
        assert!(idle > sending);
        assert_eq!(cover.state(), ActivityState::OnSend);
    }

    #[test]
    fn test_ratio_varies_over_time() {
        let mut cover = make_cover(2);
        let start = Instant::now();
        let samples: Vec<f64> = (0..150)
            .map(|s| cover.ratio_at(start + Duration::from_secs(s)))
            .collect();
        let lo = samples.iter().cloned().fold(f64::MAX, f64::min);
        let hi = samples.iter().cloned().fold(f64::MIN, f64::max);
        assert!(hi - lo > 0.1);
    }

    #[test]
    fn test_compute_cover_count() {
        assert_eq!(compute_cover_count(10, 0.5), 10);
        assert_eq!(compute_cover_count(10, 0.2), 2);
        assert_eq!(compute_cover_count(3, 0.1), 0);
        assert_eq!(compute_cover_count(0, 0.5), 0);
        assert_eq!(compute_cover_count(10, 0.0), 0);
        assert_eq!(compute_cover_count(10, -0.3), 0);
    }
}
