// Timing Jitter — exponential send delays on a randomized grid
//
// delay = Exp(mean), quantized to the grid, then moved by a small uniform
// offset so the grid itself never shows up in inter-arrival times.

use super::ShapingError;
use crate::rng::RngHandle;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Jitter parameters (milliseconds)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JitterConfig {
    /// Mean of the exponential delay
    pub mean_delay_ms: f64,
    /// Quantization grid
    pub grid_ms: f64,
    /// Half-width of the uniform offset applied after quantization
    pub grid_jitter_ms: f64,
    /// Floor for any produced delay
    pub min_delay_ms: f64,
}

impl Default for JitterConfig {
    fn default() -> Self {
        Self {
            mean_delay_ms: 20.0,
            grid_ms: 20.0,
            grid_jitter_ms: 8.0,
            min_delay_ms: 1.0,
        }
    }
}

impl JitterConfig {
    pub fn validate(&self) -> Result<(), ShapingError> {
        if !(self.mean_delay_ms.is_finite() && self.mean_delay_ms > 0.0) {
            return Err(ShapingError::InvalidConfig(
                "mean_delay_ms must be > 0".to_string(),
            ));
        }
        if !(self.grid_ms.is_finite() && self.grid_ms >= 0.0) {
            return Err(ShapingError::InvalidConfig("grid_ms must be >= 0".to_string()));
        }
        if !(self.grid_jitter_ms.is_finite() && self.grid_jitter_ms >= 0.0) {
            return Err(ShapingError::InvalidConfig(
                "grid_jitter_ms must be >= 0".to_string(),
            ));
        }
        if !(self.min_delay_ms.is_finite() && self.min_delay_ms >= 0.0) {
            return Err(ShapingError::InvalidConfig(
                "min_delay_ms must be >= 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Draw one delay in milliseconds
pub fn jitter_ms(config: &JitterConfig, rng: &mut RngHandle) -> f64 {
    let raw = rng.exp(1.0 / config.mean_delay_ms);
    let quantized = if config.grid_ms > 0.0 {
        (raw / config.grid_ms).round() * config.grid_ms
    } else {
        raw
    };
    let offset = rng.uniform(-config.grid_jitter_ms, config.grid_jitter_ms);
    (quantized + offset).max(config.min_delay_ms)
}

/// Draw one delay
pub fn compute_jitter(config: &JitterConfig, rng: &mut RngHandle) -> Duration {
    Duration::from_secs_f64(jitter_ms(config, rng) / 1000.0)
}

/// Jitter source bound to a configuration
#[derive(Debug, Clone)]
pub struct TimingJitter {
    config: JitterConfig,
}

impl TimingJitter {
    pub fn new(config: JitterConfig) -> Result<Self, ShapingError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &JitterConfig {
        &self.config
    }

    pub fn sample_ms(&self, rng: &mut RngHandle) -> f64 {
        jitter_ms(&self.config, rng)
    }

    pub fn compute_jitter(&self, rng: &mut RngHandle) -> Duration {
        compute_jitter(&self.config, rng)
    }

    /// Inter-send gaps for `count` chunks
    pub fn intervals_ms(&self, count: usize, rng: &mut RngHandle) -> Vec<f64> {
        (0..count).map(|_| self.sample_ms(rng)).collect()
    }
}
