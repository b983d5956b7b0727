// Spectral De-periodization — perturbing intervals that stand out
//
// Intervals whose z-score exceeds the threshold are shifted by
// uniform(-1, 1) * max_shift * tanh(z). Shifts stay small, so delivery is
// not materially delayed, but the dominant spectral peak is smeared.

use super::ShapingError;
use crate::rng::RngHandle;
use serde::{Deserialize, Serialize};

/// De-periodization parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeperiodizeConfig {
    pub enabled: bool,
    /// |z| above which an interval is perturbed
    pub z_threshold: f64,
    /// Upper bound on any single shift (ms)
    pub max_shift_ms: f64,
    /// Floor for a shifted interval (ms)
    pub min_interval_ms: f64,
    /// Shorter sequences are returned untouched
    pub min_samples: usize,
}

impl Default for DeperiodizeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            z_threshold: 1.5,
            max_shift_ms: 8.0,
            min_interval_ms: 0.5,
            min_samples: 8,
        }
    }
}

impl DeperiodizeConfig {
    pub fn validate(&self) -> Result<(), ShapingError> {
        if !(self.max_shift_ms.is_finite() && self.max_shift_ms >= 0.0) {
            return Err(ShapingError::InvalidConfig(
                "max_shift_ms must be >= 0".to_string(),
            ));
        }
        if !(self.z_threshold.is_finite() && self.z_threshold >= 0.0) {
            return Err(ShapingError::InvalidConfig(
                "z_threshold must be >= 0".to_string(),
            ));
        }
        if !(self.min_interval_ms.is_finite() && self.min_interval_ms > 0.0) {
            return Err(ShapingError::InvalidConfig(
                "min_interval_ms must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Perturb outlying intervals (milliseconds)
pub fn deperiodize(intervals_ms: &[f64], config: &DeperiodizeConfig, rng: &mut RngHandle) -> Vec<f64> {
    if !config.enabled || intervals_ms.len() < config.min_samples {
        return intervals_ms.to_vec();
    }

    let n = intervals_ms.len() as f64;
    let mean = intervals_ms.iter().sum::<f64>() / n;
    let var = intervals_ms.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
    let std = var.sqrt() + 1e-9;

    intervals_ms
        .iter()
        .map(|&x| {
            let z = (x - mean) / std;
            if z.abs() <= config.z_threshold {
                return x;
            }
            let shift = rng.uniform(-1.0, 1.0) * config.max_shift_ms * z.tanh();
            (x + shift).max(config.min_interval_ms)
        })
        .collect()
}

/// Ratio of the strongest non-DC DFT power bin to the mean power
///
/// What a passive observer would compute to find periodic send patterns.
pub fn dominant_peak_ratio(intervals_ms: &[f64]) -> f64 {
    let n = intervals_ms.len();
    if n < 4 {
        return 0.0;
    }
    let mean = intervals_ms.iter().sum::<f64>() / n as f64;
    let powers: Vec<f64> = (1..=n / 2)
        .map(|k| {
            let (mut re, mut im) = (0.0, 0.0);
            for (t, x) in intervals_ms.iter().enumerate() {
                let angle = -2.0 * std::f64::consts::PI * (k * t) as f64 / n as f64;
                re += (x - mean) * angle.cos();
                im += (x - mean) * angle.sin();
            }
            re * re + im * im
        })
        .collect();
    let avg = powers.iter().sum::<f64>() / powers.len() as f64;
    if avg <= 0.0 {
        return 0.0;
    }
    powers.iter().cloned().fold(0.0, f64::max) / avg
}
