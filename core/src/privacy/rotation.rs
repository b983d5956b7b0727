// Rotation Packs — pushed parameter updates for the shaping pipeline
//
// A pack names parameters as "section.field". It is rejected if it is not
// yet valid, expired, already applied, or names an unknown parameter.
// Changes are staged on a copy and only committed when the copy validates.
// Signature checks belong to the control plane that delivers the pack.

use super::shaper::ShapingConfig;
use super::ShapingError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{info, warn};
use uuid::Uuid;

/// Parameter bundle pushed by the control plane
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RotationPack {
    pub id: Uuid,
    /// Unix seconds
    pub issued_at: u64,
    /// Unix seconds
    pub expires_at: u64,
    pub parameters: BTreeMap<String, f64>,
}

impl RotationPack {
    pub fn new(issued_at: u64, expires_at: u64, parameters: BTreeMap<String, f64>) -> Self {
        Self {
            id: Uuid::new_v4(),
            issued_at,
            expires_at,
            parameters,
        }
    }
}

/// Every parameter a pack may set
pub const ROTATABLE_PARAMETERS: &[&str] = &[
    "padding.min_chunk",
    "padding.max_chunk",
    "padding.min_padding",
    "padding.max_padding",
    "jitter.mean_delay_ms",
    "jitter.grid_ms",
    "jitter.grid_jitter_ms",
    "mix.base_rate_hz",
    "mix.min_delay_ms",
    "mix.cover_rate_hz",
    "deperiodize.z_threshold",
    "deperiodize.max_shift_ms",
    "cover.idle_ratio",
    "cover.on_send_min",
    "cover.on_send_max",
    "cover.amplitude",
    "cover.min_ratio",
    "cover.max_ratio",
];

impl ShapingConfig {
    /// Set one rotatable parameter by name
    pub fn set_parameter(&mut self, key: &str, value: f64) -> Result<(), ShapingError> {
        if !value.is_finite() {
            return Err(ShapingError::RotationRejected(format!(
                "{} is not a finite number",
                key
            )));
        }
        let as_size = || -> Result<usize, ShapingError> {
            if value < 0.0 || value.fract() != 0.0 {
                return Err(ShapingError::RotationRejected(format!(
                    "{} must be a non-negative integer",
                    key
                )));
            }
            Ok(value as usize)
        };

        match key {
            "padding.min_chunk" => self.padding.min_chunk = as_size()?,
            "padding.max_chunk" => self.padding.max_chunk = as_size()?,
            "padding.min_padding" => self.padding.min_padding = as_size()?,
            "padding.max_padding" => self.padding.max_padding = as_size()?,
            "jitter.mean_delay_ms" => self.jitter.mean_delay_ms = value,
            "jitter.grid_ms" => self.jitter.grid_ms = value,
            "jitter.grid_jitter_ms" => self.jitter.grid_jitter_ms = value,
            "mix.base_rate_hz" => self.mix.base_rate_hz = value,
            "mix.min_delay_ms" => self.mix.min_delay_ms = value,
            "mix.cover_rate_hz" => self.mix.cover_rate_hz = value,
            "deperiodize.z_threshold" => self.deperiodize.z_threshold = value,
            "deperiodize.max_shift_ms" => self.deperiodize.max_shift_ms = value,
            "cover.idle_ratio" => self.cover.idle_ratio = value,
            "cover.on_send_min" => self.cover.on_send_min = value,
            "cover.on_send_max" => self.cover.on_send_max = value,
            "cover.amplitude" => self.cover.amplitude = value,
            "cover.min_ratio" => self.cover.min_ratio = value,
            "cover.max_ratio" => self.cover.max_ratio = value,
            unknown => {
                return Err(ShapingError::RotationRejected(format!(
                    "unknown parameter {}",
                    unknown
                )))
            }
        }
        Ok(())
    }
}

/// Tracks applied packs for replay protection
#[derive(Debug, Default)]
pub struct RotationLedger {
    /// Applied pack ids and their expiry
    applied: BTreeMap<Uuid, u64>,
}

impl RotationLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn applied_count(&self) -> usize {
        self.applied.len()
    }

    pub fn has_applied(&self, id: &Uuid) -> bool {
        self.applied.contains_key(id)
    }

    /// Validate `pack` against `current` and return the staged config
    ///
    /// The ledger records the pack only when the staged config validates.
    pub fn apply(
        &mut self,
        current: &ShapingConfig,
        pack: &RotationPack,
        now_unix: u64,
    ) -> Result<ShapingConfig, ShapingError> {
        let result = self.stage(current, pack, now_unix);
        match &result {
            Ok(_) => {
                // Expired ids can no longer replay; forget them
                self.applied.retain(|_, expires| *expires >= now_unix);
                self.applied.insert(pack.id, pack.expires_at);
                info!(
                    "Rotation pack {} applied ({} parameters)",
                    pack.id,
                    pack.parameters.len()
                );
            }
            Err(e) => warn!("Rotation pack {} rejected: {}", pack.id, e),
        }
        result
    }

    fn stage(
        &self,
        current: &ShapingConfig,
        pack: &RotationPack,
        now_unix: u64,
    ) -> Result<ShapingConfig, ShapingError> {
        if self.applied.contains_key(&pack.id) {
            return Err(ShapingError::RotationRejected("replayed pack".to_string()));
        }
        if pack.issued_at > now_unix {
            return Err(ShapingError::RotationRejected(
                "issued in the future".to_string(),
            ));
        }
        if pack.expires_at <= pack.issued_at || now_unix > pack.expires_at {
            return Err(ShapingError::RotationRejected("expired".to_string()));
        }

        let mut staged = current.clone();
        for (key, value) in &pack.parameters {
            staged.set_parameter(key, *value)?;
        }
        staged
            .validate()
            .map_err(|e| ShapingError::RotationRejected(e.to_string()))?;
        Ok(staged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: u64 = 1_700_000_000;

    fn pack(params: &[(&str, f64)]) -> RotationPack {
        RotationPack::new(
            NOW - 10,
            NOW + 3600,
            params.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
        )
    }

    #[test]
    fn test_apply_updates_parameters() {
        let mut ledger = RotationLedger::new();
        let current = ShapingConfig::default();
        let staged = ledger
            .apply(
                &current,
                &pack(&[("jitter.mean_delay_ms", 35.0), ("cover.idle_ratio", 0.45)]),
                NOW,
            )
            .unwrap();
        assert_eq!(staged.jitter.mean_delay_ms, 35.0);
        assert_eq!(staged.cover.idle_ratio, 0.45);
        assert_eq!(ledger.applied_count(), 1);
    }

    #[test]
    fn test_replay_rejected() {
        let mut ledger = RotationLedger::new();
        let current = ShapingConfig::default();
        let p = pack(&[("mix.base_rate_hz", 8.0)]);
        assert!(ledger.apply(&current, &p, NOW).is_ok());
        assert!(matches!(
            ledger.apply(&current, &p, NOW + 1),
            Err(ShapingError::RotationRejected(_))
        ));
    }

    #[test]
    fn test_window_checks() {
        let mut ledger = RotationLedger::new();
        let current = ShapingConfig::default();
        let future = RotationPack::new(NOW + 60, NOW + 3600, BTreeMap::new());
        assert!(ledger.apply(&current, &future, NOW).is_err());
        let expired = RotationPack::new(NOW - 7200, NOW - 3600, BTreeMap::new());
        assert!(ledger.apply(&current, &expired, NOW).is_err());
        assert_eq!(ledger.applied_count(), 0);
    }

    #[test]
    fn test_unknown_key_rejected() {
        let mut ledger = RotationLedger::new();
        let result = ledger.apply(
            &ShapingConfig::default(),
            &pack(&[("fte.ja3", 1.0)]),
            NOW,
        );
        assert!(matches!(result, Err(ShapingError::RotationRejected(_))));
    }

    #[test]
    fn test_invalid_result_is_all_or_nothing() {
        let mut ledger = RotationLedger::new();
        let current = ShapingConfig::default();
        let p = pack(&[("jitter.mean_delay_ms", 40.0), ("cover.min_ratio", 0.9)]);
        assert!(ledger.apply(&current, &p, NOW).is_err());
        assert!(!ledger.has_applied(&p.id));
        assert_eq!(current.jitter.mean_delay_ms, ShapingConfig::default().jitter.mean_delay_ms);
    }

    #[test]
    fn test_fractional_size_rejected() {
        let mut config = ShapingConfig::default();
        assert!(config.set_parameter("padding.min_chunk", 300.5).is_err());
        assert!(config.set_parameter("padding.min_chunk", -1.0).is_err());
        assert!(config.set_parameter("padding.min_chunk", 320.0).is_ok());
        assert_eq!(config.padding.min_chunk, 320);
    }

    #[test]
    fn test_every_listed_parameter_is_settable() {
        for key in ROTATABLE_PARAMETERS {
            let mut config = ShapingConfig::default();
            assert!(config.set_parameter(key, 1.0).is_ok(), "{}", key);
        }
    }
}
