// Engine configuration
//
// One JSON document configures the whole engine. Every section is
// optional and falls back to its defaults:
//
// {
//   "mux":     { "stream_window": 500, "circuit_window": 1000, ... },
//   "pool":    { "max_circuits": 10, "max_lifetime_secs": 3600, ... },
//   "secrecy": { "rotation_interval_secs": 600 },
//   "shaping": { "profile": "Balanced", "jitter": { "mean_delay_ms": 20.0 }, ... },
//   "sweep_interval_ms": 1000
// }

use crate::circuit::{MuxConfig, PoolConfig, SecrecyConfig};
use crate::privacy::{ShapingConfig, StealthProfile};
use crate::CoreError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub mux: MuxConfig,
    pub pool: PoolConfig,
    pub secrecy: SecrecyConfig,
    pub shaping: ShapingConfig,
    /// Period of idle-stream cleanup, expiry and rotation checks
    pub sweep_interval_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            mux: MuxConfig::default(),
            pool: PoolConfig::default(),
            secrecy: SecrecyConfig::default(),
            shaping: ShapingConfig::default(),
            sweep_interval_ms: 1000,
        }
    }
}

impl EngineConfig {
    /// Defaults with the shaping preset for `profile`
    pub fn with_profile(profile: StealthProfile) -> Self {
        Self {
            shaping: ShapingConfig::for_profile(profile),
            ..Default::default()
        }
    }

    /// Parse and validate a JSON document
    pub fn from_json(json: &str) -> Result<Self, CoreError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| CoreError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String, CoreError> {
        serde_json::to_string_pretty(self).map_err(|e| CoreError::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        self.mux.validate()?;
        self.pool.validate()?;
        self.secrecy.validate()?;
        self.shaping.validate()?;
        if self.secrecy.rotation_interval() >= self.pool.max_lifetime() {
            return Err(CoreError::Config(
                "rotation_interval_secs must be below pool.max_lifetime_secs".to_string(),
            ));
        }
        if self.sweep_interval_ms == 0 {
            return Err(CoreError::Config(
                "sweep_interval_ms must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = EngineConfig::from_json("{}").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.mux.stream_window, 500);
        assert_eq!(config.mux.circuit_window, 1000);
        assert_eq!(config.pool.max_circuits, 10);
        assert_eq!(config.secrecy.rotation_interval_secs, 600);
    }

    #[test]
    fn test_default_rotation_fires_before_expiry() {
        let config = EngineConfig::default();
        assert!(config.secrecy.rotation_interval() < config.pool.max_lifetime());
        assert!(matches!(
            EngineConfig::from_json(
                r#"{ "pool": { "max_lifetime_secs": 60 }, "secrecy": { "rotation_interval_secs": 60 } }"#
            ),
            Err(CoreError::Config(_))
        ));
    }

    #[test]
    fn test_partial_sections() {
        let config = EngineConfig::from_json(
            r#"{
                "mux": { "stream_window": 200 },
                "shaping": { "profile": "Stealth", "jitter": { "mean_delay_ms": 50.0 } }
            }"#,
        )
        .unwrap();
        assert_eq!(config.mux.stream_window, 200);
        assert_eq!(config.mux.circuit_window, 1000);
        assert_eq!(config.shaping.profile, StealthProfile::Stealth);
        assert_eq!(config.shaping.jitter.mean_delay_ms, 50.0);
        assert_eq!(config.shaping.jitter.grid_ms, 20.0);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(matches!(
            EngineConfig::from_json(r#"{ "pool": { "max_circuits": 0 } }"#),
            Err(CoreError::Mux(_))
        ));
        assert!(matches!(
            EngineConfig::from_json(r#"{ "shaping": { "cover": { "min_ratio": 0.9 } } }"#),
            Err(CoreError::Shaping(_))
        ));
        assert!(matches!(
            EngineConfig::from_json("not json"),
            Err(CoreError::Config(_))
        ));
    }

    #[test]
    fn test_json_roundtrip() {
        let config = EngineConfig::with_profile(StealthProfile::LowLatency);
        let parsed = EngineConfig::from_json(&config.to_json().unwrap()).unwrap();
        assert_eq!(parsed, config);
    }
}
