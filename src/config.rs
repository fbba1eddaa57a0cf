use std::path::PathBuf;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::models::ModelReference;

/// Which voice-activity gate fronts the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VadMode {
    Energy,
    Frame,
}

/// Runtime configuration for the satellite.
///
/// Every field has a default so a partial config file or bare CLI flags are
/// enough to start.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SatelliteConfig {
    /// Classifier model to load (`builtin:<name>.onnx` or `user:<name>.onnx`).
    pub selected_model: ModelReference,

    /// TCP port the Wyoming server listens on.
    pub server_port: u16,

    /// Identifier advertised in the `info` reply.
    pub device_id: String,

    /// Human-readable name advertised in the `info` reply.
    pub device_name: String,

    /// Detection threshold; a score strictly above this activates.
    pub threshold: f32,

    /// Cooldown after a detection, in milliseconds.
    pub streaming_timeout_ms: u64,

    /// RMS threshold below which a chunk counts as silence.
    pub rms_silence_threshold: f32,

    pub vad_mode: VadMode,

    /// Read-only directory holding the bundled ONNX graphs.
    pub builtin_model_dir: PathBuf,

    /// Writable directory for user-imported classifier models.
    pub user_model_dir: PathBuf,
}

impl Default for SatelliteConfig {
    fn default() -> Self {
        Self {
            selected_model: ModelReference::default(),
            server_port: 10700,
            device_id: default_device_id(),
            device_name: default_device_name(),
            threshold: 0.05,
            streaming_timeout_ms: 60_000,
            rms_silence_threshold: 0.01,
            vad_mode: VadMode::Frame,
            builtin_model_dir: PathBuf::from("models"),
            user_model_dir: PathBuf::from("user_models"),
        }
    }
}

impl SatelliteConfig {
    /// Reject configurations the satellite cannot start with.
    pub fn validate(&self) -> Result<()> {
        if self.server_port == 0 {
            bail!("server_port must be non-zero");
        }
        if !(self.threshold > 0.0 && self.threshold <= 1.0) {
            bail!("threshold must be in (0, 1], got {}", self.threshold);
        }
        if !(self.rms_silence_threshold > 0.0 && self.rms_silence_threshold < 1.0) {
            bail!(
                "rms_silence_threshold must be in (0, 1), got {}",
                self.rms_silence_threshold
            );
        }
        if self.streaming_timeout_ms == 0 {
            bail!("streaming_timeout_ms must be non-zero");
        }
        if self.device_id.is_empty() {
            bail!("device_id must not be empty");
        }
        Ok(())
    }

    pub fn streaming_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.streaming_timeout_ms)
    }
}

/// Service type an external announcer should register under.
pub fn service_type() -> &'static str {
    "_wyoming._tcp"
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "unknown-host".to_string())
}

fn default_device_id() -> String {
    format!("wysat-{}", hostname())
}

fn default_device_name() -> String {
    format!("{} satellite", hostname())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = SatelliteConfig::default();
        config.validate().unwrap();

        assert_eq!(config.server_port, 10700);
        assert_eq!(config.threshold, 0.05);
        assert_eq!(config.streaming_timeout_ms, 60_000);
        assert_eq!(config.vad_mode, VadMode::Frame);
        assert_eq!(
            config.selected_model.to_string(),
            "builtin:hey_nabu.onnx"
        );
    }

    #[test]
    fn test_rejects_bad_values() {
        let mut config = SatelliteConfig::default();
        config.server_port = 0;
        assert!(config.validate().is_err());

        let mut config = SatelliteConfig::default();
        config.threshold = 0.0;
        assert!(config.validate().is_err());

        let mut config = SatelliteConfig::default();
        config.threshold = 1.5;
        assert!(config.validate().is_err());

        let mut config = SatelliteConfig::default();
        config.streaming_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_vad_mode_serde_names() {
        assert_eq!(
            serde_json::from_str::<VadMode>("\"energy\"").unwrap(),
            VadMode::Energy
        );
        assert_eq!(
            serde_json::from_str::<VadMode>("\"frame\"").unwrap(),
            VadMode::Frame
        );
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let config: SatelliteConfig =
            serde_json::from_str(r#"{"server_port": 11000, "vad_mode": "energy"}"#).unwrap();
        assert_eq!(config.server_port, 11000);
        assert_eq!(config.vad_mode, VadMode::Energy);
        assert_eq!(config.threshold, 0.05);
    }
}
