//! Channel configuration.
//!
//! Flat structs with named fields, validated at construction. No
//! inheritance chains, no dynamic dispatch. Configs derive serde and can
//! be loaded from YAML, which is how deployments ship per-stream presets.
//!
//! ```rust
//! use ndncast::config::ConsumerConfig;
//!
//! let config = ConsumerConfig::default();
//! assert!(config.validate().is_ok());
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::{Result, RtcError};

/// Video encoder parameters advertised in thread metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoCoderParams {
    /// Group-of-pictures length in frames.
    pub gop: u32,
    pub start_bitrate_kbps: u32,
    pub encode_width: u32,
    pub encode_height: u32,
}

impl Default for VideoCoderParams {
    fn default() -> Self {
        Self { gop: 30, start_bitrate_kbps: 1000, encode_width: 640, encode_height: 480 }
    }
}

/// Fetch-side parameters for one media kind.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaFetchConfig {
    /// Producer's nominal frame/bundle rate, Hz.
    pub producer_rate: f64,
    /// Lifetime carried on expressed interests, milliseconds.
    pub interest_lifetime_ms: u64,
    /// Number of reassembly slots in the frame buffer pool.
    pub frame_buffer_size: usize,
    /// Upper bound on a single frame's wire size, bytes.
    pub frame_slot_size: usize,
    /// How long the playout loop waits for a Ready slot before treating
    /// the cycle as a skipped frame, milliseconds.
    pub acquire_timeout_ms: u64,
}

impl Default for MediaFetchConfig {
    fn default() -> Self {
        Self {
            producer_rate: 30.0,
            interest_lifetime_ms: 4000,
            frame_buffer_size: 120,
            frame_slot_size: 16000,
            acquire_timeout_ms: 200,
        }
    }
}

impl MediaFetchConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.producer_rate > 0.0) {
            return Err(RtcError::config(format!(
                "producer_rate must be positive, got {}",
                self.producer_rate
            )));
        }
        if self.interest_lifetime_ms == 0 {
            return Err(RtcError::config("interest_lifetime_ms must be non-zero"));
        }
        if self.frame_buffer_size == 0 {
            return Err(RtcError::config("frame_buffer_size must be non-zero"));
        }
        if self.frame_slot_size == 0 {
            return Err(RtcError::config("frame_slot_size must be non-zero"));
        }
        Ok(())
    }

    pub fn interest_lifetime(&self) -> Duration {
        Duration::from_millis(self.interest_lifetime_ms)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    /// Nominal inter-frame interval at the producer rate, milliseconds.
    pub fn frame_interval_ms(&self) -> i64 {
        (1000.0 / self.producer_rate).round() as i64
    }
}

/// Consumer channel configuration: which media kinds to fetch and how.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    pub use_video: bool,
    pub use_audio: bool,
    /// Whether single-media operation is acceptable when the other media
    /// kind fails to start. When false, any start failure is fatal.
    pub allow_degraded: bool,
    pub video: MediaFetchConfig,
    pub audio: MediaFetchConfig,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            use_video: true,
            use_audio: true,
            allow_degraded: true,
            video: MediaFetchConfig::default(),
            audio: MediaFetchConfig { producer_rate: 50.0, ..MediaFetchConfig::default() },
        }
    }
}

impl ConsumerConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.use_video && !self.use_audio {
            return Err(RtcError::config("at least one media kind must be enabled"));
        }
        if self.use_video {
            self.video.validate()?;
        }
        if self.use_audio {
            self.audio.validate()?;
        }
        Ok(())
    }

    /// Parse and validate a config from YAML.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml_ng::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }
}

/// Producer channel configuration: packetization and FEC parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProducerConfig {
    /// Network segment payload size, bytes.
    pub segment_size: usize,
    /// FEC parity ratio (parity segments per data segment); zero disables
    /// parity generation.
    pub parity_ratio: f64,
    /// Target wire length for audio sample bundles, bytes.
    pub bundle_wire_length: usize,
    /// Audio sample rate advertised in sample headers, Hz.
    pub sample_rate: f64,
    /// Video frame rate advertised in sample headers, Hz.
    pub frame_rate: f64,
    pub coder: VideoCoderParams,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            segment_size: 1000,
            parity_ratio: 0.2,
            bundle_wire_length: 1000,
            sample_rate: 48000.0,
            frame_rate: 30.0,
            coder: VideoCoderParams::default(),
        }
    }
}

impl ProducerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.segment_size == 0 {
            return Err(RtcError::config("segment_size must be non-zero"));
        }
        if self.parity_ratio < 0.0 {
            return Err(RtcError::config(format!(
                "parity_ratio must be non-negative, got {}",
                self.parity_ratio
            )));
        }
        if self.bundle_wire_length == 0 {
            return Err(RtcError::config("bundle_wire_length must be non-zero"));
        }
        if !(self.sample_rate > 0.0) || !(self.frame_rate > 0.0) {
            return Err(RtcError::config("media rates must be positive"));
        }
        Ok(())
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml_ng::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(ConsumerConfig::default().validate().is_ok());
        assert!(ProducerConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_zero_rate_and_empty_channel() {
        let mut config = ConsumerConfig::default();
        config.video.producer_rate = 0.0;
        assert!(config.validate().is_err());

        let neither = ConsumerConfig { use_video: false, use_audio: false, ..Default::default() };
        assert!(neither.validate().is_err());
    }

    #[test]
    fn yaml_round_trip_with_partial_overrides() {
        let yaml = r#"
use_audio: false
video:
  producer_rate: 25.0
  frame_buffer_size: 60
"#;
        let config = ConsumerConfig::from_yaml(yaml).unwrap();
        assert!(!config.use_audio);
        assert!(config.use_video);
        assert_eq!(config.video.producer_rate, 25.0);
        assert_eq!(config.video.frame_buffer_size, 60);
        // Unspecified fields come from defaults.
        assert_eq!(config.video.frame_slot_size, 16000);
    }

    #[test]
    fn invalid_yaml_values_fail_validation() {
        let yaml = r#"
video:
  producer_rate: -5.0
"#;
        assert!(ConsumerConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn frame_interval_rounds_to_milliseconds() {
        let config = MediaFetchConfig { producer_rate: 30.0, ..Default::default() };
        assert_eq!(config.frame_interval_ms(), 33);
        let audio = MediaFetchConfig { producer_rate: 50.0, ..Default::default() };
        assert_eq!(audio.frame_interval_ms(), 20);
    }
}
