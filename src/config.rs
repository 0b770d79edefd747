//! Application configuration
//!
//! Loaded from a TOML file. Every section has defaults so a missing file or a
//! partial file is fine.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants::*;
use crate::error::{Error, Result};

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub pools: PoolConfig,
    pub audio: AudioConfig,
    pub encoder: EncoderConfig,
    pub recorder: RecorderConfig,
    pub control: ControlConfig,
}

/// Fixed pool sizes, allocated once at startup
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub encoders: usize,
    pub recorders: usize,
    pub streamers: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            encoders: DEFAULT_ENCODERS,
            recorders: DEFAULT_RECORDERS,
            streamers: DEFAULT_STREAMERS,
        }
    }
}

/// Audio feed settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Input device name, `None` selects the host default
    pub device: Option<String>,
    /// Sample rate requested from the device
    pub sample_rate: u32,
    /// Seconds without an audio callback before the watchdog shuts down
    pub watchdog_timeout_secs: u64,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            device: None,
            sample_rate: DEFAULT_SAMPLE_RATE,
            watchdog_timeout_secs: DEFAULT_WATCHDOG_TIMEOUT_SECS,
        }
    }
}

/// Encoder slot settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    /// PCM ring capacity per channel, in samples
    pub input_ring_samples: usize,
    /// Packet queue capacity of every registered client
    pub client_queue_packets: usize,
    /// Worker polling interval
    pub poll_interval_ms: u64,
    /// Length of the fade-out ramp
    pub fade_seconds: f32,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            input_ring_samples: ENCODER_RING_SAMPLES,
            client_queue_packets: CLIENT_QUEUE_PACKETS,
            poll_interval_ms: POLL_INTERVAL_MS,
            fade_seconds: FADE_SECONDS,
        }
    }
}

impl EncoderConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Recorder settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    /// PCM ring capacity per channel for raw recordings, in samples
    pub input_ring_samples: usize,
    /// Folder used when a command does not name one
    pub default_folder: PathBuf,
    /// Worker polling interval
    pub poll_interval_ms: u64,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        let default_folder = directories::UserDirs::new()
            .and_then(|dirs| dirs.audio_dir().map(Path::to_path_buf))
            .unwrap_or_else(std::env::temp_dir);
        Self {
            input_ring_samples: RECORDER_RING_SAMPLES,
            default_folder,
            poll_interval_ms: POLL_INTERVAL_MS,
        }
    }
}

impl RecorderConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Control thread settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// Upper bound for synchronous start/stop/pause acknowledgements
    pub state_wait_timeout_secs: u64,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            state_wait_timeout_secs: STATE_WAIT_TIMEOUT_SECS,
        }
    }
}

impl ControlConfig {
    pub fn state_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.state_wait_timeout_secs)
    }
}

impl AppConfig {
    /// Parse a configuration from TOML text
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Config(e.to_string()))
    }

    /// Load from an explicit file
    pub fn load_from(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    /// Load from the platform config directory, falling back to defaults
    pub fn load() -> Result<Self> {
        match Self::default_path() {
            Some(path) if path.exists() => {
                tracing::info!("Loading configuration from {}", path.display());
                Self::load_from(&path)
            }
            _ => Ok(Self::default()),
        }
    }

    /// `<config dir>/livecast/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("org", "livecast", "livecast")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Serialize back to TOML, used to write a starter file
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = AppConfig::from_toml(
            r#"
            [pools]
            encoders = 2

            [encoder]
            client_queue_packets = 16
            "#,
        )
        .unwrap();

        assert_eq!(config.pools.encoders, 2);
        assert_eq!(config.pools.recorders, DEFAULT_RECORDERS);
        assert_eq!(config.encoder.client_queue_packets, 16);
        assert_eq!(config.encoder.input_ring_samples, ENCODER_RING_SAMPLES);
    }

    #[test]
    fn test_roundtrip_through_toml() {
        let config = AppConfig::default();
        let text = config.to_toml().unwrap();
        let parsed = AppConfig::from_toml(&text).unwrap();
        assert_eq!(parsed.pools.streamers, config.pools.streamers);
        assert_eq!(parsed.control.state_wait_timeout_secs, STATE_WAIT_TIMEOUT_SECS);
    }

    #[test]
    fn test_bad_toml_is_config_error() {
        let err = AppConfig::from_toml("pools = 3").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
