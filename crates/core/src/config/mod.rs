use std::{
    net::{SocketAddr, ToSocketAddrs},
    path::Path,
};

use serde::{Deserialize, Serialize};

use crate::{control::is_valid_send_bpm, BeatDivider, BpmOscError, ControlState, Result};

/// Smallest frame the tempo estimator is willing to analyse.
pub const MIN_FRAME_SIZE: usize = 64;

/// Top-level configuration structure for the application.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub audio: AudioConfig,
    pub osc: OscConfig,
    pub tempo: TempoConfig,
}

impl AppConfig {
    /// Loads a configuration file. `.json` files are parsed as JSON, anything
    /// else as TOML. The result is validated before it is returned.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        let config = if is_json {
            Self::from_json_str(&text)?
        } else {
            Self::from_toml_str(&text)?
        };
        tracing::debug!(?path, "configuration loaded");
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| BpmOscError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(text).map_err(|e| BpmOscError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.audio.validate()?;
        self.osc.validate()?;
        self.tempo.validate()
    }
}

/// Configuration specific to the audio subsystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub sample_rate: u32,
    /// Samples per analysis hop. Frames never overlap.
    pub frame_size: usize,
    /// Index into the host's input devices; the system default when unset.
    pub device_index: Option<usize>,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 44_100,
            frame_size: 512,
            device_index: None,
        }
    }
}

impl AudioConfig {
    fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 {
            return Err(BpmOscError::Config("audio.sample_rate must be positive".into()));
        }
        if self.frame_size < MIN_FRAME_SIZE {
            return Err(BpmOscError::Config(format!(
                "audio.frame_size must be at least {MIN_FRAME_SIZE}"
            )));
        }
        Ok(())
    }
}

/// Where and how tempo messages are sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OscConfig {
    pub host: String,
    pub port: u16,
    pub tempo_address: String,
    pub resync_address: String,
}

impl Default for OscConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 7000,
            tempo_address: "/composition/tempocontroller/tempo".to_string(),
            resync_address: "/composition/tempocontroller/resync".to_string(),
        }
    }
}

impl OscConfig {
    /// Resolves `host:port` to the first matching socket address.
    pub fn target_addr(&self) -> Result<SocketAddr> {
        let host = self.host.trim();
        (host, self.port)
            .to_socket_addrs()
            .map_err(|e| BpmOscError::Config(format!("osc.host `{host}`: {e}")))?
            .next()
            .ok_or_else(|| BpmOscError::Config(format!("osc.host `{host}` did not resolve")))
    }

    fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(BpmOscError::Config("osc.host must not be empty".into()));
        }
        for (name, address) in [
            ("osc.tempo_address", &self.tempo_address),
            ("osc.resync_address", &self.resync_address),
        ] {
            if !address.starts_with('/') {
                return Err(BpmOscError::Config(format!(
                    "{name} must start with `/`, got `{address}`"
                )));
            }
        }
        self.target_addr().map(|_| ())
    }
}

/// Initial tempo controls applied when the engine is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TempoConfig {
    pub initial_send_bpm: u32,
    pub sync_enabled: bool,
    pub beat_divider: BeatDivider,
}

impl Default for TempoConfig {
    fn default() -> Self {
        let state = ControlState::default();
        Self {
            initial_send_bpm: state.send_bpm,
            sync_enabled: state.sync_enabled,
            beat_divider: state.beat_divider,
        }
    }
}

impl TempoConfig {
    pub fn initial_state(&self) -> ControlState {
        ControlState {
            sync_enabled: self.sync_enabled,
            beat_divider: self.beat_divider,
            send_bpm: self.initial_send_bpm,
        }
    }

    fn validate(&self) -> Result<()> {
        if !is_valid_send_bpm(self.initial_send_bpm) {
            return Err(BpmOscError::Config(format!(
                "tempo.initial_send_bpm {} is outside [20, 500]",
                self.initial_send_bpm
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = AppConfig::default();
        config.validate().unwrap();
        assert_eq!(config.audio.sample_rate, 44_100);
        assert_eq!(config.osc.port, 7000);
        assert_eq!(config.tempo.initial_send_bpm, 128);
    }

    #[test]
    fn partial_toml_falls_back_to_defaults() {
        let config = AppConfig::from_toml_str(
            r#"
            [osc]
            port = 7001

            [tempo]
            beat_divider = 2
            sync_enabled = false
            "#,
        )
        .unwrap();

        assert_eq!(config.osc.port, 7001);
        assert_eq!(config.osc.host, "127.0.0.1");
        assert_eq!(config.tempo.beat_divider, BeatDivider::Half);
        assert!(!config.tempo.sync_enabled);
        assert_eq!(config.audio, AudioConfig::default());
    }

    #[test]
    fn json_is_accepted() {
        let config =
            AppConfig::from_json_str(r#"{ "audio": { "frame_size": 1024, "device_index": 2 } }"#)
                .unwrap();
        assert_eq!(config.audio.frame_size, 1024);
        assert_eq!(config.audio.device_index, Some(2));
    }

    #[test]
    fn rejects_invalid_values() {
        let bad_divider = AppConfig::from_toml_str("[tempo]\nbeat_divider = 3\n");
        assert!(matches!(bad_divider, Err(BpmOscError::Config(_))));

        let bad_bpm = AppConfig::from_toml_str("[tempo]\ninitial_send_bpm = 10\n");
        assert!(matches!(bad_bpm, Err(BpmOscError::Config(_))));

        let bad_address = AppConfig::from_toml_str("[osc]\ntempo_address = \"tempo\"\n");
        assert!(matches!(bad_address, Err(BpmOscError::Config(_))));

        let tiny_frame = AppConfig::from_toml_str("[audio]\nframe_size = 16\n");
        assert!(matches!(tiny_frame, Err(BpmOscError::Config(_))));
    }

    #[test]
    fn initial_state_mirrors_tempo_section() {
        let tempo = TempoConfig {
            initial_send_bpm: 90,
            sync_enabled: false,
            beat_divider: BeatDivider::Half,
        };
        let state = tempo.initial_state();
        assert_eq!(state.send_bpm, 90);
        assert!(!state.sync_enabled);
        assert_eq!(state.beat_divider, BeatDivider::Half);
    }
}
