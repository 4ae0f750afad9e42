//! Player configuration.
//!
//! Settings are plain serde structs so they can be stored as JSON next to the
//! sound bank. Every field has a default, so a config file only needs to list
//! what it overrides.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Files shorter than this are read into memory when opened.
pub const DEFAULT_SLURP_THRESHOLD: u64 = 5 * 1024 * 1024;

/// Errors that can occur while loading a configuration file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Settings shared by the synthesis engine, the player and its transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerConfig {
    /// Output sample rate in Hz.
    pub sample_rate: u32,

    /// Frames requested per transport callback.
    /// Smaller = lower latency but higher CPU usage.
    pub frames_per_callback: usize,

    /// Output channel count (1 = mono, 2 = stereo).
    pub channels: u16,

    /// Maximum number of sessions open against one engine at a time.
    pub max_sessions: usize,

    /// Files shorter than this many bytes are held in memory.
    pub slurp_threshold: u64,

    /// Consecutive failed renders tolerated before playback is abandoned.
    pub max_read_failures: u32,

    /// Voices per synthesizer.
    pub maximum_polyphony: usize,

    /// Whether the synthesizer runs its reverb and chorus effects.
    pub enable_reverb_and_chorus: bool,

    /// SoundFont to load. `None` selects the built-in bank.
    pub sound_bank: Option<PathBuf>,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            sample_rate: 44100,
            frames_per_callback: 256,
            channels: 2,
            max_sessions: 8,
            slurp_threshold: DEFAULT_SLURP_THRESHOLD,
            max_read_failures: 16,
            maximum_polyphony: 64,
            enable_reverb_and_chorus: true,
            sound_bank: None,
        }
    }
}

impl PlayerConfig {
    /// Parses a configuration from JSON and validates it.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON is malformed or a value is out of range.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: PlayerConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a configuration file.
    ///
    /// # Arguments
    ///
    /// * `path` - Path to a JSON config file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let json = fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Checks that every value is usable by the synthesizer and transports.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(16000..=192000).contains(&self.sample_rate) {
            return Err(ConfigError::Invalid(format!(
                "sample_rate must be within 16000..=192000, got {}",
                self.sample_rate
            )));
        }
        if !(1..=8192).contains(&self.frames_per_callback) {
            return Err(ConfigError::Invalid(format!(
                "frames_per_callback must be within 1..=8192, got {}",
                self.frames_per_callback
            )));
        }
        if self.channels == 0 {
            return Err(ConfigError::Invalid("channels must be at least 1".into()));
        }
        if self.max_sessions == 0 {
            return Err(ConfigError::Invalid(
                "max_sessions must be at least 1".into(),
            ));
        }
        if self.max_read_failures == 0 {
            return Err(ConfigError::Invalid(
                "max_read_failures must be at least 1".into(),
            ));
        }
        if !(8..=256).contains(&self.maximum_polyphony) {
            return Err(ConfigError::Invalid(format!(
                "maximum_polyphony must be within 8..=256, got {}",
                self.maximum_polyphony
            )));
        }
        Ok(())
    }
}
