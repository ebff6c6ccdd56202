//! Audio Configuration
//!
//! Engine settings, loadable from JSON.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::AudioResult;

/// How one-shot sample data is shared between channels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SampleStrategy {
    /// The backend keeps the decoded sample; each channel spawns a player from it
    #[default]
    FactoryOwned,
    /// The engine keeps decoded PCM; each channel builds its own player from the buffer
    PerChannelBuffer,
}

/// Audio engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Preferred output device (None for the backend default)
    pub device: Option<String>,
    /// Sample data strategy
    pub sample_strategy: SampleStrategy,
    /// Concurrency used for samples looked up from a store
    pub default_playback_concurrency: usize,
    /// Stop the oldest voice when a factory exceeds its concurrency
    pub enforce_playback_concurrency: bool,
    /// Tick period of the dedicated audio thread
    pub update_interval_ms: u64,
    /// Minimum time between amplitude recomputations
    pub amplitude_interval_ms: f64,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            device: None,
            sample_strategy: SampleStrategy::FactoryOwned,
            default_playback_concurrency: 2,
            enforce_playback_concurrency: true,
            update_interval_ms: 1,
            amplitude_interval_ms: 1000.0 / 60.0,
        }
    }
}

impl AudioConfig {
    /// Parse a configuration from JSON; missing fields take their defaults
    pub fn from_json(json: &str) -> AudioResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load a configuration file
    pub fn load(path: impl AsRef<Path>) -> AudioResult<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Serialize to pretty JSON
    pub fn to_json(&self) -> AudioResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
