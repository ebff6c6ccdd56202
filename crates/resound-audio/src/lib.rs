//! # Resound Audio
//!
//! Streaming audio engine built on the Resound core runtime.
//!
//! ## Features
//! - Streaming tracks decoded incrementally on a background worker
//! - Pooled one-shot samples with deferred playback and a voice cap
//! - Mixers with identity-keyed channel sets and prioritized biquad effects
//! - Device enumeration, opening and switching
//!
//! All native state is mutated on one owning thread. Public operations may
//! be called from any thread; they are funneled onto the owner through the
//! [`resound_core::Scheduler`].

pub mod adjust;
pub mod channel;
pub mod config;
pub mod context;
pub mod device;
pub mod effect;
pub mod manager;
pub mod mixer;
pub mod sample;
pub mod thread;
pub mod track;

pub use adjust::{AMPLITUDES_SIZE, Adjustments, ChannelAmplitudes, TEMPO_MINIMUM_SUPPORTED};
pub use channel::{ChannelId, ChannelKind, ChannelRegistration, MixerChannel, MixerLink};
pub use config::{AudioConfig, SampleStrategy};
pub use context::AudioContext;
pub use device::{DeviceEvent, DeviceManager};
pub use effect::{BiquadParameters, Effect, EffectChain, EffectParameters, FilterKind};
pub use manager::{AudioManager, GLOBAL_MIXER, SAMPLE_MIXER, TRACK_MIXER};
pub use mixer::Mixer;
pub use sample::{SampleChannel, SampleFactory};
pub use thread::AudioThread;
pub use track::Track;

pub use resound_core::{CoreError, Pending};
pub use resound_platform::{AudioBackend, ByteStream, ResourceStore, VirtualBackend};

use thiserror::Error;

/// Audio engine errors
#[derive(Error, Debug)]
pub enum AudioError {
    #[error("Cannot {operation} a disposed {object}")]
    Disposed {
        object: &'static str,
        operation: &'static str,
    },

    #[error("{object} does not support tempo below {minimum}, got {requested}. Use frequency instead.")]
    UnsupportedTempo {
        object: &'static str,
        minimum: f64,
        requested: f64,
    },

    #[error("Native call failed: {0}")]
    NativeCall(&'static str),

    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    #[error("Audio thread exited before the manager was ready")]
    ThreadExited,

    #[error("Task failed: {0}")]
    Task(#[from] CoreError),

    #[error("Configuration error: {0}")]
    Config(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for audio operations
pub type AudioResult<T> = Result<T, AudioError>;
