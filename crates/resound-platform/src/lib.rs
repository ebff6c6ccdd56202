//! # Resound Platform
//!
//! Native audio capability layer for the Resound audio engine.
//!
//! This crate provides:
//! - **Audio**: The [`AudioBackend`] capability and its opaque native handles
//! - **Stream**: Byte streams and the read/seek callbacks handed to native decoders
//! - **Resources**: Named resource stores backed by directories or memory
//! - **Virtual**: A deterministic software backend used for tests and headless runs

pub mod audio;
pub mod resources;
pub mod stream;
pub mod virtual_backend;

pub use audio::{
    AudioBackend, AudioSpec, BiquadCoefficients, BiquadType, ChannelLayout, DecodeStatus,
    DecoderHandle, DecoderMetadata, FilterHandle, ManagerHandle, MixerHandle, PcmBuffer,
    SampleFactoryHandle, SampleHandle, TrackHandle,
};
pub use resources::{DirectoryStore, MemoryStore, ResourceStore};
pub use stream::{ByteStream, CallbackReader, ReadOutcome, SeekOrigin, StreamCallbacks};
pub use virtual_backend::{VirtualBackend, VirtualStats};

use thiserror::Error;

/// Platform-specific errors
#[derive(Error, Debug)]
pub enum PlatformError {
    #[error("File I/O error: {0}")]
    FileIO(#[from] std::io::Error),

    #[error("Unsupported audio data: {0}")]
    UnsupportedAudio(String),
}

/// Result type for platform operations
pub type PlatformResult<T> = Result<T, PlatformError>;

impl From<hound::Error> for PlatformError {
    fn from(err: hound::Error) -> Self {
        match err {
            hound::Error::IoError(io) => Self::FileIO(io),
            other => Self::UnsupportedAudio(other.to_string()),
        }
    }
}
