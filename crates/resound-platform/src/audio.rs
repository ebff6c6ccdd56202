//! Audio Backend
//!
//! The native audio capability consumed by the engine. Every resource is an
//! opaque non-zero handle; all mutating calls are expected to arrive on the
//! engine's owning thread, except for decoder steps which run on the decode
//! worker.

use std::num::NonZeroU64;
use std::sync::Arc;

use resound_core::RawHandle;
use serde::{Deserialize, Serialize};

use crate::stream::StreamCallbacks;

macro_rules! native_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(NonZeroU64);

        impl $name {
            /// Raw integer value
            pub fn get(self) -> u64 {
                self.0.get()
            }
        }

        impl RawHandle for $name {
            fn into_raw(self) -> NonZeroU64 {
                self.0
            }

            fn from_raw(raw: NonZeroU64) -> Self {
                Self(raw)
            }
        }
    };
}

native_handle!(
    /// Native audio manager (device owner)
    ManagerHandle
);
native_handle!(
    /// Native mixer
    MixerHandle
);
native_handle!(
    /// Native streaming track
    TrackHandle
);
native_handle!(
    /// Incremental decoder feeding a track
    DecoderHandle
);
native_handle!(
    /// Native sample factory holding decoded sample data
    SampleFactoryHandle
);
native_handle!(
    /// Native one-shot sample player
    SampleHandle
);
native_handle!(
    /// Biquad filter installed on a mixer
    FilterHandle
);

/// Audio channel layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelLayout {
    Mono,
    Stereo,
    Surround51,
    Surround71,
}

impl ChannelLayout {
    /// Get the number of channels
    pub fn channel_count(&self) -> usize {
        match self {
            Self::Mono => 1,
            Self::Stereo => 2,
            Self::Surround51 => 6,
            Self::Surround71 => 8,
        }
    }

    /// Layout for a raw channel count, if one exists
    pub fn from_count(count: usize) -> Option<Self> {
        match count {
            1 => Some(Self::Mono),
            2 => Some(Self::Stereo),
            6 => Some(Self::Surround51),
            8 => Some(Self::Surround71),
            _ => None,
        }
    }
}

/// Output format of the native device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioSpec {
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Channel layout
    pub channels: ChannelLayout,
}

impl Default for AudioSpec {
    fn default() -> Self {
        Self {
            sample_rate: 44100,
            channels: ChannelLayout::Stereo,
        }
    }
}

/// Result of one decoder step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeStatus {
    /// A chunk was decoded
    Continue,
    /// The decoder had nothing left to do
    Finished,
    /// The decoder failed with a native error code
    Failed(i32),
}

/// Running decoder metadata
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DecoderMetadata {
    /// Bitrate in kbps
    pub bitrate_kbps: u32,
    /// Length decoded or known so far, in milliseconds
    pub length_ms: f64,
}

/// Native biquad filter shapes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BiquadType {
    LowPass,
    HighPass,
    /// Band pass with constant skirt gain
    BandPass,
    /// Band pass with constant 0 dB peak gain
    BandPassQ,
    Notch,
    AllPass,
    PeakingEq,
    LowShelf,
    HighShelf,
}

/// Normalized biquad coefficients (`a0 == 1`)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BiquadCoefficients {
    pub kind: BiquadType,
    pub b0: f64,
    pub b1: f64,
    pub b2: f64,
    pub a1: f64,
    pub a2: f64,
}

impl BiquadCoefficients {
    /// Identity filter
    pub fn passthrough() -> Self {
        Self {
            kind: BiquadType::AllPass,
            b0: 1.0,
            b1: 0.0,
            b2: 0.0,
            a1: 0.0,
            a2: 0.0,
        }
    }

    /// Magnitude response at `frequency` Hz for the given sample rate
    pub fn magnitude_at(&self, frequency: f64, sample_rate: f64) -> f64 {
        let w = 2.0 * std::f64::consts::PI * frequency / sample_rate;
        let (s1, c1) = w.sin_cos();
        let (s2, c2) = (2.0 * w).sin_cos();

        let num_re = self.b0 + self.b1 * c1 + self.b2 * c2;
        let num_im = -(self.b1 * s1 + self.b2 * s2);
        let den_re = 1.0 + self.a1 * c1 + self.a2 * c2;
        let den_im = -(self.a1 * s1 + self.a2 * s2);

        (num_re.hypot(num_im)) / (den_re.hypot(den_im))
    }
}

/// Decoded interleaved PCM
#[derive(Debug, Clone, PartialEq)]
pub struct PcmBuffer {
    pub sample_rate: u32,
    pub channels: u16,
    pub samples: Vec<f32>,
}

impl PcmBuffer {
    /// Number of frames
    pub fn frames(&self) -> usize {
        if self.channels == 0 {
            0
        } else {
            self.samples.len() / self.channels as usize
        }
    }

    /// Duration in milliseconds
    pub fn duration_ms(&self) -> f64 {
        if self.sample_rate == 0 {
            0.0
        } else {
            self.frames() as f64 * 1000.0 / self.sample_rate as f64
        }
    }
}

/// The native audio capability.
///
/// Methods returning `Option` yield `None` on native failure; the engine logs
/// and degrades rather than aborting.
pub trait AudioBackend: Send + Sync + 'static {
    /// Output format used for filter coefficient computation
    fn audio_spec(&self) -> AudioSpec;

    // Manager and devices

    fn create_manager(&self) -> Option<ManagerHandle>;
    fn destroy_manager(&self, manager: ManagerHandle);
    fn list_devices(&self, manager: ManagerHandle) -> Vec<String>;
    /// Open the named device, or the default one for `None`. Reopens if already open.
    fn open_device(&self, manager: ManagerHandle, name: Option<&str>) -> bool;
    fn add_mixer(&self, manager: ManagerHandle, mixer: MixerHandle);
    fn remove_mixer(&self, manager: ManagerHandle, mixer: MixerHandle);

    // Mixers

    fn create_mixer(&self) -> Option<MixerHandle>;
    fn destroy_mixer(&self, mixer: MixerHandle);
    fn mixer_add_track(&self, mixer: MixerHandle, track: TrackHandle);
    fn mixer_remove_track(&self, mixer: MixerHandle, track: TrackHandle);
    fn mixer_add_sample(&self, mixer: MixerHandle, sample: SampleHandle);
    fn mixer_remove_sample(&self, mixer: MixerHandle, sample: SampleHandle);

    // Streaming tracks

    fn create_track(&self) -> Option<TrackHandle>;
    fn destroy_track(&self, track: TrackHandle);
    /// Bind a decoder reading from `source` to the track
    fn create_track_decoder(&self, track: TrackHandle, source: StreamCallbacks)
    -> Option<DecoderHandle>;
    fn decoder_is_done(&self, decoder: DecoderHandle) -> bool;
    /// Decode one bounded chunk into the track
    fn decoder_step(&self, decoder: DecoderHandle) -> DecodeStatus;
    fn decoder_metadata(&self, decoder: DecoderHandle) -> DecoderMetadata;
    fn destroy_decoder(&self, decoder: DecoderHandle);
    fn track_is_loaded(&self, track: TrackHandle) -> bool;
    fn track_length(&self, track: TrackHandle) -> f64;
    fn track_play(&self, track: TrackHandle);
    fn track_pause(&self, track: TrackHandle);
    /// Seek and return the position actually reached, in milliseconds
    fn track_set_position(&self, track: TrackHandle, position_ms: f64) -> f64;
    fn track_position(&self, track: TrackHandle) -> f64;
    fn track_set_loop(&self, track: TrackHandle, looping: bool);
    fn track_set_restart_point(&self, track: TrackHandle, position_ms: f64);
    fn track_set_volume(&self, track: TrackHandle, volume: f64, balance: f64);
    fn track_set_freq_tempo(&self, track: TrackHandle, frequency: f64, tempo: f64);
    /// Whether playback reached the end since the last play or seek
    fn track_is_done(&self, track: TrackHandle) -> bool;
    fn track_update(&self, track: TrackHandle);
    /// Fill `fft` with frequency magnitudes and return peak `[left, right]`
    fn track_amplitudes(&self, track: TrackHandle, fft: &mut [f32]) -> Option<[f32; 2]>;

    // Samples

    fn create_sample_factory(&self) -> Option<SampleFactoryHandle>;
    /// Decode `source` fully into the factory
    fn run_sample_factory_decoder(
        &self,
        factory: SampleFactoryHandle,
        source: StreamCallbacks,
    ) -> bool;
    fn sample_factory_length(&self, factory: SampleFactoryHandle) -> f64;
    fn destroy_sample_factory(&self, factory: SampleFactoryHandle);
    /// Decode `source` fully into engine-owned PCM
    fn decode_to_pcm(&self, source: StreamCallbacks) -> Option<PcmBuffer>;
    fn create_sample(&self, factory: SampleFactoryHandle) -> Option<SampleHandle>;
    fn create_sample_from_pcm(&self, data: Arc<PcmBuffer>) -> Option<SampleHandle>;
    fn destroy_sample(&self, sample: SampleHandle);
    fn sample_play(&self, sample: SampleHandle);
    fn sample_pause(&self, sample: SampleHandle);
    fn sample_is_playing(&self, sample: SampleHandle) -> bool;
    fn sample_set_loop(&self, sample: SampleHandle, looping: bool);
    fn sample_set_volume(&self, sample: SampleHandle, volume: f64, balance: f64);
    fn sample_set_frequency(&self, sample: SampleHandle, frequency: f64);

    // Filters

    fn apply_biquad_filter(
        &self,
        mixer: MixerHandle,
        coefficients: BiquadCoefficients,
        priority: i32,
    ) -> Option<FilterHandle>;
    fn update_biquad_filter(
        &self,
        mixer: MixerHandle,
        filter: FilterHandle,
        coefficients: BiquadCoefficients,
    );
    fn remove_biquad_filter(&self, mixer: MixerHandle, filter: FilterHandle);
}
