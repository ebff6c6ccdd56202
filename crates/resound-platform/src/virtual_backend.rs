//! Virtual Backend
//!
//! A software [`AudioBackend`] with a manually advanced clock. It decodes WAV
//! data with `hound`, keeps every native object in handle tables, and records
//! enough bookkeeping for tests to observe what the engine asked of it.
//! Calls against unknown handles are logged and counted rather than ignored,
//! so use-after-release bugs show up in [`VirtualStats::invalid_handle_calls`].

use std::num::NonZeroU64;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use ahash::AHashMap;
use hound::WavReader;
use parking_lot::{Mutex, RwLock};
use resound_core::RawHandle;
use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};

use crate::PlatformResult;
use crate::audio::{
    AudioBackend, AudioSpec, BiquadCoefficients, DecodeStatus, DecoderHandle, DecoderMetadata,
    FilterHandle, ManagerHandle, MixerHandle, PcmBuffer, SampleFactoryHandle, SampleHandle,
    TrackHandle,
};
use crate::stream::{CallbackReader, StreamCallbacks};

/// Frames decoded per decoder step unless configured otherwise
pub const DEFAULT_CHUNK_FRAMES: usize = 8192;

/// Counters of native calls made against a [`VirtualBackend`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VirtualStats {
    pub managers_created: u64,
    pub managers_destroyed: u64,
    pub device_opens: u64,
    pub mixers_created: u64,
    pub mixers_destroyed: u64,
    pub tracks_created: u64,
    pub tracks_destroyed: u64,
    pub decoders_created: u64,
    pub decoders_destroyed: u64,
    pub decoder_steps: u64,
    pub sample_factories_created: u64,
    pub sample_factories_destroyed: u64,
    pub samples_created: u64,
    pub samples_destroyed: u64,
    pub sample_plays: u64,
    pub filters_applied: u64,
    pub filters_updated: u64,
    pub filters_removed: u64,
    pub invalid_handle_calls: u64,
}

#[derive(Default)]
struct ManagerState {
    device: Option<String>,
    mixers: Vec<MixerHandle>,
}

#[derive(Default)]
struct MixerState {
    tracks: Vec<TrackHandle>,
    samples: Vec<SampleHandle>,
    filters: Vec<FilterState>,
}

struct FilterState {
    handle: FilterHandle,
    priority: i32,
    coefficients: BiquadCoefficients,
}

struct TrackState {
    sample_rate: u32,
    channels: u16,
    pcm: Vec<f32>,
    total_frames: Option<u64>,
    loaded: bool,
    playing: bool,
    done: bool,
    looping: bool,
    restart_point_ms: f64,
    /// Playback position in frames
    position: f64,
    volume: f64,
    balance: f64,
    frequency: f64,
    tempo: f64,
    updates: u64,
}

impl TrackState {
    fn new() -> Self {
        Self {
            sample_rate: 0,
            channels: 0,
            pcm: Vec::new(),
            total_frames: None,
            loaded: false,
            playing: false,
            done: false,
            looping: false,
            restart_point_ms: 0.0,
            position: 0.0,
            volume: 1.0,
            balance: 0.0,
            frequency: 1.0,
            tempo: 1.0,
            updates: 0,
        }
    }

    fn decoded_frames(&self) -> u64 {
        if self.channels == 0 {
            0
        } else {
            (self.pcm.len() / self.channels as usize) as u64
        }
    }

    fn seekable_frames(&self) -> u64 {
        self.total_frames.unwrap_or_else(|| self.decoded_frames())
    }

    fn frames_to_ms(&self, frames: f64) -> f64 {
        if self.sample_rate == 0 {
            0.0
        } else {
            frames * 1000.0 / self.sample_rate as f64
        }
    }

    fn ms_to_frames(&self, ms: f64) -> f64 {
        ms * self.sample_rate as f64 / 1000.0
    }

    fn advance(&mut self, seconds: f64) {
        if !self.playing || self.sample_rate == 0 {
            return;
        }

        self.position += seconds * self.sample_rate as f64 * self.frequency * self.tempo;

        if !self.loaded {
            self.position = self.position.min(self.decoded_frames() as f64);
            return;
        }

        let end = self.decoded_frames() as f64;
        if self.position < end {
            return;
        }

        let restart = self.ms_to_frames(self.restart_point_ms).clamp(0.0, end);
        if self.looping && end > restart {
            self.position = restart + (self.position - end) % (end - restart);
        } else {
            self.position = end;
            self.playing = false;
            self.done = true;
        }
    }
}

struct SampleState {
    data: Arc<PcmBuffer>,
    /// Playback position in frames
    position: f64,
    playing: bool,
    looping: bool,
    volume: f64,
    balance: f64,
    frequency: f64,
    plays: u32,
}

impl SampleState {
    fn new(data: Arc<PcmBuffer>) -> Self {
        Self {
            data,
            position: 0.0,
            playing: false,
            looping: false,
            volume: 1.0,
            balance: 0.0,
            frequency: 1.0,
            plays: 0,
        }
    }

    fn advance(&mut self, seconds: f64) {
        if !self.playing {
            return;
        }

        self.position += seconds * self.data.sample_rate as f64 * self.frequency;
        let end = self.data.frames() as f64;
        if self.position < end {
            return;
        }

        if self.looping && end > 0.0 {
            self.position %= end;
        } else {
            self.position = 0.0;
            self.playing = false;
        }
    }
}

struct VirtualDecoder {
    track: TrackHandle,
    pending: Option<StreamCallbacks>,
    reader: Option<WavReader<CallbackReader>>,
    total_frames: u64,
    decoded_frames: u64,
    done: bool,
    metadata: DecoderMetadata,
}

#[derive(Default)]
struct VirtualState {
    managers: AHashMap<ManagerHandle, ManagerState>,
    mixers: AHashMap<MixerHandle, MixerState>,
    tracks: AHashMap<TrackHandle, TrackState>,
    factories: AHashMap<SampleFactoryHandle, Option<Arc<PcmBuffer>>>,
    samples: AHashMap<SampleHandle, SampleState>,
}

/// Deterministic software audio backend
pub struct VirtualBackend {
    spec: AudioSpec,
    chunk_frames: usize,
    devices: RwLock<Vec<String>>,
    fail_device_open: AtomicBool,
    next_id: AtomicU64,
    state: Mutex<VirtualState>,
    decoders: Mutex<AHashMap<DecoderHandle, Arc<Mutex<VirtualDecoder>>>>,
    stats: Mutex<VirtualStats>,
    fft_plans: Mutex<AHashMap<usize, Arc<dyn Fft<f32>>>>,
}

impl VirtualBackend {
    /// Create a backend with two virtual output devices
    pub fn new() -> Self {
        Self::with_spec(AudioSpec::default())
    }

    /// Create a backend with the given output format
    pub fn with_spec(spec: AudioSpec) -> Self {
        Self {
            spec,
            chunk_frames: DEFAULT_CHUNK_FRAMES,
            devices: RwLock::new(vec![
                "Virtual Output".to_string(),
                "Virtual Headphones".to_string(),
            ]),
            fail_device_open: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            state: Mutex::new(VirtualState::default()),
            decoders: Mutex::new(AHashMap::new()),
            stats: Mutex::new(VirtualStats::default()),
            fft_plans: Mutex::new(AHashMap::new()),
        }
    }

    /// Set how many frames each decoder step produces
    pub fn with_chunk_frames(mut self, frames: usize) -> Self {
        self.chunk_frames = frames.max(1);
        self
    }

    /// Replace the list of devices reported by `list_devices`
    pub fn set_devices(&self, devices: Vec<String>) {
        *self.devices.write() = devices;
    }

    /// Make every subsequent `open_device` call fail
    pub fn set_fail_device_open(&self, fail: bool) {
        self.fail_device_open.store(fail, Ordering::Release);
    }

    /// Move the playback clock forward
    pub fn advance(&self, elapsed: Duration) {
        let seconds = elapsed.as_secs_f64();
        let mut state = self.state.lock();
        for track in state.tracks.values_mut() {
            track.advance(seconds);
        }
        for sample in state.samples.values_mut() {
            sample.advance(seconds);
        }
    }

    /// Get a snapshot of the call counters
    pub fn stats(&self) -> VirtualStats {
        *self.stats.lock()
    }

    /// Device opened by a manager
    pub fn opened_device(&self, manager: ManagerHandle) -> Option<String> {
        self.state
            .lock()
            .managers
            .get(&manager)
            .and_then(|m| m.device.clone())
    }

    /// Mixers registered with a manager
    pub fn manager_mixers(&self, manager: ManagerHandle) -> Vec<MixerHandle> {
        self.state
            .lock()
            .managers
            .get(&manager)
            .map(|m| m.mixers.clone())
            .unwrap_or_default()
    }

    /// Tracks attached to a mixer
    pub fn mixer_tracks(&self, mixer: MixerHandle) -> Vec<TrackHandle> {
        self.state
            .lock()
            .mixers
            .get(&mixer)
            .map(|m| m.tracks.clone())
            .unwrap_or_default()
    }

    /// Sample players attached to a mixer
    pub fn mixer_samples(&self, mixer: MixerHandle) -> Vec<SampleHandle> {
        self.state
            .lock()
            .mixers
            .get(&mixer)
            .map(|m| m.samples.clone())
            .unwrap_or_default()
    }

    /// Filters installed on a mixer, in processing order
    pub fn mixer_filters(&self, mixer: MixerHandle) -> Vec<(i32, BiquadCoefficients)> {
        self.state
            .lock()
            .mixers
            .get(&mixer)
            .map(|m| {
                m.filters
                    .iter()
                    .map(|f| (f.priority, f.coefficients))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of live tracks
    pub fn live_tracks(&self) -> usize {
        self.state.lock().tracks.len()
    }

    /// Number of live sample players
    pub fn live_samples(&self) -> usize {
        self.state.lock().samples.len()
    }

    /// Number of live sample factories
    pub fn live_sample_factories(&self) -> usize {
        self.state.lock().factories.len()
    }

    /// Number of live mixers
    pub fn live_mixers(&self) -> usize {
        self.state.lock().mixers.len()
    }

    /// Number of live decoders
    pub fn live_decoders(&self) -> usize {
        self.decoders.lock().len()
    }

    /// Number of sample players currently producing sound
    pub fn playing_samples(&self) -> usize {
        self.state
            .lock()
            .samples
            .values()
            .filter(|s| s.playing)
            .count()
    }

    /// Whether a track is playing
    pub fn is_track_playing(&self, track: TrackHandle) -> bool {
        self.state
            .lock()
            .tracks
            .get(&track)
            .is_some_and(|t| t.playing)
    }

    /// Volume and balance last pushed to a track
    pub fn track_volume(&self, track: TrackHandle) -> Option<(f64, f64)> {
        self.state
            .lock()
            .tracks
            .get(&track)
            .map(|t| (t.volume, t.balance))
    }

    /// Frequency and tempo last pushed to a track
    pub fn track_freq_tempo(&self, track: TrackHandle) -> Option<(f64, f64)> {
        self.state
            .lock()
            .tracks
            .get(&track)
            .map(|t| (t.frequency, t.tempo))
    }

    /// Loop flag and restart point of a track
    pub fn track_loop_state(&self, track: TrackHandle) -> Option<(bool, f64)> {
        self.state
            .lock()
            .tracks
            .get(&track)
            .map(|t| (t.looping, t.restart_point_ms))
    }

    /// Number of `track_update` calls a track has received
    pub fn track_updates(&self, track: TrackHandle) -> u64 {
        self.state
            .lock()
            .tracks
            .get(&track)
            .map_or(0, |t| t.updates)
    }

    /// Number of times a sample player was started
    pub fn sample_play_count(&self, sample: SampleHandle) -> u32 {
        self.state
            .lock()
            .samples
            .get(&sample)
            .map_or(0, |s| s.plays)
    }

    /// Volume, balance and frequency of a sample player
    pub fn sample_adjustments(&self, sample: SampleHandle) -> Option<(f64, f64, f64)> {
        self.state
            .lock()
            .samples
            .get(&sample)
            .map(|s| (s.volume, s.balance, s.frequency))
    }

    /// Loop flag of a sample player
    pub fn sample_looping(&self, sample: SampleHandle) -> Option<bool> {
        self.state.lock().samples.get(&sample).map(|s| s.looping)
    }

    fn allocate<H: RawHandle>(&self) -> H {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        H::from_raw(NonZeroU64::new(id).unwrap_or(NonZeroU64::MIN))
    }

    /// Forward FFT of `size` points, planned once per size
    fn spectrum_plan(&self, size: usize) -> Arc<dyn Fft<f32>> {
        self.fft_plans
            .lock()
            .entry(size)
            .or_insert_with(|| FftPlanner::new().plan_fft_forward(size))
            .clone()
    }

    fn record(&self, update: impl FnOnce(&mut VirtualStats)) {
        update(&mut self.stats.lock());
    }

    fn invalid(&self, call: &str, handle: u64) {
        log::warn!("{} called with unknown handle {}", call, handle);
        self.record(|s| s.invalid_handle_calls += 1);
    }

    fn with_track<R>(
        &self,
        call: &str,
        track: TrackHandle,
        fallback: R,
        f: impl FnOnce(&mut TrackState) -> R,
    ) -> R {
        let mut state = self.state.lock();
        match state.tracks.get_mut(&track) {
            Some(t) => f(t),
            None => {
                drop(state);
                self.invalid(call, track.get());
                fallback
            }
        }
    }

    fn with_sample<R>(
        &self,
        call: &str,
        sample: SampleHandle,
        fallback: R,
        f: impl FnOnce(&mut SampleState) -> R,
    ) -> R {
        let mut state = self.state.lock();
        match state.samples.get_mut(&sample) {
            Some(s) => f(s),
            None => {
                drop(state);
                self.invalid(call, sample.get());
                fallback
            }
        }
    }

    fn with_mixer<R>(
        &self,
        call: &str,
        mixer: MixerHandle,
        fallback: R,
        f: impl FnOnce(&mut MixerState) -> R,
    ) -> R {
        let mut state = self.state.lock();
        match state.mixers.get_mut(&mixer) {
            Some(m) => f(m),
            None => {
                drop(state);
                self.invalid(call, mixer.get());
                fallback
            }
        }
    }

    fn decoder(&self, decoder: DecoderHandle) -> Option<Arc<Mutex<VirtualDecoder>>> {
        let entry = self.decoders.lock().get(&decoder).cloned();
        if entry.is_none() {
            self.invalid("decoder", decoder.get());
        }
        entry
    }

    fn step_decoder(&self, decoder: &mut VirtualDecoder) -> DecodeStatus {
        if decoder.done {
            return DecodeStatus::Finished;
        }

        if decoder.reader.is_none() {
            let Some(source) = decoder.pending.take() else {
                return DecodeStatus::Failed(-1);
            };
            let reader = match WavReader::new(source.into_reader()) {
                Ok(reader) => reader,
                Err(e) => {
                    log::warn!("Virtual decoder could not parse stream: {}", e);
                    return DecodeStatus::Failed(-2);
                }
            };

            let spec = reader.spec();
            decoder.total_frames = u64::from(reader.duration());
            decoder.metadata.bitrate_kbps =
                spec.sample_rate * u32::from(spec.channels) * u32::from(spec.bits_per_sample)
                    / 1000;

            if let Some(track) = self.state.lock().tracks.get_mut(&decoder.track) {
                track.sample_rate = spec.sample_rate;
                track.channels = spec.channels;
                track.total_frames = Some(decoder.total_frames);
            }
            decoder.reader = Some(reader);
        }

        let Some(reader) = decoder.reader.as_mut() else {
            return DecodeStatus::Failed(-1);
        };
        let spec = reader.spec();
        let chunk = match read_samples(reader, self.chunk_frames * spec.channels as usize) {
            Ok(chunk) => chunk,
            Err(e) => {
                log::warn!("Virtual decoder read failed: {}", e);
                return DecodeStatus::Failed(-3);
            }
        };

        let frames = (chunk.len() / spec.channels.max(1) as usize) as u64;
        decoder.decoded_frames += frames;
        let finished =
            frames < self.chunk_frames as u64 || decoder.decoded_frames >= decoder.total_frames;
        decoder.metadata.length_ms =
            decoder.decoded_frames as f64 * 1000.0 / spec.sample_rate.max(1) as f64;

        if let Some(track) = self.state.lock().tracks.get_mut(&decoder.track) {
            track.pcm.extend_from_slice(&chunk);
            track.loaded = finished;
        }

        if finished {
            decoder.done = true;
            decoder.reader = None;
        }

        self.record(|s| s.decoder_steps += 1);
        DecodeStatus::Continue
    }
}

impl Default for VirtualBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn read_samples(reader: &mut WavReader<CallbackReader>, max_samples: usize) -> PlatformResult<Vec<f32>> {
    let spec = reader.spec();
    let mut out = Vec::with_capacity(max_samples.min(reader.len() as usize));

    match spec.sample_format {
        hound::SampleFormat::Float => {
            for sample in reader.samples::<f32>().take(max_samples) {
                out.push(sample?);
            }
        }
        hound::SampleFormat::Int => {
            let scale = 1.0 / (1u64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
            for sample in reader.samples::<i32>().take(max_samples) {
                out.push(sample? as f32 * scale);
            }
        }
    }

    Ok(out)
}

fn decode_wav(source: StreamCallbacks) -> PlatformResult<PcmBuffer> {
    let mut reader = WavReader::new(source.into_reader())?;
    let spec = reader.spec();
    let remaining = reader.len() as usize;
    let samples = read_samples(&mut reader, remaining)?;
    Ok(PcmBuffer {
        sample_rate: spec.sample_rate,
        channels: spec.channels,
        samples,
    })
}

/// Magnitude spectrum of `window` zero padded to `size` frames, written into `bins`
fn spectrum(plan: &dyn Fft<f32>, size: usize, window: &[f32], bins: &mut [f32]) {
    let n = window.len().max(1) as f32;
    let mut buffer: Vec<Complex<f32>> = window.iter().map(|&x| Complex::new(x, 0.0)).collect();
    buffer.resize(size, Complex::new(0.0, 0.0));
    plan.process(&mut buffer);
    for (bin, value) in bins.iter_mut().zip(&buffer) {
        *bin = value.norm() / n;
    }
}

impl AudioBackend for VirtualBackend {
    fn audio_spec(&self) -> AudioSpec {
        self.spec
    }

    fn create_manager(&self) -> Option<ManagerHandle> {
        let handle = self.allocate();
        self.state
            .lock()
            .managers
            .insert(handle, ManagerState::default());
        self.record(|s| s.managers_created += 1);
        Some(handle)
    }

    fn destroy_manager(&self, manager: ManagerHandle) {
        if self.state.lock().managers.remove(&manager).is_none() {
            self.invalid("destroy_manager", manager.get());
            return;
        }
        self.record(|s| s.managers_destroyed += 1);
    }

    fn list_devices(&self, _manager: ManagerHandle) -> Vec<String> {
        self.devices.read().clone()
    }

    fn open_device(&self, manager: ManagerHandle, name: Option<&str>) -> bool {
        self.record(|s| s.device_opens += 1);
        if self.fail_device_open.load(Ordering::Acquire) {
            return false;
        }

        let devices = self.devices.read();
        let Some(default) = devices.first() else {
            return false;
        };
        let device = name
            .and_then(|n| devices.iter().find(|d| d.as_str() == n))
            .unwrap_or(default)
            .clone();
        drop(devices);

        let mut state = self.state.lock();
        match state.managers.get_mut(&manager) {
            Some(m) => {
                m.device = Some(device);
                true
            }
            None => {
                drop(state);
                self.invalid("open_device", manager.get());
                false
            }
        }
    }

    fn add_mixer(&self, manager: ManagerHandle, mixer: MixerHandle) {
        let mut state = self.state.lock();
        match state.managers.get_mut(&manager) {
            Some(m) if !m.mixers.contains(&mixer) => m.mixers.push(mixer),
            Some(_) => {}
            None => {
                drop(state);
                self.invalid("add_mixer", manager.get());
            }
        }
    }

    fn remove_mixer(&self, manager: ManagerHandle, mixer: MixerHandle) {
        let mut state = self.state.lock();
        match state.managers.get_mut(&manager) {
            Some(m) => m.mixers.retain(|&h| h != mixer),
            None => {
                drop(state);
                self.invalid("remove_mixer", manager.get());
            }
        }
    }

    fn create_mixer(&self) -> Option<MixerHandle> {
        let handle = self.allocate();
        self.state.lock().mixers.insert(handle, MixerState::default());
        self.record(|s| s.mixers_created += 1);
        Some(handle)
    }

    fn destroy_mixer(&self, mixer: MixerHandle) {
        let mut state = self.state.lock();
        if state.mixers.remove(&mixer).is_none() {
            drop(state);
            self.invalid("destroy_mixer", mixer.get());
            return;
        }
        for manager in state.managers.values_mut() {
            manager.mixers.retain(|&h| h != mixer);
        }
        drop(state);
        self.record(|s| s.mixers_destroyed += 1);
    }

    fn mixer_add_track(&self, mixer: MixerHandle, track: TrackHandle) {
        if !self.state.lock().tracks.contains_key(&track) {
            self.invalid("mixer_add_track", track.get());
            return;
        }
        self.with_mixer("mixer_add_track", mixer, (), |m| {
            if !m.tracks.contains(&track) {
                m.tracks.push(track);
            }
        });
    }

    fn mixer_remove_track(&self, mixer: MixerHandle, track: TrackHandle) {
        self.with_mixer("mixer_remove_track", mixer, (), |m| {
            m.tracks.retain(|&t| t != track)
        });
    }

    fn mixer_add_sample(&self, mixer: MixerHandle, sample: SampleHandle) {
        if !self.state.lock().samples.contains_key(&sample) {
            self.invalid("mixer_add_sample", sample.get());
            return;
        }
        self.with_mixer("mixer_add_sample", mixer, (), |m| {
            if !m.samples.contains(&sample) {
                m.samples.push(sample);
            }
        });
    }

    fn mixer_remove_sample(&self, mixer: MixerHandle, sample: SampleHandle) {
        self.with_mixer("mixer_remove_sample", mixer, (), |m| {
            m.samples.retain(|&s| s != sample)
        });
    }

    fn create_track(&self) -> Option<TrackHandle> {
        let handle = self.allocate();
        self.state.lock().tracks.insert(handle, TrackState::new());
        self.record(|s| s.tracks_created += 1);
        Some(handle)
    }

    fn destroy_track(&self, track: TrackHandle) {
        let mut state = self.state.lock();
        if state.tracks.remove(&track).is_none() {
            drop(state);
            self.invalid("destroy_track", track.get());
            return;
        }
        for mixer in state.mixers.values_mut() {
            mixer.tracks.retain(|&t| t != track);
        }
        drop(state);
        self.record(|s| s.tracks_destroyed += 1);
    }

    fn create_track_decoder(
        &self,
        track: TrackHandle,
        source: StreamCallbacks,
    ) -> Option<DecoderHandle> {
        if !self.state.lock().tracks.contains_key(&track) {
            self.invalid("create_track_decoder", track.get());
            return None;
        }

        let handle = self.allocate();
        let decoder = VirtualDecoder {
            track,
            pending: Some(source),
            reader: None,
            total_frames: 0,
            decoded_frames: 0,
            done: false,
            metadata: DecoderMetadata::default(),
        };
        self.decoders
            .lock()
            .insert(handle, Arc::new(Mutex::new(decoder)));
        self.record(|s| s.decoders_created += 1);
        Some(handle)
    }

    fn decoder_is_done(&self, decoder: DecoderHandle) -> bool {
        self.decoder(decoder).is_none_or(|d| d.lock().done)
    }

    fn decoder_step(&self, decoder: DecoderHandle) -> DecodeStatus {
        match self.decoder(decoder) {
            Some(entry) => self.step_decoder(&mut entry.lock()),
            None => DecodeStatus::Failed(-1),
        }
    }

    fn decoder_metadata(&self, decoder: DecoderHandle) -> DecoderMetadata {
        self.decoder(decoder)
            .map(|d| d.lock().metadata)
            .unwrap_or_default()
    }

    fn destroy_decoder(&self, decoder: DecoderHandle) {
        if self.decoders.lock().remove(&decoder).is_none() {
            self.invalid("destroy_decoder", decoder.get());
            return;
        }
        self.record(|s| s.decoders_destroyed += 1);
    }

    fn track_is_loaded(&self, track: TrackHandle) -> bool {
        self.with_track("track_is_loaded", track, false, |t| t.loaded)
    }

    fn track_length(&self, track: TrackHandle) -> f64 {
        self.with_track("track_length", track, 0.0, |t| {
            t.frames_to_ms(t.seekable_frames() as f64)
        })
    }

    fn track_play(&self, track: TrackHandle) {
        self.with_track("track_play", track, (), |t| {
            t.playing = true;
            t.done = false;
        });
    }

    fn track_pause(&self, track: TrackHandle) {
        self.with_track("track_pause", track, (), |t| t.playing = false);
    }

    fn track_set_position(&self, track: TrackHandle, position_ms: f64) -> f64 {
        self.with_track("track_set_position", track, 0.0, |t| {
            let frames = t
                .ms_to_frames(position_ms)
                .round()
                .clamp(0.0, t.seekable_frames() as f64);
            t.position = frames;
            t.done = false;
            t.frames_to_ms(frames)
        })
    }

    fn track_position(&self, track: TrackHandle) -> f64 {
        self.with_track("track_position", track, 0.0, |t| t.frames_to_ms(t.position))
    }

    fn track_set_loop(&self, track: TrackHandle, looping: bool) {
        self.with_track("track_set_loop", track, (), |t| t.looping = looping);
    }

    fn track_set_restart_point(&self, track: TrackHandle, position_ms: f64) {
        self.with_track("track_set_restart_point", track, (), |t| {
            t.restart_point_ms = position_ms
        });
    }

    fn track_set_volume(&self, track: TrackHandle, volume: f64, balance: f64) {
        self.with_track("track_set_volume", track, (), |t| {
            t.volume = volume;
            t.balance = balance;
        });
    }

    fn track_set_freq_tempo(&self, track: TrackHandle, frequency: f64, tempo: f64) {
        self.with_track("track_set_freq_tempo", track, (), |t| {
            t.frequency = frequency;
            t.tempo = tempo;
        });
    }

    fn track_is_done(&self, track: TrackHandle) -> bool {
        self.with_track("track_is_done", track, false, |t| t.done)
    }

    fn track_update(&self, track: TrackHandle) {
        self.with_track("track_update", track, (), |t| t.updates += 1);
    }

    fn track_amplitudes(&self, track: TrackHandle, fft: &mut [f32]) -> Option<[f32; 2]> {
        let window_frames = (fft.len() * 2).max(1);
        let plan = self.spectrum_plan(window_frames);
        self.with_track("track_amplitudes", track, None, |t| {
            let channels = t.channels as usize;
            if channels == 0 || t.pcm.is_empty() {
                return None;
            }

            let start = (t.position as usize).min(t.decoded_frames() as usize);
            let end = (start + window_frames).min(t.decoded_frames() as usize);

            let mut peaks = [0.0f32; 2];
            let mut mono = Vec::with_capacity(end - start);
            for frame in t.pcm[start * channels..end * channels].chunks(channels) {
                let left = frame[0].abs();
                let right = frame.get(1).map_or(left, |s| s.abs());
                peaks[0] = peaks[0].max(left);
                peaks[1] = peaks[1].max(right);
                mono.push(frame.iter().sum::<f32>() / channels as f32);
            }

            spectrum(plan.as_ref(), window_frames, &mono, fft);
            Some(peaks)
        })
    }

    fn create_sample_factory(&self) -> Option<SampleFactoryHandle> {
        let handle = self.allocate();
        self.state.lock().factories.insert(handle, None);
        self.record(|s| s.sample_factories_created += 1);
        Some(handle)
    }

    fn run_sample_factory_decoder(
        &self,
        factory: SampleFactoryHandle,
        source: StreamCallbacks,
    ) -> bool {
        let pcm = match decode_wav(source) {
            Ok(pcm) => pcm,
            Err(e) => {
                log::warn!("Virtual sample decode failed: {}", e);
                return false;
            }
        };

        let mut state = self.state.lock();
        match state.factories.get_mut(&factory) {
            Some(slot) => {
                *slot = Some(Arc::new(pcm));
                true
            }
            None => {
                drop(state);
                self.invalid("run_sample_factory_decoder", factory.get());
                false
            }
        }
    }

    fn sample_factory_length(&self, factory: SampleFactoryHandle) -> f64 {
        let state = self.state.lock();
        match state.factories.get(&factory) {
            Some(slot) => slot.as_ref().map_or(0.0, |pcm| pcm.duration_ms()),
            None => {
                drop(state);
                self.invalid("sample_factory_length", factory.get());
                0.0
            }
        }
    }

    fn destroy_sample_factory(&self, factory: SampleFactoryHandle) {
        if self.state.lock().factories.remove(&factory).is_none() {
            self.invalid("destroy_sample_factory", factory.get());
            return;
        }
        self.record(|s| s.sample_factories_destroyed += 1);
    }

    fn decode_to_pcm(&self, source: StreamCallbacks) -> Option<PcmBuffer> {
        match decode_wav(source) {
            Ok(pcm) => Some(pcm),
            Err(e) => {
                log::warn!("Virtual PCM decode failed: {}", e);
                None
            }
        }
    }

    fn create_sample(&self, factory: SampleFactoryHandle) -> Option<SampleHandle> {
        let data = {
            let state = self.state.lock();
            match state.factories.get(&factory) {
                Some(slot) => slot.clone()?,
                None => {
                    drop(state);
                    self.invalid("create_sample", factory.get());
                    return None;
                }
            }
        };
        self.create_sample_from_pcm(data)
    }

    fn create_sample_from_pcm(&self, data: Arc<PcmBuffer>) -> Option<SampleHandle> {
        let handle = self.allocate();
        self.state
            .lock()
            .samples
            .insert(handle, SampleState::new(data));
        self.record(|s| s.samples_created += 1);
        Some(handle)
    }

    fn destroy_sample(&self, sample: SampleHandle) {
        let mut state = self.state.lock();
        if state.samples.remove(&sample).is_none() {
            drop(state);
            self.invalid("destroy_sample", sample.get());
            return;
        }
        for mixer in state.mixers.values_mut() {
            mixer.samples.retain(|&s| s != sample);
        }
        drop(state);
        self.record(|s| s.samples_destroyed += 1);
    }

    fn sample_play(&self, sample: SampleHandle) {
        let started = self.with_sample("sample_play", sample, false, |s| {
            s.playing = true;
            s.plays += 1;
            true
        });
        if started {
            self.record(|s| s.sample_plays += 1);
        }
    }

    fn sample_pause(&self, sample: SampleHandle) {
        self.with_sample("sample_pause", sample, (), |s| s.playing = false);
    }

    fn sample_is_playing(&self, sample: SampleHandle) -> bool {
        self.with_sample("sample_is_playing", sample, false, |s| s.playing)
    }

    fn sample_set_loop(&self, sample: SampleHandle, looping: bool) {
        self.with_sample("sample_set_loop", sample, (), |s| s.looping = looping);
    }

    fn sample_set_volume(&self, sample: SampleHandle, volume: f64, balance: f64) {
        self.with_sample("sample_set_volume", sample, (), |s| {
            s.volume = volume;
            s.balance = balance;
        });
    }

    fn sample_set_frequency(&self, sample: SampleHandle, frequency: f64) {
        self.with_sample("sample_set_frequency", sample, (), |s| {
            s.frequency = frequency
        });
    }

    fn apply_biquad_filter(
        &self,
        mixer: MixerHandle,
        coefficients: BiquadCoefficients,
        priority: i32,
    ) -> Option<FilterHandle> {
        let handle: FilterHandle = self.allocate();
        let applied = self.with_mixer("apply_biquad_filter", mixer, false, |m| {
            let index = m.filters.partition_point(|f| f.priority <= priority);
            m.filters.insert(
                index,
                FilterState {
                    handle,
                    priority,
                    coefficients,
                },
            );
            true
        });

        if !applied {
            return None;
        }
        self.record(|s| s.filters_applied += 1);
        Some(handle)
    }

    fn update_biquad_filter(
        &self,
        mixer: MixerHandle,
        filter: FilterHandle,
        coefficients: BiquadCoefficients,
    ) {
        let updated = self.with_mixer("update_biquad_filter", mixer, false, |m| {
            match m.filters.iter_mut().find(|f| f.handle == filter) {
                Some(f) => {
                    f.coefficients = coefficients;
                    true
                }
                None => false,
            }
        });

        if updated {
            self.record(|s| s.filters_updated += 1);
        } else {
            self.invalid("update_biquad_filter", filter.get());
        }
    }

    fn remove_biquad_filter(&self, mixer: MixerHandle, filter: FilterHandle) {
        let removed = self.with_mixer("remove_biquad_filter", mixer, false, |m| {
            let before = m.filters.len();
            m.filters.retain(|f| f.handle != filter);
            m.filters.len() != before
        });

        if removed {
            self.record(|s| s.filters_removed += 1);
        } else {
            self.invalid("remove_biquad_filter", filter.get());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn wav_bytes(sample_rate: u32, channels: u16, frames: usize) -> Vec<u8> {
        let spec = hound::WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
            for i in 0..frames * channels as usize {
                let value = ((i as f32 * 0.05).sin() * i16::MAX as f32 * 0.5) as i16;
                writer.write_sample(value).unwrap();
            }
            writer.finalize().unwrap();
        }
        cursor.into_inner()
    }

    fn loaded_track(backend: &VirtualBackend, frames: usize) -> TrackHandle {
        let track = backend.create_track().unwrap();
        let decoder = backend
            .create_track_decoder(
                track,
                StreamCallbacks::from_bytes(wav_bytes(1000, 2, frames)),
            )
            .unwrap();
        while !backend.decoder_is_done(decoder) {
            assert_eq!(backend.decoder_step(decoder), DecodeStatus::Continue);
        }
        backend.destroy_decoder(decoder);
        track
    }

    #[test]
    fn test_incremental_decode() {
        let backend = VirtualBackend::new().with_chunk_frames(100);
        let track = backend.create_track().unwrap();
        let decoder = backend
            .create_track_decoder(track, StreamCallbacks::from_bytes(wav_bytes(1000, 2, 250)))
            .unwrap();

        assert_eq!(backend.decoder_step(decoder), DecodeStatus::Continue);
        assert!(!backend.decoder_is_done(decoder));
        assert!(!backend.track_is_loaded(track));
        assert_eq!(backend.decoder_metadata(decoder).bitrate_kbps, 1000 * 2 * 16 / 1000);
        assert!((backend.decoder_metadata(decoder).length_ms - 100.0).abs() < 1e-9);

        assert_eq!(backend.decoder_step(decoder), DecodeStatus::Continue);
        assert_eq!(backend.decoder_step(decoder), DecodeStatus::Continue);
        assert!(backend.decoder_is_done(decoder));
        assert!(backend.track_is_loaded(track));
        assert!((backend.track_length(track) - 250.0).abs() < 1e-9);
        assert_eq!(backend.decoder_step(decoder), DecodeStatus::Finished);
    }

    #[test]
    fn test_corrupt_stream_fails() {
        let backend = VirtualBackend::new();
        let track = backend.create_track().unwrap();
        let decoder = backend
            .create_track_decoder(track, StreamCallbacks::from_bytes(b"not a wave".to_vec()))
            .unwrap();
        assert!(matches!(backend.decoder_step(decoder), DecodeStatus::Failed(_)));
    }

    #[test]
    fn test_playback_clock_and_completion() {
        let backend = VirtualBackend::new();
        let track = loaded_track(&backend, 500);

        backend.track_play(track);
        backend.advance(Duration::from_millis(200));
        assert!((backend.track_position(track) - 200.0).abs() < 1e-6);

        backend.track_set_freq_tempo(track, 1.0, 2.0);
        backend.advance(Duration::from_millis(200));
        assert!(backend.track_is_done(track));
        assert!(!backend.is_track_playing(track));
        assert!((backend.track_position(track) - 500.0).abs() < 1e-6);
    }

    #[test]
    fn test_looping_wraps_to_restart_point() {
        let backend = VirtualBackend::new();
        let track = loaded_track(&backend, 500);

        backend.track_set_loop(track, true);
        backend.track_set_restart_point(track, 100.0);
        backend.track_set_position(track, 450.0);
        backend.track_play(track);
        backend.advance(Duration::from_millis(100));

        assert!(!backend.track_is_done(track));
        assert!((backend.track_position(track) - 150.0).abs() < 1e-6);
    }

    #[test]
    fn test_seek_clamps_to_length() {
        let backend = VirtualBackend::new();
        let track = loaded_track(&backend, 500);

        assert_eq!(backend.track_set_position(track, 250.0), 250.0);
        assert_eq!(backend.track_set_position(track, 900.0), 500.0);
        assert_eq!(backend.track_set_position(track, -5.0), 0.0);
    }

    #[test]
    fn test_sample_players_share_factory_data() {
        let backend = VirtualBackend::new();
        let factory = backend.create_sample_factory().unwrap();
        assert!(backend.create_sample(factory).is_none());

        assert!(backend.run_sample_factory_decoder(
            factory,
            StreamCallbacks::from_bytes(wav_bytes(1000, 1, 100))
        ));
        assert!((backend.sample_factory_length(factory) - 100.0).abs() < 1e-9);

        let a = backend.create_sample(factory).unwrap();
        let b = backend.create_sample(factory).unwrap();
        backend.sample_play(a);
        backend.sample_play(b);
        assert_eq!(backend.playing_samples(), 2);

        backend.advance(Duration::from_millis(150));
        assert_eq!(backend.playing_samples(), 0);
        assert_eq!(backend.stats().sample_plays, 2);
    }

    #[test]
    fn test_filters_ordered_by_priority() {
        let backend = VirtualBackend::new();
        let mixer = backend.create_mixer().unwrap();
        let mut low = BiquadCoefficients::passthrough();
        low.b0 = 0.5;

        let second = backend.apply_biquad_filter(mixer, low, 5).unwrap();
        let _first = backend
            .apply_biquad_filter(mixer, BiquadCoefficients::passthrough(), 1)
            .unwrap();

        let priorities: Vec<i32> = backend.mixer_filters(mixer).iter().map(|f| f.0).collect();
        assert_eq!(priorities, vec![1, 5]);

        backend.remove_biquad_filter(mixer, second);
        assert_eq!(backend.mixer_filters(mixer).len(), 1);
        assert_eq!(backend.stats().invalid_handle_calls, 0);
    }

    #[test]
    fn test_unknown_handles_are_counted() {
        let backend = VirtualBackend::new();
        let track = backend.create_track().unwrap();
        backend.destroy_track(track);
        backend.destroy_track(track);
        backend.track_play(track);
        assert_eq!(backend.stats().invalid_handle_calls, 2);
    }

    #[test]
    fn test_device_open() {
        let backend = VirtualBackend::new();
        let manager = backend.create_manager().unwrap();

        assert!(backend.open_device(manager, None));
        assert_eq!(backend.opened_device(manager).as_deref(), Some("Virtual Output"));

        assert!(backend.open_device(manager, Some("Virtual Headphones")));
        assert_eq!(
            backend.opened_device(manager).as_deref(),
            Some("Virtual Headphones")
        );

        backend.set_fail_device_open(true);
        assert!(!backend.open_device(manager, None));
    }

    #[test]
    fn test_amplitudes() {
        let backend = VirtualBackend::new();
        let track = loaded_track(&backend, 500);
        let mut fft = vec![0.0f32; 16];

        let peaks = backend.track_amplitudes(track, &mut fft).unwrap();
        assert!(peaks[0] > 0.0 && peaks[0] <= 1.0);
        assert!(fft.iter().any(|&bin| bin > 0.0));

        backend.track_amplitudes(track, &mut fft).unwrap();
        assert_eq!(backend.fft_plans.lock().len(), 1);
        assert!(backend.fft_plans.lock().contains_key(&32));
    }

    #[test]
    fn test_spectrum_of_pure_tone() {
        let backend = VirtualBackend::new();
        let plan = backend.spectrum_plan(32);
        let window: Vec<f32> = (0..32)
            .map(|i| (2.0 * std::f32::consts::PI * 4.0 * i as f32 / 32.0).cos())
            .collect();
        let mut bins = vec![0.0f32; 16];

        spectrum(plan.as_ref(), 32, &window, &mut bins);
        assert!((bins[4] - 0.5).abs() < 1e-4);
        for (k, &bin) in bins.iter().enumerate() {
            if k != 4 {
                assert!(bin < 1e-4, "bin {} = {}", k, bin);
            }
        }

        let silent = vec![0.0f32; 10];
        spectrum(plan.as_ref(), 32, &silent, &mut bins);
        assert!(bins.iter().all(|&bin| bin == 0.0));
    }
}
