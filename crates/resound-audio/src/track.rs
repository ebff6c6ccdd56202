//! Streaming Tracks
//!
//! A track owns a native playback handle and a decode job that fills it
//! incrementally on the decode worker. The first decode step runs on the
//! owning thread when the track is created; the rest run in the background.
//!
//! Playback operations are funneled through the owning thread. The loader
//! lock serializes decode steps against disposal, so the decoder and track
//! handles are never released in the middle of a step.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use resound_core::{AtomicF64, AtomicHandle, DecodeJob, Pending};
use resound_platform::{
    AudioBackend, ByteStream, DecodeStatus, DecoderHandle, StreamCallbacks, TrackHandle,
};

use crate::adjust::{AMPLITUDES_SIZE, Adjustments, ChannelAmplitudes, TEMPO_MINIMUM_SUPPORTED};
use crate::channel::{ChannelId, ChannelKind, ChannelRegistration, MixerChannel, MixerLink};
use crate::context::AudioContext;
use crate::{AudioError, AudioResult};

struct LoaderState {
    source: Option<StreamCallbacks>,
    decoder: Option<DecoderHandle>,
    finished: bool,
}

/// Decode job feeding a track's native handle
pub(crate) struct TrackLoader {
    name: String,
    backend: Arc<dyn AudioBackend>,
    handle: AtomicHandle<TrackHandle>,
    state: Mutex<LoaderState>,
    loading: AtomicBool,
    loaded: AtomicBool,
    failed: AtomicBool,
    bitrate: AtomicU32,
    length: AtomicF64,
    steps: AtomicU64,
}

impl TrackLoader {
    fn new(
        name: String,
        backend: Arc<dyn AudioBackend>,
        handle: TrackHandle,
        source: StreamCallbacks,
    ) -> Self {
        Self {
            name,
            backend,
            handle: AtomicHandle::new(Some(handle)),
            state: Mutex::new(LoaderState {
                source: Some(source),
                decoder: None,
                finished: false,
            }),
            loading: AtomicBool::new(false),
            loaded: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            bitrate: AtomicU32::new(0),
            length: AtomicF64::new(0.0),
            steps: AtomicU64::new(0),
        }
    }

    fn finish(&self, state: &mut LoaderState) {
        if let Some(decoder) = state.decoder.take() {
            self.backend.destroy_decoder(decoder);
        }
        state.source = None;
        state.finished = true;
    }

    fn fail(&self, state: &mut LoaderState) -> bool {
        self.failed.store(true, Ordering::Release);
        self.loading.store(false, Ordering::Release);
        self.finish(state);
        false
    }

    /// Release the decoder and the track handle. Safe to call more than once.
    fn teardown(&self) {
        let mut state = self.state.lock();
        self.finish(&mut state);
        if let Some(track) = self.handle.take() {
            self.backend.track_pause(track);
            self.backend.destroy_track(track);
        }
    }
}

impl DecodeJob for TrackLoader {
    fn advance(&self) -> bool {
        let mut state = self.state.lock();
        if state.finished {
            return false;
        }
        let Some(track) = self.handle.load() else {
            self.finish(&mut state);
            return false;
        };

        let decoder = match state.decoder {
            Some(decoder) => decoder,
            None => {
                let Some(source) = state.source.take() else {
                    self.finish(&mut state);
                    return false;
                };
                match self.backend.create_track_decoder(track, source) {
                    Some(decoder) => {
                        state.decoder = Some(decoder);
                        decoder
                    }
                    None => {
                        log::error!("Failed to create decoder for track '{}'", self.name);
                        return self.fail(&mut state);
                    }
                }
            }
        };

        self.steps.fetch_add(1, Ordering::Relaxed);

        if self.backend.decoder_is_done(decoder) {
            self.finish(&mut state);
            self.length.store(self.backend.track_length(track));
            self.loading.store(false, Ordering::Release);
            self.loaded.store(true, Ordering::Release);
            log::debug!(
                "Track '{}' decoded ({:.0} ms)",
                self.name,
                self.length.load()
            );
            return false;
        }

        match self.backend.decoder_step(decoder) {
            DecodeStatus::Failed(code) => {
                log::error!("Decoder error {} on track '{}'", code, self.name);
                self.fail(&mut state)
            }
            DecodeStatus::Continue | DecodeStatus::Finished => {
                let metadata = self.backend.decoder_metadata(decoder);
                self.bitrate.store(metadata.bitrate_kbps, Ordering::Relaxed);
                self.length.store(metadata.length_ms);
                self.loading.store(true, Ordering::Release);
                true
            }
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

struct AmplitudeState {
    current: ChannelAmplitudes,
    last_time: f64,
    fft: Vec<f32>,
}

type CompletedCallback = Box<dyn FnMut() + Send>;

/// A streaming audio channel
pub struct Track {
    id: ChannelId,
    name: String,
    ctx: AudioContext,
    self_ref: Weak<Track>,
    loader: Arc<TrackLoader>,
    link: MixerLink,
    disposed: AtomicBool,
    running: AtomicBool,
    completed: AtomicBool,
    current_time: AtomicF64,
    looping: AtomicBool,
    restart_point: AtomicF64,
    adjustments: Mutex<Adjustments>,
    amplitude_requested: AtomicBool,
    amplitudes: Mutex<AmplitudeState>,
    on_completed: Mutex<Vec<CompletedCallback>>,
}

impl Track {
    /// Create the native track and start decoding. Must run on the owning thread.
    pub(crate) fn new(
        ctx: &AudioContext,
        stream: Box<dyn ByteStream>,
        name: impl Into<String>,
    ) -> AudioResult<Arc<Self>> {
        let name = name.into();
        let handle = ctx
            .backend
            .create_track()
            .ok_or(AudioError::NativeCall("create_track"))?;

        let loader = Arc::new(TrackLoader::new(
            name.clone(),
            ctx.backend.clone(),
            handle,
            StreamCallbacks::new(stream),
        ));

        let track = Arc::new_cyclic(|self_ref| Self {
            id: ChannelId::next(),
            name,
            ctx: ctx.clone(),
            self_ref: self_ref.clone(),
            loader: loader.clone(),
            link: MixerLink::default(),
            disposed: AtomicBool::new(false),
            running: AtomicBool::new(false),
            completed: AtomicBool::new(false),
            current_time: AtomicF64::new(0.0),
            looping: AtomicBool::new(false),
            restart_point: AtomicF64::new(0.0),
            adjustments: Mutex::new(Adjustments::default()),
            amplitude_requested: AtomicBool::new(false),
            amplitudes: Mutex::new(AmplitudeState {
                current: ChannelAmplitudes::empty(),
                last_time: f64::NEG_INFINITY,
                fft: vec![0.0; AMPLITUDES_SIZE],
            }),
            on_completed: Mutex::new(Vec::new()),
        });

        let queue = ctx.decode_queue.clone();
        ctx.post("track_first_decode", move || {
            if loader.advance() {
                queue.enqueue(loader);
            }
        });

        Ok(track)
    }

    /// Get the track name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Length in milliseconds; grows while decoding
    pub fn length(&self) -> f64 {
        self.loader.length.load()
    }

    /// Playback position in milliseconds as of the last update
    pub fn current_time(&self) -> f64 {
        self.current_time.load()
    }

    /// Bitrate in kbps, once known
    pub fn bitrate(&self) -> Option<u32> {
        match self.loader.bitrate.load(Ordering::Relaxed) {
            0 => None,
            kbps => Some(kbps),
        }
    }

    /// True while loading or once loaded
    pub fn is_loaded(&self) -> bool {
        self.loader.loading.load(Ordering::Acquire) || self.is_fully_loaded()
    }

    /// True once decoding has finished successfully
    pub fn is_fully_loaded(&self) -> bool {
        self.loader.loaded.load(Ordering::Acquire)
    }

    /// True if decoding failed
    pub fn load_failed(&self) -> bool {
        self.loader.failed.load(Ordering::Acquire)
    }

    /// Number of decode steps performed so far
    pub fn decode_steps(&self) -> u64 {
        self.loader.steps.load(Ordering::Relaxed)
    }

    /// Whether playback is running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Whether playback reached the end
    pub fn has_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    /// Whether playback loops
    pub fn looping(&self) -> bool {
        self.looping.load(Ordering::Acquire)
    }

    /// Loop restart point in milliseconds
    pub fn restart_point(&self) -> f64 {
        self.restart_point.load()
    }

    /// Current adjustments
    pub fn adjustments(&self) -> Adjustments {
        *self.adjustments.lock()
    }

    /// Native handle, `None` once disposed
    pub fn handle(&self) -> Option<TrackHandle> {
        self.loader.handle.load()
    }

    fn schedule<T, F>(&self, name: &'static str, fallback: T, f: F) -> Pending<T>
    where
        T: Send + 'static,
        F: FnOnce(&Track) -> T + Send + 'static,
    {
        match self.self_ref.upgrade() {
            Some(track) => self.ctx.schedule(name, move || f(&track)),
            None => Pending::ready(fallback),
        }
    }

    fn ensure_not_disposed(&self, operation: &'static str) -> AudioResult<()> {
        if self.is_disposed() {
            return Err(AudioError::Disposed {
                object: "track",
                operation,
            });
        }
        Ok(())
    }

    /// Start playback and wait for it to take effect
    pub fn start(&self) -> AudioResult<()> {
        Ok(self.start_async()?.wait()?)
    }

    /// Start playback on the owning thread
    pub fn start_async(&self) -> AudioResult<Pending<()>> {
        self.ensure_not_disposed("start")?;
        Ok(self.schedule("track_start", (), Track::start_internal))
    }

    /// Pause playback and wait for it to take effect
    pub fn stop(&self) -> AudioResult<()> {
        Ok(self.stop_async().wait()?)
    }

    /// Pause playback on the owning thread
    pub fn stop_async(&self) -> Pending<()> {
        self.schedule("track_stop", (), Track::stop_internal)
    }

    /// Seek to `position` milliseconds. Returns whether the backend landed
    /// exactly on the requested position.
    pub fn seek(&self, position: f64) -> AudioResult<bool> {
        Ok(self.seek_async(position).wait()?)
    }

    /// Seek on the owning thread
    pub fn seek_async(&self, position: f64) -> Pending<bool> {
        self.schedule("track_seek", false, move |track| {
            let reached = track.seek_internal(position);
            if !reached {
                log::warn!("Track failed seeking to {}", position);
            }
            reached
        })
    }

    /// Stop, seek to the restart point and start again
    pub fn restart(&self) -> AudioResult<()> {
        self.ensure_not_disposed("restart")?;
        self.stop()?;
        self.seek(self.restart_point())?;
        self.start()
    }

    /// Enable or disable looping
    pub fn set_looping(&self, looping: bool) {
        self.ctx_post_if_alive("track_set_looping", move |track| {
            if track.is_disposed() || track.looping() == looping {
                return;
            }
            if let Some(handle) = track.handle() {
                track.ctx.backend.track_set_loop(handle, looping);
            }
            track.looping.store(looping, Ordering::Release);
        });
    }

    /// Set the loop restart point in milliseconds
    pub fn set_restart_point(&self, position: f64) {
        self.ctx_post_if_alive("track_set_restart_point", move |track| {
            if track.is_disposed() || track.restart_point() == position {
                return;
            }
            if let Some(handle) = track.handle() {
                track.ctx.backend.track_set_restart_point(handle, position);
            }
            track.restart_point.store(position);
        });
    }

    /// Set the volume (0.0 to 1.0)
    pub fn set_volume(&self, volume: f64) {
        self.adjustments.lock().volume = volume;
        self.invalidate_state();
    }

    /// Set the stereo balance (-1.0 to 1.0)
    pub fn set_balance(&self, balance: f64) {
        self.adjustments.lock().balance = balance;
        self.invalidate_state();
    }

    /// Set the frequency multiplier
    pub fn set_frequency(&self, frequency: f64) {
        self.adjustments.lock().frequency = frequency;
        self.invalidate_state();
    }

    /// Set the tempo multiplier
    pub fn set_tempo(&self, tempo: f64) -> AudioResult<()> {
        if tempo < TEMPO_MINIMUM_SUPPORTED {
            return Err(AudioError::UnsupportedTempo {
                object: "Track",
                minimum: TEMPO_MINIMUM_SUPPORTED,
                requested: tempo,
            });
        }
        self.adjustments.lock().tempo = tempo;
        self.invalidate_state();
        Ok(())
    }

    /// Register a callback fired on the owning thread when playback completes
    pub fn on_completed(&self, callback: impl FnMut() + Send + 'static) {
        self.on_completed.lock().push(Box::new(callback));
    }

    /// Peak levels and spectrum. The first call only enables the
    /// computation and returns silence.
    pub fn current_amplitudes(&self) -> ChannelAmplitudes {
        if !self.amplitude_requested.swap(true, Ordering::AcqRel) || !self.is_running() {
            return ChannelAmplitudes::empty();
        }
        self.amplitudes.lock().current.clone()
    }

    fn ctx_post_if_alive(&self, name: &'static str, f: impl FnOnce(&Track) + Send + 'static) {
        drop(self.schedule(name, (), f));
    }

    fn invalidate_state(&self) {
        self.ctx_post_if_alive("track_state_changed", Track::on_state_changed);
    }

    fn on_state_changed(&self) {
        if self.is_disposed() {
            return;
        }
        let Some(handle) = self.handle() else {
            return;
        };
        let adjustments = self.adjustments().clamped();
        let backend = &self.ctx.backend;
        backend.track_set_volume(handle, adjustments.volume, adjustments.balance);
        backend.track_set_freq_tempo(handle, adjustments.frequency, adjustments.tempo);
    }

    fn start_internal(&self) {
        if self.is_disposed() {
            return;
        }
        if self.load_failed() {
            log::debug!("Track failed to load, ignoring start");
            return;
        }
        let Some(handle) = self.handle() else {
            return;
        };
        self.on_state_changed();
        self.ctx.backend.track_play(handle);
        self.running.store(true, Ordering::Release);
        self.completed.store(false, Ordering::Release);
    }

    fn stop_internal(&self) {
        if self.is_disposed() {
            return;
        }
        if let Some(handle) = self.handle() {
            self.ctx.backend.track_pause(handle);
        }
        self.running.store(false, Ordering::Release);
    }

    fn seek_internal(&self, position: f64) -> bool {
        if self.is_disposed() {
            return false;
        }
        let Some(handle) = self.handle() else {
            return false;
        };
        let backend = &self.ctx.backend;

        let length = self.length();
        let mut target = position.max(0.0);
        if target >= length {
            target = length;
            if backend.track_is_loaded(handle) {
                self.completed.store(true, Ordering::Release);
            }
        } else {
            self.completed.store(false, Ordering::Release);
        }

        let reached = backend.track_set_position(handle, target);
        self.current_time.store(backend.track_position(handle));
        reached == position
    }

    /// Per-tick refresh on the owning thread
    pub(crate) fn update_state(&self) {
        if self.is_disposed() {
            return;
        }
        let Some(handle) = self.handle() else {
            return;
        };
        let backend = &self.ctx.backend;

        if backend.track_is_done(handle)
            && self
                .running
                .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            self.completed.store(true, Ordering::Release);
            self.fire_completed();
        }

        let now = backend.track_position(handle);
        self.current_time.store(now);
        backend.track_update(handle);

        if self.amplitude_requested.load(Ordering::Acquire) && self.is_running() {
            let mut guard = self.amplitudes.lock();
            let amplitudes = &mut *guard;
            if (now - amplitudes.last_time).abs() > self.ctx.config.amplitude_interval_ms {
                amplitudes.last_time = now;
                amplitudes.current = match backend.track_amplitudes(handle, &mut amplitudes.fft) {
                    Some([left, right]) => ChannelAmplitudes {
                        left,
                        right,
                        frequency_amplitudes: Arc::from(amplitudes.fft.as_slice()),
                    },
                    None => ChannelAmplitudes::empty(),
                };
            }
        }
    }

    fn fire_completed(&self) {
        let mut callbacks = std::mem::take(&mut *self.on_completed.lock());
        for callback in callbacks.iter_mut() {
            callback();
        }
        let mut registered = self.on_completed.lock();
        callbacks.append(&mut registered);
        *registered = callbacks;
    }

    /// Release the track. Idempotent and callable from any thread; native
    /// resources are released on the owning thread.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.running.store(false, Ordering::Release);

        let released = self.link.take().upgrade().and_then(|m| m.release(self.id));
        let loader = self.loader.clone();
        let name = self.name.clone();

        self.ctx.post("track_dispose", move || {
            if let Some((mixer, registration)) = released {
                registration.detach(loader.backend.as_ref(), mixer);
            }
            loader.teardown();
            log::debug!("Disposed track '{}'", name);
        });
    }
}

impl MixerChannel for Track {
    fn channel_id(&self) -> ChannelId {
        self.id
    }

    fn kind(&self) -> ChannelKind {
        ChannelKind::Track
    }

    fn registration(&self) -> Option<ChannelRegistration> {
        self.handle().map(ChannelRegistration::Track)
    }

    fn mixer_link(&self) -> &MixerLink {
        &self.link
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

impl Drop for Track {
    fn drop(&mut self) {
        self.dispose();
    }
}
