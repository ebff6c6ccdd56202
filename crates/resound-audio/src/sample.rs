//! One-shot Samples
//!
//! A [`SampleFactory`] decodes a short sound once on the decode worker and
//! spawns any number of [`SampleChannel`]s from it. Channels created before
//! the data is ready defer their native player until the next update after
//! loading completes; a play request made in the meantime is remembered and
//! issued exactly once.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use resound_core::{AtomicF64, AtomicHandle, DecodeJob};
use resound_platform::{
    AudioBackend, ByteStream, PcmBuffer, SampleFactoryHandle, SampleHandle, StreamCallbacks,
};

use crate::adjust::Adjustments;
use crate::channel::{ChannelId, ChannelKind, ChannelRegistration, MixerChannel, MixerLink};
use crate::config::SampleStrategy;
use crate::context::AudioContext;
use crate::mixer::Mixer;
use crate::{AudioError, AudioResult};

enum SampleData {
    Native(SampleFactoryHandle),
    Pcm(Arc<PcmBuffer>),
}

struct SampleLoaderState {
    source: Option<StreamCallbacks>,
    data: Option<SampleData>,
}

/// Decode job turning a stream into playable sample data
struct SampleLoader {
    name: String,
    backend: Arc<dyn AudioBackend>,
    strategy: SampleStrategy,
    state: Mutex<SampleLoaderState>,
    loaded: AtomicBool,
    failed: AtomicBool,
    length: AtomicF64,
}

impl SampleLoader {
    fn load(&self, source: StreamCallbacks) -> Option<SampleData> {
        match self.strategy {
            SampleStrategy::FactoryOwned => {
                let factory = self.backend.create_sample_factory()?;
                if !self.backend.run_sample_factory_decoder(factory, source) {
                    self.backend.destroy_sample_factory(factory);
                    return None;
                }
                self.length
                    .store(self.backend.sample_factory_length(factory));
                Some(SampleData::Native(factory))
            }
            SampleStrategy::PerChannelBuffer => {
                let pcm = self.backend.decode_to_pcm(source)?;
                self.length.store(pcm.duration_ms());
                Some(SampleData::Pcm(Arc::new(pcm)))
            }
        }
    }

    fn create_player(&self) -> Option<SampleHandle> {
        match self.state.lock().data.as_ref()? {
            SampleData::Native(factory) => self.backend.create_sample(*factory),
            SampleData::Pcm(pcm) => self.backend.create_sample_from_pcm(pcm.clone()),
        }
    }

    fn teardown(&self) {
        let mut state = self.state.lock();
        state.source = None;
        if let Some(SampleData::Native(factory)) = state.data.take() {
            self.backend.destroy_sample_factory(factory);
        }
    }
}

impl DecodeJob for SampleLoader {
    fn advance(&self) -> bool {
        let mut state = self.state.lock();
        let Some(source) = state.source.take() else {
            return false;
        };

        match self.load(source) {
            Some(data) => {
                state.data = Some(data);
                self.loaded.store(true, Ordering::Release);
                log::debug!("Sample '{}' decoded ({:.0} ms)", self.name, self.length.load());
            }
            None => {
                self.failed.store(true, Ordering::Release);
                log::error!("Failed to decode sample '{}'", self.name);
            }
        }
        false
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Decoded sample data shared by pooled channels
pub struct SampleFactory {
    name: String,
    ctx: AudioContext,
    self_ref: Weak<SampleFactory>,
    mixer: Weak<Mixer>,
    loader: Arc<SampleLoader>,
    concurrency: AtomicUsize,
    voices: Mutex<VecDeque<(ChannelId, Weak<SampleChannel>)>>,
    channels: Mutex<Vec<Weak<SampleChannel>>>,
    disposed: AtomicBool,
}

impl SampleFactory {
    /// Create a factory and queue its decode. Callable from any thread.
    pub(crate) fn new(
        ctx: &AudioContext,
        stream: Box<dyn ByteStream>,
        name: impl Into<String>,
        concurrency: usize,
        mixer: &Arc<Mixer>,
    ) -> Arc<Self> {
        let name = name.into();
        let loader = Arc::new(SampleLoader {
            name: name.clone(),
            backend: ctx.backend.clone(),
            strategy: ctx.config.sample_strategy,
            state: Mutex::new(SampleLoaderState {
                source: Some(StreamCallbacks::new(stream)),
                data: None,
            }),
            loaded: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            length: AtomicF64::new(0.0),
        });
        ctx.decode_queue.enqueue(loader.clone());

        Arc::new_cyclic(|self_ref| Self {
            name,
            ctx: ctx.clone(),
            self_ref: self_ref.clone(),
            mixer: Arc::downgrade(mixer),
            loader,
            concurrency: AtomicUsize::new(concurrency.max(1)),
            voices: Mutex::new(VecDeque::new()),
            channels: Mutex::new(Vec::new()),
            disposed: AtomicBool::new(false),
        })
    }

    /// Get the sample name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Length in milliseconds, zero until loaded
    pub fn length(&self) -> f64 {
        self.loader.length.load()
    }

    /// Whether the sample data is ready
    pub fn is_loaded(&self) -> bool {
        self.loader.loaded.load(Ordering::Acquire)
    }

    /// Whether decoding failed
    pub fn load_failed(&self) -> bool {
        self.loader.failed.load(Ordering::Acquire)
    }

    /// Maximum number of simultaneously playing channels
    pub fn concurrency(&self) -> usize {
        self.concurrency.load(Ordering::Relaxed)
    }

    /// Change the voice cap. Applies to subsequent plays.
    pub fn set_concurrency(&self, concurrency: usize) {
        self.concurrency.store(concurrency.max(1), Ordering::Relaxed);
    }

    /// Whether the factory has been disposed
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Mixer new channels are routed through
    pub fn mixer(&self) -> Option<Arc<Mixer>> {
        self.mixer.upgrade().filter(|m| !m.is_disposed())
    }

    /// Live channels spawned from this factory
    pub fn channel_count(&self) -> usize {
        self.channels
            .lock()
            .iter()
            .filter(|c| c.strong_count() > 0)
            .count()
    }

    /// Spawn a new channel. Its native player is created on the owning
    /// thread as soon as the sample data is available.
    pub fn create_channel(&self) -> AudioResult<Arc<SampleChannel>> {
        let factory = self
            .self_ref
            .upgrade()
            .filter(|f| !f.is_disposed())
            .ok_or(AudioError::Disposed {
                object: "sample factory",
                operation: "create a channel from",
            })?;

        let channel = SampleChannel::new(factory);
        {
            let mut channels = self.channels.lock();
            channels.retain(|c| c.strong_count() > 0);
            channels.push(Arc::downgrade(&channel));
        }

        if self.is_loaded() {
            let pending = channel.clone();
            self.ctx.post("sample_channel_init", move || {
                pending.ensure_player();
            });
        }

        Ok(channel)
    }

    fn create_player(&self) -> Option<SampleHandle> {
        self.loader.create_player()
    }

    /// Register a starting voice, pausing the oldest ones beyond the cap
    fn admit_voice(&self, channel: &Arc<SampleChannel>) {
        if !self.ctx.config.enforce_playback_concurrency {
            return;
        }
        let cap = self.concurrency();
        let id = channel.id;

        // Strong references are released only after the lock is dropped.
        let mut snapshot = Vec::new();
        let mut stolen = Vec::new();
        {
            let mut voices = self.voices.lock();
            snapshot.extend(voices.drain(..).filter_map(|(_, voice)| voice.upgrade()));
            for voice in &snapshot {
                if voice.id != id && voice.is_playing_natively() {
                    voices.push_back((voice.id, Arc::downgrade(voice)));
                }
            }
            while voices.len() >= cap {
                if let Some((_, oldest)) = voices.pop_front() {
                    stolen.extend(oldest.upgrade());
                }
            }
            voices.push_back((id, Arc::downgrade(channel)));
        }

        for oldest in stolen {
            log::trace!("Sample '{}' over concurrency {}; stopping oldest voice", self.name, cap);
            oldest.pause_native();
        }
    }

    fn forget_voice(&self, id: ChannelId) {
        self.voices
            .lock()
            .retain(|(voice, weak)| *voice != id && weak.strong_count() > 0);
    }

    /// Number of voices counted against the concurrency cap
    pub fn active_voices(&self) -> usize {
        self.voices
            .lock()
            .iter()
            .filter(|(_, weak)| weak.strong_count() > 0)
            .count()
    }

    /// Per-tick refresh of every live channel on the owning thread
    pub(crate) fn update_channels(&self) {
        let channels: Vec<Arc<SampleChannel>> = {
            let mut channels = self.channels.lock();
            channels.retain(|c| c.strong_count() > 0);
            channels.iter().filter_map(Weak::upgrade).collect()
        };
        for channel in channels {
            channel.update_state();
        }
    }

    /// Dispose every spawned channel, then release the sample data
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        let channels: Vec<Arc<SampleChannel>> = self
            .channels
            .lock()
            .drain(..)
            .filter_map(|c| c.upgrade())
            .collect();
        for channel in channels {
            channel.dispose();
        }
        self.voices.lock().clear();

        let loader = self.loader.clone();
        let name = self.name.clone();
        self.ctx.post("sample_factory_dispose", move || {
            loader.teardown();
            log::debug!("Disposed sample factory '{}'", name);
        });
    }
}

impl Drop for SampleFactory {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// A pooled playback instance of a [`SampleFactory`]
pub struct SampleChannel {
    id: ChannelId,
    ctx: AudioContext,
    self_ref: Weak<SampleChannel>,
    factory: Arc<SampleFactory>,
    handle: AtomicHandle<SampleHandle>,
    link: MixerLink,
    play_enqueued: AtomicBool,
    looping: AtomicBool,
    disposed: AtomicBool,
    adjustments: Mutex<Adjustments>,
}

impl SampleChannel {
    fn new(factory: Arc<SampleFactory>) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            id: ChannelId::next(),
            ctx: factory.ctx.clone(),
            self_ref: self_ref.clone(),
            factory,
            handle: AtomicHandle::empty(),
            link: MixerLink::default(),
            play_enqueued: AtomicBool::new(false),
            looping: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            adjustments: Mutex::new(Adjustments::default()),
        })
    }

    /// Get the factory this channel was spawned from
    pub fn factory(&self) -> &Arc<SampleFactory> {
        &self.factory
    }

    /// Native player handle, once created
    pub fn handle(&self) -> Option<SampleHandle> {
        self.handle.load()
    }

    /// Whether a play request is waiting for the player
    pub fn is_play_pending(&self) -> bool {
        self.play_enqueued.load(Ordering::Acquire)
    }

    /// Whether the channel is playing or about to
    pub fn is_playing(&self) -> bool {
        self.is_play_pending() || self.is_playing_natively()
    }

    fn is_playing_natively(&self) -> bool {
        !self.is_disposed()
            && self
                .handle
                .load()
                .is_some_and(|h| self.ctx.backend.sample_is_playing(h))
    }

    /// Whether playback loops
    pub fn looping(&self) -> bool {
        self.looping.load(Ordering::Acquire)
    }

    /// Current adjustments
    pub fn adjustments(&self) -> Adjustments {
        *self.adjustments.lock()
    }

    /// Start playback. Before the player exists the request is remembered
    /// and issued once the sample has loaded.
    pub fn play(&self) -> AudioResult<()> {
        if self.is_disposed() {
            return Err(AudioError::Disposed {
                object: "sample channel",
                operation: "play",
            });
        }

        if self.handle.is_empty() {
            self.play_enqueued.store(true, Ordering::Release);
            return Ok(());
        }

        self.post_self("sample_play", SampleChannel::play_internal);
        Ok(())
    }

    /// Stop playback and drop any pending play request
    pub fn stop(&self) {
        self.play_enqueued.store(false, Ordering::Release);
        self.post_self("sample_stop", |channel| {
            if !channel.is_disposed() {
                channel.pause_native();
            }
        });
    }

    /// Enable or disable looping
    pub fn set_looping(&self, looping: bool) {
        if self.looping.swap(looping, Ordering::AcqRel) == looping {
            return;
        }
        self.post_self("sample_set_looping", move |channel| {
            if channel.is_disposed() {
                return;
            }
            if let Some(handle) = channel.handle() {
                channel.ctx.backend.sample_set_loop(handle, looping);
            }
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

    fn post_self(&self, name: &'static str, f: impl FnOnce(&SampleChannel) + Send + 'static) {
        if let Some(channel) = self.self_ref.upgrade() {
            self.ctx.post(name, move || f(&channel));
        }
    }

    fn invalidate_state(&self) {
        self.post_self("sample_state_changed", |channel| {
            if channel.is_disposed() {
                return;
            }
            if let Some(handle) = channel.handle() {
                channel.push_adjustments(handle);
            }
        });
    }

    fn push_adjustments(&self, handle: SampleHandle) {
        let adjustments = self.adjustments().clamped();
        let backend = &self.ctx.backend;
        backend.sample_set_volume(handle, adjustments.volume, adjustments.balance);
        backend.sample_set_frequency(handle, adjustments.frequency);
    }

    fn pause_native(&self) {
        if let Some(handle) = self.handle.load() {
            self.ctx.backend.sample_pause(handle);
        }
    }

    /// Create the player and route it through the factory's mixer.
    /// Runs on the owning thread.
    fn ensure_player(&self) -> bool {
        if self.is_disposed() {
            return false;
        }
        if !self.handle.is_empty() {
            return true;
        }

        let Some(handle) = self.factory.create_player() else {
            log::error!("Failed to create player for sample '{}'", self.factory.name());
            return false;
        };
        let backend = &self.ctx.backend;
        backend.sample_set_loop(handle, self.looping());
        self.push_adjustments(handle);
        self.handle.install(handle);

        // Disposed while the player was being created
        if self.is_disposed() {
            if let Some(stale) = self.handle.take() {
                backend.destroy_sample(stale);
            }
            return false;
        }

        if let (Some(mixer), Some(channel)) = (self.factory.mixer(), self.self_ref.upgrade()) {
            let channel: Arc<dyn MixerChannel> = channel;
            mixer.add_internal(&channel);
        }
        true
    }

    fn play_internal(&self) {
        if self.is_disposed() {
            return;
        }
        let Some(handle) = self.handle.load() else {
            return;
        };
        self.push_adjustments(handle);
        if let Some(channel) = self.self_ref.upgrade() {
            self.factory.admit_voice(&channel);
        }
        self.ctx.backend.sample_play(handle);
    }

    /// Resolve a deferred play request on the owning thread
    pub(crate) fn update_state(&self) {
        if self.is_disposed() || !self.is_play_pending() {
            return;
        }

        if self.handle.is_empty() {
            if !self.factory.is_loaded() {
                return;
            }
            if !self.ensure_player() {
                self.play_enqueued.store(false, Ordering::Release);
                return;
            }
        }

        if self.play_enqueued.swap(false, Ordering::AcqRel) {
            self.play_internal();
        }
    }

    /// Release the channel. Idempotent and callable from any thread; the
    /// player is destroyed on the owning thread.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.play_enqueued.store(false, Ordering::Release);
        self.factory.forget_voice(self.id);

        let handle = self.handle.take();
        let released = self.link.take().upgrade().and_then(|m| m.release(self.id));
        let backend = self.ctx.backend.clone();

        self.ctx.post("sample_channel_dispose", move || {
            if let Some((mixer, registration)) = released {
                registration.detach(backend.as_ref(), mixer);
            }
            if let Some(handle) = handle {
                backend.sample_pause(handle);
                backend.destroy_sample(handle);
            }
        });
    }
}

impl MixerChannel for SampleChannel {
    fn channel_id(&self) -> ChannelId {
        self.id
    }

    fn kind(&self) -> ChannelKind {
        ChannelKind::Sample
    }

    fn registration(&self) -> Option<ChannelRegistration> {
        self.handle.load().map(ChannelRegistration::Sample)
    }

    fn mixer_link(&self) -> &MixerLink {
        &self.link
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

impl Drop for SampleChannel {
    fn drop(&mut self) {
        self.dispose();
    }
}
