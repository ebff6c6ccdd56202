//! Audio Manager
//!
//! Entry point of the engine. Owns the device manager, the built-in mixers
//! and weak lists of every track and sample factory it created, and drives
//! them from [`AudioManager::update`] on the owning thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use ahash::AHashMap;
use parking_lot::{Mutex, RwLock};
use resound_core::{DecodeQueue, Pending, Scheduler};
use resound_platform::{AudioBackend, ByteStream, ResourceStore};

use crate::channel::MixerChannel;
use crate::config::AudioConfig;
use crate::context::AudioContext;
use crate::device::DeviceManager;
use crate::mixer::Mixer;
use crate::sample::SampleFactory;
use crate::track::Track;
use crate::{AudioError, AudioResult};

/// Identifier of the mixer every other built-in mixer falls back to
pub const GLOBAL_MIXER: &str = "global";
/// Identifier of the default mixer for tracks
pub const TRACK_MIXER: &str = "tracks";
/// Identifier of the default mixer for samples
pub const SAMPLE_MIXER: &str = "samples";

/// The audio engine
pub struct AudioManager {
    ctx: AudioContext,
    device: Arc<DeviceManager>,
    global_mixer: Arc<Mixer>,
    track_mixer: Arc<Mixer>,
    sample_mixer: Arc<Mixer>,
    mixers: Mutex<Vec<Weak<Mixer>>>,
    tracks: Mutex<Vec<Weak<Track>>>,
    factories: Mutex<Vec<Weak<SampleFactory>>>,
    track_store: RwLock<Option<Arc<dyn ResourceStore>>>,
    sample_store: RwLock<Option<Arc<dyn ResourceStore>>>,
    sample_cache: Mutex<AHashMap<String, Arc<SampleFactory>>>,
    disposed: AtomicBool,
}

impl AudioManager {
    /// Create the engine and bind the calling thread as its owning thread
    pub fn new(backend: Arc<dyn AudioBackend>, config: AudioConfig) -> AudioResult<Self> {
        let ctx = AudioContext::new(backend, config);
        ctx.scheduler.bind_to_current_thread();

        let device = DeviceManager::new(&ctx, ctx.config.device.clone())?;
        let global_mixer = Mixer::new(&ctx, GLOBAL_MIXER, None, &device)?;
        let track_mixer = Mixer::new(&ctx, TRACK_MIXER, Some(&global_mixer), &device)?;
        let sample_mixer = Mixer::new(&ctx, SAMPLE_MIXER, Some(&global_mixer), &device)?;

        log::info!(
            "Audio manager ready ({} Hz, sample strategy {:?})",
            ctx.backend.audio_spec().sample_rate,
            ctx.config.sample_strategy
        );

        Ok(Self {
            ctx,
            device,
            global_mixer,
            track_mixer,
            sample_mixer,
            mixers: Mutex::new(Vec::new()),
            tracks: Mutex::new(Vec::new()),
            factories: Mutex::new(Vec::new()),
            track_store: RwLock::new(None),
            sample_store: RwLock::new(None),
            sample_cache: Mutex::new(AHashMap::new()),
            disposed: AtomicBool::new(false),
        })
    }

    /// Use `store` for [`AudioManager::track_from_store`]
    pub fn with_track_store(self, store: Arc<dyn ResourceStore>) -> Self {
        self.set_track_store(store);
        self
    }

    /// Use `store` for [`AudioManager::sample_from_store`]
    pub fn with_sample_store(self, store: Arc<dyn ResourceStore>) -> Self {
        self.set_sample_store(store);
        self
    }

    /// Replace the track store
    pub fn set_track_store(&self, store: Arc<dyn ResourceStore>) {
        *self.track_store.write() = Some(store);
    }

    /// Replace the sample store and drop cached samples
    pub fn set_sample_store(&self, store: Arc<dyn ResourceStore>) {
        *self.sample_store.write() = Some(store);
        self.sample_cache.lock().clear();
    }

    /// Get the engine context
    pub fn context(&self) -> &AudioContext {
        &self.ctx
    }

    /// Get the native backend
    pub fn backend(&self) -> &Arc<dyn AudioBackend> {
        &self.ctx.backend
    }

    /// Get the owning-thread scheduler
    pub fn scheduler(&self) -> &Scheduler {
        &self.ctx.scheduler
    }

    /// Get the decode queue
    pub fn decode_queue(&self) -> &Arc<DecodeQueue> {
        &self.ctx.decode_queue
    }

    /// Get the configuration
    pub fn config(&self) -> &AudioConfig {
        &self.ctx.config
    }

    /// Get the device manager
    pub fn device_manager(&self) -> &Arc<DeviceManager> {
        &self.device
    }

    /// Mixer every built-in mixer falls back to
    pub fn global_mixer(&self) -> &Arc<Mixer> {
        &self.global_mixer
    }

    /// Default mixer for tracks
    pub fn track_mixer(&self) -> &Arc<Mixer> {
        &self.track_mixer
    }

    /// Default mixer for samples
    pub fn sample_mixer(&self) -> &Arc<Mixer> {
        &self.sample_mixer
    }

    /// Names of available output devices
    pub fn list_devices(&self) -> Vec<String> {
        self.device.list_devices()
    }

    /// Switch output device
    pub fn set_device(&self, name: Option<String>) -> Pending<bool> {
        self.device.set_device(name)
    }

    /// Whether an output device is open
    pub fn is_current_device_valid(&self) -> bool {
        self.device.is_current_device_valid()
    }

    /// Whether the manager has been disposed
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    fn ensure_not_disposed(&self, operation: &'static str) -> AudioResult<()> {
        if self.is_disposed() {
            return Err(AudioError::Disposed {
                object: "audio manager",
                operation,
            });
        }
        Ok(())
    }

    /// Run one engine tick on the owning thread: drain queued operations,
    /// then refresh every live track and sample channel.
    pub fn update(&self) {
        let _span = tracing::trace_span!("audio_update").entered();

        self.ctx.scheduler.run_pending();
        if self.is_disposed() || !self.ctx.scheduler.is_owning_thread() {
            return;
        }

        for track in live(&self.tracks) {
            track.update_state();
        }
        for factory in live(&self.factories) {
            factory.update_channels();
        }
    }

    /// Create a streaming track routed through the track mixer
    pub fn create_track(
        &self,
        stream: Box<dyn ByteStream>,
        name: impl Into<String>,
    ) -> AudioResult<Arc<Track>> {
        self.create_track_in(stream, name, &self.track_mixer)
    }

    /// Create a streaming track routed through `mixer`
    pub fn create_track_in(
        &self,
        stream: Box<dyn ByteStream>,
        name: impl Into<String>,
        mixer: &Arc<Mixer>,
    ) -> AudioResult<Arc<Track>> {
        self.ensure_not_disposed("create a track with")?;

        let ctx = self.ctx.clone();
        let name = name.into();
        let mixer = mixer.clone();
        let track = self
            .ctx
            .schedule("create_track", move || -> AudioResult<Arc<Track>> {
                let track = Track::new(&ctx, stream, name)?;
                let channel: Arc<dyn MixerChannel> = track.clone();
                mixer.add_internal(&channel);
                Ok(track)
            })
            .wait()??;

        self.tracks.lock().push(Arc::downgrade(&track));
        Ok(track)
    }

    /// Create a sample factory routed through the sample mixer
    pub fn create_sample_factory(
        &self,
        stream: Box<dyn ByteStream>,
        name: impl Into<String>,
        concurrency: usize,
    ) -> AudioResult<Arc<SampleFactory>> {
        self.create_sample_factory_in(stream, name, concurrency, &self.sample_mixer)
    }

    /// Create a sample factory whose channels are routed through `mixer`
    pub fn create_sample_factory_in(
        &self,
        stream: Box<dyn ByteStream>,
        name: impl Into<String>,
        concurrency: usize,
        mixer: &Arc<Mixer>,
    ) -> AudioResult<Arc<SampleFactory>> {
        self.ensure_not_disposed("create a sample with")?;

        let factory = SampleFactory::new(&self.ctx, stream, name, concurrency, mixer);
        let mut factories = self.factories.lock();
        factories.retain(|f| f.strong_count() > 0);
        factories.push(Arc::downgrade(&factory));
        Ok(factory)
    }

    /// Create an additional mixer that falls back to the global mixer
    pub fn create_mixer(&self, identifier: impl Into<String>) -> AudioResult<Arc<Mixer>> {
        self.ensure_not_disposed("create a mixer with")?;

        let ctx = self.ctx.clone();
        let identifier = identifier.into();
        let global = self.global_mixer.clone();
        let device = self.device.clone();
        let mixer = self
            .ctx
            .schedule("create_mixer", move || {
                Mixer::new(&ctx, identifier, Some(&global), &device)
            })
            .wait()??;

        let mut mixers = self.mixers.lock();
        mixers.retain(|m| m.strong_count() > 0);
        mixers.push(Arc::downgrade(&mixer));
        Ok(mixer)
    }

    /// Open a track by name from the track store
    pub fn track_from_store(&self, name: &str) -> AudioResult<Arc<Track>> {
        let store = self.track_store.read().clone();
        let stream = store
            .and_then(|store| store.get_stream(name))
            .ok_or_else(|| AudioError::ResourceNotFound(name.to_string()))?;
        self.create_track(stream, name)
    }

    /// Look up a sample by name from the sample store. Factories are cached
    /// per name.
    pub fn sample_from_store(&self, name: &str) -> AudioResult<Arc<SampleFactory>> {
        self.ensure_not_disposed("look up a sample with")?;

        if let Some(factory) = self.sample_cache.lock().get(name) {
            if !factory.is_disposed() {
                return Ok(factory.clone());
            }
        }

        let store = self.sample_store.read().clone();
        let stream = store
            .and_then(|store| store.get_stream(name))
            .ok_or_else(|| AudioError::ResourceNotFound(name.to_string()))?;
        let factory =
            self.create_sample_factory(stream, name, self.ctx.config.default_playback_concurrency)?;

        self.sample_cache
            .lock()
            .insert(name.to_string(), factory.clone());
        Ok(factory)
    }

    /// Live tracks created by this manager
    pub fn tracks(&self) -> Vec<Arc<Track>> {
        live(&self.tracks)
    }

    /// Live sample factories created by this manager
    pub fn sample_factories(&self) -> Vec<Arc<SampleFactory>> {
        live(&self.factories)
    }

    /// Dispose every component and stop the decode worker
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        log::info!("Disposing audio manager");

        for track in live(&self.tracks) {
            track.dispose();
        }
        self.sample_cache.lock().clear();
        for factory in live(&self.factories) {
            factory.dispose();
        }
        for mixer in live(&self.mixers) {
            mixer.dispose();
        }
        self.sample_mixer.dispose();
        self.track_mixer.dispose();
        self.global_mixer.dispose();
        self.device.dispose();

        if self.ctx.scheduler.is_owning_thread() {
            self.ctx.scheduler.run_pending();
        } else {
            log::warn!(
                "Audio manager disposed off its owning thread; {} teardown task(s) wait for the next update",
                self.ctx.scheduler.pending_tasks()
            );
        }
        self.ctx.decode_queue.shutdown();
    }
}

impl Drop for AudioManager {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Upgrade the live entries of a weak list, pruning dead ones
fn live<T>(list: &Mutex<Vec<Weak<T>>>) -> Vec<Arc<T>> {
    let mut list = list.lock();
    list.retain(|entry| entry.strong_count() > 0);
    list.iter().filter_map(Weak::upgrade).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use resound_platform::VirtualBackend;

    #[test]
    fn test_builtin_mixers() {
        let backend = Arc::new(VirtualBackend::new());
        let manager = AudioManager::new(backend.clone(), AudioConfig::default()).unwrap();

        assert_eq!(manager.global_mixer().identifier(), GLOBAL_MIXER);
        assert_eq!(manager.track_mixer().identifier(), TRACK_MIXER);
        assert_eq!(manager.sample_mixer().identifier(), SAMPLE_MIXER);
        assert_eq!(backend.live_mixers(), 3);

        let handle = manager.device_manager().handle().unwrap();
        assert_eq!(backend.manager_mixers(handle).len(), 3);
        assert!(manager.is_current_device_valid());
    }

    #[test]
    fn test_dispose_releases_everything() {
        let backend = Arc::new(VirtualBackend::new());
        let manager = AudioManager::new(backend.clone(), AudioConfig::default()).unwrap();
        let extra = manager.create_mixer("extra").unwrap();
        assert_eq!(backend.live_mixers(), 4);

        manager.dispose();
        manager.dispose();
        assert!(extra.is_disposed());
        assert!(!manager.is_current_device_valid());
        assert_eq!(backend.live_mixers(), 0);

        drop(extra);
        drop(manager);
        assert_eq!(backend.stats().invalid_handle_calls, 0);
    }

    #[test]
    fn test_missing_store_entry() {
        let backend = Arc::new(VirtualBackend::new());
        let manager = AudioManager::new(backend, AudioConfig::default()).unwrap();
        assert!(matches!(
            manager.track_from_store("nope"),
            Err(AudioError::ResourceNotFound(name)) if name == "nope"
        ));
        assert!(matches!(
            manager.sample_from_store("nope"),
            Err(AudioError::ResourceNotFound(_))
        ));
        assert!(manager.create_mixer("after").is_ok());
        manager.dispose();
        assert!(matches!(
            manager.create_mixer("late"),
            Err(AudioError::Disposed { .. })
        ));
    }
}
