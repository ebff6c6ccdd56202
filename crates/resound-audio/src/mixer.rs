//! Mixer
//!
//! Owns a native mixer, the set of channels routed through it and its effect
//! chain. A channel is in the active set exactly while its native handle is
//! registered with this mixer's native handle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use indexmap::IndexMap;
use parking_lot::{Mutex, MutexGuard};
use resound_core::{AtomicHandle, Pending};
use resound_platform::MixerHandle;

use crate::channel::{ChannelId, ChannelRegistration, MixerChannel};
use crate::context::AudioContext;
use crate::device::DeviceManager;
use crate::effect::{Effect, EffectChain};
use crate::{AudioError, AudioResult};

struct ActiveEntry {
    registration: ChannelRegistration,
    channel: Weak<dyn MixerChannel>,
}

/// A native mixer with its channels and effects
pub struct Mixer {
    identifier: String,
    ctx: AudioContext,
    self_ref: Weak<Mixer>,
    handle: AtomicHandle<MixerHandle>,
    fallback: Option<Weak<Mixer>>,
    device: Weak<DeviceManager>,
    active: Mutex<IndexMap<ChannelId, ActiveEntry>>,
    effects: Mutex<EffectChain>,
    disposed: AtomicBool,
}

impl Mixer {
    /// Create the native mixer and register it with the device manager.
    /// Must run on the owning thread.
    pub(crate) fn new(
        ctx: &AudioContext,
        identifier: impl Into<String>,
        fallback: Option<&Arc<Mixer>>,
        device: &Arc<DeviceManager>,
    ) -> AudioResult<Arc<Self>> {
        let identifier = identifier.into();
        let handle = ctx
            .backend
            .create_mixer()
            .ok_or(AudioError::NativeCall("create_mixer"))?;
        device.attach_mixer(handle);

        log::debug!("Created mixer '{}'", identifier);

        Ok(Arc::new_cyclic(|self_ref| Self {
            identifier,
            ctx: ctx.clone(),
            self_ref: self_ref.clone(),
            handle: AtomicHandle::new(Some(handle)),
            fallback: fallback.map(Arc::downgrade),
            device: Arc::downgrade(device),
            active: Mutex::new(IndexMap::new()),
            effects: Mutex::new(EffectChain::new()),
            disposed: AtomicBool::new(false),
        }))
    }

    /// Get the mixer identifier
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Native handle, `None` once disposed
    pub fn handle(&self) -> Option<MixerHandle> {
        self.handle.load()
    }

    /// Whether the mixer has been disposed
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Route a channel through this mixer, moving it from any other mixer
    pub fn add(&self, channel: Arc<dyn MixerChannel>) -> Pending<()> {
        match self.self_ref.upgrade() {
            Some(mixer) => self
                .ctx
                .schedule("mixer_add", move || mixer.add_internal(&channel)),
            None => Pending::ready(()),
        }
    }

    /// Take a channel out of this mixer. Channels removed from a mixer that
    /// has a fallback are handed to the fallback.
    pub fn remove(&self, channel: Arc<dyn MixerChannel>) -> Pending<()> {
        match self.self_ref.upgrade() {
            Some(mixer) => self
                .ctx
                .schedule("mixer_remove", move || mixer.remove_internal(&channel)),
            None => Pending::ready(()),
        }
    }

    /// Whether a channel is in the active set
    pub fn contains(&self, id: ChannelId) -> bool {
        self.active.lock().contains_key(&id)
    }

    /// Number of active channels
    pub fn active_channel_count(&self) -> usize {
        self.active.lock().len()
    }

    /// Ids of active channels in the order they were added
    pub fn active_channels(&self) -> Vec<ChannelId> {
        self.active.lock().keys().copied().collect()
    }

    /// Create an effect slot bound to this mixer
    pub fn get_new_effect(&self, priority: i32) -> Arc<Effect> {
        Effect::new(self.ctx.clone(), self.self_ref.clone(), priority)
    }

    /// Applied effects in processing order
    pub fn effects(&self) -> Vec<Arc<Effect>> {
        self.effects.lock().effects()
    }

    pub(crate) fn effect_chain(&self) -> MutexGuard<'_, EffectChain> {
        self.effects.lock()
    }

    pub(crate) fn add_internal(&self, channel: &Arc<dyn MixerChannel>) {
        if self.is_disposed() || channel.is_disposed() {
            return;
        }
        let Some(handle) = self.handle() else {
            return;
        };

        let id = channel.channel_id();
        if self.contains(id) {
            return;
        }
        let Some(registration) = channel.registration() else {
            log::debug!("Channel {} has no native handle; not adding to '{}'", id.get(), self.identifier);
            return;
        };

        if let Some(previous) = channel.mixer_link().get() {
            previous.detach(id);
        }

        registration.attach(self.ctx.backend.as_ref(), handle);
        self.active.lock().insert(
            id,
            ActiveEntry {
                registration,
                channel: Arc::downgrade(channel),
            },
        );
        channel.mixer_link().set(self.self_ref.clone());

        // Disposed concurrently after the first check; its release may have missed us.
        if channel.is_disposed() {
            self.detach(id);
            channel.mixer_link().clear_if(&self.self_ref);
        }
    }

    fn remove_internal(&self, channel: &Arc<dyn MixerChannel>) {
        if !self.detach(channel.channel_id()) {
            return;
        }
        channel.mixer_link().clear_if(&self.self_ref);

        if let Some(fallback) = self.fallback.as_ref().and_then(Weak::upgrade) {
            fallback.add_internal(channel);
        }
    }

    /// Drop a channel from the active set without touching the backend.
    /// Returns the handles needed to detach it natively.
    pub(crate) fn release(&self, id: ChannelId) -> Option<(MixerHandle, ChannelRegistration)> {
        let entry = self.active.lock().shift_remove(&id)?;
        self.handle().map(|handle| (handle, entry.registration))
    }

    /// Remove a channel from the active set and the native mixer
    pub(crate) fn detach(&self, id: ChannelId) -> bool {
        if !self.contains(id) {
            return false;
        }
        if let Some((handle, registration)) = self.release(id) {
            registration.detach(self.ctx.backend.as_ref(), handle);
        }
        true
    }

    /// Remove every channel and effect and destroy the native mixer
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        let handle = self.handle.take();
        let entries: Vec<ActiveEntry> = self.active.lock().drain(..).map(|(_, e)| e).collect();
        for entry in &entries {
            if let Some(channel) = entry.channel.upgrade() {
                channel.mixer_link().clear_if(&self.self_ref);
            }
        }
        let filters: Vec<_> = self
            .effects
            .lock()
            .drain()
            .iter()
            .filter_map(|effect| effect.take_filter())
            .collect();

        let Some(handle) = handle else {
            return;
        };
        let backend = self.ctx.backend.clone();
        let device = self.device.clone();
        let identifier = self.identifier.clone();

        self.ctx.post("mixer_dispose", move || {
            for entry in entries {
                entry.registration.detach(backend.as_ref(), handle);
            }
            for filter in filters {
                backend.remove_biquad_filter(handle, filter);
            }
            if let Some(device) = device.upgrade() {
                device.detach_mixer(handle);
            }
            backend.destroy_mixer(handle);
            log::debug!("Disposed mixer '{}'", identifier);
        });
    }
}

impl Drop for Mixer {
    fn drop(&mut self) {
        self.dispose();
    }
}
