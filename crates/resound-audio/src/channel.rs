//! Channel identity and mixer attachment.
//!
//! Mixers key their active set by [`ChannelId`], so two channels playing
//! identical audio stay distinct.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use resound_platform::{AudioBackend, MixerHandle, SampleHandle, TrackHandle};

use crate::mixer::Mixer;

/// Process-unique channel identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(u64);

impl ChannelId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw id value
    pub fn get(self) -> u64 {
        self.0
    }
}

/// Channel variant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    /// Streaming track
    Track,
    /// One-shot sample
    Sample,
}

/// Native handle a mixer registers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelRegistration {
    Track(TrackHandle),
    Sample(SampleHandle),
}

impl ChannelRegistration {
    /// Variant of the registered channel
    pub fn kind(&self) -> ChannelKind {
        match self {
            Self::Track(_) => ChannelKind::Track,
            Self::Sample(_) => ChannelKind::Sample,
        }
    }

    pub(crate) fn attach(&self, backend: &dyn AudioBackend, mixer: MixerHandle) {
        match *self {
            Self::Track(track) => backend.mixer_add_track(mixer, track),
            Self::Sample(sample) => backend.mixer_add_sample(mixer, sample),
        }
    }

    pub(crate) fn detach(&self, backend: &dyn AudioBackend, mixer: MixerHandle) {
        match *self {
            Self::Track(track) => backend.mixer_remove_track(mixer, track),
            Self::Sample(sample) => backend.mixer_remove_sample(mixer, sample),
        }
    }
}

/// A playable unit that can be routed through a [`Mixer`]
pub trait MixerChannel: Send + Sync {
    /// Identity used by mixers
    fn channel_id(&self) -> ChannelId;

    /// Channel variant
    fn kind(&self) -> ChannelKind;

    /// Native handle to register, or `None` while the channel has none
    fn registration(&self) -> Option<ChannelRegistration>;

    /// Back-reference to the mixer currently holding the channel
    fn mixer_link(&self) -> &MixerLink;

    /// Whether the channel has been disposed
    fn is_disposed(&self) -> bool;

    /// Mixer currently holding the channel
    fn mixer(&self) -> Option<Arc<Mixer>> {
        self.mixer_link().get()
    }
}

/// Weak back-reference from a channel to its mixer
#[derive(Default)]
pub struct MixerLink {
    mixer: Mutex<Weak<Mixer>>,
}

impl MixerLink {
    /// Mixer currently holding the channel, if it is still alive
    pub fn get(&self) -> Option<Arc<Mixer>> {
        self.mixer
            .lock()
            .upgrade()
            .filter(|mixer| !mixer.is_disposed())
    }

    pub(crate) fn set(&self, mixer: Weak<Mixer>) -> Weak<Mixer> {
        std::mem::replace(&mut *self.mixer.lock(), mixer)
    }

    pub(crate) fn take(&self) -> Weak<Mixer> {
        self.set(Weak::new())
    }

    pub(crate) fn clear_if(&self, mixer: &Weak<Mixer>) {
        let mut current = self.mixer.lock();
        if Weak::ptr_eq(&current, mixer) {
            *current = Weak::new();
        }
    }
}
