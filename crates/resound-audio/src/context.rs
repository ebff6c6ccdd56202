//! Shared engine context handed to every component.

use std::sync::Arc;

use resound_core::{DecodeQueue, Pending, Scheduler};
use resound_platform::AudioBackend;

use crate::config::AudioConfig;

/// Backend, owning-thread scheduler, decode queue and configuration
#[derive(Clone)]
pub struct AudioContext {
    pub(crate) backend: Arc<dyn AudioBackend>,
    pub(crate) scheduler: Scheduler,
    pub(crate) decode_queue: Arc<DecodeQueue>,
    pub(crate) config: Arc<AudioConfig>,
}

impl AudioContext {
    /// Create a context. The scheduler is not bound to any thread yet.
    pub fn new(backend: Arc<dyn AudioBackend>, config: AudioConfig) -> Self {
        Self {
            backend,
            scheduler: Scheduler::new(),
            decode_queue: Arc::new(DecodeQueue::new()),
            config: Arc::new(config),
        }
    }

    /// Get the native backend
    pub fn backend(&self) -> &Arc<dyn AudioBackend> {
        &self.backend
    }

    /// Get the owning-thread scheduler
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Get the decode queue
    pub fn decode_queue(&self) -> &Arc<DecodeQueue> {
        &self.decode_queue
    }

    /// Get the configuration
    pub fn config(&self) -> &AudioConfig {
        &self.config
    }

    /// Run `f` on the owning thread
    pub(crate) fn schedule<F, T>(&self, name: &'static str, f: F) -> Pending<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.scheduler.enqueue_named(name, f)
    }

    /// Run `f` on the owning thread without waiting for it
    pub(crate) fn post<F>(&self, name: &'static str, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        drop(self.scheduler.enqueue_named(name, f));
    }
}
