//! Audio Thread
//!
//! Runs an [`AudioManager`] on a dedicated owning thread that ticks
//! [`AudioManager::update`] at the configured interval until stopped.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crossbeam::channel::bounded;
use resound_core::Thread;
use resound_platform::AudioBackend;

use crate::config::AudioConfig;
use crate::manager::AudioManager;
use crate::{AudioError, AudioResult};

/// Name of the dedicated audio thread
pub const AUDIO_THREAD_NAME: &str = "audio";

/// A manager driven by its own thread
pub struct AudioThread {
    manager: Arc<AudioManager>,
    exit: Arc<AtomicBool>,
    ticks: Arc<AtomicU64>,
    thread: Option<Thread>,
}

impl AudioThread {
    /// Spawn the audio thread and wait until its manager is ready
    pub fn spawn(backend: Arc<dyn AudioBackend>, config: AudioConfig) -> AudioResult<Self> {
        let interval = Duration::from_millis(config.update_interval_ms.max(1));
        let exit = Arc::new(AtomicBool::new(false));
        let ticks = Arc::new(AtomicU64::new(0));
        let (ready_tx, ready_rx) = bounded(1);

        let thread_exit = exit.clone();
        let thread_ticks = ticks.clone();
        let thread = Thread::spawn(AUDIO_THREAD_NAME, move || {
            let manager = match AudioManager::new(backend, config) {
                Ok(manager) => Arc::new(manager),
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            if ready_tx.send(Ok(manager.clone())).is_err() {
                manager.dispose();
                return;
            }

            while !thread_exit.load(Ordering::Acquire) {
                manager.update();
                thread_ticks.fetch_add(1, Ordering::Release);
                std::thread::sleep(interval);
            }

            manager.dispose();
            manager.update();
            log::debug!("Audio thread exiting after {} ticks", thread_ticks.load(Ordering::Acquire));
        })?;

        let manager = ready_rx.recv().map_err(|_| AudioError::ThreadExited)??;

        Ok(Self {
            manager,
            exit,
            ticks,
            thread: Some(thread),
        })
    }

    /// Get the manager owned by the thread
    pub fn manager(&self) -> &Arc<AudioManager> {
        &self.manager
    }

    /// Number of completed update ticks
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Acquire)
    }

    /// Block until at least one full tick has run after this call.
    /// Returns false on timeout or if the thread has stopped.
    pub fn wait_for_update(&self, timeout: Duration) -> bool {
        let target = self.ticks() + 2;
        let deadline = Instant::now() + timeout;
        while self.ticks() < target {
            if Instant::now() >= deadline || self.thread.as_ref().is_none_or(Thread::is_finished) {
                return false;
            }
            std::thread::sleep(Duration::from_micros(200));
        }
        true
    }

    /// Stop ticking, dispose the manager and join the thread
    pub fn stop(mut self) -> AudioResult<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> AudioResult<()> {
        self.exit.store(true, Ordering::Release);
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };
        thread.join().map_err(|_| AudioError::ThreadExited)
    }
}

impl Drop for AudioThread {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            log::error!("Audio thread did not shut down cleanly: {}", e);
        }
    }
}
