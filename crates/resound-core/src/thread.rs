//! Threading Primitives
//!
//! Named thread wrapper shared by the decode worker and the audio thread.

use std::thread::{self, JoinHandle, ThreadId};

use crate::{CoreError, CoreResult};

/// Named thread that can be joined explicitly
pub struct Thread {
    handle: Option<JoinHandle<()>>,
    name: String,
}

impl Thread {
    /// Spawn a new thread with the given name and function
    pub fn spawn<F>(name: impl Into<String>, f: F) -> CoreResult<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let name = name.into();

        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(f)
            .map_err(|e| CoreError::ThreadSpawn {
                name: name.clone(),
                reason: e.to_string(),
            })?;

        log::debug!("Spawned thread '{}'", name);

        Ok(Self {
            handle: Some(handle),
            name,
        })
    }

    /// Get the thread name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the id of the spawned thread
    pub fn id(&self) -> Option<ThreadId> {
        self.handle.as_ref().map(|h| h.thread().id())
    }

    /// Join the thread, waiting for it to complete
    pub fn join(mut self) -> thread::Result<()> {
        match self.handle.take() {
            Some(handle) => handle.join(),
            None => Ok(()),
        }
    }

    /// Check if the thread has finished
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(|h| h.is_finished())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_thread_spawn() {
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();

        let thread = Thread::spawn("test-thread", move || {
            counter_clone.fetch_add(1, Ordering::Relaxed);
        })
        .unwrap();

        assert_eq!(thread.name(), "test-thread");
        assert!(thread.id().is_some());
        thread.join().unwrap();
        assert_eq!(counter.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_thread_uses_given_name() {
        let (tx, rx) = crossbeam::channel::bounded(1);
        let thread = Thread::spawn("named-worker", move || {
            let _ = tx.send(thread::current().name().map(str::to_owned));
        })
        .unwrap();

        assert_eq!(rx.recv().unwrap().as_deref(), Some("named-worker"));
        thread.join().unwrap();
    }
}
