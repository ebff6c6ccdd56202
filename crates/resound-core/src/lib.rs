//! # Resound Core
//!
//! Core runtime library for the Resound audio engine.
//!
//! This crate provides the threading foundation the rest of the engine builds on:
//! - **Scheduler**: Thread-owned task queue with inline execution on the owning thread
//! - **Decode Queue**: Single background worker that advances incremental decode jobs
//! - **Sync**: Lock-free cells for native handles and floating point state
//! - **Thread**: Named thread wrapper used by the decode worker and the audio thread

pub mod decode;
pub mod scheduler;
pub mod sync;
pub mod thread;

pub use decode::{DecodeJob, DecodeQueue, DecodeQueueStats};
pub use scheduler::{Pending, Scheduler};
pub use sync::{AtomicF64, AtomicHandle, RawHandle};
pub use thread::Thread;

use thiserror::Error;

/// Core runtime errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("Task was dropped before it could run")]
    TaskCancelled,

    #[error("Task '{0}' panicked")]
    TaskPanicked(String),

    #[error("Failed to spawn thread '{name}': {reason}")]
    ThreadSpawn { name: String, reason: String },

    #[error("Blocking wait inside an async runtime; await the task instead")]
    BlockingInRuntime,

    #[error("Decode queue is shut down")]
    QueueShutDown,
}

/// Result type for core operations
pub type CoreResult<T> = Result<T, CoreError>;

/// Extract a readable message from a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic payload"
    }
}
