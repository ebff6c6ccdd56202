//! Decode Queue
//!
//! A single background worker that advances incremental decode jobs.
//! Features:
//! - Worker thread started lazily on the first enqueue
//! - Auto-reset wake signal so an idle worker sleeps instead of spinning
//! - One `advance` per job per pass, in insertion order
//! - Jobs are dropped the moment they report completion or panic

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use crossbeam::queue::SegQueue;
use parking_lot::{Condvar, Mutex};

use crate::thread::Thread;
use crate::{CoreError, CoreResult, panic_message};

/// An incremental unit of decode work.
///
/// `advance` performs one bounded step and returns `true` while more work
/// remains. Once it returns `false` the queue never calls it again.
pub trait DecodeJob: Send + Sync + 'static {
    /// Perform one step of work
    fn advance(&self) -> bool;

    /// Get the job name for debugging
    fn name(&self) -> &str {
        "unnamed_decode_job"
    }
}

/// Snapshot of queue counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecodeQueueStats {
    /// Jobs enqueued and not yet finished
    pub active_jobs: usize,
    /// Jobs that returned `false` or panicked
    pub finished_jobs: u64,
    /// Passes the worker has made over its working set
    pub passes: u64,
}

struct QueueShared {
    intake: SegQueue<Arc<dyn DecodeJob>>,
    /// Auto-reset event: set by enqueue, cleared by the worker when it wakes
    signal: Mutex<bool>,
    wake: Condvar,
    shutdown: AtomicBool,
    active_jobs: AtomicUsize,
    finished_jobs: AtomicU64,
    passes: AtomicU64,
}

impl QueueShared {
    fn notify(&self) {
        let mut signalled = self.signal.lock();
        *signalled = true;
        self.wake.notify_one();
    }

    fn wait_for_signal(&self) {
        let mut signalled = self.signal.lock();
        while !*signalled && !self.shutdown.load(Ordering::Acquire) {
            self.wake.wait(&mut signalled);
        }
        *signalled = false;
    }

    fn finish_job(&self) {
        self.active_jobs.fetch_sub(1, Ordering::AcqRel);
        self.finished_jobs.fetch_add(1, Ordering::Relaxed);
    }
}

/// Background decode queue with one worker thread
pub struct DecodeQueue {
    shared: Arc<QueueShared>,
    worker: Mutex<Option<Thread>>,
    started: AtomicBool,
    thread_name: String,
}

impl DecodeQueue {
    /// Create a queue; the worker thread starts on first use
    pub fn new() -> Self {
        Self::with_thread_name("decode-worker")
    }

    /// Create a queue whose worker thread carries the given name
    pub fn with_thread_name(name: impl Into<String>) -> Self {
        Self {
            shared: Arc::new(QueueShared {
                intake: SegQueue::new(),
                signal: Mutex::new(false),
                wake: Condvar::new(),
                shutdown: AtomicBool::new(false),
                active_jobs: AtomicUsize::new(0),
                finished_jobs: AtomicU64::new(0),
                passes: AtomicU64::new(0),
            }),
            worker: Mutex::new(None),
            started: AtomicBool::new(false),
            thread_name: name.into(),
        }
    }

    /// Hand a job to the worker. Safe to call from any thread.
    pub fn enqueue(&self, job: Arc<dyn DecodeJob>) {
        if self.shared.shutdown.load(Ordering::Acquire) {
            log::warn!("Decode queue shut down, dropping job '{}'", job.name());
            return;
        }

        if let Err(e) = self.ensure_started() {
            log::error!("Decode worker unavailable, dropping job '{}': {}", job.name(), e);
            return;
        }

        self.shared.active_jobs.fetch_add(1, Ordering::AcqRel);
        self.shared.intake.push(job);
        self.shared.notify();
    }

    fn ensure_started(&self) -> CoreResult<()> {
        if self.started.load(Ordering::Acquire) {
            return Ok(());
        }

        let mut worker = self.worker.lock();
        // shutdown sets the flag before taking this lock
        if self.shared.shutdown.load(Ordering::Acquire) {
            return Err(CoreError::QueueShutDown);
        }
        if worker.is_none() {
            let shared = self.shared.clone();
            *worker = Some(Thread::spawn(self.thread_name.clone(), move || {
                run_worker(&shared)
            })?);
            self.started.store(true, Ordering::Release);
            log::debug!("Decode worker '{}' started", self.thread_name);
        }
        Ok(())
    }

    /// Check whether the worker thread has been started
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Number of jobs enqueued and not yet finished
    pub fn active_jobs(&self) -> usize {
        self.shared.active_jobs.load(Ordering::Acquire)
    }

    /// Get a snapshot of the queue counters
    pub fn stats(&self) -> DecodeQueueStats {
        DecodeQueueStats {
            active_jobs: self.active_jobs(),
            finished_jobs: self.shared.finished_jobs.load(Ordering::Relaxed),
            passes: self.shared.passes.load(Ordering::Relaxed),
        }
    }

    /// Stop the worker and join it. Unfinished jobs are dropped.
    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.notify();

        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if worker.join().is_err() {
                log::error!("Decode worker '{}' terminated abnormally", self.thread_name);
            }
        }
    }
}

impl Default for DecodeQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for DecodeQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker(shared: &QueueShared) {
    let mut working: VecDeque<Arc<dyn DecodeJob>> = VecDeque::new();

    while !shared.shutdown.load(Ordering::Acquire) {
        while let Some(job) = shared.intake.pop() {
            working.push_back(job);
        }

        if working.is_empty() {
            shared.wait_for_signal();
            continue;
        }

        working.retain(|job| {
            if shared.shutdown.load(Ordering::Acquire) {
                return true;
            }
            let keep = advance_guarded(job.as_ref());
            if !keep {
                shared.finish_job();
            }
            keep
        });

        shared.passes.fetch_add(1, Ordering::Relaxed);
    }

    log::debug!("Decode worker exiting with {} unfinished job(s)", working.len());
}

fn advance_guarded(job: &dyn DecodeJob) -> bool {
    panic::catch_unwind(AssertUnwindSafe(|| job.advance())).unwrap_or_else(|payload| {
        log::error!(
            "Decode job '{}' panicked and was removed: {}",
            job.name(),
            panic_message(payload.as_ref())
        );
        false
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    struct CountdownJob {
        remaining: AtomicUsize,
        calls: AtomicUsize,
        calls_after_finish: AtomicUsize,
        finished: AtomicBool,
    }

    impl CountdownJob {
        fn new(steps: usize) -> Arc<Self> {
            Arc::new(Self {
                remaining: AtomicUsize::new(steps),
                calls: AtomicUsize::new(0),
                calls_after_finish: AtomicUsize::new(0),
                finished: AtomicBool::new(false),
            })
        }
    }

    impl DecodeJob for CountdownJob {
        fn advance(&self) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.finished.load(Ordering::SeqCst) {
                self.calls_after_finish.fetch_add(1, Ordering::SeqCst);
                return false;
            }
            let left = self.remaining.fetch_sub(1, Ordering::SeqCst) - 1;
            if left == 0 {
                self.finished.store(true, Ordering::SeqCst);
                false
            } else {
                true
            }
        }

        fn name(&self) -> &str {
            "countdown_job"
        }
    }

    struct PanickingJob;

    impl DecodeJob for PanickingJob {
        fn advance(&self) -> bool {
            panic!("corrupt stream");
        }
    }

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        condition()
    }

    #[test]
    fn test_lazy_start() {
        let queue = DecodeQueue::new();
        assert!(!queue.is_started());

        queue.enqueue(CountdownJob::new(1));
        assert!(queue.is_started());
    }

    #[test]
    fn test_jobs_run_to_completion() {
        let queue = DecodeQueue::new();
        let jobs: Vec<_> = (1..=4).map(|steps| CountdownJob::new(steps * 3)).collect();

        for job in &jobs {
            queue.enqueue(job.clone());
        }

        assert!(wait_until(|| queue.active_jobs() == 0));

        for (i, job) in jobs.iter().enumerate() {
            assert!(job.finished.load(Ordering::SeqCst));
            assert_eq!(job.calls.load(Ordering::SeqCst), (i + 1) * 3);
            assert_eq!(job.calls_after_finish.load(Ordering::SeqCst), 0);
        }
        assert_eq!(queue.stats().finished_jobs, 4);
    }

    #[test]
    fn test_panicking_job_is_removed() {
        let queue = DecodeQueue::new();
        let healthy = CountdownJob::new(5);

        queue.enqueue(Arc::new(PanickingJob));
        queue.enqueue(healthy.clone());

        assert!(wait_until(|| queue.active_jobs() == 0));
        assert!(healthy.finished.load(Ordering::SeqCst));
        assert_eq!(queue.stats().finished_jobs, 2);
    }

    #[test]
    fn test_enqueue_from_many_threads() {
        let queue = Arc::new(DecodeQueue::new());
        let jobs: Vec<_> = (0..16).map(|_| CountdownJob::new(4)).collect();

        let threads: Vec<_> = jobs
            .iter()
            .cloned()
            .map(|job| {
                let queue = queue.clone();
                std::thread::spawn(move || queue.enqueue(job))
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        assert!(wait_until(|| queue.active_jobs() == 0));
        assert!(jobs.iter().all(|job| job.finished.load(Ordering::SeqCst)));
    }

    #[test]
    fn test_shutdown_rejects_new_jobs() {
        let queue = DecodeQueue::new();
        queue.enqueue(CountdownJob::new(1));
        queue.shutdown();

        let late = CountdownJob::new(1);
        queue.enqueue(late.clone());
        assert_eq!(late.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_enqueue_racing_shutdown_leaves_no_worker() {
        for _ in 0..50 {
            let queue = Arc::new(DecodeQueue::new());
            let producers: Vec<_> = (0..4)
                .map(|_| {
                    let queue = queue.clone();
                    std::thread::spawn(move || queue.enqueue(CountdownJob::new(2)))
                })
                .collect();

            queue.shutdown();
            for producer in producers {
                producer.join().unwrap();
            }
            assert!(queue.worker.lock().is_none());
        }
    }

    #[test]
    fn test_idle_worker_sleeps() {
        let queue = DecodeQueue::new();
        queue.enqueue(CountdownJob::new(1));
        assert!(wait_until(|| queue.active_jobs() == 0));
        std::thread::sleep(Duration::from_millis(10));

        let passes = queue.stats().passes;
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(queue.stats().passes, passes);
    }

    /// Returns `true` for `steps` calls, then `false`; optionally panics on call `panic_on`
    struct ScriptedJob {
        steps: usize,
        panic_on: Option<usize>,
        calls: AtomicUsize,
        done: AtomicBool,
        calls_after_done: AtomicUsize,
    }

    impl ScriptedJob {
        fn expected_calls(&self) -> usize {
            let last = self.steps + 1;
            self.panic_on.map_or(last, |call| call.min(last))
        }
    }

    impl DecodeJob for ScriptedJob {
        fn advance(&self) -> bool {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.done.load(Ordering::SeqCst) {
                self.calls_after_done.fetch_add(1, Ordering::SeqCst);
                return false;
            }
            if self.panic_on == Some(call) {
                self.done.store(true, Ordering::SeqCst);
                panic!("scripted failure on call {}", call);
            }
            if call > self.steps {
                self.done.store(true, Ordering::SeqCst);
                return false;
            }
            true
        }
    }

    proptest::proptest! {
        #![proptest_config(proptest::prelude::ProptestConfig::with_cases(32))]

        #[test]
        fn test_every_job_advanced_until_done(
            scripts in proptest::collection::vec(
                (0usize..6, proptest::option::weighted(0.25, 1usize..8)),
                1..12,
            )
        ) {
            let queue = DecodeQueue::new();
            let jobs: Vec<_> = scripts
                .into_iter()
                .map(|(steps, panic_on)| {
                    Arc::new(ScriptedJob {
                        steps,
                        panic_on,
                        calls: AtomicUsize::new(0),
                        done: AtomicBool::new(false),
                        calls_after_done: AtomicUsize::new(0),
                    })
                })
                .collect();

            for job in &jobs {
                queue.enqueue(job.clone());
            }
            proptest::prop_assert!(wait_until(|| queue.active_jobs() == 0));
            queue.shutdown();

            for job in &jobs {
                proptest::prop_assert!(job.calls.load(Ordering::SeqCst) >= 1);
                proptest::prop_assert_eq!(job.calls.load(Ordering::SeqCst), job.expected_calls());
                proptest::prop_assert_eq!(job.calls_after_done.load(Ordering::SeqCst), 0);
            }
            proptest::prop_assert_eq!(queue.stats().finished_jobs, jobs.len() as u64);
        }
    }
}
