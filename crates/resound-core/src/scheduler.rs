//! Scheduler
//!
//! FIFO task queue owned by a single thread. Work enqueued from the owning
//! thread runs inline; work enqueued from anywhere else is queued and drained
//! by the owner through [`Scheduler::run_pending`]. Every enqueue returns a
//! [`Pending`] that can be waited on synchronously or awaited.

use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::thread::{self, ThreadId};

use crossbeam::channel::{Receiver, Sender, unbounded};
use parking_lot::RwLock;
use tokio::sync::oneshot;

use crate::{CoreError, CoreResult, panic_message};

type Task = Box<dyn FnOnce() + Send + 'static>;

struct ScheduledTask {
    name: &'static str,
    run: Task,
}

struct SchedulerShared {
    sender: Sender<ScheduledTask>,
    receiver: Receiver<ScheduledTask>,
    owner: RwLock<Option<ThreadId>>,
    executed: AtomicU64,
}

/// Thread-owned task scheduler.
///
/// Cloning is cheap and every clone feeds the same queue.
#[derive(Clone)]
pub struct Scheduler {
    shared: Arc<SchedulerShared>,
}

impl Scheduler {
    /// Create a scheduler with no owning thread yet
    pub fn new() -> Self {
        let (sender, receiver) = unbounded();
        Self {
            shared: Arc::new(SchedulerShared {
                sender,
                receiver,
                owner: RwLock::new(None),
                executed: AtomicU64::new(0),
            }),
        }
    }

    /// Make the calling thread the owner of this scheduler
    pub fn bind_to_current_thread(&self) {
        let id = thread::current().id();
        *self.shared.owner.write() = Some(id);
        tracing::debug!(thread = ?id, "scheduler bound");
    }

    /// Get the owning thread, if one has been bound
    pub fn owner(&self) -> Option<ThreadId> {
        *self.shared.owner.read()
    }

    /// Check whether the caller is the owning thread
    pub fn is_owning_thread(&self) -> bool {
        self.owner() == Some(thread::current().id())
    }

    /// Run `f` on the owning thread
    pub fn enqueue<F, T>(&self, f: F) -> Pending<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.enqueue_named("task", f)
    }

    /// Run `f` on the owning thread, tagging it with a name for diagnostics.
    ///
    /// Runs inline when called from the owning thread, so the returned
    /// [`Pending`] is already complete in that case.
    pub fn enqueue_named<F, T>(&self, name: &'static str, f: F) -> Pending<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();

        let task = move || {
            let result = panic::catch_unwind(AssertUnwindSafe(f)).map_err(|payload| {
                log::error!(
                    "Scheduled task '{}' panicked: {}",
                    name,
                    panic_message(payload.as_ref())
                );
                CoreError::TaskPanicked(name.to_string())
            });
            let _ = tx.send(result);
        };

        if self.is_owning_thread() {
            task();
            self.shared.executed.fetch_add(1, Ordering::Relaxed);
        } else if let Err(rejected) = self.shared.sender.send(ScheduledTask {
            name,
            run: Box::new(task),
        }) {
            log::warn!("Scheduler closed, dropping task '{}'", rejected.0.name);
        }

        Pending { receiver: rx }
    }

    /// Drain the tasks queued so far. Returns how many ran.
    ///
    /// Tasks queued while draining wait for the next call.
    pub fn run_pending(&self) -> usize {
        if self
            .owner()
            .is_some_and(|owner| owner != thread::current().id())
        {
            log::warn!("run_pending called off the owning thread; ignoring");
            return 0;
        }

        let budget = self.shared.receiver.len();
        let mut executed = 0;

        for _ in 0..budget {
            let Ok(task) = self.shared.receiver.try_recv() else {
                break;
            };
            let _span = tracing::trace_span!("scheduled_task", name = task.name).entered();
            (task.run)();
            executed += 1;
        }

        self.shared
            .executed
            .fetch_add(executed as u64, Ordering::Relaxed);
        executed
    }

    /// Number of queued tasks waiting for the owner
    pub fn pending_tasks(&self) -> usize {
        self.shared.receiver.len()
    }

    /// Total number of tasks executed so far
    pub fn executed_tasks(&self) -> u64 {
        self.shared.executed.load(Ordering::Relaxed)
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// Completion of a task handed to a [`Scheduler`].
///
/// Resolves to `Err(CoreError::TaskCancelled)` if the scheduler is dropped
/// before the task runs and to `Err(CoreError::TaskPanicked)` if it panics.
pub struct Pending<T> {
    receiver: oneshot::Receiver<CoreResult<T>>,
}

impl<T> Pending<T> {
    /// A pending that is already complete
    pub fn ready(value: T) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(Ok(value));
        Self { receiver: rx }
    }

    /// Block until the task has run.
    ///
    /// Calling it on the owning thread never blocks, since owner-side work
    /// runs inline. Inside an async runtime an unfinished task yields
    /// `Err(CoreError::BlockingInRuntime)`; await the pending there instead.
    pub fn wait(mut self) -> CoreResult<T> {
        if let Some(result) = self.try_take() {
            return result;
        }
        if tokio::runtime::Handle::try_current().is_ok() {
            return Err(CoreError::BlockingInRuntime);
        }
        self.receiver
            .blocking_recv()
            .unwrap_or(Err(CoreError::TaskCancelled))
    }

    /// Take the result if the task has finished
    pub fn try_take(&mut self) -> Option<CoreResult<T>> {
        match self.receiver.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(CoreError::TaskCancelled)),
        }
    }
}

impl<T> Future for Pending<T> {
    type Output = CoreResult<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().receiver)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(CoreError::TaskCancelled)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};

    #[test]
    fn test_inline_on_owning_thread() {
        let scheduler = Scheduler::new();
        scheduler.bind_to_current_thread();
        assert!(scheduler.is_owning_thread());

        let mut pending = scheduler.enqueue(|| 21 * 2);
        assert_eq!(pending.try_take(), Some(Ok(42)));
        assert_eq!(scheduler.pending_tasks(), 0);
        assert_eq!(scheduler.executed_tasks(), 1);
    }

    #[test]
    fn test_queued_from_other_thread() {
        let scheduler = Scheduler::new();
        scheduler.bind_to_current_thread();

        let remote = scheduler.clone();
        let caller = thread::spawn(move || {
            let owner_ran = remote.enqueue(|| thread::current().id());
            owner_ran.wait()
        });

        let deadline = Instant::now() + Duration::from_secs(5);
        while !caller.is_finished() && Instant::now() < deadline {
            scheduler.run_pending();
            thread::sleep(Duration::from_millis(1));
        }

        let ran_on = caller.join().unwrap().unwrap();
        assert_eq!(ran_on, thread::current().id());
    }

    #[test]
    fn test_fifo_order() {
        let scheduler = Scheduler::new();
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

        for i in 0..5 {
            let order = order.clone();
            drop(scheduler.enqueue(move || order.lock().push(i)));
        }

        assert_eq!(scheduler.pending_tasks(), 5);
        assert_eq!(scheduler.run_pending(), 5);
        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_panicking_task_does_not_stop_the_queue() {
        let scheduler = Scheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let failed = scheduler.enqueue_named("explode", || -> u32 { panic!("boom") });
        let c = counter.clone();
        let succeeded = scheduler.enqueue(move || c.fetch_add(1, Ordering::Relaxed));

        assert_eq!(scheduler.run_pending(), 2);
        assert_eq!(
            failed.wait(),
            Err(CoreError::TaskPanicked("explode".to_string()))
        );
        assert_eq!(succeeded.wait(), Ok(0));
        assert_eq!(counter.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_dropped_scheduler_cancels_tasks() {
        let scheduler = Scheduler::new();
        let pending = scheduler.enqueue(|| 1);
        drop(scheduler);
        assert_eq!(pending.wait(), Err(CoreError::TaskCancelled));
    }

    #[test]
    fn test_run_pending_ignored_off_owner() {
        let scheduler = Scheduler::new();
        let remote = scheduler.clone();
        let enqueued = thread::spawn(move || {
            remote.bind_to_current_thread();
            drop(remote.enqueue(|| ()));
        });
        enqueued.join().unwrap();

        // The binding thread is gone; this thread is not the owner.
        drop(scheduler.enqueue(|| ()));
        assert_eq!(scheduler.run_pending(), 0);
        assert_eq!(scheduler.pending_tasks(), 1);
    }

    #[test]
    fn test_pending_is_awaitable() {
        let scheduler = Scheduler::new();
        let pending = scheduler.enqueue(|| "done");
        scheduler.run_pending();

        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        assert_eq!(runtime.block_on(pending), Ok("done"));
        assert_eq!(runtime.block_on(Pending::ready(5)), Ok(5));
    }

    #[test]
    fn test_wait_inside_runtime_does_not_block() {
        let scheduler = Scheduler::new();
        let queued = scheduler.enqueue(|| 7);
        let finished = Pending::ready(3);

        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        let (queued, finished) = runtime.block_on(async { (queued.wait(), finished.wait()) });

        assert_eq!(queued, Err(CoreError::BlockingInRuntime));
        assert_eq!(finished, Ok(3));
    }
}
