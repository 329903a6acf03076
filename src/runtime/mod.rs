//! Schedulers and the sync-wait surface.
//!
//! Three schedulers are provided, all speaking the same [`Scheduler`]
//! contract:
//!
//! - [`UnitPool`] — single worker; forks degrade to calls, so a submitted
//!   computation runs exactly like the sequential program.
//! - [`BusyPool`] — one worker per thread, idle workers spin-steal.
//! - [`LazyPool`] — one worker per thread, idle workers sleep and are woken
//!   one-per-publish.
//!
//! [`sync_wait`] is the external entry point: it submits a root task,
//! blocks the calling thread on the task's completion semaphore, and
//! returns the value or re-raises the task tree's failure.

use std::panic;
use std::ptr::NonNull;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::error::TaskFailed;
use crate::runtime::scheduler::deque::WorkDeque;
use crate::runtime::scheduler::sleep::MAX_WORKERS;
use crate::runtime::scheduler::worker::{self, PoolMode, PoolShared, Worker};
use crate::task::cell::{self, RootBlock};
use crate::task::frame::FramePtr;
use crate::task::Coroutine;
use crate::tracing_compat::debug;

mod config;
pub(crate) mod scheduler;
pub(crate) mod stack;

pub use config::PoolBuilder;
pub use scheduler::worker::ContextId;

use config::{default_threads, DEFAULT_STEAL_RETRIES};

/// An externally submitted root task, ready to be scheduled.
///
/// Created internally by [`sync_wait`]/[`try_sync_wait`]; a scheduler only
/// forwards it to one of its workers.
pub struct RootTask(pub(crate) FramePtr);

/// A scheduler accepts external root-task submissions and distributes them
/// to its workers.
pub trait Scheduler {
    /// Enqueues `task` for execution on some worker.
    fn submit(&self, task: RootTask);
}

/// Worker threads plus the shared scheduler state; the common core of the
/// three pools.
struct PoolCore {
    shared: Arc<PoolShared>,
    handles: Vec<JoinHandle<()>>,
}

impl PoolCore {
    fn start(mode: PoolMode, threads: usize, steal_retries: usize) -> Self {
        let threads = threads.clamp(1, MAX_WORKERS);

        // Every deque and stealer must exist before any worker runs, since
        // workers steal from each other.
        let mut deques = Vec::with_capacity(threads);
        let mut stealers = Vec::with_capacity(threads);
        for _ in 0..threads {
            let (deque, stealer) = WorkDeque::new();
            deques.push(deque);
            stealers.push(stealer);
        }

        let shared = Arc::new(PoolShared::new(mode, stealers, steal_retries));
        let mut handles = Vec::with_capacity(threads);
        for (index, deque) in deques.into_iter().enumerate() {
            let shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("tine-worker-{index}"))
                .spawn(move || {
                    let worker = Worker::new(index, deque, shared);
                    worker::run(&worker);
                })
                .expect("failed to spawn worker thread");
            handles.push(handle);
        }

        debug!(threads, ?mode, "pool started");
        Self { shared, handles }
    }
}

impl Drop for PoolCore {
    fn drop(&mut self) {
        // Cooperative shutdown: set the flag, pulse every wakeword, join.
        // Workers finish in-flight tasks before observing the flag.
        self.shared.begin_shutdown();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
        debug!("pool stopped");
    }
}

/// Single-threaded scheduler; forks degrade to calls.
pub struct UnitPool {
    core: PoolCore,
}

impl UnitPool {
    /// Starts the single worker.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(DEFAULT_STEAL_RETRIES)
    }

    pub(crate) fn with_config(steal_retries: usize) -> Self {
        Self {
            core: PoolCore::start(PoolMode::Unit, 1, steal_retries),
        }
    }
}

impl Default for UnitPool {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for UnitPool {
    fn submit(&self, task: RootTask) {
        self.core.shared.submit(task.0);
    }
}

/// Work-stealing scheduler whose idle workers spin.
///
/// Lowest wake-up latency at the cost of burning idle CPU; suited to
/// benchmarking and saturated pipelines.
pub struct BusyPool {
    core: PoolCore,
}

impl BusyPool {
    /// Starts one worker per hardware thread.
    #[must_use]
    pub fn new() -> Self {
        Self::with_threads(default_threads())
    }

    /// Starts `threads` workers (clamped to `1..=64`).
    #[must_use]
    pub fn with_threads(threads: usize) -> Self {
        Self::with_config(threads, DEFAULT_STEAL_RETRIES)
    }

    pub(crate) fn with_config(threads: usize, steal_retries: usize) -> Self {
        Self {
            core: PoolCore::start(PoolMode::Busy, threads, steal_retries),
        }
    }
}

impl Default for BusyPool {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for BusyPool {
    fn submit(&self, task: RootTask) {
        self.core.shared.submit(task.0);
    }
}

/// Work-stealing scheduler whose idle workers sleep.
///
/// Each publish wakes exactly one sleeper, so a mostly idle pool costs
/// nothing. The default choice.
pub struct LazyPool {
    core: PoolCore,
}

impl LazyPool {
    /// Starts one worker per hardware thread.
    #[must_use]
    pub fn new() -> Self {
        Self::with_threads(default_threads())
    }

    /// Starts `threads` workers (clamped to `1..=64`).
    #[must_use]
    pub fn with_threads(threads: usize) -> Self {
        Self::with_config(threads, DEFAULT_STEAL_RETRIES)
    }

    pub(crate) fn with_config(threads: usize, steal_retries: usize) -> Self {
        Self {
            core: PoolCore::start(PoolMode::Lazy, threads, steal_retries),
        }
    }
}

impl Default for LazyPool {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for LazyPool {
    fn submit(&self, task: RootTask) {
        self.core.shared.submit(task.0);
    }
}

/// Runs `task` on `scheduler` and blocks until it completes, returning its
/// value or re-raising its failure on the calling thread.
pub fn sync_wait<S, C>(scheduler: &S, task: C) -> C::Output
where
    S: Scheduler + ?Sized,
    C: Coroutine,
{
    match try_sync_wait(scheduler, task) {
        Ok(value) => value,
        Err(failed) => panic::resume_unwind(failed.into_payload()),
    }
}

/// Runs `task` on `scheduler` and blocks until it completes, returning its
/// value or the captured failure of its task tree.
pub fn try_sync_wait<S, C>(scheduler: &S, task: C) -> Result<C::Output, TaskFailed>
where
    S: Scheduler + ?Sized,
    C: Coroutine,
{
    let block = RootBlock::new();
    let frame = cell::alloc_root(task, NonNull::from(&block));
    scheduler.submit(RootTask(FramePtr(frame)));
    block.wait();
    block.into_outcome().map_err(TaskFailed::from_payload)
}
