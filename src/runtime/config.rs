//! Pool configuration.

use std::num::NonZeroUsize;
use std::thread;

use crate::runtime::{BusyPool, LazyPool, UnitPool};

/// Steal-retry rounds a worker attempts before going idle.
pub(crate) const DEFAULT_STEAL_RETRIES: usize = 8;

/// Hardware concurrency, with a fallback of one.
pub(crate) fn default_threads() -> usize {
    thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1)
}

/// Builder for the provided schedulers.
///
/// ```
/// use tine::{sync_wait, PoolBuilder};
/// # use tine::{Coroutine, Cx, Step};
/// # struct Noop;
/// # impl Coroutine for Noop {
/// #     type Output = u32;
/// #     fn resume(&mut self, _cx: &mut Cx<'_>) -> Step<u32> { Step::done(7) }
/// # }
///
/// let pool = PoolBuilder::new().threads(2).build_lazy();
/// assert_eq!(sync_wait(&pool, Noop), 7);
/// ```
#[derive(Debug, Clone)]
pub struct PoolBuilder {
    threads: Option<usize>,
    steal_retries: usize,
}

impl PoolBuilder {
    /// Starts a builder with hardware-concurrency threads and the default
    /// steal-retry budget.
    #[must_use]
    pub fn new() -> Self {
        Self {
            threads: None,
            steal_retries: DEFAULT_STEAL_RETRIES,
        }
    }

    /// Sets the worker-thread count. Clamped to `1..=64`.
    #[must_use]
    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = Some(threads);
        self
    }

    /// Sets how many victim-scan rounds a worker retries before idling.
    #[must_use]
    pub fn steal_retries(mut self, retries: usize) -> Self {
        self.steal_retries = retries;
        self
    }

    fn resolved_threads(&self) -> usize {
        self.threads.unwrap_or_else(default_threads)
    }

    /// Builds a [`LazyPool`]: work stealing with sleeping idle workers.
    #[must_use]
    pub fn build_lazy(self) -> LazyPool {
        LazyPool::with_config(self.resolved_threads(), self.steal_retries)
    }

    /// Builds a [`BusyPool`]: work stealing with spinning idle workers.
    #[must_use]
    pub fn build_busy(self) -> BusyPool {
        BusyPool::with_config(self.resolved_threads(), self.steal_retries)
    }

    /// Builds a [`UnitPool`]: one worker, forks degrade to calls.
    #[must_use]
    pub fn build_unit(self) -> UnitPool {
        UnitPool::with_config(self.steal_retries)
    }
}

impl Default for PoolBuilder {
    fn default() -> Self {
        Self::new()
    }
}
