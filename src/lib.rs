//! Tine: a continuation-stealing fork/join runtime for Rust.
//!
//! # Overview
//!
//! Tine lets recursive divide-and-conquer computations be expressed as
//! explicit state machines that fork child tasks, call child tasks inline,
//! and join them, while a pool of worker threads transparently parallelises
//! the forks by stealing suspended continuations.
//!
//! The runtime is continuation-stealing: `fork` publishes the *parent's*
//! continuation on the forking worker's deque and dives straight into the
//! child, so the child always runs immediately and an idle worker may pick
//! up the rest of the parent. Task frames live on per-worker segmented
//! *cactus stacks* whose segments migrate between workers as continuations
//! are stolen and joined.
//!
//! # Core guarantees
//!
//! - **Serial elision**: with one worker a computation runs exactly like the
//!   sequential program (forks degrade to calls).
//! - **Join visibility**: after a `join`, all memory effects of the joined
//!   children are visible to the parent.
//! - **Failure propagation**: a panic inside a task body is captured and
//!   re-raised at the nearest enclosing join; [`sync_wait`] re-raises it on
//!   the submitting thread, [`try_sync_wait`] returns it as a typed error.
//! - **Liveness**: any published continuation wakes a sleeping worker.
//!
//! # Module structure
//!
//! - [`task`]: the task protocol ([`Coroutine`], [`Step`], [`Cx`],
//!   [`Eventually`]) and the frame control blocks behind it
//! - [`runtime`]: cactus stacks, work-stealing deques, workers, and the
//!   three schedulers ([`UnitPool`], [`BusyPool`], [`LazyPool`])
//! - [`error`]: typed surfacing of captured task failures
//! - [`tracing_compat`]: structured logging facade (no-op unless the
//!   `tracing-integration` feature is enabled)
//!
//! # Example
//!
//! ```
//! use tine::{sync_wait, Coroutine, Cx, Eventually, Step, UnitPool};
//!
//! struct Fib {
//!     n: u64,
//!     a: Eventually<u64>,
//!     b: Eventually<u64>,
//!     stage: u8,
//! }
//!
//! impl Fib {
//!     fn new(n: u64) -> Self {
//!         Self { n, a: Eventually::empty(), b: Eventually::empty(), stage: 0 }
//!     }
//! }
//!
//! impl Coroutine for Fib {
//!     type Output = u64;
//!
//!     fn resume(&mut self, cx: &mut Cx<'_>) -> Step<u64> {
//!         match self.stage {
//!             0 => {
//!                 if self.n < 2 {
//!                     return Step::done(self.n);
//!                 }
//!                 self.stage = 1;
//!                 cx.fork(&self.a, Fib::new(self.n - 1))
//!             }
//!             1 => {
//!                 self.stage = 2;
//!                 cx.call(&self.b, Fib::new(self.n - 2))
//!             }
//!             2 => {
//!                 self.stage = 3;
//!                 cx.join()
//!             }
//!             _ => Step::done(self.a.take() + self.b.take()),
//!         }
//!     }
//! }
//!
//! let pool = UnitPool::new();
//! assert_eq!(sync_wait(&pool, Fib::new(10)), 55);
//! ```

#![warn(missing_docs)]
#![warn(unsafe_op_in_unsafe_fn)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::inline_always)]

pub mod error;
pub mod runtime;
pub mod task;
pub mod tracing_compat;

mod sync;
mod util;

pub use error::TaskFailed;
pub use runtime::{
    sync_wait, try_sync_wait, BusyPool, ContextId, LazyPool, PoolBuilder, RootTask, Scheduler,
    UnitPool,
};
pub use task::{Coroutine, Cx, Eventually, Step, Tag};
