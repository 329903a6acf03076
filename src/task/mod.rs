//! The task protocol: state machines, suspension steps, and the capability
//! context handed to every task body.
//!
//! A task is an explicit state machine implementing [`Coroutine`]. Each call
//! to [`Coroutine::resume`] advances the body to its next suspension point
//! and returns a [`Step`]: either a final value, or a suspension built
//! through the [`Cx`] capability set (`fork`, `call`, `invoke`, `join`,
//! `switch_to`). The worker trampoline interprets the step, so between two
//! suspension points the body is effectively sequential and single-threaded.
//!
//! Forked children write their results into [`Eventually`] slots owned by
//! the parent's state; after a `join`, the parent takes the values out.

use std::any::Any;
use std::cell::UnsafeCell;
use std::ptr::NonNull;

use crate::runtime::scheduler::worker::{ContextId, Worker};
use crate::task::frame::{Frame, SuspendKind};

pub(crate) mod cell;
pub(crate) mod frame;

/// How a task was invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    /// Top-level task: heap-allocated frame, completion signalled through a
    /// semaphore.
    Root,
    /// Inline child: the parent is not stealable during the call.
    Call,
    /// Forked child: the parent's continuation is published to the deque
    /// and becomes stealable.
    Fork,
}

/// A write-once result slot for a child task.
///
/// The parent owns the slot inside its own state; the child writes it
/// exactly once at completion. Reading the value back is safe after the
/// suspension point that completes the child (`join` for forked children,
/// the next resume for called children).
pub struct Eventually<T> {
    value: UnsafeCell<Option<T>>,
}

impl<T> std::fmt::Debug for Eventually<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Eventually(..)")
    }
}

impl<T> Default for Eventually<T> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T> Eventually<T> {
    /// Creates an empty slot.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            value: UnsafeCell::new(None),
        }
    }

    /// Takes the value written by the child.
    ///
    /// # Panics
    ///
    /// Panics if the child has not written the slot, which means the slot
    /// was read before the suspension point that completes the child.
    pub fn take(&mut self) -> T {
        self.value
            .get_mut()
            .take()
            .expect("result slot read before the child task completed")
    }

    /// Writes the child's result.
    ///
    /// # Safety
    ///
    /// Only the completing child may call this, exactly once, while the
    /// parent is suspended or running strictly after the corresponding join
    /// edge.
    pub(crate) unsafe fn set(&self, value: T) {
        // SAFETY: single-writer contract above.
        unsafe {
            *self.value.get() = Some(value);
        }
    }
}

/// The outcome of driving a task body one step.
///
/// Constructed either by [`Step::done`] or by the suspension constructors
/// on [`Cx`].
#[must_use = "a Step must be returned from resume for the runtime to act on it"]
pub struct Step<T>(pub(crate) StepInner<T>);

pub(crate) enum StepInner<T> {
    Done(T),
    Suspend(SuspendKind),
}

impl<T> Step<T> {
    /// Completes the task with `value`.
    pub fn done(value: T) -> Self {
        Self(StepInner::Done(value))
    }
}

/// An asynchronous function body, expressed as an explicit state machine.
///
/// `resume` is called by the runtime to advance the body from one
/// suspension point to the next. The state machine must record its own
/// position; the runtime only re-enters `resume` when the previous
/// suspension has completed (the forked/called child was created and
/// scheduled, the join barrier passed, or the context switch landed).
pub trait Coroutine: Send + 'static {
    /// The value this task produces.
    type Output: Send + 'static;

    /// Advances the body to its next suspension point.
    fn resume(&mut self, cx: &mut Cx<'_>) -> Step<Self::Output>;
}

/// The capability context handed to every task body.
///
/// This is the task's only handle on the scheduler: it identifies how the
/// task was invoked ([`Cx::tag`]), which worker is running it
/// ([`Cx::context`]), and builds the suspension steps.
pub struct Cx<'w> {
    pub(crate) worker: &'w Worker,
    pub(crate) frame: NonNull<Frame>,
}

impl Cx<'_> {
    /// How the current task was invoked.
    #[must_use]
    pub fn tag(&self) -> Tag {
        // SAFETY: the frame outlives the body it is running.
        unsafe { self.frame.as_ref() }.tag()
    }

    /// Handle of the worker currently running this task.
    #[must_use]
    pub fn context(&self) -> ContextId {
        ContextId(self.worker.index())
    }

    /// Handle of worker `index`, if the pool has one.
    #[must_use]
    pub fn context_of(&self, index: usize) -> Option<ContextId> {
        (index < self.num_workers()).then_some(ContextId(index))
    }

    /// Number of workers in the pool running this task.
    #[must_use]
    pub fn num_workers(&self) -> usize {
        self.worker.num_workers()
    }

    /// Forks `child`: the current task's continuation is published to the
    /// local deque (and may be stolen) while the current worker dives into
    /// the child. The child's result lands in `slot`, readable after the
    /// next `join`.
    ///
    /// On a single-worker pool the fork degrades to a call.
    pub fn fork<C: Coroutine, T>(&mut self, slot: &Eventually<C::Output>, child: C) -> Step<T> {
        let tag = if self.worker.fork_degrades_to_call() {
            Tag::Call
        } else {
            Tag::Fork
        };
        let frame = cell::alloc_on_stack(self.worker, child, NonNull::from(slot), self.frame, tag);
        Step(StepInner::Suspend(match tag {
            Tag::Call => SuspendKind::Call(frame),
            _ => SuspendKind::Fork(frame),
        }))
    }

    /// Calls `child` inline: control transfers directly into the child and
    /// the current task is not stealable while it runs. The child's result
    /// lands in `slot`, readable at the next resume.
    pub fn call<C: Coroutine, T>(&mut self, slot: &Eventually<C::Output>, child: C) -> Step<T> {
        let frame =
            cell::alloc_on_stack(self.worker, child, NonNull::from(slot), self.frame, Tag::Call);
        Step(StepInner::Suspend(SuspendKind::Call(frame)))
    }

    /// Invokes `child` as a nested task and waits for it synchronously:
    /// when the current task is next resumed, the child has completed and
    /// its value is in `slot`.
    pub fn invoke<C: Coroutine, T>(&mut self, slot: &Eventually<C::Output>, child: C) -> Step<T> {
        self.call(slot, child)
    }

    /// Waits for all outstanding forked children of the current task. After
    /// the join, every forked child's slot is written and all of their
    /// memory effects are visible.
    pub fn join<T>(&mut self) -> Step<T> {
        Step(StepInner::Suspend(SuspendKind::Join))
    }

    /// Moves the current continuation to `dest`'s inbox and suspends; the
    /// task resumes on that worker. A switch to the current worker is a
    /// no-op.
    ///
    /// Only root tasks may switch workers: a fork/call frame's storage and
    /// deque pairing are bound to the worker chain that created it.
    ///
    /// # Panics
    ///
    /// Panics (surfacing as a task failure) when a non-root task attempts
    /// a cross-worker switch.
    pub fn switch_to<T>(&mut self, dest: ContextId) -> Step<T> {
        assert!(
            dest.0 == self.worker.index() || matches!(self.tag(), Tag::Root),
            "context switch is only supported on root tasks"
        );
        Step(StepInner::Suspend(SuspendKind::Switch(dest.0)))
    }

    /// Captures `err` as the current task's failure without unwinding. The
    /// failure propagates exactly like an escaped panic: it is re-raised at
    /// the next join up the task tree.
    pub fn stash_exception<E: Any + Send>(&self, err: E) {
        // SAFETY: the frame outlives the body it is running.
        let _ = unsafe { self.frame.as_ref() }.exception().claim(Box::new(err));
    }
}
