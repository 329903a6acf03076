//! Worker threads and the trampoline that drives task state machines.
//!
//! Each worker owns a deque, a cactus-stack cache, and a submission inbox.
//! The scheduler loop looks for work in priority order — own inbox, own
//! deque, the global injector, then theft — and otherwise spins (busy
//! pools) or sleeps (lazy/unit pools).
//!
//! The trampoline interprets the suspension steps produced by task bodies.
//! Together with the frames' join counters it implements the join
//! protocol: exactly one worker resumes a joining parent, regardless of
//! which worker finishes the last child.

use std::alloc::Layout;
use std::cell::{Cell, RefCell};
use std::ptr::{self, NonNull};
use std::sync::atomic::{self, AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_queue::SegQueue;
use crossbeam_utils::Backoff;

use crate::runtime::scheduler::deque::{DequeStealer, WorkDeque};
use crate::runtime::scheduler::sleep::Sleepers;
use crate::runtime::scheduler::stealing;
use crate::runtime::stack::{StackCache, Stacklet};
use crate::task::frame::{Frame, FramePtr, Polled, SuspendKind, JOINS_RESET};
use crate::task::Tag;
use crate::tracing_compat::trace;
use crate::util::DetRng;

/// An opaque handle identifying one worker of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(pub(crate) usize);

impl ContextId {
    /// The worker's index within its pool, in `0..num_workers`.
    #[must_use]
    pub fn index(self) -> usize {
        self.0
    }
}

/// How a pool's workers behave when idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PoolMode {
    /// Single worker; forks degrade to calls.
    Unit,
    /// Spin-steal; workers never sleep.
    Busy,
    /// Steal with sleep.
    Lazy,
}

/// State shared by every worker of a pool and its submission surface.
pub(crate) struct PoolShared {
    mode: PoolMode,
    /// Per-worker submission inboxes (context switches, targeted handoffs).
    inboxes: Box<[SegQueue<FramePtr>]>,
    /// Global injection inbox for external submissions.
    injector: SegQueue<FramePtr>,
    stealers: Box<[DequeStealer]>,
    sleepers: Sleepers,
    shutdown: AtomicBool,
    steal_retries: usize,
}

impl PoolShared {
    pub(crate) fn new(mode: PoolMode, stealers: Vec<DequeStealer>, steal_retries: usize) -> Self {
        let workers = stealers.len();
        Self {
            mode,
            inboxes: (0..workers).map(|_| SegQueue::new()).collect(),
            injector: SegQueue::new(),
            stealers: stealers.into_boxed_slice(),
            sleepers: Sleepers::new(workers),
            shutdown: AtomicBool::new(false),
            steal_retries,
        }
    }

    pub(crate) fn num_workers(&self) -> usize {
        self.stealers.len()
    }

    /// Accepts an external root submission.
    pub(crate) fn submit(&self, frame: FramePtr) {
        self.injector.push(frame);
        self.notify();
    }

    /// Wakes one sleeper after a publish, on pools that sleep.
    fn notify(&self) {
        if self.parks() {
            self.sleepers.wake_one();
        }
    }

    fn parks(&self) -> bool {
        !matches!(self.mode, PoolMode::Busy)
    }

    /// Requests cooperative shutdown and pulses every wakeword.
    pub(crate) fn begin_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.sleepers.wake_all();
    }
}

thread_local! {
    static CURRENT_WORKER: Cell<*const Worker> = const { Cell::new(ptr::null()) };
}

/// Index of the worker pinned to the current thread, if any.
pub(crate) fn current_index() -> Option<usize> {
    let worker = CURRENT_WORKER.with(Cell::get);
    // SAFETY: the pointer is set by `enter` for a stack-pinned worker that
    // outlives its scheduler loop, and cleared on exit.
    (!worker.is_null()).then(|| unsafe { (*worker).index() })
}

struct CurrentGuard {
    prev: *const Worker,
}

impl Drop for CurrentGuard {
    fn drop(&mut self) {
        CURRENT_WORKER.with(|cell| cell.set(self.prev));
    }
}

fn enter(worker: &Worker) -> CurrentGuard {
    CurrentGuard {
        prev: CURRENT_WORKER.with(|cell| cell.replace(ptr::from_ref(worker))),
    }
}

/// What the trampoline does after interpreting one suspension.
enum Next {
    Resume(NonNull<Frame>),
    Idle,
}

/// One worker: an OS thread hosting one deque and one cactus stack.
pub(crate) struct Worker {
    index: usize,
    deque: WorkDeque,
    stack: StackCache,
    rng: RefCell<DetRng>,
    shared: Arc<PoolShared>,
}

impl Worker {
    pub(crate) fn new(index: usize, deque: WorkDeque, shared: Arc<PoolShared>) -> Self {
        Self {
            index,
            deque,
            stack: StackCache::new(),
            rng: RefCell::new(DetRng::new(index as u64 + 1)),
            shared,
        }
    }

    pub(crate) fn index(&self) -> usize {
        self.index
    }

    pub(crate) fn num_workers(&self) -> usize {
        self.shared.num_workers()
    }

    /// On a single-worker pool a fork cannot be stolen; allocate it as a
    /// call so the whole join protocol short-circuits.
    pub(crate) fn fork_degrades_to_call(&self) -> bool {
        self.num_workers() == 1
    }

    pub(crate) fn stack_alloc(&self, layout: Layout) -> (NonNull<u8>, NonNull<Stacklet>, usize) {
        self.stack.alloc(layout)
    }

    pub(crate) fn stack_dealloc(&self, stacklet: NonNull<Stacklet>, sp: usize) {
        self.stack.dealloc(stacklet, sp);
    }

    /// Finds the next runnable continuation: own inbox, own deque, the
    /// global injector, then theft.
    fn next_task(&self) -> Option<NonNull<Frame>> {
        if let Some(FramePtr(frame)) = self.shared.inboxes[self.index].pop() {
            return Some(frame);
        }
        if let Some(frame) = self.deque.pop() {
            return Some(frame);
        }
        if let Some(FramePtr(frame)) = self.shared.injector.pop() {
            return Some(frame);
        }
        let stolen = stealing::steal_task(
            &self.shared.stealers,
            self.index,
            &mut self.rng.borrow_mut(),
            self.shared.steal_retries,
        )?;
        trace!(worker = self.index, "stole a continuation");
        // SAFETY: a successful steal makes this worker the frame's
        // exclusive owner.
        unsafe { stolen.as_ref() }.note_stolen();
        Some(stolen)
    }

    /// The sleep protocol: mark, re-check every queue under the sleeping
    /// state, then park. A publisher that missed the mark is caught by the
    /// re-check; a publisher that saw it will wake us.
    fn sleep(&self) {
        self.shared.sleepers.mark(self.index);
        // Pairs with the publisher's fence in `Sleepers::wake_one`: if the
        // re-check below misses a publish, the publisher sees our bit.
        atomic::fence(Ordering::SeqCst);
        if self.has_visible_work() || self.shared.shutdown.load(Ordering::Acquire) {
            self.shared.sleepers.unmark(self.index);
            return;
        }
        self.shared.sleepers.park(self.index);
    }

    fn has_visible_work(&self) -> bool {
        !self.shared.inboxes[self.index].is_empty()
            || !self.shared.injector.is_empty()
            || self.shared.stealers.iter().any(|stealer| !stealer.is_empty())
    }

    /// Drives `frame` and everything it transfers into until the chain
    /// yields to the executor.
    pub(crate) fn run_task(&self, frame: NonNull<Frame>) {
        debug_assert_eq!(
            current_index(),
            Some(self.index),
            "task driven off its worker thread"
        );
        let mut current = frame;
        loop {
            // SAFETY: the trampoline holds exclusive ownership of `current`.
            let polled = unsafe { (current.as_ref().vtable().poll)(current, self) };
            let next = match polled {
                Polled::Suspended(SuspendKind::Fork(child)) => {
                    // Publish the parent continuation, then dive into the
                    // child.
                    self.deque.push(current);
                    self.shared.notify();
                    Next::Resume(child)
                }
                Polled::Suspended(SuspendKind::Call(child)) => Next::Resume(child),
                Polled::Suspended(SuspendKind::Join) => self.handle_join(current),
                Polled::Suspended(SuspendKind::Switch(dest)) => self.handle_switch(current, dest),
                Polled::Completed => self.finish(current),
            };
            match next {
                Next::Resume(frame) => current = frame,
                Next::Idle => return,
            }
        }
    }

    /// Parent side of the join protocol.
    fn handle_join(&self, frame: NonNull<Frame>) -> Next {
        // SAFETY: the join runs on the frame's current exclusive owner.
        let header = unsafe { frame.as_ref() };
        let steals = header.steals();
        if steals == 0 {
            // No continuation escaped: the owner already completed every
            // child by popping its own deque. No reset needed.
            return self.after_join(frame);
        }

        let joined = JOINS_RESET - header.load_joins(Ordering::Acquire);
        if joined == steals {
            // Every stolen child has already reported in.
            trace!(worker = self.index, "join ready");
            self.take_stack(header.top());
            header.reset();
            return self.after_join(frame);
        }

        // Re-base the counter so it tracks the children still pending.
        let prev = header.fetch_sub_joins(JOINS_RESET - steals, Ordering::Release);
        if steals == JOINS_RESET - prev {
            // The last child reported in between the read and the
            // subtraction: we win the race and keep the continuation.
            atomic::fence(Ordering::Acquire);
            trace!(worker = self.index, "wins join race");
            self.take_stack(header.top());
            header.reset();
            return self.after_join(frame);
        }

        // Some other worker resumes the continuation; the frame may already
        // be gone, so it must not be touched again.
        trace!(worker = self.index, "loses join race");
        Next::Idle
    }

    /// Completes a join: surfaces any failure stashed by a joined child,
    /// otherwise resumes the body.
    fn after_join(&self, frame: NonNull<Frame>) -> Next {
        // SAFETY: we own the frame; the join has completed.
        let header = unsafe { frame.as_ref() };
        debug_assert_eq!(header.steals(), 0);
        debug_assert_eq!(header.load_joins(Ordering::Relaxed), JOINS_RESET);
        if header.exception().is_claimed() {
            // A child failed: the failure replaces the rest of this body.
            return self.finish(frame);
        }
        Next::Resume(frame)
    }

    fn handle_switch(&self, frame: NonNull<Frame>, dest: usize) -> Next {
        if dest == self.index {
            return Next::Resume(frame);
        }
        trace!(worker = self.index, dest, "handing continuation to another worker");
        self.shared.inboxes[dest].push(FramePtr(frame));
        if self.shared.parks() {
            self.shared.sleepers.wake(dest);
        }
        Next::Idle
    }

    /// Final suspend: route by tag.
    fn finish(&self, frame: NonNull<Frame>) -> Next {
        // SAFETY: we own the completed frame.
        let header = unsafe { frame.as_ref() };
        match header.tag() {
            Tag::Root => {
                trace!(worker = self.index, "root task complete, signalling semaphore");
                // SAFETY: root frames are heap cells created by alloc_root.
                unsafe { (header.vtable().finish_root)(frame) };
                Next::Idle
            }
            Tag::Call => {
                let parent = header.parent().expect("call frame without a parent");
                // An inline child's parent was never published: no atomics,
                // no stack motion, just transfer back.
                // SAFETY: same-thread exclusive ownership of child and parent.
                unsafe {
                    header.exception().propagate_to(parent.as_ref().exception());
                    (header.vtable().destroy)(frame, self);
                }
                Next::Resume(parent)
            }
            Tag::Fork => self.finish_forked(frame),
        }
    }

    /// Child side of the join protocol.
    fn finish_forked(&self, frame: NonNull<Frame>) -> Next {
        // SAFETY: we own the completed frame; the parent outlives it.
        let header = unsafe { frame.as_ref() };
        let parent = header.parent().expect("forked frame without a parent");
        // Snapshot before the decrement that can hand the parent (and its
        // frame's memory) to another worker.
        let locale = unsafe { parent.as_ref().locale() };
        // Publish our failure, if any, before registering completion so the
        // join winner observes it.
        unsafe {
            header.exception().propagate_to(parent.as_ref().exception());
            (header.vtable().destroy)(frame, self);
        }

        if let Some(popped) = self.deque.pop() {
            // The continuation was never stolen: we still own the parent
            // outright and no other worker can be racing us.
            debug_assert_eq!(popped, parent, "popped continuation is not the parent");
            trace!(worker = self.index, "parent not stolen, continuing");
            return Next::Resume(parent);
        }

        // The continuation was stolen. Register this child with the join
        // counter; the release pairs with the join winner's acquire.
        // SAFETY: `joins` is the frame's cross-thread synchronisation point.
        let prev = unsafe { parent.as_ref().fetch_sub_joins(1, Ordering::Release) };
        if prev == 1 {
            // We are the last child to report: resume the parent.
            atomic::fence(Ordering::Acquire);
            trace!(worker = self.index, "last child resumes parent");
            if !locale.is_root {
                let top = locale.top.expect("stolen parent without a stacklet");
                if top != self.stack.asp() {
                    self.stack.take(top);
                }
            }
            // SAFETY: winning the decrement race grants exclusive ownership.
            unsafe { parent.as_ref().reset() };
            return self.after_join(parent);
        }

        // Not the last: if we hold the parent's stacklet, hand it over for
        // whichever worker wins the join.
        if !locale.is_root && locale.top == Some(self.stack.asp()) {
            trace!(worker = self.index, "releasing stacklet to the join winner");
            self.stack.release();
        }
        Next::Idle
    }

    fn take_stack(&self, top: Option<NonNull<Stacklet>>) {
        if let Some(top) = top {
            self.stack.take(top);
        }
    }
}

/// The scheduler loop.
pub(crate) fn run(worker: &Worker) {
    let _guard = enter(worker);
    trace!(worker = worker.index, "worker loop starting");
    let backoff = Backoff::new();
    loop {
        if let Some(frame) = worker.next_task() {
            backoff.reset();
            worker.run_task(frame);
            continue;
        }
        if worker.shared.shutdown.load(Ordering::Acquire) {
            break;
        }
        match worker.shared.mode {
            PoolMode::Busy => backoff.snooze(),
            PoolMode::Unit | PoolMode::Lazy => worker.sleep(),
        }
    }
    debug_assert!(
        worker.deque.is_empty(),
        "worker exited with queued continuations"
    );
    trace!(worker = worker.index, "worker loop exiting");
}
