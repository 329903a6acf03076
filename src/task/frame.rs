//! Task frame control blocks.
//!
//! Every task invocation owns a [`Frame`]: the header of its task cell,
//! holding the parent back-reference, the steal and join counters of the
//! join protocol, the location of its storage on a cactus stack, and the
//! captured-failure slot.
//!
//! Frames are shared between threads through raw pointers under an
//! exclusive-ownership protocol: at any instant exactly one worker may
//! resume a frame or mutate its non-atomic fields (`steals`). The only
//! fields touched concurrently are `joins` (atomic) and the exception
//! slot's claim flag (atomic); payload visibility rides on the
//! release/acquire edges of the join counter.

use std::any::Any;
use std::cell::{Cell, UnsafeCell};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::runtime::scheduler::worker::Worker;
use crate::runtime::stack::Stacklet;
use crate::task::Tag;

/// `joins` encoding of "no pending joins": `joins = u32::MAX - pending`.
pub(crate) const JOINS_RESET: u32 = u32::MAX;

/// Result of driving a task one step forward.
pub(crate) enum Polled {
    /// The body reached a suspension point.
    Suspended(SuspendKind),
    /// The body ran to completion (or completed by failure); the result, if
    /// any, has been written to the task's slot.
    Completed,
}

/// The suspension points a task body can reach.
pub(crate) enum SuspendKind {
    /// Publish the parent's continuation and dive into the child.
    Fork(NonNull<Frame>),
    /// Transfer directly into the child; the parent is never published.
    Call(NonNull<Frame>),
    /// Wait for all outstanding forked children.
    Join,
    /// Move the continuation to another worker's inbox.
    Switch(usize),
}

/// Monomorphized entry points into a task cell.
pub(crate) struct FrameVTable {
    /// Drive the body one step; writes the result on completion.
    pub(crate) poll: unsafe fn(NonNull<Frame>, &Worker) -> Polled,
    /// Drop the cell and return its storage to the cactus stack.
    /// Only valid for fork/call frames.
    pub(crate) destroy: unsafe fn(NonNull<Frame>, &Worker),
    /// Deliver the outcome to the root block, free the heap frame, and
    /// signal the completion semaphore. Only valid for root frames.
    pub(crate) finish_root: unsafe fn(NonNull<Frame>),
}

/// Snapshot of a frame's identity taken before ownership may be lost.
#[derive(Clone, Copy)]
pub(crate) struct Locale {
    pub(crate) is_root: bool,
    pub(crate) top: Option<NonNull<Stacklet>>,
}

/// The per-task control block.
pub(crate) struct Frame {
    vtable: &'static FrameVTable,
    parent: Option<NonNull<Frame>>,
    tag: Tag,
    /// Stacklet holding this frame's storage; `None` for root frames.
    top: Option<NonNull<Stacklet>>,
    /// Bump offset of the owning stacklet before this frame was allocated.
    alloc_sp: usize,
    /// Number of times this frame's continuation has been stolen since the
    /// last reset. Mutated only by the frame's current exclusive owner.
    steals: Cell<u32>,
    /// Encoded join counter: `u32::MAX - pending_joins`.
    joins: AtomicU32,
    exception: ExceptionSlot,
}

impl Frame {
    pub(crate) fn new(
        vtable: &'static FrameVTable,
        parent: Option<NonNull<Frame>>,
        tag: Tag,
        top: Option<NonNull<Stacklet>>,
        alloc_sp: usize,
    ) -> Self {
        Self {
            vtable,
            parent,
            tag,
            top,
            alloc_sp,
            steals: Cell::new(0),
            joins: AtomicU32::new(JOINS_RESET),
            exception: ExceptionSlot::new(),
        }
    }

    pub(crate) fn vtable(&self) -> &'static FrameVTable {
        self.vtable
    }

    pub(crate) fn parent(&self) -> Option<NonNull<Frame>> {
        self.parent
    }

    pub(crate) fn tag(&self) -> Tag {
        self.tag
    }

    pub(crate) fn top(&self) -> Option<NonNull<Stacklet>> {
        self.top
    }

    pub(crate) fn alloc_sp(&self) -> usize {
        self.alloc_sp
    }

    pub(crate) fn steals(&self) -> u32 {
        self.steals.get()
    }

    /// Records that this frame's continuation left a deque via theft.
    ///
    /// Called by the thief immediately after a successful steal, at which
    /// point the thief is the frame's exclusive owner.
    pub(crate) fn note_stolen(&self) {
        self.steals.set(self.steals.get() + 1);
    }

    pub(crate) fn load_joins(&self, order: Ordering) -> u32 {
        self.joins.load(order)
    }

    pub(crate) fn fetch_sub_joins(&self, value: u32, order: Ordering) -> u32 {
        self.joins.fetch_sub(value, order)
    }

    /// Returns the frame to its initial join state after a successful join.
    pub(crate) fn reset(&self) {
        self.steals.set(0);
        self.joins.store(JOINS_RESET, Ordering::Relaxed);
    }

    /// True when the control block is in its initial state. Frames must be
    /// in this state at destruction.
    pub(crate) fn is_reset(&self) -> bool {
        self.steals.get() == 0 && self.joins.load(Ordering::Relaxed) == JOINS_RESET
    }

    pub(crate) fn locale(&self) -> Locale {
        Locale {
            is_root: matches!(self.tag, Tag::Root),
            top: self.top,
        }
    }

    pub(crate) fn exception(&self) -> &ExceptionSlot {
        &self.exception
    }
}

/// A deque/inbox entry: a frame pointer whose ownership travels with it.
pub(crate) struct FramePtr(pub(crate) NonNull<Frame>);

// SAFETY: a `FramePtr` carries exclusive ownership of the continuation it
// points to; the frame is only resumed by whichever worker holds the
// pointer, and handoffs are ordered by the queue it travelled through.
unsafe impl Send for FramePtr {}

/// First-wins storage for a captured failure.
///
/// Concurrent siblings race on the claim flag; the loser's payload is
/// dropped (the runtime promises only that at least one failure surfaces).
pub(crate) struct ExceptionSlot {
    claimed: AtomicBool,
    payload: UnsafeCell<Option<Box<dyn Any + Send>>>,
}

impl ExceptionSlot {
    pub(crate) fn new() -> Self {
        Self {
            claimed: AtomicBool::new(false),
            payload: UnsafeCell::new(None),
        }
    }

    /// Attempts to store `payload`; returns false (dropping the payload) if
    /// another failure was stashed first.
    ///
    /// Relaxed ordering suffices: the payload write is published to its
    /// eventual reader by the join counter's release/acquire edge, never by
    /// the claim flag itself.
    pub(crate) fn claim(&self, payload: Box<dyn Any + Send>) -> bool {
        if self
            .claimed
            .compare_exchange(false, true, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            // SAFETY: the successful CAS grants exclusive write access to
            // the payload cell.
            unsafe {
                *self.payload.get() = Some(payload);
            }
            true
        } else {
            false
        }
    }

    pub(crate) fn is_claimed(&self) -> bool {
        self.claimed.load(Ordering::Relaxed)
    }

    /// Removes the stashed payload.
    ///
    /// # Safety
    ///
    /// The caller must be the frame's exclusive owner, with every claiming
    /// child's completion ordered before this call.
    pub(crate) unsafe fn take(&self) -> Option<Box<dyn Any + Send>> {
        if self.claimed.load(Ordering::Relaxed) {
            // SAFETY: exclusivity is the caller's contract.
            unsafe { (*self.payload.get()).take() }
        } else {
            None
        }
    }

    /// Moves this slot's payload, if any, into `parent` (first claim wins).
    ///
    /// # Safety
    ///
    /// Same contract as [`ExceptionSlot::take`].
    pub(crate) unsafe fn propagate_to(&self, parent: &ExceptionSlot) {
        // SAFETY: forwarded caller contract.
        if let Some(payload) = unsafe { self.take() } {
            let _ = parent.claim(payload);
        }
    }
}
