//! Monomorphized task cells.
//!
//! A [`TaskCell`] is the storage for one task invocation: the [`Frame`]
//! control block followed by the user's state machine and the address its
//! result is delivered to. Cells are erased behind `NonNull<Frame>` (the
//! frame is the first field, `repr(C)`); the frame's vtable recovers the
//! concrete type.
//!
//! Allocation is specialised by tag: root cells live on the heap and
//! deliver into a [`RootBlock`] on the submitting thread's stack; fork and
//! call cells are bump-allocated on the invoking worker's cactus stack.

use std::alloc::Layout;
use std::any::Any;
use std::cell::UnsafeCell;
use std::panic::{self, AssertUnwindSafe};
use std::ptr::{self, NonNull};

use crate::runtime::scheduler::worker::Worker;
use crate::sync::Semaphore;
use crate::task::frame::{Frame, FrameVTable, Polled, SuspendKind};
use crate::task::{Coroutine, Cx, Eventually, Step, StepInner, Tag};

/// Where a completing task writes its value.
enum SlotPtr<T> {
    /// A result slot inside the parent's state.
    Eventually(NonNull<Eventually<T>>),
    /// The root block on the sync-wait caller's stack.
    Root(NonNull<RootBlock<T>>),
}

impl<T> Clone for SlotPtr<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for SlotPtr<T> {}

/// Storage for one task invocation. The frame must stay the first field so
/// `NonNull<Frame>` and `NonNull<TaskCell<C>>` are interchangeable.
#[repr(C)]
pub(crate) struct TaskCell<C: Coroutine> {
    frame: Frame,
    state: C,
    slot: SlotPtr<C::Output>,
}

impl<C: Coroutine> TaskCell<C> {
    const VTABLE: FrameVTable = FrameVTable {
        poll: Self::poll,
        destroy: Self::destroy,
        finish_root: Self::finish_root,
    };

    /// Drives the state machine one step and interprets the outcome.
    ///
    /// An escaped panic is claimed into the frame's own exception slot and
    /// converted into a join: any children forked before the failure are
    /// still outstanding and must report in before the frame can die.
    unsafe fn poll(frame: NonNull<Frame>, worker: &Worker) -> Polled {
        let cell = frame.cast::<TaskCell<C>>().as_ptr();
        let mut cx = Cx { worker, frame };
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            // SAFETY: field projection from the exclusively owned cell; the
            // state field is not aliased while the body runs.
            let state = unsafe { &mut (*cell).state };
            state.resume(&mut cx)
        }));
        match outcome {
            Ok(Step(StepInner::Suspend(kind))) => Polled::Suspended(kind),
            Ok(Step(StepInner::Done(value))) => {
                // SAFETY: the body has returned; no borrows of the cell remain.
                match unsafe { (*cell).slot } {
                    // SAFETY: the slot outlives this child (it lives in the
                    // suspended parent / waiting root block).
                    SlotPtr::Eventually(slot) => unsafe { slot.as_ref().set(value) },
                    SlotPtr::Root(block) => unsafe { block.as_ref().put_value(value) },
                }
                Polled::Completed
            }
            Err(payload) => {
                // SAFETY: as above; only the claim flag is shared.
                let _ = unsafe { &(*cell).frame }.exception().claim(payload);
                Polled::Suspended(SuspendKind::Join)
            }
        }
    }

    /// Drops the cell in place and rolls its storage back off the cactus
    /// stack. Fork/call frames only.
    unsafe fn destroy(frame: NonNull<Frame>, worker: &Worker) {
        let cell = frame.cast::<TaskCell<C>>();
        // SAFETY: exclusive owner; the frame is live until drop_in_place.
        let (top, alloc_sp) = {
            let header = unsafe { frame.as_ref() };
            debug_assert!(!matches!(header.tag(), Tag::Root), "root frames are finished, not destroyed");
            debug_assert!(header.is_reset(), "frame destroyed with joins pending");
            (header.top(), header.alloc_sp())
        };
        let top = top.expect("fork/call frame without a stacklet");
        // SAFETY: last use of the cell; nothing reads it afterwards.
        unsafe { ptr::drop_in_place(cell.as_ptr()) };
        worker.stack_dealloc(top, alloc_sp);
    }

    /// Delivers the root outcome, frees the heap cell, and signals the
    /// completion semaphore. Root frames only.
    unsafe fn finish_root(frame: NonNull<Frame>) {
        let cell = frame.cast::<TaskCell<C>>().as_ptr();
        // SAFETY: exclusive owner of the completed root frame.
        let block = match unsafe { (*cell).slot } {
            SlotPtr::Root(block) => block,
            SlotPtr::Eventually(_) => unreachable!("root frame delivering into a result slot"),
        };
        debug_assert!(unsafe { &(*cell).frame }.is_reset(), "root destroyed with joins pending");
        // SAFETY: every child has completed (the root passed its final
        // join), so the slot is exclusively ours.
        let failure = unsafe { (*cell).frame.exception().take() };
        if let Some(payload) = failure {
            // SAFETY: the waiting thread reads the block only after the
            // semaphore release below.
            unsafe { block.as_ref().put_failure(payload) };
        }
        // SAFETY: allocated by `alloc_root` via Box::into_raw.
        drop(unsafe { Box::from_raw(cell) });
        // SAFETY: the block outlives the signal: the waiting thread frees
        // it only after acquire returns.
        unsafe { block.as_ref().semaphore.release() };
    }
}

/// Bump-allocates a fork/call cell on `worker`'s cactus stack.
pub(crate) fn alloc_on_stack<C: Coroutine>(
    worker: &Worker,
    state: C,
    slot: NonNull<Eventually<C::Output>>,
    parent: NonNull<Frame>,
    tag: Tag,
) -> NonNull<Frame> {
    debug_assert!(matches!(tag, Tag::Fork | Tag::Call));
    let (ptr, top, alloc_sp) = worker.stack_alloc(Layout::new::<TaskCell<C>>());
    let cell = ptr.cast::<TaskCell<C>>();
    // SAFETY: `ptr` is a fresh, aligned, exclusively owned allocation large
    // enough for the cell.
    unsafe {
        cell.as_ptr().write(TaskCell {
            frame: Frame::new(&TaskCell::<C>::VTABLE, Some(parent), tag, Some(top), alloc_sp),
            state,
            slot: SlotPtr::Eventually(slot),
        });
    }
    cell.cast::<Frame>()
}

/// Heap-allocates a root cell delivering into `block`.
pub(crate) fn alloc_root<C: Coroutine>(
    state: C,
    block: NonNull<RootBlock<C::Output>>,
) -> NonNull<Frame> {
    let cell = Box::new(TaskCell {
        frame: Frame::new(&TaskCell::<C>::VTABLE, None, Tag::Root, None, 0),
        state,
        slot: SlotPtr::Root(block),
    });
    // SAFETY: Box::into_raw never returns null.
    unsafe { NonNull::new_unchecked(Box::into_raw(cell)) }.cast::<Frame>()
}

/// Landing area for a root task's outcome, owned by the sync-wait caller.
pub(crate) struct RootBlock<T> {
    semaphore: Semaphore,
    value: UnsafeCell<Option<T>>,
    failure: UnsafeCell<Option<Box<dyn Any + Send>>>,
}

// SAFETY: the cells are written by the completing worker strictly before
// the semaphore release, and read by the waiting thread strictly after the
// matching acquire; the semaphore provides the required ordering.
unsafe impl<T: Send> Sync for RootBlock<T> {}

impl<T> RootBlock<T> {
    pub(crate) fn new() -> Self {
        Self {
            semaphore: Semaphore::new(),
            value: UnsafeCell::new(None),
            failure: UnsafeCell::new(None),
        }
    }

    /// Blocks until the root task signals completion.
    pub(crate) fn wait(&self) {
        self.semaphore.acquire();
    }

    /// Consumes the block after [`RootBlock::wait`] returned.
    pub(crate) fn into_outcome(self) -> Result<T, Box<dyn Any + Send>> {
        if let Some(payload) = self.failure.into_inner() {
            Err(payload)
        } else {
            Ok(self
                .value
                .into_inner()
                .expect("root task completed without a value"))
        }
    }

    /// # Safety
    ///
    /// Called once by the completing worker before the semaphore release.
    unsafe fn put_value(&self, value: T) {
        // SAFETY: single-writer contract above.
        unsafe {
            *self.value.get() = Some(value);
        }
    }

    /// # Safety
    ///
    /// Called once by the completing worker before the semaphore release.
    unsafe fn put_failure(&self, payload: Box<dyn Any + Send>) {
        // SAFETY: single-writer contract above.
        unsafe {
            *self.failure.get() = Some(payload);
        }
    }
}
