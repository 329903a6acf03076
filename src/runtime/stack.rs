//! The cactus stack: segmented per-worker execution stacks.
//!
//! Task cells are bump-allocated on fixed-size *stacklets*. Recursive
//! fork/join produces a cactus of frames: multiple active leaves share a
//! common spine, with whole stacklets migrating between workers as
//! continuations are stolen and joined. A stacklet is owned by exactly one
//! worker at any instant:
//!
//! - a thief begins a stolen continuation on a fresh stacklet of its own;
//! - the victim relinquishes the stolen frame's stacklet at its next
//!   suspension point ([`StackCache::release`]);
//! - whichever worker completes the join adopts the suspended frame's
//!   stacklet ([`StackCache::take`]).
//!
//! Allocation overflow chains a fresh stacklet through `prev`; a stacklet
//! that rolls back to empty pops to its predecessor and returns to the
//! owner's free list.

use std::alloc::{self, Layout};
use std::cell::{Cell, RefCell, UnsafeCell};
use std::mem::MaybeUninit;
use std::ptr::{addr_of_mut, NonNull};

/// Usable bytes per stacklet. One task cell must fit in a single stacklet.
pub(crate) const STACKLET_CAPACITY: usize = 128 * 1024;

#[repr(align(16))]
struct StackletData([MaybeUninit<u8>; STACKLET_CAPACITY]);

/// One segment of a cactus stack.
pub(crate) struct Stacklet {
    /// Bump offset into `data`. Zero means empty.
    sp: Cell<usize>,
    /// Predecessor in an overflow chain.
    prev: Cell<Option<NonNull<Stacklet>>>,
    data: UnsafeCell<StackletData>,
}

impl Stacklet {
    /// Allocates a fresh, empty stacklet. The data area is deliberately
    /// left uninitialized.
    pub(crate) fn allocate() -> NonNull<Stacklet> {
        let layout = Layout::new::<Stacklet>();
        // SAFETY: the layout has non-zero size.
        let raw = unsafe { alloc::alloc(layout) }.cast::<Stacklet>();
        let Some(stacklet) = NonNull::new(raw) else {
            alloc::handle_alloc_error(layout)
        };
        // SAFETY: fresh exclusive allocation; only the header needs
        // initialization.
        unsafe {
            addr_of_mut!((*stacklet.as_ptr()).sp).write(Cell::new(0));
            addr_of_mut!((*stacklet.as_ptr()).prev).write(Cell::new(None));
        }
        stacklet
    }

    /// Frees a stacklet previously returned by [`Stacklet::allocate`].
    ///
    /// # Safety
    ///
    /// `stacklet` must be exclusively owned and never used again.
    pub(crate) unsafe fn free(stacklet: NonNull<Stacklet>) {
        // SAFETY: allocated with the identical layout in `allocate`.
        unsafe { alloc::dealloc(stacklet.as_ptr().cast(), Layout::new::<Stacklet>()) };
    }

    fn base(&self) -> *mut u8 {
        self.data.get().cast()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.sp.get() == 0
    }

    pub(crate) fn prev(&self) -> Option<NonNull<Stacklet>> {
        self.prev.get()
    }

    pub(crate) fn set_prev(&self, prev: Option<NonNull<Stacklet>>) {
        self.prev.set(prev);
    }

    /// Bump-allocates `layout`, returning the allocation and the bump
    /// offset to restore on rollback. `None` if it does not fit.
    pub(crate) fn try_alloc(&self, layout: Layout) -> Option<(NonNull<u8>, usize)> {
        let sp = self.sp.get();
        let base = self.base() as usize;
        let start = (base + sp + layout.align() - 1) & !(layout.align() - 1);
        let end = (start - base).checked_add(layout.size())?;
        if end > STACKLET_CAPACITY {
            return None;
        }
        self.sp.set(end);
        // SAFETY: `start` is in bounds of the data area and non-null.
        Some((unsafe { NonNull::new_unchecked(start as *mut u8) }, sp))
    }

    /// Restores the bump offset saved by [`Stacklet::try_alloc`]. The
    /// rolled-back allocation must be the most recent live one.
    pub(crate) fn rollback(&self, sp: usize) {
        debug_assert!(sp <= self.sp.get(), "rollback past the bump pointer");
        self.sp.set(sp);
    }
}

/// A worker's view of the cactus stack: the active stacklet plus a free
/// list of empty ones.
pub(crate) struct StackCache {
    asp: Cell<NonNull<Stacklet>>,
    free: RefCell<Vec<NonNull<Stacklet>>>,
}

impl StackCache {
    pub(crate) fn new() -> Self {
        Self {
            asp: Cell::new(Stacklet::allocate()),
            free: RefCell::new(Vec::new()),
        }
    }

    /// The active stacklet.
    pub(crate) fn asp(&self) -> NonNull<Stacklet> {
        self.asp.get()
    }

    /// Allocates a task cell, overflowing onto a fresh stacklet when the
    /// active one is full. Returns the allocation, the stacklet holding it,
    /// and the bump offset to restore on destruction.
    ///
    /// # Panics
    ///
    /// Panics if `layout` cannot fit in a single stacklet.
    pub(crate) fn alloc(&self, layout: Layout) -> (NonNull<u8>, NonNull<Stacklet>, usize) {
        assert!(
            layout.size() + layout.align() <= STACKLET_CAPACITY,
            "task state of {} bytes exceeds the stacklet capacity",
            layout.size(),
        );
        let top = self.asp.get();
        // SAFETY: the active stacklet is exclusively owned by this worker.
        if let Some((ptr, sp)) = unsafe { top.as_ref() }.try_alloc(layout) {
            return (ptr, top, sp);
        }
        let fresh = self.fresh();
        // SAFETY: `fresh` came off our free list or a new allocation.
        let fresh_ref = unsafe { fresh.as_ref() };
        fresh_ref.set_prev(Some(top));
        self.asp.set(fresh);
        let (ptr, sp) = fresh_ref
            .try_alloc(layout)
            .expect("fresh stacklet cannot satisfy a fitting allocation");
        (ptr, fresh, sp)
    }

    /// Rolls a destroyed task cell off `stacklet` and pops drained overflow
    /// stacklets back to their predecessors.
    pub(crate) fn dealloc(&self, stacklet: NonNull<Stacklet>, sp: usize) {
        debug_assert_eq!(
            stacklet,
            self.asp.get(),
            "frame destroyed on a stacklet the worker does not hold"
        );
        // SAFETY: ownership checked above.
        unsafe { stacklet.as_ref() }.rollback(sp);
        let mut top = self.asp.get();
        loop {
            // SAFETY: `top` is on our exclusively owned chain.
            let top_ref = unsafe { top.as_ref() };
            if !top_ref.is_empty() {
                break;
            }
            let Some(prev) = top_ref.prev() else { break };
            top_ref.set_prev(None);
            self.recycle(top);
            top = prev;
        }
        self.asp.set(top);
    }

    /// Adopts a suspended frame's stacklet as the active one (the take-stack
    /// half of the join protocol). The current stacklet must be drained; it
    /// returns to the free list.
    pub(crate) fn take(&self, top: NonNull<Stacklet>) {
        let old = self.asp.replace(top);
        debug_assert_ne!(old, top, "adopting the stacklet already held");
        // SAFETY: `old` was our exclusively owned active stacklet.
        debug_assert!(
            unsafe { old.as_ref() }.is_empty(),
            "adopting a stacklet while the current one still holds frames"
        );
        self.recycle(old);
    }

    /// Abandons the active stacklet to the eventual join winner and
    /// installs a fresh one (the release half of the join protocol).
    pub(crate) fn release(&self) {
        let fresh = self.fresh();
        self.asp.set(fresh);
    }

    fn fresh(&self) -> NonNull<Stacklet> {
        self.free
            .borrow_mut()
            .pop()
            .unwrap_or_else(Stacklet::allocate)
    }

    fn recycle(&self, stacklet: NonNull<Stacklet>) {
        // SAFETY: recycled stacklets come off our own chain.
        debug_assert!(unsafe { stacklet.as_ref() }.is_empty());
        self.free.borrow_mut().push(stacklet);
    }

    /// Number of stacklets sitting in the free list.
    #[cfg(test)]
    pub(crate) fn free_count(&self) -> usize {
        self.free.borrow().len()
    }
}

impl Drop for StackCache {
    fn drop(&mut self) {
        for stacklet in self.free.get_mut().drain(..) {
            // SAFETY: free-listed stacklets are exclusively ours.
            unsafe { Stacklet::free(stacklet) };
        }
        let mut top = Some(self.asp.get());
        while let Some(stacklet) = top {
            // SAFETY: the active chain is exclusively ours; leaked frames on
            // it (pool dropped mid-computation) lose their destructors but
            // not their memory.
            top = unsafe { stacklet.as_ref() }.prev();
            unsafe { Stacklet::free(stacklet) };
        }
    }
}
