//! The work-stealing deque.
//!
//! Chase–Lev layout: the owning worker pushes and pops continuations at the
//! bottom (LIFO), thieves steal at the top (FIFO), and the race between an
//! owner pop and a thief steal of the last entry is resolved by a CAS on
//! the top index. Oldest-first stealing is load-bearing for the join
//! protocol: the entry at the bottom of a deque is always the completing
//! child's immediate parent.
//!
//! The buffer grows by doubling and is never shrunk; retired buffers stay
//! alive until the deque itself is dropped, so a thief holding a stale
//! buffer pointer always reads valid (if outdated) memory and is corrected
//! by its CAS.

use std::ptr::NonNull;
use std::sync::atomic::{self, AtomicIsize, AtomicPtr, Ordering};
use std::sync::Arc;

use crossbeam_utils::CachePadded;
use parking_lot::Mutex;

use crate::task::frame::Frame;

/// Initial buffer capacity; must be a power of two.
const INITIAL_CAPACITY: usize = 64;

/// Outcome of a steal attempt.
pub(crate) enum Steal {
    /// The deque was observed empty.
    Empty,
    /// Lost a race; the caller may retry.
    Retry,
    /// Took the oldest continuation.
    Success(NonNull<Frame>),
}

struct Buffer {
    cells: Box<[AtomicPtr<Frame>]>,
}

impl Buffer {
    fn alloc(capacity: usize) -> *mut Buffer {
        debug_assert!(capacity.is_power_of_two());
        let cells = (0..capacity)
            .map(|_| AtomicPtr::new(std::ptr::null_mut()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Box::into_raw(Box::new(Buffer { cells }))
    }

    fn capacity(&self) -> isize {
        self.cells.len() as isize
    }

    fn get(&self, index: isize) -> *mut Frame {
        self.cells[index as usize & (self.cells.len() - 1)].load(Ordering::Relaxed)
    }

    fn put(&self, index: isize, value: *mut Frame) {
        self.cells[index as usize & (self.cells.len() - 1)].store(value, Ordering::Relaxed);
    }
}

struct DequeShared {
    top: CachePadded<AtomicIsize>,
    bottom: CachePadded<AtomicIsize>,
    active: AtomicPtr<Buffer>,
    /// Buffers replaced by growth; freed when the deque dies.
    retired: Mutex<Vec<*mut Buffer>>,
}

// SAFETY: the raw buffer pointers are owned by the shared block and only
// freed on drop; all index accesses go through atomics.
unsafe impl Send for DequeShared {}
unsafe impl Sync for DequeShared {}

impl Drop for DequeShared {
    fn drop(&mut self) {
        // SAFETY: the last handle is going away; no concurrent access.
        unsafe {
            drop(Box::from_raw(self.active.load(Ordering::Relaxed)));
            for buffer in self.retired.get_mut().drain(..) {
                drop(Box::from_raw(buffer));
            }
        }
    }
}

/// The owner side: single-threaded push/pop at the bottom.
pub(crate) struct WorkDeque {
    shared: Arc<DequeShared>,
}

/// A thief's handle: lock-free steal at the top.
#[derive(Clone)]
pub(crate) struct DequeStealer {
    shared: Arc<DequeShared>,
}

impl WorkDeque {
    pub(crate) fn new() -> (WorkDeque, DequeStealer) {
        let shared = Arc::new(DequeShared {
            top: CachePadded::new(AtomicIsize::new(0)),
            bottom: CachePadded::new(AtomicIsize::new(0)),
            active: AtomicPtr::new(Buffer::alloc(INITIAL_CAPACITY)),
            retired: Mutex::new(Vec::new()),
        });
        let stealer = DequeStealer {
            shared: Arc::clone(&shared),
        };
        (WorkDeque { shared }, stealer)
    }

    /// Publishes a continuation at the bottom. Wait-free.
    pub(crate) fn push(&self, frame: NonNull<Frame>) {
        let shared = &*self.shared;
        let bottom = shared.bottom.load(Ordering::Relaxed);
        let top = shared.top.load(Ordering::Acquire);
        let mut buffer = shared.active.load(Ordering::Relaxed);
        // SAFETY: the active buffer is freed only when the deque dies.
        if bottom - top >= unsafe { &*buffer }.capacity() {
            buffer = self.grow(top, bottom);
        }
        // SAFETY: as above.
        unsafe { &*buffer }.put(bottom, frame.as_ptr());
        // The release pairs with the acquire in steal to publish the entry.
        shared.bottom.store(bottom + 1, Ordering::Release);
    }

    /// Takes the newest continuation. Wait-free for the owner.
    pub(crate) fn pop(&self) -> Option<NonNull<Frame>> {
        let shared = &*self.shared;
        let bottom = shared.bottom.load(Ordering::Relaxed) - 1;
        let buffer = shared.active.load(Ordering::Relaxed);
        shared.bottom.store(bottom, Ordering::Relaxed);
        // Full fence before re-reading top: the claimed slot must be
        // visible to thieves before we decide the deque was non-empty.
        atomic::fence(Ordering::SeqCst);
        let top = shared.top.load(Ordering::Relaxed);

        if top > bottom {
            // Empty: undo the claim.
            shared.bottom.store(bottom + 1, Ordering::Relaxed);
            return None;
        }
        // SAFETY: the active buffer is freed only when the deque dies.
        let frame = unsafe { &*buffer }.get(bottom);
        if top == bottom {
            // Last entry: decide the race against thieves with a CAS.
            let won = shared
                .top
                .compare_exchange(top, top + 1, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok();
            shared.bottom.store(bottom + 1, Ordering::Relaxed);
            return won.then(|| NonNull::new(frame)).flatten();
        }
        NonNull::new(frame)
    }

    pub(crate) fn is_empty(&self) -> bool {
        let shared = &*self.shared;
        let bottom = shared.bottom.load(Ordering::Relaxed);
        let top = shared.top.load(Ordering::Relaxed);
        bottom <= top
    }

    /// Doubles the buffer, copying the live range. Called by push only.
    #[cold]
    fn grow(&self, top: isize, bottom: isize) -> *mut Buffer {
        let shared = &*self.shared;
        let old = shared.active.load(Ordering::Relaxed);
        // SAFETY: the active buffer is freed only when the deque dies.
        let old_ref = unsafe { &*old };
        let fresh = Buffer::alloc((old_ref.capacity() as usize) * 2);
        // SAFETY: freshly allocated, not yet shared.
        let fresh_ref = unsafe { &*fresh };
        for index in top..bottom {
            fresh_ref.put(index, old_ref.get(index));
        }
        // The release publishes the copied entries to thieves that load the
        // new buffer pointer.
        shared.active.store(fresh, Ordering::Release);
        shared.retired.lock().push(old);
        fresh
    }
}

impl DequeStealer {
    /// Attempts to take the oldest continuation. Lock-free; may fail
    /// spuriously with [`Steal::Retry`].
    pub(crate) fn steal(&self) -> Steal {
        let shared = &*self.shared;
        let top = shared.top.load(Ordering::Acquire);
        atomic::fence(Ordering::SeqCst);
        let bottom = shared.bottom.load(Ordering::Acquire);
        if top >= bottom {
            return Steal::Empty;
        }
        let buffer = shared.active.load(Ordering::Acquire);
        // SAFETY: buffers are freed only when the deque dies; a stale
        // pointer still reads valid memory and the CAS below rejects it.
        let frame = unsafe { &*buffer }.get(top);
        if shared
            .top
            .compare_exchange(top, top + 1, Ordering::SeqCst, Ordering::Relaxed)
            .is_err()
        {
            return Steal::Retry;
        }
        match NonNull::new(frame) {
            Some(frame) => Steal::Success(frame),
            None => Steal::Retry,
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        let shared = &*self.shared;
        let bottom = shared.bottom.load(Ordering::Relaxed);
        let top = shared.top.load(Ordering::Relaxed);
        bottom <= top
    }
}
