//! Chase-Lev Work-Stealing Deque
//!
//! One per worker. The owner pushes and pops at the bottom (LIFO, keeps
//! hot blocks local); thieves steal from the top (FIFO, distributes cold
//! work). Only the owner may call `push`/`pop`; any thread may `steal`.
//!
//! The circular buffer grows by doubling. A grown-out buffer cannot be
//! freed immediately (a thief may still be reading a slot through the old
//! pointer), so it goes on a retired list freed when the deque drops.
//!
//! Memory ordering follows the C11 formulation of the algorithm:
//! release/acquire around `bottom`, acquire on `top`, seq-cst fences at
//! the owner/thief race window, and a seq-cst CAS to claim a slot.

use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, AtomicPtr, AtomicU64, Ordering, fence};
use std::sync::Arc;

/// Initial slot count; must be a power of two
const INITIAL_CAPACITY: usize = 64;

struct Buffer<T> {
    mask: i64,
    slots: Box<[AtomicPtr<T>]>,
}

impl<T> Buffer<T> {
    fn new(capacity: usize) -> Box<Self> {
        debug_assert!(capacity.is_power_of_two());
        let slots = (0..capacity)
            .map(|_| AtomicPtr::new(std::ptr::null_mut()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Box::new(Self {
            mask: capacity as i64 - 1,
            slots,
        })
    }

    #[inline]
    fn capacity(&self) -> i64 {
        self.mask + 1
    }

    #[inline]
    fn slot(&self, index: i64) -> &AtomicPtr<T> {
        &self.slots[(index & self.mask) as usize]
    }
}

/// Lock-free owner-LIFO / thief-FIFO deque of `Arc<T>` items
pub struct WorkDeque<T> {
    /// Moved by thieves (and by the owner when racing for the last item)
    top: AtomicI64,
    /// Moved by the owner
    bottom: AtomicI64,
    buffer: AtomicPtr<Buffer<T>>,
    /// Grown-out buffers, freed on drop
    retired: Mutex<Vec<*mut Buffer<T>>>,
    pub steals_attempted: AtomicU64,
    pub steals_successful: AtomicU64,
}

// Safety: the algorithm serializes slot handoff through the top CAS; Arc
// ownership transfers exactly once per slot.
unsafe impl<T: Send + Sync> Send for WorkDeque<T> {}
unsafe impl<T: Send + Sync> Sync for WorkDeque<T> {}

impl<T> Default for WorkDeque<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> WorkDeque<T> {
    pub fn new() -> Self {
        Self {
            top: AtomicI64::new(0),
            bottom: AtomicI64::new(0),
            buffer: AtomicPtr::new(Box::into_raw(Buffer::new(INITIAL_CAPACITY))),
            retired: Mutex::new(Vec::new()),
            steals_attempted: AtomicU64::new(0),
            steals_successful: AtomicU64::new(0),
        }
    }

    /// Approximate occupancy; exact only for the owner
    pub fn len(&self) -> usize {
        let b = self.bottom.load(Ordering::Relaxed);
        let t = self.top.load(Ordering::Relaxed);
        (b - t).max(0) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Owner-only: push at the bottom.
    pub fn push(&self, item: Arc<T>) {
        let b = self.bottom.load(Ordering::Relaxed);
        let t = self.top.load(Ordering::Acquire);
        // Safety: the buffer pointer is valid; only the owner swaps it.
        let mut buf = unsafe { &*self.buffer.load(Ordering::Relaxed) };
        if b - t >= buf.capacity() {
            self.grow(t, b);
            buf = unsafe { &*self.buffer.load(Ordering::Relaxed) };
        }
        buf.slot(b).store(Arc::into_raw(item) as *mut T, Ordering::Relaxed);
        fence(Ordering::Release);
        self.bottom.store(b + 1, Ordering::Relaxed);
    }

    /// Owner-only: pop at the bottom (LIFO).
    pub fn pop(&self) -> Option<Arc<T>> {
        let b = self.bottom.load(Ordering::Relaxed) - 1;
        // Safety: owner-only buffer access.
        let buf = unsafe { &*self.buffer.load(Ordering::Relaxed) };
        self.bottom.store(b, Ordering::Relaxed);
        fence(Ordering::SeqCst);
        let t = self.top.load(Ordering::Relaxed);

        if t > b {
            // Empty: restore bottom
            self.bottom.store(b + 1, Ordering::Relaxed);
            return None;
        }

        let raw = buf.slot(b).load(Ordering::Relaxed);
        if t == b {
            // Exactly one element: race thieves for it
            let won = self
                .top
                .compare_exchange(t, t + 1, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok();
            self.bottom.store(b + 1, Ordering::Relaxed);
            if !won {
                return None;
            }
        }
        // Safety: the slot was published by push and claimed exactly once.
        Some(unsafe { Arc::from_raw(raw) })
    }

    /// Any thread: steal from the top (FIFO). A lost race returns `None`
    /// for this attempt; callers retry or move on to another victim.
    pub fn steal(&self) -> Option<Arc<T>> {
        self.steals_attempted.fetch_add(1, Ordering::Relaxed);
        let t = self.top.load(Ordering::Acquire);
        fence(Ordering::SeqCst);
        let b = self.bottom.load(Ordering::Acquire);
        if t >= b {
            return None;
        }
        // Safety: buffer pointers stay alive until drop via the retired
        // list, so this read is safe even across a concurrent grow.
        let buf = unsafe { &*self.buffer.load(Ordering::Acquire) };
        let raw = buf.slot(t).load(Ordering::Relaxed);
        if self
            .top
            .compare_exchange(t, t + 1, Ordering::SeqCst, Ordering::Relaxed)
            .is_err()
        {
            return None;
        }
        self.steals_successful.fetch_add(1, Ordering::Relaxed);
        // Safety: the CAS claimed slot t exclusively.
        Some(unsafe { Arc::from_raw(raw) })
    }

    /// Owner-only: double the buffer, copying the live range. The old
    /// buffer is retired, not freed: a thief may still be reading it.
    fn grow(&self, top: i64, bottom: i64) {
        let old_ptr = self.buffer.load(Ordering::Relaxed);
        // Safety: owner-only.
        let old = unsafe { &*old_ptr };
        let fresh = Buffer::new((old.capacity() as usize) * 2);
        for i in top..bottom {
            fresh
                .slot(i)
                .store(old.slot(i).load(Ordering::Relaxed), Ordering::Relaxed);
        }
        self.buffer.store(Box::into_raw(fresh), Ordering::Release);
        self.retired
            .lock()
            .expect("retired-buffer lock poisoned")
            .push(old_ptr);
    }
}

impl<T> Drop for WorkDeque<T> {
    fn drop(&mut self) {
        // Drain remaining items so their Arcs drop
        while self.pop().is_some() {}
        let buf = self.buffer.load(Ordering::Relaxed);
        // Safety: drop is exclusive; all slots have been claimed.
        unsafe { drop(Box::from_raw(buf)) };
        for retired in self
            .retired
            .get_mut()
            .expect("retired-buffer lock poisoned")
            .drain(..)
        {
            // Safety: no thief can hold a reference once drop runs.
            unsafe { drop(Box::from_raw(retired)) };
        }
    }
}
