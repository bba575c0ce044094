//! Heap - Per-Block Allocation Domain
//!
//! Each block owns one heap. Cells are threaded on a singly linked
//! allocation list through their header; the collector in `gc` walks that
//! list. The heap also owns the generational machinery: the remembered set
//! and card table fed by the write barrier, and the promotion threshold.
//!
//! ## Current heap
//!
//! Container mutation needs the owning heap (for COW clones and the write
//! barrier) without threading a heap handle through every operation, so the
//! worker installs the running block's heap in a thread-local holder before
//! dispatching a slice. `heap::with` reaches it; the guard restores the
//! previous holder on drop so nested drivers (tests, single-threaded mode)
//! compose.

use std::cell::Cell;
use std::ptr;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::value::{GC_BLACK, GC_GRAY, GC_WHITE, Obj, ObjPayload, ObjRef, Value};

/// Number of cards in the dirty map; addresses hash into this table
pub const CARD_COUNT: usize = 256;

/// Card granule: 512-byte address ranges share a card
const CARD_SHIFT: usize = 9;

/// Collection triggers when allocated bytes exceed this fraction of the cap
const GC_TRIGGER_NUM: usize = 3;
const GC_TRIGGER_DEN: usize = 4;

/// Default heap cap in bytes
pub const DEFAULT_MAX_HEAP: usize = 64 * 1024 * 1024;

/// Minor collections survived before promotion to the old generation
pub const DEFAULT_PROMOTION_THRESHOLD: u8 = 2;

static NEXT_HEAP_ID: AtomicU32 = AtomicU32::new(1);

/// Snapshot of heap counters
#[derive(Debug, Clone, Copy, Default)]
pub struct HeapStats {
    pub bytes_allocated: usize,
    pub objects_allocated: usize,
    pub gc_count: u64,
    pub minor_gc_count: u64,
    pub major_gc_count: u64,
}

/// Per-block heap: allocation list + generational bookkeeping
pub struct Heap {
    /// Nonzero id stamped into every cell this heap allocates
    pub(crate) id: u32,
    /// Head of the intrusive allocation list
    pub(crate) head: *mut Obj,
    pub max_heap_size: usize,
    pub(crate) bytes_allocated: usize,
    pub(crate) objects_allocated: usize,
    pub(crate) gc_count: u64,
    pub(crate) minor_gc_count: u64,
    pub(crate) major_gc_count: u64,
    /// Old cells known to reference young cells; extra minor-GC roots
    pub(crate) remembered: Vec<ObjRef>,
    /// Coarse dirty map over cell addresses, set by the write barrier
    pub(crate) cards: [bool; CARD_COUNT],
    pub generational_enabled: bool,
    pub(crate) gc_in_progress: bool,
    /// Whether the in-progress cycle is minor (young generation only)
    pub(crate) gc_minor: bool,
    /// Tracing frontier: discovered but not yet scanned
    pub(crate) gray: Vec<ObjRef>,
    pub promotion_threshold: u8,
    // Resumable sweep cursor for incremental stepping
    pub(crate) sweep_started: bool,
    pub(crate) sweep_prev: *mut Obj,
    pub(crate) sweep_cursor: *mut Obj,
}

// Safety: a heap is owned by exactly one block and only touched by the
// worker currently holding that block (enforced by the RUNNING state
// transition). It moves between workers, never shared.
unsafe impl Send for Heap {}

impl Heap {
    pub fn new(max_heap_size: usize) -> Self {
        Self {
            id: NEXT_HEAP_ID.fetch_add(1, Ordering::Relaxed),
            head: ptr::null_mut(),
            max_heap_size,
            bytes_allocated: 0,
            objects_allocated: 0,
            gc_count: 0,
            minor_gc_count: 0,
            major_gc_count: 0,
            remembered: Vec::new(),
            cards: [false; CARD_COUNT],
            generational_enabled: true,
            gc_in_progress: false,
            gc_minor: false,
            gray: Vec::new(),
            promotion_threshold: DEFAULT_PROMOTION_THRESHOLD,
            sweep_started: false,
            sweep_prev: ptr::null_mut(),
            sweep_cursor: ptr::null_mut(),
        }
    }

    #[inline]
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn stats(&self) -> HeapStats {
        HeapStats {
            bytes_allocated: self.bytes_allocated,
            objects_allocated: self.objects_allocated,
            gc_count: self.gc_count,
            minor_gc_count: self.minor_gc_count,
            major_gc_count: self.major_gc_count,
        }
    }

    /// Allocate a fresh cell on this heap. Refcount 1, young, white.
    ///
    /// During the marking phase of an in-progress collection the cell is
    /// born black so the cycle cannot miss it; once the sweep has started
    /// it is born white instead (the sweep only reclaims tombstones, and a
    /// cell born black after the cursor passed it would keep its mark into
    /// the next cycle and never be collected).
    pub fn alloc(&mut self, payload: ObjPayload) -> Value {
        let footprint = payload.footprint();
        let boxed = Obj::new(payload, self.id);
        if self.gc_in_progress && !self.sweep_started {
            boxed.set_mark(GC_BLACK);
        }
        boxed
            .header
            .bytes
            .store(footprint.min(u32::MAX as usize) as u32, Ordering::Relaxed);
        let raw = Box::into_raw(boxed);
        // Thread onto the allocation list
        // Safety: raw was just minted and is exclusively ours.
        unsafe { (*raw).header.next.store(self.head, Ordering::Relaxed) };
        self.head = raw;
        self.bytes_allocated += footprint;
        self.objects_allocated += 1;
        Value::Obj(ObjRef(raw))
    }

    /// Allocate, first collecting if the heap has crossed its trigger.
    /// `roots` are the caller's strong roots for the collection.
    pub fn alloc_with_gc(&mut self, payload: ObjPayload, roots: &[Value]) -> Value {
        if self.needs_gc() {
            self.collect(roots);
        }
        self.alloc(payload)
    }

    /// Whether allocated bytes have crossed the collection trigger
    #[inline]
    pub fn needs_gc(&self) -> bool {
        self.bytes_allocated * GC_TRIGGER_DEN > self.max_heap_size * GC_TRIGGER_NUM
    }

    /// Re-account a cell whose payload grew or shrank (array push, map
    /// insert). Keeps `bytes_allocated` tracking live footprint.
    pub fn recharge(&mut self, r: ObjRef) {
        let obj = r.as_obj();
        if obj.header.owner != self.id {
            return;
        }
        // Safety: caller holds a live reference.
        let new = unsafe { obj.payload() }.footprint();
        let old = obj.header.bytes.load(Ordering::Relaxed) as usize;
        obj.header
            .bytes
            .store(new.min(u32::MAX as usize) as u32, Ordering::Relaxed);
        self.bytes_allocated = (self.bytes_allocated + new).saturating_sub(old);
    }

    #[inline]
    fn card_index(addr: usize) -> usize {
        (addr >> CARD_SHIFT) & (CARD_COUNT - 1)
    }

    /// Record an old→young edge.
    ///
    /// No-op when generational mode is off or the parent is young. Sets the
    /// parent's remembered bit (idempotent), appends it to the remembered
    /// set, and dirties the card covering the parent's address. During the
    /// marking phase of an incremental cycle it additionally grays a white
    /// child stored into a black parent, preserving the tri-color
    /// invariant; once the sweep has begun the condemned set is fixed and
    /// no shading is needed.
    pub fn write_barrier(&mut self, parent: ObjRef, child: Value) {
        let Value::Obj(child_ref) = child else { return };
        if self.gc_in_progress
            && !self.sweep_started
            && parent.as_obj().mark() == GC_BLACK
            && child_ref.as_obj().mark() == GC_WHITE
            && child_ref.as_obj().header.owner == self.id
        {
            child_ref.as_obj().set_mark(GC_GRAY);
            self.gray.push(child_ref);
        }
        if !self.generational_enabled {
            return;
        }
        let pobj = parent.as_obj();
        if !pobj.is_old() || child_ref.as_obj().is_old() {
            return;
        }
        if !pobj.is_remembered() {
            pobj.set_remembered(true);
            self.remembered.push(parent);
        }
        self.cards[Self::card_index(parent.identity())] = true;
    }

    /// Whether the card covering `addr` is dirty
    pub fn card_dirty(&self, addr: usize) -> bool {
        self.cards[Self::card_index(addr)]
    }

    pub(crate) fn clear_cards(&mut self) {
        self.cards = [false; CARD_COUNT];
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        // Reclaim every remaining cell, touching ONLY this heap's list.
        // Children are not released: same-heap children die in this same
        // pass, and foreign children must not be chased because their
        // owning heap may already be gone (teardown order across blocks is
        // arbitrary). A foreign cell kept alive by a stale count is freed
        // by its own heap's drop.
        let mut p = self.head;
        while !p.is_null() {
            // Safety: the list is exclusively ours during drop.
            let next = unsafe { (*p).header.next.load(Ordering::Relaxed) };
            unsafe {
                let cell = &*p;
                let payload = std::mem::replace(cell.payload_mut(), ObjPayload::Freed);
                drop(payload);
                drop(Box::from_raw(p));
            }
            p = next;
        }
        self.head = ptr::null_mut();
    }
}

// =============================================================================
// Current heap (thread-local holder)
// =============================================================================

thread_local! {
    static CURRENT_HEAP: Cell<*mut Heap> = const { Cell::new(ptr::null_mut()) };
}

/// Guard restoring the previously installed heap on drop
pub struct HeapGuard {
    previous: *mut Heap,
}

impl Drop for HeapGuard {
    fn drop(&mut self) {
        CURRENT_HEAP.with(|c| c.set(self.previous));
    }
}

/// Install `heap` as the thread's current heap for the duration of the
/// returned guard. Workers call this when mounting a block.
pub fn install(heap: &mut Heap) -> HeapGuard {
    let previous = CURRENT_HEAP.with(|c| c.replace(heap as *mut Heap));
    HeapGuard { previous }
}

/// Run `f` against the thread's current heap. `None` if no heap is
/// installed (no block is mounted on this thread).
pub fn with<R>(f: impl FnOnce(&mut Heap) -> R) -> Option<R> {
    let p = CURRENT_HEAP.with(Cell::get);
    if p.is_null() {
        return None;
    }
    // Safety: the pointer was installed from a live &mut Heap by the worker
    // currently dispatching on this thread; `with` calls do not nest across
    // a second install of the same heap.
    Some(f(unsafe { &mut *p }))
}
