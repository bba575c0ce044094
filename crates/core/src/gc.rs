//! Garbage collector
//!
//! Tri-color tracing over a heap's allocation list, layered on top of the
//! refcount protocol in `value`:
//!
//! - Acyclic garbage dies by refcount (`release` destroys at the last
//!   reference) and leaves tombstone cells the sweep reclaims.
//! - Cycles die by trace: the sweep condemns white cells, discounts
//!   references that originate inside the condemned set, pins any white
//!   cell with references left over (an external retain: a message in some
//!   mailbox, a timer context) together with everything it reaches, and
//!   frees the rest. A freed cell therefore had no references beyond the
//!   condemned set and was unreachable from roots.
//!
//! Minor collections trace only the young generation, with the remembered
//! set (filtered through the card table) as extra roots; survivors count
//! collections and are promoted old past the heap's threshold. Full
//! collections trace everything and clear the remembered set and cards.
//!
//! Incremental mode splits a full collection into bounded bursts:
//! `start_incremental` seeds the gray list, `mark_increment` drains up to a
//! budget, `step` combines a marking burst with a bounded sweep, and
//! `complete` finishes synchronously. Cells allocated mid-cycle are born
//! black, and the write barrier re-grays white children stored into black
//! parents, so the cycle never frees a cell the mutator can still reach.

use std::collections::HashMap;
use std::sync::atomic::Ordering;

use crate::heap::Heap;
use crate::value::{
    GC_BLACK, GC_GRAY, GC_WHITE, Obj, ObjPayload, ObjRef, RC_FREEING, RC_SATURATED, Value, release,
};

/// Gray cells scanned per `step` marking burst by default
pub const DEFAULT_MARK_BUDGET: usize = 64;

/// Cells examined per `step` sweep burst by default
pub const DEFAULT_SWEEP_BUDGET: usize = 128;

/// Outcome of one collection, mostly for tests and diagnostics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollectResult {
    pub freed_objects: usize,
    pub freed_bytes: usize,
    pub survivors: usize,
    pub promoted: usize,
}

impl Heap {
    // =========================================================================
    // Marking
    // =========================================================================

    /// Push a root onto the gray frontier. In minor mode old cells are
    /// ignored; the remembered set stands in for them.
    pub fn mark_value(&mut self, v: Value, minor: bool) {
        let Value::Obj(r) = v else { return };
        let obj = r.as_obj();
        if obj.header.owner != self.id {
            // Foreign cells are the other heap's problem; the refcount the
            // holder owns keeps them alive.
            return;
        }
        if minor && obj.is_old() {
            return;
        }
        if obj.mark() == GC_WHITE {
            obj.set_mark(GC_GRAY);
            self.gray.push(r);
        }
    }

    /// Pop one gray cell, blacken it, and push its unmarked children.
    fn blacken_next(&mut self, minor: bool) -> bool {
        let Some(r) = self.gray.pop() else {
            return false;
        };
        let obj = r.as_obj();
        obj.set_mark(GC_BLACK);
        // Safety: marked cells are live; the worker driving this GC is the
        // only mutator of this heap.
        let mut children = Vec::new();
        unsafe { obj.payload() }.for_each_child(|c| children.push(c));
        for child in children {
            self.mark_value(child, minor);
        }
        true
    }

    fn mark_roots(&mut self, roots: &[Value], minor: bool) {
        for &v in roots {
            self.mark_value(v, minor);
        }
        if minor {
            // Remembered old cells reference young cells; trace through
            // them. Every remembered entry dirtied its card when the write
            // barrier recorded it, so the card filter is a cheap sanity
            // gate rather than a second source of truth.
            let remembered: Vec<ObjRef> = self
                .remembered
                .iter()
                .copied()
                .filter(|r| self.card_dirty(r.identity()))
                .collect();
            for r in remembered {
                let mut children = Vec::new();
                // Safety: remembered cells are old and alive.
                unsafe { r.as_obj().payload() }.for_each_child(|c| children.push(c));
                for child in children {
                    self.mark_value(child, minor);
                }
            }
        }
    }

    /// Drain up to `budget` gray cells; true when the frontier is empty.
    pub fn mark_increment(&mut self, budget: usize) -> bool {
        let minor = self.gc_minor;
        for _ in 0..budget {
            if !self.blacken_next(minor) {
                return true;
            }
        }
        self.gray.is_empty()
    }

    // =========================================================================
    // Collection entry points
    // =========================================================================

    /// Stop-the-world collection over both generations
    pub fn collect(&mut self, roots: &[Value]) -> CollectResult {
        self.gc_count += 1;
        self.run_cycle(roots, false, false)
    }

    /// Minor collection: young generation only, remembered set as roots
    pub fn collect_young(&mut self, roots: &[Value]) -> CollectResult {
        self.gc_count += 1;
        self.minor_gc_count += 1;
        self.run_cycle(roots, true, false)
    }

    /// Major collection: both generations, then clear the remembered set
    /// and card table
    pub fn collect_full(&mut self, roots: &[Value]) -> CollectResult {
        self.gc_count += 1;
        self.major_gc_count += 1;
        self.run_cycle(roots, false, true)
    }

    fn run_cycle(&mut self, roots: &[Value], minor: bool, clear_tables: bool) -> CollectResult {
        self.begin_cycle(roots, minor);
        while !self.mark_increment(usize::MAX) {}
        let result = self.sweep();
        self.finish_cycle(clear_tables);
        result
    }

    fn begin_cycle(&mut self, roots: &[Value], minor: bool) {
        debug_assert!(!self.gc_in_progress, "collection already in progress");
        self.gc_in_progress = true;
        self.gc_minor = minor;
        self.gray.clear();
        self.mark_roots(roots, minor);
    }

    fn finish_cycle(&mut self, clear_tables: bool) {
        if clear_tables {
            for r in std::mem::take(&mut self.remembered) {
                r.as_obj().set_remembered(false);
            }
            self.clear_cards();
        }
        self.gc_in_progress = false;
        self.gc_minor = false;
    }

    // =========================================================================
    // Incremental driving
    // =========================================================================

    /// Seed an incremental (full-mode) cycle from `roots`.
    pub fn start_incremental(&mut self, roots: &[Value]) {
        self.begin_cycle(roots, false);
    }

    /// One bounded burst: marking first, then sweeping once the frontier
    /// is empty. Returns true when the whole cycle is finished.
    pub fn step(&mut self, mark_budget: usize, sweep_budget: usize) -> bool {
        if !self.gc_in_progress {
            return true;
        }
        if !self.mark_increment(mark_budget) {
            return false;
        }
        if !self.sweep_started {
            self.sweep_begin();
        }
        if self.sweep_step(sweep_budget) {
            self.finish_cycle(true);
            return true;
        }
        false
    }

    /// One burst at the default budgets
    pub fn step_default(&mut self) -> bool {
        self.step(DEFAULT_MARK_BUDGET, DEFAULT_SWEEP_BUDGET)
    }

    /// Finish an in-progress incremental cycle synchronously.
    pub fn complete(&mut self) {
        while self.gc_in_progress {
            self.step(usize::MAX, usize::MAX);
        }
    }

    // =========================================================================
    // Sweep
    // =========================================================================

    /// Full sweep: pin analysis plus an unbounded reclaim pass.
    fn sweep(&mut self) -> CollectResult {
        self.sweep_begin();
        let mut total = CollectResult::default();
        loop {
            let (result, done) = self.sweep_chunk(usize::MAX);
            total.freed_objects += result.freed_objects;
            total.freed_bytes += result.freed_bytes;
            total.survivors += result.survivors;
            total.promoted += result.promoted;
            if done {
                break;
            }
        }
        total
    }

    /// Decide which white cells die. References originating from other
    /// condemned cells are discounted; whites with references left over
    /// are externally retained and get re-marked black along with
    /// everything they reach.
    fn sweep_begin(&mut self) {
        debug_assert!(self.gray.is_empty(), "sweep before marking finished");
        let minor = self.gc_minor;

        // Candidate set: white, same generation scope, not a tombstone.
        let mut external: HashMap<usize, u64> = HashMap::new();
        let mut candidates: Vec<ObjRef> = Vec::new();
        let mut p = self.head;
        while !p.is_null() {
            // Safety: walking our own allocation list.
            let obj = unsafe { &*p };
            let next = obj.header.next.load(Ordering::Relaxed);
            if self.condemnable(obj, minor) {
                let rc = obj.refcount();
                if rc != RC_FREEING && rc != RC_SATURATED {
                    external.insert(p as usize, u64::from(rc));
                    candidates.push(ObjRef(p));
                }
            }
            p = next;
        }

        // Discount references held by other candidates.
        for &r in &candidates {
            // Safety: candidates are live cells on our list.
            unsafe { r.as_obj().payload() }.for_each_child(|c| {
                if let Value::Obj(cr) = c {
                    if let Some(n) = external.get_mut(&(cr.0 as usize)) {
                        *n = n.saturating_sub(1);
                    }
                }
            });
        }

        // Whites with external references are pinned; so is everything
        // they reach. Re-use the gray machinery to blacken those subgraphs.
        for &r in &candidates {
            if external.get(&(r.0 as usize)).copied().unwrap_or(0) > 0
                && r.as_obj().mark() == GC_WHITE
            {
                r.as_obj().set_mark(GC_GRAY);
                self.gray.push(r);
            }
        }
        while self.blacken_next(minor) {}

        // Detach every payload in the condemned set before any cell is
        // deallocated: condemned cells may reference each other, and a
        // payload walk must never chase a pointer into freed memory.
        for &r in &candidates {
            if r.as_obj().mark() == GC_WHITE {
                self.detach_condemned(r.0);
            }
        }

        self.sweep_started = true;
        self.sweep_prev = std::ptr::null_mut();
        self.sweep_cursor = self.head;
    }

    /// Whether a cell is in scope for condemnation this cycle
    fn condemnable(&self, obj: &Obj, minor: bool) -> bool {
        obj.mark() == GC_WHITE && !(minor && obj.is_old())
    }

    /// Reclaim up to `budget` cells; true when the list walk is done.
    fn sweep_step(&mut self, budget: usize) -> bool {
        let (_, done) = self.sweep_chunk(budget);
        done
    }

    fn sweep_chunk(&mut self, budget: usize) -> (CollectResult, bool) {
        let minor = self.gc_minor;
        let mut result = CollectResult::default();
        let mut examined = 0usize;

        while examined < budget {
            let p = self.sweep_cursor;
            if p.is_null() {
                self.sweep_started = false;
                return (result, true);
            }
            examined += 1;
            // Safety: only the owning worker mutates this list.
            let obj = unsafe { &*p };
            let next = obj.header.next.load(Ordering::Relaxed);

            // Everything freeable is a tombstone by now: refcount deaths
            // from the mutator, plus the condemned set detached in
            // sweep_begin.
            if obj.refcount() == RC_FREEING {
                let bytes = obj.header.bytes.load(Ordering::Relaxed) as usize;
                self.bytes_allocated = self.bytes_allocated.saturating_sub(bytes);
                self.objects_allocated = self.objects_allocated.saturating_sub(1);
                result.freed_objects += 1;
                result.freed_bytes += bytes;
                // Unlink and deallocate
                if self.sweep_prev.is_null() {
                    self.head = next;
                } else {
                    // Safety: prev is a live cell we already passed.
                    unsafe { (*self.sweep_prev).header.next.store(next, Ordering::Relaxed) };
                }
                // Safety: unlinked; no references remain.
                drop(unsafe { Box::from_raw(p) });
            } else {
                // Survivor: reset mark, age in minor cycles
                if obj.mark() != GC_WHITE {
                    obj.set_mark(GC_WHITE);
                    result.survivors += 1;
                    if minor && !obj.is_old() {
                        let survivals = obj.bump_survivals();
                        if survivals > self.promotion_threshold {
                            obj.promote_old();
                            result.promoted += 1;
                        }
                    }
                } else {
                    // White but out of scope (old cell in a minor cycle)
                    result.survivors += 1;
                }
                self.sweep_prev = p;
            }
            self.sweep_cursor = next;
        }
        (result, false)
    }

    /// Detach a condemned cell's payload, releasing only the edges that
    /// leave the condemned set: white same-heap in-scope children die in
    /// this same sweep, so decrementing them again would double-count.
    /// The cell becomes a tombstone for the reclaim walk.
    fn detach_condemned(&mut self, p: *mut Obj) {
        let minor = self.gc_minor;
        // Safety: p is condemned, unreachable, and externally unreferenced.
        let obj = unsafe { &*p };
        obj.header.refcount.store(RC_FREEING, Ordering::Release);
        let payload = std::mem::replace(unsafe { obj.payload_mut() }, ObjPayload::Freed);
        let heap_id = self.id;
        payload.for_each_child(|child| {
            if let Value::Obj(cr) = child {
                let cobj = cr.as_obj();
                // A white same-heap in-scope child is itself condemned
                // (pinned whites were blackened before detaching began).
                let dies_here = cobj.header.owner == heap_id && self.condemnable(cobj, minor);
                if !dies_here {
                    release(child);
                }
            }
        });
        drop(payload);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::DEFAULT_MAX_HEAP;
    use crate::strings::BlocString;
    use crate::value::{retain, ValueKind};

    fn test_heap() -> Heap {
        Heap::new(DEFAULT_MAX_HEAP)
    }

    fn alloc_str(heap: &mut Heap, s: &str) -> Value {
        heap.alloc(ObjPayload::Str(BlocString::new(s)))
    }

    #[test]
    fn test_collect_frees_released_keeps_retained() {
        let mut heap = test_heap();
        let a = alloc_str(&mut heap, "a");
        let b = alloc_str(&mut heap, "b");
        let c = alloc_str(&mut heap, "c");
        assert_eq!(heap.stats().objects_allocated, 3);

        release(a);
        release(b);
        assert!(retain(c));

        let result = heap.collect(&[]);
        assert_eq!(result.freed_objects, 2);
        assert_eq!(heap.stats().objects_allocated, 1);
        assert_eq!(c.as_str(), Some("c"));
        release(c);
        release(c);
    }

    #[test]
    fn test_rooted_value_survives() {
        let mut heap = test_heap();
        let v = alloc_str(&mut heap, "rooted");
        let result = heap.collect(&[v]);
        assert_eq!(result.freed_objects, 0);
        assert_eq!(result.survivors, 1);
        assert_eq!(v.as_str(), Some("rooted"));
    }

    #[test]
    fn test_cycle_is_collected() {
        let mut heap = test_heap();
        // a -> b -> a, then drop the external references
        let a = heap.alloc(ObjPayload::Array(Vec::new()));
        let b = heap.alloc(ObjPayload::Array(Vec::new()));
        assert!(retain(b));
        // Safety: exclusively owned fresh cells
        unsafe {
            let a_obj = a.obj().unwrap();
            let ObjPayload::Array(items) = a_obj.as_obj().payload_mut() else {
                unreachable!()
            };
            items.push(b);
        }
        assert!(retain(a));
        unsafe {
            let b_obj = b.obj().unwrap();
            let ObjPayload::Array(items) = b_obj.as_obj().payload_mut() else {
                unreachable!()
            };
            items.push(a);
        }
        // Drop creator references; only the cycle's internal edges remain
        release(a);
        release(b);
        assert_eq!(heap.stats().objects_allocated, 2);

        let result = heap.collect(&[]);
        assert_eq!(result.freed_objects, 2);
        assert_eq!(heap.stats().objects_allocated, 0);
    }

    #[test]
    fn test_external_retain_pins_unreachable_value() {
        let mut heap = test_heap();
        // A value sitting in some mailbox: not in the root set, but its
        // refcount is owned by the mailbox.
        let msg = alloc_str(&mut heap, "in-flight message");
        let result = heap.collect(&[]);
        assert_eq!(result.freed_objects, 0);
        assert_eq!(msg.as_str(), Some("in-flight message"));
        release(msg);
        let result = heap.collect(&[]);
        assert_eq!(result.freed_objects, 1);
    }

    #[test]
    fn test_pinned_cell_keeps_its_children() {
        let mut heap = test_heap();
        let child = alloc_str(&mut heap, "payload");
        let parent = heap.alloc(ObjPayload::Opt(Some(child)));
        // parent's creator reference is the external pin (e.g. a timer ctx)
        let result = heap.collect(&[]);
        assert_eq!(result.freed_objects, 0);
        assert_eq!(parent.kind(), ValueKind::Option);
        assert_eq!(child.as_str(), Some("payload"));
        release(parent);
    }

    #[test]
    fn test_minor_skips_old_traces_remembered() {
        let mut heap = test_heap();
        let old_parent = heap.alloc(ObjPayload::Array(Vec::new()));
        old_parent.obj().unwrap().as_obj().promote_old();
        let young = alloc_str(&mut heap, "young child");
        // Store young into old, barrier records the edge
        unsafe {
            let old_parent_obj = old_parent.obj().unwrap();
            let ObjPayload::Array(items) = old_parent_obj.as_obj().payload_mut() else {
                unreachable!()
            };
            items.push(young);
        }
        heap.write_barrier(old_parent.obj().unwrap(), young);

        // Young child is not in the roots; the remembered set carries it
        let result = heap.collect_young(&[]);
        assert_eq!(result.freed_objects, 0);
        assert_eq!(young.as_str(), Some("young child"));
        release(old_parent);
    }

    #[test]
    fn test_promotion_after_surviving_minors() {
        let mut heap = test_heap();
        let v = alloc_str(&mut heap, "long-lived");
        let threshold = heap.promotion_threshold;
        for _ in 0..=threshold {
            heap.collect_young(&[v]);
        }
        assert!(v.obj().unwrap().as_obj().is_old());
        release(v);
    }

    #[test]
    fn test_full_collect_clears_tables() {
        let mut heap = test_heap();
        let parent = heap.alloc(ObjPayload::Array(Vec::new()));
        parent.obj().unwrap().as_obj().promote_old();
        let child = alloc_str(&mut heap, "c");
        unsafe {
            let parent_obj = parent.obj().unwrap();
            let ObjPayload::Array(items) = parent_obj.as_obj().payload_mut() else {
                unreachable!()
            };
            items.push(child);
        }
        heap.write_barrier(parent.obj().unwrap(), child);
        assert!(!heap.remembered.is_empty());

        heap.collect_full(&[parent]);
        assert!(heap.remembered.is_empty());
        assert!(!parent.obj().unwrap().as_obj().is_remembered());
        release(parent);
    }

    #[test]
    fn test_incremental_matches_stop_the_world() {
        let mut heap = test_heap();
        let keep = alloc_str(&mut heap, "keep");
        for i in 0..50 {
            let v = alloc_str(&mut heap, &format!("garbage {i}"));
            release(v);
        }
        heap.start_incremental(&[keep]);
        let mut steps = 0;
        while !heap.step_default() {
            steps += 1;
            assert!(steps < 1_000, "incremental cycle did not terminate");
        }
        assert_eq!(heap.stats().objects_allocated, 1);
        assert_eq!(keep.as_str(), Some("keep"));
    }

    #[test]
    fn test_alloc_during_incremental_survives() {
        let mut heap = test_heap();
        heap.start_incremental(&[]);
        // Born mid-cycle: black, must survive this cycle even unrooted
        let v = alloc_str(&mut heap, "newborn");
        heap.complete();
        assert_eq!(v.as_str(), Some("newborn"));
        release(v);
    }

    #[test]
    fn test_gc_counters() {
        let mut heap = test_heap();
        heap.collect(&[]);
        heap.collect_young(&[]);
        heap.collect_full(&[]);
        let stats = heap.stats();
        assert_eq!(stats.gc_count, 3);
        assert_eq!(stats.minor_gc_count, 1);
        assert_eq!(stats.major_gc_count, 1);
    }
}
