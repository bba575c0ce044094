//! Block - An Isolated Lightweight Process
//!
//! A block owns one VM, one heap, and one mailbox. The scheduler shares
//! blocks across worker threads behind `Arc`, so everything mutated
//! concurrently is atomic (state, capabilities, counters) or behind its
//! own lock (links, monitors, exit record). The VM and heap live in an
//! `UnsafeCell` touched only by the worker currently holding the block.
//!
//! ## Lifecycle
//!
//! ```text
//!           spawn
//!              │
//!              ▼
//!          RUNNABLE ◄──── yield / message arrival
//!            │  ▲
//!   dispatch │  │ re-enqueue
//!            ▼  │
//!          RUNNING ───► WAITING ── msg/timer ──► RUNNABLE
//!            │
//!            ▼
//!            exit/crash/kill
//!              │
//!              ▼
//!            DEAD (terminal; exit propagation fires once)
//! ```
//!
//! Only the worker holding a block moves it out of RUNNING to another live
//! state; RUNNABLE↔WAITING and any-live→DEAD go through CAS, so a kill
//! races cleanly with the owning worker.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bloc_core::chunk::Bytecode;
use bloc_core::heap::{self, DEFAULT_MAX_HEAP, Heap, HeapStats};
use bloc_core::value::{Value, mark_shared, release, retain};

use crate::caps::CapSet;
use crate::mailbox::{Mailbox, Message};
use crate::vm::{RunResult, Vm};

/// Reserved invalid PID
pub const PID_INVALID: u64 = 0;

/// Lifecycle states; the atomic state byte holds one of these
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    Runnable = 0,
    Running = 1,
    Waiting = 2,
    Dead = 3,
}

impl BlockState {
    fn from_u8(raw: u8) -> BlockState {
        match raw {
            0 => BlockState::Runnable,
            1 => BlockState::Running,
            2 => BlockState::Waiting,
            _ => BlockState::Dead,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            BlockState::Runnable => "RUNNABLE",
            BlockState::Running => "RUNNING",
            BlockState::Waiting => "WAITING",
            BlockState::Dead => "DEAD",
        }
    }
}

/// Per-block resource limits
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub max_heap_size: usize,
    pub max_stack_depth: usize,
    pub max_call_depth: usize,
    pub max_reductions: u32,
    pub max_mailbox_size: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_heap_size: DEFAULT_MAX_HEAP,
            max_stack_depth: 4096,
            max_call_depth: 256,
            max_reductions: 2000,
            max_mailbox_size: 1024,
        }
    }
}

/// Lifetime counters, all monotone
#[derive(Debug, Default)]
pub struct Counters {
    pub reductions: AtomicU64,
    pub gc_collections: AtomicU64,
    pub messages_sent: AtomicU64,
    pub messages_received: AtomicU64,
}

/// Populated exactly once, at the transition to DEAD
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: i32,
    pub reason: Option<String>,
}

impl ExitInfo {
    pub fn is_abnormal(&self) -> bool {
        self.code != 0 || self.reason.is_some()
    }
}

/// Outcome of a send attempt (see `Block::send`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Enqueued; the receiver was already runnable or running
    Queued,
    /// Enqueued, and this send moved the block WAITING → RUNNABLE; the
    /// caller must put it back on a run queue
    QueuedNeedsWake,
    /// Target is dead
    Dead,
    /// Mailbox at capacity
    Full,
}

/// Execution state owned exclusively by the worker holding the block
pub(crate) struct BlockInner {
    pub vm: Vm,
    pub heap: Heap,
    pub bytecode: Option<Arc<Bytecode>>,
}

/// An isolated lightweight process
pub struct Block {
    pid: u64,
    name: Option<String>,
    state: AtomicU8,
    kill_requested: AtomicBool,
    caps: AtomicU32,
    pub limits: Limits,
    pub counters: Counters,
    pub mailbox: Mailbox,
    links: Mutex<Vec<u64>>,
    monitors: Mutex<Vec<u64>>,
    monitored_by: Mutex<Vec<u64>>,
    parent: AtomicU64,
    supervisor: AtomicU64,
    exit: Mutex<Option<ExitInfo>>,
    inner: UnsafeCell<BlockInner>,
}

// Safety: all shared fields are atomics or behind locks. `inner` (VM,
// heap, loaded bytecode) is only touched by the worker that won the
// RUNNABLE→RUNNING transition, which serializes access; blocks are never
// run by two workers at once.
unsafe impl Send for Block {}
unsafe impl Sync for Block {}

impl Block {
    pub fn new(pid: u64, name: Option<&str>, limits: Limits) -> Self {
        Self {
            pid,
            name: name.map(str::to_string),
            state: AtomicU8::new(BlockState::Runnable as u8),
            kill_requested: AtomicBool::new(false),
            caps: AtomicU32::new(CapSet::empty().bits()),
            limits,
            counters: Counters::default(),
            mailbox: Mailbox::new(limits.max_mailbox_size),
            links: Mutex::new(Vec::new()),
            monitors: Mutex::new(Vec::new()),
            monitored_by: Mutex::new(Vec::new()),
            parent: AtomicU64::new(PID_INVALID),
            supervisor: AtomicU64::new(PID_INVALID),
            exit: Mutex::new(None),
            inner: UnsafeCell::new(BlockInner {
                vm: Vm::new(),
                heap: Heap::new(limits.max_heap_size),
                bytecode: None,
            }),
        }
    }

    #[inline]
    pub fn pid(&self) -> u64 {
        self.pid
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn parent(&self) -> u64 {
        self.parent.load(Ordering::Acquire)
    }

    pub fn set_parent(&self, pid: u64) {
        self.parent.store(pid, Ordering::Release);
    }

    pub fn supervisor(&self) -> Option<u64> {
        match self.supervisor.load(Ordering::Acquire) {
            PID_INVALID => None,
            pid => Some(pid),
        }
    }

    pub fn set_supervisor(&self, pid: u64) {
        self.supervisor.store(pid, Ordering::Release);
    }

    // =========================================================================
    // State machine
    // =========================================================================

    #[inline]
    pub fn state(&self) -> BlockState {
        BlockState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_alive(&self) -> bool {
        self.state() != BlockState::Dead
    }

    fn cas_state(&self, from: BlockState, to: BlockState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Dispatch: claim the block for a worker. Pairing this CAS with the
    /// deque pop is what guarantees no two workers run the same block.
    pub fn try_start_running(&self) -> bool {
        self.cas_state(BlockState::Runnable, BlockState::Running)
    }

    /// The holding worker re-queues the block after a yield
    pub fn finish_slice_runnable(&self) -> bool {
        self.cas_state(BlockState::Running, BlockState::Runnable)
    }

    /// The holding worker parks the block on an empty mailbox
    pub fn finish_slice_waiting(&self) -> bool {
        self.cas_state(BlockState::Running, BlockState::Waiting)
    }

    /// Message arrival or timer expiry makes a parked block runnable
    pub fn wake_from_waiting(&self) -> bool {
        self.cas_state(BlockState::Waiting, BlockState::Runnable)
    }

    fn record_exit(&self, code: i32, reason: Option<&str>) {
        let mut exit = self
            .exit
            .lock()
            .expect("exit lock poisoned - termination panicked");
        debug_assert!(exit.is_none(), "exit info set twice");
        *exit = Some(ExitInfo {
            code,
            reason: reason.map(str::to_string),
        });
    }

    /// Terminate from any live state, including RUNNING. Owner-side: the
    /// holding worker (or a caller that knows no worker holds the block)
    /// uses this. Records the exit info exactly once; a second
    /// termination is a no-op returning false.
    pub fn terminate(&self, code: i32, reason: Option<&str>) -> bool {
        loop {
            let current = self.state();
            if current == BlockState::Dead {
                return false;
            }
            if self.cas_state(current, BlockState::Dead) {
                self.record_exit(code, reason);
                return true;
            }
        }
    }

    /// Terminate from another thread. Only RUNNABLE and WAITING blocks
    /// transition here; a RUNNING block is left to its kill flag (its
    /// worker observes it at the next reduction checkpoint and completes
    /// the termination), so no remote thread ever touches the VM or heap
    /// of a block mid-slice. False when no transition happened here.
    pub fn terminate_remote(&self, code: i32, reason: Option<&str>) -> bool {
        loop {
            match self.state() {
                BlockState::Dead | BlockState::Running => return false,
                current => {
                    if self.cas_state(current, BlockState::Dead) {
                        self.record_exit(code, reason);
                        return true;
                    }
                }
            }
        }
    }

    /// Normal exit
    pub fn exit(&self, code: i32) -> bool {
        self.terminate(code, None)
    }

    /// Crash with a reason; exit code is nonzero by definition
    pub fn crash(&self, reason: &str) -> bool {
        self.terminate(1, Some(reason))
    }

    /// Ask a running block to die at its next reduction checkpoint
    pub fn request_kill(&self) {
        self.kill_requested.store(true, Ordering::Release);
    }

    pub fn kill_requested(&self) -> bool {
        self.kill_requested.load(Ordering::Acquire)
    }

    pub fn exit_info(&self) -> Option<ExitInfo> {
        self.exit
            .lock()
            .expect("exit lock poisoned - termination panicked")
            .clone()
    }

    // =========================================================================
    // Capabilities
    // =========================================================================

    pub fn caps(&self) -> CapSet {
        CapSet::from_bits_truncate(self.caps.load(Ordering::Acquire))
    }

    /// Idempotent grant
    pub fn grant(&self, caps: CapSet) {
        self.caps.fetch_or(caps.bits(), Ordering::AcqRel);
    }

    /// Idempotent revoke
    pub fn revoke(&self, caps: CapSet) {
        self.caps.fetch_and(!caps.bits(), Ordering::AcqRel);
    }

    /// True iff every bit of `caps` is present. On false the block crashes
    /// with the standard denial reason; the caller still decides what to
    /// do with the slice.
    pub fn check_cap(&self, caps: CapSet) -> bool {
        if self.caps().contains(caps) {
            return true;
        }
        self.crash(&format!("capability denied: {}", caps.name()));
        false
    }

    // =========================================================================
    // Links and monitors
    // =========================================================================

    fn add_unique(set: &Mutex<Vec<u64>>, pid: u64) {
        let mut guard = set.lock().expect("link set lock poisoned");
        if !guard.contains(&pid) {
            guard.push(pid);
        }
    }

    fn remove_from(set: &Mutex<Vec<u64>>, pid: u64) {
        let mut guard = set.lock().expect("link set lock poisoned");
        guard.retain(|&p| p != pid);
    }

    /// Record this block's half of a bidirectional link; the scheduler
    /// performs the reciprocal update on the target.
    pub fn add_link(&self, pid: u64) {
        Self::add_unique(&self.links, pid);
    }

    pub fn remove_link(&self, pid: u64) {
        Self::remove_from(&self.links, pid);
    }

    pub fn links(&self) -> Vec<u64> {
        self.links.lock().expect("link set lock poisoned").clone()
    }

    /// This block observes `pid` (unidirectional)
    pub fn add_monitor(&self, pid: u64) {
        Self::add_unique(&self.monitors, pid);
    }

    pub fn remove_monitor(&self, pid: u64) {
        Self::remove_from(&self.monitors, pid);
    }

    pub fn monitors(&self) -> Vec<u64> {
        self.monitors.lock().expect("link set lock poisoned").clone()
    }

    /// `pid` observes this block
    pub fn add_monitored_by(&self, pid: u64) {
        Self::add_unique(&self.monitored_by, pid);
    }

    pub fn remove_monitored_by(&self, pid: u64) {
        Self::remove_from(&self.monitored_by, pid);
    }

    pub fn monitored_by(&self) -> Vec<u64> {
        self.monitored_by
            .lock()
            .expect("link set lock poisoned")
            .clone()
    }

    // =========================================================================
    // Messaging
    // =========================================================================

    /// Deliver a message to this block. Retains the value and marks its
    /// graph copy-on-write shared; `messages_received` counts lifetime
    /// deliveries (incremented on enqueue, never decremented).
    pub fn send(&self, sender: u64, value: Value) -> SendOutcome {
        if !self.is_alive() {
            return SendOutcome::Dead;
        }
        if !retain(value) {
            return SendOutcome::Dead;
        }
        mark_shared(value);
        if !self.mailbox.push(Message { sender, value }) {
            release(value);
            return SendOutcome::Full;
        }
        self.counters.messages_received.fetch_add(1, Ordering::Release);
        if self.wake_from_waiting() {
            SendOutcome::QueuedNeedsWake
        } else {
            SendOutcome::Queued
        }
    }

    pub fn has_messages(&self) -> bool {
        !self.mailbox.is_empty()
    }

    // =========================================================================
    // Execution (owning worker only)
    // =========================================================================

    /// Load the program. Called once before the first slice.
    pub fn load_bytecode(&self, bytecode: Arc<Bytecode>) {
        // Safety: called before the block is first dispatched (or by the
        // holding worker); no concurrent access to inner.
        unsafe { (*self.inner.get()).bytecode = Some(bytecode) };
    }

    /// Run one reduction-bounded slice on the calling worker's thread.
    ///
    /// The caller must have won `try_start_running`. Installs the block's
    /// heap as the thread's current heap for the duration.
    pub fn run_slice(&self) -> RunResult {
        debug_assert!(
            self.state() == BlockState::Running || self.state() == BlockState::Dead,
            "slice without RUNNING claim"
        );
        // Safety: the RUNNING claim serializes access to inner.
        let inner = unsafe { &mut *self.inner.get() };
        let Some(bytecode) = inner.bytecode.clone() else {
            return RunResult::Halted;
        };
        let _heap_guard = heap::install(&mut inner.heap);
        inner.vm.reductions = 0;
        inner.vm.reduction_limit = self.limits.max_reductions;
        let result = inner
            .vm
            .run(&bytecode, &self.mailbox, &self.kill_requested, &self.limits);
        self.counters
            .reductions
            .fetch_add(u64::from(inner.vm.reductions), Ordering::Release);
        self.counters
            .gc_collections
            .store(inner.heap.stats().gc_count, Ordering::Release);
        result
    }

    /// Reductions consumed by the most recent slice
    pub fn last_slice_reductions(&self) -> u32 {
        // Safety: read by the worker that just ran the slice.
        unsafe { (*self.inner.get()).vm.reductions }
    }

    /// Heap counters; meaningful only from the holding worker or after
    /// the block is dead.
    pub fn heap_stats(&self) -> HeapStats {
        // Safety: see above.
        unsafe { (*self.inner.get()).heap.stats() }
    }

    /// Top of the operand stack, for tests inspecting a finished block
    pub fn stack_top(&self) -> Option<Value> {
        // Safety: see above.
        unsafe { (*self.inner.get()).vm.top() }
    }

    /// Scheduler-teardown hook: drain the mailbox and release all VM
    /// state. Must run for every block before any block is dropped, while
    /// every heap is still alive, because mailbox and stack slots may
    /// reference cells owned by other blocks' heaps.
    pub(crate) fn clear_execution_state(&self) {
        while let Some(msg) = self.mailbox.pop() {
            release(msg.value);
        }
        // Safety: workers are joined at teardown; no concurrent access.
        unsafe { (*self.inner.get()).vm.clear() };
    }

    /// Allocate the exit-signal payloads on this block's heap. Used by
    /// exit propagation, which runs on the worker that finalized this
    /// block while its heap is still intact.
    pub(crate) fn with_own_heap<R>(&self, f: impl FnOnce() -> R) -> R {
        // Safety: the block is dead; only the finalizing worker is here.
        let inner = unsafe { &mut *self.inner.get() };
        let _guard = heap::install(&mut inner.heap);
        f()
    }
}
