//! Scheduler - Block Lifecycle and Dispatch
//!
//! The scheduler owns the PID registry (64 independently locked shards),
//! the run queues (one Chase-Lev deque per worker plus a global overflow
//! queue), the timer wheel, and the lifecycle totals. Spawning registers
//! a block and enqueues it; workers pop, run a reduction slice, and hand
//! terminal results back for exit propagation.
//!
//! ## Run queues and ownership
//!
//! Only a worker may push to its own deque (the Chase-Lev owner
//! invariant), so work entering the system from a worker thread lands on
//! that worker's deque and everything else (external spawns, cross-thread
//! wakes) goes through the global queue. Stealing rebalances from there.
//!
//! ## Drivers
//!
//! With `num_workers == 0` the scheduler is a single-threaded inline
//! driver: `step` runs at most one slice and `run` steps until no work
//! remains. With workers, `run` blocks on a condition variable until the
//! system is quiescent (event-driven shutdown wait, no polling in the hot
//! path).
//!
//! Dead blocks stay in the registry so PIDs remain resolvable until the
//! scheduler is dropped.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::{Duration, Instant};

use bloc_core::chunk::Bytecode;
use bloc_core::containers;
use bloc_core::value::{Value, release};

use crate::block::{Block, ExitInfo, Limits, PID_INVALID, SendOutcome};
use crate::caps::CapSet;
use crate::deque::WorkDeque;
use crate::timer::{DEFAULT_TICK_MS, DEFAULT_WHEEL_SIZE, TimerWheel};
use crate::vm::RunResult;
use crate::worker::{Worker, WorkerStats, current_worker_id};

/// Registry shard count; PIDs hash by `pid % 64`
pub const REGISTRY_SHARDS: usize = 64;

/// Scheduler construction parameters
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Spawn returns `PID_INVALID` beyond this many live blocks
    pub max_blocks: usize,
    /// Reduction budget per slice for blocks without explicit limits
    pub default_reductions: u32,
    /// Worker threads; 0 = single-threaded inline driver
    pub num_workers: usize,
    pub enable_stealing: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_blocks: 16_384,
            default_reductions: 2_000,
            num_workers: 0,
            enable_stealing: true,
        }
    }
}

/// Parse an env var as a number, warning (not failing) on junk values
fn parse_env_number<T: std::str::FromStr + std::fmt::Display>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(raw) => match raw.parse::<T>() {
            Ok(v) => v,
            Err(_) => {
                eprintln!("Warning: {name}='{raw}' is not a valid number, using default {default}");
                default
            }
        },
        Err(_) => default,
    }
}

impl SchedulerConfig {
    /// Defaults overridden by `BLOC_WORKERS`, `BLOC_MAX_BLOCKS`, and
    /// `BLOC_REDUCTIONS`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_blocks: parse_env_number("BLOC_MAX_BLOCKS", defaults.max_blocks),
            default_reductions: parse_env_number("BLOC_REDUCTIONS", defaults.default_reductions),
            num_workers: parse_env_number("BLOC_WORKERS", defaults.num_workers),
            enable_stealing: defaults.enable_stealing,
        }
    }
}

/// Snapshot of scheduler totals
#[derive(Debug, Clone, Copy, Default)]
pub struct SchedulerStats {
    pub total_spawned: u64,
    pub total_terminated: u64,
    pub blocks_in_flight: u64,
    pub context_switches: u64,
    pub total_reductions: u64,
    pub peak_blocks: u64,
    pub blocks_total: usize,
    pub blocks_alive: usize,
    pub blocks_dead: usize,
}

struct Shard {
    blocks: Mutex<HashMap<u64, Arc<Block>>>,
}

/// The scheduler. Construct with `Scheduler::new`, which returns an `Arc`
/// because worker threads hold references.
pub struct Scheduler {
    pub(crate) config: SchedulerConfig,
    shards: Vec<Shard>,
    names: Mutex<HashMap<String, u64>>,
    next_pid: AtomicU64,
    pub(crate) deques: Vec<Arc<WorkDeque<Block>>>,
    global: Mutex<VecDeque<Arc<Block>>>,
    /// Workers park here; `run` waits here for quiescence
    park: Mutex<()>,
    park_cond: Condvar,
    timers: Mutex<TimerWheel>,
    start: Instant,
    // Totals, all monotone fetch_add
    total_spawned: AtomicU64,
    total_terminated: AtomicU64,
    blocks_in_flight: AtomicU64,
    context_switches: AtomicU64,
    total_reductions: AtomicU64,
    peak_blocks: AtomicU64,
    /// Workers currently holding popped work; part of the quiescence test
    busy_workers: AtomicUsize,
    shutdown: AtomicBool,
    pub(crate) worker_stats: Vec<Arc<WorkerStats>>,
    worker_handles: Mutex<Vec<std::thread::JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Arc<Self> {
        let deques = (0..config.num_workers)
            .map(|_| Arc::new(WorkDeque::new()))
            .collect();
        let worker_stats = (0..config.num_workers)
            .map(|_| Arc::new(WorkerStats::default()))
            .collect();
        let sched = Arc::new(Self {
            config,
            shards: (0..REGISTRY_SHARDS)
                .map(|_| Shard {
                    blocks: Mutex::new(HashMap::new()),
                })
                .collect(),
            names: Mutex::new(HashMap::new()),
            next_pid: AtomicU64::new(1),
            deques,
            global: Mutex::new(VecDeque::new()),
            park: Mutex::new(()),
            park_cond: Condvar::new(),
            timers: Mutex::new(TimerWheel::new(DEFAULT_WHEEL_SIZE, DEFAULT_TICK_MS)),
            start: Instant::now(),
            total_spawned: AtomicU64::new(0),
            total_terminated: AtomicU64::new(0),
            blocks_in_flight: AtomicU64::new(0),
            context_switches: AtomicU64::new(0),
            total_reductions: AtomicU64::new(0),
            peak_blocks: AtomicU64::new(0),
            busy_workers: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
            worker_stats,
            worker_handles: Mutex::new(Vec::new()),
        });

        let mut handles = Vec::with_capacity(sched.config.num_workers);
        for id in 0..sched.config.num_workers {
            let worker = Worker::new(id, Arc::downgrade(&sched));
            handles.push(
                std::thread::Builder::new()
                    .name(format!("bloc-worker-{id}"))
                    .spawn(move || worker.run())
                    .expect("worker thread spawn"),
            );
        }
        *sched
            .worker_handles
            .lock()
            .expect("worker handle lock poisoned") = handles;
        sched
    }

    /// Wall-clock since construction, the timer wheel's time base
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.elapsed().as_millis() as u64
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    // =========================================================================
    // Registry
    // =========================================================================

    fn shard_of(&self, pid: u64) -> &Shard {
        &self.shards[(pid % REGISTRY_SHARDS as u64) as usize]
    }

    /// Resolve a PID. Dead blocks resolve until the scheduler drops.
    pub fn lookup(&self, pid: u64) -> Option<Arc<Block>> {
        if pid == PID_INVALID {
            return None;
        }
        self.shard_of(pid)
            .blocks
            .lock()
            .expect("registry shard lock poisoned")
            .get(&pid)
            .cloned()
    }

    /// Resolve a registered name to a PID
    pub fn whereis(&self, name: &str) -> Option<u64> {
        self.names
            .lock()
            .expect("name registry lock poisoned")
            .get(name)
            .copied()
    }

    /// Live blocks (spawned minus terminated)
    pub fn block_count(&self) -> usize {
        self.blocks_in_flight.load(Ordering::Acquire) as usize
    }

    // =========================================================================
    // Spawn / kill
    // =========================================================================

    /// `spawn_ex` with no capabilities and default limits
    pub fn spawn(&self, bytecode: Arc<Bytecode>, name: Option<&str>) -> u64 {
        self.spawn_ex(bytecode, name, CapSet::empty(), None)
    }

    /// Full spawn. Returns `PID_INVALID` when the registry is at
    /// `max_blocks`.
    pub fn spawn_ex(
        &self,
        bytecode: Arc<Bytecode>,
        name: Option<&str>,
        caps: CapSet,
        limits: Option<Limits>,
    ) -> u64 {
        if self.block_count() >= self.config.max_blocks {
            return PID_INVALID;
        }
        let pid = self.next_pid.fetch_add(1, Ordering::Relaxed);
        let limits = limits.unwrap_or(Limits {
            max_reductions: self.config.default_reductions,
            ..Limits::default()
        });
        let block = Arc::new(Block::new(pid, name, limits));
        block.grant(caps);
        block.load_bytecode(bytecode);

        self.shard_of(pid)
            .blocks
            .lock()
            .expect("registry shard lock poisoned")
            .insert(pid, Arc::clone(&block));
        if let Some(name) = name {
            self.names
                .lock()
                .expect("name registry lock poisoned")
                .insert(name.to_string(), pid);
        }

        self.total_spawned.fetch_add(1, Ordering::Release);
        let in_flight = self.blocks_in_flight.fetch_add(1, Ordering::Release) + 1;
        // High-water mark, CAS loop
        let mut peak = self.peak_blocks.load(Ordering::Acquire);
        while in_flight > peak {
            match self.peak_blocks.compare_exchange_weak(
                peak,
                in_flight,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(current) => peak = current,
            }
        }

        self.enqueue(block);
        pid
    }

    /// Spawn a child of `parent`: the SPAWN capability is enforced (a
    /// parent without it crashes with the standard denial reason), the
    /// child records its parent PID, and a supervising parent is set as
    /// the child's supervisor.
    pub fn spawn_from(
        &self,
        parent: u64,
        bytecode: Arc<Bytecode>,
        name: Option<&str>,
        caps: CapSet,
        limits: Option<Limits>,
    ) -> u64 {
        let Some(parent_block) = self.lookup(parent) else {
            return PID_INVALID;
        };
        if !parent_block.is_alive() {
            return PID_INVALID;
        }
        if !parent_block.caps().contains(CapSet::SPAWN) {
            let reason = format!("capability denied: {}", CapSet::SPAWN.name());
            if parent_block.crash(&reason) {
                self.finalize(&parent_block);
            }
            return PID_INVALID;
        }
        let pid = self.spawn_ex(bytecode, name, caps, limits);
        if pid == PID_INVALID {
            return PID_INVALID;
        }
        if let Some(child) = self.lookup(pid) {
            child.set_parent(parent);
            if parent_block.caps().contains(CapSet::SUPERVISE) {
                child.set_supervisor(parent);
            }
        }
        pid
    }

    /// Crash a block with reason `"killed"`. No-op for `PID_INVALID`,
    /// unknown PIDs, and already-dead blocks; `total_terminated` counts
    /// each distinct termination exactly once.
    pub fn kill(&self, pid: u64) {
        let Some(block) = self.lookup(pid) else { return };
        // A RUNNING block observes this flag at its next reduction
        // checkpoint; the holding worker finishes the termination.
        block.request_kill();
        if block.terminate_remote(1, Some("killed")) {
            self.finalize(&block);
        }
    }

    // =========================================================================
    // Run queues
    // =========================================================================

    /// Queue a runnable block: the calling worker's own deque when on a
    /// worker thread, the global overflow queue otherwise.
    pub(crate) fn enqueue(&self, block: Arc<Block>) {
        match current_worker_id() {
            Some(id) if id < self.deques.len() => self.deques[id].push(block),
            _ => self
                .global
                .lock()
                .expect("global queue lock poisoned")
                .push_back(block),
        }
        self.park_cond.notify_all();
    }

    pub(crate) fn pop_global(&self) -> Option<Arc<Block>> {
        self.global
            .lock()
            .expect("global queue lock poisoned")
            .pop_front()
    }

    pub(crate) fn park_worker(&self, timeout: Duration) {
        let guard = self.park.lock().expect("park lock poisoned");
        let _ = self
            .park_cond
            .wait_timeout(guard, timeout)
            .expect("park condvar poisoned");
    }

    pub(crate) fn enter_busy(&self) {
        self.busy_workers.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn leave_busy(&self) {
        self.busy_workers.fetch_sub(1, Ordering::AcqRel);
        self.park_cond.notify_all();
    }

    fn queues_empty(&self) -> bool {
        self.deques.iter().all(|d| d.is_empty())
            && self
                .global
                .lock()
                .expect("global queue lock poisoned")
                .is_empty()
    }

    /// No runnable work anywhere: queues drained, no worker mid-slice, no
    /// timer pending. WAITING blocks do not count as work; a deadlocked
    /// receive keeps its block parked forever, like any process runtime.
    pub fn is_quiescent(&self) -> bool {
        self.queues_empty()
            && self.busy_workers.load(Ordering::Acquire) == 0
            && !self
                .timers
                .lock()
                .expect("timer lock poisoned")
                .has_pending()
    }

    // =========================================================================
    // Drivers
    // =========================================================================

    /// Single-threaded driver: run at most one slice; true iff work may
    /// remain. With workers attached this only ticks timers.
    pub fn step(&self) -> bool {
        self.tick_timers();
        if self.config.num_workers > 0 {
            return !self.is_quiescent();
        }
        if let Some(block) = self.pop_global() {
            self.run_block_slice(None, block);
        }
        !self.is_quiescent()
    }

    /// Run until no work remains: inline stepping when single-threaded,
    /// an event-driven quiescence wait when workers are attached.
    pub fn run(&self) {
        if self.config.num_workers == 0 {
            while self.step() {
                // Nothing runnable but a timer is pending: wait for the
                // clock instead of spinning
                if self.queues_empty() {
                    std::thread::sleep(Duration::from_millis(1));
                }
            }
            return;
        }
        let mut guard = self.park.lock().expect("park lock poisoned");
        while !self.is_quiescent() {
            let (g, _) = self
                .park_cond
                .wait_timeout(guard, Duration::from_millis(5))
                .expect("park condvar poisoned");
            guard = g;
        }
    }

    /// One block slice: claim, run, dispatch the outcome. `worker` is
    /// `None` for the single-threaded driver.
    pub(crate) fn run_block_slice(&self, worker: Option<usize>, block: Arc<Block>) {
        if !block.try_start_running() {
            // Killed while queued, or a stale queue entry for a dead
            // block; nothing to do.
            return;
        }
        let result = block.run_slice();
        let reductions = u64::from(block.last_slice_reductions());
        self.context_switches.fetch_add(1, Ordering::Release);
        self.total_reductions.fetch_add(reductions, Ordering::Release);
        if let Some(id) = worker {
            let stats = &self.worker_stats[id];
            stats.blocks_executed.fetch_add(1, Ordering::Relaxed);
            stats.reductions.fetch_add(reductions, Ordering::Relaxed);
        }

        match result {
            RunResult::Yielded => {
                if block.finish_slice_runnable() {
                    self.enqueue(block);
                }
                // A failed CAS means a concurrent kill finalized it
            }
            RunResult::Waiting => {
                if block.finish_slice_waiting() {
                    // A message may have landed between the VM's empty
                    // check and the state flip; re-check and wake.
                    if block.has_messages() && block.wake_from_waiting() {
                        self.enqueue(block);
                    }
                }
            }
            RunResult::Halted => {
                if block.exit(0) {
                    self.finalize(&block);
                }
            }
            RunResult::Killed => {
                if block.crash("killed") {
                    self.finalize(&block);
                }
            }
            RunResult::Error(e) => {
                if block.crash(&e.reason()) {
                    self.finalize(&block);
                }
            }
        }
    }

    // =========================================================================
    // Termination and exit propagation
    // =========================================================================

    /// Account a termination and run exit propagation. Call exactly once
    /// per block, by whoever won the DEAD transition. Propagated crashes
    /// are handled iteratively so long link chains cannot recurse.
    pub(crate) fn finalize(&self, block: &Arc<Block>) {
        let mut worklist = vec![Arc::clone(block)];
        while let Some(dead) = worklist.pop() {
            self.total_terminated.fetch_add(1, Ordering::Release);
            self.blocks_in_flight.fetch_sub(1, Ordering::Release);
            self.propagate_exit(&dead, &mut worklist);
        }
        self.park_cond.notify_all();
    }

    /// Exit propagation over links and monitors: abnormal exits crash
    /// linked peers unless they trap exits, in which case they receive a
    /// synthetic exit message; monitors always get a down-message; normal
    /// exits crash nobody.
    fn propagate_exit(&self, dead: &Arc<Block>, worklist: &mut Vec<Arc<Block>>) {
        let exit = dead.exit_info().unwrap_or(ExitInfo {
            code: 1,
            reason: None,
        });
        let abnormal = exit.is_abnormal();

        for pid in dead.links() {
            let Some(peer) = self.lookup(pid) else { continue };
            peer.remove_link(dead.pid());
            if !peer.is_alive() || !abnormal {
                continue;
            }
            // Capability read is atomic at propagation time; a racing
            // revoke behaves as if it landed after delivery.
            if peer.caps().contains(CapSet::TRAP_EXIT) {
                self.deliver_signal(dead, &peer, "exit", &exit);
            } else {
                let reason = match &exit.reason {
                    Some(r) => format!("linked block {} crashed: {r}", dead.pid()),
                    None => format!("linked block {} exited abnormally", dead.pid()),
                };
                // A peer mid-slice dies through its kill flag instead (its
                // worker reports the death with the generic kill reason).
                peer.request_kill();
                if peer.terminate_remote(1, Some(&reason)) {
                    worklist.push(peer);
                }
            }
        }

        for pid in dead.monitored_by() {
            let Some(peer) = self.lookup(pid) else { continue };
            peer.remove_monitor(dead.pid());
            if peer.is_alive() {
                self.deliver_signal(dead, &peer, "down", &exit);
            }
        }
    }

    /// Build a synthetic signal on the dead block's heap (still intact;
    /// the registry keeps the block) and deliver it.
    fn deliver_signal(&self, dead: &Arc<Block>, peer: &Arc<Block>, kind: &str, exit: &ExitInfo) {
        let signal = dead.with_own_heap(|| {
            let kind_v = containers::string_new(kind).ok()?;
            let reason_v = match &exit.reason {
                Some(r) => containers::string_new(r).ok()?,
                None => Value::Nil,
            };
            containers::struct_new(
                "ExitSignal",
                vec![
                    ("kind".to_string(), kind_v),
                    ("from".to_string(), Value::Pid(dead.pid())),
                    ("code".to_string(), Value::Int(i64::from(exit.code))),
                    ("reason".to_string(), reason_v),
                ],
            )
            .ok()
        });
        let Some(signal) = signal else { return };
        let outcome = peer.send(dead.pid(), signal);
        release(signal);
        if outcome == SendOutcome::QueuedNeedsWake {
            self.enqueue(Arc::clone(peer));
        }
    }

    // =========================================================================
    // Links, monitors, messaging
    // =========================================================================

    /// Establish a bidirectional link; both blocks must be alive.
    pub fn link(&self, a: u64, b: u64) -> bool {
        let (Some(ba), Some(bb)) = (self.lookup(a), self.lookup(b)) else {
            return false;
        };
        if !ba.is_alive() || !bb.is_alive() {
            return false;
        }
        ba.add_link(b);
        bb.add_link(a);
        true
    }

    pub fn unlink(&self, a: u64, b: u64) {
        if let Some(ba) = self.lookup(a) {
            ba.remove_link(b);
        }
        if let Some(bb) = self.lookup(b) {
            bb.remove_link(a);
        }
    }

    /// `observer` watches `target`: unidirectional.
    pub fn monitor(&self, observer: u64, target: u64) -> bool {
        let (Some(bo), Some(bt)) = (self.lookup(observer), self.lookup(target)) else {
            return false;
        };
        if !bo.is_alive() || !bt.is_alive() {
            return false;
        }
        bo.add_monitor(target);
        bt.add_monitored_by(observer);
        true
    }

    pub fn demonitor(&self, observer: u64, target: u64) {
        if let Some(bo) = self.lookup(observer) {
            bo.remove_monitor(target);
        }
        if let Some(bt) = self.lookup(target) {
            bt.remove_monitored_by(observer);
        }
    }

    /// Send `value` from `from` to `to`. False when the target is dead,
    /// unknown, or its mailbox is full.
    pub fn send(&self, from: u64, to: u64, value: Value) -> bool {
        let Some(target) = self.lookup(to) else {
            return false;
        };
        match target.send(from, value) {
            SendOutcome::Queued => {}
            SendOutcome::QueuedNeedsWake => self.enqueue(target),
            SendOutcome::Dead | SendOutcome::Full => return false,
        }
        if let Some(sender) = self.lookup(from) {
            sender.counters.messages_sent.fetch_add(1, Ordering::Release);
        }
        true
    }

    // =========================================================================
    // Timers
    // =========================================================================

    /// Arm a wake-up timer for a block: when it fires, a WAITING block
    /// becomes RUNNABLE and is re-queued.
    pub fn add_wake_timer(self: &Arc<Self>, delay_ms: u64, pid: u64) -> u64 {
        let deadline = self.elapsed_ms() + delay_ms;
        let weak: Weak<Scheduler> = Arc::downgrade(self);
        self.timers.lock().expect("timer lock poisoned").add(
            deadline,
            pid,
            Box::new(move |pid| {
                if let Some(sched) = weak.upgrade() {
                    if let Some(block) = sched.lookup(pid) {
                        if block.wake_from_waiting() {
                            sched.enqueue(block);
                        }
                    }
                }
            }),
        )
    }

    /// Arm an arbitrary callback timer at an absolute deadline (ms on the
    /// scheduler clock).
    pub fn add_timer(
        &self,
        deadline_ms: u64,
        pid: u64,
        callback: crate::timer::TimerCallback,
    ) -> u64 {
        self.timers
            .lock()
            .expect("timer lock poisoned")
            .add(deadline_ms, pid, callback)
    }

    pub fn cancel_timer(&self, id: u64) -> bool {
        self.timers.lock().expect("timer lock poisoned").cancel(id)
    }

    /// Advance the wheel to now and fire due timers. Driven by workers
    /// between slices and by `step`. The busy claim covers the window
    /// between removing due entries from the wheel and firing them, so
    /// the quiescence test cannot miss in-flight wakes.
    pub fn tick_timers(&self) {
        self.enter_busy();
        let now = self.elapsed_ms();
        let fired = self.timers.lock().expect("timer lock poisoned").tick(now);
        for entry in fired {
            entry.fire();
        }
        self.leave_busy();
    }

    pub fn next_timer_deadline(&self) -> u64 {
        self.timers
            .lock()
            .expect("timer lock poisoned")
            .next_deadline()
    }

    // =========================================================================
    // Stats and teardown
    // =========================================================================

    pub fn stats(&self) -> SchedulerStats {
        let mut blocks_total = 0;
        let mut blocks_alive = 0;
        let mut blocks_dead = 0;
        for shard in &self.shards {
            let guard = shard.blocks.lock().expect("registry shard lock poisoned");
            blocks_total += guard.len();
            for block in guard.values() {
                if block.is_alive() {
                    blocks_alive += 1;
                } else {
                    blocks_dead += 1;
                }
            }
        }
        SchedulerStats {
            total_spawned: self.total_spawned.load(Ordering::Acquire),
            total_terminated: self.total_terminated.load(Ordering::Acquire),
            blocks_in_flight: self.blocks_in_flight.load(Ordering::Acquire),
            context_switches: self.context_switches.load(Ordering::Acquire),
            total_reductions: self.total_reductions.load(Ordering::Acquire),
            peak_blocks: self.peak_blocks.load(Ordering::Acquire),
            blocks_total,
            blocks_alive,
            blocks_dead,
        }
    }

    /// Every registered block, for diagnostics dumps
    pub fn blocks_snapshot(&self) -> Vec<Arc<Block>> {
        let mut out = Vec::new();
        for shard in &self.shards {
            out.extend(
                shard
                    .blocks
                    .lock()
                    .expect("registry shard lock poisoned")
                    .values()
                    .cloned(),
            );
        }
        out
    }

    /// Stop workers and join them. Idempotent; `Drop` calls it too. If
    /// the last scheduler reference dies on a worker thread, that thread
    /// cannot join itself; its handle is dropped (detached) instead, and
    /// the thread exits at its next loop check.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.park_cond.notify_all();
        let handles = std::mem::take(
            &mut *self
                .worker_handles
                .lock()
                .expect("worker handle lock poisoned"),
        );
        let me = std::thread::current().id();
        for handle in handles {
            if handle.thread().id() == me {
                continue;
            }
            let _ = handle.join();
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
        // Drop queued Arcs first
        self.global
            .lock()
            .expect("global queue lock poisoned")
            .clear();
        self.deques.clear();
        // Cross-block references (mailbox messages, received values on
        // operand stacks) must be released while every heap is still
        // alive; only then may blocks drop and their heaps reclaim cells.
        let blocks = self.blocks_snapshot();
        for block in &blocks {
            block.clear_execution_state();
        }
        for shard in &self.shards {
            shard
                .blocks
                .lock()
                .expect("registry shard lock poisoned")
                .clear();
        }
    }
}
