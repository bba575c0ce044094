//! Worker - Runs Blocks, Steals When Idle
//!
//! Each worker thread owns one Chase-Lev deque and drives blocks through
//! reduction-bounded slices. The loop:
//!
//! 1. Pop the local deque (LIFO, hot blocks stay local). If empty, steal
//!    from a randomly chosen peer (FIFO, cold work migrates). If that
//!    fails, take from the global overflow queue. Otherwise park briefly.
//! 2. Claim the block RUNNABLE→RUNNING (made atomic with the pop by the
//!    CAS: a block killed while queued simply fails the claim).
//! 3. Run one slice; dispatch on the outcome: re-queue, park, or finalize
//!    with exit propagation.
//!
//! Whichever worker is awake also advances the timer wheel.

use std::cell::Cell;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Weak};
use std::time::Duration;

use rand::Rng;

use crate::scheduler::Scheduler;

thread_local! {
    /// Which worker this thread is, for owner-only deque pushes.
    /// `usize::MAX` on non-worker threads.
    static CURRENT_WORKER: Cell<usize> = const { Cell::new(usize::MAX) };
}

/// Worker id of the calling thread, if it is a worker thread
pub(crate) fn current_worker_id() -> Option<usize> {
    let id = CURRENT_WORKER.with(Cell::get);
    (id != usize::MAX).then_some(id)
}

/// How long an idle worker parks before re-checking for work and timers
const PARK_TIMEOUT: Duration = Duration::from_millis(1);

/// Per-worker execution counters
#[derive(Debug, Default)]
pub struct WorkerStats {
    pub blocks_executed: AtomicU64,
    pub reductions: AtomicU64,
}

/// One worker thread's state. The scheduler reference is weak: workers
/// must not keep the scheduler alive, or its teardown (which joins the
/// workers) could never start.
pub(crate) struct Worker {
    id: usize,
    sched: Weak<Scheduler>,
}

impl Worker {
    pub(crate) fn new(id: usize, sched: Weak<Scheduler>) -> Self {
        Self { id, sched }
    }

    /// The thread body. Returns when the scheduler shuts down or drops.
    pub(crate) fn run(self) {
        CURRENT_WORKER.with(|c| c.set(self.id));
        let mut rng = rand::thread_rng();

        loop {
            // One upgraded reference per iteration; a dead scheduler ends
            // the loop
            let Some(sched) = self.sched.upgrade() else {
                break;
            };
            if sched.is_shutdown() {
                break;
            }
            // Busy is claimed before the pop: a block popped but not yet
            // run must keep the scheduler's quiescence test false.
            sched.enter_busy();
            match self.next_block(&sched, &mut rng) {
                Some(block) => {
                    sched.run_block_slice(Some(self.id), block);
                    sched.leave_busy();
                }
                None => {
                    sched.leave_busy();
                    sched.park_worker(PARK_TIMEOUT);
                }
            }
            sched.tick_timers();
        }
        CURRENT_WORKER.with(|c| c.set(usize::MAX));
    }

    /// Local pop, then a steal attempt, then the global overflow queue
    fn next_block(
        &self,
        sched: &Arc<Scheduler>,
        rng: &mut impl Rng,
    ) -> Option<Arc<crate::block::Block>> {
        if let Some(block) = sched.deques[self.id].pop() {
            return Some(block);
        }
        if sched.config.enable_stealing && sched.deques.len() > 1 {
            // One random victim per pass; a lost race just means another
            // pass through the loop
            let victim = rng.gen_range(0..sched.deques.len());
            if victim != self.id {
                if let Some(block) = sched.deques[victim].steal() {
                    return Some(block);
                }
            }
        }
        sched.pop_global()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_worker_id_unset_on_plain_threads() {
        assert!(current_worker_id().is_none());
    }

    #[test]
    fn test_current_worker_id_set_inside_worker_thread() {
        CURRENT_WORKER.with(|c| c.set(3));
        assert_eq!(current_worker_id(), Some(3));
        CURRENT_WORKER.with(|c| c.set(usize::MAX));
        assert!(current_worker_id().is_none());
    }
}
