//! Hashed timer wheel
//!
//! Timers hash into `wheel_size` slots by `(deadline_ms / tick_ms) %
//! wheel_size`; each slot holds its entries in insertion order. `cancel`
//! only tombstones (an iterator may be mid-walk in the caller); cancelled
//! entries are dropped the next time their slot is traversed, and they
//! never fire.
//!
//! The wheel itself is single-threaded; the scheduler wraps it in its
//! timer lock and drives `tick` from whichever worker checks the clock.

/// Fired-timer callback; receives the block pid the timer was armed for.
/// Context travels by closure capture.
pub type TimerCallback = Box<dyn FnOnce(u64) + Send>;

/// Default slot count
pub const DEFAULT_WHEEL_SIZE: usize = 256;

/// Default tick granularity
pub const DEFAULT_TICK_MS: u64 = 10;

/// One armed timer
pub struct TimerEntry {
    pub id: u64,
    pub deadline_ms: u64,
    pub block_pid: u64,
    callback: Option<TimerCallback>,
    cancelled: bool,
}

impl TimerEntry {
    /// Invoke the callback. Consumes the entry; a cancelled or already
    /// fired entry is a no-op.
    pub fn fire(mut self) {
        if self.cancelled {
            return;
        }
        if let Some(cb) = self.callback.take() {
            cb(self.block_pid);
        }
    }
}

/// Hashed wheel of timer entries
pub struct TimerWheel {
    wheel_size: usize,
    tick_ms: u64,
    slots: Vec<Vec<TimerEntry>>,
    next_id: u64,
    /// Bucket time of the last tick, for bounded slot walks
    last_tick: u64,
}

impl TimerWheel {
    pub fn new(wheel_size: usize, tick_ms: u64) -> Self {
        Self {
            wheel_size: wheel_size.max(1),
            tick_ms: tick_ms.max(1),
            slots: (0..wheel_size.max(1)).map(|_| Vec::new()).collect(),
            next_id: 1,
            last_tick: 0,
        }
    }

    #[inline]
    fn slot_of(&self, deadline_ms: u64) -> usize {
        ((deadline_ms / self.tick_ms) as usize) % self.wheel_size
    }

    /// Arm a timer; returns its id for `cancel`.
    pub fn add(&mut self, deadline_ms: u64, block_pid: u64, callback: TimerCallback) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        let slot = self.slot_of(deadline_ms);
        self.slots[slot].push(TimerEntry {
            id,
            deadline_ms,
            block_pid,
            callback: Some(callback),
            cancelled: false,
        });
        id
    }

    /// Tombstone a timer. Returns false for an unknown or already fired
    /// id. The entry is physically removed on the next traversal of its
    /// slot.
    pub fn cancel(&mut self, id: u64) -> bool {
        for slot in &mut self.slots {
            if let Some(entry) = slot.iter_mut().find(|e| e.id == id && !e.cancelled) {
                entry.cancelled = true;
                return true;
            }
        }
        false
    }

    /// Advance to `now_ms`: walk the slots whose bucket time has elapsed,
    /// remove entries due at or before `now_ms`, drop cancelled entries,
    /// and return the fired entries for the caller to invoke.
    pub fn tick(&mut self, now_ms: u64) -> Vec<TimerEntry> {
        let now_bucket = now_ms / self.tick_ms;
        let from_bucket = self.last_tick;
        self.last_tick = now_bucket;

        let mut fired = Vec::new();
        let span = now_bucket
            .saturating_sub(from_bucket)
            .saturating_add(1)
            .min(self.wheel_size as u64) as usize;
        for i in 0..span {
            let slot = ((from_bucket as usize) + i) % self.wheel_size;
            let entries = &mut self.slots[slot];
            let mut kept = Vec::with_capacity(entries.len());
            for entry in entries.drain(..) {
                if entry.cancelled {
                    // Tombstone: freed here, never fires
                    continue;
                }
                if entry.deadline_ms <= now_ms {
                    fired.push(entry);
                } else {
                    kept.push(entry);
                }
            }
            self.slots[slot] = kept;
        }
        fired
    }

    /// Smallest pending deadline; 0 when the wheel is empty
    pub fn next_deadline(&self) -> u64 {
        self.slots
            .iter()
            .flatten()
            .filter(|e| !e.cancelled)
            .map(|e| e.deadline_ms)
            .min()
            .unwrap_or(0)
    }

    /// True iff any slot holds a non-cancelled entry
    pub fn has_pending(&self) -> bool {
        self.slots.iter().flatten().any(|e| !e.cancelled)
    }
}
