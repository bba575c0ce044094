//! Mailbox - Bounded FIFO of Messages
//!
//! Each block owns one mailbox. Any thread may enqueue (senders run on
//! other workers); only the owning block dequeues. Capacity is fixed at
//! construction; a full mailbox rejects the send and the sender sees a
//! failure value, never a crash.
//!
//! Values in flight are retained by the mailbox and handed to the receiver
//! with their reference; container payloads stay shared copy-on-write
//! until either side mutates.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use bloc_core::value::{Value, release};

/// In-process message wire form
#[derive(Debug, Clone, Copy)]
pub struct Message {
    pub sender: u64,
    pub value: Value,
}

/// Lifetime counters for one mailbox
#[derive(Debug, Clone, Copy, Default)]
pub struct MailboxStats {
    pub enqueued: u64,
    pub dequeued: u64,
    pub depth: usize,
    pub rejected: u64,
}

/// Bounded FIFO queue of messages
pub struct Mailbox {
    queue: Mutex<VecDeque<Message>>,
    capacity: usize,
    enqueued: AtomicU64,
    dequeued: AtomicU64,
    rejected: AtomicU64,
}

impl Mailbox {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            capacity,
            enqueued: AtomicU64::new(0),
            dequeued: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Enqueue a message the caller has already retained. Returns false
    /// (without adopting the reference) when the mailbox is full.
    pub fn push(&self, msg: Message) -> bool {
        let mut queue = self
            .queue
            .lock()
            .expect("mailbox lock poisoned - a sender panicked mid-enqueue");
        if queue.len() >= self.capacity {
            drop(queue);
            self.rejected.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        queue.push_back(msg);
        drop(queue);
        self.enqueued.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Dequeue the oldest message; the mailbox's reference transfers to
    /// the caller.
    pub fn pop(&self) -> Option<Message> {
        let msg = self
            .queue
            .lock()
            .expect("mailbox lock poisoned - a sender panicked mid-enqueue")
            .pop_front();
        if msg.is_some() {
            self.dequeued.fetch_add(1, Ordering::Relaxed);
        }
        msg
    }

    pub fn len(&self) -> usize {
        self.queue
            .lock()
            .expect("mailbox lock poisoned - a sender panicked mid-enqueue")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the current values, for GC root scanning by the owning
    /// worker.
    pub fn snapshot_values(&self) -> Vec<Value> {
        self.queue
            .lock()
            .expect("mailbox lock poisoned - a sender panicked mid-enqueue")
            .iter()
            .map(|m| m.value)
            .collect()
    }

    pub fn stats(&self) -> MailboxStats {
        MailboxStats {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            dequeued: self.dequeued.load(Ordering::Relaxed),
            depth: self.len(),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}

impl Drop for Mailbox {
    fn drop(&mut self) {
        // Undelivered messages still hold their references
        let queue = self
            .queue
            .get_mut()
            .expect("mailbox lock poisoned - a sender panicked mid-enqueue");
        for msg in queue.drain(..) {
            release(msg.value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order() {
        let mb = Mailbox::new(8);
        for i in 0..5 {
            assert!(mb.push(Message {
                sender: 1,
                value: Value::Int(i),
            }));
        }
        for i in 0..5 {
            assert_eq!(mb.pop().map(|m| m.value), Some(Value::Int(i)));
        }
        assert!(mb.pop().is_none());
    }

    #[test]
    fn test_capacity_rejects() {
        let mb = Mailbox::new(2);
        assert!(mb.push(Message { sender: 1, value: Value::Int(1) }));
        assert!(mb.push(Message { sender: 1, value: Value::Int(2) }));
        assert!(!mb.push(Message { sender: 1, value: Value::Int(3) }));
        assert_eq!(mb.len(), 2);
        assert_eq!(mb.stats().rejected, 1);
    }

    #[test]
    fn test_counters_are_lifetime() {
        let mb = Mailbox::new(8);
        mb.push(Message { sender: 1, value: Value::Int(1) });
        mb.push(Message { sender: 1, value: Value::Int(2) });
        mb.pop();
        let stats = mb.stats();
        assert_eq!(stats.enqueued, 2);
        assert_eq!(stats.dequeued, 1);
        assert_eq!(stats.depth, 1);
    }

    #[test]
    fn test_concurrent_senders_all_deliver() {
        use std::sync::Arc;
        let mb = Arc::new(Mailbox::new(1024));
        let handles: Vec<_> = (0..8)
            .map(|sender| {
                let mb = Arc::clone(&mb);
                std::thread::spawn(move || {
                    for i in 0..100 {
                        assert!(mb.push(Message {
                            sender,
                            value: Value::Int(i),
                        }));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().expect("sender thread");
        }
        assert_eq!(mb.len(), 800);
        // Per-sender FIFO: for each sender the payloads arrive in order
        let mut last = [-1i64; 8];
        while let Some(msg) = mb.pop() {
            let Value::Int(n) = msg.value else { panic!("int payload") };
            assert!(n > last[msg.sender as usize]);
            last[msg.sender as usize] = n;
        }
    }
}
