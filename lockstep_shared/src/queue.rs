//! Fixed-capacity queues shared between the socket task and the tick thread.
//!
//! The mutex is held only for the push or the swap-out; callers never decode
//! or dispatch while holding it. A full queue refuses the item and counts the
//! drop; it never blocks and never grows.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use thiserror::Error;

/// Default number of slots per queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("queue is full ({capacity} slots)")]
pub struct QueueFull {
    pub capacity: usize,
}

/// Bounded FIFO guarded by a short-held mutex.
#[derive(Debug)]
pub struct BoundedQueue<T> {
    slots: Mutex<VecDeque<T>>,
    capacity: usize,
    dropped: AtomicU64,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            dropped: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<T>> {
        // A panic while holding this lock cannot leave the deque half-written.
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Appends `item`, or refuses it when every slot is taken.
    pub fn push(&self, item: T) -> Result<(), QueueFull> {
        let mut slots = self.lock();
        if slots.len() >= self.capacity {
            drop(slots);
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return Err(QueueFull {
                capacity: self.capacity,
            });
        }
        slots.push_back(item);
        Ok(())
    }

    /// Removes and returns everything queued, oldest first.
    pub fn take_all(&self) -> Vec<T> {
        let mut slots = self.lock();
        slots.drain(..).collect()
    }

    /// Puts previously taken items back in front of anything queued since.
    ///
    /// These items were already admitted once, so they may briefly push the
    /// queue past its capacity.
    pub fn requeue_front(&self, items: Vec<T>) {
        if items.is_empty() {
            return;
        }
        let mut slots = self.lock();
        for item in items.into_iter().rev() {
            slots.push_front(item);
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Items refused because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
