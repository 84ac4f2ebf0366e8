// ── Priority message queue ──
//
// Bounded mailbox shared between producers and the dispatch loop. A std
// mutex guards the heap so both blocking and async callers can use it;
// blocking pushers park on a condvar, async callers on `Notify`.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::pin::pin;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tokio::sync::Notify;

use crate::message::Message;

/// Lower values dequeue first.
pub type Priority = u32;

/// Priority used when none is given.
pub const DEFAULT_PRIORITY: Priority = 999;

/// Returned by `try_push*` when the queue is at capacity; hands the message
/// back to the caller.
#[derive(Debug, Error)]
#[error("message queue is full")]
pub struct QueueFull(pub Message);

impl QueueFull {
    pub fn into_message(self) -> Message {
        self.0
    }
}

struct Entry {
    priority: Priority,
    seq: u64,
    message: Message,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// BinaryHeap is a max-heap: reverse both keys so the smallest
// (priority, seq) pair sits on top.
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct Heap {
    entries: BinaryHeap<Entry>,
    next_seq: u64,
}

impl Heap {
    fn insert(&mut self, priority: Priority, message: Message) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.push(Entry {
            priority,
            seq,
            message,
        });
    }
}

/// Priority-ordered, optionally bounded mailbox.
///
/// Pulls follow `(priority asc, enqueue order asc)`.
pub struct MessageQueue {
    capacity: Option<usize>,
    heap: Mutex<Heap>,
    not_full: Condvar,
    readable: Notify,
    writable: Notify,
}

impl std::fmt::Debug for MessageQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageQueue")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

impl Default for MessageQueue {
    fn default() -> Self {
        Self::unbounded()
    }
}

impl MessageQueue {
    /// `None` or `Some(0)` means unbounded.
    pub fn new(capacity: Option<usize>) -> Self {
        Self {
            capacity: capacity.filter(|c| *c > 0),
            heap: Mutex::new(Heap::default()),
            not_full: Condvar::new(),
            readable: Notify::new(),
            writable: Notify::new(),
        }
    }

    pub fn unbounded() -> Self {
        Self::new(None)
    }

    pub fn bounded(capacity: usize) -> Self {
        Self::new(Some(capacity))
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.capacity.is_some_and(|cap| self.len() >= cap)
    }

    // ── Producers ────────────────────────────────────────────────

    /// Enqueue at [`DEFAULT_PRIORITY`], blocking the thread while full.
    pub fn push(&self, message: Message) {
        self.push_with_priority(message, DEFAULT_PRIORITY);
    }

    /// Enqueue, blocking the thread while full.
    ///
    /// Must not be called from an async task; use
    /// [`apush_with_priority`](Self::apush_with_priority) there.
    pub fn push_with_priority(&self, message: Message, priority: Priority) {
        let mut heap = self.lock();
        while self.at_capacity(&heap) {
            heap = self
                .not_full
                .wait(heap)
                .unwrap_or_else(PoisonError::into_inner);
        }
        heap.insert(priority, message);
        drop(heap);
        self.readable.notify_waiters();
    }

    pub fn try_push(&self, message: Message) -> Result<(), QueueFull> {
        self.try_push_with_priority(message, DEFAULT_PRIORITY)
    }

    /// Enqueue without waiting.
    pub fn try_push_with_priority(
        &self,
        message: Message,
        priority: Priority,
    ) -> Result<(), QueueFull> {
        let mut heap = self.lock();
        if self.at_capacity(&heap) {
            return Err(QueueFull(message));
        }
        heap.insert(priority, message);
        drop(heap);
        self.readable.notify_waiters();
        Ok(())
    }

    pub async fn apush(&self, message: Message) {
        self.apush_with_priority(message, DEFAULT_PRIORITY).await;
    }

    /// Enqueue, suspending while full.
    pub async fn apush_with_priority(&self, message: Message, priority: Priority) {
        let mut message = message;
        loop {
            let mut notified = pin!(self.writable.notified());
            notified.as_mut().enable();
            match self.try_push_with_priority(message, priority) {
                Ok(()) => return,
                Err(QueueFull(back)) => message = back,
            }
            notified.await;
        }
    }

    // ── Consumers ────────────────────────────────────────────────

    /// Dequeue the next message, or `None` right away when empty.
    pub fn pull(&self) -> Option<Message> {
        self.pull_with_priority().map(|(_, message)| message)
    }

    /// Like [`pull`](Self::pull), also returning the priority it was queued at.
    pub fn pull_with_priority(&self) -> Option<(Priority, Message)> {
        let entry = self.lock().entries.pop()?;
        self.not_full.notify_one();
        self.writable.notify_waiters();
        Some((entry.priority, entry.message))
    }

    /// Dequeue, suspending until a message is available.
    pub async fn apull(&self) -> Message {
        loop {
            self.wait_readable().await;
            if let Some(message) = self.pull() {
                return message;
            }
        }
    }

    /// Suspend until the queue is non-empty, without dequeuing.
    pub async fn wait_readable(&self) {
        loop {
            let mut notified = pin!(self.readable.notified());
            notified.as_mut().enable();
            if !self.is_empty() {
                return;
            }
            notified.await;
        }
    }

    fn at_capacity(&self, heap: &Heap) -> bool {
        self.capacity.is_some_and(|cap| heap.entries.len() >= cap)
    }

    fn lock(&self) -> MutexGuard<'_, Heap> {
        self.heap.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
