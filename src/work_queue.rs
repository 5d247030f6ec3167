//! Thread-safe priority work queue for the analysis pipeline.
//!
//! Ordering: adjusted priority first (`max(base - retry_count, 1)`, so
//! retried files drain with increasing urgency), then file size ascending,
//! then insertion order as the deterministic tiebreak. `close()` wakes every
//! blocked consumer.

use crate::graph::model::Position;
use crate::walker::FileDescriptor;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// A unit of work: one file plus its retry state.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub descriptor: FileDescriptor,
    pub retry_count: u32,
    /// Where the previous attempt failed, if any.
    pub resume_position: Option<Position>,
}

impl WorkItem {
    pub fn new(descriptor: FileDescriptor) -> Self {
        Self {
            descriptor,
            retry_count: 0,
            resume_position: None,
        }
    }

    pub fn retry(descriptor: FileDescriptor, retry_count: u32, position: Option<Position>) -> Self {
        Self {
            descriptor,
            retry_count,
            resume_position: position,
        }
    }

    /// Failed files move toward the front so poison drains faster.
    pub fn adjusted_priority(&self) -> u32 {
        self.descriptor
            .priority
            .value()
            .saturating_sub(self.retry_count)
            .max(1)
    }
}

#[derive(Debug)]
struct QueueEntry {
    item: WorkItem,
    seq: u64,
}

impl QueueEntry {
    fn key(&self) -> (u32, u64, u64) {
        (
            self.item.adjusted_priority(),
            self.item.descriptor.size,
            self.seq,
        )
    }
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    // Reversed so the BinaryHeap pops the smallest key first.
    fn cmp(&self, other: &Self) -> Ordering {
        other.key().cmp(&self.key())
    }
}

#[derive(Debug, Default)]
struct QueueState {
    heap: BinaryHeap<QueueEntry>,
    next_seq: u64,
}

/// Priority queue shared between discovery and the worker pool.
#[derive(Debug)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    closed: AtomicBool,
    len: AtomicUsize,
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            len: AtomicUsize::new(0),
        }
    }

    /// Enqueue an item. Returns false when the queue has been closed.
    pub fn push(&self, item: WorkItem) -> bool {
        if self.closed.load(AtomicOrdering::Acquire) {
            return false;
        }
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let seq = state.next_seq;
            state.next_seq += 1;
            state.heap.push(QueueEntry { item, seq });
        }
        self.len.fetch_add(1, AtomicOrdering::Release);
        self.notify.notify_one();
        true
    }

    /// Pop the best item, waiting up to `deadline`. Returns `None` on
    /// timeout or when the queue is closed and empty.
    pub async fn pop(&self, deadline: Duration) -> Option<WorkItem> {
        let expires = Instant::now() + deadline;
        loop {
            let notified = self.notify.notified();

            if let Some(item) = self.try_pop() {
                return Some(item);
            }
            if self.closed.load(AtomicOrdering::Acquire) {
                return None;
            }

            let remaining = expires.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(remaining) => return None,
            }
        }
    }

    /// Non-blocking pop.
    pub fn try_pop(&self) -> Option<WorkItem> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let entry = state.heap.pop()?;
        self.len.fetch_sub(1, AtomicOrdering::Release);
        Some(entry.item)
    }

    /// Remove every queued entry for the given path. Returns how many were
    /// removed.
    pub fn remove(&self, path: &Path) -> usize {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let before = state.heap.len();
        let retained: BinaryHeap<QueueEntry> = state
            .heap
            .drain()
            .filter(|entry| entry.item.descriptor.path != path)
            .collect();
        state.heap = retained;
        let removed = before - state.heap.len();
        self.len.fetch_sub(removed, AtomicOrdering::Release);
        removed
    }

    /// Drain all queued items in priority order.
    pub fn drain(&self) -> Vec<WorkItem> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let mut items = Vec::with_capacity(state.heap.len());
        while let Some(entry) = state.heap.pop() {
            items.push(entry.item);
        }
        self.len.store(0, AtomicOrdering::Release);
        items
    }

    pub fn len(&self) -> usize {
        self.len.load(AtomicOrdering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close the queue and wake every blocked consumer. Queued items remain
    /// drainable; new pushes are rejected.
    pub fn close(&self) {
        self.closed.store(true, AtomicOrdering::Release);
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(AtomicOrdering::Acquire)
    }
}
