//! Subscription broker: bounded replay ring plus live fan-out.
//!
//! Each job keeps the last `ring` batches. A subscriber first receives the
//! buffered batches at or above its requested sequence, then live
//! publishes, all in sequence order. Publishing never blocks the pipeline:
//! a subscriber whose outbound buffer overflows is dropped with a
//! slow-consumer flag the transport layer reports.

use crate::error::AnalysisError;
use crate::graph::model::BatchUpdate;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

/// What a subscriber receives.
#[derive(Debug, Clone)]
pub enum BrokerEvent {
    Batch(Arc<BatchUpdate>),
    /// The requested sequence fell below the ring floor; the client must
    /// re-query the store for a full snapshot, then continues live.
    ResyncRequired { floor: u64 },
}

struct SubscriberSlot {
    id: Uuid,
    tx: mpsc::Sender<BrokerEvent>,
    slow: Arc<AtomicBool>,
}

struct JobChannel {
    ring: VecDeque<Arc<BatchUpdate>>,
    last_committed: u64,
    subscribers: Vec<SubscriberSlot>,
}

impl JobChannel {
    fn new() -> Self {
        Self {
            ring: VecDeque::new(),
            last_committed: 0,
            subscribers: Vec::new(),
        }
    }

    fn floor(&self) -> Option<u64> {
        self.ring.front().map(|batch| batch.sequence)
    }
}

/// A live subscription handed to the transport layer.
#[derive(Debug)]
pub struct Subscription {
    pub id: Uuid,
    pub job_id: Uuid,
    /// Highest sequence committed when the subscription was created.
    pub last_committed_sequence: u64,
    pub rx: mpsc::Receiver<BrokerEvent>,
    slow: Arc<AtomicBool>,
}

impl Subscription {
    /// True once the broker dropped this subscriber for falling behind.
    pub fn dropped_as_slow(&self) -> bool {
        self.slow.load(Ordering::Acquire)
    }
}

pub struct SubscriptionBroker {
    jobs: DashMap<Uuid, Mutex<JobChannel>>,
    ring_capacity: usize,
    subscriber_buffer: usize,
}

impl SubscriptionBroker {
    pub fn new(ring_capacity: usize, subscriber_buffer: usize) -> Self {
        Self {
            jobs: DashMap::new(),
            ring_capacity,
            subscriber_buffer,
        }
    }

    /// Create the channel for a job before its first publish.
    pub fn register_job(&self, job_id: Uuid) {
        self.jobs.entry(job_id).or_insert_with(|| Mutex::new(JobChannel::new()));
    }

    pub fn last_committed(&self, job_id: Uuid) -> Option<u64> {
        let entry = self.jobs.get(&job_id)?;
        let channel = entry.lock().unwrap_or_else(|e| e.into_inner());
        Some(channel.last_committed)
    }

    /// Publish a batch: append to the ring and fan out. Slow subscribers
    /// are dropped on the spot; the pipeline is never blocked.
    pub fn publish(&self, batch: Arc<BatchUpdate>) {
        let entry = self
            .jobs
            .entry(batch.job_id)
            .or_insert_with(|| Mutex::new(JobChannel::new()));
        let mut channel = entry.lock().unwrap_or_else(|e| e.into_inner());

        channel.last_committed = batch.sequence;
        channel.ring.push_back(batch.clone());
        while channel.ring.len() > self.ring_capacity {
            channel.ring.pop_front();
        }

        channel.subscribers.retain(|subscriber| {
            match subscriber.tx.try_send(BrokerEvent::Batch(batch.clone())) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(
                        "Dropping slow subscriber {} of job {}",
                        subscriber.id, batch.job_id
                    );
                    subscriber.slow.store(true, Ordering::Release);
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!(
                        "Subscriber {} of job {} went away",
                        subscriber.id, batch.job_id
                    );
                    false
                }
            }
        });
    }

    /// Attach a subscriber: replay buffered batches with
    /// `sequence >= from_sequence` in order, then switch to live fan-out.
    pub fn subscribe(
        &self,
        job_id: Uuid,
        from_sequence: Option<u64>,
    ) -> Result<Subscription, AnalysisError> {
        let entry = self
            .jobs
            .get(&job_id)
            .ok_or(AnalysisError::JobNotFound(job_id))?;
        let mut channel = entry.lock().unwrap_or_else(|e| e.into_inner());

        // Default: live only, no backlog.
        let from = from_sequence.unwrap_or(channel.last_committed + 1);

        let mut resync = None;
        if let Some(floor) = channel.floor() {
            if from < floor {
                resync = Some(floor);
            }
        } else if from <= channel.last_committed {
            // Ring already evicted everything the subscriber asked for.
            resync = Some(channel.last_committed + 1);
        }

        let replay: Vec<Arc<BatchUpdate>> = channel
            .ring
            .iter()
            .filter(|batch| batch.sequence >= from)
            .cloned()
            .collect();

        // Sized so the whole backlog fits even before the pump drains;
        // live overflow beyond this is what defines a slow consumer.
        let capacity = replay.len() + self.subscriber_buffer + 1;
        let (tx, rx) = mpsc::channel(capacity);
        let slow = Arc::new(AtomicBool::new(false));

        if let Some(floor) = resync {
            let _ = tx.try_send(BrokerEvent::ResyncRequired { floor });
        }
        for batch in replay {
            // Cannot fail: the channel was sized for the backlog.
            let _ = tx.try_send(BrokerEvent::Batch(batch));
        }

        let id = Uuid::new_v4();
        channel.subscribers.push(SubscriberSlot {
            id,
            tx,
            slow: slow.clone(),
        });
        debug!("Subscriber {} attached to job {} from {}", id, job_id, from);

        Ok(Subscription {
            id,
            job_id,
            last_committed_sequence: channel.last_committed,
            rx,
            slow,
        })
    }

    /// Detach a subscriber explicitly (connection closed).
    pub fn unsubscribe(&self, job_id: Uuid, subscriber_id: Uuid) {
        if let Some(entry) = self.jobs.get(&job_id) {
            let mut channel = entry.lock().unwrap_or_else(|e| e.into_inner());
            channel.subscribers.retain(|s| s.id != subscriber_id);
        }
    }

    /// Drop all state for a job (after deletion).
    pub fn remove_job(&self, job_id: Uuid) {
        self.jobs.remove(&job_id);
    }
}
