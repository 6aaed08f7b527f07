//! Job lifecycle events.
//!
//! The lifecycle authority publishes an event after every persisted change.
//! Delivery is best effort: a slow or vanished subscriber loses events, it
//! never blocks or fails job processing.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::model::Job;

/// Per-subscriber buffer before events are dropped.
const SUBSCRIBER_BUFFER: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobEventKind {
    JobCreated,
    JobUpdated,
    JobDeleted,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobEvent {
    pub kind: JobEventKind,
    pub job_id: String,
    /// Snapshot after the change. Absent for deletions.
    pub job: Option<Job>,
    pub timestamp: DateTime<Utc>,
}

impl JobEvent {
    pub fn created(job: &Job) -> Self {
        Self::snapshot(JobEventKind::JobCreated, job)
    }

    pub fn updated(job: &Job) -> Self {
        Self::snapshot(JobEventKind::JobUpdated, job)
    }

    pub fn deleted(job_id: impl Into<String>) -> Self {
        Self {
            kind: JobEventKind::JobDeleted,
            job_id: job_id.into(),
            job: None,
            timestamp: Utc::now(),
        }
    }

    fn snapshot(kind: JobEventKind, job: &Job) -> Self {
        Self {
            kind,
            job_id: job.id.clone(),
            job: Some(job.clone()),
            timestamp: Utc::now(),
        }
    }
}

pub type SubscriptionId = u64;

/// Receiving end of a subscription.
#[derive(Debug)]
pub struct JobSubscription {
    pub id: SubscriptionId,
    pub receiver: mpsc::Receiver<JobEvent>,
}

/// Fan-out of lifecycle events to external listeners.
pub trait JobNotifier: Send + Sync {
    fn subscribe(&self) -> JobSubscription;
    fn unsubscribe(&self, id: SubscriptionId) -> bool;
    /// Fire and forget.
    fn publish(&self, event: JobEvent);
}

/// In-process notifier backed by one bounded channel per subscriber.
#[derive(Debug, Default)]
pub struct JobEventBus {
    subscribers: DashMap<SubscriptionId, mpsc::Sender<JobEvent>>,
    next_id: AtomicU64,
}

impl JobEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

impl JobNotifier for JobEventBus {
    fn subscribe(&self) -> JobSubscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, receiver) = mpsc::channel(SUBSCRIBER_BUFFER);
        self.subscribers.insert(id, tx);
        JobSubscription { id, receiver }
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.subscribers.remove(&id).is_some()
    }

    fn publish(&self, event: JobEvent) {
        trace!(kind = %event.kind, job_id = %event.job_id, "publishing job event");

        let mut closed = Vec::new();
        for entry in self.subscribers.iter() {
            match entry.value().try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!(subscriber = *entry.key(), "subscriber lagging, event dropped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => closed.push(*entry.key()),
            }
        }
        // Removal happens after iteration; DashMap shards are still read-locked inside it.
        for id in closed {
            self.subscribers.remove(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_every_subscriber() {
        let bus = JobEventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.publish(JobEvent::deleted("job-1"));

        for sub in [&mut a, &mut b] {
            let event = sub.receiver.recv().await.unwrap();
            assert_eq!(event.kind, JobEventKind::JobDeleted);
            assert_eq!(event.job_id, "job-1");
        }
    }

    #[tokio::test]
    async fn test_unsubscribe_and_dropped_receivers() {
        let bus = JobEventBus::new();
        let a = bus.subscribe();
        let b = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        assert!(bus.unsubscribe(a.id));
        assert!(!bus.unsubscribe(a.id));

        drop(b);
        bus.publish(JobEvent::deleted("job-1"));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_publish_without_subscribers_is_noop() {
        let bus = JobEventBus::new();
        bus.publish(JobEvent::deleted("job-1"));
        assert_eq!(JobEventKind::JobUpdated.to_string(), "job_updated");
    }
}
