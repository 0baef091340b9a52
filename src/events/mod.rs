//! Lifecycle event stream.
//!
//! Every externally observable job transition is published on a broadcast
//! channel; subscribers (the WebSocket layer, tests, metrics sinks) get an
//! independent receiver. Publishing never blocks and never fails: events
//! are telemetry, and a send with no subscribers is simply dropped.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::job::{ErrorKind, JobPriority, JobStatus};

/// A job lifecycle event.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    /// A job was accepted by `submit`.
    Submitted {
        job_id: Uuid,
        job_type: String,
        priority: JobPriority,
        status: JobStatus,
    },
    /// A job entered the ready queue.
    Ready { job_id: Uuid },
    /// An execution attempt started.
    Started { job_id: Uuid, attempt: u32 },
    /// The job finished successfully.
    Completed { job_id: Uuid },
    /// An attempt failed (terminally or pending retry routing).
    Failed {
        job_id: Uuid,
        kind: ErrorKind,
        message: String,
    },
    /// An attempt exceeded its deadline.
    TimedOut { job_id: Uuid, attempt: u32 },
    /// The job was cancelled.
    Cancelled { job_id: Uuid },
    /// The job was parked in the dead letter queue.
    DeadLettered {
        job_id: Uuid,
        kind: ErrorKind,
        attempts: u32,
    },
    /// A retry was scheduled after a retryable failure.
    Retrying {
        job_id: Uuid,
        attempt: u32,
        retry_at: DateTime<Utc>,
    },
}

impl Event {
    /// The job this event concerns.
    pub fn job_id(&self) -> Uuid {
        match self {
            Event::Submitted { job_id, .. }
            | Event::Ready { job_id }
            | Event::Started { job_id, .. }
            | Event::Completed { job_id }
            | Event::Failed { job_id, .. }
            | Event::TimedOut { job_id, .. }
            | Event::Cancelled { job_id }
            | Event::DeadLettered { job_id, .. }
            | Event::Retrying { job_id, .. } => *job_id,
        }
    }
}

/// Broadcast fan-out of lifecycle events.
#[derive(Debug)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    /// Creates a bus with the given per-subscriber buffer capacity.
    ///
    /// Slow subscribers that fall more than `capacity` events behind
    /// observe a `Lagged` error and skip ahead; the scheduler is never
    /// backpressured by them.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Opens a new independent event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Publishes an event to all current subscribers.
    pub fn publish(&self, event: Event) {
        // No subscribers is fine; events are observational.
        let _ = self.tx.send(event);
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
