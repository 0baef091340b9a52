//! Dead letter queue.
//!
//! Terminal holding area for jobs whose attempts are exhausted or that
//! failed permanently. Entries wait here for an administrative retry;
//! nothing leaves the DLQ automatically. Newest entries sit at the front,
//! and per-type failure statistics are kept alongside.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::job::JobError;

/// Errors raised by DLQ administration.
#[derive(Debug, Error)]
pub enum DlqError {
    /// No entry with this job id.
    #[error("Job {0} not found in dead letter queue")]
    NotFound(Uuid),
}

/// A parked job record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    /// Id of the dead-lettered job.
    pub job_id: Uuid,
    /// Its handler dispatch tag.
    pub job_type: String,
    /// The failure that exhausted it.
    pub error: JobError,
    /// Total dispatch attempts made.
    pub attempts: u32,
    /// The job's payload, for inspection and replay.
    pub payload: Vec<u8>,
    /// When the final failure happened.
    pub failed_at: DateTime<Utc>,
}

/// Aggregate DLQ statistics.
#[derive(Debug, Clone, Serialize)]
pub struct DlqStats {
    /// Entries currently parked.
    pub in_queue: usize,
    /// Total jobs ever dead-lettered (not reduced by retry/clear).
    pub total_failed: u64,
    /// Dead-letter counts by job type.
    pub failed_by_type: HashMap<String, u64>,
    /// When the most recent entry arrived.
    pub last_failure: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct DlqInner {
    entries: VecDeque<DeadLetterEntry>,
    total_failed: u64,
    failed_by_type: HashMap<String, u64>,
    last_failure: Option<DateTime<Utc>>,
}

/// In-memory dead letter queue with per-type statistics.
#[derive(Debug, Default)]
pub struct DeadLetterQueue {
    inner: Mutex<DlqInner>,
}

impl DeadLetterQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parks an entry at the front (newest first).
    pub fn push(&self, entry: DeadLetterEntry) {
        let mut inner = self.inner.lock().expect("dlq lock poisoned");
        inner.total_failed += 1;
        *inner
            .failed_by_type
            .entry(entry.job_type.clone())
            .or_insert(0) += 1;
        inner.last_failure = Some(entry.failed_at);
        inner.entries.push_front(entry);
    }

    /// Number of parked entries.
    pub fn len(&self) -> usize {
        self.inner.lock().expect("dlq lock poisoned").entries.len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Lists entries, newest first.
    pub fn list(&self, limit: usize, offset: usize) -> Vec<DeadLetterEntry> {
        let inner = self.inner.lock().expect("dlq lock poisoned");
        inner
            .entries
            .iter()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Removes and returns the entry for a job, for administrative retry.
    pub fn take(&self, job_id: Uuid) -> Result<DeadLetterEntry, DlqError> {
        let mut inner = self.inner.lock().expect("dlq lock poisoned");
        let pos = inner
            .entries
            .iter()
            .position(|e| e.job_id == job_id)
            .ok_or(DlqError::NotFound(job_id))?;
        Ok(inner
            .entries
            .remove(pos)
            .expect("position came from the same lock hold"))
    }

    /// Clears parked entries, optionally only those of one job type.
    /// Returns how many were removed. Historical statistics are kept.
    pub fn clear(&self, job_type: Option<&str>) -> usize {
        let mut inner = self.inner.lock().expect("dlq lock poisoned");
        match job_type {
            None => {
                let removed = inner.entries.len();
                inner.entries.clear();
                removed
            }
            Some(job_type) => {
                let before = inner.entries.len();
                inner.entries.retain(|e| e.job_type != job_type);
                before - inner.entries.len()
            }
        }
    }

    /// Aggregate statistics.
    pub fn stats(&self) -> DlqStats {
        let inner = self.inner.lock().expect("dlq lock poisoned");
        DlqStats {
            in_queue: inner.entries.len(),
            total_failed: inner.total_failed,
            failed_by_type: inner.failed_by_type.clone(),
            last_failure: inner.last_failure,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::ErrorKind;

    fn entry(job_type: &str) -> DeadLetterEntry {
        DeadLetterEntry {
            job_id: Uuid::new_v4(),
            job_type: job_type.to_string(),
            error: JobError::new(ErrorKind::HandlerErrorPermanent, "exhausted"),
            attempts: 3,
            payload: b"{}".to_vec(),
            failed_at: Utc::now(),
        }
    }

    #[test]
    fn test_push_and_list_newest_first() {
        let dlq = DeadLetterQueue::new();
        let first = entry("send_email");
        let second = entry("data_export");
        let first_id = first.job_id;
        let second_id = second.job_id;

        dlq.push(first);
        dlq.push(second);

        assert_eq!(dlq.len(), 2);
        let listed = dlq.list(10, 0);
        assert_eq!(listed[0].job_id, second_id);
        assert_eq!(listed[1].job_id, first_id);
    }

    #[test]
    fn test_list_pagination() {
        let dlq = DeadLetterQueue::new();
        for _ in 0..5 {
            dlq.push(entry("send_email"));
        }

        assert_eq!(dlq.list(2, 0).len(), 2);
        assert_eq!(dlq.list(2, 4).len(), 1);
        assert_eq!(dlq.list(2, 5).len(), 0);
    }

    #[test]
    fn test_take_removes_entry() {
        let dlq = DeadLetterQueue::new();
        let e = entry("send_email");
        let id = e.job_id;
        dlq.push(e);

        let taken = dlq.take(id).expect("entry should exist");
        assert_eq!(taken.job_id, id);
        assert!(dlq.is_empty());

        let err = dlq.take(id).expect_err("already removed");
        assert!(matches!(err, DlqError::NotFound(_)));
    }

    #[test]
    fn test_clear_by_type() {
        let dlq = DeadLetterQueue::new();
        dlq.push(entry("send_email"));
        dlq.push(entry("send_email"));
        dlq.push(entry("data_export"));

        assert_eq!(dlq.clear(Some("send_email")), 2);
        assert_eq!(dlq.len(), 1);
        assert_eq!(dlq.list(10, 0)[0].job_type, "data_export");

        assert_eq!(dlq.clear(None), 1);
        assert!(dlq.is_empty());
    }

    #[test]
    fn test_stats_survive_retry_and_clear() {
        let dlq = DeadLetterQueue::new();
        let e = entry("send_email");
        let id = e.job_id;
        dlq.push(e);
        dlq.push(entry("data_export"));

        dlq.take(id).expect("take");
        dlq.clear(None);

        let stats = dlq.stats();
        assert_eq!(stats.in_queue, 0);
        assert_eq!(stats.total_failed, 2);
        assert_eq!(stats.failed_by_type.get("send_email"), Some(&1));
        assert_eq!(stats.failed_by_type.get("data_export"), Some(&1));
        assert!(stats.last_failure.is_some());
    }
}
