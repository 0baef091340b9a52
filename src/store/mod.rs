//! Job state store.
//!
//! The store is the authoritative, per-id linearizable record of every job.
//! All status transitions go through `cas_status`, which applies the
//! transition and its side fields (timestamps, attempt counter, error,
//! result) in one atomic step, so a late timeout can never overwrite a
//! completion, and no two tasks can advance the same job concurrently.
//!
//! `JobStore` is the seam for durable backends; the crate ships
//! `MemoryJobStore` and assumes nothing beyond point reads/writes, per-id
//! CAS, and filtered listing. Cross-job consistency is maintained by the
//! scheduler's in-memory components, never by multi-key transactions here.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::job::{Job, JobError, JobPriority, JobStatus};

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The job id is not present in the store.
    #[error("Job {0} not found")]
    NotFound(Uuid),

    /// A job with this id already exists.
    #[error("Job {0} already exists")]
    Duplicate(Uuid),

    /// Backend-specific failure (connection loss, serialization, ...).
    #[error("Store backend error: {0}")]
    Backend(String),
}

/// Side fields applied together with a status transition.
///
/// Timestamps are stamped by the store itself from the new status:
/// `updated_at` always, `started_at` on entering RUNNING, `finished_at` on
/// entering a terminal state. `next_retry_at` is cleared on any transition
/// away from PENDING.
#[derive(Debug, Clone, Default)]
pub struct StatusPatch {
    /// Failure to record in `last_error`.
    pub last_error: Option<JobError>,
    /// Handler output to record on completion.
    pub result: Option<Vec<u8>>,
    /// When the next retry becomes eligible (set when parking in PENDING).
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Increment the attempt counter (set when entering RUNNING).
    pub bump_attempt: bool,
    /// Reset the attempt counter to zero (dead letter queue retry only).
    pub reset_attempt: bool,
}

impl StatusPatch {
    /// An empty patch: just the status transition and timestamps.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a failure alongside the transition.
    pub fn with_error(mut self, error: JobError) -> Self {
        self.last_error = Some(error);
        self
    }

    /// Records the handler result alongside the transition.
    pub fn with_result(mut self, result: Vec<u8>) -> Self {
        self.result = Some(result);
        self
    }

    /// Records the retry eligibility time alongside the transition.
    pub fn with_next_retry_at(mut self, at: DateTime<Utc>) -> Self {
        self.next_retry_at = Some(at);
        self
    }

    /// Increments the attempt counter as part of the transition.
    pub fn bump_attempt(mut self) -> Self {
        self.bump_attempt = true;
        self
    }

    /// Resets the attempt counter as part of the transition.
    pub fn reset_attempt(mut self) -> Self {
        self.reset_attempt = true;
        self
    }
}

/// Filter for listing jobs.
#[derive(Debug, Clone)]
pub struct JobFilter {
    /// Only jobs in this status.
    pub status: Option<JobStatus>,
    /// Only jobs in this priority tier.
    pub priority: Option<JobPriority>,
    /// Case-insensitive substring match on the job type.
    pub job_type: Option<String>,
    /// Page size.
    pub limit: usize,
    /// Number of matching jobs to skip.
    pub offset: usize,
}

impl Default for JobFilter {
    fn default() -> Self {
        Self {
            status: None,
            priority: None,
            job_type: None,
            limit: 50,
            offset: 0,
        }
    }
}

impl JobFilter {
    /// Creates a filter matching everything, with the default page size.
    pub fn new() -> Self {
        Self::default()
    }

    /// Restricts to a status.
    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Restricts to a priority tier.
    pub fn with_priority(mut self, priority: JobPriority) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Restricts to job types containing this string (case-insensitive).
    pub fn with_job_type(mut self, job_type: impl Into<String>) -> Self {
        self.job_type = Some(job_type.into());
        self
    }

    /// Sets the page size.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    /// Sets the page offset.
    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    fn matches(&self, job: &Job) -> bool {
        if let Some(status) = self.status {
            if job.status != status {
                return false;
            }
        }
        if let Some(priority) = self.priority {
            if job.priority != priority {
                return false;
            }
        }
        if let Some(ref job_type) = self.job_type {
            if !job
                .job_type
                .to_lowercase()
                .contains(&job_type.to_lowercase())
            {
                return false;
            }
        }
        true
    }
}

/// One page of a job listing.
#[derive(Debug, Clone)]
pub struct Page {
    /// Jobs on this page, newest first.
    pub jobs: Vec<Job>,
    /// Total number of jobs matching the filter.
    pub total: usize,
}

/// Authoritative per-id job storage.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persists a new job record.
    async fn insert(&self, job: Job) -> Result<(), StoreError>;

    /// Point read by id.
    async fn get(&self, id: Uuid) -> Result<Option<Job>, StoreError>;

    /// Transitions `id` from `expected` to `new`, applying `patch`
    /// atomically with the status change.
    ///
    /// Returns `Ok(false)` without touching the record when the current
    /// status is not `expected`.
    async fn cas_status(
        &self,
        id: Uuid,
        expected: JobStatus,
        new: JobStatus,
        patch: StatusPatch,
    ) -> Result<bool, StoreError>;

    /// Lists jobs matching the filter, newest first.
    async fn list(&self, filter: &JobFilter) -> Result<Page, StoreError>;

    /// Number of jobs currently in the given status.
    async fn count_status(&self, status: JobStatus) -> Result<usize, StoreError>;

    /// Looks up a job by its idempotency key.
    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Job>, StoreError>;
}

/// In-memory `JobStore` implementation.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<Uuid, Job>>,
}

impl MemoryJobStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records in the store.
    pub fn len(&self) -> usize {
        self.jobs.read().expect("store lock poisoned").len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, job: Job) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write().expect("store lock poisoned");
        if jobs.contains_key(&job.id) {
            return Err(StoreError::Duplicate(job.id));
        }
        jobs.insert(job.id, job);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        let jobs = self.jobs.read().expect("store lock poisoned");
        Ok(jobs.get(&id).cloned())
    }

    async fn cas_status(
        &self,
        id: Uuid,
        expected: JobStatus,
        new: JobStatus,
        patch: StatusPatch,
    ) -> Result<bool, StoreError> {
        let mut jobs = self.jobs.write().expect("store lock poisoned");
        let job = jobs.get_mut(&id).ok_or(StoreError::NotFound(id))?;

        if job.status != expected {
            return Ok(false);
        }

        let now = Utc::now();
        job.status = new;
        job.updated_at = now;
        if new == JobStatus::Running {
            job.started_at = Some(now);
        }
        if new.is_terminal() {
            job.finished_at = Some(now);
        }
        if new != JobStatus::Pending {
            job.next_retry_at = None;
        }

        if patch.bump_attempt {
            job.attempt += 1;
        }
        if patch.reset_attempt {
            job.attempt = 0;
        }
        if let Some(error) = patch.last_error {
            job.last_error = Some(error);
        }
        if let Some(result) = patch.result {
            job.result = Some(result);
        }
        if let Some(at) = patch.next_retry_at {
            job.next_retry_at = Some(at);
        }

        Ok(true)
    }

    async fn list(&self, filter: &JobFilter) -> Result<Page, StoreError> {
        let jobs = self.jobs.read().expect("store lock poisoned");
        let mut matching: Vec<&Job> = jobs.values().filter(|j| filter.matches(j)).collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let total = matching.len();
        let page = matching
            .into_iter()
            .skip(filter.offset)
            .take(filter.limit)
            .cloned()
            .collect();

        Ok(Page { jobs: page, total })
    }

    async fn count_status(&self, status: JobStatus) -> Result<usize, StoreError> {
        let jobs = self.jobs.read().expect("store lock poisoned");
        Ok(jobs.values().filter(|j| j.status == status).count())
    }

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Job>, StoreError> {
        let jobs = self.jobs.read().expect("store lock poisoned");
        Ok(jobs
            .values()
            .find(|j| j.idempotency_key.as_deref() == Some(key))
            .cloned())
    }
}
