//! Job definitions for the scheduling core.
//!
//! This module defines the types that travel through the scheduler:
//!
//! - `JobSpec`: what a caller submits (type, payload, resources, dependencies)
//! - `Job`: the authoritative record tracked by the job store
//! - `JobPriority` / `JobStatus`: the four priority tiers and the lifecycle states
//! - `ErrorKind` / `JobError`: the failure taxonomy recorded in `last_error`

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The four priority tiers, highest first.
///
/// Tiers partition the queue set; there are no weights or shares. A job in a
/// higher tier is always dispatched before any job in a lower tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobPriority {
    Critical,
    High,
    Normal,
    Low,
}

impl JobPriority {
    /// All tiers in dispatch order (highest first).
    pub const ALL: [JobPriority; 4] = [
        JobPriority::Critical,
        JobPriority::High,
        JobPriority::Normal,
        JobPriority::Low,
    ];

    /// Index of this tier in dispatch order: 0 = Critical .. 3 = Low.
    pub fn index(self) -> usize {
        match self {
            JobPriority::Critical => 0,
            JobPriority::High => 1,
            JobPriority::Normal => 2,
            JobPriority::Low => 3,
        }
    }
}

impl std::fmt::Display for JobPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobPriority::Critical => write!(f, "critical"),
            JobPriority::High => write!(f, "high"),
            JobPriority::Normal => write!(f, "normal"),
            JobPriority::Low => write!(f, "low"),
        }
    }
}

/// Lifecycle states of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Created, or waiting out a retry backoff.
    Pending,
    /// Waiting for one or more dependencies to complete.
    Blocked,
    /// Eligible for dispatch; present in a priority queue.
    Ready,
    /// Currently executing and holding ledger resources.
    Running,
    /// Finished successfully.
    Completed,
    /// Failed terminally (permanent error or dependency failure).
    Failed,
    /// The most recent attempt exceeded its deadline.
    Timeout,
    /// Cancelled by explicit request.
    Cancelled,
    /// Attempts exhausted or permanently failed; parked for manual retry.
    DeadLettered,
}

impl JobStatus {
    /// Whether this state ends the job's lifecycle (absent administrative
    /// retry from the dead letter queue).
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed
                | JobStatus::Failed
                | JobStatus::Timeout
                | JobStatus::Cancelled
                | JobStatus::DeadLettered
        )
    }

    /// Whether this terminal state counts as success for dependents.
    pub fn is_success(self) -> bool {
        self == JobStatus::Completed
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Blocked => "blocked",
            JobStatus::Ready => "ready",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Timeout => "timeout",
            JobStatus::Cancelled => "cancelled",
            JobStatus::DeadLettered => "dead_lettered",
        };
        write!(f, "{}", s)
    }
}

/// Classification of everything that can go wrong with a job.
///
/// Submission-time kinds surface as synchronous errors and are never
/// persisted; the rest are recorded in `last_error` and on events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    CycleDetected,
    UnknownParent,
    UnsatisfiableResources,
    InvalidSpec,
    HandlerErrorRetryable,
    HandlerErrorPermanent,
    HandlerCrash,
    Timeout,
    DependencyFailed,
    Cancelled,
}

impl ErrorKind {
    /// Whether a failure of this kind is eligible for retry.
    ///
    /// Crashes are retried like any other raised error; permanent handler
    /// errors, dependency failures, and cancellations are not.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::HandlerErrorRetryable | ErrorKind::HandlerCrash | ErrorKind::Timeout
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::CycleDetected => "CYCLE_DETECTED",
            ErrorKind::UnknownParent => "UNKNOWN_PARENT",
            ErrorKind::UnsatisfiableResources => "UNSATISFIABLE_RESOURCES",
            ErrorKind::InvalidSpec => "INVALID_SPEC",
            ErrorKind::HandlerErrorRetryable => "HANDLER_ERROR_RETRYABLE",
            ErrorKind::HandlerErrorPermanent => "HANDLER_ERROR_PERMANENT",
            ErrorKind::HandlerCrash => "HANDLER_CRASH",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::DependencyFailed => "DEPENDENCY_FAILED",
            ErrorKind::Cancelled => "CANCELLED",
        };
        write!(f, "{}", s)
    }
}

/// An error recorded against a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    /// Classification of the failure.
    pub kind: ErrorKind,
    /// Human-readable detail.
    pub message: String,
}

impl JobError {
    /// Creates a new job error.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for JobError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Specification of a job to submit.
///
/// The payload is an opaque byte blob passed verbatim to the handler
/// registered for `job_type`; schema validation is the handler's concern.
/// Retry and timeout fields default from the scheduler configuration when
/// left unset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    /// Handler dispatch tag.
    pub job_type: String,
    /// Priority tier.
    pub priority: JobPriority,
    /// Opaque payload handed to the handler.
    #[serde(default)]
    pub payload: Vec<u8>,
    /// CPU units required while running.
    pub cpu_units: u32,
    /// Memory in MB required while running.
    pub memory_mb: u32,
    /// Ids of jobs that must complete before this one may run.
    #[serde(default)]
    pub depends_on: Vec<Uuid>,
    /// Maximum total dispatches before dead-lettering.
    #[serde(default)]
    pub max_attempts: Option<u32>,
    /// Geometric growth factor for retry delays.
    #[serde(default)]
    pub backoff_multiplier: Option<f64>,
    /// Per-attempt execution deadline in seconds.
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    /// Duplicate submissions with the same key return the existing job.
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

impl JobSpec {
    /// Creates a spec with normal priority and minimal resource needs
    /// (1 CPU unit, 128 MB).
    pub fn new(job_type: impl Into<String>) -> Self {
        Self {
            job_type: job_type.into(),
            priority: JobPriority::Normal,
            payload: Vec::new(),
            cpu_units: 1,
            memory_mb: 128,
            depends_on: Vec::new(),
            max_attempts: None,
            backoff_multiplier: None,
            timeout_seconds: None,
            idempotency_key: None,
        }
    }

    /// Sets the priority tier.
    pub fn with_priority(mut self, priority: JobPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the opaque payload.
    pub fn with_payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = payload.into();
        self
    }

    /// Sets the resource requirements.
    pub fn with_resources(mut self, cpu_units: u32, memory_mb: u32) -> Self {
        self.cpu_units = cpu_units;
        self.memory_mb = memory_mb;
        self
    }

    /// Sets the parent jobs this one depends on.
    pub fn with_depends_on(mut self, parents: impl Into<Vec<Uuid>>) -> Self {
        self.depends_on = parents.into();
        self
    }

    /// Sets the maximum number of dispatch attempts.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Sets the retry backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = Some(multiplier);
        self
    }

    /// Sets the per-attempt timeout in seconds.
    pub fn with_timeout_seconds(mut self, seconds: u64) -> Self {
        self.timeout_seconds = Some(seconds);
        self
    }

    /// Sets the idempotency key.
    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

/// The authoritative job record.
///
/// Mutated only through the job store so every status transition is guarded
/// by a compare-and-set; a late timeout can never overwrite a completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique identifier, assigned at submission.
    pub id: Uuid,
    /// Handler dispatch tag.
    pub job_type: String,
    /// Priority tier.
    pub priority: JobPriority,
    /// Opaque payload handed to the handler.
    pub payload: Vec<u8>,
    /// CPU units held while running.
    pub cpu_units: u32,
    /// Memory in MB held while running.
    pub memory_mb: u32,
    /// Parent job ids.
    pub depends_on: Vec<Uuid>,
    /// Maximum total dispatches before dead-lettering.
    pub max_attempts: u32,
    /// Geometric growth factor for retry delays.
    pub backoff_multiplier: f64,
    /// Per-attempt execution deadline in seconds.
    pub timeout_seconds: u64,
    /// Current lifecycle state.
    pub status: JobStatus,
    /// Total dispatches so far; never reset by retries.
    pub attempt: u32,
    /// When the job was submitted.
    pub created_at: DateTime<Utc>,
    /// When the record last changed.
    pub updated_at: DateTime<Utc>,
    /// When the most recent attempt started.
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    /// When the job reached a terminal state.
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    /// When the next retry becomes eligible, while waiting out a backoff.
    #[serde(default)]
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Most recent failure, if any.
    #[serde(default)]
    pub last_error: Option<JobError>,
    /// Handler output recorded on completion.
    #[serde(default)]
    pub result: Option<Vec<u8>>,
    /// Deduplication key, if the caller provided one.
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

impl Job {
    /// Builds a job record from a spec, filling unset retry/timeout fields
    /// from the given defaults. The job starts in `Pending`; the scheduler
    /// decides the real initial state against the dependency graph.
    pub fn from_spec(
        spec: JobSpec,
        default_max_attempts: u32,
        default_backoff_multiplier: f64,
        default_timeout_seconds: u64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            job_type: spec.job_type,
            priority: spec.priority,
            payload: spec.payload,
            cpu_units: spec.cpu_units,
            memory_mb: spec.memory_mb,
            depends_on: spec.depends_on,
            max_attempts: spec.max_attempts.unwrap_or(default_max_attempts),
            backoff_multiplier: spec
                .backoff_multiplier
                .unwrap_or(default_backoff_multiplier),
            timeout_seconds: spec.timeout_seconds.unwrap_or(default_timeout_seconds),
            status: JobStatus::Pending,
            attempt: 0,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
            next_retry_at: None,
            last_error: None,
            result: None,
            idempotency_key: spec.idempotency_key,
        }
    }

    /// Whether another dispatch is allowed after a retryable failure.
    pub fn should_retry(&self) -> bool {
        self.attempt < self.max_attempts
    }

    /// Remaining dispatch attempts.
    pub fn remaining_attempts(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempt)
    }

    /// The per-attempt deadline as a duration.
    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.timeout_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_job(spec: JobSpec) -> Job {
        Job::from_spec(spec, 3, 2.0, 3600)
    }

    #[test]
    fn test_priority_dispatch_order() {
        assert_eq!(JobPriority::Critical.index(), 0);
        assert_eq!(JobPriority::High.index(), 1);
        assert_eq!(JobPriority::Normal.index(), 2);
        assert_eq!(JobPriority::Low.index(), 3);

        let indices: Vec<usize> = JobPriority::ALL.iter().map(|p| p.index()).collect();
        assert_eq!(indices, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_priority_display() {
        assert_eq!(format!("{}", JobPriority::Critical), "critical");
        assert_eq!(format!("{}", JobPriority::Low), "low");
    }

    #[test]
    fn test_status_terminality() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Timeout.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(JobStatus::DeadLettered.is_terminal());

        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Blocked.is_terminal());
        assert!(!JobStatus::Ready.is_terminal());
        assert!(!JobStatus::Running.is_terminal());

        assert!(JobStatus::Completed.is_success());
        assert!(!JobStatus::Failed.is_success());
    }

    #[test]
    fn test_error_kind_retryability() {
        assert!(ErrorKind::HandlerErrorRetryable.is_retryable());
        assert!(ErrorKind::HandlerCrash.is_retryable());
        assert!(ErrorKind::Timeout.is_retryable());

        assert!(!ErrorKind::HandlerErrorPermanent.is_retryable());
        assert!(!ErrorKind::DependencyFailed.is_retryable());
        assert!(!ErrorKind::Cancelled.is_retryable());
    }

    #[test]
    fn test_spec_defaults() {
        let spec = JobSpec::new("send_email");
        assert_eq!(spec.job_type, "send_email");
        assert_eq!(spec.priority, JobPriority::Normal);
        assert_eq!(spec.cpu_units, 1);
        assert_eq!(spec.memory_mb, 128);
        assert!(spec.depends_on.is_empty());
        assert!(spec.max_attempts.is_none());
    }

    #[test]
    fn test_spec_builder() {
        let parent = Uuid::new_v4();
        let spec = JobSpec::new("report_generation")
            .with_priority(JobPriority::High)
            .with_payload(br#"{"report_type":"daily_summary"}"#.to_vec())
            .with_resources(2, 512)
            .with_depends_on(vec![parent])
            .with_max_attempts(5)
            .with_backoff_multiplier(1.5)
            .with_timeout_seconds(120)
            .with_idempotency_key("report-2024-01-01");

        assert_eq!(spec.priority, JobPriority::High);
        assert_eq!(spec.cpu_units, 2);
        assert_eq!(spec.memory_mb, 512);
        assert_eq!(spec.depends_on, vec![parent]);
        assert_eq!(spec.max_attempts, Some(5));
        assert_eq!(spec.backoff_multiplier, Some(1.5));
        assert_eq!(spec.timeout_seconds, Some(120));
        assert_eq!(spec.idempotency_key.as_deref(), Some("report-2024-01-01"));
    }

    #[test]
    fn test_job_from_spec_applies_defaults() {
        let job = make_job(JobSpec::new("data_export"));

        assert_eq!(job.max_attempts, 3);
        assert!((job.backoff_multiplier - 2.0).abs() < f64::EPSILON);
        assert_eq!(job.timeout_seconds, 3600);
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempt, 0);
        assert!(job.started_at.is_none());
        assert!(job.last_error.is_none());
    }

    #[test]
    fn test_job_from_spec_keeps_overrides() {
        let job = make_job(
            JobSpec::new("data_export")
                .with_max_attempts(7)
                .with_backoff_multiplier(3.0)
                .with_timeout_seconds(30),
        );

        assert_eq!(job.max_attempts, 7);
        assert!((job.backoff_multiplier - 3.0).abs() < f64::EPSILON);
        assert_eq!(job.timeout_seconds, 30);
        assert_eq!(job.timeout(), std::time::Duration::from_secs(30));
    }

    #[test]
    fn test_attempt_accounting() {
        let mut job = make_job(JobSpec::new("flaky").with_max_attempts(2));

        assert!(job.should_retry());
        assert_eq!(job.remaining_attempts(), 2);

        job.attempt = 1;
        assert!(job.should_retry());
        assert_eq!(job.remaining_attempts(), 1);

        job.attempt = 2;
        assert!(!job.should_retry());
        assert_eq!(job.remaining_attempts(), 0);
    }

    #[test]
    fn test_job_serialization_roundtrip() {
        let mut job = make_job(
            JobSpec::new("send_email")
                .with_priority(JobPriority::Critical)
                .with_payload(b"hello".to_vec()),
        );
        job.last_error = Some(JobError::new(ErrorKind::Timeout, "deadline exceeded"));

        let json = serde_json::to_string(&job).expect("serialization should work");
        let parsed: Job = serde_json::from_str(&json).expect("deserialization should work");

        assert_eq!(parsed.id, job.id);
        assert_eq!(parsed.priority, JobPriority::Critical);
        assert_eq!(parsed.payload, b"hello");
        assert_eq!(
            parsed.last_error.as_ref().map(|e| e.kind),
            Some(ErrorKind::Timeout)
        );
    }

    #[test]
    fn test_error_kind_wire_format() {
        let json = serde_json::to_string(&ErrorKind::DependencyFailed).expect("should serialize");
        assert_eq!(json, "\"DEPENDENCY_FAILED\"");
        assert_eq!(format!("{}", ErrorKind::CycleDetected), "CYCLE_DETECTED");
    }

    #[test]
    fn test_job_error_display() {
        let err = JobError::new(ErrorKind::HandlerErrorPermanent, "bad payload");
        assert_eq!(format!("{}", err), "HANDLER_ERROR_PERMANENT: bad payload");
    }
}
