//! Error types for the scheduler's public surface.
//!
//! Component-local errors live next to their components (`GraphError`,
//! `StoreError`, `HandlerError`, `DlqError`, `ConfigError`); the enums here
//! are what callers of the `Scheduler` facade see.

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::dlq::DlqError;
use crate::graph::GraphError;
use crate::job::JobStatus;
use crate::store::StoreError;

/// Errors surfaced synchronously by `submit`. On any of these, no job
/// record or graph edge remains.
#[derive(Debug, Error)]
pub enum SubmitError {
    /// The submission's dependencies would close a cycle.
    #[error("Dependency cycle detected involving job {0}")]
    CycleDetected(Uuid),

    /// A dependency references a job id that was never submitted.
    #[error("Unknown parent job {0}")]
    UnknownParent(Uuid),

    /// The job asks for more than the ledger will ever hold.
    #[error(
        "Job requires {cpu_units} CPU / {memory_mb} MB but capacity is \
         {cpu_capacity} CPU / {memory_capacity_mb} MB"
    )]
    UnsatisfiableResources {
        cpu_units: u32,
        memory_mb: u32,
        cpu_capacity: u32,
        memory_capacity_mb: u32,
    },

    /// The spec failed validation.
    #[error("Invalid job spec: {0}")]
    InvalidSpec(String),

    /// The job store rejected the write.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<GraphError> for SubmitError {
    fn from(err: GraphError) -> Self {
        match err {
            GraphError::UnknownParent(id) => SubmitError::UnknownParent(id),
            GraphError::CycleDetected(id) => SubmitError::CycleDetected(id),
        }
    }
}

/// Errors surfaced by `cancel`.
#[derive(Debug, Error)]
pub enum CancelError {
    /// No job with this id.
    #[error("Job {0} not found")]
    NotFound(Uuid),

    /// The job already reached a terminal state.
    #[error("Job {id} is already terminal ({status})")]
    AlreadyTerminal { id: Uuid, status: JobStatus },

    /// The job store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors surfaced by the remaining scheduler operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// No job with this id.
    #[error("Job {0} not found")]
    NotFound(Uuid),

    /// `start` was called on a running scheduler.
    #[error("Scheduler is already running")]
    AlreadyRunning,

    /// `shutdown` was called on a stopped scheduler.
    #[error("Scheduler is not running")]
    NotRunning,

    /// Running jobs did not drain within the shutdown grace period.
    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),

    /// Dead letter queue administration failed.
    #[error(transparent)]
    Dlq(#[from] DlqError),

    /// The job store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_graph_error_conversion() {
        let id = Uuid::new_v4();
        let err: SubmitError = GraphError::UnknownParent(id).into();
        assert!(matches!(err, SubmitError::UnknownParent(got) if got == id));

        let err: SubmitError = GraphError::CycleDetected(id).into();
        assert!(matches!(err, SubmitError::CycleDetected(got) if got == id));
    }

    #[test]
    fn test_error_display() {
        let err = SubmitError::UnsatisfiableResources {
            cpu_units: 16,
            memory_mb: 8192,
            cpu_capacity: 8,
            memory_capacity_mb: 4096,
        };
        let message = err.to_string();
        assert!(message.contains("16 CPU"));
        assert!(message.contains("capacity is 8 CPU"));

        let err = CancelError::AlreadyTerminal {
            id: Uuid::new_v4(),
            status: JobStatus::Completed,
        };
        assert!(err.to_string().contains("completed"));

        let err = SchedulerError::ShutdownTimeout(Duration::from_secs(30));
        assert!(err.to_string().contains("30"));
    }
}
