//! Job handlers and the dispatch table.
//!
//! Handlers are the opaque business logic behind each job type: the
//! executor looks up `job_type` in the registry and invokes
//! `execute(ctx, payload)` with the payload bytes verbatim. Schema
//! validation of the payload is entirely the handler's concern.
//!
//! Handlers are untrusted with respect to latency and panics. The executor
//! bounds them with the per-job timeout, isolates panics on a separate
//! task, and delivers cancellation cooperatively through [`JobContext`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

/// Errors a handler can signal.
///
/// Retryable errors re-enter the backoff/retry path while attempts remain;
/// permanent errors go straight to the dead letter queue.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Transient failure; the job may be retried.
    #[error("retryable handler error: {0}")]
    Retryable(String),

    /// Non-recoverable failure; retrying would not help.
    #[error("permanent handler error: {0}")]
    Permanent(String),

    /// The handler observed the cancel flag and stopped.
    #[error("job cancelled by request")]
    Cancelled,
}

impl HandlerError {
    /// Creates a retryable error.
    pub fn retryable(message: impl Into<String>) -> Self {
        Self::Retryable(message.into())
    }

    /// Creates a permanent error.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent(message.into())
    }
}

/// Execution context handed to a handler.
///
/// Carries the job identity and the cooperative cancellation flag. A
/// handler that wants to support cancellation checks [`is_cancelled`] at
/// its natural checkpoints and returns [`HandlerError::Cancelled`]; a
/// handler that never checks simply runs to completion and the cancel
/// becomes a no-op for that attempt.
///
/// [`is_cancelled`]: JobContext::is_cancelled
#[derive(Debug, Clone)]
pub struct JobContext {
    job_id: Uuid,
    attempt: u32,
    cancelled: Arc<AtomicBool>,
}

impl JobContext {
    /// Creates a context for one execution attempt.
    pub fn new(job_id: Uuid, attempt: u32, cancelled: Arc<AtomicBool>) -> Self {
        Self {
            job_id,
            attempt,
            cancelled,
        }
    }

    /// Id of the executing job.
    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    /// Which dispatch this is (1-based).
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Whether cancellation has been requested for this job.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Returns `Err(HandlerError::Cancelled)` if cancellation was requested.
    ///
    /// Convenience for `ctx.checkpoint()?` at loop boundaries.
    pub fn checkpoint(&self) -> Result<(), HandlerError> {
        if self.is_cancelled() {
            Err(HandlerError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Business logic for one job type.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Executes the job. The payload is the submitted bytes, untouched;
    /// the returned bytes are recorded as the job result.
    async fn execute(&self, ctx: JobContext, payload: Vec<u8>) -> Result<Vec<u8>, HandlerError>;
}

/// Dispatch table from job type to handler.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn JobHandler>>>,
}

impl HandlerRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler for a job type, replacing any existing one.
    pub fn register(&self, job_type: impl Into<String>, handler: Arc<dyn JobHandler>) {
        let mut handlers = self.handlers.write().expect("registry lock poisoned");
        handlers.insert(job_type.into(), handler);
    }

    /// Looks up the handler for a job type.
    pub fn get(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        let handlers = self.handlers.read().expect("registry lock poisoned");
        handlers.get(job_type).cloned()
    }

    /// Registered job types.
    pub fn job_types(&self) -> Vec<String> {
        let handlers = self.handlers.read().expect("registry lock poisoned");
        handlers.keys().cloned().collect()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("job_types", &self.job_types())
            .finish()
    }
}
