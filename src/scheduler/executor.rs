//! Executor pool.
//!
//! Bounded-concurrency execution of admitted jobs. Each job runs its
//! handler on a dedicated task (so a panic is contained and reported, never
//! fatal to the pool) raced against the job's own deadline. Admission
//! suspends in `dispatch` when all permits are taken; that suspension is
//! the scheduler's backpressure mechanism.
//!
//! Resource release always happens before the terminal status is committed,
//! so a long cascade or a slow store can never delay freeing capacity.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Semaphore;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::handler::{HandlerError, JobContext};
use crate::job::{ErrorKind, Job, JobError};

use super::{retry, SchedulerCore};

/// Outcome of one execution attempt, before retry routing.
#[derive(Debug)]
pub(crate) enum ExecOutcome {
    /// The handler returned normally.
    Success(Vec<u8>),
    /// The handler failed or crashed.
    Failure(JobError),
    /// The attempt exceeded the job's deadline.
    TimedOut,
    /// The handler honored the cooperative cancel flag.
    Cancelled,
}

/// Concurrency bound plus the registry of in-flight cancel flags.
pub(crate) struct ExecutorPool {
    semaphore: Arc<Semaphore>,
    running: Mutex<HashMap<Uuid, Arc<AtomicBool>>>,
}

impl ExecutorPool {
    pub(crate) fn new(max_concurrent: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            running: Mutex::new(HashMap::new()),
        }
    }

    /// Jobs currently executing.
    pub(crate) fn running_count(&self) -> usize {
        self.running.lock().expect("executor lock poisoned").len()
    }

    /// Raises the cancel flag for a running job. Returns whether the job
    /// was actually in flight.
    pub(crate) fn request_cancel(&self, id: Uuid) -> bool {
        let running = self.running.lock().expect("executor lock poisoned");
        match running.get(&id) {
            Some(flag) => {
                flag.store(true, Ordering::Release);
                true
            }
            None => false,
        }
    }

    fn register(&self, id: Uuid, flag: Arc<AtomicBool>) {
        self.running
            .lock()
            .expect("executor lock poisoned")
            .insert(id, flag);
    }

    fn unregister(&self, id: Uuid) {
        self.running
            .lock()
            .expect("executor lock poisoned")
            .remove(&id);
    }
}

/// Hands a RUNNING job to the pool.
///
/// Suspends until a permit is free, then spawns the execution task and
/// returns; the admission loop moves on to the next queue entry.
pub(crate) async fn dispatch(core: &Arc<SchedulerCore>, job: Job, attempt: u32) {
    let permit = match Arc::clone(&core.executor.semaphore).acquire_owned().await {
        Ok(permit) => permit,
        // The semaphore is never closed; this arm is unreachable in practice.
        Err(_) => {
            error!(job_id = %job.id, "executor semaphore closed, dropping dispatch");
            core.ledger.release(job.cpu_units, job.memory_mb);
            return;
        }
    };

    let cancel = Arc::new(AtomicBool::new(false));
    core.executor.register(job.id, Arc::clone(&cancel));

    let core = Arc::clone(core);
    tokio::spawn(async move {
        let outcome = execute(&core, &job, attempt, cancel).await;

        // Capacity back first; the terminal commit and any cascade come after.
        core.ledger.release(job.cpu_units, job.memory_mb);
        core.executor.unregister(job.id);

        retry::finish(&core, job, attempt, outcome).await;
        drop(permit);
    });
}

/// Runs the handler under the job's deadline, mapping every way it can end
/// into an [`ExecOutcome`].
async fn execute(
    core: &Arc<SchedulerCore>,
    job: &Job,
    attempt: u32,
    cancel: Arc<AtomicBool>,
) -> ExecOutcome {
    let handler = match core.registry.get(&job.job_type) {
        Some(handler) => handler,
        None => {
            return ExecOutcome::Failure(JobError::new(
                ErrorKind::HandlerErrorPermanent,
                format!("no handler registered for job type '{}'", job.job_type),
            ));
        }
    };

    let ctx = JobContext::new(job.id, attempt, cancel);
    let payload = job.payload.clone();

    // The handler gets its own task so a panic surfaces as a JoinError
    // instead of tearing down the executor.
    let mut task = tokio::spawn(async move { handler.execute(ctx, payload).await });

    match tokio::time::timeout(job.timeout(), &mut task).await {
        Err(_) => {
            task.abort();
            warn!(
                job_id = %job.id,
                attempt,
                timeout_seconds = job.timeout_seconds,
                "Job attempt exceeded its deadline"
            );
            ExecOutcome::TimedOut
        }
        Ok(Ok(Ok(result))) => ExecOutcome::Success(result),
        Ok(Ok(Err(HandlerError::Retryable(message)))) => {
            ExecOutcome::Failure(JobError::new(ErrorKind::HandlerErrorRetryable, message))
        }
        Ok(Ok(Err(HandlerError::Permanent(message)))) => {
            ExecOutcome::Failure(JobError::new(ErrorKind::HandlerErrorPermanent, message))
        }
        Ok(Ok(Err(HandlerError::Cancelled))) => {
            debug!(job_id = %job.id, attempt, "Handler honored cancellation");
            ExecOutcome::Cancelled
        }
        Ok(Err(join_err)) if join_err.is_panic() => {
            let panic = join_err.into_panic();
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "handler panicked".to_string());
            error!(job_id = %job.id, attempt, panic = %message, "Handler crashed");
            ExecOutcome::Failure(JobError::new(ErrorKind::HandlerCrash, message))
        }
        Ok(Err(_)) => ExecOutcome::Failure(JobError::new(
            ErrorKind::HandlerCrash,
            "handler task was aborted",
        )),
    }
}
