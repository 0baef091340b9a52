//! Terminal-outcome routing: commit, retry, or dead-letter.
//!
//! Every execution outcome lands here after resources are released. The
//! terminal status is committed through `cas_status`, then retryable
//! failures with attempts remaining are parked in PENDING behind a backoff
//! timer, and everything else is either done (success, cancel) or handed to
//! the dead letter queue with a failure cascade to dependents.
//!
//! Retry timers re-arm through `cas_status(PENDING -> READY)`; a
//! cancellation that lands first makes that CAS fail and the retry
//! dissolves; cancellation is terminal.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::config::SchedulerConfig;
use crate::dlq::DeadLetterEntry;
use crate::events::Event;
use crate::job::{ErrorKind, Job, JobError, JobStatus};
use crate::store::StatusPatch;

use super::cascade::CascadeSignal;
use super::executor::ExecOutcome;
use super::SchedulerCore;

/// Commits the outcome of one attempt and routes what follows.
pub(crate) async fn finish(core: &Arc<SchedulerCore>, job: Job, attempt: u32, outcome: ExecOutcome) {
    match outcome {
        ExecOutcome::Success(result) => {
            let committed = cas(
                core,
                &job,
                JobStatus::Completed,
                StatusPatch::new().with_result(result),
            )
            .await;
            if committed {
                info!(job_id = %job.id, job_type = %job.job_type, attempt, "Job completed");
                core.throughput.record();
                core.events.publish(Event::Completed { job_id: job.id });
                notify_cascade(core, &job, true);
            }
        }

        ExecOutcome::Cancelled => {
            let error = JobError::new(ErrorKind::Cancelled, "cancelled by request");
            let committed = cas(
                core,
                &job,
                JobStatus::Cancelled,
                StatusPatch::new().with_error(error),
            )
            .await;
            if committed {
                info!(job_id = %job.id, attempt, "Job cancelled during execution");
                core.events.publish(Event::Cancelled { job_id: job.id });
                notify_cascade(core, &job, false);
            }
        }

        ExecOutcome::TimedOut => {
            let error = JobError::new(
                ErrorKind::Timeout,
                format!(
                    "attempt {} exceeded the {} s deadline",
                    attempt, job.timeout_seconds
                ),
            );
            let committed = cas(
                core,
                &job,
                JobStatus::Timeout,
                StatusPatch::new().with_error(error.clone()),
            )
            .await;
            if committed {
                core.events.publish(Event::TimedOut {
                    job_id: job.id,
                    attempt,
                });
                route_failure(core, job, attempt, JobStatus::Timeout, error).await;
            }
        }

        ExecOutcome::Failure(error) => {
            let committed = cas(
                core,
                &job,
                JobStatus::Failed,
                StatusPatch::new().with_error(error.clone()),
            )
            .await;
            if committed {
                core.events.publish(Event::Failed {
                    job_id: job.id,
                    kind: error.kind,
                    message: error.message.clone(),
                });
                route_failure(core, job, attempt, JobStatus::Failed, error).await;
            }
        }
    }
}

/// Decides between a delayed retry and the dead letter queue.
async fn route_failure(
    core: &Arc<SchedulerCore>,
    job: Job,
    attempt: u32,
    from: JobStatus,
    error: JobError,
) {
    if error.kind.is_retryable() && attempt < job.max_attempts {
        let delay = backoff_delay(&core.config, attempt, job.backoff_multiplier);
        schedule_retry(core, job, attempt, from, delay).await;
    } else {
        dead_letter(core, job, attempt, from, error).await;
    }
}

/// Parks the job in PENDING and arms the backoff timer.
async fn schedule_retry(
    core: &Arc<SchedulerCore>,
    job: Job,
    attempt: u32,
    from: JobStatus,
    delay: Duration,
) {
    let retry_at = Utc::now()
        + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::seconds(0));

    let parked = match core
        .store
        .cas_status(
            job.id,
            from,
            JobStatus::Pending,
            StatusPatch::new().with_next_retry_at(retry_at),
        )
        .await
    {
        Ok(parked) => parked,
        Err(err) => {
            error!(job_id = %job.id, error = %err, "Failed to park job for retry");
            return;
        }
    };
    if !parked {
        // Cancelled between the terminal commit and the park.
        debug!(job_id = %job.id, "Retry superseded by a concurrent transition");
        return;
    }

    warn!(
        job_id = %job.id,
        attempt,
        max_attempts = job.max_attempts,
        delay_ms = delay.as_millis() as u64,
        "Job failed, retry scheduled"
    );
    core.events.publish(Event::Retrying {
        job_id: job.id,
        attempt,
        retry_at,
    });

    let core = Arc::clone(core);
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        match core
            .store
            .cas_status(job.id, JobStatus::Pending, JobStatus::Ready, StatusPatch::new())
            .await
        {
            Ok(true) => {
                core.queue.push(job.priority, job.id);
                core.events.publish(Event::Ready { job_id: job.id });
            }
            Ok(false) => {
                // Cancelled while waiting out the backoff.
                debug!(job_id = %job.id, "Scheduled retry suppressed");
            }
            Err(err) => {
                error!(job_id = %job.id, error = %err, "Failed to re-enqueue retry");
            }
        }
    });
}

/// Moves the job to DEAD_LETTERED and fails its dependents.
async fn dead_letter(
    core: &Arc<SchedulerCore>,
    job: Job,
    attempt: u32,
    from: JobStatus,
    error: JobError,
) {
    let parked = match core
        .store
        .cas_status(job.id, from, JobStatus::DeadLettered, StatusPatch::new())
        .await
    {
        Ok(parked) => parked,
        Err(err) => {
            error!(job_id = %job.id, error = %err, "Failed to dead-letter job");
            return;
        }
    };
    if !parked {
        debug!(job_id = %job.id, "Dead-letter superseded by a concurrent transition");
        return;
    }

    error!(
        job_id = %job.id,
        job_type = %job.job_type,
        attempts = attempt,
        kind = %error.kind,
        "Job failed permanently, moved to dead letter queue"
    );
    core.dlq.push(DeadLetterEntry {
        job_id: job.id,
        job_type: job.job_type.clone(),
        error: error.clone(),
        attempts: attempt,
        payload: job.payload.clone(),
        failed_at: Utc::now(),
    });
    core.events.publish(Event::DeadLettered {
        job_id: job.id,
        kind: error.kind,
        attempts: attempt,
    });
    notify_cascade(core, &job, false);
}

async fn cas(
    core: &Arc<SchedulerCore>,
    job: &Job,
    new: JobStatus,
    patch: StatusPatch,
) -> bool {
    match core
        .store
        .cas_status(job.id, JobStatus::Running, new, patch)
        .await
    {
        Ok(true) => true,
        Ok(false) => {
            warn!(
                job_id = %job.id,
                intended = %new,
                "Terminal transition lost, job was no longer running"
            );
            false
        }
        Err(err) => {
            error!(job_id = %job.id, error = %err, "Failed to commit terminal status");
            false
        }
    }
}

fn notify_cascade(core: &Arc<SchedulerCore>, job: &Job, success: bool) {
    // The consumer only goes away at shutdown; losing a cascade then is fine.
    let _ = core.cascade_tx.send(CascadeSignal {
        parent: job.id,
        success,
    });
}

/// Retry delay for the attempt that just failed: `base * multiplier^(n-1)`,
/// clamped to the configured bounds.
pub(crate) fn backoff_delay(config: &SchedulerConfig, attempt: u32, multiplier: f64) -> Duration {
    let exponent = attempt.saturating_sub(1).min(63);
    let factor = multiplier.powi(exponent as i32);
    let raw = config.retry_base_delay.as_secs_f64() * factor;
    let clamped = raw.clamp(
        config.retry_min_delay.as_secs_f64(),
        config.retry_max_delay.as_secs_f64(),
    );
    Duration::from_secs_f64(clamped)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SchedulerConfig {
        SchedulerConfig::default()
    }

    #[test]
    fn test_backoff_grows_geometrically() {
        let config = config();
        assert_eq!(backoff_delay(&config, 1, 2.0), Duration::from_secs(1));
        assert_eq!(backoff_delay(&config, 2, 2.0), Duration::from_secs(2));
        assert_eq!(backoff_delay(&config, 3, 2.0), Duration::from_secs(4));
        assert_eq!(backoff_delay(&config, 4, 2.0), Duration::from_secs(8));
    }

    #[test]
    fn test_backoff_clamps_to_max() {
        let config = config();
        // 1 s * 2^20 is far beyond the 300 s ceiling.
        assert_eq!(backoff_delay(&config, 21, 2.0), Duration::from_secs(300));
        // Absurd exponents must not overflow into nonsense.
        assert_eq!(backoff_delay(&config, u32::MAX, 10.0), Duration::from_secs(300));
    }

    #[test]
    fn test_backoff_clamps_to_min() {
        let config = SchedulerConfig::default().with_retry_delays(
            Duration::from_millis(100),
            Duration::from_secs(1),
            Duration::from_secs(300),
        );
        // base * 1 = 100 ms, below the 1 s floor.
        assert_eq!(backoff_delay(&config, 1, 2.0), Duration::from_secs(1));
    }

    #[test]
    fn test_backoff_flat_multiplier() {
        let config = config();
        assert_eq!(backoff_delay(&config, 1, 1.0), Duration::from_secs(1));
        assert_eq!(backoff_delay(&config, 5, 1.0), Duration::from_secs(1));
    }
}
