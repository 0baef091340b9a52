//! Admission control loop.
//!
//! The single consumer of the priority queue set. Pops ids in priority
//! order, drops stale entries (cancelled or superseded jobs), attempts
//! ledger admission, and promotes READY jobs to RUNNING before handing
//! them to the executor pool.
//!
//! A job that does not fit the free capacity goes back to the **tail** of
//! its own tier, never the head, so an oversized job cannot starve
//! smaller same-priority jobs queued behind it. The loop sleeps briefly
//! after such a requeue to avoid spinning while capacity is tied up.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::events::Event;
use crate::job::JobStatus;
use crate::store::StatusPatch;

use super::{executor, SchedulerCore};

/// Loop body: runs until shutdown.
pub(crate) async fn run(core: Arc<SchedulerCore>, mut shutdown_rx: broadcast::Receiver<()>) {
    info!("Admission loop started");
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            popped = core.queue.pop_blocking() => match popped {
                Some(id) => admit(&core, id).await,
                None => break,
            },
        }
    }
    info!("Admission loop stopped");
}

/// Admits one popped queue entry.
async fn admit(core: &Arc<SchedulerCore>, id: Uuid) {
    let job = match core.store.get(id).await {
        Ok(Some(job)) => job,
        Ok(None) => {
            debug!(job_id = %id, "Dropping queue entry for unknown job");
            return;
        }
        Err(err) => {
            error!(job_id = %id, error = %err, "Admission read failed");
            return;
        }
    };

    // Stale entry: cancelled or otherwise moved on since it was queued.
    if job.status != JobStatus::Ready {
        debug!(job_id = %id, status = %job.status, "Skipping stale queue entry");
        return;
    }

    if !core.ledger.try_acquire(job.cpu_units, job.memory_mb) {
        debug!(
            job_id = %id,
            cpu_units = job.cpu_units,
            memory_mb = job.memory_mb,
            "Insufficient resources, requeueing at tail"
        );
        core.queue.push(job.priority, id);
        tokio::time::sleep(core.config.admission_backoff).await;
        return;
    }

    let claimed = match core
        .store
        .cas_status(
            id,
            JobStatus::Ready,
            JobStatus::Running,
            StatusPatch::new().bump_attempt(),
        )
        .await
    {
        Ok(claimed) => claimed,
        Err(err) => {
            error!(job_id = %id, error = %err, "Admission CAS failed");
            core.ledger.release(job.cpu_units, job.memory_mb);
            return;
        }
    };
    if !claimed {
        // Lost the race (e.g. cancelled between pop and claim); nothing held.
        core.ledger.release(job.cpu_units, job.memory_mb);
        return;
    }

    let attempt = job.attempt + 1;
    info!(
        job_id = %id,
        job_type = %job.job_type,
        priority = %job.priority,
        attempt,
        "Job started"
    );
    core.events.publish(Event::Started { job_id: id, attempt });

    // Suspends while the pool is saturated: backpressure on admission.
    executor::dispatch(core, job, attempt).await;
}
