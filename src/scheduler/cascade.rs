//! Cascade / readiness engine.
//!
//! A dedicated consumer task receives parent terminal notifications over a
//! channel and propagates them to dependents, off the executor's critical
//! path. A success unblocks children whose parents are now all COMPLETED; a
//! non-success walks the descendant subgraph failing every still-BLOCKED
//! job with `DEPENDENCY_FAILED`; those never retry.
//!
//! Signals are sent only after the parent's terminal status is committed to
//! the store, so a child can never observe the cascade before the cause.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::events::Event;
use crate::job::{ErrorKind, JobError, JobStatus};
use crate::store::StatusPatch;

use super::SchedulerCore;

/// A parent reached a terminal state.
#[derive(Debug, Clone, Copy)]
pub(crate) struct CascadeSignal {
    pub parent: Uuid,
    pub success: bool,
}

/// Consumer loop. Runs until shutdown or until all senders are dropped.
pub(crate) async fn run(core: Arc<SchedulerCore>, mut shutdown_rx: broadcast::Receiver<()>) {
    info!("Cascade engine started");
    let mut rx = core.cascade_rx.lock().await;
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            signal = rx.recv() => match signal {
                Some(signal) => handle(&core, signal).await,
                None => break,
            },
        }
    }
    info!("Cascade engine stopped");
}

async fn handle(core: &Arc<SchedulerCore>, signal: CascadeSignal) {
    if signal.success {
        promote_children(core, signal.parent).await;
    } else {
        fail_descendants(core, signal.parent).await;
    }
}

/// Moves children of a completed parent from BLOCKED to READY once all of
/// their parents are COMPLETED.
async fn promote_children(core: &Arc<SchedulerCore>, parent: Uuid) {
    let graph = core.graph.lock().await;

    for child in graph.children_of(parent) {
        let job = match core.store.get(child).await {
            Ok(Some(job)) => job,
            Ok(None) => continue,
            Err(err) => {
                error!(job_id = %child, error = %err, "Cascade read failed");
                continue;
            }
        };
        if job.status != JobStatus::Blocked {
            continue;
        }

        let mut all_completed = true;
        for p in graph.parents_of(child) {
            match core.store.get(p).await {
                Ok(Some(parent_job)) if parent_job.status == JobStatus::Completed => {}
                Ok(_) => {
                    all_completed = false;
                    break;
                }
                Err(err) => {
                    error!(job_id = %p, error = %err, "Cascade read failed");
                    all_completed = false;
                    break;
                }
            }
        }
        if !all_completed {
            continue;
        }

        match core
            .store
            .cas_status(child, JobStatus::Blocked, JobStatus::Ready, StatusPatch::new())
            .await
        {
            Ok(true) => {
                info!(job_id = %child, "Job unblocked, all dependencies satisfied");
                core.queue.push(job.priority, child);
                core.events.publish(Event::Ready { job_id: child });
            }
            Ok(false) => debug!(job_id = %child, "Unblock lost to a concurrent transition"),
            Err(err) => error!(job_id = %child, error = %err, "Failed to unblock job"),
        }
    }
}

/// Fails every still-BLOCKED descendant of a failed parent.
async fn fail_descendants(core: &Arc<SchedulerCore>, parent: Uuid) {
    let graph = core.graph.lock().await;

    let mut worklist: Vec<(Uuid, Uuid)> = graph
        .children_of(parent)
        .into_iter()
        .map(|child| (parent, child))
        .collect();
    let mut visited: HashSet<Uuid> = HashSet::new();

    while let Some((failed_parent, child)) = worklist.pop() {
        if !visited.insert(child) {
            continue;
        }

        let error = JobError::new(
            ErrorKind::DependencyFailed,
            format!("parent job {} failed", failed_parent),
        );
        match core
            .store
            .cas_status(
                child,
                JobStatus::Blocked,
                JobStatus::Failed,
                StatusPatch::new().with_error(error.clone()),
            )
            .await
        {
            Ok(true) => {
                info!(job_id = %child, parent_id = %failed_parent, "Job failed due to parent failure");
                core.events.publish(Event::Failed {
                    job_id: child,
                    kind: ErrorKind::DependencyFailed,
                    message: error.message,
                });
                worklist.extend(
                    graph
                        .children_of(child)
                        .into_iter()
                        .map(|grandchild| (child, grandchild)),
                );
            }
            // Already terminal (its own cancel or an earlier cascade); its
            // children were handled on that path.
            Ok(false) => debug!(job_id = %child, "Cascade skip, job not blocked"),
            Err(err) => error!(job_id = %child, error = %err, "Cascade write failed"),
        }
    }
}
