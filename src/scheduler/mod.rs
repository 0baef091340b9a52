//! The scheduling and orchestration engine.
//!
//! [`Scheduler`] wires the components together (resource ledger, priority
//! queue set, dependency graph, job store, handler registry, executor pool,
//! retry/DLQ routing, and the cascade engine) behind a narrow programmatic
//! surface. An API layer translates HTTP/WebSocket traffic to these calls.
//!
//! # Control flow
//!
//! ```text
//!  submit ──> DependencyGraph ──> READY ──> PriorityQueueSet
//!                 │                              │
//!                 └── BLOCKED                    ▼
//!                       ▲                 Admission loop ──> ResourceLedger
//!                       │                        │
//!                 Cascade engine                 ▼
//!                       ▲                  Executor pool ──> handler
//!                       │                        │
//!                       └── Retry / DLQ <────────┘
//! ```
//!
//! All components are explicitly owned by the scheduler value and injected
//! at construction; nothing is process-global.

mod admission;
mod cascade;
mod executor;
mod retry;

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::{ConfigError, SchedulerConfig};
use crate::dlq::{DeadLetterQueue, DlqError, DlqStats};
use crate::error::{CancelError, SchedulerError, SubmitError};
use crate::events::{Event, EventBus};
use crate::graph::DependencyGraph;
use crate::handler::{HandlerRegistry, JobHandler};
use crate::job::{ErrorKind, Job, JobError, JobSpec, JobStatus};
use crate::metrics::{MetricsSnapshot, ThroughputTracker};
use crate::queue::PriorityQueueSet;
use crate::resources::ResourceLedger;
use crate::store::{JobFilter, JobStore, Page, StatusPatch};

use cascade::CascadeSignal;
use executor::ExecutorPool;

pub use crate::dlq::DeadLetterEntry;

/// What `submit` returns.
#[derive(Debug, Clone)]
pub struct SubmitReceipt {
    /// Assigned job id.
    pub id: Uuid,
    /// Initial status (READY, BLOCKED, or FAILED on dependency failure).
    pub status: JobStatus,
    /// Approximate dispatch position when the job entered the queue.
    pub queue_position: Option<usize>,
}

/// Shared state behind the scheduler's loops.
pub(crate) struct SchedulerCore {
    pub(crate) config: SchedulerConfig,
    pub(crate) store: Arc<dyn JobStore>,
    pub(crate) registry: Arc<HandlerRegistry>,
    pub(crate) ledger: ResourceLedger,
    pub(crate) queue: PriorityQueueSet,
    pub(crate) graph: Mutex<DependencyGraph>,
    pub(crate) dlq: DeadLetterQueue,
    pub(crate) events: EventBus,
    pub(crate) throughput: ThroughputTracker,
    pub(crate) executor: ExecutorPool,
    pub(crate) cascade_tx: mpsc::UnboundedSender<CascadeSignal>,
    pub(crate) cascade_rx: Mutex<mpsc::UnboundedReceiver<CascadeSignal>>,
}

/// The scheduling engine.
pub struct Scheduler {
    core: Arc<SchedulerCore>,
    shutdown_tx: broadcast::Sender<()>,
    loop_handles: Vec<JoinHandle<()>>,
    is_running: bool,
}

impl Scheduler {
    /// Creates a scheduler from validated configuration, a job store, and a
    /// handler registry.
    pub fn new(
        config: SchedulerConfig,
        store: Arc<dyn JobStore>,
        registry: Arc<HandlerRegistry>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let (cascade_tx, cascade_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = broadcast::channel(1);

        let core = Arc::new(SchedulerCore {
            ledger: ResourceLedger::new(config.cpu_capacity, config.memory_capacity_mb),
            queue: PriorityQueueSet::new(),
            graph: Mutex::new(DependencyGraph::new()),
            dlq: DeadLetterQueue::new(),
            events: EventBus::new(config.event_capacity),
            throughput: ThroughputTracker::new(),
            executor: ExecutorPool::new(config.max_concurrent_jobs),
            cascade_tx,
            cascade_rx: Mutex::new(cascade_rx),
            store,
            registry,
            config,
        });

        Ok(Self {
            core,
            shutdown_tx,
            loop_handles: Vec::new(),
            is_running: false,
        })
    }

    /// Spawns the admission and cascade loops.
    ///
    /// Jobs may be submitted before `start`; they accumulate in the queue
    /// and dispatch once the loops are running. Must be called from within
    /// a tokio runtime.
    pub fn start(&mut self) -> Result<(), SchedulerError> {
        if self.is_running {
            return Err(SchedulerError::AlreadyRunning);
        }

        self.loop_handles.push(tokio::spawn(admission::run(
            Arc::clone(&self.core),
            self.shutdown_tx.subscribe(),
        )));
        self.loop_handles.push(tokio::spawn(cascade::run(
            Arc::clone(&self.core),
            self.shutdown_tx.subscribe(),
        )));

        self.is_running = true;
        info!(
            max_concurrent = self.core.config.max_concurrent_jobs,
            cpu_capacity = self.core.config.cpu_capacity,
            memory_capacity_mb = self.core.config.memory_capacity_mb,
            "Scheduler started"
        );
        Ok(())
    }

    /// Stops the loops and waits for running jobs to finish.
    ///
    /// Queued jobs stay queued; running jobs get the shutdown grace period
    /// to complete. Returns `ShutdownTimeout` if they do not drain in time.
    pub async fn shutdown(&mut self) -> Result<(), SchedulerError> {
        if !self.is_running {
            return Err(SchedulerError::NotRunning);
        }
        info!("Initiating scheduler shutdown");

        // Ignore send errors: the loops may have already stopped.
        let _ = self.shutdown_tx.send(());
        for handle in self.loop_handles.drain(..) {
            if let Err(err) = handle.await {
                error!(error = %err, "Scheduler loop panicked during shutdown");
            }
        }
        self.is_running = false;

        let deadline = Instant::now() + self.core.config.shutdown_timeout;
        while self.core.executor.running_count() > 0 {
            if Instant::now() >= deadline {
                warn!(
                    still_running = self.core.executor.running_count(),
                    "Shutdown grace period expired with jobs still running"
                );
                return Err(SchedulerError::ShutdownTimeout(
                    self.core.config.shutdown_timeout,
                ));
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        info!("Scheduler shutdown complete");
        Ok(())
    }

    /// Whether the loops are running.
    pub fn is_running(&self) -> bool {
        self.is_running
    }

    /// Registers a handler for a job type.
    pub fn register_handler(&self, job_type: impl Into<String>, handler: Arc<dyn JobHandler>) {
        self.core.registry.register(job_type, handler);
    }

    /// Submits a job.
    ///
    /// Validates the spec, records dependency edges (rejecting unknown
    /// parents and cycles), and determines the initial status: READY jobs
    /// are queued immediately, jobs with unfinished parents wait BLOCKED,
    /// and jobs whose parents already failed are born FAILED with
    /// `DEPENDENCY_FAILED`. On any error no state remains.
    pub async fn submit(&self, spec: JobSpec) -> Result<SubmitReceipt, SubmitError> {
        self.validate_spec(&spec)?;

        if let Some(key) = spec.idempotency_key.as_deref() {
            if let Some(existing) = self.core.store.find_by_idempotency_key(key).await? {
                return Ok(SubmitReceipt {
                    id: existing.id,
                    status: existing.status,
                    queue_position: None,
                });
            }
        }

        let mut job = Job::from_spec(
            spec,
            self.core.config.default_max_attempts,
            self.core.config.default_backoff_multiplier,
            self.core.config.default_timeout.as_secs(),
        );

        // The graph lock serializes submission against cascade so the
        // readiness decision and the edge insertion are one step.
        let mut graph = self.core.graph.lock().await;
        graph.add_job(job.id, &job.depends_on)?;

        let gating = match self.parent_gating(&job).await {
            Ok(gating) => gating,
            Err(err) => {
                graph.remove_job(job.id);
                return Err(err);
            }
        };

        let receipt = match gating {
            ParentGating::AllCompleted => {
                job.status = JobStatus::Ready;
                let position = self.queue_position(job.priority);
                if let Err(err) = self.core.store.insert(job.clone()).await {
                    graph.remove_job(job.id);
                    return Err(err.into());
                }
                self.core.queue.push(job.priority, job.id);
                self.publish_submitted(&job);
                self.core.events.publish(Event::Ready { job_id: job.id });
                SubmitReceipt {
                    id: job.id,
                    status: JobStatus::Ready,
                    queue_position: Some(position),
                }
            }
            ParentGating::Waiting => {
                job.status = JobStatus::Blocked;
                if let Err(err) = self.core.store.insert(job.clone()).await {
                    graph.remove_job(job.id);
                    return Err(err.into());
                }
                self.publish_submitted(&job);
                SubmitReceipt {
                    id: job.id,
                    status: JobStatus::Blocked,
                    queue_position: None,
                }
            }
            ParentGating::Failed(parent) => {
                let error =
                    JobError::new(ErrorKind::DependencyFailed, format!("parent job {} failed", parent));
                job.status = JobStatus::Failed;
                job.last_error = Some(error.clone());
                job.finished_at = Some(Utc::now());
                if let Err(err) = self.core.store.insert(job.clone()).await {
                    graph.remove_job(job.id);
                    return Err(err.into());
                }
                self.publish_submitted(&job);
                self.core.events.publish(Event::Failed {
                    job_id: job.id,
                    kind: ErrorKind::DependencyFailed,
                    message: error.message,
                });
                SubmitReceipt {
                    id: job.id,
                    status: JobStatus::Failed,
                    queue_position: None,
                }
            }
        };
        drop(graph);

        info!(
            job_id = %receipt.id,
            job_type = %job.job_type,
            priority = %job.priority,
            status = %receipt.status,
            "Job submitted"
        );
        Ok(receipt)
    }

    /// Point read of a job record.
    pub async fn get(&self, id: Uuid) -> Result<Job, SchedulerError> {
        self.core
            .store
            .get(id)
            .await?
            .ok_or(SchedulerError::NotFound(id))
    }

    /// Lists jobs matching a filter, newest first.
    pub async fn list(&self, filter: &JobFilter) -> Result<Page, SchedulerError> {
        Ok(self.core.store.list(filter).await?)
    }

    /// Cancels a job.
    ///
    /// Queued and blocked jobs are cancelled immediately (and removed from
    /// the queue); running jobs get their cooperative cancel flag raised and
    /// finish on the handler's terms; terminal jobs are an error. A cancel
    /// that lands while a retry is pending suppresses that retry.
    pub async fn cancel(&self, id: Uuid) -> Result<(), CancelError> {
        loop {
            let job = self
                .core
                .store
                .get(id)
                .await?
                .ok_or(CancelError::NotFound(id))?;

            match job.status {
                status if status.is_terminal() => {
                    return Err(CancelError::AlreadyTerminal { id, status });
                }
                JobStatus::Running => {
                    // Cooperative: the executor commits CANCELLED if and
                    // when the handler observes the flag.
                    self.core.executor.request_cancel(id);
                    info!(job_id = %id, "Cancellation requested for running job");
                    return Ok(());
                }
                status => {
                    let patch = StatusPatch::new()
                        .with_error(JobError::new(ErrorKind::Cancelled, "cancelled by request"));
                    if self
                        .core
                        .store
                        .cas_status(id, status, JobStatus::Cancelled, patch)
                        .await?
                    {
                        self.core.queue.remove(id);
                        info!(job_id = %id, was = %status, "Job cancelled");
                        self.core.events.publish(Event::Cancelled { job_id: id });
                        let _ = self.core.cascade_tx.send(CascadeSignal {
                            parent: id,
                            success: false,
                        });
                        return Ok(());
                    }
                    // Status moved under us; re-read and retry.
                }
            }
        }
    }

    /// Opens an event stream. Every lifecycle transition is published.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.core.events.subscribe()
    }

    /// Point-in-time scheduler health.
    pub fn metrics(&self) -> MetricsSnapshot {
        let depths = self.core.queue.depths();
        let (cpu_free, mem_free) = self.core.ledger.snapshot();
        let (throughput_1m, throughput_5m) = self.core.throughput.rates();
        MetricsSnapshot {
            queue_depth_critical: depths.critical,
            queue_depth_high: depths.high,
            queue_depth_normal: depths.normal,
            queue_depth_low: depths.low,
            cpu_free,
            mem_free,
            running_count: self.core.executor.running_count(),
            dlq_size: self.core.dlq.len(),
            throughput_1m,
            throughput_5m,
        }
    }

    /// Lists dead letter entries, newest first.
    pub fn dlq_list(&self, limit: usize, offset: usize) -> Vec<DeadLetterEntry> {
        self.core.dlq.list(limit, offset)
    }

    /// Dead letter queue statistics.
    pub fn dlq_stats(&self) -> DlqStats {
        self.core.dlq.stats()
    }

    /// Clears dead letter entries, optionally for one job type only.
    pub fn dlq_clear(&self, job_type: Option<&str>) -> usize {
        self.core.dlq.clear(job_type)
    }

    /// Administrative retry of a dead-lettered job.
    ///
    /// Removes the DLQ entry, resets the attempt counter, and re-evaluates
    /// readiness: the job re-enters the queue if its parents still permit.
    pub async fn dlq_retry(&self, id: Uuid) -> Result<Job, SchedulerError> {
        let entry = self.core.dlq.take(id)?;

        let revived = self
            .core
            .store
            .cas_status(
                id,
                JobStatus::DeadLettered,
                JobStatus::Pending,
                StatusPatch::new().reset_attempt(),
            )
            .await?;
        if !revived {
            // The store record is not dead-lettered; restore the entry.
            self.core.dlq.push(entry);
            return Err(SchedulerError::Dlq(DlqError::NotFound(id)));
        }

        let job = self
            .core
            .store
            .get(id)
            .await?
            .ok_or(SchedulerError::NotFound(id))?;

        info!(job_id = %id, job_type = %job.job_type, "Job revived from dead letter queue");
        self.core.events.publish(Event::Retrying {
            job_id: id,
            attempt: 0,
            retry_at: Utc::now(),
        });

        let graph = self.core.graph.lock().await;
        let mut all_completed = true;
        for parent in graph.parents_of(id) {
            match self.core.store.get(parent).await? {
                Some(parent_job) if parent_job.status == JobStatus::Completed => {}
                _ => {
                    all_completed = false;
                    break;
                }
            }
        }

        if all_completed {
            if self
                .core
                .store
                .cas_status(id, JobStatus::Pending, JobStatus::Ready, StatusPatch::new())
                .await?
            {
                self.core.queue.push(job.priority, id);
                self.core.events.publish(Event::Ready { job_id: id });
            }
        } else {
            let _ = self
                .core
                .store
                .cas_status(id, JobStatus::Pending, JobStatus::Blocked, StatusPatch::new())
                .await?;
        }
        drop(graph);

        self.core
            .store
            .get(id)
            .await?
            .ok_or(SchedulerError::NotFound(id))
    }

    fn validate_spec(&self, spec: &JobSpec) -> Result<(), SubmitError> {
        if spec.job_type.trim().is_empty() {
            return Err(SubmitError::InvalidSpec(
                "job_type must not be empty".to_string(),
            ));
        }
        if spec.cpu_units == 0 {
            return Err(SubmitError::InvalidSpec(
                "cpu_units must be positive".to_string(),
            ));
        }
        if spec.memory_mb == 0 {
            return Err(SubmitError::InvalidSpec(
                "memory_mb must be positive".to_string(),
            ));
        }
        if spec.max_attempts == Some(0) {
            return Err(SubmitError::InvalidSpec(
                "max_attempts must be positive".to_string(),
            ));
        }
        if let Some(multiplier) = spec.backoff_multiplier {
            if !multiplier.is_finite() || multiplier < 1.0 {
                return Err(SubmitError::InvalidSpec(
                    "backoff_multiplier must be at least 1.0".to_string(),
                ));
            }
        }
        if spec.timeout_seconds == Some(0) {
            return Err(SubmitError::InvalidSpec(
                "timeout_seconds must be positive".to_string(),
            ));
        }
        // Never enqueue a job that could not run even on an idle ledger.
        if !self.core.ledger.is_satisfiable(spec.cpu_units, spec.memory_mb) {
            let (cpu_capacity, memory_capacity_mb) = self.core.ledger.capacity();
            return Err(SubmitError::UnsatisfiableResources {
                cpu_units: spec.cpu_units,
                memory_mb: spec.memory_mb,
                cpu_capacity,
                memory_capacity_mb,
            });
        }
        Ok(())
    }

    /// Classifies the parents of a new job. Must hold the graph lock.
    async fn parent_gating(&self, job: &Job) -> Result<ParentGating, SubmitError> {
        let mut gating = ParentGating::AllCompleted;
        for parent in &job.depends_on {
            let parent_job = match self.core.store.get(*parent).await? {
                Some(parent_job) => parent_job,
                // In the graph but not the store: treat as unknown.
                None => return Err(SubmitError::UnknownParent(*parent)),
            };
            match parent_job.status {
                JobStatus::Completed => {}
                JobStatus::DeadLettered | JobStatus::Cancelled => {
                    return Ok(ParentGating::Failed(*parent));
                }
                JobStatus::Failed | JobStatus::Timeout => {
                    // A retryable failure with attempts left is transient:
                    // the retry router is about to park it in PENDING.
                    let retry_pending = parent_job.should_retry()
                        && parent_job
                            .last_error
                            .as_ref()
                            .map(|e| e.kind.is_retryable())
                            .unwrap_or(false);
                    if retry_pending {
                        gating = ParentGating::Waiting;
                    } else {
                        return Ok(ParentGating::Failed(*parent));
                    }
                }
                _ => gating = ParentGating::Waiting,
            }
        }
        Ok(gating)
    }

    /// 1-based dispatch position for a job about to enter `priority`'s queue.
    fn queue_position(&self, priority: crate::job::JobPriority) -> usize {
        let depths = self.core.queue.depths();
        let ahead: usize = [depths.critical, depths.high, depths.normal, depths.low]
            .iter()
            .take(priority.index() + 1)
            .sum();
        ahead + 1
    }

    fn publish_submitted(&self, job: &Job) {
        self.core.events.publish(Event::Submitted {
            job_id: job.id,
            job_type: job.job_type.clone(),
            priority: job.priority,
            status: job.status,
        });
    }
}

enum ParentGating {
    /// No parents, or every parent COMPLETED.
    AllCompleted,
    /// At least one parent still on its way; none failed.
    Waiting,
    /// This parent failed terminally.
    Failed(Uuid),
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        // Best effort: wake the loops so they exit if shutdown was skipped.
        let _ = self.shutdown_tx.send(());
    }
}
