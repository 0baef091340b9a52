//! Scheduler metrics.
//!
//! A point-in-time snapshot assembled from the live components (queue
//! depths, free resources, running count, DLQ size) plus a sliding-window
//! throughput tracker fed by job completions.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::queue::QueueDepths;

/// Point-in-time view of scheduler health.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    /// Queued jobs per priority tier.
    pub queue_depth_critical: usize,
    pub queue_depth_high: usize,
    pub queue_depth_normal: usize,
    pub queue_depth_low: usize,
    /// Free CPU units in the resource ledger.
    pub cpu_free: u32,
    /// Free memory MB in the resource ledger.
    pub mem_free: u32,
    /// Jobs currently executing.
    pub running_count: usize,
    /// Entries parked in the dead letter queue.
    pub dlq_size: usize,
    /// Jobs completed in the last minute.
    pub throughput_1m: u64,
    /// Jobs completed in the last five minutes.
    pub throughput_5m: u64,
}

impl MetricsSnapshot {
    /// Total queued jobs across all tiers.
    pub fn queued_total(&self) -> usize {
        self.queue_depth_critical
            + self.queue_depth_high
            + self.queue_depth_normal
            + self.queue_depth_low
    }

    pub(crate) fn queue_depths(mut self, depths: QueueDepths) -> Self {
        self.queue_depth_critical = depths.critical;
        self.queue_depth_high = depths.high;
        self.queue_depth_normal = depths.normal;
        self.queue_depth_low = depths.low;
        self
    }

    pub(crate) fn empty() -> Self {
        Self {
            queue_depth_critical: 0,
            queue_depth_high: 0,
            queue_depth_normal: 0,
            queue_depth_low: 0,
            cpu_free: 0,
            mem_free: 0,
            running_count: 0,
            dlq_size: 0,
            throughput_1m: 0,
            throughput_5m: 0,
        }
    }
}

/// Sliding-window completion counter for 1-minute and 5-minute rates.
///
/// Completion instants are kept in a ring pruned to the longest window;
/// memory is bounded by the actual completion rate.
#[derive(Debug, Default)]
pub struct ThroughputTracker {
    completions: Mutex<VecDeque<Instant>>,
}

const ONE_MINUTE: Duration = Duration::from_secs(60);
const FIVE_MINUTES: Duration = Duration::from_secs(300);

impl ThroughputTracker {
    /// Creates an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one completion at the current instant.
    pub fn record(&self) {
        let now = Instant::now();
        let mut completions = self.completions.lock().expect("throughput lock poisoned");
        Self::prune(&mut completions, now);
        completions.push_back(now);
    }

    /// Completions in the last (minute, five minutes).
    pub fn rates(&self) -> (u64, u64) {
        let now = Instant::now();
        let mut completions = self.completions.lock().expect("throughput lock poisoned");
        Self::prune(&mut completions, now);

        let five_min = completions.len() as u64;
        let one_min = completions
            .iter()
            .rev()
            .take_while(|at| now.duration_since(**at) <= ONE_MINUTE)
            .count() as u64;
        (one_min, five_min)
    }

    fn prune(completions: &mut VecDeque<Instant>, now: Instant) {
        while let Some(oldest) = completions.front() {
            if now.duration_since(*oldest) > FIVE_MINUTES {
                completions.pop_front();
            } else {
                break;
            }
        }
    }
}
