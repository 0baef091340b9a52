//! Priority queue set for dispatch ordering.
//!
//! Four independent FIFO queues, one per priority tier. Producers push job
//! ids to the tail of their tier; the admission loop blocking-pops the head
//! of the highest non-empty tier. Within a tier ordering is strictly FIFO
//! up to the moment of dispatch: a job requeued after a resource shortage
//! re-enters at the tail.
//!
//! There is no starvation protection for lower tiers; a steady stream of
//! critical jobs will hold back everything else.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use tokio::sync::Notify;
use uuid::Uuid;

use crate::job::JobPriority;

/// Queue depths by tier, highest first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueDepths {
    pub critical: usize,
    pub high: usize,
    pub normal: usize,
    pub low: usize,
}

impl QueueDepths {
    /// Total entries across all tiers.
    pub fn total(&self) -> usize {
        self.critical + self.high + self.normal + self.low
    }
}

/// Four FIFO queues with a blocking pop that drains higher tiers first.
#[derive(Debug)]
pub struct PriorityQueueSet {
    queues: Mutex<[VecDeque<Uuid>; 4]>,
    notify: Notify,
    closed: AtomicBool,
}

impl PriorityQueueSet {
    /// Creates an empty queue set.
    pub fn new() -> Self {
        Self {
            queues: Mutex::new(Default::default()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Appends a job id to the tail of its tier's queue and wakes a waiter.
    pub fn push(&self, priority: JobPriority, id: Uuid) {
        {
            let mut queues = self.queues.lock().expect("queue lock poisoned");
            queues[priority.index()].push_back(id);
        }
        self.notify.notify_one();
    }

    /// Pops the head of the highest non-empty tier without waiting.
    pub fn try_pop(&self) -> Option<Uuid> {
        let mut queues = self.queues.lock().expect("queue lock poisoned");
        queues.iter_mut().find_map(|q| q.pop_front())
    }

    /// Pops the next job id in priority order, suspending until an entry
    /// arrives. Returns `None` once the set is closed and drained.
    pub async fn pop_blocking(&self) -> Option<Uuid> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register for wakeups before checking, so a push or close that
            // lands between the check and the await is not lost.
            notified.as_mut().enable();

            if let Some(id) = self.try_pop() {
                return Some(id);
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            notified.await;
        }
    }

    /// Best-effort removal of a queued id, for cancellation. O(n).
    pub fn remove(&self, id: Uuid) -> bool {
        let mut queues = self.queues.lock().expect("queue lock poisoned");
        for queue in queues.iter_mut() {
            if let Some(pos) = queue.iter().position(|entry| *entry == id) {
                queue.remove(pos);
                return true;
            }
        }
        false
    }

    /// Closes the set: blocked poppers return `None` once the queues drain.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
        // Cover a popper that has not registered yet.
        self.notify.notify_one();
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Current depth of each tier.
    pub fn depths(&self) -> QueueDepths {
        let queues = self.queues.lock().expect("queue lock poisoned");
        QueueDepths {
            critical: queues[0].len(),
            high: queues[1].len(),
            normal: queues[2].len(),
            low: queues[3].len(),
        }
    }

    /// Total queued entries.
    pub fn len(&self) -> usize {
        self.depths().total()
    }

    /// Whether all tiers are empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for PriorityQueueSet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_priority_wins_over_insertion_order() {
        let set = PriorityQueueSet::new();
        let normal = Uuid::new_v4();
        let critical = Uuid::new_v4();
        let low = Uuid::new_v4();

        set.push(JobPriority::Normal, normal);
        set.push(JobPriority::Critical, critical);
        set.push(JobPriority::Low, low);

        assert_eq!(set.try_pop(), Some(critical));
        assert_eq!(set.try_pop(), Some(normal));
        assert_eq!(set.try_pop(), Some(low));
        assert_eq!(set.try_pop(), None);
    }

    #[test]
    fn test_fifo_within_tier() {
        let set = PriorityQueueSet::new();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        let third = Uuid::new_v4();

        set.push(JobPriority::High, first);
        set.push(JobPriority::High, second);
        set.push(JobPriority::High, third);

        assert_eq!(set.try_pop(), Some(first));
        assert_eq!(set.try_pop(), Some(second));
        assert_eq!(set.try_pop(), Some(third));
    }

    #[test]
    fn test_requeue_goes_to_tail() {
        let set = PriorityQueueSet::new();
        let big = Uuid::new_v4();
        let small = Uuid::new_v4();

        set.push(JobPriority::Normal, big);
        set.push(JobPriority::Normal, small);

        // Admission pops the big job, cannot admit it, requeues at tail.
        assert_eq!(set.try_pop(), Some(big));
        set.push(JobPriority::Normal, big);

        // The small job now runs first.
        assert_eq!(set.try_pop(), Some(small));
        assert_eq!(set.try_pop(), Some(big));
    }

    #[test]
    fn test_remove() {
        let set = PriorityQueueSet::new();
        let keep = Uuid::new_v4();
        let drop = Uuid::new_v4();

        set.push(JobPriority::Low, keep);
        set.push(JobPriority::Low, drop);

        assert!(set.remove(drop));
        assert!(!set.remove(drop));
        assert_eq!(set.try_pop(), Some(keep));
        assert_eq!(set.try_pop(), None);
    }

    #[test]
    fn test_depths() {
        let set = PriorityQueueSet::new();
        set.push(JobPriority::Critical, Uuid::new_v4());
        set.push(JobPriority::Normal, Uuid::new_v4());
        set.push(JobPriority::Normal, Uuid::new_v4());

        let depths = set.depths();
        assert_eq!(depths.critical, 1);
        assert_eq!(depths.high, 0);
        assert_eq!(depths.normal, 2);
        assert_eq!(depths.low, 0);
        assert_eq!(depths.total(), 3);
        assert_eq!(set.len(), 3);
        assert!(!set.is_empty());
    }

    #[tokio::test]
    async fn test_pop_blocking_waits_for_push() {
        let set = Arc::new(PriorityQueueSet::new());
        let id = Uuid::new_v4();

        let popper = {
            let set = Arc::clone(&set);
            tokio::spawn(async move { set.pop_blocking().await })
        };

        // Give the popper time to park.
        tokio::time::sleep(Duration::from_millis(20)).await;
        set.push(JobPriority::Normal, id);

        let popped = tokio::time::timeout(Duration::from_secs(1), popper)
            .await
            .expect("pop should complete")
            .expect("popper should not panic");
        assert_eq!(popped, Some(id));
    }

    #[tokio::test]
    async fn test_pop_blocking_returns_none_on_close() {
        let set = Arc::new(PriorityQueueSet::new());

        let popper = {
            let set = Arc::clone(&set);
            tokio::spawn(async move { set.pop_blocking().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        set.close();

        let popped = tokio::time::timeout(Duration::from_secs(1), popper)
            .await
            .expect("pop should complete")
            .expect("popper should not panic");
        assert_eq!(popped, None);
        assert!(set.is_closed());
    }

    #[tokio::test]
    async fn test_close_drains_remaining_entries() {
        let set = PriorityQueueSet::new();
        let id = Uuid::new_v4();
        set.push(JobPriority::High, id);
        set.close();

        // Entries pushed before close are still handed out.
        assert_eq!(set.pop_blocking().await, Some(id));
        assert_eq!(set.pop_blocking().await, None);
    }
}
