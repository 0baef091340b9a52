//! Resource ledger for admission control.
//!
//! The ledger tracks free CPU units and memory MB as a single packed atomic
//! word, giving conditional two-dimensional acquisition without locks. It is
//! a pure capacity limiter: it knows nothing about jobs or priority, and
//! `try_acquire` is total (it never suspends; callers requeue on `false`).
//!
//! Priority is handled upstream by the queue set; the ledger only answers
//! "does this much capacity exist right now".

use std::sync::atomic::{AtomicU64, Ordering};

/// Packs free CPU units (high half) and free memory MB (low half).
fn pack(cpu: u32, mem: u32) -> u64 {
    ((cpu as u64) << 32) | mem as u64
}

/// Splits a packed word back into (cpu, mem).
fn unpack(word: u64) -> (u32, u32) {
    ((word >> 32) as u32, word as u32)
}

/// Atomic two-dimensional conditional semaphore over CPU and memory.
#[derive(Debug)]
pub struct ResourceLedger {
    /// Free capacity, packed as (cpu << 32) | mem.
    free: AtomicU64,
    cpu_capacity: u32,
    memory_capacity_mb: u32,
}

impl ResourceLedger {
    /// Creates a ledger with the given total capacity, all of it free.
    pub fn new(cpu_capacity: u32, memory_capacity_mb: u32) -> Self {
        Self {
            free: AtomicU64::new(pack(cpu_capacity, memory_capacity_mb)),
            cpu_capacity,
            memory_capacity_mb,
        }
    }

    /// Atomically acquires `cpu` units and `mem` MB if both fit.
    ///
    /// Succeeds iff `cpu <= cpu_free && mem <= mem_free`, decrementing both
    /// in one compare-exchange. Never blocks.
    pub fn try_acquire(&self, cpu: u32, mem: u32) -> bool {
        let mut current = self.free.load(Ordering::Acquire);
        loop {
            let (cpu_free, mem_free) = unpack(current);
            if cpu > cpu_free || mem > mem_free {
                return false;
            }
            let next = pack(cpu_free - cpu, mem_free - mem);
            match self
                .free
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    /// Returns previously acquired capacity to the ledger.
    ///
    /// # Panics
    ///
    /// Panics if the release would push a counter past the configured
    /// capacity, which indicates a double-release bug in the caller.
    pub fn release(&self, cpu: u32, mem: u32) {
        let mut current = self.free.load(Ordering::Acquire);
        loop {
            let (cpu_free, mem_free) = unpack(current);
            let new_cpu = cpu_free + cpu;
            let new_mem = mem_free + mem;
            assert!(
                new_cpu <= self.cpu_capacity && new_mem <= self.memory_capacity_mb,
                "resource ledger over-release: {}+{} cpu / {}+{} mem exceeds capacity {}/{}",
                cpu_free,
                cpu,
                mem_free,
                mem,
                self.cpu_capacity,
                self.memory_capacity_mb,
            );
            let next = pack(new_cpu, new_mem);
            match self
                .free
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }

    /// Observational snapshot of (cpu_free, mem_free).
    pub fn snapshot(&self) -> (u32, u32) {
        unpack(self.free.load(Ordering::Acquire))
    }

    /// Configured total capacity as (cpu, mem).
    pub fn capacity(&self) -> (u32, u32) {
        (self.cpu_capacity, self.memory_capacity_mb)
    }

    /// Whether a request of this size could ever be admitted.
    pub fn is_satisfiable(&self, cpu: u32, mem: u32) -> bool {
        cpu <= self.cpu_capacity && mem <= self.memory_capacity_mb
    }

    /// Current utilization of (cpu, mem) as fractions from 0.0 to 1.0.
    pub fn utilization(&self) -> (f64, f64) {
        let (cpu_free, mem_free) = self.snapshot();
        let cpu_used = self.cpu_capacity.saturating_sub(cpu_free);
        let mem_used = self.memory_capacity_mb.saturating_sub(mem_free);
        (
            cpu_used as f64 / self.cpu_capacity.max(1) as f64,
            mem_used as f64 / self.memory_capacity_mb.max(1) as f64,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_pack_unpack_roundtrip() {
        assert_eq!(unpack(pack(8, 4096)), (8, 4096));
        assert_eq!(unpack(pack(0, 0)), (0, 0));
        assert_eq!(unpack(pack(u32::MAX, u32::MAX)), (u32::MAX, u32::MAX));
    }

    #[test]
    fn test_acquire_and_release() {
        let ledger = ResourceLedger::new(8, 4096);
        assert_eq!(ledger.snapshot(), (8, 4096));

        assert!(ledger.try_acquire(4, 2048));
        assert_eq!(ledger.snapshot(), (4, 2048));

        assert!(ledger.try_acquire(4, 2048));
        assert_eq!(ledger.snapshot(), (0, 0));

        ledger.release(4, 2048);
        assert_eq!(ledger.snapshot(), (4, 2048));

        ledger.release(4, 2048);
        assert_eq!(ledger.snapshot(), (8, 4096));
    }

    #[test]
    fn test_acquire_fails_without_capacity() {
        let ledger = ResourceLedger::new(8, 4096);

        // CPU exhausted, memory plentiful
        assert!(ledger.try_acquire(8, 128));
        assert!(!ledger.try_acquire(1, 128));

        ledger.release(8, 128);

        // Memory exhausted, CPU plentiful
        assert!(ledger.try_acquire(1, 4096));
        assert!(!ledger.try_acquire(1, 1));
    }

    #[test]
    fn test_acquire_is_all_or_nothing() {
        let ledger = ResourceLedger::new(4, 1024);

        // Enough CPU but not enough memory: neither counter moves.
        assert!(!ledger.try_acquire(2, 2048));
        assert_eq!(ledger.snapshot(), (4, 1024));
    }

    #[test]
    #[should_panic(expected = "over-release")]
    fn test_double_release_panics() {
        let ledger = ResourceLedger::new(4, 1024);
        assert!(ledger.try_acquire(2, 512));
        ledger.release(2, 512);
        ledger.release(2, 512);
    }

    #[test]
    fn test_satisfiability() {
        let ledger = ResourceLedger::new(8, 4096);
        assert!(ledger.is_satisfiable(8, 4096));
        assert!(!ledger.is_satisfiable(9, 128));
        assert!(!ledger.is_satisfiable(1, 8192));

        // Satisfiability ignores current allocation.
        assert!(ledger.try_acquire(8, 4096));
        assert!(ledger.is_satisfiable(8, 4096));
    }

    #[test]
    fn test_utilization() {
        let ledger = ResourceLedger::new(8, 4096);
        assert_eq!(ledger.utilization(), (0.0, 0.0));

        assert!(ledger.try_acquire(4, 1024));
        let (cpu_util, mem_util) = ledger.utilization();
        assert!((cpu_util - 0.5).abs() < f64::EPSILON);
        assert!((mem_util - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn test_concurrent_acquirers_never_overcommit() {
        let ledger = Arc::new(ResourceLedger::new(16, 16));
        let mut handles = Vec::new();

        // 32 threads race to grab 1/1 each; exactly 16 can win.
        for _ in 0..32 {
            let ledger = Arc::clone(&ledger);
            handles.push(std::thread::spawn(move || ledger.try_acquire(1, 1)));
        }

        let granted = handles
            .into_iter()
            .map(|h| h.join().expect("thread should not panic"))
            .filter(|ok| *ok)
            .count();

        assert_eq!(granted, 16);
        assert_eq!(ledger.snapshot(), (0, 0));
    }
}
