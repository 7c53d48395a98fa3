//! Lock and durability counters for profiling.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for lock traffic and sync calls.
///
/// Thread-safe counters using atomic operations for lock-free updates.
#[derive(Debug, Default)]
pub struct LockMetrics {
    /// Byte-range or whole-file locks actually taken from the kernel
    pub os_lock_acquisitions: AtomicU64,

    /// SHARED requests satisfied from the registry without a syscall
    pub shared_fast_path_hits: AtomicU64,

    /// Lock requests that ended in `Busy`
    pub busy_results: AtomicU64,

    /// Unlock calls that changed the handle's level
    pub unlocks: AtomicU64,

    /// Descriptors parked because a sibling handle still held a lock
    pub deferred_closes: AtomicU64,

    /// Parked descriptors closed once the last lock cleared
    pub deferred_flushes: AtomicU64,

    /// File syncs
    pub syncs: AtomicU64,

    /// Directory syncs (at most one per created journal)
    pub dir_syncs: AtomicU64,
}

impl LockMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn record_os_lock(&self) {
        self.os_lock_acquisitions.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_shared_fast_path(&self) {
        self.shared_fast_path_hits.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_busy(&self) {
        self.busy_results.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_unlock(&self) {
        self.unlocks.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_deferred_close(&self) {
        self.deferred_closes.fetch_add(1, Ordering::Relaxed);
    }

    /// Record `count` parked descriptors being closed
    #[inline]
    pub fn record_deferred_flush(&self, count: usize) {
        self.deferred_flushes
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_sync(&self) {
        self.syncs.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_dir_sync(&self) {
        self.dir_syncs.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current snapshot of metrics
    pub fn snapshot(&self) -> LockMetricsSnapshot {
        LockMetricsSnapshot {
            os_lock_acquisitions: self.os_lock_acquisitions.load(Ordering::Relaxed),
            shared_fast_path_hits: self.shared_fast_path_hits.load(Ordering::Relaxed),
            busy_results: self.busy_results.load(Ordering::Relaxed),
            unlocks: self.unlocks.load(Ordering::Relaxed),
            deferred_closes: self.deferred_closes.load(Ordering::Relaxed),
            deferred_flushes: self.deferred_flushes.load(Ordering::Relaxed),
            syncs: self.syncs.load(Ordering::Relaxed),
            dir_syncs: self.dir_syncs.load(Ordering::Relaxed),
        }
    }

    /// Reset all counters to zero
    pub fn reset(&self) {
        self.os_lock_acquisitions.store(0, Ordering::Relaxed);
        self.shared_fast_path_hits.store(0, Ordering::Relaxed);
        self.busy_results.store(0, Ordering::Relaxed);
        self.unlocks.store(0, Ordering::Relaxed);
        self.deferred_closes.store(0, Ordering::Relaxed);
        self.deferred_flushes.store(0, Ordering::Relaxed);
        self.syncs.store(0, Ordering::Relaxed);
        self.dir_syncs.store(0, Ordering::Relaxed);
    }
}

/// Point-in-time snapshot of lock metrics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LockMetricsSnapshot {
    pub os_lock_acquisitions: u64,
    pub shared_fast_path_hits: u64,
    pub busy_results: u64,
    pub unlocks: u64,
    pub deferred_closes: u64,
    pub deferred_flushes: u64,
    pub syncs: u64,
    pub dir_syncs: u64,
}

impl LockMetricsSnapshot {
    /// Fraction of lock requests served without a syscall (0.0 to 1.0)
    pub fn fast_path_hit_rate(&self) -> f64 {
        let total = self.shared_fast_path_hits + self.os_lock_acquisitions;
        if total == 0 {
            0.0
        } else {
            self.shared_fast_path_hits as f64 / total as f64
        }
    }

    /// Labelled counter values, in display order.
    pub fn entries(&self) -> [(&'static str, u64); 8] {
        [
            ("os lock acquisitions", self.os_lock_acquisitions),
            ("shared fast-path hits", self.shared_fast_path_hits),
            ("busy results", self.busy_results),
            ("unlocks", self.unlocks),
            ("deferred closes", self.deferred_closes),
            ("deferred flushes", self.deferred_flushes),
            ("syncs", self.syncs),
            ("directory syncs", self.dir_syncs),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_and_reset() {
        let metrics = LockMetrics::new();
        metrics.record_os_lock();
        metrics.record_shared_fast_path();
        metrics.record_shared_fast_path();
        metrics.record_shared_fast_path();
        metrics.record_deferred_flush(2);

        let snap = metrics.snapshot();
        assert_eq!(snap.os_lock_acquisitions, 1);
        assert_eq!(snap.shared_fast_path_hits, 3);
        assert_eq!(snap.deferred_flushes, 2);
        assert!((snap.fast_path_hit_rate() - 0.75).abs() < f64::EPSILON);

        metrics.reset();
        assert_eq!(metrics.snapshot(), LockMetricsSnapshot::default());
        assert!(metrics.snapshot().fast_path_hit_rate().abs() < f64::EPSILON);
    }
}
