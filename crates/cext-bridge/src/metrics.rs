//! Bridge counters.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use crate::gc::{CleanupRequest, PassStats};

/// Live counters, updated with relaxed atomics.
#[derive(Debug, Default)]
pub struct BridgeMetrics {
    handles_created: AtomicUsize,
    handles_disposed: AtomicUsize,
    dispose_failures: AtomicUsize,
    immediates_encoded: AtomicUsize,
    cleanup_scheduled: AtomicUsize,
    cleanup_coalesced: AtomicUsize,
    cleanup_deferred: AtomicUsize,
    cleanup_passes: AtomicUsize,
    objects_marked: AtomicUsize,
    reaper_batches: AtomicUsize,
    native_calls: AtomicUsize,
    native_exceptions: AtomicUsize,
    last_pass_nanos: AtomicU64,
}

/// Point-in-time copy of [`BridgeMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Handles created.
    pub handles_created: usize,
    /// Handles whose native resource was freed (including failed frees).
    pub handles_disposed: usize,
    /// Frees that returned an error or panicked.
    pub dispose_failures: usize,
    /// Values converted without a handle.
    pub immediates_encoded: usize,
    /// Cleanup requests that scheduled a pass.
    pub cleanup_scheduled: usize,
    /// Cleanup requests absorbed by a pending pass.
    pub cleanup_coalesced: usize,
    /// Cleanup requests deferred while disabled.
    pub cleanup_deferred: usize,
    /// Completed cleanup passes.
    pub cleanup_passes: usize,
    /// Objects found referenced from native memory, summed over passes.
    pub objects_marked: usize,
    /// Reaper wake-ups.
    pub reaper_batches: usize,
    /// Native calls made through the adapters.
    pub native_calls: usize,
    /// Native calls that raised.
    pub native_exceptions: usize,
    /// Duration of the most recent cleanup pass.
    pub last_pass_duration: Duration,
}

impl BridgeMetrics {
    pub(crate) fn record_handle_created(&self) {
        self.handles_created.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dispose(&self, ok: bool) {
        self.handles_disposed.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.dispose_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_immediate(&self) {
        self.immediates_encoded.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_request(&self, request: CleanupRequest) {
        let counter = match request {
            CleanupRequest::Scheduled => &self.cleanup_scheduled,
            CleanupRequest::Coalesced => &self.cleanup_coalesced,
            CleanupRequest::Deferred => &self.cleanup_deferred,
            CleanupRequest::Rejected => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[allow(clippy::cast_possible_truncation)]
    pub(crate) fn record_pass(&self, stats: &PassStats) {
        self.cleanup_passes.fetch_add(1, Ordering::Relaxed);
        self.objects_marked.fetch_add(stats.objects_marked, Ordering::Relaxed);
        self.last_pass_nanos
            .store(stats.duration.as_nanos() as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_reaper_batch(&self) {
        self.reaper_batches.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_native_call(&self) {
        self.native_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_native_exception(&self) {
        self.native_exceptions.fetch_add(1, Ordering::Relaxed);
    }

    /// Copies the current values.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            handles_created: self.handles_created.load(Ordering::Relaxed),
            handles_disposed: self.handles_disposed.load(Ordering::Relaxed),
            dispose_failures: self.dispose_failures.load(Ordering::Relaxed),
            immediates_encoded: self.immediates_encoded.load(Ordering::Relaxed),
            cleanup_scheduled: self.cleanup_scheduled.load(Ordering::Relaxed),
            cleanup_coalesced: self.cleanup_coalesced.load(Ordering::Relaxed),
            cleanup_deferred: self.cleanup_deferred.load(Ordering::Relaxed),
            cleanup_passes: self.cleanup_passes.load(Ordering::Relaxed),
            objects_marked: self.objects_marked.load(Ordering::Relaxed),
            reaper_batches: self.reaper_batches.load(Ordering::Relaxed),
            native_calls: self.native_calls.load(Ordering::Relaxed),
            native_exceptions: self.native_exceptions.load(Ordering::Relaxed),
            last_pass_duration: Duration::from_nanos(self.last_pass_nanos.load(Ordering::Relaxed)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let metrics = BridgeMetrics::default();
        metrics.record_handle_created();
        metrics.record_dispose(false);
        metrics.record_request(CleanupRequest::Coalesced);
        metrics.record_request(CleanupRequest::Rejected);
        metrics.record_pass(&PassStats {
            objects_marked: 3,
            duration: Duration::from_micros(5),
            ..PassStats::default()
        });

        let snap = metrics.snapshot();
        assert_eq!(snap.handles_created, 1);
        assert_eq!(snap.handles_disposed, 1);
        assert_eq!(snap.dispose_failures, 1);
        assert_eq!(snap.cleanup_coalesced, 1);
        assert_eq!(snap.cleanup_scheduled, 0);
        assert_eq!(snap.cleanup_passes, 1);
        assert_eq!(snap.objects_marked, 3);
        assert_eq!(snap.last_pass_duration, Duration::from_micros(5));
    }
}
