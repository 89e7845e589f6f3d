//! Per-sink metrics snapshot, emitted at every transition (§4.3 step 6).

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// A point-in-time snapshot handed to a [`MetricsSink`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SinkMetrics {
    pub attempted: u64,
    pub succeeded: u64,
    pub failed_recoverable: u64,
    pub failed_nonrecoverable: u64,
    pub queue_primary_len: usize,
    pub queue_secondary_len: usize,
    pub last_latency: Option<Duration>,
}

/// Where a sink publishes its metrics snapshots. Replaces the source's
/// global static metric registry with an explicit, process-wide service a
/// sink is handed at construction.
pub trait MetricsSink: Send + Sync {
    fn publish(&self, name: &str, snapshot: SinkMetrics);
}

/// A `MetricsSink` that does nothing, for embedders that don't care.
#[derive(Debug, Default)]
pub struct NoopMetricsSink;

impl MetricsSink for NoopMetricsSink {
    fn publish(&self, _name: &str, _snapshot: SinkMetrics) {}
}

/// Accumulates atomics a dispatcher updates lock-free at every transition,
/// and can be snapshotted at emission time.
#[derive(Debug, Default)]
pub struct MetricsCounters {
    attempted: AtomicU64,
    succeeded: AtomicU64,
    failed_recoverable: AtomicU64,
    failed_nonrecoverable: AtomicU64,
}

impl MetricsCounters {
    pub fn record_attempt(&self) {
        self.attempted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_success(&self, count: u64) {
        self.succeeded.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_failed_recoverable(&self, count: u64) {
        self.failed_recoverable.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_failed_nonrecoverable(&self, count: u64) {
        self.failed_nonrecoverable.fetch_add(count, Ordering::Relaxed);
    }

    pub fn snapshot(&self, queue_primary_len: usize, queue_secondary_len: usize, last_latency: Option<Duration>) -> SinkMetrics {
        SinkMetrics {
            attempted: self.attempted.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed_recoverable: self.failed_recoverable.load(Ordering::Relaxed),
            failed_nonrecoverable: self.failed_nonrecoverable.load(Ordering::Relaxed),
            queue_primary_len,
            queue_secondary_len,
            last_latency,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_across_batches() {
        let counters = MetricsCounters::default();
        counters.record_attempt();
        counters.record_success(3);
        counters.record_failed_recoverable(2);
        let snapshot = counters.snapshot(5, 0, Some(Duration::from_millis(20)));
        assert_eq!(snapshot.attempted, 1);
        assert_eq!(snapshot.succeeded, 3);
        assert_eq!(snapshot.failed_recoverable, 2);
        assert_eq!(snapshot.queue_primary_len, 5);
    }
}
