use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Connection lifecycle counters for a pool
pub trait PoolMetrics: Send + Sync {
    /// Record a dial attempt
    fn record_connection_attempt(&self);

    /// Record a successful dial with its latency
    fn record_connection_success(&self, latency: Duration);

    /// Record a failed dial
    fn record_connection_failure(&self);

    /// Record a dial that hit the connect timeout
    fn record_connect_timeout(&self);

    /// Record an idle connection handed out again
    fn record_reuse(&self);

    /// Record a connection parked on the free list
    fn record_release(&self);

    /// Record a connection closed because its stream could not be trusted
    fn record_discard(&self);

    /// Record a connection closed because the free list was full
    fn record_over_capacity(&self);

    /// Get current metrics snapshot
    fn snapshot(&self) -> PoolMetricsSnapshot;

    /// Reset all counters (useful for testing)
    fn reset(&self);
}

/// Snapshot of pool counters at a point in time
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PoolMetricsSnapshot {
    pub connection_attempts: u64,
    pub connection_successes: u64,
    pub connection_failures: u64,
    pub connect_timeouts: u64,
    pub reused: u64,
    pub released: u64,
    pub discarded: u64,
    pub closed_over_capacity: u64,
    pub average_connect_latency_ms: f64,
}

/// Lock-free implementation of PoolMetrics
#[derive(Debug, Default)]
pub struct AtomicPoolMetrics {
    connection_attempts: AtomicU64,
    connection_successes: AtomicU64,
    connection_failures: AtomicU64,
    connect_timeouts: AtomicU64,
    reused: AtomicU64,
    released: AtomicU64,
    discarded: AtomicU64,
    closed_over_capacity: AtomicU64,
    connect_latency_micros: AtomicU64,
}

impl AtomicPoolMetrics {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PoolMetrics for AtomicPoolMetrics {
    fn record_connection_attempt(&self) {
        self.connection_attempts.fetch_add(1, Ordering::Relaxed);
    }

    fn record_connection_success(&self, latency: Duration) {
        self.connection_successes.fetch_add(1, Ordering::Relaxed);
        self.connect_latency_micros
            .fetch_add(latency.as_micros() as u64, Ordering::Relaxed);
    }

    fn record_connection_failure(&self) {
        self.connection_failures.fetch_add(1, Ordering::Relaxed);
    }

    fn record_connect_timeout(&self) {
        self.connect_timeouts.fetch_add(1, Ordering::Relaxed);
        self.record_connection_failure(); // A timeout is also a failure
    }

    fn record_reuse(&self) {
        self.reused.fetch_add(1, Ordering::Relaxed);
    }

    fn record_release(&self) {
        self.released.fetch_add(1, Ordering::Relaxed);
    }

    fn record_discard(&self) {
        self.discarded.fetch_add(1, Ordering::Relaxed);
    }

    fn record_over_capacity(&self) {
        self.closed_over_capacity.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> PoolMetricsSnapshot {
        let successes = self.connection_successes.load(Ordering::Relaxed);
        let average_connect_latency_ms = if successes > 0 {
            self.connect_latency_micros.load(Ordering::Relaxed) as f64 / successes as f64 / 1000.0
        } else {
            0.0
        };

        PoolMetricsSnapshot {
            connection_attempts: self.connection_attempts.load(Ordering::Relaxed),
            connection_successes: successes,
            connection_failures: self.connection_failures.load(Ordering::Relaxed),
            connect_timeouts: self.connect_timeouts.load(Ordering::Relaxed),
            reused: self.reused.load(Ordering::Relaxed),
            released: self.released.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            closed_over_capacity: self.closed_over_capacity.load(Ordering::Relaxed),
            average_connect_latency_ms,
        }
    }

    fn reset(&self) {
        for counter in [
            &self.connection_attempts,
            &self.connection_successes,
            &self.connection_failures,
            &self.connect_timeouts,
            &self.reused,
            &self.released,
            &self.discarded,
            &self.closed_over_capacity,
            &self.connect_latency_micros,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}
