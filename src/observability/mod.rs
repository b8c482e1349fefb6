//! Observability infrastructure for pool operations.
//!
//! Provides per-pool metrics and a timer for drain and close durations.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Connection pool metrics collector.
#[derive(Debug, Default)]
pub struct PoolMetrics {
    /// Connections created by the factory.
    pub connections_created: AtomicU64,
    /// Factory failures.
    pub creation_failures: AtomicU64,
    /// Successful acquisitions.
    pub acquisitions: AtomicU64,
    /// Acquisitions served by an idle connection.
    pub reuses: AtomicU64,
    /// Times an acquire had to wait for a release.
    pub waits: AtomicU64,
    /// Acquisitions that timed out.
    pub timeouts: AtomicU64,
    /// Acquisitions rejected (exhausted or draining).
    pub rejections: AtomicU64,
    /// Connections returned to the pool.
    pub releases: AtomicU64,
    /// Connections invalidated after a failure.
    pub invalidations: AtomicU64,
    /// Idle connections retired (expired, stale or evicted).
    pub retirements: AtomicU64,
    /// Connections closed cleanly.
    pub closed: AtomicU64,
    /// Connections whose close failed.
    pub close_failures: AtomicU64,
}

impl PoolMetrics {
    /// Creates a new metrics collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a connection creation attempt.
    pub fn record_creation(&self, success: bool) {
        if success {
            self.connections_created.fetch_add(1, Ordering::Relaxed);
        } else {
            self.creation_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Records a successful acquisition.
    pub fn record_acquisition(&self, reused: bool) {
        self.acquisitions.fetch_add(1, Ordering::Relaxed);
        if reused {
            self.reuses.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Records a wait for a released connection.
    pub fn record_wait(&self) {
        self.waits.fetch_add(1, Ordering::Relaxed);
    }

    /// Records an acquire timeout.
    pub fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a rejected acquisition.
    pub fn record_rejection(&self) {
        self.rejections.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a connection coming back to the pool.
    pub fn record_check_in(&self, failed: bool) {
        if failed {
            self.invalidations.fetch_add(1, Ordering::Relaxed);
        } else {
            self.releases.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Records retired idle connections.
    pub fn record_retirements(&self, count: usize) {
        self.retirements.fetch_add(count as u64, Ordering::Relaxed);
    }

    /// Records a close attempt.
    pub fn record_close(&self, success: bool) {
        if success {
            self.closed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.close_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Returns a snapshot of all metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_created: self.connections_created.load(Ordering::Relaxed),
            creation_failures: self.creation_failures.load(Ordering::Relaxed),
            acquisitions: self.acquisitions.load(Ordering::Relaxed),
            reuses: self.reuses.load(Ordering::Relaxed),
            waits: self.waits.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            rejections: self.rejections.load(Ordering::Relaxed),
            releases: self.releases.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            retirements: self.retirements.load(Ordering::Relaxed),
            closed: self.closed.load(Ordering::Relaxed),
            close_failures: self.close_failures.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Connections created by the factory.
    pub connections_created: u64,
    /// Factory failures.
    pub creation_failures: u64,
    /// Successful acquisitions.
    pub acquisitions: u64,
    /// Acquisitions served by an idle connection.
    pub reuses: u64,
    /// Times an acquire had to wait for a release.
    pub waits: u64,
    /// Acquisitions that timed out.
    pub timeouts: u64,
    /// Acquisitions rejected.
    pub rejections: u64,
    /// Connections returned to the pool.
    pub releases: u64,
    /// Connections invalidated after a failure.
    pub invalidations: u64,
    /// Idle connections retired.
    pub retirements: u64,
    /// Connections closed cleanly.
    pub closed: u64,
    /// Connections whose close failed.
    pub close_failures: u64,
}

impl MetricsSnapshot {
    /// Returns the share of acquisitions served without creating a connection.
    pub fn reuse_rate(&self) -> f64 {
        if self.acquisitions == 0 {
            0.0
        } else {
            self.reuses as f64 / self.acquisitions as f64
        }
    }
}

/// Timer for measuring operation duration.
#[derive(Debug)]
pub struct Timer {
    start: Instant,
    name: &'static str,
}

impl Timer {
    /// Creates and starts a new timer.
    pub fn start(name: &'static str) -> Self {
        Self {
            start: Instant::now(),
            name,
        }
    }

    /// Returns the timer name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Returns the elapsed time.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Stops the timer and returns the duration.
    pub fn stop(self) -> Duration {
        let elapsed = self.start.elapsed();

        #[cfg(feature = "tracing")]
        tracing::debug!(
            timer = self.name,
            duration_ms = elapsed.as_millis() as u64,
            "Timer stopped"
        );

        elapsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics() {
        let metrics = PoolMetrics::new();

        metrics.record_creation(true);
        metrics.record_acquisition(false);
        metrics.record_acquisition(true);
        metrics.record_acquisition(true);
        metrics.record_check_in(true);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.connections_created, 1);
        assert_eq!(snapshot.acquisitions, 3);
        assert_eq!(snapshot.invalidations, 1);
        assert!((snapshot.reuse_rate() - 0.666).abs() < 0.01);
    }

    #[test]
    fn test_timer() {
        let timer = Timer::start("test");
        std::thread::sleep(Duration::from_millis(10));
        let duration = timer.stop();
        assert!(duration >= Duration::from_millis(10));
    }
}
