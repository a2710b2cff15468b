//! Pool metrics and the sink they are reported to

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::trace;

/// Counter names reported through [`MetricsSink::increment_counter`]
pub mod counters {
    pub const CONNECTIONS_CREATED: &str = "connections_created";
    pub const CONNECTIONS_DESTROYED: &str = "connections_destroyed";
    pub const CONNECTIONS_FAILED: &str = "connections_failed";
    pub const HEALTH_CHECK_PASSED: &str = "health_check_passed";
    pub const HEALTH_CHECK_FAILED: &str = "health_check_failed";
    pub const CIRCUIT_BREAKER_OPEN: &str = "circuit_breaker_open";
    pub const LOAD_BALANCED: &str = "load_balanced";
    pub const ACQUIRE_TIMEOUT: &str = "acquire_timeout";
}

/// Destination for pool metrics
///
/// Called while pool state is locked, so implementations must not block.
pub trait MetricsSink: Send + Sync {
    fn set_gauge(&self, pool: &str, metric: &str, value: f64);
    fn increment_counter(&self, pool: &str, metric: &str);
}

/// Emits every metric update as a `tracing` event
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMetricsSink;

impl MetricsSink for TracingMetricsSink {
    fn set_gauge(&self, pool: &str, metric: &str, value: f64) {
        trace!(target: "connpool::metrics", pool, metric, value, "gauge");
    }

    fn increment_counter(&self, pool: &str, metric: &str) {
        trace!(target: "connpool::metrics", pool, metric, "counter");
    }
}

/// Discards all metrics
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetricsSink;

impl MetricsSink for NoopMetricsSink {
    fn set_gauge(&self, _pool: &str, _metric: &str, _value: f64) {}

    fn increment_counter(&self, _pool: &str, _metric: &str) {}
}

/// Statistics for a pool
///
/// `total`, `active`, `idle` and `waiting` are point-in-time values taken
/// when the snapshot is made; everything else is monotonic or a running
/// average.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolMetrics {
    pub total: usize,
    pub active: usize,
    pub idle: usize,
    pub waiting: usize,
    pub created: u64,
    pub destroyed: u64,
    pub failed: u64,
    #[serde(with = "crate::config::millis")]
    pub avg_acquire_time: Duration,
    #[serde(with = "crate::config::millis")]
    pub avg_response_time: Duration,
    pub health_check_passed: u64,
    pub health_check_failed: u64,
    pub circuit_breaker_open_count: u64,
    pub load_balanced_count: u64,
}

impl PoolMetrics {
    /// Fold an acquire duration into the running average
    pub fn record_acquire_time(&mut self, elapsed: Duration) {
        self.avg_acquire_time = (self.avg_acquire_time + elapsed) / 2;
    }

    /// Fold a probe response time into the running average
    pub fn record_response_time(&mut self, elapsed: Duration) {
        self.avg_response_time = (self.avg_response_time + elapsed) / 2;
    }

    /// Report the point-in-time values as gauges
    pub fn publish(&self, pool: &str, sink: &dyn MetricsSink) {
        sink.set_gauge(pool, "total", self.total as f64);
        sink.set_gauge(pool, "active", self.active as f64);
        sink.set_gauge(pool, "idle", self.idle as f64);
        sink.set_gauge(pool, "waiting", self.waiting as f64);
        sink.set_gauge(
            pool,
            "avg_acquire_ms",
            self.avg_acquire_time.as_secs_f64() * 1000.0,
        );
        sink.set_gauge(
            pool,
            "avg_response_ms",
            self.avg_response_time.as_secs_f64() * 1000.0,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingSink;

    #[test]
    fn test_moving_averages() {
        let mut metrics = PoolMetrics::default();
        metrics.record_acquire_time(Duration::from_millis(100));
        assert_eq!(metrics.avg_acquire_time, Duration::from_millis(50));
        metrics.record_acquire_time(Duration::from_millis(50));
        assert_eq!(metrics.avg_acquire_time, Duration::from_millis(50));

        metrics.record_response_time(Duration::from_millis(20));
        assert_eq!(metrics.avg_response_time, Duration::from_millis(10));
    }

    #[test]
    fn test_publish_gauges() {
        let metrics = PoolMetrics {
            total: 3,
            active: 1,
            idle: 2,
            ..Default::default()
        };
        let sink = RecordingSink::new();
        metrics.publish("orders-db", &sink);

        assert_eq!(sink.gauge_updates(), 6);
        assert_eq!(sink.gauge("orders-db", "idle"), Some(2.0));
        assert_eq!(sink.gauge("orders-db", "active"), Some(1.0));
    }

    #[test]
    fn test_serialize_durations_as_millis() {
        let metrics = PoolMetrics {
            avg_acquire_time: Duration::from_millis(12),
            ..Default::default()
        };
        let json = serde_json::to_value(&metrics).unwrap();
        assert_eq!(json["avg_acquire_time"], 12);
    }
}
