//! Connection pooling and circuit breaker module
//!
//! This module provides:
//! - Bounded per-backend pools with lazy growth up to `max_connections`
//! - Circuit breaker that fails acquires fast after repeated failures
//! - Idle reaping and health-driven eviction
//! - Pool metrics and a pluggable sink to report them

pub mod circuit;
pub mod connection;
pub mod manager;
pub mod metrics;

pub use circuit::{Admission, CircuitBreaker, CircuitError, CircuitState, CircuitStats};
pub use connection::{
    BackendKind, ConnectionId, ConnectionInfo, ConnectionRecord, ConnectionStatus, Endpoint,
    HealthStatus,
};
pub use manager::{Lease, Pool, PoolError};
pub use metrics::{counters, MetricsSink, NoopMetricsSink, PoolMetrics, TracingMetricsSink};
