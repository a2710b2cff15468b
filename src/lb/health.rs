use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::time::{sleep, Instant};
use tracing::{debug, info};

use crate::pool::Pool;

/// Share of healthy connections at or above which a pool is healthy
pub const HEALTHY_RATIO: f64 = 0.8;
/// Share of healthy connections at or above which a pool is degraded
pub const DEGRADED_RATIO: f64 = 0.5;

/// Overall health of a pool, derived from the share of healthy connections
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolHealth {
    #[default]
    Healthy,
    Degraded,
    Critical,
}

impl PoolHealth {
    pub fn from_ratio(ratio: f64) -> Self {
        if ratio >= HEALTHY_RATIO {
            PoolHealth::Healthy
        } else if ratio >= DEGRADED_RATIO {
            PoolHealth::Degraded
        } else {
            PoolHealth::Critical
        }
    }

    /// An empty pool counts as fully healthy
    pub fn from_counts(healthy: usize, total: usize) -> Self {
        if total == 0 {
            return PoolHealth::Healthy;
        }
        Self::from_ratio(healthy as f64 / total as f64)
    }

    pub fn name(&self) -> &'static str {
        match self {
            PoolHealth::Healthy => "healthy",
            PoolHealth::Degraded => "degraded",
            PoolHealth::Critical => "critical",
        }
    }
}

impl fmt::Display for PoolHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Outcome of one health-check pass over a pool
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthReport {
    pub checked: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    /// Idle connections removed because they failed or ran out of error budget
    pub evicted: usize,
    /// Connections opened to get back to `min_connections`
    pub replenished: usize,
    pub health: PoolHealth,
}

/// Runs [`Pool::run_health_check`] on the pool's configured interval
///
/// The interval is re-read before every sleep so config updates take effect
/// on the next cycle. The task stops when the pool's cancellation token fires.
pub struct HealthChecker {
    pool: Arc<Pool>,
}

impl HealthChecker {
    pub fn new(pool: Arc<Pool>) -> Self {
        Self { pool }
    }

    /// Start the health check background task
    pub fn start(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let cancel = self.pool.cancellation().clone();

            info!(
                pool = %self.pool.name(),
                interval_ms = self.pool.config().health_check_interval.as_millis() as u64,
                "Health checker started"
            );

            loop {
                let interval = self.pool.config().health_check_interval;

                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = sleep(interval) => {}
                }

                let start = Instant::now();
                let report = self.pool.run_health_check().await;

                debug!(
                    pool = %self.pool.name(),
                    health = %report.health,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Health check cycle completed"
                );
            }

            info!(pool = %self.pool.name(), "Health checker stopped");
        })
    }
}
