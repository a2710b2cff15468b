//! In-memory collaborators for tests
//!
//! [`ScriptedFactory`] lets pool behaviour be exercised without a live
//! backend: creation can be made to fail or stall, and health probes can be
//! made to fail a given number of times. [`RecordingSink`] keeps every
//! metric update it receives.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::factory::{Connection, ConnectionError, ConnectionFactory, HealthProbe};
use crate::pool::{Endpoint, MetricsSink};

/// Connection handed out by [`ScriptedFactory`]
#[derive(Debug)]
pub struct ScriptedConnection {
    /// Creation order, starting at 1
    pub serial: u64,
    pub address: String,
}

#[derive(Debug, Default)]
pub struct ScriptedFactory {
    serial: AtomicU64,
    create_calls: AtomicUsize,
    created: AtomicUsize,
    destroyed: AtomicUsize,
    health_checks: AtomicUsize,
    fail_creates: AtomicUsize,
    fail_all: AtomicBool,
    fail_probes: AtomicUsize,
    create_delay: Mutex<Duration>,
    probe_latency: Mutex<Duration>,
}

impl ScriptedFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` creations fail
    pub fn fail_next_creates(&self, n: usize) {
        self.fail_creates.store(n, Ordering::SeqCst);
    }

    /// Make every creation fail until switched off
    pub fn fail_all_creates(&self, fail: bool) {
        self.fail_all.store(fail, Ordering::SeqCst);
    }

    /// Delay every creation by `delay`
    pub fn set_create_delay(&self, delay: Duration) {
        *self.create_delay.lock() = delay;
    }

    /// Make the next `n` health probes report unhealthy
    pub fn fail_next_probes(&self, n: usize) {
        self.fail_probes.store(n, Ordering::SeqCst);
    }

    /// Response time reported by successful probes
    pub fn set_probe_latency(&self, latency: Duration) {
        *self.probe_latency.lock() = latency;
    }

    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn destroyed(&self) -> usize {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub fn health_checks(&self) -> usize {
        self.health_checks.load(Ordering::SeqCst)
    }

    fn take_one(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl ConnectionFactory for ScriptedFactory {
    async fn create(&self, endpoint: &Endpoint) -> Result<Arc<dyn Connection>, ConnectionError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);

        let delay = *self.create_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if self.fail_all.load(Ordering::SeqCst) || Self::take_one(&self.fail_creates) {
            return Err(ConnectionError::Refused(endpoint.address()));
        }

        self.created.fetch_add(1, Ordering::SeqCst);
        let serial = self.serial.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Arc::new(ScriptedConnection {
            serial,
            address: endpoint.address(),
        }))
    }

    async fn destroy(&self, _connection: Arc<dyn Connection>) {
        self.destroyed.fetch_add(1, Ordering::SeqCst);
    }

    async fn check_health(&self, _connection: &Arc<dyn Connection>) -> HealthProbe {
        self.health_checks.fetch_add(1, Ordering::SeqCst);

        let latency = *self.probe_latency.lock();
        if Self::take_one(&self.fail_probes) {
            HealthProbe::unhealthy(latency, "scripted probe failure")
        } else {
            HealthProbe::healthy(latency)
        }
    }
}

/// Metrics sink that records every update
#[derive(Debug, Default)]
pub struct RecordingSink {
    counters: Mutex<Vec<(String, String)>>,
    gauges: Mutex<Vec<(String, String, f64)>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// How many times `metric` was incremented for `pool`
    pub fn counter(&self, pool: &str, metric: &str) -> usize {
        self.counters
            .lock()
            .iter()
            .filter(|(p, m)| p == pool && m == metric)
            .count()
    }

    /// The last value set for a gauge
    pub fn gauge(&self, pool: &str, metric: &str) -> Option<f64> {
        self.gauges
            .lock()
            .iter()
            .rev()
            .find(|(p, m, _)| p == pool && m == metric)
            .map(|(_, _, v)| *v)
    }

    pub fn gauge_updates(&self) -> usize {
        self.gauges.lock().len()
    }
}

impl MetricsSink for RecordingSink {
    fn set_gauge(&self, pool: &str, metric: &str, value: f64) {
        self.gauges
            .lock()
            .push((pool.to_string(), metric.to_string(), value));
    }

    fn increment_counter(&self, pool: &str, metric: &str) {
        self.counters
            .lock()
            .push((pool.to_string(), metric.to_string()));
    }
}
