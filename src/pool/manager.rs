//! A named, bounded pool of connections to one backend
//!
//! All mutable pool state (connection records, metrics, circuit breaker,
//! load-balancer cursor) sits behind a single lock. The lock is never held
//! across an await: factory calls and health probes run outside it and their
//! results are applied afterwards. Waiting acquirers park on a [`Notify`]
//! that is signalled whenever a connection is released, destroyed or
//! created, or a creation slot frees up.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::circuit::{Admission, CircuitBreaker, CircuitError, CircuitStats};
use super::connection::{
    BackendKind, ConnectionId, ConnectionInfo, ConnectionRecord, ConnectionStatus, Endpoint,
    HealthStatus,
};
use super::metrics::{counters, MetricsSink, PoolMetrics, TracingMetricsSink};
use crate::config::{ConfigError, PoolConfig, PoolConfigUpdate};
use crate::factory::{Connection, ConnectionError, ConnectionFactory, HealthProbe};
use crate::lb::{HealthChecker, HealthReport, LoadBalancer, PoolHealth};

/// Error types for pool operations
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("Pool not found: {0}")]
    PoolNotFound(String),

    #[error("Pool already exists: {0}")]
    PoolExists(String),

    #[error("Timed out after {timeout:?} waiting for a connection from pool {pool}")]
    AcquireTimeout { pool: String, timeout: Duration },

    #[error("Circuit breaker open for pool {pool}: {source}")]
    CircuitOpen {
        pool: String,
        #[source]
        source: CircuitError,
    },

    #[error("Failed to create connection for pool {pool}: {source}")]
    ConnectionCreation {
        pool: String,
        #[source]
        source: ConnectionError,
    },

    #[error("Health check failed for {id} in pool {pool}: {reason}")]
    HealthCheck {
        pool: String,
        id: ConnectionId,
        reason: String,
    },

    #[error("Invalid pool configuration: {0}")]
    InvalidConfig(#[from] ConfigError),

    #[error("Pool is closed: {0}")]
    PoolClosed(String),
}

/// A connection handed out by [`Pool::acquire`]
///
/// Give it back with `release(lease.id())`.
#[derive(Clone)]
pub struct Lease {
    pool: String,
    id: ConnectionId,
    connection: Arc<dyn Connection>,
}

impl Lease {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn pool(&self) -> &str {
        &self.pool
    }

    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.connection
    }

    /// The connection as the concrete type its factory created
    pub fn downcast_ref<T: Connection>(&self) -> Option<&T> {
        self.connection.downcast_ref::<T>()
    }
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("pool", &self.pool)
            .field("id", &self.id)
            .finish()
    }
}

struct PoolState {
    config: PoolConfig,
    connections: BTreeMap<ConnectionId, ConnectionRecord>,
    next_id: u64,
    /// Factory creates in flight; they count against `max_connections`
    pending: usize,
    waiting: usize,
    metrics: PoolMetrics,
    breaker: CircuitBreaker,
    balancer: LoadBalancer,
    health: PoolHealth,
    closed: bool,
}

impl PoolState {
    fn new(config: PoolConfig) -> Self {
        Self {
            breaker: CircuitBreaker::new(
                config.circuit_breaker_threshold,
                config.circuit_breaker_timeout,
            ),
            balancer: LoadBalancer::new(config.load_balancing_strategy),
            connections: BTreeMap::new(),
            next_id: 1,
            pending: 0,
            waiting: 0,
            metrics: PoolMetrics::default(),
            health: PoolHealth::Healthy,
            closed: false,
            config,
        }
    }

    fn has_capacity(&self) -> bool {
        self.connections.len() + self.pending < self.config.max_connections
    }

    fn snapshot(&self) -> PoolMetrics {
        let mut metrics = self.metrics.clone();
        metrics.active = self.connections.values().filter(|c| c.is_active()).count();
        metrics.idle = self.connections.values().filter(|c| c.is_idle()).count();
        metrics.total = metrics.active + metrics.idle;
        metrics.waiting = self.waiting;
        metrics.circuit_breaker_open_count = self.breaker.open_count();
        metrics
    }

    /// Choose an idle, healthy connection without claiming it
    fn select_available(&mut self, pool: &str, sink: &dyn MetricsSink) -> Option<ConnectionId> {
        let candidates: Vec<&ConnectionRecord> = self
            .connections
            .values()
            .filter(|c| c.is_available())
            .collect();

        match candidates.len() {
            0 => None,
            1 => Some(candidates[0].id),
            _ => {
                let idx = self.balancer.select(&candidates)?;
                let id = candidates[idx].id;
                self.metrics.load_balanced_count += 1;
                sink.increment_counter(pool, counters::LOAD_BALANCED);
                Some(id)
            }
        }
    }

    fn insert(&mut self, record_for: impl FnOnce(ConnectionId) -> ConnectionRecord) -> ConnectionId {
        let id = ConnectionId(self.next_id);
        self.next_id += 1;
        self.connections.insert(id, record_for(id));
        self.metrics.created += 1;
        id
    }

    /// Take a record out of the pool. Once removed, no acquire can select it.
    fn retire(
        &mut self,
        id: ConnectionId,
        status: ConnectionStatus,
        pool: &str,
        sink: &dyn MetricsSink,
    ) -> Option<ConnectionRecord> {
        let mut record = self.connections.remove(&id)?;
        record.status = status;
        self.metrics.destroyed += 1;
        sink.increment_counter(pool, counters::CONNECTIONS_DESTROYED);
        Some(record)
    }

    /// Retire idle connections unused for longer than `idle_timeout`
    fn expire_idle(
        &mut self,
        now: Instant,
        pool: &str,
        sink: &dyn MetricsSink,
    ) -> Vec<ConnectionRecord> {
        let idle_timeout = self.config.idle_timeout;
        let expired: Vec<ConnectionId> = self
            .connections
            .values()
            .filter(|c| c.is_idle() && c.idle_for(now) > idle_timeout)
            .map(|c| c.id)
            .collect();

        expired
            .into_iter()
            .filter_map(|id| self.retire(id, ConnectionStatus::Destroyed, pool, sink))
            .collect()
    }
}

/// Tracks what an in-progress acquire or creation holds, and gives it back
/// if the future is dropped part-way
struct InFlight<'a> {
    pool: &'a Pool,
    reserved: bool,
    probe: bool,
    waiting: bool,
}

impl<'a> InFlight<'a> {
    fn new(pool: &'a Pool) -> Self {
        Self {
            pool,
            reserved: false,
            probe: false,
            waiting: false,
        }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if !(self.reserved || self.probe || self.waiting) {
            return;
        }

        {
            let mut state = self.pool.state.lock();
            if self.reserved {
                state.pending = state.pending.saturating_sub(1);
            }
            if self.waiting {
                state.waiting = state.waiting.saturating_sub(1);
            }
            if self.probe {
                state.breaker.abandon_probe();
            }
        }

        if self.reserved {
            self.pool.available.notify_waiters();
        }
    }
}

enum Step {
    Create(Duration),
    Wait,
}

/// Connection pool for one backend
pub struct Pool {
    name: String,
    kind: BackendKind,
    endpoint: Endpoint,
    factory: Arc<dyn ConnectionFactory>,
    sink: Arc<dyn MetricsSink>,
    state: parking_lot::Mutex<PoolState>,
    available: Notify,
    cancel: CancellationToken,
}

impl Pool {
    /// Create an empty pool. Call [`initialize`](Self::initialize) to open
    /// the minimum connections.
    pub fn new(
        name: impl Into<String>,
        kind: BackendKind,
        endpoint: Endpoint,
        config: PoolConfig,
        factory: Arc<dyn ConnectionFactory>,
    ) -> Result<Self, PoolError> {
        config.validate()?;

        Ok(Self {
            name: name.into(),
            kind,
            endpoint,
            factory,
            sink: Arc::new(TracingMetricsSink),
            state: parking_lot::Mutex::new(PoolState::new(config)),
            available: Notify::new(),
            cancel: CancellationToken::new(),
        })
    }

    pub fn with_metrics_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Tie the pool's background work to an outer token
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn config(&self) -> PoolConfig {
        self.state.lock().config.clone()
    }

    pub fn metrics(&self) -> PoolMetrics {
        self.state.lock().snapshot()
    }

    pub fn health(&self) -> PoolHealth {
        self.state.lock().health
    }

    pub fn circuit_stats(&self) -> CircuitStats {
        self.state.lock().breaker.stats()
    }

    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.state
            .lock()
            .connections
            .values()
            .map(ConnectionRecord::info)
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub(crate) fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Open `min_connections` idle connections.
    ///
    /// Failures are counted and logged but do not stop the remaining
    /// creations. Returns how many connections were opened.
    pub async fn initialize(&self) -> usize {
        let min = self.state.lock().config.min_connections;
        let mut created = 0;

        for _ in 0..min {
            match self.create_idle().await {
                Ok(Some(_)) => created += 1,
                Ok(None) => break,
                Err(e) => {
                    warn!(pool = %self.name, error = %e, "Initial connection failed");
                }
            }
        }

        info!(
            pool = %self.name,
            kind = %self.kind,
            endpoint = %self.endpoint,
            created,
            requested = min,
            "Pool initialized"
        );
        created
    }

    /// Start the periodic health checker for this pool
    pub fn start_health_checks(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        HealthChecker::new(Arc::clone(self)).start()
    }

    /// Get a connection, waiting up to `timeout` (or the configured
    /// `acquire_timeout`) for one to become available.
    ///
    /// Dropping the returned future gives back any creation slot or circuit
    /// probe it held.
    pub async fn acquire(&self, timeout: Option<Duration>) -> Result<Lease, PoolError> {
        let timeout = match timeout {
            Some(t) => t,
            None => self.state.lock().config.acquire_timeout,
        };
        let start = Instant::now();

        match tokio::time::timeout(timeout, self.acquire_inner(start)).await {
            Ok(result) => result,
            Err(_) => {
                {
                    let mut state = self.state.lock();
                    self.sink
                        .increment_counter(&self.name, counters::ACQUIRE_TIMEOUT);
                    if state.breaker.record_failure() {
                        self.sink
                            .increment_counter(&self.name, counters::CIRCUIT_BREAKER_OPEN);
                    }
                }
                warn!(pool = %self.name, timeout_ms = timeout.as_millis() as u64, "Acquire timed out");
                Err(PoolError::AcquireTimeout {
                    pool: self.name.clone(),
                    timeout,
                })
            }
        }
    }

    async fn acquire_inner(&self, start: Instant) -> Result<Lease, PoolError> {
        let mut in_flight = InFlight::new(self);
        let mut creation_failures = 0u32;

        loop {
            // Register interest before looking at the state so a release
            // between the check and the wait is not missed
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let step = {
                let mut state = self.state.lock();

                if state.closed {
                    return Err(PoolError::PoolClosed(self.name.clone()));
                }

                if !in_flight.probe {
                    match state.breaker.check_request() {
                        Ok(Admission::Normal) => {}
                        Ok(Admission::Probe) => in_flight.probe = true,
                        Err(source) => {
                            debug!(pool = %self.name, error = %source, "Acquire rejected by circuit breaker");
                            return Err(PoolError::CircuitOpen {
                                pool: self.name.clone(),
                                source,
                            });
                        }
                    }
                }

                if let Some(lease) = state
                    .select_available(&self.name, self.sink.as_ref())
                    .and_then(|id| self.claim(&mut state, id, start))
                {
                    in_flight.probe = false;
                    return Ok(lease);
                }

                if state.has_capacity() {
                    state.pending += 1;
                    in_flight.reserved = true;
                    Step::Create(state.config.connection_timeout)
                } else {
                    state.waiting += 1;
                    in_flight.waiting = true;
                    Step::Wait
                }
            };

            match step {
                Step::Wait => {
                    notified.await;
                    let mut state = self.state.lock();
                    state.waiting = state.waiting.saturating_sub(1);
                    in_flight.waiting = false;
                }

                Step::Create(connect_timeout) => {
                    let result = self.open_connection(connect_timeout).await;

                    let next = {
                        let mut state = self.state.lock();
                        state.pending = state.pending.saturating_sub(1);
                        in_flight.reserved = false;

                        match result {
                            // Shut down while we were connecting
                            Ok(connection) if state.closed => Err(connection),
                            Ok(connection) => {
                                let id = self.add_record(&mut state, connection);
                                state.breaker.record_success();
                                in_flight.probe = false;
                                if let Some(lease) = self.claim(&mut state, id, start) {
                                    return Ok(lease);
                                }
                                Ok(Duration::ZERO)
                            }
                            Err(source) => {
                                self.record_creation_failure(&mut state, &source);
                                in_flight.probe = false;
                                creation_failures += 1;

                                if creation_failures > state.config.retry_attempts {
                                    drop(state);
                                    self.available.notify_waiters();
                                    return Err(PoolError::ConnectionCreation {
                                        pool: self.name.clone(),
                                        source,
                                    });
                                }
                                Ok(state.config.retry_delay)
                            }
                        }
                    };

                    // The freed slot may let a waiter create instead
                    self.available.notify_waiters();

                    match next {
                        Ok(retry_delay) => tokio::time::sleep(retry_delay).await,
                        Err(orphan) => {
                            self.factory.destroy(orphan).await;
                            debug!(pool = %self.name, "Discarded connection created after shutdown");
                            return Err(PoolError::PoolClosed(self.name.clone()));
                        }
                    }
                }
            }
        }
    }

    /// Mark a connection active and build its lease
    fn claim(&self, state: &mut PoolState, id: ConnectionId, start: Instant) -> Option<Lease> {
        let record = state.connections.get_mut(&id)?;
        record.mark_active();
        let connection = Arc::clone(record.connection());

        let elapsed = start.elapsed();
        state.metrics.record_acquire_time(elapsed);
        state.breaker.record_success();

        debug!(
            pool = %self.name,
            connection_id = %id,
            elapsed_ms = elapsed.as_millis() as u64,
            "Connection acquired"
        );

        Some(Lease {
            pool: self.name.clone(),
            id,
            connection,
        })
    }

    fn add_record(&self, state: &mut PoolState, connection: Arc<dyn Connection>) -> ConnectionId {
        let id = state.insert(|id| {
            ConnectionRecord::new(id, self.kind, self.endpoint.clone(), connection)
        });
        self.sink
            .increment_counter(&self.name, counters::CONNECTIONS_CREATED);
        debug!(pool = %self.name, connection_id = %id, "Created connection");
        id
    }

    fn record_creation_failure(&self, state: &mut PoolState, error: &ConnectionError) {
        state.metrics.failed += 1;
        self.sink
            .increment_counter(&self.name, counters::CONNECTIONS_FAILED);

        if state.breaker.record_failure() {
            self.sink
                .increment_counter(&self.name, counters::CIRCUIT_BREAKER_OPEN);
        }

        warn!(
            pool = %self.name,
            endpoint = %self.endpoint,
            error = %error,
            failures = state.breaker.failures(),
            "Connection creation failed"
        );
    }

    async fn open_connection(
        &self,
        connect_timeout: Duration,
    ) -> Result<Arc<dyn Connection>, ConnectionError> {
        match tokio::time::timeout(connect_timeout, self.factory.create(&self.endpoint)).await {
            Ok(result) => result,
            Err(_) => Err(ConnectionError::Timeout(connect_timeout)),
        }
    }

    /// Open one idle connection if there is room.
    ///
    /// Returns `Ok(None)` when the pool is already at `max_connections`.
    async fn create_idle(&self) -> Result<Option<ConnectionId>, PoolError> {
        let mut in_flight = InFlight::new(self);

        let connect_timeout = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(PoolError::PoolClosed(self.name.clone()));
            }
            if !state.has_capacity() {
                return Ok(None);
            }
            state.pending += 1;
            in_flight.reserved = true;
            state.config.connection_timeout
        };

        let result = self.open_connection(connect_timeout).await;

        let outcome = {
            let mut state = self.state.lock();
            state.pending = state.pending.saturating_sub(1);
            in_flight.reserved = false;

            match result {
                Ok(connection) if state.closed => Err(connection),
                Ok(connection) => {
                    let id = self.add_record(&mut state, connection);
                    state.breaker.record_success();
                    Ok(id)
                }
                Err(source) => {
                    self.record_creation_failure(&mut state, &source);
                    drop(state);
                    self.available.notify_waiters();
                    return Err(PoolError::ConnectionCreation {
                        pool: self.name.clone(),
                        source,
                    });
                }
            }
        };

        match outcome {
            Ok(id) => {
                self.available.notify_waiters();
                Ok(Some(id))
            }
            Err(orphan) => {
                // Shut down while we were connecting
                self.factory.destroy(orphan).await;
                Err(PoolError::PoolClosed(self.name.clone()))
            }
        }
    }

    /// Return a connection to the pool.
    ///
    /// Connections that are unhealthy or over their error budget are
    /// destroyed instead of going back to the idle set. Releasing an unknown
    /// or already idle connection does nothing.
    pub async fn release(&self, id: ConnectionId) {
        let retired = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let retry_attempts = state.config.retry_attempts;

            let Some(record) = state.connections.get_mut(&id) else {
                debug!(pool = %self.name, connection_id = %id, "Release of unknown connection ignored");
                return;
            };
            if !record.is_active() {
                return;
            }

            let should_destroy = record.exceeds_error_budget(retry_attempts)
                || record.health_status == HealthStatus::Unhealthy;

            if should_destroy {
                debug!(
                    pool = %self.name,
                    connection_id = %id,
                    error_count = record.error_count,
                    health = ?record.health_status,
                    "Destroying connection on release"
                );
                state.retire(id, ConnectionStatus::Failed, &self.name, self.sink.as_ref())
            } else {
                record.mark_idle();
                None
            }
        };

        self.available.notify_waiters();

        if let Some(record) = retired {
            self.dispose(record).await;
        }
    }

    /// Remove a connection and close it through the factory.
    ///
    /// Returns false if the connection was not in the pool.
    pub async fn destroy(&self, id: ConnectionId) -> bool {
        let retired = {
            let mut state = self.state.lock();
            state.retire(id, ConnectionStatus::Destroyed, &self.name, self.sink.as_ref())
        };

        match retired {
            Some(record) => {
                self.available.notify_waiters();
                self.dispose(record).await;
                true
            }
            None => false,
        }
    }

    /// Count an error against a connection, e.g. a failed query.
    ///
    /// Returns false if the connection was not in the pool.
    pub fn report_error(&self, id: ConnectionId) -> bool {
        let mut state = self.state.lock();
        match state.connections.get_mut(&id) {
            Some(record) => {
                record.error_count += 1;
                true
            }
            None => false,
        }
    }

    /// Pick the connection the next acquire would get, without claiming it
    pub fn load_balance(&self) -> Option<ConnectionInfo> {
        let mut state = self.state.lock();
        let id = state.select_available(&self.name, self.sink.as_ref())?;
        state.connections.get(&id).map(ConnectionRecord::info)
    }

    async fn dispose(&self, mut record: ConnectionRecord) {
        self.factory.destroy(Arc::clone(record.connection())).await;
        record.status = ConnectionStatus::Destroyed;
        debug!(pool = %self.name, connection_id = %record.id, "Destroyed connection");
    }

    /// Probe every connection, evict the ones that failed while idle and
    /// top the pool back up to `min_connections`.
    ///
    /// Probes run without holding the pool lock.
    pub async fn run_health_check(&self) -> HealthReport {
        let (targets, probe_timeout) = {
            let state = self.state.lock();
            if state.closed {
                return HealthReport::default();
            }
            let targets: Vec<(ConnectionId, Arc<dyn Connection>)> = state
                .connections
                .values()
                .map(|c| (c.id, Arc::clone(c.connection())))
                .collect();
            (targets, state.config.connection_timeout)
        };

        let mut handles = Vec::with_capacity(targets.len());
        for (id, connection) in targets {
            let factory = Arc::clone(&self.factory);
            handles.push(tokio::spawn(async move {
                let probe = match tokio::time::timeout(
                    probe_timeout,
                    factory.check_health(&connection),
                )
                .await
                {
                    Ok(probe) => probe,
                    Err(_) => HealthProbe::unhealthy(probe_timeout, "health check timed out"),
                };
                (id, probe)
            }));
        }

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok(result) => results.push(result),
                Err(e) => warn!(pool = %self.name, error = %e, "Health probe task failed"),
            }
        }

        let mut report = HealthReport {
            checked: results.len(),
            ..Default::default()
        };

        let (retired, deficit) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;

            for (id, probe) in results {
                // Destroyed while the probe was running
                let Some(record) = state.connections.get_mut(&id) else {
                    continue;
                };

                if probe.success {
                    record.health_status = HealthStatus::Healthy;
                    record.last_response_time = probe.response_time;
                    state.metrics.health_check_passed += 1;
                    state.metrics.record_response_time(probe.response_time);
                    self.sink
                        .increment_counter(&self.name, counters::HEALTH_CHECK_PASSED);
                } else {
                    record.health_status = HealthStatus::Unhealthy;
                    record.error_count += 1;
                    state.metrics.health_check_failed += 1;
                    self.sink
                        .increment_counter(&self.name, counters::HEALTH_CHECK_FAILED);

                    let err = PoolError::HealthCheck {
                        pool: self.name.clone(),
                        id,
                        reason: probe.error.unwrap_or_else(|| "unknown".to_string()),
                    };
                    debug!(error = %err, error_count = record.error_count, "Connection unhealthy");
                }
            }

            let total = state.connections.len();
            let healthy = state
                .connections
                .values()
                .filter(|c| c.health_status == HealthStatus::Healthy)
                .count();
            report.healthy = healthy;
            report.unhealthy = total - healthy;
            report.health = PoolHealth::from_counts(healthy, total);

            if report.health != state.health {
                info!(
                    pool = %self.name,
                    from = state.health.name(),
                    to = report.health.name(),
                    healthy,
                    total,
                    "Pool health changed"
                );
            }
            state.health = report.health;

            let retry_attempts = state.config.retry_attempts;
            let doomed: Vec<ConnectionId> = state
                .connections
                .values()
                .filter(|c| {
                    c.is_idle()
                        && (c.health_status == HealthStatus::Unhealthy
                            || c.exceeds_error_budget(retry_attempts))
                })
                .map(|c| c.id)
                .collect();

            let retired: Vec<ConnectionRecord> = doomed
                .into_iter()
                .filter_map(|id| {
                    state.retire(id, ConnectionStatus::Failed, &self.name, self.sink.as_ref())
                })
                .collect();

            let current = state.connections.len() + state.pending;
            let deficit = if state.breaker.is_closed() {
                state.config.min_connections.saturating_sub(current)
            } else {
                0
            };

            (retired, deficit)
        };

        report.evicted = retired.len();
        if !retired.is_empty() {
            self.available.notify_waiters();
        }
        for record in retired {
            self.dispose(record).await;
        }

        for _ in 0..deficit {
            match self.create_idle().await {
                Ok(Some(_)) => report.replenished += 1,
                Ok(None) => break,
                Err(e) => {
                    debug!(pool = %self.name, error = %e, "Replenishing connection failed");
                }
            }
        }

        debug!(
            pool = %self.name,
            checked = report.checked,
            healthy = report.healthy,
            evicted = report.evicted,
            replenished = report.replenished,
            "Health check pass complete"
        );

        report
    }

    /// Destroy idle connections unused for longer than `idle_timeout`.
    ///
    /// Returns how many were destroyed.
    pub async fn reap_idle(&self) -> usize {
        let retired = self
            .state
            .lock()
            .expire_idle(Instant::now(), &self.name, self.sink.as_ref());

        let count = retired.len();
        if count > 0 {
            self.available.notify_waiters();
            debug!(pool = %self.name, reaped = count, "Reaped idle connections");
        }
        for record in retired {
            self.dispose(record).await;
        }
        count
    }

    /// Apply a partial config update after validating the merged result
    pub fn update_config(&self, update: &PoolConfigUpdate) -> Result<PoolConfig, PoolError> {
        let config = {
            let mut state = self.state.lock();
            let merged = state.config.merged(update);
            merged.validate()?;

            state
                .breaker
                .reconfigure(merged.circuit_breaker_threshold, merged.circuit_breaker_timeout);
            state.balancer.set_strategy(merged.load_balancing_strategy);
            state.config = merged.clone();
            merged
        };

        // A larger max_connections may unblock waiters
        self.available.notify_waiters();

        info!(
            pool = %self.name,
            max_connections = config.max_connections,
            min_connections = config.min_connections,
            strategy = config.load_balancing_strategy.name(),
            "Pool configuration updated"
        );
        Ok(config)
    }

    /// Stop background work and destroy every connection.
    ///
    /// Waiting acquirers fail with [`PoolError::PoolClosed`].
    pub async fn shutdown(&self) {
        self.cancel.cancel();

        let retired: Vec<ConnectionRecord> = {
            let mut state = self.state.lock();
            state.closed = true;
            let ids: Vec<ConnectionId> = state.connections.keys().copied().collect();
            ids.into_iter()
                .filter_map(|id| {
                    state.retire(id, ConnectionStatus::Destroyed, &self.name, self.sink.as_ref())
                })
                .collect()
        };

        self.available.notify_waiters();

        let count = retired.len();
        for record in retired {
            self.dispose(record).await;
        }

        info!(pool = %self.name, destroyed = count, "Pool shut down");
    }
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("endpoint", &self.endpoint)
            .field("metrics", &self.metrics())
            .finish()
    }
}
