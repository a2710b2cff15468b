//! Registry of named connection pools
//!
//! The registry is the entry point for callers. It owns every [`Pool`],
//! resolves a [`ConnectionFactory`] per backend kind, and runs two
//! background loops across all pools: the idle reaper and the metrics
//! flush. Each pool's health checker runs under a child of the registry's
//! cancellation token, so [`PoolRegistry::stop`] halts all background work.

use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{PoolConfig, PoolConfigUpdate, PoolDefinition, RegistryConfig};
use crate::factory::{ConnectionFactory, TcpConnectionFactory};
use crate::pool::{
    BackendKind, ConnectionId, ConnectionInfo, Endpoint, Lease, MetricsSink, Pool, PoolError,
    PoolMetrics,
};

type PoolMap = Arc<RwLock<HashMap<String, Arc<Pool>>>>;

/// Owns all named pools and their background tasks
///
/// Must be created inside a Tokio runtime.
pub struct PoolRegistry {
    pools: PoolMap,
    factories: HashMap<BackendKind, Arc<dyn ConnectionFactory>>,
    default_factory: Arc<dyn ConnectionFactory>,
    sink: Arc<dyn MetricsSink>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PoolRegistry {
    /// Create an empty registry and start the reaper and metrics loops
    pub fn new(config: RegistryConfig, sink: Arc<dyn MetricsSink>) -> Self {
        let pools: PoolMap = Arc::new(RwLock::new(HashMap::new()));
        let cancel = CancellationToken::new();

        let reaper = spawn_periodic(
            "idle reaper",
            config.reaper_interval,
            cancel.clone(),
            {
                let pools = Arc::clone(&pools);
                move || {
                    let pools = Arc::clone(&pools);
                    async move {
                        reap_all(&pools).await;
                    }
                }
            },
        );

        let flush = spawn_periodic(
            "metrics flush",
            config.metrics_interval,
            cancel.clone(),
            {
                let pools = Arc::clone(&pools);
                let sink = Arc::clone(&sink);
                move || {
                    flush_all(&pools, sink.as_ref());
                    async {}
                }
            },
        );

        info!(
            reaper_interval_ms = config.reaper_interval.as_millis() as u64,
            metrics_interval_ms = config.metrics_interval.as_millis() as u64,
            "Pool registry started"
        );

        Self {
            pools,
            factories: HashMap::new(),
            default_factory: Arc::new(TcpConnectionFactory::default()),
            sink,
            cancel,
            tasks: Mutex::new(vec![reaper, flush]),
        }
    }

    /// Use `factory` for pools of the given backend kind
    pub fn with_factory(mut self, kind: BackendKind, factory: Arc<dyn ConnectionFactory>) -> Self {
        self.factories.insert(kind, factory);
        self
    }

    /// Use `factory` for backend kinds without a dedicated factory.
    /// Defaults to [`TcpConnectionFactory`].
    pub fn with_default_factory(mut self, factory: Arc<dyn ConnectionFactory>) -> Self {
        self.default_factory = factory;
        self
    }

    fn factory_for(&self, kind: BackendKind) -> Arc<dyn ConnectionFactory> {
        self.factories
            .get(&kind)
            .cloned()
            .unwrap_or_else(|| Arc::clone(&self.default_factory))
    }

    /// Create a pool, open its minimum connections and start its health
    /// checker.
    ///
    /// The configuration is validated before anything is created.
    pub async fn create_pool(
        &self,
        name: &str,
        kind: BackendKind,
        endpoint: Endpoint,
        config: PoolConfig,
    ) -> Result<Arc<Pool>, PoolError> {
        if self.cancel.is_cancelled() {
            return Err(PoolError::PoolClosed(name.to_string()));
        }

        let pool = Pool::new(name, kind, endpoint, config, self.factory_for(kind))?
            .with_metrics_sink(Arc::clone(&self.sink))
            .with_cancellation(self.cancel.child_token());
        let pool = Arc::new(pool);

        {
            let mut pools = self.pools.write();
            if pools.contains_key(name) {
                return Err(PoolError::PoolExists(name.to_string()));
            }
            pools.insert(name.to_string(), Arc::clone(&pool));
        }

        pool.initialize().await;
        let handle = pool.start_health_checks();
        self.tasks.lock().push(handle);

        info!(pool = %name, kind = %kind, endpoint = %pool.endpoint(), "Pool created");
        Ok(pool)
    }

    /// Create a pool from its configuration-file definition
    pub async fn create_pool_from(
        &self,
        name: &str,
        definition: &PoolDefinition,
    ) -> Result<Arc<Pool>, PoolError> {
        self.create_pool(
            name,
            definition.kind,
            definition.endpoint.clone(),
            definition.config.clone(),
        )
        .await
    }

    pub fn get_pool(&self, name: &str) -> Option<Arc<Pool>> {
        self.pools.read().get(name).cloned()
    }

    fn pool(&self, name: &str) -> Result<Arc<Pool>, PoolError> {
        self.get_pool(name)
            .ok_or_else(|| PoolError::PoolNotFound(name.to_string()))
    }

    pub fn pool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.pools.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Get a connection from the named pool
    pub async fn acquire(&self, name: &str, timeout: Option<Duration>) -> Result<Lease, PoolError> {
        self.pool(name)?.acquire(timeout).await
    }

    /// Return a connection to the named pool
    pub async fn release(&self, name: &str, id: ConnectionId) -> Result<(), PoolError> {
        self.pool(name)?.release(id).await;
        Ok(())
    }

    /// Count an error against a connection in the named pool
    pub fn report_error(&self, name: &str, id: ConnectionId) -> Result<bool, PoolError> {
        Ok(self.pool(name)?.report_error(id))
    }

    /// The connection the named pool would hand out next, without claiming it
    pub fn load_balance(&self, name: &str) -> Result<Option<ConnectionInfo>, PoolError> {
        Ok(self.pool(name)?.load_balance())
    }

    /// Metrics for every pool, keyed by name
    pub fn get_stats(&self) -> BTreeMap<String, PoolMetrics> {
        self.pools
            .read()
            .iter()
            .map(|(name, pool)| (name.clone(), pool.metrics()))
            .collect()
    }

    pub fn get_pool_stats(&self, name: &str) -> Result<PoolMetrics, PoolError> {
        Ok(self.pool(name)?.metrics())
    }

    /// Apply a partial config update to the named pool.
    ///
    /// The merged config is validated; on error the pool keeps its old config.
    pub fn update_pool_config(
        &self,
        name: &str,
        update: &PoolConfigUpdate,
    ) -> Result<PoolConfig, PoolError> {
        self.pool(name)?.update_config(update)
    }

    /// Run one idle-reaper sweep across all pools now
    pub async fn reap_idle(&self) -> usize {
        reap_all(&self.pools).await
    }

    /// Report every pool's gauges to the metrics sink now
    pub fn flush_metrics(&self) {
        flush_all(&self.pools, self.sink.as_ref());
    }

    /// Stop all background tasks and destroy every connection in every pool.
    ///
    /// Calling `stop` again does nothing.
    pub async fn stop(&self) {
        self.cancel.cancel();

        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }

        let pools: Vec<Arc<Pool>> = self.pools.write().drain().map(|(_, p)| p).collect();
        let count = pools.len();
        for pool in pools {
            pool.shutdown().await;
        }

        info!(pools = count, "Pool registry stopped");
    }
}

impl Drop for PoolRegistry {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Run `tick` every `interval` until `cancel` fires
fn spawn_periodic<F, Fut>(
    name: &'static str,
    interval: Duration,
    cancel: CancellationToken,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep(interval) => {}
            }
            tick().await;
        }
        debug!(task = name, "Background task stopped");
    })
}

fn snapshot(pools: &PoolMap) -> Vec<Arc<Pool>> {
    pools.read().values().cloned().collect()
}

async fn reap_all(pools: &PoolMap) -> usize {
    let mut total = 0;
    for pool in snapshot(pools) {
        total += pool.reap_idle().await;
    }
    if total > 0 {
        info!(reaped = total, "Idle reaper destroyed connections");
    }
    total
}

fn flush_all(pools: &PoolMap, sink: &dyn MetricsSink) {
    for pool in snapshot(pools) {
        pool.metrics().publish(pool.name(), sink);
    }
}
