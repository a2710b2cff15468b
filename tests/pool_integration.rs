//! Integration tests for the pool registry
//!
//! These tests drive pools through the registry with the scripted in-memory
//! factory, covering acquisition, circuit breaking, load balancing, reaping
//! and health classification together.

use connpool::config::{PoolConfig, PoolConfigUpdate, RegistryConfig};
use connpool::lb::{PoolHealth, Strategy};
use connpool::pool::{BackendKind, CircuitState, ConnectionId, Endpoint, NoopMetricsSink, PoolError};
use connpool::testing::{ScriptedConnection, ScriptedFactory};
use connpool::PoolRegistry;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

fn registry(factory: &Arc<ScriptedFactory>) -> PoolRegistry {
    PoolRegistry::new(RegistryConfig::default(), Arc::new(NoopMetricsSink))
        .with_default_factory(factory.clone())
}

fn db_endpoint() -> Endpoint {
    Endpoint::new("db.internal", 5432).with_database("orders")
}

fn pool_config(min: usize, max: usize) -> PoolConfig {
    PoolConfig {
        min_connections: min,
        max_connections: max,
        retry_attempts: 0,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_create_pool_opens_min_connections() {
    let factory = Arc::new(ScriptedFactory::new());
    let registry = registry(&factory);

    registry
        .create_pool("orders", BackendKind::Database, db_endpoint(), pool_config(5, 20))
        .await
        .unwrap();

    let stats = registry.get_pool_stats("orders").unwrap();
    assert_eq!(stats.idle, 5);
    assert_eq!(stats.active, 0);
    assert_eq!(stats.total, 5);

    registry.stop().await;
}

#[tokio::test]
async fn test_acquire_release_restores_counts() {
    let factory = Arc::new(ScriptedFactory::new());
    let registry = registry(&factory);
    registry
        .create_pool("orders", BackendKind::Database, db_endpoint(), pool_config(3, 5))
        .await
        .unwrap();

    let before = registry.get_pool_stats("orders").unwrap();
    let lease = registry.acquire("orders", None).await.unwrap();
    assert_eq!(lease.pool(), "orders");

    let conn = lease.downcast_ref::<ScriptedConnection>().unwrap();
    assert_eq!(conn.address, "db.internal:5432");

    registry.release("orders", lease.id()).await.unwrap();
    let after = registry.get_pool_stats("orders").unwrap();

    assert_eq!(after.total, before.total);
    assert_eq!(after.idle, before.idle);
    assert_eq!(after.active, before.active);

    registry.stop().await;
}

#[tokio::test]
async fn test_connection_never_handed_out_twice() {
    let factory = Arc::new(ScriptedFactory::new());
    let registry = Arc::new(registry(&factory));
    let pool = registry
        .create_pool("orders", BackendKind::Database, db_endpoint(), pool_config(2, 4))
        .await
        .unwrap();

    let held: Arc<Mutex<HashSet<ConnectionId>>> = Arc::new(Mutex::new(HashSet::new()));
    let mut tasks = Vec::new();

    for _ in 0..16 {
        let registry = Arc::clone(&registry);
        let held = Arc::clone(&held);
        tasks.push(tokio::spawn(async move {
            for _ in 0..10 {
                let lease = registry
                    .acquire("orders", Some(Duration::from_secs(5)))
                    .await
                    .unwrap();
                assert!(held.lock().insert(lease.id()), "connection handed out twice");

                tokio::time::sleep(Duration::from_millis(1)).await;

                held.lock().remove(&lease.id());
                registry.release("orders", lease.id()).await.unwrap();
            }
        }));
    }

    for _ in 0..20 {
        let stats = pool.metrics();
        assert_eq!(stats.total, stats.active + stats.idle);
        assert!(stats.total <= 4);
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    for task in tasks {
        task.await.unwrap();
    }

    let stats = pool.metrics();
    assert_eq!(stats.active, 0);
    assert!(stats.total <= 4);
    assert_eq!(stats.waiting, 0);

    registry.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_circuit_breaker_lifecycle() {
    let factory = Arc::new(ScriptedFactory::new());
    factory.fail_all_creates(true);
    let registry = registry(&factory);

    let config = PoolConfig {
        circuit_breaker_threshold: 5,
        circuit_breaker_timeout: Duration::from_secs(60),
        ..pool_config(0, 10)
    };
    let pool = registry
        .create_pool("orders", BackendKind::Database, db_endpoint(), config)
        .await
        .unwrap();

    for _ in 0..5 {
        let err = registry.acquire("orders", None).await.unwrap_err();
        assert!(matches!(err, PoolError::ConnectionCreation { .. }));
    }
    assert_eq!(factory.create_calls(), 5);

    // Open: fails fast without touching the factory
    let err = registry.acquire("orders", None).await.unwrap_err();
    assert!(matches!(err, PoolError::CircuitOpen { .. }));
    assert_eq!(factory.create_calls(), 5);

    // Half-open probe fails and reopens the circuit
    tokio::time::advance(Duration::from_secs(60)).await;
    let err = registry.acquire("orders", None).await.unwrap_err();
    assert!(matches!(err, PoolError::ConnectionCreation { .. }));
    assert_eq!(factory.create_calls(), 6);
    assert!(matches!(pool.circuit_stats().state, CircuitState::Open { .. }));

    // Cooldown restarted from the probe failure
    tokio::time::advance(Duration::from_secs(30)).await;
    let err = registry.acquire("orders", None).await.unwrap_err();
    assert!(matches!(err, PoolError::CircuitOpen { .. }));
    assert_eq!(factory.create_calls(), 6);

    // Next probe succeeds and closes the circuit
    tokio::time::advance(Duration::from_secs(30)).await;
    factory.fail_all_creates(false);
    let lease = registry.acquire("orders", None).await.unwrap();
    assert_eq!(factory.create_calls(), 7);

    let circuit = pool.circuit_stats();
    assert_eq!(circuit.state, CircuitState::Closed);
    assert_eq!(circuit.failures, 0);
    assert_eq!(circuit.open_count, 2);

    registry.release("orders", lease.id()).await.unwrap();
    registry.stop().await;
}

#[tokio::test]
async fn test_exhausted_pool_blocks_until_release_or_timeout() {
    let factory = Arc::new(ScriptedFactory::new());
    let registry = Arc::new(registry(&factory));
    registry
        .create_pool("orders", BackendKind::Database, db_endpoint(), pool_config(2, 2))
        .await
        .unwrap();

    let first = registry.acquire("orders", None).await.unwrap();
    let _second = registry.acquire("orders", None).await.unwrap();

    let waiter = {
        let registry = Arc::clone(&registry);
        tokio::spawn(async move { registry.acquire("orders", Some(Duration::from_secs(5))).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!waiter.is_finished());

    registry.release("orders", first.id()).await.unwrap();
    let handed_over = waiter.await.unwrap().unwrap();
    assert_eq!(handed_over.id(), first.id());

    let err = registry
        .acquire("orders", Some(Duration::from_millis(100)))
        .await
        .unwrap_err();
    assert!(matches!(err, PoolError::AcquireTimeout { .. }));
    assert_eq!(factory.created(), 2);

    registry.stop().await;
}

#[tokio::test]
async fn test_round_robin_selects_each_once_per_cycle() {
    let factory = Arc::new(ScriptedFactory::new());
    let registry = registry(&factory);
    let config = PoolConfig {
        load_balancing_strategy: Strategy::RoundRobin,
        ..pool_config(3, 3)
    };
    registry
        .create_pool("orders", BackendKind::Database, db_endpoint(), config)
        .await
        .unwrap();

    let picks: Vec<ConnectionId> = (0..6)
        .map(|_| registry.load_balance("orders").unwrap().unwrap().id)
        .collect();

    let mut first_cycle = picks[..3].to_vec();
    assert!(first_cycle.windows(2).all(|w| w[0] < w[1]));
    first_cycle.dedup();
    assert_eq!(first_cycle.len(), 3);
    assert_eq!(picks[..3], picks[3..]);

    // Selection does not claim
    assert_eq!(registry.get_pool_stats("orders").unwrap().idle, 3);

    registry.stop().await;
}

#[tokio::test]
async fn test_idle_reaper_destroys_expired_connections() {
    let factory = Arc::new(ScriptedFactory::new());
    let registry = registry(&factory);
    let config = PoolConfig {
        idle_timeout: Duration::from_millis(50),
        ..pool_config(1, 4)
    };
    registry
        .create_pool("orders", BackendKind::Database, db_endpoint(), config)
        .await
        .unwrap();

    let lease = registry.acquire("orders", None).await.unwrap();
    registry.release("orders", lease.id()).await.unwrap();
    let before = registry.get_pool_stats("orders").unwrap();

    // Not idle long enough yet
    assert_eq!(registry.reap_idle().await, 0);

    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(registry.reap_idle().await, 1);

    let after = registry.get_pool_stats("orders").unwrap();
    assert_eq!(after.total, before.total - 1);
    assert_eq!(after.idle, before.idle - 1);
    assert_eq!(after.destroyed, before.destroyed + 1);
    assert_eq!(factory.destroyed(), 1);

    registry.stop().await;
}

async fn health_after_failures(failing: usize) -> PoolHealth {
    let factory = Arc::new(ScriptedFactory::new());
    let registry = registry(&factory);
    let pool = registry
        .create_pool("orders", BackendKind::Database, db_endpoint(), pool_config(10, 10))
        .await
        .unwrap();

    factory.fail_next_probes(failing);
    let report = pool.run_health_check().await;

    assert_eq!(report.checked, 10);
    assert_eq!(report.healthy, 10 - failing);
    assert_eq!(report.evicted, failing);
    assert_eq!(report.replenished, failing);
    assert_eq!(pool.health(), report.health);

    let stats = pool.metrics();
    assert_eq!(stats.health_check_passed, (10 - failing) as u64);
    assert_eq!(stats.health_check_failed, failing as u64);
    assert_eq!(stats.total, 10);

    registry.stop().await;
    report.health
}

#[tokio::test]
async fn test_health_classification() {
    assert_eq!(health_after_failures(2).await, PoolHealth::Healthy);
    assert_eq!(health_after_failures(4).await, PoolHealth::Degraded);
    assert_eq!(health_after_failures(7).await, PoolHealth::Critical);
}

#[tokio::test]
async fn test_report_error_exhausts_budget() {
    let factory = Arc::new(ScriptedFactory::new());
    let registry = registry(&factory);
    let config = PoolConfig {
        retry_attempts: 2,
        ..pool_config(1, 2)
    };
    registry
        .create_pool("orders", BackendKind::Database, db_endpoint(), config)
        .await
        .unwrap();

    // Within budget: goes back to idle
    let lease = registry.acquire("orders", None).await.unwrap();
    registry.report_error("orders", lease.id()).unwrap();
    registry.report_error("orders", lease.id()).unwrap();
    registry.release("orders", lease.id()).await.unwrap();
    assert_eq!(registry.get_pool_stats("orders").unwrap().idle, 1);

    // Over budget: destroyed on release
    let lease = registry.acquire("orders", None).await.unwrap();
    registry.report_error("orders", lease.id()).unwrap();
    registry.release("orders", lease.id()).await.unwrap();

    let stats = registry.get_pool_stats("orders").unwrap();
    assert_eq!(stats.total, 0);
    assert_eq!(stats.destroyed, 1);

    registry.stop().await;
}

#[tokio::test]
async fn test_update_pool_config() {
    let factory = Arc::new(ScriptedFactory::new());
    let registry = Arc::new(registry(&factory));
    registry
        .create_pool("orders", BackendKind::Database, db_endpoint(), pool_config(1, 1))
        .await
        .unwrap();

    let err = registry
        .update_pool_config(
            "orders",
            &PoolConfigUpdate {
                max_connections: Some(0),
                ..Default::default()
            },
        )
        .unwrap_err();
    assert!(matches!(err, PoolError::InvalidConfig(_)));

    let _held = registry.acquire("orders", None).await.unwrap();
    let waiter = {
        let registry = Arc::clone(&registry);
        tokio::spawn(async move { registry.acquire("orders", Some(Duration::from_secs(5))).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    // Raising the limit lets the waiter create a connection
    let updated = registry
        .update_pool_config(
            "orders",
            &PoolConfigUpdate {
                max_connections: Some(2),
                load_balancing_strategy: Some(Strategy::LeastConnections),
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(updated.max_connections, 2);
    assert_eq!(updated.min_connections, 1);

    let lease = waiter.await.unwrap().unwrap();
    assert_eq!(registry.get_pool_stats("orders").unwrap().active, 2);
    registry.release("orders", lease.id()).await.unwrap();

    registry.stop().await;
}
