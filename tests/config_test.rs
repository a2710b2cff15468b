use connpool::config::{self, PoolConfigUpdate};
use connpool::lb::Strategy;
use connpool::pool::BackendKind;
use std::env;
use std::fs;
use std::time::Duration;
use tempfile::TempDir;

fn write_config(yaml: &str) -> (TempDir, std::path::PathBuf) {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("connpool.yaml");
    fs::write(&config_path, yaml).unwrap();
    (temp_dir, config_path)
}

/// Test loading configuration from YAML file
#[test]
fn test_load_yaml_config() {
    let yaml = r#"
registry:
  reaper_interval_ms: 20000
  metrics_interval_ms: 5000

pools:
  orders:
    kind: database
    endpoint:
      host: db.internal
      port: 5432
      database: orders
    max_connections: 20
    min_connections: 5
    acquire_timeout_ms: 2500
    circuit_breaker_threshold: 3
    load_balancing_strategy: least-connections
  api:
    kind: http
    endpoint:
      host: api.internal
      port: 443
    load_balancing_strategy: weighted
"#;

    let (_dir, path) = write_config(yaml);
    let config = config::load_from_yaml(&path).unwrap();

    assert_eq!(config.registry.reaper_interval, Duration::from_secs(20));
    assert_eq!(config.registry.metrics_interval, Duration::from_secs(5));
    assert_eq!(config.pools.len(), 2);

    let orders = config.pools.get("orders").unwrap();
    assert_eq!(orders.kind, BackendKind::Database);
    assert_eq!(orders.endpoint.to_string(), "db.internal:5432/orders");
    assert_eq!(orders.config.max_connections, 20);
    assert_eq!(orders.config.min_connections, 5);
    assert_eq!(orders.config.acquire_timeout, Duration::from_millis(2500));
    assert_eq!(orders.config.circuit_breaker_threshold, 3);
    assert_eq!(
        orders.config.load_balancing_strategy,
        Strategy::LeastConnections
    );

    let api = config.pools.get("api").unwrap();
    assert_eq!(api.kind, BackendKind::Http);
    assert_eq!(api.endpoint.database, None);
    assert_eq!(api.config.load_balancing_strategy, Strategy::Weighted);
}

/// Test default values
#[test]
fn test_default_values() {
    let yaml = r#"
pools:
  sessions:
    kind: cache
    endpoint:
      host: cache.internal
      port: 6379
"#;

    let (_dir, path) = write_config(yaml);
    let config = config::load_config(Some(path.to_str().unwrap())).unwrap();

    assert_eq!(config.registry.reaper_interval, Duration::from_secs(60));
    assert_eq!(config.registry.metrics_interval, Duration::from_secs(30));

    let pool = &config.pools.get("sessions").unwrap().config;
    assert_eq!(pool.max_connections, 10);
    assert_eq!(pool.min_connections, 2);
    assert_eq!(pool.idle_timeout, Duration::from_secs(300));
    assert_eq!(pool.connection_timeout, Duration::from_secs(5));
    assert_eq!(pool.acquire_timeout, Duration::from_secs(10));
    assert_eq!(pool.health_check_interval, Duration::from_secs(30));
    assert_eq!(pool.retry_attempts, 3);
    assert_eq!(pool.retry_delay, Duration::from_secs(1));
    assert_eq!(pool.circuit_breaker_threshold, 5);
    assert_eq!(pool.circuit_breaker_timeout, Duration::from_secs(60));
    assert_eq!(pool.load_balancing_strategy, Strategy::RoundRobin);
}

/// Misconfigured pools are rejected when the config is loaded
#[test]
fn test_invalid_pool_rejected() {
    let yaml = r#"
pools:
  orders:
    kind: database
    endpoint:
      host: db.internal
      port: 5432
    max_connections: 4
    min_connections: 8
"#;

    let (_dir, path) = write_config(yaml);
    let err = config::load_config(Some(path.to_str().unwrap())).unwrap_err();
    let message = format!("{:#}", err);
    assert!(message.contains("orders"), "{}", message);
}

#[test]
fn test_missing_file() {
    let result = config::load_from_yaml("/nonexistent/connpool.yaml");
    assert!(result.is_err());
}

#[test]
fn test_invalid_yaml() {
    let (_dir, path) = write_config("pools: [not, a, map");
    assert!(config::load_from_yaml(&path).is_err());
}

/// Test loading configuration from environment variables
#[test]
fn test_load_env_config() {
    let keys = [
        "CONNPOOL_POOLS",
        "CONNPOOL_MAX_CONNECTIONS",
        "CONNPOOL_MIN_CONNECTIONS",
        "CONNPOOL_LB_STRATEGY",
        "CONNPOOL_REAPER_INTERVAL_MS",
    ];
    let saved: Vec<(&str, Option<String>)> = keys.iter().map(|k| (*k, env::var(k).ok())).collect();

    env::set_var(
        "CONNPOOL_POOLS",
        "orders=db@db.internal:5432/orders, sessions=cache@cache.internal:6379",
    );
    env::set_var("CONNPOOL_MAX_CONNECTIONS", "25");
    env::set_var("CONNPOOL_MIN_CONNECTIONS", "4");
    env::set_var("CONNPOOL_LB_STRATEGY", "weighted");
    env::set_var("CONNPOOL_REAPER_INTERVAL_MS", "1500");

    let config = config::load_from_env().unwrap();

    assert_eq!(config.pools.len(), 2);
    let orders = config.pools.get("orders").unwrap();
    assert_eq!(orders.kind, BackendKind::Database);
    assert_eq!(orders.endpoint.database.as_deref(), Some("orders"));
    assert_eq!(orders.config.max_connections, 25);
    assert_eq!(orders.config.min_connections, 4);
    assert_eq!(orders.config.load_balancing_strategy, Strategy::Weighted);

    let sessions = config.pools.get("sessions").unwrap();
    assert_eq!(sessions.kind, BackendKind::Cache);
    assert_eq!(sessions.endpoint.port, 6379);

    assert_eq!(config.registry.reaper_interval, Duration::from_millis(1500));
    assert!(config.validate().is_ok());

    for (key, value) in saved {
        cleanup_env(key, value);
    }
}

/// Partial updates deserialize with only the given fields set
#[test]
fn test_pool_config_update_from_yaml() {
    let update: PoolConfigUpdate =
        serde_yaml::from_str("max_connections: 40\nretry_delay_ms: 250\n").unwrap();

    assert_eq!(update.max_connections, Some(40));
    assert_eq!(update.retry_delay, Some(Duration::from_millis(250)));
    assert_eq!(update.min_connections, None);
    assert_eq!(update.idle_timeout, None);
}

fn cleanup_env(key: &str, value: Option<String>) {
    match value {
        Some(v) => env::set_var(key, v),
        None => env::remove_var(key),
    }
}
