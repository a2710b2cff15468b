use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::lb::Strategy;
use crate::pool::{BackendKind, Endpoint};

/// Rejected pool configuration
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("max_connections must be at least 1")]
    ZeroMaxConnections,

    #[error("min_connections ({min}) exceeds max_connections ({max})")]
    MinExceedsMax { min: usize, max: usize },

    #[error("circuit_breaker_threshold must be at least 1")]
    ZeroBreakerThreshold,

    #[error("health_check_interval must be greater than zero")]
    ZeroHealthCheckInterval,
}

/// Serde helpers for durations written as integer milliseconds
pub mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }

    pub mod option {
        use serde::{Deserialize, Deserializer, Serializer};
        use std::time::Duration;

        pub fn serialize<S: Serializer>(
            value: &Option<Duration>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Duration>, D::Error> {
            Option::<u64>::deserialize(deserializer).map(|v| v.map(Duration::from_millis))
        }
    }
}

/// Per-pool settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Upper bound on connections (active + idle)
    pub max_connections: usize,

    /// Connections created up front and kept by the health checker
    pub min_connections: usize,

    /// Idle time after which the reaper destroys a connection
    #[serde(with = "millis", rename = "idle_timeout_ms")]
    pub idle_timeout: Duration,

    /// Limit for a single factory create call
    #[serde(with = "millis", rename = "connection_timeout_ms")]
    pub connection_timeout: Duration,

    /// Default wait for `acquire` when the caller gives none
    #[serde(with = "millis", rename = "acquire_timeout_ms")]
    pub acquire_timeout: Duration,

    #[serde(with = "millis", rename = "health_check_interval_ms")]
    pub health_check_interval: Duration,

    /// Error budget per connection, and creation retries per acquire
    pub retry_attempts: u32,

    #[serde(with = "millis", rename = "retry_delay_ms")]
    pub retry_delay: Duration,

    /// Consecutive failures that open the circuit
    pub circuit_breaker_threshold: u32,

    /// Cooldown after the last failure before a probe is allowed
    #[serde(with = "millis", rename = "circuit_breaker_timeout_ms")]
    pub circuit_breaker_timeout: Duration,

    pub load_balancing_strategy: Strategy,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            min_connections: 2,
            idle_timeout: Duration::from_secs(300),
            connection_timeout: Duration::from_secs(5),
            acquire_timeout: Duration::from_secs(10),
            health_check_interval: Duration::from_secs(30),
            retry_attempts: 3,
            retry_delay: Duration::from_secs(1),
            circuit_breaker_threshold: 5,
            circuit_breaker_timeout: Duration::from_secs(60),
            load_balancing_strategy: Strategy::RoundRobin,
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connections == 0 {
            return Err(ConfigError::ZeroMaxConnections);
        }
        if self.min_connections > self.max_connections {
            return Err(ConfigError::MinExceedsMax {
                min: self.min_connections,
                max: self.max_connections,
            });
        }
        if self.circuit_breaker_threshold == 0 {
            return Err(ConfigError::ZeroBreakerThreshold);
        }
        if self.health_check_interval.is_zero() {
            return Err(ConfigError::ZeroHealthCheckInterval);
        }
        Ok(())
    }

    /// This config with every field set in `update` replaced
    pub fn merged(&self, update: &PoolConfigUpdate) -> Self {
        Self {
            max_connections: update.max_connections.unwrap_or(self.max_connections),
            min_connections: update.min_connections.unwrap_or(self.min_connections),
            idle_timeout: update.idle_timeout.unwrap_or(self.idle_timeout),
            connection_timeout: update.connection_timeout.unwrap_or(self.connection_timeout),
            acquire_timeout: update.acquire_timeout.unwrap_or(self.acquire_timeout),
            health_check_interval: update
                .health_check_interval
                .unwrap_or(self.health_check_interval),
            retry_attempts: update.retry_attempts.unwrap_or(self.retry_attempts),
            retry_delay: update.retry_delay.unwrap_or(self.retry_delay),
            circuit_breaker_threshold: update
                .circuit_breaker_threshold
                .unwrap_or(self.circuit_breaker_threshold),
            circuit_breaker_timeout: update
                .circuit_breaker_timeout
                .unwrap_or(self.circuit_breaker_timeout),
            load_balancing_strategy: update
                .load_balancing_strategy
                .unwrap_or(self.load_balancing_strategy),
        }
    }
}

/// Partial pool settings for `update_pool_config`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfigUpdate {
    pub max_connections: Option<usize>,
    pub min_connections: Option<usize>,
    #[serde(with = "millis::option", rename = "idle_timeout_ms")]
    pub idle_timeout: Option<Duration>,
    #[serde(with = "millis::option", rename = "connection_timeout_ms")]
    pub connection_timeout: Option<Duration>,
    #[serde(with = "millis::option", rename = "acquire_timeout_ms")]
    pub acquire_timeout: Option<Duration>,
    #[serde(with = "millis::option", rename = "health_check_interval_ms")]
    pub health_check_interval: Option<Duration>,
    pub retry_attempts: Option<u32>,
    #[serde(with = "millis::option", rename = "retry_delay_ms")]
    pub retry_delay: Option<Duration>,
    pub circuit_breaker_threshold: Option<u32>,
    #[serde(with = "millis::option", rename = "circuit_breaker_timeout_ms")]
    pub circuit_breaker_timeout: Option<Duration>,
    pub load_balancing_strategy: Option<Strategy>,
}

/// Registry-wide background task settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// How often idle connections are reaped
    #[serde(with = "millis", rename = "reaper_interval_ms")]
    pub reaper_interval: Duration,

    /// How often pool gauges are pushed to the metrics sink
    #[serde(with = "millis", rename = "metrics_interval_ms")]
    pub metrics_interval: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            reaper_interval: Duration::from_secs(60),
            metrics_interval: Duration::from_secs(30),
        }
    }
}

/// A pool as written in the configuration file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolDefinition {
    pub kind: BackendKind,
    pub endpoint: Endpoint,
    #[serde(flatten)]
    pub config: PoolConfig,
}

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub registry: RegistryConfig,

    /// Named pools
    #[serde(default)]
    pub pools: BTreeMap<String, PoolDefinition>,
}

impl Config {
    /// Check every pool, naming the first one that is misconfigured
    pub fn validate(&self) -> Result<()> {
        if self.registry.reaper_interval.is_zero() {
            anyhow::bail!("registry.reaper_interval_ms must be greater than zero");
        }
        if self.registry.metrics_interval.is_zero() {
            anyhow::bail!("registry.metrics_interval_ms must be greater than zero");
        }
        for (name, pool) in &self.pools {
            pool.config
                .validate()
                .with_context(|| format!("Invalid configuration for pool '{}'", name))?;
        }
        Ok(())
    }
}

/// Load configuration from a YAML file
pub fn load_from_yaml<P: AsRef<Path>>(path: P) -> Result<Config> {
    let content = std::fs::read_to_string(path.as_ref())
        .context(format!("Failed to read config file: {:?}", path.as_ref()))?;

    let config: Config =
        serde_yaml::from_str(&content).context("Failed to parse YAML configuration")?;

    Ok(config)
}

/// Parse one `name=kind@host:port[/database]` pool entry
pub fn parse_pool_entry(entry: &str) -> Result<(String, PoolDefinition)> {
    let (name, target) = entry
        .split_once('=')
        .with_context(|| format!("Pool entry '{}' is missing '='", entry))?;
    let (kind, address) = target
        .split_once('@')
        .with_context(|| format!("Pool entry '{}' is missing '@'", entry))?;

    let kind: BackendKind = kind.trim().parse().map_err(anyhow::Error::msg)?;

    let (host_port, database) = match address.split_once('/') {
        Some((hp, db)) if !db.is_empty() => (hp, Some(db.to_string())),
        Some((hp, _)) => (hp, None),
        None => (address, None),
    };
    let (host, port) = host_port
        .rsplit_once(':')
        .with_context(|| format!("Pool entry '{}' is missing a port", entry))?;
    let port: u16 = port
        .parse()
        .with_context(|| format!("Invalid port in pool entry '{}'", entry))?;

    let name = name.trim();
    if name.is_empty() || host.is_empty() {
        anyhow::bail!("Pool entry '{}' needs a name and a host", entry);
    }

    Ok((
        name.to_string(),
        PoolDefinition {
            kind,
            endpoint: Endpoint {
                host: host.to_string(),
                port,
                database,
            },
            config: PoolConfig::default(),
        },
    ))
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Load configuration from environment variables
///
/// - CONNPOOL_POOLS (comma-separated `name=kind@host:port[/database]`)
/// - CONNPOOL_MAX_CONNECTIONS, CONNPOOL_MIN_CONNECTIONS (optional, every pool)
/// - CONNPOOL_LB_STRATEGY (optional, every pool)
/// - CONNPOOL_REAPER_INTERVAL_MS, CONNPOOL_METRICS_INTERVAL_MS (optional)
pub fn load_from_env() -> Result<Config> {
    // Try to load .env file if it exists (don't fail if it doesn't)
    let _ = dotenvy::dotenv();

    let mut config = Config::default();

    let pools = std::env::var("CONNPOOL_POOLS")
        .context("CONNPOOL_POOLS environment variable not set")?;

    for entry in pools.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let (name, definition) = parse_pool_entry(entry)?;
        config.pools.insert(name, definition);
    }

    if config.pools.is_empty() {
        anyhow::bail!("CONNPOOL_POOLS contains no valid pools");
    }

    let max = env_parse::<usize>("CONNPOOL_MAX_CONNECTIONS");
    let min = env_parse::<usize>("CONNPOOL_MIN_CONNECTIONS");
    let strategy = match std::env::var("CONNPOOL_LB_STRATEGY") {
        Ok(s) => Some(s.parse::<Strategy>().map_err(anyhow::Error::msg)?),
        Err(_) => None,
    };

    for definition in config.pools.values_mut() {
        if let Some(max) = max {
            definition.config.max_connections = max;
        }
        if let Some(min) = min {
            definition.config.min_connections = min;
        }
        if let Some(strategy) = strategy {
            definition.config.load_balancing_strategy = strategy;
        }
    }

    if let Some(ms) = env_parse::<u64>("CONNPOOL_REAPER_INTERVAL_MS") {
        config.registry.reaper_interval = Duration::from_millis(ms);
    }
    if let Some(ms) = env_parse::<u64>("CONNPOOL_METRICS_INTERVAL_MS") {
        config.registry.metrics_interval = Duration::from_millis(ms);
    }

    Ok(config)
}

/// Load configuration from file or environment
///
/// Reads the YAML file when a path is given, otherwise falls back to
/// environment variables. The result is validated either way.
pub fn load_config(config_path: Option<&str>) -> Result<Config> {
    let config = match config_path {
        Some(path) => load_from_yaml(path)?,
        None => load_from_env()?,
    };
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_from_yaml_str() {
        let yaml = r#"
registry:
  reaper_interval_ms: 15000
pools:
  crm-db:
    kind: database
    endpoint:
      host: db.internal
      port: 5432
      database: crm
    max_connections: 20
    min_connections: 5
    idle_timeout_ms: 60000
    load_balancing_strategy: weighted
  sessions:
    kind: cache
    endpoint:
      host: cache.internal
      port: 6379
"#;

        let config: Config = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(config.registry.reaper_interval, Duration::from_secs(15));
        assert_eq!(config.registry.metrics_interval, Duration::from_secs(30));
        assert_eq!(config.pools.len(), 2);

        let db = config.pools.get("crm-db").unwrap();
        assert_eq!(db.kind, BackendKind::Database);
        assert_eq!(db.endpoint.database.as_deref(), Some("crm"));
        assert_eq!(db.config.max_connections, 20);
        assert_eq!(db.config.min_connections, 5);
        assert_eq!(db.config.idle_timeout, Duration::from_secs(60));
        assert_eq!(db.config.load_balancing_strategy, Strategy::Weighted);

        // Should use defaults for everything not given
        let cache = config.pools.get("sessions").unwrap();
        assert_eq!(cache.config, PoolConfig::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_min_above_max() {
        let config = PoolConfig {
            min_connections: 8,
            max_connections: 4,
            ..Default::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::MinExceedsMax { min: 8, max: 4 })
        );

        let config = PoolConfig {
            max_connections: 0,
            min_connections: 0,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::ZeroMaxConnections));
    }

    #[test]
    fn test_merged_only_touches_given_fields() {
        let base = PoolConfig::default();
        let update = PoolConfigUpdate {
            max_connections: Some(50),
            retry_delay: Some(Duration::from_millis(250)),
            ..Default::default()
        };

        let merged = base.merged(&update);
        assert_eq!(merged.max_connections, 50);
        assert_eq!(merged.retry_delay, Duration::from_millis(250));
        assert_eq!(merged.min_connections, base.min_connections);
        assert_eq!(merged.idle_timeout, base.idle_timeout);
    }

    #[test]
    fn test_parse_pool_entry() {
        let (name, def) = parse_pool_entry("orders=database@db.internal:5432/orders").unwrap();
        assert_eq!(name, "orders");
        assert_eq!(def.kind, BackendKind::Database);
        assert_eq!(def.endpoint.host, "db.internal");
        assert_eq!(def.endpoint.port, 5432);
        assert_eq!(def.endpoint.database.as_deref(), Some("orders"));

        let (_, def) = parse_pool_entry("upstream=http@api.example.com:443").unwrap();
        assert_eq!(def.kind, BackendKind::Http);
        assert_eq!(def.endpoint.database, None);

        assert!(parse_pool_entry("broken").is_err());
        assert!(parse_pool_entry("x=cache@host").is_err());
        assert!(parse_pool_entry("x=queue@host:1").is_err());
    }
}
