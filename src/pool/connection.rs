//! Connection records tracked by a pool
//!
//! A [`ConnectionRecord`] pairs the opaque handle produced by a
//! [`ConnectionFactory`](crate::factory::ConnectionFactory) with the status,
//! health and timing metadata the pool needs to hand it out, check it and
//! retire it. Records are owned by exactly one pool.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::factory::Connection;

/// Unique identifier of a connection within its pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Kind of backend a pool talks to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Relational store
    Database,
    /// Cache server
    Cache,
    /// Outbound HTTP upstream
    Http,
}

impl BackendKind {
    pub fn name(&self) -> &'static str {
        match self {
            BackendKind::Database => "database",
            BackendKind::Cache => "cache",
            BackendKind::Http => "http",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "database" | "db" => Ok(BackendKind::Database),
            "cache" => Ok(BackendKind::Cache),
            "http" => Ok(BackendKind::Http),
            other => Err(format!("unknown backend kind: {other}")),
        }
    }
}

/// Where a pool's connections point
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            database: None,
        }
    }

    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    /// `host:port`, suitable for socket connects
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.database {
            Some(db) => write!(f, "{}:{}/{}", self.host, self.port, db),
            None => write!(f, "{}:{}", self.host, self.port),
        }
    }
}

/// Lifecycle status of a connection
///
/// Records move `Idle -> Active -> Idle`, or into `Failed`/`Destroyed` on the
/// way out of the pool. A destroyed record never comes back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Idle,
    Active,
    Failed,
    Destroyed,
}

/// Result of the most recent health probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Unknown,
}

/// A connection together with the bookkeeping the pool keeps for it
pub struct ConnectionRecord {
    pub id: ConnectionId,
    pub backend_kind: BackendKind,
    pub endpoint: Endpoint,
    pub status: ConnectionStatus,
    pub created_at: Instant,
    pub last_used_at: Instant,
    pub last_response_time: Duration,
    pub error_count: u32,
    pub health_status: HealthStatus,
    pub metadata: HashMap<String, String>,
    connection: Arc<dyn Connection>,
}

impl ConnectionRecord {
    /// Wrap a freshly created connection.
    ///
    /// A connection that was just established counts as healthy so it can be
    /// handed out before the first health check runs.
    pub fn new(
        id: ConnectionId,
        backend_kind: BackendKind,
        endpoint: Endpoint,
        connection: Arc<dyn Connection>,
    ) -> Self {
        let now = Instant::now();
        Self {
            id,
            backend_kind,
            endpoint,
            status: ConnectionStatus::Idle,
            created_at: now,
            last_used_at: now,
            last_response_time: Duration::ZERO,
            error_count: 0,
            health_status: HealthStatus::Healthy,
            metadata: HashMap::new(),
            connection,
        }
    }

    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.connection
    }

    pub fn is_idle(&self) -> bool {
        self.status == ConnectionStatus::Idle
    }

    pub fn is_active(&self) -> bool {
        self.status == ConnectionStatus::Active
    }

    /// Idle and healthy, i.e. eligible to be handed out
    pub fn is_available(&self) -> bool {
        self.is_idle() && self.health_status == HealthStatus::Healthy
    }

    /// Whether the connection has failed too often to be kept
    pub fn exceeds_error_budget(&self, retry_attempts: u32) -> bool {
        self.error_count > retry_attempts
    }

    /// Claim for a caller
    pub fn mark_active(&mut self) {
        self.status = ConnectionStatus::Active;
        self.last_used_at = Instant::now();
    }

    /// Return to the idle set
    pub fn mark_idle(&mut self) {
        self.status = ConnectionStatus::Idle;
        self.last_used_at = Instant::now();
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_used_at)
    }

    /// Snapshot without the handle, for logging and inspection
    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id,
            backend_kind: self.backend_kind,
            endpoint: self.endpoint.clone(),
            status: self.status,
            age: self.created_at.elapsed(),
            idle_for: self.last_used_at.elapsed(),
            last_response_time: self.last_response_time,
            error_count: self.error_count,
            health_status: self.health_status,
        }
    }
}

impl fmt::Debug for ConnectionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRecord")
            .field("id", &self.id)
            .field("backend_kind", &self.backend_kind)
            .field("endpoint", &self.endpoint)
            .field("status", &self.status)
            .field("error_count", &self.error_count)
            .field("health_status", &self.health_status)
            .finish()
    }
}

/// Point-in-time view of a connection record
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub backend_kind: BackendKind,
    pub endpoint: Endpoint,
    pub status: ConnectionStatus,
    pub age: Duration,
    pub idle_for: Duration,
    pub last_response_time: Duration,
    pub error_count: u32,
    pub health_status: HealthStatus,
}
