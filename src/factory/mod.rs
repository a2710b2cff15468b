//! Connection factories
//!
//! Pools never speak a backend protocol themselves. They ask a
//! [`ConnectionFactory`] to open, probe and close connections and treat
//! whatever comes back as an opaque [`Connection`] handle.
//!
//! # Components
//!
//! - [`ConnectionFactory`]: creates, destroys and health-probes connections
//! - [`Connection`]: marker trait for pooled handles, downcastable to the
//!   concrete type the factory produced
//! - [`TcpConnectionFactory`]: plain TCP streams, usable for any backend kind

pub mod tcp;

pub use tcp::{TcpConnection, TcpConnectionFactory};

use async_trait::async_trait;
use std::any::Any;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use crate::pool::Endpoint;

/// Errors a factory can report while creating a connection
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Connection refused by {0}")]
    Refused(String),

    #[error("{0}")]
    Other(String),
}

/// An opaque pooled connection
///
/// Implemented for every `Send + Sync + Debug` type, so factories can hand
/// out their own connection structs directly.
pub trait Connection: Any + Send + Sync + Debug {
    fn as_any(&self) -> &dyn Any;
}

impl<T: Any + Send + Sync + Debug> Connection for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl dyn Connection {
    /// Borrow the concrete connection type behind the handle
    pub fn downcast_ref<T: Connection>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }
}

/// Outcome of a single health probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthProbe {
    pub success: bool,
    pub response_time: Duration,
    pub error: Option<String>,
}

impl HealthProbe {
    pub fn healthy(response_time: Duration) -> Self {
        Self {
            success: true,
            response_time,
            error: None,
        }
    }

    pub fn unhealthy(response_time: Duration, error: impl Into<String>) -> Self {
        Self {
            success: false,
            response_time,
            error: Some(error.into()),
        }
    }
}

/// Creates, destroys and probes connections for one kind of backend
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    /// Open a new connection to `endpoint`
    async fn create(&self, endpoint: &Endpoint) -> Result<Arc<dyn Connection>, ConnectionError>;

    /// Close a connection that is leaving its pool
    async fn destroy(&self, connection: Arc<dyn Connection>);

    /// Check whether a connection is still usable
    async fn check_health(&self, connection: &Arc<dyn Connection>) -> HealthProbe;
}
