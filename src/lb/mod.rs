//! Connection selection and pool health
//!
//! - [`LoadBalancer`]: picks one of a pool's idle, healthy connections using
//!   round-robin, least-connections or weighted selection
//! - [`HealthChecker`]: periodically probes every connection in a pool and
//!   classifies the pool as healthy, degraded or critical

pub mod balancer;
pub mod health;

pub use balancer::{LoadBalancer, Strategy};
pub use health::{HealthChecker, HealthReport, PoolHealth};
