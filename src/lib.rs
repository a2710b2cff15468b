//! connpool - named connection pools with circuit breaking, load balancing
//! and health checking

pub mod config;
pub mod factory;
pub mod lb;
pub mod pool;
pub mod registry;
pub mod testing;

pub use config::{Config, PoolConfig, PoolConfigUpdate};
pub use pool::{Lease, Pool, PoolError, PoolMetrics};
pub use registry::PoolRegistry;
