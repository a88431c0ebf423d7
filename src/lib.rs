pub mod config;
pub mod error;
/// Memcluster - multi-cluster memcached client
///
/// Keys are spread over the servers of a cluster by weighted modulo or
/// consistent hashing, with per-server connection pools, failover to the next
/// candidate server and failback once a dead server answers again. Several
/// named clusters live side by side in a `ClusterRegistry`.
pub mod client;
pub mod core;
pub mod health;
pub mod pool;
pub mod protocol;
pub mod registry;
pub mod routing;
pub mod stats;
pub mod transport;
pub mod utils;

pub use client::{ClusterClient, COUNTER_FAILURE};
pub use config::{ClusterConfig, Config, ConfigError, LoggingConfig};
pub use core::{Item, ServerSpec};
pub use error::{MemcacheError, MemcacheResult};
pub use pool::{PoolSnapshot, ServerPool};
pub use registry::{ClusterRegistry, ClusterScope};
pub use routing::{BucketRouter, HashingAlgorithm};
pub use stats::{CacheDump, ClusterStats, MemcachedStats, StatsItems, StatsSlabs};
pub use transport::{Connector, TcpConnector};
#[cfg(any(test, feature = "testing"))]
pub use transport::{MemoryConnector, MemoryServer};
