/// Cluster registry
///
/// Owns one `ClusterClient` per configured cluster. Operations go through a
/// `ClusterScope`, either for the default cluster or for a cluster named by
/// the caller. A scope for an unknown name logs `ClusterNotFound` and answers
/// every operation with its failure value.
use bytes::Bytes;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::client::{ClusterClient, COUNTER_FAILURE};
use crate::config::{ClusterConfig, Config};
use crate::core::Item;
use crate::error::{MemcacheError, MemcacheResult};
use crate::stats::{self, CacheDump, ClusterStats, MemcachedStats, StatsItems, StatsSlabs};
use crate::transport::Connector;

pub struct ClusterRegistry {
    clients: HashMap<String, Arc<ClusterClient>>,
    /// Cluster names in declaration order
    order: Vec<String>,
    default: String,
}

impl ClusterRegistry {
    /// Build, initialize and start every cluster of `config` over one connector
    pub async fn from_config(config: &Config, connector: Arc<dyn Connector>) -> MemcacheResult<Self> {
        Self::from_config_with(config, |_| connector.clone()).await
    }

    /// Like `from_config`, with a connector chosen per cluster
    pub async fn from_config_with<F>(config: &Config, mut connector_for: F) -> MemcacheResult<Self>
    where
        F: FnMut(&ClusterConfig) -> Arc<dyn Connector>,
    {
        config.validate()?;

        let default = config
            .default_cluster_name()
            .ok_or_else(|| MemcacheError::internal("no default cluster"))?;

        let mut clients = HashMap::new();
        let mut order = Vec::with_capacity(config.clusters.len());
        for cluster in &config.clusters {
            let client = Arc::new(ClusterClient::new(cluster.clone(), connector_for(cluster)));
            order.push(client.name().to_string());
            clients.insert(client.name().to_string(), client);
        }

        let starts = order.iter().filter_map(|name| clients.get(name)).map(|client| async move {
            let opened = client.start().await;
            info!(
                "Cluster {} ready: {} servers, {} connections opened",
                client.name(),
                client.pool().servers().len(),
                opened
            );
        });
        join_all(starts).await;

        info!("Cluster registry initialized with default cluster {}", default);
        Ok(Self {
            clients,
            order,
            default,
        })
    }

    /// Scope for the default cluster
    pub fn default_scope(&self) -> ClusterScope {
        self.on(&self.default)
    }

    /// Scope for a named cluster; operations fail softly if it does not exist
    pub fn on(&self, name: &str) -> ClusterScope {
        ClusterScope {
            name: name.to_string(),
            client: self.clients.get(name).cloned(),
        }
    }

    pub fn cluster(&self, name: &str) -> MemcacheResult<Arc<ClusterClient>> {
        self.clients
            .get(name)
            .cloned()
            .ok_or_else(|| MemcacheError::cluster_not_found(name))
    }

    pub fn names(&self) -> &[String] {
        &self.order
    }

    pub fn default_name(&self) -> &str {
        &self.default
    }

    /// Stop every maintenance loop and close all pooled connections
    pub fn shutdown(&self) {
        for name in &self.order {
            if let Some(client) = self.clients.get(name) {
                client.shutdown();
            }
        }
        info!("Cluster registry shut down");
    }
}

/// Operation surface bound to one cluster name
#[derive(Clone)]
pub struct ClusterScope {
    name: String,
    client: Option<Arc<ClusterClient>>,
}

impl ClusterScope {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn exists(&self) -> bool {
        self.client.is_some()
    }

    fn client(&self) -> Option<&ClusterClient> {
        if self.client.is_none() {
            warn!("{}", MemcacheError::cluster_not_found(self.name.as_str()));
        }
        self.client.as_deref()
    }

    pub async fn get(&self, key: &str) -> Option<Bytes> {
        self.client()?.get(key).await
    }

    pub async fn get_item(&self, key: &str) -> Option<Item> {
        self.client()?.get_item(key).await
    }

    pub async fn gets(&self, key: &str) -> Option<Item> {
        self.client()?.gets(key).await
    }

    pub async fn key_exists(&self, key: &str) -> bool {
        match self.client() {
            Some(client) => client.key_exists(key).await,
            None => false,
        }
    }

    pub async fn set(&self, key: &str, value: impl Into<Bytes>, expires_at_ms: u64) -> bool {
        match self.client() {
            Some(client) => client.set(key, value, expires_at_ms).await,
            None => false,
        }
    }

    pub async fn add(&self, key: &str, value: impl Into<Bytes>, expires_at_ms: u64) -> bool {
        match self.client() {
            Some(client) => client.add(key, value, expires_at_ms).await,
            None => false,
        }
    }

    pub async fn replace(&self, key: &str, value: impl Into<Bytes>, expires_at_ms: u64) -> bool {
        match self.client() {
            Some(client) => client.replace(key, value, expires_at_ms).await,
            None => false,
        }
    }

    pub async fn append(&self, key: &str, value: impl Into<Bytes>) -> bool {
        match self.client() {
            Some(client) => client.append(key, value).await,
            None => false,
        }
    }

    pub async fn prepend(&self, key: &str, value: impl Into<Bytes>) -> bool {
        match self.client() {
            Some(client) => client.prepend(key, value).await,
            None => false,
        }
    }

    pub async fn cas(&self, key: &str, value: impl Into<Bytes>, cas_token: u64, expires_at_ms: u64) -> bool {
        match self.client() {
            Some(client) => client.cas(key, value, cas_token, expires_at_ms).await,
            None => false,
        }
    }

    pub async fn delete(&self, key: &str) -> bool {
        match self.client() {
            Some(client) => client.delete(key).await,
            None => false,
        }
    }

    pub async fn incr(&self, key: &str) -> i64 {
        self.incr_by(key, 1).await
    }

    pub async fn incr_by(&self, key: &str, delta: u64) -> i64 {
        match self.client() {
            Some(client) => client.incr_by(key, delta).await,
            None => COUNTER_FAILURE,
        }
    }

    pub async fn decr(&self, key: &str) -> i64 {
        self.decr_by(key, 1).await
    }

    pub async fn decr_by(&self, key: &str, delta: u64) -> i64 {
        match self.client() {
            Some(client) => client.decr_by(key, delta).await,
            None => COUNTER_FAILURE,
        }
    }

    pub async fn store_counter(&self, key: &str, value: u64, expires_at_ms: u64) -> bool {
        match self.client() {
            Some(client) => client.store_counter(key, value, expires_at_ms).await,
            None => false,
        }
    }

    pub async fn get_counter(&self, key: &str) -> i64 {
        match self.client() {
            Some(client) => client.get_counter(key).await,
            None => COUNTER_FAILURE,
        }
    }

    pub async fn add_or_incr(&self, key: &str, delta: u64) -> i64 {
        match self.client() {
            Some(client) => client.add_or_incr(key, delta).await,
            None => COUNTER_FAILURE,
        }
    }

    pub async fn add_or_decr(&self, key: &str, delta: u64) -> i64 {
        match self.client() {
            Some(client) => client.add_or_decr(key, delta).await,
            None => COUNTER_FAILURE,
        }
    }

    pub async fn get_multi(&self, keys: &[&str]) -> HashMap<String, Bytes> {
        match self.client() {
            Some(client) => client.get_multi(keys).await,
            None => HashMap::new(),
        }
    }

    pub async fn get_multi_array(&self, keys: &[&str]) -> Vec<Option<Bytes>> {
        match self.client() {
            Some(client) => client.get_multi_array(keys).await,
            None => vec![None; keys.len()],
        }
    }

    pub async fn flush_all(&self) -> bool {
        match self.client() {
            Some(client) => client.flush_all().await,
            None => false,
        }
    }

    pub async fn stats(&self) -> ClusterStats {
        match self.client() {
            Some(client) => client.stats().await,
            None => ClusterStats::new(),
        }
    }

    pub async fn stats_items(&self) -> ClusterStats {
        match self.client() {
            Some(client) => client.stats_items().await,
            None => ClusterStats::new(),
        }
    }

    pub async fn stats_slabs(&self) -> ClusterStats {
        match self.client() {
            Some(client) => client.stats_slabs().await,
            None => ClusterStats::new(),
        }
    }

    pub async fn stats_cache_dump(&self, slab_id: u32, limit: u32) -> ClusterStats {
        match self.client() {
            Some(client) => client.stats_cache_dump(slab_id, limit).await,
            None => ClusterStats::new(),
        }
    }

    pub async fn stats_to_model(&self) -> Vec<MemcachedStats> {
        stats::stats_to_model(&self.stats().await)
    }

    pub async fn stats_items_to_model(&self) -> Vec<StatsItems> {
        stats::stats_items_to_model(&self.stats_items().await)
    }

    pub async fn stats_slabs_to_model(&self) -> Vec<StatsSlabs> {
        stats::stats_slabs_to_model(&self.stats_slabs().await)
    }

    pub async fn stats_cache_dump_to_model(&self, slab_id: u32, limit: u32) -> Vec<CacheDump> {
        stats::stats_cache_dump_to_model(&self.stats_cache_dump(slab_id, limit).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryConnector;
    use tokio_test::assert_ok;

    fn small(name: &str, servers: &[&str]) -> ClusterConfig {
        let mut cluster = ClusterConfig::new(name, servers.iter().map(|s| s.to_string()).collect());
        cluster.init_conn = 1;
        cluster.min_conn = 1;
        cluster.max_conn = 4;
        cluster
    }

    fn config() -> Config {
        Config {
            clusters: vec![
                small("sessions", &["mem:1", "mem:2"]),
                small("catalog", &["mem:3"]),
            ],
            ..Config::default()
        }
    }

    fn connector() -> Arc<MemoryConnector> {
        Arc::new(MemoryConnector::with_servers(&["mem:1", "mem:2", "mem:3"]))
    }

    #[tokio::test]
    async fn test_first_declared_cluster_is_default() {
        let registry = assert_ok!(ClusterRegistry::from_config(&config(), connector()).await);
        assert_eq!(registry.default_name(), "sessions");
        assert_eq!(registry.names(), ["sessions".to_string(), "catalog".to_string()]);
        registry.shutdown();
    }

    #[tokio::test]
    async fn test_explicit_default_cluster() {
        let mut config = config();
        config.default_cluster = Some("catalog".to_string());
        let connector = connector();
        let registry = ClusterRegistry::from_config(&config, connector.clone()).await.unwrap();

        assert!(registry.default_scope().set("sku:1", "lamp", 0).await);
        assert_eq!(connector.server("mem:3").unwrap().peek("sku%3A1"), Some(Bytes::from("lamp")));
        registry.shutdown();
    }

    #[tokio::test]
    async fn test_scopes_are_isolated() {
        let registry = ClusterRegistry::from_config(&config(), connector()).await.unwrap();

        assert!(registry.on("catalog").set("k", "catalog", 0).await);
        assert!(registry.default_scope().set("k", "sessions", 0).await);

        assert_eq!(registry.on("catalog").get("k").await, Some(Bytes::from("catalog")));
        assert_eq!(registry.on("sessions").get("k").await, Some(Bytes::from("sessions")));
        registry.shutdown();
    }

    #[tokio::test]
    async fn test_unknown_cluster_fails_softly() {
        let registry = ClusterRegistry::from_config(&config(), connector()).await.unwrap();
        let scope = registry.on("nope");

        assert!(!scope.exists());
        assert!(!scope.set("k", "v", 0).await);
        assert_eq!(scope.get("k").await, None);
        assert_eq!(scope.incr("k").await, COUNTER_FAILURE);
        assert!(scope.stats().await.is_empty());
        assert_eq!(scope.get_multi_array(&["a", "b"]).await, vec![None, None]);

        assert!(matches!(
            registry.cluster("nope").err(),
            Some(MemcacheError::ClusterNotFound { .. })
        ));
        assert!(registry.cluster("catalog").is_ok());
        registry.shutdown();
    }

    #[tokio::test]
    async fn test_initialization_opens_init_conn() {
        let connector = connector();
        let registry = ClusterRegistry::from_config(&config(), connector.clone()).await.unwrap();

        for addr in ["mem:1", "mem:2", "mem:3"] {
            assert!(connector.server(addr).unwrap().accepted_connections() >= 1);
        }

        registry.shutdown();
        for addr in ["mem:1", "mem:2", "mem:3"] {
            assert_eq!(connector.server(addr).unwrap().open_connections(), 0);
        }
    }

    #[tokio::test]
    async fn test_invalid_config_is_fatal() {
        let mut config = config();
        config.clusters[1].name = "sessions".to_string();
        let result = ClusterRegistry::from_config(&config, connector()).await;
        assert!(matches!(result, Err(MemcacheError::Config(_))));
    }

    #[tokio::test]
    async fn test_stats_models_through_scope() {
        let registry = ClusterRegistry::from_config(&config(), connector()).await.unwrap();
        let scope = registry.on("sessions");
        scope.set("a", "1", 0).await;

        let general = scope.stats_to_model().await;
        assert_eq!(general.len(), 2);
        assert!(general.iter().all(|s| s.version.is_some()));

        let slabs = scope.stats_slabs_to_model().await;
        assert_eq!(slabs.len(), 2);

        let dumps = scope.stats_cache_dump_to_model(1, 0).await;
        let keys: usize = dumps.iter().map(|d| d.keys.len()).sum();
        assert_eq!(keys, 1);
        registry.shutdown();
    }

    #[tokio::test]
    async fn test_per_cluster_connector() {
        let primary = connector();
        let other = Arc::new(MemoryConnector::with_servers(&["mem:3"]));
        let registry = ClusterRegistry::from_config_with(&config(), |cluster| {
            if cluster.name == "catalog" {
                other.clone() as Arc<dyn Connector>
            } else {
                primary.clone() as Arc<dyn Connector>
            }
        })
        .await
        .unwrap();

        assert!(registry.on("catalog").set("x", "1", 0).await);
        assert_eq!(other.server("mem:3").unwrap().len(), 1);
        assert_eq!(primary.server("mem:3").unwrap().len(), 0);
        registry.shutdown();
    }
}
