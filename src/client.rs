/// Cluster client: the key-value operation set over one pool and one router
///
/// Failures never surface as errors here. Boolean operations return `false`,
/// counter operations return `-1`, reads return `None` and fan-out calls leave
/// unreachable servers out of their result.
use bytes::Bytes;
use futures::future::join_all;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::ClusterConfig;
use crate::core::{Item, ServerSpec};
use crate::pool::{PoolSnapshot, ServerPool};
use crate::protocol::{Request, Response, StoreMode};
use crate::routing::BucketRouter;
use crate::stats::{ClusterStats, RawStatBlock};
use crate::transport::Connector;
use crate::utils::{expiry_seconds, is_valid_key, sanitize_key};

/// Returned by counter operations that failed
pub const COUNTER_FAILURE: i64 = -1;

pub struct ClusterClient {
    name: String,
    config: ClusterConfig,
    pool: Arc<ServerPool>,
    router: BucketRouter,
}

impl ClusterClient {
    pub fn new(config: ClusterConfig, connector: Arc<dyn Connector>) -> Self {
        let router = BucketRouter::new(config.server_specs(), config.hashing);
        let pool = Arc::new(ServerPool::new(config.clone(), connector));
        Self {
            name: config.effective_name(),
            config,
            pool,
            router,
        }
    }

    /// Open the initial connections and start the maintenance loop
    pub async fn start(&self) -> usize {
        let opened = self.pool.initialize().await;
        self.pool.start_maintenance();
        opened
    }

    pub fn shutdown(&self) {
        self.pool.shutdown();
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<ServerPool> {
        &self.pool
    }

    pub fn router(&self) -> &BucketRouter {
        &self.router
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        self.pool.snapshot()
    }

    // Single-key reads

    pub async fn get(&self, key: &str) -> Option<Bytes> {
        self.get_item(key).await.map(|item| item.data)
    }

    /// Value together with its flags
    pub async fn get_item(&self, key: &str) -> Option<Item> {
        let key = self.prepare_key(key)?;
        self.fetch(&key, false).await
    }

    /// Value with its CAS token
    pub async fn gets(&self, key: &str) -> Option<Item> {
        let key = self.prepare_key(key)?;
        self.fetch(&key, true).await
    }

    pub async fn key_exists(&self, key: &str) -> bool {
        self.get_item(key).await.is_some()
    }

    // Storage

    pub async fn set(&self, key: &str, value: impl Into<Bytes>, expires_at_ms: u64) -> bool {
        self.store(StoreMode::Set, key, value.into(), expires_at_ms, None).await
    }

    /// Store only if the key is absent
    pub async fn add(&self, key: &str, value: impl Into<Bytes>, expires_at_ms: u64) -> bool {
        self.store(StoreMode::Add, key, value.into(), expires_at_ms, None).await
    }

    /// Store only if the key is present
    pub async fn replace(&self, key: &str, value: impl Into<Bytes>, expires_at_ms: u64) -> bool {
        self.store(StoreMode::Replace, key, value.into(), expires_at_ms, None).await
    }

    pub async fn append(&self, key: &str, value: impl Into<Bytes>) -> bool {
        self.store(StoreMode::Append, key, value.into(), 0, None).await
    }

    pub async fn prepend(&self, key: &str, value: impl Into<Bytes>) -> bool {
        self.store(StoreMode::Prepend, key, value.into(), 0, None).await
    }

    /// Store only if the value is unchanged since `gets` returned `cas_token`
    pub async fn cas(&self, key: &str, value: impl Into<Bytes>, cas_token: u64, expires_at_ms: u64) -> bool {
        self.store(StoreMode::Cas, key, value.into(), expires_at_ms, Some(cas_token))
            .await
    }

    pub async fn delete(&self, key: &str) -> bool {
        let key = match self.prepare_key(key) {
            Some(key) => key,
            None => return false,
        };
        let request = Request::Delete { key: key.clone() };
        matches!(self.dispatch(&key, &request).await, Some(Response::Deleted))
    }

    // Counters

    pub async fn incr(&self, key: &str) -> i64 {
        self.incr_by(key, 1).await
    }

    pub async fn incr_by(&self, key: &str, delta: u64) -> i64 {
        self.arith(key, delta, true).await
    }

    pub async fn decr(&self, key: &str) -> i64 {
        self.decr_by(key, 1).await
    }

    pub async fn decr_by(&self, key: &str, delta: u64) -> i64 {
        self.arith(key, delta, false).await
    }

    /// Store a counter in its decimal form
    pub async fn store_counter(&self, key: &str, value: u64, expires_at_ms: u64) -> bool {
        self.set(key, value.to_string(), expires_at_ms).await
    }

    pub async fn get_counter(&self, key: &str) -> i64 {
        self.get_item(key)
            .await
            .and_then(|item| item.as_counter())
            .and_then(|value| i64::try_from(value).ok())
            .unwrap_or(COUNTER_FAILURE)
    }

    /// Create the counter with `delta` if absent, otherwise increment it
    pub async fn add_or_incr(&self, key: &str, delta: u64) -> i64 {
        if self.add(key, delta.to_string(), 0).await {
            return to_counter(delta);
        }
        self.incr_by(key, delta).await
    }

    /// Create the counter with `delta` if absent, otherwise decrement it
    pub async fn add_or_decr(&self, key: &str, delta: u64) -> i64 {
        if self.add(key, delta.to_string(), 0).await {
            return to_counter(delta);
        }
        self.decr_by(key, delta).await
    }

    // Multi-key reads

    /// Fetch many keys with one `get` per server; keys that miss are absent
    pub async fn get_multi(&self, keys: &[&str]) -> HashMap<String, Bytes> {
        let mut prepared: Vec<(String, &str)> = Vec::with_capacity(keys.len());
        for &key in keys {
            if let Some(sanitized) = self.prepare_key(key) {
                prepared.push((sanitized, key));
            }
        }

        // Group by primary server, keeping server order stable
        let mut groups: BTreeMap<String, (ServerSpec, Vec<String>)> = BTreeMap::new();
        for (sanitized, _) in &prepared {
            if let Some(primary) = self.router.primary(sanitized) {
                groups
                    .entry(primary.addr.clone())
                    .or_insert_with(|| (primary.clone(), Vec::new()))
                    .1
                    .push(sanitized.clone());
            }
        }

        let fetches = groups
            .into_values()
            .map(|(server, group)| async move { self.fetch_group(&server, group).await });
        let mut found: HashMap<String, Bytes> = HashMap::new();
        for items in join_all(fetches).await {
            for item in items {
                found.insert(item.key, item.data);
            }
        }

        prepared
            .into_iter()
            .filter_map(|(sanitized, original)| {
                found
                    .get(&sanitized)
                    .map(|data| (original.to_string(), data.clone()))
            })
            .collect()
    }

    /// Like `get_multi`, answered in the order of `keys`
    pub async fn get_multi_array(&self, keys: &[&str]) -> Vec<Option<Bytes>> {
        let found = self.get_multi(keys).await;
        keys.iter().map(|key| found.get(*key).cloned()).collect()
    }

    // Fan-out

    /// Flush every reachable server; true when at least one answered and all that answered agreed
    pub async fn flush_all(&self) -> bool {
        let replies = self.fan_out(&Request::FlushAll).await;
        !replies.is_empty()
            && replies
                .iter()
                .all(|(_, response)| matches!(response, Response::Ok))
    }

    pub async fn stats(&self) -> ClusterStats {
        self.stats_fan_out(None).await
    }

    pub async fn stats_items(&self) -> ClusterStats {
        self.stats_fan_out(Some("items".to_string())).await
    }

    pub async fn stats_slabs(&self) -> ClusterStats {
        self.stats_fan_out(Some("slabs".to_string())).await
    }

    /// Keys in one slab class; best effort, servers may list only some keys
    pub async fn stats_cache_dump(&self, slab_id: u32, limit: u32) -> ClusterStats {
        self.stats_fan_out(Some(format!("cachedump {} {}", slab_id, limit)))
            .await
    }

    // Internals

    /// Sanitize or validate a key; `None` means the operation must fail
    fn prepare_key(&self, key: &str) -> Option<String> {
        let prepared = if self.config.sanitize_keys {
            sanitize_key(key)
        } else {
            key.to_string()
        };

        if is_valid_key(&prepared) {
            Some(prepared)
        } else {
            warn!("Rejecting invalid key {:?} for cluster {}", key, self.name);
            None
        }
    }

    async fn fetch(&self, key: &str, with_cas: bool) -> Option<Item> {
        let request = Request::Get {
            keys: vec![key.to_string()],
            with_cas,
        };
        match self.dispatch(key, &request).await {
            Some(Response::Values(items)) => items.into_iter().find(|item| item.key == key),
            _ => None,
        }
    }

    async fn store(
        &self,
        mode: StoreMode,
        key: &str,
        data: Bytes,
        expires_at_ms: u64,
        cas: Option<u64>,
    ) -> bool {
        let key = match self.prepare_key(key) {
            Some(key) => key,
            None => return false,
        };
        let request = Request::Store {
            mode,
            key: key.clone(),
            flags: 0,
            exptime: expiry_seconds(expires_at_ms),
            data,
            cas,
        };
        matches!(self.dispatch(&key, &request).await, Some(Response::Stored))
    }

    async fn arith(&self, key: &str, delta: u64, incr: bool) -> i64 {
        let key = match self.prepare_key(key) {
            Some(key) => key,
            None => return COUNTER_FAILURE,
        };
        let request = if incr {
            Request::Incr { key: key.clone(), delta }
        } else {
            Request::Decr { key: key.clone(), delta }
        };
        match self.dispatch(&key, &request).await {
            Some(Response::Numeric(value)) => to_counter(value),
            _ => COUNTER_FAILURE,
        }
    }

    /// Run a single-key request on the first usable routed server
    async fn dispatch(&self, key: &str, request: &Request) -> Option<Response> {
        debug!("{} {} on cluster {}", request.command_name(), key, self.name);

        for server in self.router.route(key) {
            let mut conn = match self.pool.checkout(&server).await {
                Ok(conn) => conn,
                Err(e) => {
                    debug!("No connection to {} for {}: {}", server.addr, key, e);
                    if self.config.failover {
                        continue;
                    }
                    return None;
                }
            };

            let result = conn.execute(request).await;
            self.pool.checkin(conn);

            match result {
                Ok(Response::Error { kind, message }) => {
                    warn!(
                        "{} {} rejected by {}: {:?} {}",
                        request.command_name(),
                        key,
                        server.addr,
                        kind,
                        message
                    );
                    return Some(Response::Error { kind, message });
                }
                Ok(response) => return Some(response),
                Err(e) => {
                    warn!(
                        "{} {} failed on {}: {} [{}]",
                        request.command_name(),
                        key,
                        server.addr,
                        e,
                        e.severity()
                    );
                    if !self.config.failover {
                        return None;
                    }
                }
            }
        }

        debug!("No server of cluster {} could serve {}", self.name, key);
        None
    }

    /// One multi-key `get` to `server`, falling back to per-key reads with failover
    async fn fetch_group(&self, server: &ServerSpec, keys: Vec<String>) -> Vec<Item> {
        let request = Request::Get {
            keys: keys.clone(),
            with_cas: false,
        };

        if let Ok(mut conn) = self.pool.checkout(server).await {
            let result = conn.execute(&request).await;
            self.pool.checkin(conn);
            match result {
                Ok(Response::Values(items)) => return items,
                Ok(other) => debug!("Unexpected multi-get reply from {}: {:?}", server.addr, other),
                Err(e) => debug!("Multi-get on {} failed: {}", server.addr, e),
            }
        }

        let mut items = Vec::new();
        for key in keys {
            if let Some(item) = self.fetch(&key, false).await {
                items.push(item);
            }
        }
        items
    }

    /// Issue a request to one connection per reachable server
    async fn fan_out(&self, request: &Request) -> Vec<(String, Response)> {
        let calls = self.pool.servers().iter().map(|server| async move {
            let mut conn = match self.pool.checkout(server).await {
                Ok(conn) => conn,
                Err(e) => {
                    debug!("Skipping {} for {}: {}", server.addr, request.command_name(), e);
                    return None;
                }
            };
            let result = conn.execute(request).await;
            self.pool.checkin(conn);
            match result {
                Ok(response) => Some((server.addr.clone(), response)),
                Err(e) => {
                    warn!("{} failed on {}: {}", request.command_name(), server.addr, e);
                    None
                }
            }
        });

        join_all(calls).await.into_iter().flatten().collect()
    }

    async fn stats_fan_out(&self, arg: Option<String>) -> ClusterStats {
        self.fan_out(&Request::Stats(arg))
            .await
            .into_iter()
            .filter_map(|(server, response)| match response {
                Response::Stats(entries) => Some((server, entries.into_iter().collect::<RawStatBlock>())),
                _ => None,
            })
            .collect()
    }
}

fn to_counter(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryConnector;

    const SERVERS: [&str; 3] = ["mem:1", "mem:2", "mem:3"];

    fn client_with(configure: impl FnOnce(&mut ClusterConfig)) -> (Arc<MemoryConnector>, ClusterClient) {
        let mut config = ClusterConfig::new("test", SERVERS.iter().map(|s| s.to_string()).collect());
        config.init_conn = 0;
        config.min_conn = 0;
        config.maintenance_interval_ms = 0;
        configure(&mut config);

        let connector = Arc::new(MemoryConnector::with_servers(&SERVERS));
        let client = ClusterClient::new(config, connector.clone());
        (connector, client)
    }

    fn client() -> (Arc<MemoryConnector>, ClusterClient) {
        client_with(|_| {})
    }

    #[tokio::test]
    async fn test_add_twice() {
        let (_connector, client) = client();
        assert!(client.add("user:1", "a", 0).await);
        assert!(!client.add("user:1", "b", 0).await);
        assert_eq!(client.get("user:1").await, Some(Bytes::from("a")));
    }

    #[tokio::test]
    async fn test_replace_requires_existing_key() {
        let (_connector, client) = client();
        assert!(!client.replace("never-set", "x", 0).await);

        assert!(client.set("k", "v1", 0).await);
        assert!(client.replace("k", "v2", 0).await);
        assert_eq!(client.get("k").await, Some(Bytes::from("v2")));
    }

    #[tokio::test]
    async fn test_append_prepend() {
        let (_connector, client) = client();
        assert!(!client.append("missing", "x").await);
        assert!(!client.prepend("missing", "x").await);

        client.set("greeting", "ell", 0).await;
        assert!(client.append("greeting", "o").await);
        assert!(client.prepend("greeting", "h").await);
        assert_eq!(client.get("greeting").await, Some(Bytes::from("hello")));
    }

    #[tokio::test]
    async fn test_cas_token_succeeds_once() {
        let (_connector, client) = client();
        client.set("doc", "v1", 0).await;

        let token = client.gets("doc").await.and_then(|item| item.cas).unwrap();
        assert!(client.cas("doc", "v2", token, 0).await);
        assert!(!client.cas("doc", "v3", token, 0).await);
        assert_eq!(client.get("doc").await, Some(Bytes::from("v2")));
    }

    #[tokio::test]
    async fn test_delete_and_key_exists() {
        let (_connector, client) = client();
        client.set("gone", "soon", 0).await;
        assert!(client.key_exists("gone").await);
        assert!(client.delete("gone").await);
        assert!(!client.delete("gone").await);
        assert!(!client.key_exists("gone").await);
    }

    #[tokio::test]
    async fn test_expired_item_is_a_miss() {
        let (_connector, client) = client();
        // One second after the epoch
        assert!(client.set("old", "v", 1_000).await);
        assert_eq!(client.get("old").await, None);
    }

    #[tokio::test]
    async fn test_counters() {
        let (_connector, client) = client();
        assert_eq!(client.incr("hits").await, COUNTER_FAILURE);
        assert_eq!(client.get_counter("hits").await, COUNTER_FAILURE);

        assert!(client.store_counter("hits", 5, 0).await);
        assert_eq!(client.incr("hits").await, 6);
        assert_eq!(client.incr_by("hits", 4).await, 10);
        assert_eq!(client.decr_by("hits", 100).await, 0);
        assert_eq!(client.get_counter("hits").await, 0);

        assert_eq!(client.add_or_incr("visits", 3).await, 3);
        assert_eq!(client.add_or_incr("visits", 3).await, 6);
        assert_eq!(client.add_or_decr("visits", 2).await, 4);

        client.set("name", "bob", 0).await;
        assert_eq!(client.incr("name").await, COUNTER_FAILURE);
    }

    #[tokio::test]
    async fn test_failover_reaches_next_candidate() {
        let (connector, client) = client();
        let route = client.router().route("session%3A42");
        let (primary, secondary) = (&route[0], &route[1]);

        connector.server(&primary.addr).unwrap().set_down(true);
        connector.server(&secondary.addr).unwrap().handle(&Request::Store {
            mode: StoreMode::Set,
            key: "session%3A42".to_string(),
            flags: 0,
            exptime: 0,
            data: Bytes::from_static(b"alice"),
            cas: None,
        });

        assert_eq!(client.get("session:42").await, Some(Bytes::from("alice")));
        assert!(!client.pool().is_alive(primary));
    }

    #[tokio::test]
    async fn test_no_failover_fails_when_primary_down() {
        let (connector, client) = client_with(|c| c.failover = false);
        let route = client.router().route("session%3A42");
        connector.server(&route[0].addr).unwrap().set_down(true);

        assert!(!client.set("session:42", "alice", 0).await);
        assert_eq!(client.get("session:42").await, None);
        assert_eq!(client.incr("session:42").await, COUNTER_FAILURE);
    }

    #[tokio::test]
    async fn test_write_fails_over_when_primary_dies_mid_session() {
        let (connector, client) = client();
        let route = client.router().route("cart%3A7");

        // Warm a pooled connection to the primary, then take it down
        assert!(client.set("cart:7", "1", 0).await);
        connector.server(&route[0].addr).unwrap().set_down(true);

        assert!(client.set("cart:7", "2", 0).await);
        let secondary = connector.server(&route[1].addr).unwrap();
        assert_eq!(secondary.peek("cart%3A7"), Some(Bytes::from("2")));
    }

    #[tokio::test]
    async fn test_get_multi() {
        let (_connector, client) = client();
        let keys: Vec<String> = (0..20).map(|i| format!("item:{}", i)).collect();
        for key in &keys {
            client.set(key, key.clone(), 0).await;
        }

        let mut wanted: Vec<&str> = keys.iter().map(|k| k.as_str()).collect();
        wanted.push("item:missing");

        let found = client.get_multi(&wanted).await;
        assert_eq!(found.len(), 20);
        assert_eq!(found.get("item:7"), Some(&Bytes::from("item:7")));

        let array = client.get_multi_array(&["item:3", "item:missing", "item:4"]).await;
        assert_eq!(
            array,
            vec![Some(Bytes::from("item:3")), None, Some(Bytes::from("item:4"))]
        );
    }

    #[tokio::test]
    async fn test_get_multi_array_repeated_keys() {
        let (_connector, client) = client();
        assert!(client.set("a", "1", 0).await);

        let array = client.get_multi_array(&["a", "a", "b", "a"]).await;
        assert_eq!(
            array,
            vec![
                Some(Bytes::from("1")),
                Some(Bytes::from("1")),
                None,
                Some(Bytes::from("1"))
            ]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_share_a_small_pool() {
        let (connector, client) = client_with(|c| {
            c.servers = vec!["mem:1".to_string()];
            c.max_conn = 2;
            c.failover = false;
        });
        let client = Arc::new(client);
        let permits = Arc::new(tokio::sync::Semaphore::new(2));

        let tasks: Vec<_> = (0..8)
            .map(|task| {
                let client = client.clone();
                let permits = permits.clone();
                tokio::spawn(async move {
                    let mut failures = 0;
                    for round in 0..50 {
                        let _permit = permits.acquire().await.unwrap();
                        let key = format!("t{}:{}", task, round);
                        if !client.set(&key, round.to_string(), 0).await {
                            failures += 1;
                        }
                        if client.get(&key).await != Some(Bytes::from(round.to_string())) {
                            failures += 1;
                        }
                    }
                    failures
                })
            })
            .collect();

        for task in join_all(tasks).await {
            assert_eq!(task.unwrap(), 0);
        }

        let snapshot = client.snapshot();
        assert_eq!(snapshot.total_leased(), 0);
        assert!(snapshot.total_idle() <= 2);
        assert!(connector.server("mem:1").unwrap().open_connections() <= 2);
        assert_eq!(connector.server("mem:1").unwrap().len(), 400);
    }

    #[tokio::test]
    async fn test_get_multi_falls_back_when_primary_down() {
        let (connector, client) = client();
        let route = client.router().route("k1");
        connector.server(&route[1].addr).unwrap().handle(&Request::Store {
            mode: StoreMode::Set,
            key: "k1".to_string(),
            flags: 0,
            exptime: 0,
            data: Bytes::from_static(b"v1"),
            cas: None,
        });
        connector.server(&route[0].addr).unwrap().set_down(true);

        let found = client.get_multi(&["k1"]).await;
        assert_eq!(found.get("k1"), Some(&Bytes::from("v1")));
    }

    #[tokio::test]
    async fn test_key_sanitization() {
        let (connector, client) = client();
        assert!(client.set("has space", "v", 0).await);
        assert_eq!(client.get("has space").await, Some(Bytes::from("v")));

        let stored = SERVERS
            .iter()
            .filter_map(|addr| connector.server(addr))
            .any(|server| server.peek("has+space").is_some());
        assert!(stored);

        let (_connector, strict) = client_with(|c| c.sanitize_keys = false);
        assert!(!strict.set("has space", "v", 0).await);
        assert!(!strict.set(&"k".repeat(251), "v", 0).await);
        assert!(strict.set("plain", "v", 0).await);
    }

    #[tokio::test]
    async fn test_flush_all() {
        let (connector, client) = client();
        client.set("a", "1", 0).await;
        client.set("b", "2", 0).await;

        connector.server("mem:2").unwrap().set_down(true);
        assert!(client.flush_all().await);
        assert_eq!(connector.server("mem:1").unwrap().len(), 0);

        for addr in SERVERS {
            connector.server(addr).unwrap().set_down(true);
        }
        assert!(!client.flush_all().await);
    }

    #[tokio::test]
    async fn test_stats_fan_out_omits_down_server() {
        let (connector, client) = client();
        client.set("a", "1", 0).await;

        let stats = client.stats().await;
        assert_eq!(stats.len(), 3);
        assert!(stats["mem:1"].contains_key("uptime"));

        connector.server("mem:3").unwrap().set_down(true);
        let stats = client.stats().await;
        assert_eq!(stats.len(), 2);
        assert!(!stats.contains_key("mem:3"));
    }

    #[tokio::test]
    async fn test_stats_items_slabs_and_cache_dump() {
        let (_connector, client) = client();
        for i in 0..6 {
            client.set(&format!("key{}", i), "v", 0).await;
        }

        let items = client.stats_items().await;
        let numbers: u64 = items
            .values()
            .filter_map(|block| block.get("items:1:number"))
            .map(|n| n.parse::<u64>().unwrap())
            .sum();
        assert_eq!(numbers, 6);

        let slabs = client.stats_slabs().await;
        assert!(slabs.values().all(|block| block.contains_key("active_slabs")));

        let dump = client.stats_cache_dump(1, 0).await;
        let keys: usize = dump.values().map(|block| block.len()).sum();
        assert_eq!(keys, 6);
    }

    #[tokio::test]
    async fn test_connections_are_reused() {
        let (connector, client) = client();
        for i in 0..10 {
            client.set("same", i.to_string(), 0).await;
        }
        let primary = client.router().primary("same").unwrap().addr.clone();
        assert_eq!(connector.server(&primary).unwrap().accepted_connections(), 1);
    }
}
