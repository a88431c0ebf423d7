/// In-process memcached loopback
///
/// `MemoryServer` keeps items in a map and answers the same requests a real
/// server would, including CAS tokens, counters and the stats listings.
/// Servers can be taken down or stalled to exercise failover, dead-marking and
/// lease reclamation without sockets.
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::timeout;
use tracing::debug;

use super::{ConnectionResult, Connector, Transport};
use crate::core::{Item, ServerSpec};
use crate::error::{MemcacheError, MemcacheResult};
use crate::protocol::{Request, Response, ServerErrorKind, StoreMode};

const SERVER_VERSION: &str = "1.6.21-memory";

/// All loopback items live in slab class 1
const SLAB_ID: u32 = 1;
const CHUNK_SIZE: usize = 96;

#[derive(Debug, Clone)]
struct Entry {
    data: Bytes,
    flags: u32,
    cas: u64,
    /// Absolute unix seconds, 0 = never
    exptime: u32,
}

impl Entry {
    fn is_expired(&self, now: u64) -> bool {
        self.exptime != 0 && u64::from(self.exptime) <= now
    }
}

#[derive(Debug, Default)]
struct Counters {
    cmd_get: AtomicU64,
    cmd_set: AtomicU64,
    cmd_flush: AtomicU64,
    get_hits: AtomicU64,
    get_misses: AtomicU64,
    delete_hits: AtomicU64,
    delete_misses: AtomicU64,
    incr_hits: AtomicU64,
    incr_misses: AtomicU64,
    decr_hits: AtomicU64,
    decr_misses: AtomicU64,
    cas_hits: AtomicU64,
    cas_misses: AtomicU64,
    cas_badval: AtomicU64,
}

/// A single in-memory memcached server
#[derive(Debug)]
pub struct MemoryServer {
    addr: String,
    items: Mutex<HashMap<String, Entry>>,
    next_cas: AtomicU64,
    down: AtomicBool,
    stalled: AtomicBool,
    /// Bumped by `restart`; connections from an older generation are closed
    generation: AtomicU64,
    /// Connections accepted over the server's lifetime
    accepted: AtomicUsize,
    /// Connections currently open
    open: AtomicUsize,
    counters: Counters,
    started: SystemTime,
}

impl MemoryServer {
    pub fn new<S: Into<String>>(addr: S) -> Self {
        Self {
            addr: addr.into(),
            items: Mutex::new(HashMap::new()),
            next_cas: AtomicU64::new(1),
            down: AtomicBool::new(false),
            stalled: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            accepted: AtomicUsize::new(0),
            open: AtomicUsize::new(0),
            counters: Counters::default(),
            started: SystemTime::now(),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Refuse new connections and fail requests on open ones
    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub fn is_down(&self) -> bool {
        self.down.load(Ordering::SeqCst)
    }

    /// Accept requests but never answer them
    pub fn set_stalled(&self, stalled: bool) {
        self.stalled.store(stalled, Ordering::SeqCst);
    }

    pub fn is_stalled(&self) -> bool {
        self.stalled.load(Ordering::SeqCst)
    }

    /// Close every open connection while keeping the items and accepting new ones
    pub fn restart(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn accepted_connections(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    pub fn open_connections(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }

    /// Number of live items
    pub fn len(&self) -> usize {
        let now = unix_now();
        self.items.lock().values().filter(|e| !e.is_expired(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read a value directly, bypassing the protocol
    pub fn peek(&self, key: &str) -> Option<Bytes> {
        let now = unix_now();
        self.items
            .lock()
            .get(key)
            .filter(|e| !e.is_expired(now))
            .map(|e| e.data.clone())
    }

    /// Answer one request
    pub fn handle(&self, request: &Request) -> Response {
        match request {
            Request::Get { keys, with_cas } => self.get(keys, *with_cas),
            Request::Store {
                mode,
                key,
                flags,
                exptime,
                data,
                cas,
            } => self.store(*mode, key, *flags, *exptime, data, *cas),
            Request::Delete { key } => self.delete(key),
            Request::Incr { key, delta } => self.arith(key, *delta, true),
            Request::Decr { key, delta } => self.arith(key, *delta, false),
            Request::FlushAll => {
                self.counters.cmd_flush.fetch_add(1, Ordering::Relaxed);
                self.items.lock().clear();
                Response::Ok
            }
            Request::Stats(arg) => self.stats(arg.as_deref()),
            Request::Version => Response::Version(SERVER_VERSION.to_string()),
        }
    }

    fn next_cas(&self) -> u64 {
        self.next_cas.fetch_add(1, Ordering::SeqCst)
    }

    fn get(&self, keys: &[String], with_cas: bool) -> Response {
        let now = unix_now();
        let items = self.items.lock();
        let mut found = Vec::new();
        for key in keys {
            self.counters.cmd_get.fetch_add(1, Ordering::Relaxed);
            match items.get(key).filter(|e| !e.is_expired(now)) {
                Some(entry) => {
                    self.counters.get_hits.fetch_add(1, Ordering::Relaxed);
                    found.push(Item::new(
                        key.clone(),
                        entry.flags,
                        entry.data.clone(),
                        with_cas.then_some(entry.cas),
                    ));
                }
                None => {
                    self.counters.get_misses.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        Response::Values(found)
    }

    fn store(
        &self,
        mode: StoreMode,
        key: &str,
        flags: u32,
        exptime: u32,
        data: &Bytes,
        cas: Option<u64>,
    ) -> Response {
        self.counters.cmd_set.fetch_add(1, Ordering::Relaxed);
        let now = unix_now();
        let mut items = self.items.lock();
        let existing = items.get(key).filter(|e| !e.is_expired(now)).cloned();

        let entry = match (mode, existing) {
            (StoreMode::Set, _) | (StoreMode::Add, None) | (StoreMode::Replace, Some(_)) => Entry {
                data: data.clone(),
                flags,
                cas: 0,
                exptime,
            },
            (StoreMode::Add, Some(_)) | (StoreMode::Replace, None) => return Response::NotStored,
            (StoreMode::Append, Some(old)) | (StoreMode::Prepend, Some(old)) => {
                let mut joined = BytesMut::with_capacity(old.data.len() + data.len());
                if mode == StoreMode::Append {
                    joined.extend_from_slice(&old.data);
                    joined.extend_from_slice(data);
                } else {
                    joined.extend_from_slice(data);
                    joined.extend_from_slice(&old.data);
                }
                Entry {
                    data: joined.freeze(),
                    ..old
                }
            }
            (StoreMode::Append, None) | (StoreMode::Prepend, None) => return Response::NotStored,
            (StoreMode::Cas, None) => {
                self.counters.cas_misses.fetch_add(1, Ordering::Relaxed);
                return Response::NotFound;
            }
            (StoreMode::Cas, Some(old)) => {
                if Some(old.cas) != cas {
                    self.counters.cas_badval.fetch_add(1, Ordering::Relaxed);
                    return Response::Exists;
                }
                self.counters.cas_hits.fetch_add(1, Ordering::Relaxed);
                Entry {
                    data: data.clone(),
                    flags,
                    cas: 0,
                    exptime,
                }
            }
        };

        items.insert(
            key.to_string(),
            Entry {
                cas: self.next_cas(),
                ..entry
            },
        );
        Response::Stored
    }

    fn delete(&self, key: &str) -> Response {
        let now = unix_now();
        let mut items = self.items.lock();
        match items.remove(key) {
            Some(entry) if !entry.is_expired(now) => {
                self.counters.delete_hits.fetch_add(1, Ordering::Relaxed);
                Response::Deleted
            }
            _ => {
                self.counters.delete_misses.fetch_add(1, Ordering::Relaxed);
                Response::NotFound
            }
        }
    }

    fn arith(&self, key: &str, delta: u64, incr: bool) -> Response {
        let now = unix_now();
        let mut items = self.items.lock();
        let (hits, misses) = if incr {
            (&self.counters.incr_hits, &self.counters.incr_misses)
        } else {
            (&self.counters.decr_hits, &self.counters.decr_misses)
        };

        let entry = match items.get_mut(key).filter(|e| !e.is_expired(now)) {
            Some(entry) => entry,
            None => {
                misses.fetch_add(1, Ordering::Relaxed);
                return Response::NotFound;
            }
        };

        let current = match std::str::from_utf8(&entry.data)
            .ok()
            .and_then(|s| s.trim().parse::<u64>().ok())
        {
            Some(current) => current,
            None => {
                return Response::Error {
                    kind: ServerErrorKind::Client,
                    message: "cannot increment or decrement non-numeric value".to_string(),
                }
            }
        };

        // incr wraps at 64 bits, decr stops at zero
        let value = if incr {
            current.wrapping_add(delta)
        } else {
            current.saturating_sub(delta)
        };
        hits.fetch_add(1, Ordering::Relaxed);
        entry.data = Bytes::from(value.to_string());
        entry.cas = self.next_cas.fetch_add(1, Ordering::SeqCst);
        Response::Numeric(value)
    }

    fn stats(&self, arg: Option<&str>) -> Response {
        let mut parts = arg.unwrap_or("").split_whitespace();
        match parts.next() {
            None => Response::Stats(self.general_stats()),
            Some("items") => Response::Stats(self.item_stats()),
            Some("slabs") => Response::Stats(self.slab_stats()),
            Some("cachedump") => {
                let slab = parts.next().and_then(|s| s.parse::<u32>().ok());
                let limit = parts.next().and_then(|s| s.parse::<usize>().ok()).unwrap_or(0);
                match slab {
                    Some(SLAB_ID) => Response::Stats(self.cache_dump(limit)),
                    Some(_) => Response::Stats(Vec::new()),
                    None => Response::Error {
                        kind: ServerErrorKind::Client,
                        message: "bad command line format".to_string(),
                    },
                }
            }
            Some(_) => Response::Error {
                kind: ServerErrorKind::Command,
                message: String::new(),
            },
        }
    }

    fn live_items(&self) -> Vec<(String, Entry)> {
        let now = unix_now();
        let mut live: Vec<(String, Entry)> = self
            .items
            .lock()
            .iter()
            .filter(|(_, e)| !e.is_expired(now))
            .map(|(k, e)| (k.clone(), e.clone()))
            .collect();
        live.sort_by(|a, b| a.0.cmp(&b.0));
        live
    }

    fn general_stats(&self) -> Vec<(String, String)> {
        let live = self.live_items();
        let bytes: usize = live.iter().map(|(k, e)| k.len() + e.data.len()).sum();
        let uptime = self.started.elapsed().map(|d| d.as_secs()).unwrap_or(0);
        let c = &self.counters;
        let load = |v: &AtomicU64| v.load(Ordering::Relaxed).to_string();

        vec![
            stat("pid", std::process::id()),
            stat("uptime", uptime),
            stat("time", unix_now()),
            stat("version", SERVER_VERSION),
            stat("pointer_size", usize::BITS),
            stat("curr_connections", self.open_connections()),
            stat("total_connections", self.accepted_connections()),
            stat("cmd_get", load(&c.cmd_get)),
            stat("cmd_set", load(&c.cmd_set)),
            stat("cmd_flush", load(&c.cmd_flush)),
            stat("get_hits", load(&c.get_hits)),
            stat("get_misses", load(&c.get_misses)),
            stat("delete_hits", load(&c.delete_hits)),
            stat("delete_misses", load(&c.delete_misses)),
            stat("incr_hits", load(&c.incr_hits)),
            stat("incr_misses", load(&c.incr_misses)),
            stat("decr_hits", load(&c.decr_hits)),
            stat("decr_misses", load(&c.decr_misses)),
            stat("cas_hits", load(&c.cas_hits)),
            stat("cas_misses", load(&c.cas_misses)),
            stat("cas_badval", load(&c.cas_badval)),
            stat("threads", 1),
            stat("bytes", bytes),
            stat("curr_items", live.len()),
            stat("limit_maxbytes", 64 * 1024 * 1024),
            stat("evictions", 0),
        ]
    }

    fn item_stats(&self) -> Vec<(String, String)> {
        let live = self.live_items();
        if live.is_empty() {
            return Vec::new();
        }
        let prefix = format!("items:{}", SLAB_ID);
        vec![
            stat(&format!("{}:number", prefix), live.len()),
            stat(&format!("{}:age", prefix), 0),
            stat(&format!("{}:evicted", prefix), 0),
            stat(&format!("{}:outofmemory", prefix), 0),
        ]
    }

    fn slab_stats(&self) -> Vec<(String, String)> {
        let live = self.live_items();
        let c = &self.counters;
        let load = |v: &AtomicU64| v.load(Ordering::Relaxed).to_string();
        let mut stats = Vec::new();
        if !live.is_empty() {
            let id = SLAB_ID;
            stats.push(stat(&format!("{}:chunk_size", id), CHUNK_SIZE));
            stats.push(stat(&format!("{}:used_chunks", id), live.len()));
            stats.push(stat(&format!("{}:get_hits", id), load(&c.get_hits)));
            stats.push(stat(&format!("{}:cmd_set", id), load(&c.cmd_set)));
        }
        stats.push(stat("active_slabs", usize::from(!live.is_empty())));
        stats.push(stat("total_malloced", live.len() * CHUNK_SIZE));
        stats
    }

    fn cache_dump(&self, limit: usize) -> Vec<(String, String)> {
        let live = self.live_items();
        let take = if limit == 0 { live.len() } else { limit };
        live.into_iter()
            .take(take)
            .map(|(key, entry)| {
                let info = format!("[{} b; {} s]", entry.data.len(), entry.exptime);
                (key, info)
            })
            .collect()
    }
}

fn stat<V: ToString>(name: &str, value: V) -> (String, String) {
    (name.to_string(), value.to_string())
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Connects to registered `MemoryServer`s by address
#[derive(Debug)]
pub struct MemoryConnector {
    servers: RwLock<HashMap<String, Arc<MemoryServer>>>,
    read_timeout: Duration,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::with_read_timeout(Duration::from_secs(3))
    }

    pub fn with_read_timeout(read_timeout: Duration) -> Self {
        Self {
            servers: RwLock::new(HashMap::new()),
            read_timeout,
        }
    }

    /// Connector with one fresh server per address
    pub fn with_servers<S: AsRef<str>>(addrs: &[S]) -> Self {
        let connector = Self::new();
        for addr in addrs {
            connector.add_server(addr.as_ref());
        }
        connector
    }

    /// Register a server, returning the existing one if the address is taken
    pub fn add_server<S: Into<String>>(&self, addr: S) -> Arc<MemoryServer> {
        let addr = addr.into();
        self.servers
            .write()
            .entry(addr.clone())
            .or_insert_with(|| Arc::new(MemoryServer::new(addr)))
            .clone()
    }

    pub fn server(&self, addr: &str) -> Option<Arc<MemoryServer>> {
        self.servers.read().get(addr).cloned()
    }
}

impl Default for MemoryConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, server: &ServerSpec) -> ConnectionResult {
        let target = match self.server(&server.addr) {
            Some(target) => target,
            None => {
                debug!("No in-memory server registered at {}", server.addr);
                return ConnectionResult::ConnectionRefused;
            }
        };

        if target.is_down() {
            return ConnectionResult::ConnectionRefused;
        }

        target.accepted.fetch_add(1, Ordering::SeqCst);
        target.open.fetch_add(1, Ordering::SeqCst);
        ConnectionResult::Success(Box::new(MemoryTransport {
            generation: target.generation(),
            server: target,
            read_timeout: self.read_timeout,
        }))
    }
}

/// One open loopback connection
pub struct MemoryTransport {
    server: Arc<MemoryServer>,
    generation: u64,
    read_timeout: Duration,
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.server.open.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn round_trip(&mut self, request: &Request) -> MemcacheResult<Response> {
        let server = self.server.clone();
        let generation = self.generation;
        let exchange = async move {
            if server.is_down() {
                return Err(MemcacheError::Network(io::Error::new(
                    io::ErrorKind::ConnectionReset,
                    format!("{} is down", server.addr()),
                )));
            }
            if server.generation() != generation {
                return Err(MemcacheError::Network(io::Error::new(
                    io::ErrorKind::ConnectionReset,
                    format!("{} restarted", server.addr()),
                )));
            }
            if server.is_stalled() {
                std::future::pending::<()>().await;
            }
            Ok(server.handle(request))
        };

        match timeout(self.read_timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(MemcacheError::timeout(format!(
                "{} on {}",
                request.command_name(),
                self.server.addr()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(key: &str, value: &'static str) -> Request {
        store(StoreMode::Set, key, value)
    }

    fn store(mode: StoreMode, key: &str, value: &'static str) -> Request {
        Request::Store {
            mode,
            key: key.to_string(),
            flags: 0,
            exptime: 0,
            data: Bytes::from_static(value.as_bytes()),
            cas: None,
        }
    }

    fn gets(server: &MemoryServer, key: &str) -> Option<Item> {
        match server.handle(&Request::Get {
            keys: vec![key.to_string()],
            with_cas: true,
        }) {
            Response::Values(mut items) => items.pop(),
            other => panic!("Unexpected response: {:?}", other),
        }
    }

    #[test]
    fn test_storage_semantics() {
        let server = MemoryServer::new("mem:1");

        assert_eq!(server.handle(&store(StoreMode::Add, "k", "a")), Response::Stored);
        assert_eq!(server.handle(&store(StoreMode::Add, "k", "b")), Response::NotStored);
        assert_eq!(server.handle(&store(StoreMode::Replace, "missing", "x")), Response::NotStored);
        assert_eq!(server.handle(&store(StoreMode::Append, "k", "z")), Response::Stored);
        assert_eq!(server.handle(&store(StoreMode::Prepend, "k", "<")), Response::Stored);
        assert_eq!(server.peek("k"), Some(Bytes::from("<az")));
        assert_eq!(server.handle(&store(StoreMode::Append, "nope", "z")), Response::NotStored);
    }

    #[test]
    fn test_cas_tokens_change_on_write() {
        let server = MemoryServer::new("mem:1");
        server.handle(&set("k", "v1"));
        let token = gets(&server, "k").and_then(|item| item.cas).unwrap();

        let cas = |cas| Request::Store {
            mode: StoreMode::Cas,
            key: "k".to_string(),
            flags: 0,
            exptime: 0,
            data: Bytes::from_static(b"v2"),
            cas: Some(cas),
        };
        assert_eq!(server.handle(&cas(token)), Response::Stored);
        assert_eq!(server.handle(&cas(token)), Response::Exists);
        assert_ne!(gets(&server, "k").and_then(|item| item.cas), Some(token));
    }

    #[test]
    fn test_counters() {
        let server = MemoryServer::new("mem:1");
        let incr = |delta| Request::Incr {
            key: "n".to_string(),
            delta,
        };
        assert_eq!(server.handle(&incr(1)), Response::NotFound);

        server.handle(&set("n", "10"));
        assert_eq!(server.handle(&incr(5)), Response::Numeric(15));
        assert_eq!(
            server.handle(&Request::Decr {
                key: "n".to_string(),
                delta: 100
            }),
            Response::Numeric(0)
        );

        server.handle(&set("s", "abc"));
        let response = server.handle(&Request::Incr {
            key: "s".to_string(),
            delta: 1,
        });
        assert!(matches!(response, Response::Error { kind: ServerErrorKind::Client, .. }));
    }

    #[test]
    fn test_stats_listings() {
        let server = MemoryServer::new("mem:1");
        server.handle(&set("a", "1"));
        server.handle(&set("b", "22"));

        let items = match server.handle(&Request::Stats(Some("items".to_string()))) {
            Response::Stats(entries) => entries,
            other => panic!("Unexpected response: {:?}", other),
        };
        assert!(items.contains(&("items:1:number".to_string(), "2".to_string())));

        let dump = match server.handle(&Request::Stats(Some("cachedump 1 1".to_string()))) {
            Response::Stats(entries) => entries,
            other => panic!("Unexpected response: {:?}", other),
        };
        assert_eq!(dump, vec![("a".to_string(), "[1 b; 0 s]".to_string())]);
    }

    #[tokio::test]
    async fn test_down_server_refuses_and_fails() {
        let connector = MemoryConnector::with_servers(&["mem:1"]);
        let spec = ServerSpec::new("mem:1", 1);

        let mut transport = match connector.connect(&spec).await {
            ConnectionResult::Success(transport) => transport,
            other => panic!("Unexpected connection result: {:?}", other),
        };
        assert_eq!(transport.round_trip(&Request::Version).await.unwrap(), Response::Version(SERVER_VERSION.to_string()));

        let server = connector.server("mem:1").unwrap();
        assert_eq!(server.open_connections(), 1);
        server.set_down(true);
        assert!(transport.round_trip(&Request::Version).await.is_err());
        assert!(!connector.connect(&spec).await.is_success());

        drop(transport);
        assert_eq!(server.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_restart_closes_open_connections_only() {
        let connector = MemoryConnector::with_servers(&["mem:1"]);
        let spec = ServerSpec::new("mem:1", 1);
        let server = connector.server("mem:1").unwrap();
        server.handle(&set("k", "v"));

        let mut old = match connector.connect(&spec).await {
            ConnectionResult::Success(transport) => transport,
            other => panic!("Unexpected connection result: {:?}", other),
        };
        server.restart();
        assert!(old.round_trip(&Request::Version).await.is_err());

        let mut fresh = match connector.connect(&spec).await {
            ConnectionResult::Success(transport) => transport,
            other => panic!("Unexpected connection result: {:?}", other),
        };
        assert!(fresh.round_trip(&Request::Version).await.is_ok());
        assert_eq!(server.peek("k"), Some(Bytes::from("v")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_server_times_out() {
        let connector = MemoryConnector::with_read_timeout(Duration::from_millis(100));
        let server = connector.add_server("mem:1");
        server.set_stalled(true);

        let mut transport = match connector.connect(&ServerSpec::new("mem:1", 1)).await {
            ConnectionResult::Success(transport) => transport,
            other => panic!("Unexpected connection result: {:?}", other),
        };
        let err = transport.round_trip(&Request::Version).await.unwrap_err();
        assert!(matches!(err, MemcacheError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_unknown_address_is_refused() {
        let connector = MemoryConnector::new();
        let result = connector.connect(&ServerSpec::new("mem:404", 1)).await;
        assert!(matches!(result, ConnectionResult::ConnectionRefused));
    }
}
