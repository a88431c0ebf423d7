/// Per-cluster connection pool
///
/// Every server of a cluster gets its own `ServerSlot` guarded by its own
/// `parking_lot::Mutex`, so traffic to different servers never contends on a
/// shared lock. Locks are only held for bookkeeping; connecting and probing
/// happen with the lock released and are accounted for as `pending`.
///
/// `checkout` never waits for capacity. When a server has no idle connection
/// and is at `max_conn` the caller gets `Unavailable` and is expected to fail
/// over to the next routed server.
pub mod handle;
pub mod maintenance;

use fnv::FnvHashMap;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::ClusterConfig;
use crate::core::ServerSpec;
use crate::error::{MemcacheError, MemcacheResult};
use crate::health::{HealthCheckManager, VersionHealthChecker};
use crate::transport::{ConnectionResult, Connector};

use handle::{IdleConnection, LeaseRecord, LeaseState};

pub use handle::PooledConnection;
pub use maintenance::MaintenanceReport;

/// Checkout attempts before giving up on a server whose connections fail probes
pub const MAX_CHECKOUT_ATTEMPTS: usize = 3;

/// Upper bound for the dead-server retry back-off
pub const MAX_DEAD_RETRY: Duration = Duration::from_secs(60);

/// Liveness of one server
#[derive(Debug, Clone)]
pub(crate) struct ServerHealth {
    alive: bool,
    retry_at: Option<Instant>,
    backoff: Duration,
}

impl ServerHealth {
    fn new() -> Self {
        Self {
            alive: true,
            retry_at: None,
            backoff: Duration::ZERO,
        }
    }

    /// Returns true when the server was alive before
    fn mark_dead(&mut self, now: Instant, initial_backoff: Duration) -> bool {
        let was_alive = self.alive;
        self.backoff = if was_alive {
            initial_backoff
        } else {
            self.backoff.saturating_mul(2).min(MAX_DEAD_RETRY).max(initial_backoff)
        };
        self.alive = false;
        self.retry_at = Some(now + self.backoff);
        was_alive
    }

    /// Returns true when the server was dead before
    fn mark_alive(&mut self) -> bool {
        let was_dead = !self.alive;
        self.alive = true;
        self.retry_at = None;
        self.backoff = Duration::ZERO;
        was_dead
    }

    /// Whether a connection attempt may be made now
    fn may_connect(&self, now: Instant, failback: bool) -> bool {
        if self.alive {
            return true;
        }
        failback && self.retry_at.map_or(true, |at| now >= at)
    }
}

pub(crate) struct SlotState {
    pub(crate) idle: VecDeque<IdleConnection>,
    pub(crate) leased: HashMap<u64, LeaseRecord>,
    /// Connections being opened or probed outside the lock
    pub(crate) pending: usize,
    pub(crate) health: ServerHealth,
}

impl SlotState {
    fn new() -> Self {
        Self {
            idle: VecDeque::new(),
            leased: HashMap::new(),
            pending: 0,
            health: ServerHealth::new(),
        }
    }

    pub(crate) fn total(&self) -> usize {
        self.idle.len() + self.leased.len() + self.pending
    }
}

/// One `pending` claim on a server, given back when dropped.
///
/// Connects and probes run with the slot lock released; a checkout or
/// maintenance future dropped at that await still returns its capacity. A
/// connection being probed at that point is closed with the future.
pub(crate) struct PendingGuard<'a> {
    lock: &'a Mutex<SlotState>,
    armed: bool,
}

impl<'a> PendingGuard<'a> {
    pub(crate) fn claim(lock: &'a Mutex<SlotState>, state: &mut SlotState) -> Self {
        state.pending += 1;
        Self { lock, armed: true }
    }

    /// Give the claim back while the caller holds the lock
    pub(crate) fn release(mut self, state: &mut SlotState) {
        state.pending -= 1;
        self.armed = false;
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.lock.lock().pending -= 1;
        }
    }
}

/// One server's share of the pool
pub(crate) struct ServerSlot {
    pub(crate) spec: ServerSpec,
    pub(crate) state: Mutex<SlotState>,
}

/// Point-in-time view of one server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSnapshot {
    pub addr: String,
    pub idle: usize,
    pub leased: usize,
    /// Connects and checks in flight
    pub pending: usize,
    pub alive: bool,
}

/// Point-in-time view of a whole pool
#[derive(Debug, Clone)]
pub struct PoolSnapshot {
    pub cluster: String,
    pub servers: Vec<ServerSnapshot>,
}

impl PoolSnapshot {
    pub fn server(&self, addr: &str) -> Option<&ServerSnapshot> {
        self.servers.iter().find(|s| s.addr == addr)
    }

    pub fn total_idle(&self) -> usize {
        self.servers.iter().map(|s| s.idle).sum()
    }

    pub fn total_leased(&self) -> usize {
        self.servers.iter().map(|s| s.leased).sum()
    }
}

enum Acquire {
    Idle(IdleConnection),
    Connect,
}

pub struct ServerPool {
    cluster: String,
    config: ClusterConfig,
    connector: Arc<dyn Connector>,
    health: HealthCheckManager,
    servers: Vec<ServerSpec>,
    slots: FnvHashMap<String, Arc<ServerSlot>>,
    next_id: AtomicU64,
    shut_down: AtomicBool,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

impl ServerPool {
    pub fn new(config: ClusterConfig, connector: Arc<dyn Connector>) -> Self {
        let health = HealthCheckManager::new(Box::new(VersionHealthChecker::new(config.socket_timeout())));
        Self::with_health_check(config, connector, health)
    }

    pub fn with_health_check(config: ClusterConfig, connector: Arc<dyn Connector>, health: HealthCheckManager) -> Self {
        let servers = config.server_specs();
        let slots = servers
            .iter()
            .map(|spec| {
                let slot = ServerSlot {
                    spec: spec.clone(),
                    state: Mutex::new(SlotState::new()),
                };
                (spec.addr.clone(), Arc::new(slot))
            })
            .collect();

        Self {
            cluster: config.effective_name(),
            config,
            connector,
            health,
            servers,
            slots,
            next_id: AtomicU64::new(1),
            shut_down: AtomicBool::new(false),
            maintenance: Mutex::new(None),
        }
    }

    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn servers(&self) -> &[ServerSpec] {
        &self.servers
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Open `init_conn` connections to every server
    pub async fn initialize(&self) -> usize {
        let target = self.config.init_conn;
        let fills = self.slots_in_order().map(|slot| async move { self.fill(&slot, target).await });
        let opened: usize = futures::future::join_all(fills).await.into_iter().sum();

        info!(
            "Initialized pool for cluster {}: {} connections across {} servers",
            self.cluster,
            opened,
            self.servers.len()
        );
        opened
    }

    /// Lease a connection to `server`
    pub async fn checkout(&self, server: &ServerSpec) -> MemcacheResult<PooledConnection> {
        let slot = self.slot(&server.addr)?;
        if self.is_shut_down() {
            return Err(MemcacheError::unavailable(&server.addr));
        }

        for attempt in 0..MAX_CHECKOUT_ATTEMPTS {
            let (acquired, pending) = {
                let mut state = slot.state.lock();
                // A probe failure in this checkout marks the server dead; later
                // attempts may still open a fresh connection.
                if attempt == 0 && !state.health.may_connect(Instant::now(), self.config.failback) {
                    return Err(MemcacheError::unavailable(&server.addr));
                }
                if let Some(conn) = state.idle.pop_back() {
                    (Acquire::Idle(conn), PendingGuard::claim(&slot.state, &mut state))
                } else if state.total() < self.config.max_conn {
                    (Acquire::Connect, PendingGuard::claim(&slot.state, &mut state))
                } else {
                    debug!("Pool for {} saturated at {} connections", server.addr, self.config.max_conn);
                    return Err(MemcacheError::unavailable(&server.addr));
                }
            };

            match acquired {
                Acquire::Idle(mut conn) => {
                    if self.config.alive_check {
                        let status = self.health.probe(&server.addr, conn.transport.as_mut()).await;
                        if !status.is_healthy() {
                            let mut state = slot.state.lock();
                            pending.release(&mut state);
                            self.mark_dead_locked(&slot.spec, &mut state, &status.to_string());
                            continue;
                        }
                    }
                    let mut state = slot.state.lock();
                    pending.release(&mut state);
                    return Ok(self.lease_locked(&slot.spec, &mut state, conn.id, conn.transport));
                }
                Acquire::Connect => {
                    let result = self.connector.connect(&slot.spec).await;
                    let mut state = slot.state.lock();
                    pending.release(&mut state);
                    return match result {
                        ConnectionResult::Success(transport) => {
                            self.mark_alive_locked(&slot.spec, &mut state);
                            let id = self.next_id();
                            Ok(self.lease_locked(&slot.spec, &mut state, id, transport))
                        }
                        failure => {
                            self.mark_dead_locked(&slot.spec, &mut state, &failure.to_string());
                            Err(MemcacheError::unavailable(&server.addr))
                        }
                    };
                }
            }
        }

        Err(MemcacheError::unavailable(&server.addr))
    }

    /// Return a leased connection.
    ///
    /// A connection that was reclaimed by maintenance, marked broken, or whose
    /// server went dead meanwhile is closed instead of going back to idle.
    pub fn checkin(&self, conn: PooledConnection) {
        let PooledConnection {
            id,
            server,
            transport,
            lease,
            broken,
        } = conn;

        let slot = match self.slots.get(&server.addr) {
            Some(slot) => slot,
            None => return,
        };

        let mut state = slot.state.lock();
        if state.leased.remove(&id).is_none() {
            debug!("Connection {} to {} was already reclaimed; dropping it", id, server.addr);
            return;
        }

        if broken || lease.is_revoked() || !state.health.alive || self.is_shut_down() {
            debug!("Closing connection {} to {}", id, server.addr);
            return;
        }

        state.idle.push_back(IdleConnection::new(id, transport));
    }

    pub fn mark_dead(&self, server: &ServerSpec, reason: &str) {
        if let Some(slot) = self.slots.get(&server.addr) {
            let mut state = slot.state.lock();
            self.mark_dead_locked(&slot.spec, &mut state, reason);
        }
    }

    pub fn mark_alive(&self, server: &ServerSpec) {
        if let Some(slot) = self.slots.get(&server.addr) {
            let mut state = slot.state.lock();
            self.mark_alive_locked(&slot.spec, &mut state);
        }
    }

    pub fn is_alive(&self, server: &ServerSpec) -> bool {
        self.slots
            .get(&server.addr)
            .map(|slot| slot.state.lock().health.alive)
            .unwrap_or(false)
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        let servers = self
            .slots_in_order()
            .map(|slot| {
                let state = slot.state.lock();
                ServerSnapshot {
                    addr: slot.spec.addr.clone(),
                    idle: state.idle.len(),
                    leased: state.leased.len(),
                    pending: state.pending,
                    alive: state.health.alive,
                }
            })
            .collect();

        PoolSnapshot {
            cluster: self.cluster.clone(),
            servers,
        }
    }

    /// Stop maintenance, revoke leases and close idle connections
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = self.maintenance.lock().take() {
            task.abort();
        }

        for slot in self.slots_in_order() {
            let mut state = slot.state.lock();
            state.idle.clear();
            for (_, record) in state.leased.drain() {
                record.lease.revoke();
            }
        }
        info!("Pool for cluster {} shut down", self.cluster);
    }

    fn slot(&self, addr: &str) -> MemcacheResult<Arc<ServerSlot>> {
        self.slots
            .get(addr)
            .cloned()
            .ok_or_else(|| MemcacheError::unavailable(addr))
    }

    pub(crate) fn slots_in_order(&self) -> impl Iterator<Item = Arc<ServerSlot>> + '_ {
        self.servers.iter().filter_map(move |spec| self.slots.get(&spec.addr).cloned())
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn lease_locked(
        &self,
        spec: &ServerSpec,
        state: &mut SlotState,
        id: u64,
        transport: Box<dyn crate::transport::Transport>,
    ) -> PooledConnection {
        let lease = Arc::new(LeaseState::default());
        state.leased.insert(
            id,
            LeaseRecord {
                leased_at: Instant::now(),
                lease: lease.clone(),
            },
        );
        PooledConnection {
            id,
            server: spec.clone(),
            transport,
            lease,
            broken: false,
        }
    }

    pub(crate) fn mark_dead_locked(&self, spec: &ServerSpec, state: &mut SlotState, reason: &str) {
        let was_alive = state.health.mark_dead(Instant::now(), self.config.dead_retry());
        // Idle connections to a dead server are not worth keeping
        state.idle.clear();
        if was_alive {
            warn!("Marking server {} in cluster {} dead: {}", spec.addr, self.cluster, reason);
        } else {
            debug!(
                "Server {} still dead ({}); next retry in {:?}",
                spec.addr, reason, state.health.backoff
            );
        }
    }

    pub(crate) fn mark_alive_locked(&self, spec: &ServerSpec, state: &mut SlotState) {
        if state.health.mark_alive() {
            info!("Server {} in cluster {} is back", spec.addr, self.cluster);
        }
    }

    /// Open connections until the server holds `target` (capped at `max_conn`)
    pub(crate) async fn fill(&self, slot: &ServerSlot, target: usize) -> usize {
        let target = target.min(self.config.max_conn);
        let mut opened = 0;

        loop {
            let pending = {
                let mut state = slot.state.lock();
                if self.is_shut_down()
                    || state.total() >= target
                    || !state.health.may_connect(Instant::now(), self.config.failback)
                {
                    break;
                }
                PendingGuard::claim(&slot.state, &mut state)
            };

            let result = self.connector.connect(&slot.spec).await;
            let mut state = slot.state.lock();
            pending.release(&mut state);
            match result {
                ConnectionResult::Success(transport) => {
                    self.mark_alive_locked(&slot.spec, &mut state);
                    let id = self.next_id();
                    state.idle.push_back(IdleConnection::new(id, transport));
                    opened += 1;
                }
                failure => {
                    self.mark_dead_locked(&slot.spec, &mut state, &failure.to_string());
                    break;
                }
            }
        }

        opened
    }
}

impl Drop for ServerPool {
    fn drop(&mut self) {
        if let Some(task) = self.maintenance.lock().take() {
            task.abort();
        }
    }
}
