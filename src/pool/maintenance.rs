/// Background maintenance of a `ServerPool`
///
/// Each pass walks every server and, in order: closes idle connections past
/// `max_idle` (keeping `min_conn` idle), reclaims leases held past
/// `max_busy_time`, tops the server back up to `min_conn` and finally probes one
/// idle connection. Dead servers that are due for a retry get their connection
/// attempt through the top-up step.
use std::sync::Arc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

use super::{PendingGuard, ServerPool, ServerSlot};

/// What one maintenance pass did
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MaintenanceReport {
    /// Idle connections closed for exceeding `max_idle` or `max_conn`
    pub expired: usize,
    /// Leases revoked for exceeding `max_busy_time`
    pub reclaimed: usize,
    /// Connections opened to reach `min_conn`
    pub opened: usize,
    /// Servers found dead by the idle probe
    pub probe_failures: usize,
}

impl MaintenanceReport {
    pub fn is_quiet(&self) -> bool {
        *self == MaintenanceReport::default()
    }

    fn merge(&mut self, other: MaintenanceReport) {
        self.expired += other.expired;
        self.reclaimed += other.reclaimed;
        self.opened += other.opened;
        self.probe_failures += other.probe_failures;
    }
}

impl ServerPool {
    /// Start the background maintenance task; does nothing when the interval is 0
    pub fn start_maintenance(self: &Arc<Self>) {
        let interval = match self.config.maintenance_interval() {
            Some(interval) => interval,
            None => {
                debug!("Maintenance disabled for cluster {}", self.cluster);
                return;
            }
        };

        let pool = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                let pool = match pool.upgrade() {
                    Some(pool) if !pool.is_shut_down() => pool,
                    _ => break,
                };

                let report = pool.run_maintenance().await;
                if !report.is_quiet() {
                    debug!("Maintenance pass for cluster {}: {:?}", pool.cluster, report);
                }
            }
        });

        if let Some(previous) = self.maintenance.lock().replace(task) {
            previous.abort();
        }
    }

    /// Run one maintenance pass over every server
    pub async fn run_maintenance(&self) -> MaintenanceReport {
        let mut report = MaintenanceReport::default();
        for slot in self.slots_in_order() {
            if self.is_shut_down() {
                break;
            }
            report.merge(self.maintain_server(&slot).await);
        }
        report
    }

    async fn maintain_server(&self, slot: &ServerSlot) -> MaintenanceReport {
        let mut report = MaintenanceReport {
            expired: self.expire_idle(slot),
            reclaimed: self.reclaim_busy(slot),
            ..MaintenanceReport::default()
        };

        // A dead server needs at least one attempt to fail back
        let target = if slot.state.lock().health.alive {
            self.config.min_conn
        } else {
            self.config.min_conn.max(1)
        };
        report.opened = self.fill(slot, target).await;

        if self.config.maintenance_probe && self.probe_idle(slot).await {
            report.probe_failures = 1;
        }
        report
    }

    fn expire_idle(&self, slot: &ServerSlot) -> usize {
        let max_idle = self.config.max_idle();
        let now = Instant::now();
        let mut state = slot.state.lock();
        let mut closed = 0;

        // Oldest connections sit at the front
        if !max_idle.is_zero() {
            while state.idle.len() > self.config.min_conn {
                match state.idle.front() {
                    Some(conn) if now.duration_since(conn.idle_since) > max_idle => {
                        state.idle.pop_front();
                        closed += 1;
                    }
                    _ => break,
                }
            }
        }

        while state.total() > self.config.max_conn && state.idle.pop_front().is_some() {
            closed += 1;
        }

        if closed > 0 {
            debug!("Closed {} idle connections to {}", closed, slot.spec.addr);
        }
        closed
    }

    fn reclaim_busy(&self, slot: &ServerSlot) -> usize {
        let max_busy = self.config.max_busy_time();
        if max_busy.is_zero() {
            return 0;
        }

        let now = Instant::now();
        let mut state = slot.state.lock();
        let overdue: Vec<u64> = state
            .leased
            .iter()
            .filter(|(_, record)| now.duration_since(record.leased_at) > max_busy)
            .map(|(&id, _)| id)
            .collect();

        for id in &overdue {
            if let Some(record) = state.leased.remove(id) {
                record.lease.revoke();
                warn!(
                    "Reclaimed connection {} to {} after {:?} checked out",
                    id,
                    slot.spec.addr,
                    now.duration_since(record.leased_at)
                );
            }
        }
        overdue.len()
    }

    /// Probe the oldest idle connection; returns true when it failed
    async fn probe_idle(&self, slot: &ServerSlot) -> bool {
        let (mut conn, pending) = {
            let mut state = slot.state.lock();
            if !state.health.alive {
                return false;
            }
            match state.idle.pop_front() {
                Some(conn) => (conn, PendingGuard::claim(&slot.state, &mut state)),
                None => return false,
            }
        };

        let status = self.health.probe(&slot.spec.addr, conn.transport.as_mut()).await;

        let mut state = slot.state.lock();
        pending.release(&mut state);
        if status.is_healthy() {
            if !self.is_shut_down() {
                state.idle.push_front(conn);
            }
            false
        } else {
            self.mark_dead_locked(&slot.spec, &mut state, &status.to_string());
            true
        }
    }
}
