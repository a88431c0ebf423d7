/// Leased connection handles
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::core::ServerSpec;
use crate::error::{MemcacheError, MemcacheResult};
use crate::protocol::{Request, Response};
use crate::transport::Transport;

/// Shared between the pool's lease record and the borrower
#[derive(Debug, Default)]
pub(crate) struct LeaseState {
    revoked: AtomicBool,
    notify: Notify,
}

impl LeaseState {
    pub(crate) fn revoke(&self) {
        self.revoked.store(true, Ordering::SeqCst);
        // A stored permit wakes a borrower that starts waiting later
        self.notify.notify_one();
    }

    pub(crate) fn is_revoked(&self) -> bool {
        self.revoked.load(Ordering::SeqCst)
    }
}

/// Pool-side record of a connection handed to a caller
pub(crate) struct LeaseRecord {
    pub(crate) leased_at: Instant,
    pub(crate) lease: Arc<LeaseState>,
}

/// Connection sitting in a server's idle set
pub(crate) struct IdleConnection {
    pub(crate) id: u64,
    pub(crate) transport: Box<dyn Transport>,
    pub(crate) idle_since: Instant,
}

impl IdleConnection {
    pub(crate) fn new(id: u64, transport: Box<dyn Transport>) -> Self {
        Self {
            id,
            transport,
            idle_since: Instant::now(),
        }
    }
}

/// A connection leased from a `ServerPool`.
///
/// Exactly one caller holds it at a time. It must go back through
/// `ServerPool::checkin`; if the maintenance pass reclaimed it in the meantime
/// every further `execute` fails with `LeaseRevoked` and the checkin is a no-op.
pub struct PooledConnection {
    pub(crate) id: u64,
    pub(crate) server: ServerSpec,
    pub(crate) transport: Box<dyn Transport>,
    pub(crate) lease: Arc<LeaseState>,
    pub(crate) broken: bool,
}

impl PooledConnection {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn server(&self) -> &ServerSpec {
        &self.server
    }

    /// Discard the connection on checkin instead of returning it to the idle set
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }

    pub fn is_revoked(&self) -> bool {
        self.lease.is_revoked()
    }

    /// Run one request on the leased connection.
    ///
    /// Errors that leave the stream in an unknown state mark the handle broken.
    pub async fn execute(&mut self, request: &Request) -> MemcacheResult<Response> {
        if self.lease.is_revoked() {
            self.broken = true;
            return Err(MemcacheError::lease_revoked(&self.server.addr));
        }

        let lease = self.lease.clone();
        let result = tokio::select! {
            result = self.transport.round_trip(request) => result,
            _ = lease.notify.notified() => Err(MemcacheError::lease_revoked(&self.server.addr)),
        };

        if let Err(e) = &result {
            if e.breaks_connection() {
                self.broken = true;
            }
        }
        result
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("server", &self.server.addr)
            .field("broken", &self.broken)
            .field("revoked", &self.lease.is_revoked())
            .finish()
    }
}
