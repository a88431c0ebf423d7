/// Transport boundary between the pool and a memcached server
///
/// A `Connector` opens connections, a `Transport` performs one request/reply
/// round trip at a time on an open connection. The pool owns transports; it
/// never looks inside them.
#[cfg(any(test, feature = "testing"))]
pub mod memory;
pub mod tcp;

use async_trait::async_trait;
use std::fmt;
use std::io;

use crate::core::ServerSpec;
use crate::error::MemcacheResult;
use crate::protocol::{Request, Response};

#[cfg(any(test, feature = "testing"))]
pub use memory::{MemoryConnector, MemoryServer};
pub use tcp::{TcpConnector, TcpTransport};

/// One open connection to one server
#[async_trait]
pub trait Transport: Send {
    /// Send a request and read its complete reply.
    ///
    /// Any error leaves the connection in an unknown state; callers discard it.
    async fn round_trip(&mut self, request: &Request) -> MemcacheResult<Response>;
}

/// Opens transports to servers
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, server: &ServerSpec) -> ConnectionResult;
}

/// Result of a connection attempt
pub enum ConnectionResult {
    Success(Box<dyn Transport>),
    Timeout,
    ConnectionRefused,
    NetworkError(io::Error),
}

impl ConnectionResult {
    pub fn is_success(&self) -> bool {
        matches!(self, ConnectionResult::Success(_))
    }
}

impl fmt::Debug for ConnectionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionResult::Success(_) => write!(f, "Success"),
            ConnectionResult::Timeout => write!(f, "Timeout"),
            ConnectionResult::ConnectionRefused => write!(f, "ConnectionRefused"),
            ConnectionResult::NetworkError(e) => write!(f, "NetworkError({})", e),
        }
    }
}

impl fmt::Display for ConnectionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionResult::Success(_) => write!(f, "connected"),
            ConnectionResult::Timeout => write!(f, "connect timed out"),
            ConnectionResult::ConnectionRefused => write!(f, "connection refused"),
            ConnectionResult::NetworkError(e) => write!(f, "network error: {}", e),
        }
    }
}
