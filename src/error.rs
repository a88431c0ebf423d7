/// Unified error handling for memcluster
///
/// Per-server transport failures are absorbed by the cluster client and turned
/// into routing decisions, so most of these variants never reach an application
/// through the key-value surface. They do show up in logs, in the pool API and
/// at startup when configuration is rejected.
use std::fmt;
use std::io;
use thiserror::Error;

pub use crate::config::ConfigError;

/// Main error type for memcluster operations
#[derive(Debug, Error)]
pub enum MemcacheError {
    /// Socket-level I/O errors on an established connection
    #[error("Network error: {0}")]
    Network(#[from] io::Error),

    /// Configuration errors (fatal at startup)
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Malformed response on an established connection
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Could not open a connection to a server
    #[error("Connect failure to {server}: {message}")]
    ConnectFailure { server: String, message: String },

    /// Timeout errors
    #[error("Operation timed out: {operation}")]
    Timeout { operation: String },

    /// No usable connection for this server right now
    #[error("Server unavailable: {server}")]
    Unavailable { server: String },

    /// Unknown cluster name
    #[error("Cluster not found: {name}")]
    ClusterNotFound { name: String },

    /// The maintenance pass reclaimed the handle while it was leased
    #[error("Lease revoked for connection to {server}")]
    LeaseRevoked { server: String },

    /// Internal errors (should not happen in normal operation)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Result type alias for memcluster operations
pub type MemcacheResult<T> = Result<T, MemcacheError>;

impl MemcacheError {
    pub fn connect_failure<S: Into<String>, M: Into<String>>(server: S, message: M) -> Self {
        MemcacheError::ConnectFailure {
            server: server.into(),
            message: message.into(),
        }
    }

    pub fn protocol<S: Into<String>>(message: S) -> Self {
        MemcacheError::Protocol(message.into())
    }

    pub fn timeout<S: Into<String>>(operation: S) -> Self {
        MemcacheError::Timeout {
            operation: operation.into(),
        }
    }

    pub fn unavailable<S: Into<String>>(server: S) -> Self {
        MemcacheError::Unavailable {
            server: server.into(),
        }
    }

    pub fn cluster_not_found<S: Into<String>>(name: S) -> Self {
        MemcacheError::ClusterNotFound { name: name.into() }
    }

    pub fn lease_revoked<S: Into<String>>(server: S) -> Self {
        MemcacheError::LeaseRevoked {
            server: server.into(),
        }
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        MemcacheError::Internal {
            message: message.into(),
        }
    }

    /// Check if this error is recoverable by trying another server or retrying later
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            MemcacheError::Network(_)
                | MemcacheError::ConnectFailure { .. }
                | MemcacheError::Timeout { .. }
                | MemcacheError::Unavailable { .. }
                | MemcacheError::LeaseRevoked { .. }
        )
    }

    /// Whether the connection that produced this error must be discarded
    pub fn breaks_connection(&self) -> bool {
        matches!(
            self,
            MemcacheError::Network(_)
                | MemcacheError::Protocol(_)
                | MemcacheError::Timeout { .. }
                | MemcacheError::LeaseRevoked { .. }
        )
    }

    /// Get error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            MemcacheError::Config(_) => ErrorSeverity::Critical,
            MemcacheError::Internal { .. } => ErrorSeverity::Critical,
            MemcacheError::Network(_) => ErrorSeverity::Warning,
            MemcacheError::ConnectFailure { .. } => ErrorSeverity::Warning,
            MemcacheError::Timeout { .. } => ErrorSeverity::Warning,
            MemcacheError::LeaseRevoked { .. } => ErrorSeverity::Warning,
            MemcacheError::Unavailable { .. } => ErrorSeverity::Info,
            _ => ErrorSeverity::Error,
        }
    }
}

/// Error severity levels for logging
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Critical errors that require immediate attention
    Critical,
    /// Errors that affect functionality but don't crash the system
    Error,
    /// Warnings about potential issues
    Warning,
    /// Informational messages about recoverable issues
    Info,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorSeverity::Critical => write!(f, "CRITICAL"),
            ErrorSeverity::Error => write!(f, "ERROR"),
            ErrorSeverity::Warning => write!(f, "WARNING"),
            ErrorSeverity::Info => write!(f, "INFO"),
        }
    }
}
