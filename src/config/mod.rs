/// Configuration management for memcluster
///
/// A configuration file declares one or more named clusters. Each cluster is a
/// weighted list of memcached servers plus the sizing and failure-handling knobs
/// of its connection pool.
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::core::ServerSpec;
use crate::routing::hash::HashingAlgorithm;

/// Main memcluster configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Cluster used when an operation names none. Defaults to the first declared cluster.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_cluster: Option<String>,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Declared clusters, in configuration order
    #[serde(default)]
    pub clusters: Vec<ClusterConfig>,
}

/// One named cluster of weighted servers sharing a pool and routing policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Cluster name. Empty means "derive from the server list".
    #[serde(default)]
    pub name: String,
    /// Server addresses as `host:port`
    pub servers: Vec<String>,
    /// Weight per server, positionally matched. Empty means every server weighs 1.
    #[serde(default)]
    pub weights: Vec<u32>,
    /// Connections opened per server when the pool starts
    #[serde(default = "default_init_conn")]
    pub init_conn: usize,
    /// Connections the maintenance pass keeps open per server
    #[serde(default = "default_min_conn")]
    pub min_conn: usize,
    /// Hard ceiling of idle + leased connections per server
    #[serde(default = "default_max_conn")]
    pub max_conn: usize,
    /// How long a connection may sit idle before maintenance may close it
    #[serde(default = "default_max_idle_ms")]
    pub max_idle_ms: u64,
    /// How long a connection may stay leased before maintenance reclaims it
    #[serde(default = "default_max_busy_time_ms")]
    pub max_busy_time_ms: u64,
    /// Maintenance period; 0 disables the maintenance loop
    #[serde(default = "default_maintenance_interval_ms")]
    pub maintenance_interval_ms: u64,
    /// Read timeout for a single command round trip
    #[serde(default = "default_socket_timeout_ms")]
    pub socket_timeout_ms: u64,
    /// Connect timeout
    #[serde(default = "default_socket_timeout_ms")]
    pub socket_connect_timeout_ms: u64,
    /// Key hashing algorithm; `consistent` selects the hash ring
    #[serde(default)]
    pub hashing: HashingAlgorithm,
    /// Leave Nagle's algorithm enabled on server sockets
    #[serde(default = "default_true")]
    pub nagle: bool,
    /// Probe every connection with `version` before handing it out
    #[serde(default)]
    pub alive_check: bool,
    /// Try the next routed server when the chosen one is unusable
    #[serde(default = "default_true")]
    pub failover: bool,
    /// Let dead servers back in once they accept connections again
    #[serde(default = "default_true")]
    pub failback: bool,
    /// URL-encode keys before sending them
    #[serde(default = "default_true")]
    pub sanitize_keys: bool,
    /// Initial back-off before a dead server is retried
    #[serde(default = "default_dead_retry_ms")]
    pub dead_retry_ms: u64,
    /// Probe one idle connection per server on every maintenance pass
    #[serde(default = "default_true")]
    pub maintenance_probe: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    pub level: String,
    /// Log format (json, text)
    pub format: String,
}

fn default_init_conn() -> usize {
    10
}

fn default_min_conn() -> usize {
    10
}

fn default_max_conn() -> usize {
    50
}

fn default_max_idle_ms() -> u64 {
    1000
}

fn default_max_busy_time_ms() -> u64 {
    1000
}

fn default_maintenance_interval_ms() -> u64 {
    30
}

fn default_socket_timeout_ms() -> u64 {
    3000
}

fn default_dead_retry_ms() -> u64 {
    1000
}

fn default_true() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_cluster: None,
            logging: LoggingConfig::default(),
            clusters: vec![ClusterConfig::new("default", vec!["127.0.0.1:11211".to_string()])],
        }
    }
}

impl ClusterConfig {
    /// Cluster with the given servers (all weight 1) and default pool settings
    pub fn new<S: Into<String>>(name: S, servers: Vec<String>) -> Self {
        Self {
            name: name.into(),
            servers,
            weights: Vec::new(),
            init_conn: default_init_conn(),
            min_conn: default_min_conn(),
            max_conn: default_max_conn(),
            max_idle_ms: default_max_idle_ms(),
            max_busy_time_ms: default_max_busy_time_ms(),
            maintenance_interval_ms: default_maintenance_interval_ms(),
            socket_timeout_ms: default_socket_timeout_ms(),
            socket_connect_timeout_ms: default_socket_timeout_ms(),
            hashing: HashingAlgorithm::default(),
            nagle: true,
            alive_check: false,
            failover: true,
            failback: true,
            sanitize_keys: true,
            dead_retry_ms: default_dead_retry_ms(),
            maintenance_probe: true,
        }
    }

    /// Name used in the registry; the comma-joined server list when none was given
    pub fn effective_name(&self) -> String {
        if self.name.trim().is_empty() {
            self.servers.join(",")
        } else {
            self.name.clone()
        }
    }

    /// Servers paired with their weights
    pub fn server_specs(&self) -> Vec<ServerSpec> {
        self.servers
            .iter()
            .enumerate()
            .map(|(i, addr)| ServerSpec::new(addr.clone(), self.weights.get(i).copied().unwrap_or(1)))
            .collect()
    }

    pub fn max_idle(&self) -> Duration {
        Duration::from_millis(self.max_idle_ms)
    }

    pub fn max_busy_time(&self) -> Duration {
        Duration::from_millis(self.max_busy_time_ms)
    }

    /// `None` when the maintenance loop is disabled
    pub fn maintenance_interval(&self) -> Option<Duration> {
        (self.maintenance_interval_ms > 0).then(|| Duration::from_millis(self.maintenance_interval_ms))
    }

    pub fn socket_timeout(&self) -> Duration {
        Duration::from_millis(self.socket_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.socket_connect_timeout_ms)
    }

    pub fn dead_retry(&self) -> Duration {
        Duration::from_millis(self.dead_retry_ms)
    }

    /// Validate one cluster
    pub fn validate(&self) -> Result<(), ConfigError> {
        let name = self.effective_name();

        if self.servers.is_empty() {
            return Err(ConfigError::ValidationError(format!(
                "cluster {} must declare at least one server",
                name
            )));
        }

        let mut seen = HashSet::new();
        for server in &self.servers {
            crate::utils::split_host_port(server).ok_or_else(|| {
                ConfigError::ValidationError(format!(
                    "cluster {}: invalid server address: {}",
                    name, server
                ))
            })?;
            // Pools and routing are keyed by address
            if !seen.insert(server.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "cluster {}: duplicate server address: {}",
                    name, server
                )));
            }
        }

        if !self.weights.is_empty() {
            if self.weights.len() != self.servers.len() {
                return Err(ConfigError::ValidationError(format!(
                    "cluster {}: {} weights given for {} servers",
                    name,
                    self.weights.len(),
                    self.servers.len()
                )));
            }
            if self.weights.iter().all(|w| *w == 0) {
                return Err(ConfigError::ValidationError(format!(
                    "cluster {}: at least one server needs a positive weight",
                    name
                )));
            }
        }

        if self.max_conn == 0 {
            return Err(ConfigError::ValidationError(format!(
                "cluster {}: max_conn must be greater than 0",
                name
            )));
        }

        if self.min_conn > self.max_conn {
            return Err(ConfigError::ValidationError(format!(
                "cluster {}: min_conn ({}) exceeds max_conn ({})",
                name, self.min_conn, self.max_conn
            )));
        }

        if self.init_conn > self.max_conn {
            return Err(ConfigError::ValidationError(format!(
                "cluster {}: init_conn ({}) exceeds max_conn ({})",
                name, self.init_conn, self.max_conn
            )));
        }

        if self.socket_timeout_ms == 0 || self.socket_connect_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(format!(
                "cluster {}: socket timeouts must be greater than 0",
                name
            )));
        }

        Ok(())
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;

        let config = Self::from_toml(&content)?;
        Ok(config)
    }

    /// Parse and validate configuration from a TOML string
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config =
            toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        fs::write(path, content).map_err(|e| ConfigError::IoError(e.to_string()))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.clusters.is_empty() {
            return Err(ConfigError::ValidationError(
                "configuration must declare at least one cluster".to_string(),
            ));
        }

        let mut names = HashSet::new();
        for cluster in &self.clusters {
            cluster.validate()?;
            let name = cluster.effective_name();
            if !names.insert(name.clone()) {
                return Err(ConfigError::ValidationError(format!(
                    "duplicate cluster name: {}",
                    name
                )));
            }
        }

        if let Some(default) = &self.default_cluster {
            if !names.contains(default) {
                return Err(ConfigError::ValidationError(format!(
                    "default_cluster {} is not a declared cluster",
                    default
                )));
            }
        }

        match self.logging.level.as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            _ => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log level: {}",
                    self.logging.level
                )))
            }
        }

        match self.logging.format.as_str() {
            "json" | "text" => {}
            _ => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log format: {}",
                    self.logging.format
                )))
            }
        }

        Ok(())
    }

    /// Name of the cluster that receives operations naming no cluster.
    ///
    /// This is `default_cluster` when set, otherwise the first cluster in
    /// declaration order.
    pub fn default_cluster_name(&self) -> Option<String> {
        self.default_cluster
            .clone()
            .or_else(|| self.clusters.first().map(ClusterConfig::effective_name))
    }

    /// Create example configuration file
    pub fn create_example_config<P: AsRef<Path>>(path: P) -> Result<(), ConfigError> {
        let mut sessions = ClusterConfig::new(
            "sessions",
            vec![
                "10.0.1.10:11211".to_string(),
                "10.0.1.11:11211".to_string(),
                "10.0.1.12:11211".to_string(),
            ],
        );
        sessions.weights = vec![2, 1, 1];

        let mut catalog = ClusterConfig::new(
            "catalog",
            vec!["10.0.2.10:11211".to_string(), "10.0.2.11:11211".to_string()],
        );
        catalog.hashing = HashingAlgorithm::Consistent;
        catalog.alive_check = true;

        let config = Config {
            default_cluster: Some("sessions".to_string()),
            logging: LoggingConfig::default(),
            clusters: vec![sessions, catalog],
        };

        config.save_to_file(path)
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}
