use anyhow::{anyhow, bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use memcluster::config::{Config, ConfigError, LoggingConfig};
use memcluster::transport::{Connector, TcpConnector};
use memcluster::utils::{format_bytes, format_duration};
use memcluster::{ClusterRegistry, ClusterScope};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "memcluster")]
#[command(about = "Multi-cluster memcached client with weighted routing and failover")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate an example configuration file
    Config {
        /// Output file path
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Validate configuration file
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Read one key
    Get {
        #[command(flatten)]
        target: Target,
        #[arg(short, long)]
        key: String,
    },
    /// Store one key
    Set {
        #[command(flatten)]
        target: Target,
        #[arg(short, long)]
        key: String,
        #[arg(short, long)]
        value: String,
        /// Time to live in seconds; 0 never expires
        #[arg(long, default_value_t = 0)]
        ttl: u64,
    },
    /// Delete one key
    Delete {
        #[command(flatten)]
        target: Target,
        #[arg(short, long)]
        key: String,
    },
    /// Show server statistics for a cluster
    Stats {
        #[command(flatten)]
        target: Target,
        #[arg(long, value_enum, default_value_t = StatsKind::General)]
        kind: StatsKind,
    },
    /// Show version information
    Version,
}

#[derive(clap::Args)]
struct Target {
    /// Path to configuration file
    #[arg(short, long, default_value = "memcluster.toml")]
    config: PathBuf,
    /// Cluster name; the default cluster when omitted
    #[arg(long)]
    cluster: Option<String>,
}

#[derive(Clone, Copy, ValueEnum)]
enum StatsKind {
    General,
    Items,
    Slabs,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Config { output } => generate_config(output)?,
        Commands::Validate { config } => validate_config(config)?,
        Commands::Get { target, key } => {
            let (registry, scope) = connect(&target).await?;
            match scope.get(&key).await {
                Some(value) => println!("{}", display_value(&value)),
                None => println!("(miss)"),
            }
            registry.shutdown();
        }
        Commands::Set {
            target,
            key,
            value,
            ttl,
        } => {
            let (registry, scope) = connect(&target).await?;
            let stored = scope.set(&key, value, expires_at_ms(ttl)?).await;
            registry.shutdown();
            if !stored {
                bail!("set {} failed on cluster {}", key, scope.name());
            }
            println!("STORED");
        }
        Commands::Delete { target, key } => {
            let (registry, scope) = connect(&target).await?;
            let deleted = scope.delete(&key).await;
            registry.shutdown();
            println!("{}", if deleted { "DELETED" } else { "NOT_FOUND" });
        }
        Commands::Stats { target, kind } => {
            let (registry, scope) = connect(&target).await?;
            show_stats(&scope, kind).await?;
            registry.shutdown();
        }
        Commands::Version => show_version(),
    }

    Ok(())
}

async fn connect(target: &Target) -> anyhow::Result<(ClusterRegistry, ClusterScope)> {
    let mut config = Config::load_from_file(&target.config)
        .with_context(|| format!("Failed to load config from {:?}", target.config))?;
    init_logging(&config.logging)?;

    // One-shot commands need no warm pool
    for cluster in &mut config.clusters {
        cluster.init_conn = 0;
        cluster.min_conn = 0;
        cluster.maintenance_interval_ms = 0;
    }

    let registry = ClusterRegistry::from_config_with(&config, |cluster| {
        Arc::new(TcpConnector::from_cluster(cluster)) as Arc<dyn Connector>
    })
    .await
    .context("Failed to initialize cluster registry")?;

    let scope = match &target.cluster {
        Some(name) => {
            registry.cluster(name)?;
            registry.on(name)
        }
        None => registry.default_scope(),
    };
    info!("Using cluster {}", scope.name());
    Ok((registry, scope))
}

fn generate_config(output: PathBuf) -> anyhow::Result<()> {
    println!("Generating configuration file: {:?}", output);

    Config::create_example_config(&output).context("Failed to generate config")?;

    println!("Configuration file generated successfully!");
    println!("Edit the file to match your environment and run:");
    println!("  memcluster validate --config {:?}", output);

    Ok(())
}

fn validate_config(config_path: PathBuf) -> anyhow::Result<()> {
    println!("Validating configuration file: {:?}", config_path);

    let config = match Config::load_from_file(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("✗ Configuration file validation failed:");
            match &e {
                ConfigError::IoError(msg) => eprintln!("  File error: {}", msg),
                ConfigError::ParseError(msg) => eprintln!("  Parse error: {}", msg),
                ConfigError::ValidationError(msg) => eprintln!("  Validation error: {}", msg),
                ConfigError::SerializeError(msg) => eprintln!("  Serialization error: {}", msg),
            }
            return Err(e.into());
        }
    };

    println!("✓ Configuration file is valid");
    println!(
        "  Default cluster: {}",
        config.default_cluster_name().unwrap_or_default()
    );
    for cluster in &config.clusters {
        println!(
            "  Cluster {}: {} servers, {} hashing, pool {}..{}",
            cluster.effective_name(),
            cluster.servers.len(),
            cluster.hashing,
            cluster.min_conn,
            cluster.max_conn
        );
        for spec in cluster.server_specs() {
            println!("    {} (weight {})", spec.addr, spec.weight);
        }
    }

    Ok(())
}

#[derive(Serialize)]
struct Report<T: Serialize> {
    servers: Vec<T>,
}

async fn show_stats(scope: &ClusterScope, kind: StatsKind) -> anyhow::Result<()> {
    match kind {
        StatsKind::General => {
            let stats = scope.stats_to_model().await;
            if stats.is_empty() {
                bail!("no server of cluster {} answered", scope.name());
            }
            for server in stats {
                println!("{}", server.server);
                println!("  version:     {}", server.version.as_deref().unwrap_or("-"));
                if let Some(uptime) = server.uptime {
                    println!("  uptime:      {}", format_duration(Duration::from_secs(uptime)));
                }
                println!("  items:       {}", server.curr_items.unwrap_or(0));
                println!("  memory:      {}", format_bytes(server.bytes.unwrap_or(0)));
                println!("  connections: {}", server.curr_connections.unwrap_or(0));
                if let Some(ratio) = server.hit_ratio() {
                    println!("  hit ratio:   {:.1}%", ratio * 100.0);
                }
            }
        }
        StatsKind::Items => print_report(scope.stats_items_to_model().await)?,
        StatsKind::Slabs => print_report(scope.stats_slabs_to_model().await)?,
    }
    Ok(())
}

fn print_report<T: Serialize>(servers: Vec<T>) -> anyhow::Result<()> {
    let rendered = toml::to_string_pretty(&Report { servers })?;
    print!("{}", rendered);
    Ok(())
}

/// Text values print as-is, anything else as hex
fn display_value(value: &[u8]) -> String {
    match std::str::from_utf8(value) {
        Ok(text) => text.to_string(),
        Err(_) => format!("0x{}", hex::encode(value)),
    }
}

fn expires_at_ms(ttl_secs: u64) -> anyhow::Result<u64> {
    if ttl_secs == 0 {
        return Ok(0);
    }
    let now = SystemTime::now().duration_since(UNIX_EPOCH)?;
    Ok((now + Duration::from_secs(ttl_secs)).as_millis() as u64)
}

fn show_version() {
    println!("memcluster v{}", env!("CARGO_PKG_VERSION"));
    println!("Multi-cluster memcached client with weighted routing and failover");
    println!();
    println!("Target: {}", std::env::consts::ARCH);
    println!();
    println!("Features:");
    println!("  • Weighted modulo and consistent hashing");
    println!("  • Per-server connection pools with background maintenance");
    println!("  • Failover to the next server and failback with back-off");
    println!("  • Named clusters with a default cluster");
}

fn init_logging(logging: &LoggingConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    let installed = if logging.format == "json" {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| anyhow!("Failed to install logger: {}", e))?;

    info!("Logging initialized at level: {}", logging.level);
    Ok(())
}
