//! Tablet server daemon
//!
//! The `tabletd` binary serves the tablet query protocol over TCP, backed
//! by the fixture-driven memory engine.
//!
//! # Usage
//!
//! ```bash
//! # Serve keyspace test_keyspace, shard 0 on the default port
//! tabletd
//!
//! # Serve two shards with canned results
//! tabletd --shard=-80 --shard=80- --fixtures fixtures.toml
//!
//! # Report v1 errors inside replies
//! tabletd --legacy-errors-in-reply
//!
//! # Use configuration file
//! tabletd --config /etc/tablet/tabletd.toml
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use tablet_server::{
    MemoryEngine, RpcServer, ServerConfig, SqlEngine, StaticTopology, TabletServer,
};

/// Tablet server daemon
#[derive(Parser, Debug)]
#[command(
    name = "tabletd",
    version,
    about = "Tablet query server",
    long_about = "Serves the tablet query protocol (sessions, transactions, \
                  execute, streaming and split queries) over TCP."
)]
struct Args {
    /// Host address to bind to
    #[arg(short = 'H', long, env = "TABLET_HOST")]
    host: Option<String>,

    /// Port to listen on
    #[arg(short = 'p', long, env = "TABLET_PORT")]
    port: Option<u16>,

    /// Keyspace served by this tablet
    #[arg(short = 'k', long, env = "TABLET_KEYSPACE")]
    keyspace: Option<String>,

    /// Shard served by this tablet (repeatable)
    #[arg(short = 's', long = "shard", value_name = "SHARD")]
    shards: Vec<String>,

    /// Configuration file path
    #[arg(short = 'c', long, value_name = "FILE", env = "TABLET_CONFIG")]
    config: Option<PathBuf>,

    /// Fixture file for the memory engine
    #[arg(short = 'f', long, value_name = "FILE", env = "TABLET_FIXTURES")]
    fixtures: Option<PathBuf>,

    /// Report v1 Begin/Commit/Rollback/StreamExecute errors inside replies
    #[arg(long, env = "TABLET_LEGACY_ERRORS_IN_REPLY")]
    legacy_errors_in_reply: bool,

    /// Default call deadline in milliseconds (0 disables it)
    #[arg(long, env = "TABLET_QUERY_TIMEOUT_MS")]
    query_timeout_ms: Option<u64>,

    /// Idle seconds before an open transaction is rolled back
    #[arg(long, env = "TABLET_TRANSACTION_TIMEOUT_SECS")]
    transaction_timeout_secs: Option<u64>,

    /// Enable verbose logging
    #[arg(short = 'v', long)]
    verbose: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", env = "TABLET_LOG_LEVEL")]
    log_level: String,

    /// Print configuration and exit
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args);

    // Load configuration
    let config = load_config(&args)?;

    // Print config and exit if requested
    if args.print_config {
        println!("{}", config.to_toml()?);
        return Ok(());
    }

    run_server(config).await
}

fn init_logging(args: &Args) {
    let level = if args.verbose {
        "debug"
    } else {
        &args.log_level
    };

    let filter = EnvFilter::try_new(format!(
        "tablet_server={level},tablet_proto={level},tablet_txn={level},tabletd={level}"
    ))
    .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}

fn load_config(args: &Args) -> Result<ServerConfig> {
    // Start with defaults
    let mut config = if let Some(path) = &args.config {
        ServerConfig::from_file(path).context("Failed to load config file")?
    } else {
        ServerConfig::default()
    };

    // Override with command-line arguments
    if let Some(host) = &args.host {
        config.host = host.clone();
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(keyspace) = &args.keyspace {
        config.keyspace = keyspace.clone();
    }
    if !args.shards.is_empty() {
        config.shards = args.shards.clone();
    }
    if let Some(path) = &args.fixtures {
        config.fixtures = Some(path.clone());
    }
    if args.legacy_errors_in_reply {
        config.legacy_errors_in_reply = true;
    }
    if let Some(ms) = args.query_timeout_ms {
        config.query_timeout_ms = ms;
    }
    if let Some(secs) = args.transaction_timeout_secs {
        config.transaction_timeout_secs = secs;
    }

    Ok(config)
}

async fn run_server(config: ServerConfig) -> Result<()> {
    let engine: Arc<dyn SqlEngine> = match &config.fixtures {
        Some(path) => Arc::new(MemoryEngine::from_file(path)?),
        None => {
            info!("No fixture file given, engine starts empty");
            Arc::new(MemoryEngine::new())
        }
    };
    let topology = Arc::new(StaticTopology::from_config(&config).context("Invalid shard list")?);

    info!("Server configuration:");
    info!("  Listen address: {}", config.socket_addr());
    info!("  Keyspace: {} shards {:?}", config.keyspace, config.shards);
    info!("  Legacy errors in reply: {}", config.legacy_errors_in_reply);
    info!("  Transaction timeout: {:?}", config.transaction_timeout());

    let addr = config.socket_addr();
    let legacy_errors_in_reply = config.legacy_errors_in_reply;
    let tablet = Arc::new(TabletServer::new(config, engine, topology));

    let reaper_shutdown = CancellationToken::new();
    let reaper = tablet.spawn_reaper(reaper_shutdown.clone());

    let server = RpcServer::bind(addr.as_str(), tablet.clone(), legacy_errors_in_reply)
        .await
        .context("Failed to start server")?;
    info!("Listening on {}, press Ctrl+C to shutdown", server.local_addr());

    shutdown_signal().await;

    // Graceful shutdown
    info!("Shutting down gracefully...");
    server.shutdown().await;
    reaper_shutdown.cancel();
    let _ = reaper.await;

    let active = tablet.transactions().active_count();
    if active > 0 {
        info!("Abandoning {} open transactions", active);
    }

    info!("Server stopped. Goodbye!");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
