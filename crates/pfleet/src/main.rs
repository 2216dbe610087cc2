//! pfleet: PPTP node fleet operator
//!
//! Tests nodes, promotes them to tunnels behind per-node SOCKS5 proxies,
//! and keeps them healthy until a signal arrives.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pfleet_node::{MemoryNodeStore, NodeId};
use pfleet_vpn::{FleetConfig, FleetManager, NodeReport};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// PPTP node fleet: probe, tunnel, proxy
#[derive(Parser, Debug)]
#[command(name = "pfleet")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, PartialEq)]
enum Command {
    /// Protocol-test nodes (all untested or non-online nodes when no ids)
    Ping {
        /// Only check that the control port accepts connections
        #[arg(long)]
        light: bool,

        ids: Vec<NodeId>,
    },

    /// Estimate throughput of nodes that passed a ping
    Speed { ids: Vec<NodeId> },

    /// Bring nodes online and supervise them until a signal arrives
    Launch { ids: Vec<NodeId> },

    /// Recover stale state and supervise until a signal arrives
    Serve,

    /// Print `ip:port:login:password` for every online node
    Proxies,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = load_config(cli.config.as_deref())?;
    let nodes_file = config.fleet.nodes_file.clone();
    let store = Arc::new(
        MemoryNodeStore::load_json(&nodes_file)
            .await
            .with_context(|| format!("Failed to load nodes from {}", nodes_file.display()))?,
    );
    let fleet = FleetManager::system(config, store.clone());

    match cli.command {
        Command::Ping { light, ids } => print_reports(&fleet.ping_nodes(&ids, light).await),
        Command::Speed { ids } => print_reports(&fleet.speed_nodes(&ids).await),
        Command::Launch { ids } => {
            fleet.recover_stale().await.context("Startup recovery failed")?;
            print_reports(&fleet.launch_nodes(&ids).await);
            save(&store, &nodes_file).await?;
            supervise(&fleet).await?;
        }
        Command::Serve => {
            fleet.recover_stale().await.context("Startup recovery failed")?;
            save(&store, &nodes_file).await?;
            supervise(&fleet).await?;
        }
        Command::Proxies => {
            for line in fleet.proxy_list().await? {
                println!("{}", line);
            }
            return Ok(());
        }
    }

    save(&store, &nodes_file).await
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .with_target(false)
        .compact()
        .init();
}

fn load_config(path: Option<&Path>) -> Result<FleetConfig> {
    let config = match path {
        Some(path) => FleetConfig::from_toml_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => {
            let config = FleetConfig::default();
            config.validate().context("Default configuration is invalid")?;
            config
        }
    };
    Ok(config)
}

/// Run the watchdog until SIGINT/SIGTERM, then tear everything down
async fn supervise(fleet: &FleetManager) -> Result<()> {
    publish_proxies(fleet).await;
    let watchdog = fleet.spawn_watchdog();
    info!(
        interval_secs = fleet.config().watchdog.interval_secs,
        "Supervising fleet, waiting for SIGINT/SIGTERM"
    );

    wait_for_signal().await?;
    info!("Signal received, shutting down");

    let reports = fleet.shutdown().await;
    if let Err(e) = watchdog.await {
        warn!(error = %e, "Watchdog task ended abnormally");
    }
    print_reports(&reports);
    publish_proxies(fleet).await;
    Ok(())
}

async fn wait_for_signal() -> Result<()> {
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    tokio::select! {
        _ = sigint.recv() => {}
        _ = sigterm.recv() => {}
    }
    Ok(())
}

async fn publish_proxies(fleet: &FleetManager) {
    let Some(path) = fleet.config().fleet.proxy_list_file.as_deref() else {
        return;
    };
    if let Err(e) = fleet.write_proxy_list(path).await {
        warn!(path = %path.display(), error = %e, "Failed to write proxy list");
    }
}

async fn save(store: &MemoryNodeStore, path: &Path) -> Result<()> {
    store
        .save_json(path)
        .await
        .with_context(|| format!("Failed to save nodes to {}", path.display()))
}

fn print_reports(reports: &[NodeReport]) {
    for report in reports {
        println!("{}", report);
    }
    let ok = reports.iter().filter(|r| r.success).count();
    println!("{}/{} succeeded", ok, reports.len());
}
