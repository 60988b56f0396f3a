//! connector-daemon: joins a cluster, takes part in the master election and
//! logs membership changes.

use anyhow::Result;
use clap::Parser;
use connector_core::ConnectorEvent;
use connector_daemon::DaemonConfig;
use std::net::IpAddr;
use std::path::PathBuf;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "connector-daemon")]
#[command(about = "Cluster membership and master election daemon")]
struct Args {
    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Node id (generated if not provided)
    #[arg(long)]
    id: Option<String>,

    /// Cluster name
    #[arg(long)]
    cluster: Option<String>,

    /// Address to bind and announce
    #[arg(short, long)]
    address: Option<IpAddr>,

    /// Port for both UDP claims and TCP links
    #[arg(short, long)]
    port: Option<u16>,

    /// Broadcast target, `addr[:port]` (prefix `*` for a broadcast address)
    #[arg(short, long)]
    broadcast: Option<String>,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

impl Args {
    fn into_config(self) -> Result<DaemonConfig> {
        let mut config = match &self.config {
            Some(path) => DaemonConfig::load(path)?,
            None => DaemonConfig::default(),
        };
        if let Some(id) = self.id {
            config.id = Some(id);
        }
        if let Some(cluster) = self.cluster {
            config.cluster = cluster;
        }
        if let Some(address) = self.address {
            config.address = address;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(broadcast) = self.broadcast {
            config.broadcast = broadcast;
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Respects RUST_LOG, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,connector_daemon=debug,connector_core=debug"
    } else {
        "info,connector_daemon=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting connector-daemon");
    let config = args.into_config()?;
    let (handle, mut events) = connector_daemon::start(&config).await?;

    info!("Daemon running. Press Ctrl+C to stop.");

    loop {
        tokio::select! {
            Some(event) = events.recv() => match event {
                ConnectorEvent::StateChanged { from, to, master } => {
                    info!("State {} -> {} (master: {:?})", from, to, master);
                }
                ConnectorEvent::NodesUpdated { revision } => {
                    let status = handle.status().await?;
                    info!(
                        "Nodes updated to revision {}: {} node(s), master {:?}",
                        revision,
                        status.nodes.len(),
                        status.master
                    );
                }
                ConnectorEvent::Message { src, origin } => {
                    debug!("Message {:?} from {}", origin.event, src);
                }
            },

            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    handle.shutdown().await?;
    info!("Shutting down");
    Ok(())
}
