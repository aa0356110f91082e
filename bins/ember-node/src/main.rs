//! Ember full node binary.
//!
//! Starts a node with a RocksDB block store, the peer engine, and the HTTP
//! API, then runs until interrupted.

use std::path::PathBuf;
use std::process;

use clap::Parser;
use ember_node::{api, Node, NodeConfig};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Ember full node.
#[derive(Parser, Debug)]
#[command(name = "ember-node", version, about = "Ember proof-of-work node")]
struct Args {
    /// Data directory for the block store and peers file
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// HTTP API port
    #[arg(long)]
    api_port: Option<u16>,

    /// Peer transport (WebSocket) port
    #[arg(long)]
    peer_port: Option<u16>,

    /// Host advertised to other peers
    #[arg(long)]
    host: Option<String>,

    /// Boot node URI
    #[arg(long)]
    boot_node: Option<String>,

    /// Run in the secondary peer role (alternate ports and store path);
    /// also enabled by PEER=True in the environment
    #[arg(long)]
    peer: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn into_config(self) -> NodeConfig {
        // Start from the environment (PEER toggle, boot override), then let
        // CLI flags win.
        let mut config = NodeConfig::from_env();
        if self.peer {
            config.set_peer_role();
        }
        if let Some(data_dir) = self.data_dir {
            config.data_dir = data_dir;
        }
        if let Some(port) = self.api_port {
            config.api_port = port;
        }
        if let Some(port) = self.peer_port {
            config.peer_port = port;
        }
        if let Some(host) = self.host {
            config.advertised_host = host;
        }
        if let Some(boot) = self.boot_node {
            config.boot_node = boot;
        }
        config.log_level = self.log_level;
        config
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let config = args.into_config();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone())),
        )
        .init();

    let node = match Node::new(config) {
        Ok(node) => node,
        Err(e) => {
            error!("failed to start node: {e}");
            process::exit(1);
        }
    };
    node.start();

    let api_node = node.clone();
    let api_task = tokio::spawn(async move {
        if let Err(e) = api::serve(api_node).await {
            error!("API server failed: {e}");
        }
    });

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutting down"),
        Err(e) => error!("failed to listen for shutdown signal: {e}"),
    }
    node.stop();
    api_task.abort();
}
