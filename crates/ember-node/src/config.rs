//! Node configuration: data directory, ports, boot node, peer role.

use std::path::PathBuf;

use ember_network::NetworkConfig;

/// Default API port of the primary role.
pub const DEFAULT_API_PORT: u16 = 3219;
/// Default peer (WebSocket) port of the primary role.
pub const DEFAULT_PEER_PORT: u16 = 3221;
/// API port used when the `PEER` role toggle is set.
pub const PEER_ROLE_API_PORT: u16 = 3230;
/// Peer port used when the `PEER` role toggle is set.
pub const PEER_ROLE_PEER_PORT: u16 = 3232;

/// Runtime configuration for a node instance.
///
/// Consensus parameters are compile-time constants in
/// [`ember_core::constants`]; only operational knobs live here.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Root directory for the block store and peers file.
    pub data_dir: PathBuf,
    /// Interface the HTTP API binds to.
    pub api_bind: String,
    /// HTTP API port.
    pub api_port: u16,
    /// Peer transport (WebSocket) port.
    pub peer_port: u16,
    /// Host advertised to other peers.
    pub advertised_host: String,
    /// Boot node URI.
    pub boot_node: String,
    /// Secondary-role toggle: alternate ports and a distinct store path,
    /// so two roles can share a machine.
    pub peer_role: bool,
    /// Log level filter string.
    pub log_level: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("ember");
        Self {
            data_dir,
            api_bind: "127.0.0.1".to_string(),
            api_port: DEFAULT_API_PORT,
            peer_port: DEFAULT_PEER_PORT,
            advertised_host: "127.0.0.1".to_string(),
            boot_node: "ws://127.0.0.1:10000".to_string(),
            peer_role: false,
            log_level: "info".to_string(),
        }
    }
}

impl NodeConfig {
    /// Default configuration with the `PEER` environment toggle applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        let peer_role = std::env::var("PEER")
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        if peer_role {
            config.set_peer_role();
        }
        if let Ok(boot) = std::env::var("EMBER_BOOT_NODE") {
            config.boot_node = boot;
        }
        config
    }

    /// Switch to the secondary role: alternate ports and store path.
    pub fn set_peer_role(&mut self) {
        self.peer_role = true;
        self.api_port = PEER_ROLE_API_PORT;
        self.peer_port = PEER_ROLE_PEER_PORT;
    }

    /// Path of the RocksDB block store, distinct per role.
    pub fn db_path(&self) -> PathBuf {
        let name = if self.peer_role { "chaindata-peer" } else { "chaindata" };
        self.data_dir.join(name)
    }

    /// Path of the persisted known-peers list, distinct per role.
    pub fn peers_file(&self) -> PathBuf {
        let name = if self.peer_role { "peers-peer.json" } else { "peers.json" };
        self.data_dir.join(name)
    }

    /// Socket address for the HTTP API.
    pub fn api_addr(&self) -> String {
        format!("{}:{}", self.api_bind, self.api_port)
    }

    /// Derive the peer engine configuration.
    pub fn network_config(&self) -> NetworkConfig {
        NetworkConfig {
            listen_port: self.peer_port,
            advertised_host: self.advertised_host.clone(),
            boot_node: self.boot_node.clone(),
            peers_file: self.peers_file(),
            ..NetworkConfig::default()
        }
    }
}
