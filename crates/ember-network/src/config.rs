//! Network configuration for the peer engine.

use std::path::PathBuf;

use ember_core::constants::CHUNK_TIMEOUT_SECS;

/// Knobs for the peer engine: transport binding, boot node, retry policy.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Interface the WebSocket listener binds to.
    pub listen_addr: String,
    /// Port of the WebSocket listener.
    pub listen_port: u16,
    /// Host advertised to other peers (public IP or hostname).
    pub advertised_host: String,
    /// URI of the boot (rendezvous/relay) node.
    pub boot_node: String,
    /// Direct connect attempts before falling back to relay.
    pub max_connect_retries: u32,
    /// Base backoff between direct connect attempts, doubled per retry.
    pub connect_backoff_secs: u64,
    /// Boot-node registration attempts before giving up.
    pub max_boot_retries: u32,
    /// Base backoff between boot registration attempts, doubled per retry.
    pub boot_backoff_secs: u64,
    /// Minimum seconds between mempool reconciliation rounds.
    pub tx_pool_cooldown_secs: u64,
    /// Seconds to wait for a correlated response before giving up.
    pub response_timeout_secs: u64,
    /// Where the known-peers list is persisted.
    pub peers_file: PathBuf,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0".to_string(),
            listen_port: 3221,
            advertised_host: "127.0.0.1".to_string(),
            boot_node: "ws://127.0.0.1:10000".to_string(),
            max_connect_retries: 2,
            connect_backoff_secs: 2,
            max_boot_retries: 3,
            boot_backoff_secs: 5,
            tx_pool_cooldown_secs: 5,
            response_timeout_secs: CHUNK_TIMEOUT_SECS,
            peers_file: PathBuf::from("peers.json"),
        }
    }
}

impl NetworkConfig {
    /// The URI this node advertises to the boot node and peers.
    pub fn my_uri(&self) -> String {
        format!("ws://{}:{}", self.advertised_host, self.listen_port)
    }

    /// The local socket address to bind the listener to.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.listen_addr, self.listen_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_uris() {
        let cfg = NetworkConfig::default();
        assert_eq!(cfg.my_uri(), "ws://127.0.0.1:3221");
        assert_eq!(cfg.bind_addr(), "0.0.0.0:3221");
    }

    #[test]
    fn default_retry_policy() {
        let cfg = NetworkConfig::default();
        assert_eq!(cfg.max_connect_retries, 2);
        assert_eq!(cfg.connect_backoff_secs, 2);
        assert_eq!(cfg.max_boot_retries, 3);
        assert_eq!(cfg.boot_backoff_secs, 5);
    }
}
