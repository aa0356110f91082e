//! Peer registry: connections, reliability accounting, chunk sizing.
//!
//! Direct peers hold a writer handle to their WebSocket connection; relay
//! peers hold a writer handle to a boot-node session that forwards frames.
//! Known peer URIs persist across restarts in a JSON file. Each URI carries
//! a failure counter: incremented on send/fetch failure, decremented on
//! success, floored at zero; counters at or above
//! [`RELIABILITY_THRESHOLD`] exclude the peer from sync polling.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::PathBuf;

use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, warn};

use ember_core::constants::{
    CHUNK_SIZE, CHUNK_SIZE_STEP, MAX_CHUNK_SIZE, MIN_CHUNK_SIZE, RELIABILITY_THRESHOLD,
};

/// Writer handle pumping frames to a connection's writer task.
pub type FrameSender = mpsc::UnboundedSender<Message>;

/// Adaptive chunk size for block fetches: grown on success, shrunk on
/// failure, clamped to `[MIN_CHUNK_SIZE, MAX_CHUNK_SIZE]`.
#[derive(Debug, Clone)]
pub struct AdaptiveChunk {
    size: u64,
}

impl Default for AdaptiveChunk {
    fn default() -> Self {
        Self::new()
    }
}

impl AdaptiveChunk {
    pub fn new() -> Self {
        Self { size: CHUNK_SIZE }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn grow(&mut self) {
        self.size = (self.size + CHUNK_SIZE_STEP).min(MAX_CHUNK_SIZE);
    }

    pub fn shrink(&mut self) {
        self.size = self.size.saturating_sub(CHUNK_SIZE_STEP).max(MIN_CHUNK_SIZE);
    }
}

/// Process-local view of the peer network.
pub struct PeerRegistry {
    direct: HashMap<String, FrameSender>,
    relay: HashMap<String, FrameSender>,
    known: HashSet<String>,
    reliability: HashMap<String, u32>,
    peers_file: PathBuf,
}

impl PeerRegistry {
    /// Create a registry, loading persisted known peers if present.
    pub fn new(peers_file: PathBuf) -> Self {
        let known = load_peers(&peers_file);
        Self {
            direct: HashMap::new(),
            relay: HashMap::new(),
            known,
            reliability: HashMap::new(),
            peers_file,
        }
    }

    // --- Direct connections ---

    pub fn insert_direct(&mut self, uri: &str, sender: FrameSender) {
        self.direct.insert(uri.to_string(), sender);
    }

    pub fn has_direct(&self, uri: &str) -> bool {
        self.direct.contains_key(uri)
    }

    pub fn direct_sender(&self, uri: &str) -> Option<FrameSender> {
        self.direct.get(uri).cloned()
    }

    pub fn direct_count(&self) -> usize {
        self.direct.len()
    }

    pub fn direct_uris(&self) -> Vec<String> {
        self.direct.keys().cloned().collect()
    }

    /// Snapshot for broadcasts: peers that fail mid-iteration are collected
    /// by the caller and removed after iteration.
    pub fn snapshot_direct(&self) -> Vec<(String, FrameSender)> {
        self.direct.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }

    /// Drop a peer entirely: direct handle, relay session, and persisted
    /// known-peers entry.
    pub fn remove_peer(&mut self, uri: &str) {
        let had = self.direct.remove(uri).is_some() | self.relay.remove(uri).is_some();
        if self.known.remove(uri) || had {
            self.save_peers();
            debug!(%uri, "peer removed from registry");
        }
    }

    // --- Relay sessions ---

    pub fn insert_relay(&mut self, uri: &str, sender: FrameSender) {
        self.relay.insert(uri.to_string(), sender);
    }

    pub fn relay_sender(&self, uri: &str) -> Option<FrameSender> {
        self.relay.get(uri).cloned()
    }

    pub fn remove_relay(&mut self, uri: &str) {
        self.relay.remove(uri);
    }

    pub fn relay_count(&self) -> usize {
        self.relay.len()
    }

    pub fn relay_uris(&self) -> Vec<String> {
        self.relay.keys().cloned().collect()
    }

    // --- Known peers (persisted) ---

    pub fn add_known(&mut self, uri: &str) -> bool {
        let added = self.known.insert(uri.to_string());
        if added {
            self.save_peers();
        }
        added
    }

    pub fn is_known(&self, uri: &str) -> bool {
        self.known.contains(uri)
    }

    pub fn known_peers(&self) -> Vec<String> {
        self.known.iter().cloned().collect()
    }

    fn save_peers(&self) {
        let mut uris: Vec<&String> = self.known.iter().collect();
        uris.sort();
        match serde_json::to_vec(&uris) {
            Ok(bytes) => {
                if let Err(e) = fs::write(&self.peers_file, bytes) {
                    error!(path = %self.peers_file.display(), "failed to save peers: {e}");
                }
            }
            Err(e) => error!("failed to serialize peers: {e}"),
        }
    }

    // --- Reliability accounting ---

    pub fn record_failure(&mut self, uri: &str) {
        let count = self.reliability.entry(uri.to_string()).or_insert(0);
        *count += 1;
        if *count >= RELIABILITY_THRESHOLD {
            warn!(%uri, failures = *count, "peer marked unreliable");
        }
    }

    pub fn record_success(&mut self, uri: &str) {
        if let Some(count) = self.reliability.get_mut(uri) {
            *count = count.saturating_sub(1);
        }
    }

    pub fn failures(&self, uri: &str) -> u32 {
        self.reliability.get(uri).copied().unwrap_or(0)
    }

    /// Peers below the failure threshold participate in sync polling.
    pub fn is_reliable(&self, uri: &str) -> bool {
        self.failures(uri) < RELIABILITY_THRESHOLD
    }
}

fn load_peers(path: &PathBuf) -> HashSet<String> {
    match fs::read(path) {
        Ok(bytes) if !bytes.is_empty() => match serde_json::from_slice::<Vec<String>>(&bytes) {
            Ok(uris) => uris.into_iter().collect(),
            Err(e) => {
                error!(path = %path.display(), "invalid peers file: {e}");
                HashSet::new()
            }
        },
        _ => HashSet::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> (PeerRegistry, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let reg = PeerRegistry::new(dir.path().join("peers.json"));
        (reg, dir)
    }

    fn sender() -> FrameSender {
        mpsc::unbounded_channel().0
    }

    // ------------------------------------------------------------------
    // Direct and relay bookkeeping
    // ------------------------------------------------------------------

    #[test]
    fn direct_insert_and_remove() {
        let (mut reg, _dir) = registry();
        reg.insert_direct("ws://a:1", sender());
        assert!(reg.has_direct("ws://a:1"));
        assert_eq!(reg.direct_count(), 1);

        reg.remove_peer("ws://a:1");
        assert!(!reg.has_direct("ws://a:1"));
        assert_eq!(reg.direct_count(), 0);
    }

    #[test]
    fn remove_peer_clears_relay_and_known() {
        let (mut reg, _dir) = registry();
        reg.add_known("ws://a:1");
        reg.insert_relay("ws://a:1", sender());
        reg.remove_peer("ws://a:1");
        assert!(reg.relay_sender("ws://a:1").is_none());
        assert!(!reg.is_known("ws://a:1"));
    }

    #[test]
    fn snapshot_is_detached() {
        let (mut reg, _dir) = registry();
        reg.insert_direct("ws://a:1", sender());
        let snapshot = reg.snapshot_direct();
        reg.remove_peer("ws://a:1");
        assert_eq!(snapshot.len(), 1);
    }

    // ------------------------------------------------------------------
    // Known peers persistence
    // ------------------------------------------------------------------

    #[test]
    fn known_peers_persist_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peers.json");

        let mut reg = PeerRegistry::new(path.clone());
        assert!(reg.add_known("ws://a:1"));
        assert!(reg.add_known("ws://b:2"));
        assert!(!reg.add_known("ws://a:1")); // duplicate

        let reloaded = PeerRegistry::new(path);
        let mut peers = reloaded.known_peers();
        peers.sort();
        assert_eq!(peers, vec!["ws://a:1".to_string(), "ws://b:2".to_string()]);
    }

    #[test]
    fn corrupt_peers_file_yields_empty_set() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peers.json");
        fs::write(&path, b"{{{").unwrap();
        let reg = PeerRegistry::new(path);
        assert!(reg.known_peers().is_empty());
    }

    // ------------------------------------------------------------------
    // Reliability
    // ------------------------------------------------------------------

    #[test]
    fn failures_accumulate_and_recover() {
        let (mut reg, _dir) = registry();
        assert!(reg.is_reliable("ws://a:1"));

        for _ in 0..RELIABILITY_THRESHOLD {
            reg.record_failure("ws://a:1");
        }
        assert!(!reg.is_reliable("ws://a:1"));
        assert_eq!(reg.failures("ws://a:1"), RELIABILITY_THRESHOLD);

        reg.record_success("ws://a:1");
        assert!(reg.is_reliable("ws://a:1"));
    }

    #[test]
    fn success_floors_at_zero() {
        let (mut reg, _dir) = registry();
        reg.record_success("ws://a:1");
        reg.record_success("ws://a:1");
        assert_eq!(reg.failures("ws://a:1"), 0);
    }

    // ------------------------------------------------------------------
    // Adaptive chunk sizing
    // ------------------------------------------------------------------

    #[test]
    fn chunk_grows_to_max() {
        let mut chunk = AdaptiveChunk::new();
        assert_eq!(chunk.size(), CHUNK_SIZE);
        for _ in 0..20 {
            chunk.grow();
        }
        assert_eq!(chunk.size(), MAX_CHUNK_SIZE);
    }

    #[test]
    fn chunk_shrinks_to_min() {
        let mut chunk = AdaptiveChunk::new();
        for _ in 0..20 {
            chunk.shrink();
        }
        assert_eq!(chunk.size(), MIN_CHUNK_SIZE);
    }

    #[test]
    fn chunk_step_is_five() {
        let mut chunk = AdaptiveChunk::new();
        chunk.grow();
        assert_eq!(chunk.size(), CHUNK_SIZE + 5);
        chunk.shrink();
        assert_eq!(chunk.size(), CHUNK_SIZE);
    }
}
