//! The peer engine: connections, dispatch, gossip, and relay fallback.
//!
//! One [`PeerEngine`] owns the peer registry and drives every protocol
//! interaction. Each connection (inbound or outbound) gets a reader loop and
//! a writer task. Handlers never tear down a connection over a bad frame:
//! malformed input is logged and refused, and transport failures are
//! confined to the offending peer.
//!
//! Connection strategy per peer URI: bounded direct-connect retries with
//! exponential backoff, then a relay session through the boot node that
//! wraps all outbound frames in `RELAY_MESSAGE`. A `RELAY_FAILURE` from the
//! boot node removes the peer and bumps its failure counter.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, connect_async, WebSocketStream};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use ember_core::block::Block;
use ember_core::blockchain::Blockchain;
use ember_core::error::{ChainError, ProtocolError, StorageError, TransportError};
use ember_core::fee_estimator::FeeEstimator;
use ember_core::mempool::{Mempool, SetOutcome};
use ember_core::transaction::{Transaction, TxInput};

use crate::config::NetworkConfig;
use crate::peers::{AdaptiveChunk, FrameSender, PeerRegistry};
use crate::protocol::{wrap_relay, Envelope, MessageKind, RelayFailurePayload};
use crate::sync;

/// Durable destination for accepted blocks, implemented by the node's
/// block store.
pub trait BlockSink: Send + Sync {
    fn append_or_replace(&self, block: &Block) -> Result<(), StorageError>;
}

/// Shared node state the engine operates on.
#[derive(Clone)]
pub struct NodeContext {
    pub blockchain: Arc<RwLock<Blockchain>>,
    pub mempool: Arc<Mutex<Mempool>>,
    pub fees: Arc<FeeEstimator>,
    pub store: Arc<dyn BlockSink>,
}

/// How frames reach a peer: its own connection, or wrapped through the boot
/// node's relay.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum LinkKind {
    Direct,
    Relay,
}

/// A handle for answering a peer: carries the writer of whichever path the
/// peer is reachable over.
#[derive(Clone)]
pub struct PeerLink {
    pub uri: String,
    kind: LinkKind,
    sender: FrameSender,
    my_uri: String,
}

impl PeerLink {
    fn direct(uri: &str, sender: FrameSender, my_uri: &str) -> Self {
        Self { uri: uri.to_string(), kind: LinkKind::Direct, sender, my_uri: my_uri.to_string() }
    }

    fn relay(uri: &str, boot_sender: FrameSender, my_uri: &str) -> Self {
        Self {
            uri: uri.to_string(),
            kind: LinkKind::Relay,
            sender: boot_sender,
            my_uri: my_uri.to_string(),
        }
    }

    /// Encode and queue an envelope for this peer.
    pub fn send(&self, env: &Envelope) -> Result<(), TransportError> {
        let frame = env.encode().map_err(|e| self.send_err(e))?;
        let message = match self.kind {
            LinkKind::Direct => Message::Binary(frame),
            LinkKind::Relay => {
                let wrapped =
                    wrap_relay(&self.uri, &frame, &self.my_uri).map_err(|e| self.send_err(e))?;
                Message::Binary(wrapped.encode().map_err(|e| self.send_err(e))?)
            }
        };
        self.sender.send(message).map_err(|e| self.send_err(e))
    }

    fn send_err(&self, e: impl std::fmt::Display) -> TransportError {
        TransportError::Send { uri: self.uri.clone(), reason: e.to_string() }
    }
}

/// The peer engine. Cheap to share behind an `Arc`; all state is interior.
pub struct PeerEngine {
    /// Fresh random node id, advertised in every envelope.
    node_id: String,
    my_uri: String,
    config: NetworkConfig,
    ctx: NodeContext,
    registry: Mutex<PeerRegistry>,
    chunk: Mutex<AdaptiveChunk>,
    /// Correlated request/response slots keyed by (peer URI, response tag).
    pending: Mutex<HashMap<(String, MessageKind), oneshot::Sender<Value>>>,
    /// Blocks waiting for a missing transaction, keyed by the missing id.
    deferred_blocks: Mutex<HashMap<String, (Block, PeerLink)>>,
    /// Transaction ids already gossiped, for rebroadcast idempotence.
    processed_transactions: Mutex<HashSet<String>>,
    /// Serializes chain replacement attempts.
    syncing_chain: AtomicBool,
    /// Serializes mempool reconciliation rounds.
    tx_pool_syncing: AtomicBool,
    last_tx_pool_request: Mutex<Option<Instant>>,
    shutdown: broadcast::Sender<()>,
}

impl PeerEngine {
    pub fn new(config: NetworkConfig, ctx: NodeContext) -> Arc<Self> {
        let (shutdown, _) = broadcast::channel(1);
        let registry = PeerRegistry::new(config.peers_file.clone());
        Arc::new(Self {
            node_id: Uuid::new_v4().to_string(),
            my_uri: config.my_uri(),
            config,
            ctx,
            registry: Mutex::new(registry),
            chunk: Mutex::new(AdaptiveChunk::new()),
            pending: Mutex::new(HashMap::new()),
            deferred_blocks: Mutex::new(HashMap::new()),
            processed_transactions: Mutex::new(HashSet::new()),
            syncing_chain: AtomicBool::new(false),
            tx_pool_syncing: AtomicBool::new(false),
            last_tx_pool_request: Mutex::new(None),
            shutdown,
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn my_uri(&self) -> &str {
        &self.my_uri
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub(crate) fn context(&self) -> &NodeContext {
        &self.ctx
    }

    pub(crate) fn registry(&self) -> &Mutex<PeerRegistry> {
        &self.registry
    }

    pub(crate) fn chunk(&self) -> &Mutex<AdaptiveChunk> {
        &self.chunk
    }

    /// Connected peer URIs (direct and relay).
    pub fn peer_uris(&self) -> Vec<String> {
        let registry = self.registry.lock();
        let mut uris = registry.direct_uris();
        uris.extend(registry.relay_uris());
        uris
    }

    /// Recorded failure count for a peer URI.
    pub fn peer_failures(&self, uri: &str) -> u32 {
        self.registry.lock().failures(uri)
    }

    /// Whether a URI is in the persisted known-peers set.
    pub fn is_known_peer(&self, uri: &str) -> bool {
        self.registry.lock().is_known(uri)
    }

    /// Signal every task to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    fn shutdown_rx(&self) -> broadcast::Receiver<()> {
        self.shutdown.subscribe()
    }

    // ------------------------------------------------------------------
    // Task startup
    // ------------------------------------------------------------------

    /// Launch the listener, boot registration, known-peer dialing, and the
    /// initial chain sync.
    pub fn start(self: &Arc<Self>) {
        let engine = self.clone();
        tokio::spawn(async move {
            if let Err(e) = engine.clone().serve().await {
                error!("peer listener failed: {e}");
            }
        });

        let engine = self.clone();
        tokio::spawn(async move { engine.register_with_boot().await });

        let known = self.registry.lock().known_peers();
        for uri in known {
            let engine = self.clone();
            tokio::spawn(async move { engine.connect_to_peer(uri).await });
        }

        let engine = self.clone();
        tokio::spawn(async move {
            // Give the first connections a moment before polling lengths.
            tokio::time::sleep(Duration::from_secs(1)).await;
            sync::sync_with_peers(engine).await;
        });
    }

    /// Accept inbound peer connections until shutdown.
    async fn serve(self: Arc<Self>) -> Result<(), TransportError> {
        let listener = TcpListener::bind(self.config.bind_addr()).await.map_err(|e| {
            TransportError::Connect { uri: self.config.bind_addr(), reason: e.to_string() }
        })?;
        info!(uri = %self.my_uri, "peer node listening");

        let mut shutdown = self.shutdown_rx();
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                accepted = listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!("accept failed: {e}");
                            continue;
                        }
                    };
                    let engine = self.clone();
                    tokio::spawn(async move {
                        match accept_async(stream).await {
                            Ok(ws) => {
                                let uri = format!("ws://{addr}");
                                info!(peer = %uri, "peer connected");
                                engine.run_connection(ws, uri).await;
                            }
                            Err(e) => warn!("websocket handshake failed from {addr}: {e}"),
                        }
                    });
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Connections
    // ------------------------------------------------------------------

    /// Drive one duplex connection: register the peer, run the handshake,
    /// then dispatch every arriving frame in order until the stream ends.
    async fn run_connection<S>(self: Arc<Self>, ws: WebSocketStream<S>, uri: String)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, stream) = ws.split();
        let sender = spawn_writer(sink, uri.clone());
        self.registry.lock().insert_direct(&uri, sender.clone());

        let link = PeerLink::direct(&uri, sender, &self.my_uri);
        self.handshake(&link);
        self.read_loop(stream, &link).await;

        info!(peer = %uri, "peer disconnected");
        self.registry.lock().remove_peer(&uri);
    }

    /// Initial messages on a fresh connection: ask for the chain length and,
    /// cooldown permitting, the peer's mempool.
    fn handshake(&self, link: &PeerLink) {
        if let Ok(env) = Envelope::new(MessageKind::RequestChainLength, &(), &self.node_id) {
            let _ = link.send(&env);
        }
        if self.begin_tx_pool_round() {
            if let Ok(env) = Envelope::new(MessageKind::RequestTxPool, &(), &self.node_id) {
                let _ = link.send(&env);
            }
        }
    }

    async fn read_loop<S>(self: &Arc<Self>, mut stream: SplitStream<WebSocketStream<S>>, link: &PeerLink)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut shutdown = self.shutdown_rx();
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                frame = stream.next() => match frame {
                    Some(Ok(message)) => self.handle_frame(message, link).await,
                    Some(Err(e)) => {
                        warn!(peer = %link.uri, "read error: {e}");
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    /// Decode a transport frame and dispatch it. Malformed frames are
    /// refused without closing the connection.
    async fn handle_frame(self: &Arc<Self>, message: Message, link: &PeerLink) {
        let decoded = match &message {
            Message::Binary(bytes) => Envelope::decode_binary(bytes),
            Message::Text(text) => Envelope::decode_text(text),
            _ => return,
        };
        match decoded {
            Ok(env) => self.dispatch(env, link).await,
            Err(e) => warn!(peer = %link.uri, "refusing malformed frame: {e}"),
        }
    }

    /// Dial a peer directly with bounded retries, falling back to a relay
    /// session through the boot node when the retries are exhausted.
    pub async fn connect_to_peer(self: Arc<Self>, uri: String) {
        if uri == self.my_uri || self.registry.lock().has_direct(&uri) {
            return;
        }

        for attempt in 0..self.config.max_connect_retries {
            match connect_async(uri.as_str()).await {
                Ok((ws, _)) => {
                    info!(peer = %uri, "connected");
                    self.clone().run_connection(ws, uri).await;
                    return;
                }
                Err(e) => {
                    warn!(peer = %uri, attempt = attempt + 1, "connect failed: {e}");
                    if attempt + 1 < self.config.max_connect_retries {
                        let backoff = self.config.connect_backoff_secs << attempt;
                        tokio::time::sleep(Duration::from_secs(backoff)).await;
                    }
                }
            }
        }

        info!(peer = %uri, "direct retries exhausted, switching to relay mode");
        match self.ensure_relay_connection(&uri).await {
            Ok(sender) => {
                let link = PeerLink::relay(&uri, sender, &self.my_uri);
                if let Ok(env) = Envelope::new(MessageKind::RequestChainLength, &(), &self.node_id)
                {
                    let _ = link.send(&env);
                }
                if self.begin_tx_pool_round() {
                    if let Ok(env) = Envelope::new(MessageKind::RequestTxPool, &(), &self.node_id) {
                        let _ = link.send(&env);
                    }
                }
            }
            Err(e) => {
                error!(peer = %uri, "relay fallback failed: {e}");
                let mut registry = self.registry.lock();
                registry.record_failure(&uri);
                registry.remove_peer(&uri);
            }
        }
    }

    /// Open (or reuse) a relay session to the boot node for `target_uri`.
    /// A background task reads boot frames and dispatches them as if they
    /// arrived from the peer.
    pub(crate) fn ensure_relay_connection<'a>(
        self: &'a Arc<Self>,
        target_uri: &'a str,
    ) -> std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<FrameSender, TransportError>> + Send + 'a>,
    > {
        Box::pin(self.ensure_relay_connection_inner(target_uri))
    }

    async fn ensure_relay_connection_inner(
        self: &Arc<Self>,
        target_uri: &str,
    ) -> Result<FrameSender, TransportError> {
        let existing = self.registry.lock().relay_sender(target_uri);
        if let Some(sender) = existing {
            if !sender.is_closed() {
                return Ok(sender);
            }
            // Stale session: drop it and open a fresh one.
            self.registry.lock().remove_relay(target_uri);
        }

        let (ws, _) = connect_async(self.config.boot_node.as_str()).await.map_err(|e| {
            TransportError::Connect { uri: self.config.boot_node.clone(), reason: e.to_string() }
        })?;
        let (sink, stream) = ws.split();
        let sender = spawn_writer(sink, self.config.boot_node.clone());
        self.registry.lock().insert_relay(target_uri, sender.clone());

        // Make sure the boot node knows our URI before we relay through it.
        let register = Envelope::new(MessageKind::RegisterPeer, &self.my_uri, &self.my_uri)
            .map_err(|e| TransportError::Send {
                uri: self.config.boot_node.clone(),
                reason: e.to_string(),
            })?;
        let frame = register.encode().map_err(|e| TransportError::Send {
            uri: self.config.boot_node.clone(),
            reason: e.to_string(),
        })?;
        sender.send(Message::Binary(frame)).map_err(|e| TransportError::Send {
            uri: self.config.boot_node.clone(),
            reason: e.to_string(),
        })?;

        let engine = self.clone();
        let target = target_uri.to_string();
        let boot_sender = sender.clone();
        let fut: std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> =
            Box::pin(async move { engine.relay_read_loop(stream, target, boot_sender).await });
        tokio::spawn(fut);

        info!(peer = %target_uri, "relay session established via boot node");
        Ok(sender)
    }

    /// Read frames the boot node forwards for a relay target.
    async fn relay_read_loop<S>(
        self: Arc<Self>,
        mut stream: SplitStream<WebSocketStream<S>>,
        target_uri: String,
        boot_sender: FrameSender,
    ) where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut shutdown = self.shutdown_rx();
        loop {
            let message = tokio::select! {
                _ = shutdown.recv() => break,
                frame = stream.next() => match frame {
                    Some(Ok(message)) => message,
                    Some(Err(e)) => {
                        warn!(peer = %target_uri, "relay read error: {e}");
                        break;
                    }
                    None => break,
                }
            };

            let env = match &message {
                Message::Binary(bytes) => Envelope::decode_binary(bytes),
                Message::Text(text) => Envelope::decode_text(text),
                _ => continue,
            };
            let env = match env {
                Ok(env) => env,
                Err(e) => {
                    warn!(peer = %target_uri, "refusing malformed relay frame: {e}");
                    continue;
                }
            };

            if env.kind == MessageKind::RelayFailure {
                match env.payload::<RelayFailurePayload>() {
                    Ok(failure) if failure.target_uri == target_uri => {
                        warn!(peer = %target_uri, reason = %failure.reason, "relay failure");
                        let mut registry = self.registry.lock();
                        registry.record_failure(&target_uri);
                        registry.remove_peer(&target_uri);
                        return;
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        warn!("malformed relay failure: {e}");
                        continue;
                    }
                }
            }

            // Boot-to-target delivery hands us the decoded original frame;
            // process it as if it came from the peer itself.
            let link = PeerLink::relay(&target_uri, boot_sender.clone(), &self.my_uri);
            self.dispatch(env, &link).await;
        }
        self.registry.lock().remove_relay(&target_uri);
    }

    /// Register with the boot node and keep consuming its peer lists.
    /// Bounded retries with exponential backoff.
    pub async fn register_with_boot(self: Arc<Self>) {
        if self.my_uri == self.config.boot_node {
            return;
        }
        for attempt in 0..self.config.max_boot_retries {
            match connect_async(self.config.boot_node.as_str()).await {
                Ok((ws, _)) => {
                    info!(boot = %self.config.boot_node, "connected to boot node");
                    let (sink, stream) = ws.split();
                    let sender = spawn_writer(sink, self.config.boot_node.clone());
                    if let Ok(env) =
                        Envelope::new(MessageKind::RegisterPeer, &self.my_uri, &self.node_id)
                    {
                        if let Ok(frame) = env.encode() {
                            let _ = sender.send(Message::Binary(frame));
                        }
                    }
                    let link = PeerLink::direct(&self.config.boot_node, sender, &self.my_uri);
                    self.read_loop(stream, &link).await;
                    return;
                }
                Err(e) => {
                    error!(boot = %self.config.boot_node, attempt = attempt + 1, "boot connect failed: {e}");
                    let backoff = self.config.boot_backoff_secs << attempt;
                    tokio::time::sleep(Duration::from_secs(backoff)).await;
                }
            }
        }
        error!(boot = %self.config.boot_node, "unable to register with boot node");
    }

    // ------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------

    /// Send to one peer: direct if connected, otherwise via relay.
    pub(crate) async fn send_to(self: &Arc<Self>, uri: &str, env: &Envelope) -> Result<(), TransportError> {
        let direct = self.registry.lock().direct_sender(uri);
        if let Some(sender) = direct {
            let link = PeerLink::direct(uri, sender, &self.my_uri);
            if link.send(env).is_ok() {
                return Ok(());
            }
        }
        let sender = self.ensure_relay_connection(uri).await?;
        PeerLink::relay(uri, sender, &self.my_uri).send(env)
    }

    /// Broadcast to every peer except `exclude`. Direct sends that fail are
    /// retried over relay; peers whose relay also fails are removed.
    pub async fn broadcast(self: &Arc<Self>, env: &Envelope, exclude: Option<&str>) {
        let snapshot = self.registry.lock().snapshot_direct();
        let mut relay_needed: Vec<String> = Vec::new();

        for (uri, sender) in snapshot {
            if Some(uri.as_str()) == exclude {
                continue;
            }
            let link = PeerLink::direct(&uri, sender, &self.my_uri);
            match link.send(env) {
                Ok(()) => self.registry.lock().record_success(&uri),
                Err(e) => {
                    warn!(peer = %uri, "direct send failed, will try relay: {e}");
                    relay_needed.push(uri);
                }
            }
        }

        for uri in self.registry.lock().relay_uris() {
            if Some(uri.as_str()) != exclude && !relay_needed.contains(&uri) {
                relay_needed.push(uri);
            }
        }

        let mut failed: Vec<String> = Vec::new();
        for uri in relay_needed {
            match self.relay_send(&uri, env).await {
                Ok(()) => self.registry.lock().record_success(&uri),
                Err(e) => {
                    error!(peer = %uri, "relay send failed: {e}");
                    failed.push(uri);
                }
            }
        }

        let mut registry = self.registry.lock();
        for uri in failed {
            registry.record_failure(&uri);
            registry.remove_peer(&uri);
        }
    }

    async fn relay_send(self: &Arc<Self>, uri: &str, env: &Envelope) -> Result<(), TransportError> {
        let sender = self.ensure_relay_connection(uri).await?;
        PeerLink::relay(uri, sender, &self.my_uri).send(env)
    }

    /// Correlated request: send `kind` to `uri` and await the matching
    /// response tag, bounded by the configured response timeout.
    pub(crate) async fn request(
        self: &Arc<Self>,
        uri: &str,
        kind: MessageKind,
        data: Value,
        expect: MessageKind,
    ) -> Result<Value, TransportError> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert((uri.to_string(), expect), tx);

        let env = Envelope { kind, data, from: self.node_id.clone() };
        if let Err(e) = self.send_to(uri, &env).await {
            self.pending.lock().remove(&(uri.to_string(), expect));
            return Err(e);
        }

        let timeout = Duration::from_secs(self.config.response_timeout_secs);
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(value)) => Ok(value),
            _ => {
                self.pending.lock().remove(&(uri.to_string(), expect));
                Err(TransportError::Timeout { uri: uri.to_string(), what: expect.to_string() })
            }
        }
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    /// Route one envelope. Correlated responses complete their pending slot;
    /// everything else goes to the protocol handlers.
    pub async fn dispatch(self: &Arc<Self>, env: Envelope, link: &PeerLink) {
        debug!(peer = %link.uri, kind = %env.kind, "message received");

        if matches!(
            env.kind,
            MessageKind::ResponseChainLength
                | MessageKind::ResponseBlocks
                | MessageKind::ResponseChain
                | MessageKind::ResponseTxPool
                | MessageKind::ResponseTx
        ) {
            let slot = self.pending.lock().remove(&(link.uri.clone(), env.kind));
            if let Some(tx) = slot {
                let _ = tx.send(env.data);
                return;
            }
        }

        let result = match env.kind {
            MessageKind::NewBlock => self.on_new_block(&env, link).await,
            MessageKind::NewTx => self.on_new_tx(&env, link).await,
            MessageKind::RequestChain => self.on_request_chain(link),
            MessageKind::ResponseChain => self.on_response_chain(&env).await,
            MessageKind::RequestChainLength => self.on_request_chain_length(link),
            MessageKind::ResponseChainLength => self.on_response_chain_length(&env).await,
            MessageKind::RequestBlocks => self.on_request_blocks(&env, link),
            MessageKind::ResponseBlocks => self.on_response_blocks(&env, link).await,
            MessageKind::RequestTxPool => self.on_request_tx_pool(link),
            MessageKind::ResponseTxPool => self.on_response_tx_pool(&env).await,
            MessageKind::RequestTx => self.on_request_tx(&env, link),
            MessageKind::ResponseTx => self.on_response_tx(&env, link).await,
            MessageKind::PeerList => self.on_peer_list(&env),
            MessageKind::RelayFailure => self.on_relay_failure(&env),
            MessageKind::RegisterPeer | MessageKind::RelayMessage => {
                Err(ProtocolError::UnknownTag(format!("{} is boot-node-only", env.kind)))
            }
        };
        if let Err(e) = result {
            warn!(peer = %link.uri, kind = %env.kind, "handler refused frame: {e}");
        }
    }

    // --- Gossip: blocks ---

    async fn on_new_block(self: &Arc<Self>, env: &Envelope, link: &PeerLink) -> Result<(), ProtocolError> {
        let block: Block = env.payload()?;
        self.process_new_block(block, link).await;
        Ok(())
    }

    /// Handle a gossiped block: append when it extends the tip, defer when a
    /// referenced transaction is unknown, trigger a full sync when the peer
    /// is further ahead.
    fn process_new_block<'a>(
        self: &'a Arc<Self>,
        block: Block,
        link: &'a PeerLink,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'a>> {
        Box::pin(self.process_new_block_inner(block, link))
    }

    async fn process_new_block_inner(self: &Arc<Self>, block: Block, link: &PeerLink) {
        let (tip_hash, tip_height) = {
            let chain = self.ctx.blockchain.read();
            (chain.tip().hash.clone(), chain.tip().height)
        };

        if block.hash == tip_hash {
            debug!(peer = %link.uri, "duplicate block, skipping");
            return;
        }
        if block.last_hash != tip_hash {
            if block.height > tip_height + 1 && !self.syncing_chain.load(Ordering::SeqCst) {
                info!(peer = %link.uri, height = block.height, "peer is ahead, starting sync");
                let engine = self.clone();
                let fut: std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> =
                    Box::pin(async move { sync::sync_with_peers(engine).await });
                tokio::spawn(fut);
            } else {
                debug!(peer = %link.uri, height = block.height, "stale block ignored");
            }
            return;
        }

        // Defer the block until any unknown referenced transaction arrives.
        let missing = {
            let chain = self.ctx.blockchain.read();
            let pool = self.ctx.mempool.lock();
            find_missing_prev_tx(&block, chain.utxo_set(), pool.transactions())
        };
        if let Some(tx_id) = missing {
            info!(peer = %link.uri, %tx_id, "block references unknown transaction, requesting");
            if let Ok(request) = Envelope::new(MessageKind::RequestTx, &tx_id, &self.node_id) {
                let _ = link.send(&request);
            }
            self.deferred_blocks.lock().insert(tx_id, (block, link.clone()));
            return;
        }

        match self.accept_block(&block) {
            Ok(()) => {
                info!(height = block.height, hash = %block.hash, "accepted gossiped block");
                if let Ok(env) = Envelope::new(MessageKind::NewBlock, &block, &self.node_id) {
                    self.broadcast(&env, Some(&link.uri)).await;
                }
            }
            Err(e) => warn!(peer = %link.uri, "rejected gossiped block: {e}"),
        }
    }

    /// Single-block append path: validate against the tip, persist, and
    /// prune the mempool of its transactions.
    pub fn accept_block(&self, block: &Block) -> Result<(), ChainError> {
        self.ctx.blockchain.write().append_block(block.clone())?;
        if let Err(e) = self.ctx.store.append_or_replace(block) {
            error!(height = block.height, "failed to persist block: {e}");
        }
        self.ctx
            .mempool
            .lock()
            .clear_chain_transactions(std::slice::from_ref(block));
        Ok(())
    }

    // --- Gossip: transactions ---

    async fn on_new_tx(self: &Arc<Self>, env: &Envelope, link: &PeerLink) -> Result<(), ProtocolError> {
        let tx: Transaction = env.payload()?;
        let tx_id = tx.id.clone();

        let known_timestamp = self.ctx.mempool.lock().get(&tx_id).map(|t| t.input.timestamp());
        match known_timestamp {
            Some(existing) if tx.input.timestamp() <= existing => {
                // Idempotent: seen and not newer, no rebroadcast.
                return Ok(());
            }
            Some(_) => {
                let outcome = self.ctx.mempool.lock().set(tx.clone());
                match outcome {
                    Ok(SetOutcome::Replaced) => {
                        debug!(%tx_id, "replaced mempool entry with newer timestamp");
                        if let Ok(env) = Envelope::new(MessageKind::NewTx, &tx, &self.node_id) {
                            self.broadcast(&env, Some(&link.uri)).await;
                        }
                    }
                    Ok(_) => {}
                    Err(e) => warn!(%tx_id, "rejected replacement transaction: {e}"),
                }
            }
            None => {
                if self.processed_transactions.lock().contains(&tx_id) {
                    return Ok(());
                }
                let valid = {
                    let chain = self.ctx.blockchain.read();
                    let pool = self.ctx.mempool.lock();
                    tx.validate_against(chain.utxo_set(), pool.transactions())
                };
                if let Err(e) = valid {
                    warn!(%tx_id, peer = %link.uri, "rejected gossiped transaction: {e}");
                    return Ok(());
                }
                if let Err(e) = self.ctx.mempool.lock().set(tx.clone()) {
                    warn!(%tx_id, "mempool refused transaction: {e}");
                    return Ok(());
                }
                self.processed_transactions.lock().insert(tx_id.clone());
                debug!(%tx_id, "added gossiped transaction");
                if let Ok(env) = Envelope::new(MessageKind::NewTx, &tx, &self.node_id) {
                    self.broadcast(&env, Some(&link.uri)).await;
                }
            }
        }

        self.maybe_reconcile_tx_pool().await;
        Ok(())
    }

    // --- Chain queries ---

    fn on_request_chain(&self, link: &PeerLink) -> Result<(), ProtocolError> {
        let chain = self.ctx.blockchain.read().chain().to_vec();
        let env = Envelope::new(MessageKind::ResponseChain, &chain, &self.node_id)?;
        if let Err(e) = link.send(&env) {
            warn!(peer = %link.uri, "failed to send chain: {e}");
        }
        Ok(())
    }

    async fn on_response_chain(self: &Arc<Self>, env: &Envelope) -> Result<(), ProtocolError> {
        let blocks: Vec<Block> = env.payload()?;
        if self.syncing_chain.swap(true, Ordering::SeqCst) {
            debug!("chain sync already in progress, dropping chain response");
            return Ok(());
        }

        let result = self.install_chain(blocks);
        self.syncing_chain.store(false, Ordering::SeqCst);

        match result {
            Ok(height) => {
                info!(height, "replaced chain from peer response");
                self.maybe_reconcile_tx_pool().await;
            }
            Err(ChainError::NotLonger { candidate, current }) => {
                debug!(candidate, current, "received chain not longer");
                if candidate == current {
                    // Equal length is a mempool reconciliation trigger only.
                    self.maybe_reconcile_tx_pool().await;
                }
            }
            Err(e) => warn!("failed to replace chain: {e}"),
        }
        Ok(())
    }

    /// Replace the chain, persist every block, and prune the mempool.
    /// Returns the new height.
    pub(crate) fn install_chain(&self, blocks: Vec<Block>) -> Result<u64, ChainError> {
        let persist = blocks.clone();
        let mut chain = self.ctx.blockchain.write();
        chain.replace_chain(blocks)?;
        for block in &persist {
            if let Err(e) = self.ctx.store.append_or_replace(block) {
                error!(height = block.height, "failed to persist block: {e}");
            }
        }
        self.ctx.mempool.lock().clear_chain_transactions(chain.chain());
        Ok(chain.current_height())
    }

    fn on_request_chain_length(&self, link: &PeerLink) -> Result<(), ProtocolError> {
        let length = self.ctx.blockchain.read().len() as u64;
        let env = Envelope::new(MessageKind::ResponseChainLength, &length, &self.node_id)?;
        if let Err(e) = link.send(&env) {
            warn!(peer = %link.uri, "failed to send chain length: {e}");
        }
        Ok(())
    }

    async fn on_response_chain_length(self: &Arc<Self>, env: &Envelope) -> Result<(), ProtocolError> {
        let peer_length: u64 = env.payload()?;
        let local_length = self.ctx.blockchain.read().len() as u64;

        if peer_length > local_length && !self.syncing_chain.load(Ordering::SeqCst) {
            info!(peer_length, local_length, "longer chain observed, starting sync");
            let engine = self.clone();
            tokio::spawn(async move { sync::sync_with_peers(engine).await });
        } else if peer_length == local_length {
            self.maybe_reconcile_tx_pool().await;
        }
        Ok(())
    }

    // --- Chunked block transfer ---

    fn on_request_blocks(&self, env: &Envelope, link: &PeerLink) -> Result<(), ProtocolError> {
        let start_height: u64 = env.payload()?;
        let chain = self.ctx.blockchain.read();
        let len = chain.len() as u64;

        let blocks: Vec<Block> = if self.registry.lock().direct_count() <= 1 {
            // Single known peer: ship the whole chain minus genesis; the
            // recipient's genesis is implicit.
            chain.chain()[1..].to_vec()
        } else {
            let start = start_height.min(len) as usize;
            let end = (start_height + self.chunk.lock().size()).min(len) as usize;
            chain.chain()[start..end].to_vec()
        };
        drop(chain);

        let env = Envelope::new(MessageKind::ResponseBlocks, &blocks, &self.node_id)?;
        if let Err(e) = link.send(&env) {
            warn!(peer = %link.uri, "failed to send blocks: {e}");
        }
        Ok(())
    }

    async fn on_response_blocks(self: &Arc<Self>, env: &Envelope, link: &PeerLink) -> Result<(), ProtocolError> {
        let blocks: Vec<Block> = env.payload()?;
        let outcome = if blocks.is_empty() {
            Err("empty block response".to_string())
        } else {
            let candidate = {
                let chain = self.ctx.blockchain.read();
                if blocks[0].height != chain.current_height() + 1 {
                    debug!(got = blocks[0].height, "ignoring blocks that do not extend the tip");
                    self.syncing_chain.store(false, Ordering::SeqCst);
                    return Ok(());
                }
                let mut candidate = chain.chain().to_vec();
                candidate.extend(blocks);
                candidate
            };
            self.install_chain(candidate).map_err(|e| e.to_string())
        };

        match outcome {
            Ok(height) => {
                info!(height, peer = %link.uri, "extended chain with received blocks");
                {
                    let mut registry = self.registry.lock();
                    registry.record_success(&link.uri);
                }
                self.chunk.lock().grow();
                self.maybe_reconcile_tx_pool().await;
            }
            Err(e) => {
                warn!(peer = %link.uri, "failed to apply received blocks: {e}");
                self.registry.lock().record_failure(&link.uri);
                self.chunk.lock().shrink();
            }
        }
        self.syncing_chain.store(false, Ordering::SeqCst);
        Ok(())
    }

    // --- Mempool reconciliation ---

    fn on_request_tx_pool(&self, link: &PeerLink) -> Result<(), ProtocolError> {
        let txs: Vec<Transaction> = {
            let pool = self.ctx.mempool.lock();
            pool.transactions().values().cloned().collect()
        };
        let env = Envelope::new(MessageKind::ResponseTxPool, &txs, &self.node_id)?;
        if let Err(e) = link.send(&env) {
            warn!(peer = %link.uri, "failed to send tx pool: {e}");
        }
        Ok(())
    }

    async fn on_response_tx_pool(self: &Arc<Self>, env: &Envelope) -> Result<(), ProtocolError> {
        if !self.tx_pool_syncing.load(Ordering::SeqCst) {
            debug!("ignoring tx pool response while not reconciling");
            return Ok(());
        }

        let txs: Vec<Transaction> = env.payload()?;
        let mut added = 0usize;
        {
            let mut pool = self.ctx.mempool.lock();
            let mut processed = self.processed_transactions.lock();
            for tx in txs {
                let tx_id = tx.id.clone();
                let fresh = !pool.contains(&tx_id) && !processed.contains(&tx_id);
                match pool.set(tx) {
                    Ok(SetOutcome::Inserted) if fresh => {
                        processed.insert(tx_id);
                        added += 1;
                    }
                    Ok(SetOutcome::Replaced) => added += 1,
                    Ok(_) => {}
                    Err(e) => warn!(%tx_id, "rejected pool transaction: {e}"),
                }
            }
        }
        info!(added, "mempool reconciliation round finished");

        if added == 0 {
            self.tx_pool_syncing.store(false, Ordering::SeqCst);
        } else if self.cooldown_elapsed() {
            if let Ok(env) = Envelope::new(MessageKind::RequestTxPool, &(), &self.node_id) {
                self.stamp_tx_pool_request();
                self.broadcast(&env, None).await;
            }
        }
        Ok(())
    }

    // --- Single-transaction fetch ---

    fn on_request_tx(&self, env: &Envelope, link: &PeerLink) -> Result<(), ProtocolError> {
        let tx_id: String = env.payload()?;
        let tx = self.ctx.mempool.lock().get(&tx_id).cloned();
        match tx {
            Some(tx) => {
                let env = Envelope::new(MessageKind::ResponseTx, &tx, &self.node_id)?;
                if let Err(e) = link.send(&env) {
                    warn!(peer = %link.uri, "failed to send transaction: {e}");
                }
            }
            None => warn!(%tx_id, "requested transaction not in pool"),
        }
        Ok(())
    }

    async fn on_response_tx(self: &Arc<Self>, env: &Envelope, _link: &PeerLink) -> Result<(), ProtocolError> {
        let tx: Transaction = env.payload()?;
        let tx_id = tx.id.clone();

        if let Err(e) = self.ctx.mempool.lock().set(tx) {
            warn!(%tx_id, "rejected fetched transaction: {e}");
            return Ok(());
        }
        self.processed_transactions.lock().insert(tx_id.clone());
        info!(%tx_id, "added transaction fetched from peer");

        // Resume any block that was deferred on this transaction.
        let deferred = self.deferred_blocks.lock().remove(&tx_id);
        if let Some((block, origin)) = deferred {
            info!(height = block.height, "resuming deferred block");
            self.process_new_block(block, &origin).await;
        }
        Ok(())
    }

    // --- Peer discovery and relay control ---

    fn on_peer_list(self: &Arc<Self>, env: &Envelope) -> Result<(), ProtocolError> {
        let peers: Vec<String> = env.payload()?;
        for uri in peers {
            if uri == self.my_uri || !uri.starts_with("ws://") {
                continue;
            }
            let fresh = {
                let mut registry = self.registry.lock();
                !registry.has_direct(&uri) && registry.add_known(&uri)
            };
            if fresh {
                info!(peer = %uri, "discovered peer");
                let engine = self.clone();
                tokio::spawn(async move { engine.connect_to_peer(uri).await });
            }
        }
        Ok(())
    }

    fn on_relay_failure(&self, env: &Envelope) -> Result<(), ProtocolError> {
        let failure: RelayFailurePayload = env.payload()?;
        warn!(peer = %failure.target_uri, reason = %failure.reason, "relay failure reported");
        let mut registry = self.registry.lock();
        registry.record_failure(&failure.target_uri);
        registry.remove_peer(&failure.target_uri);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Mempool reconciliation gating
    // ------------------------------------------------------------------

    fn cooldown_elapsed(&self) -> bool {
        let last = self.last_tx_pool_request.lock();
        match *last {
            Some(at) => at.elapsed().as_secs() > self.config.tx_pool_cooldown_secs,
            None => true,
        }
    }

    fn stamp_tx_pool_request(&self) {
        *self.last_tx_pool_request.lock() = Some(Instant::now());
    }

    /// Claim a reconciliation round if none is running and the cooldown has
    /// elapsed. The caller sends the REQUEST_TX_POOL.
    fn begin_tx_pool_round(&self) -> bool {
        if self.tx_pool_syncing.load(Ordering::SeqCst) || !self.cooldown_elapsed() {
            return false;
        }
        self.tx_pool_syncing.store(true, Ordering::SeqCst);
        self.stamp_tx_pool_request();
        true
    }

    /// Broadcast a mempool reconciliation request, cooldown permitting.
    pub(crate) async fn maybe_reconcile_tx_pool(self: &Arc<Self>) {
        if !self.begin_tx_pool_round() {
            return;
        }
        if let Ok(env) = Envelope::new(MessageKind::RequestTxPool, &(), &self.node_id) {
            self.broadcast(&env, None).await;
        }
    }

    // ------------------------------------------------------------------
    // Outbound gossip entry points (called by the node / API)
    // ------------------------------------------------------------------

    /// Gossip a locally accepted transaction.
    pub async fn broadcast_transaction(self: &Arc<Self>, tx: &Transaction) {
        self.processed_transactions.lock().insert(tx.id.clone());
        match Envelope::new(MessageKind::NewTx, tx, &self.node_id) {
            Ok(env) => self.broadcast(&env, None).await,
            Err(e) => error!("failed to encode transaction broadcast: {e}"),
        }
    }

    /// Gossip a locally mined block.
    pub async fn broadcast_block(self: &Arc<Self>, block: &Block) {
        match Envelope::new(MessageKind::NewBlock, block, &self.node_id) {
            Ok(env) => self.broadcast(&env, None).await,
            Err(e) => error!("failed to encode block broadcast: {e}"),
        }
    }

    pub(crate) fn syncing_flag(&self) -> &AtomicBool {
        &self.syncing_chain
    }
}

/// Spawn the writer task for a connection: pumps queued frames into the
/// sink until the channel closes or a send fails.
fn spawn_writer<S>(mut sink: SplitSink<WebSocketStream<S>, Message>, uri: String) -> FrameSender
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if let Err(e) = sink.send(message).await {
                warn!(peer = %uri, "write failed: {e}");
                break;
            }
        }
        let _ = sink.close().await;
    });
    tx
}

/// First `prev_tx_id` referenced by the block that is neither in the UTXO
/// set, the mempool, nor among the block's own transactions.
fn find_missing_prev_tx(
    block: &Block,
    utxo_set: &ember_core::blockchain::UtxoSet,
    pool: &std::collections::BTreeMap<String, Transaction>,
) -> Option<String> {
    let own_ids: HashSet<&str> = block.data.iter().map(|tx| tx.id.as_str()).collect();
    for tx in &block.data {
        if let TxInput::Spend(input) = &tx.input {
            for prev_tx_id in &input.prev_tx_ids {
                if !utxo_set.contains_key(prev_tx_id)
                    && !pool.contains_key(prev_tx_id)
                    && !own_ids.contains(prev_tx_id.as_str())
                {
                    return Some(prev_tx_id.clone());
                }
            }
        }
    }
    None
}
