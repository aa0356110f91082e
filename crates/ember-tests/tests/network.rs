//! Multi-node network tests: chain sync, gossip, and relay fallback.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;

use ember_core::block::Block;
use ember_core::blockchain::Blockchain;
use ember_core::constants::{Priority, COIN};
use ember_core::crypto::Keypair;
use ember_core::error::StorageError;
use ember_core::fee_estimator::FeeEstimator;
use ember_core::mempool::Mempool;
use ember_core::transaction::Transaction;
use ember_network::protocol::{RelayFailurePayload, RelayPayload};
use ember_network::{BlockSink, Envelope, MessageKind, NetworkConfig, NodeContext, PeerEngine};
use ember_tests::{free_port, signed_request};

/// Discards persisted blocks; the network tests only care about in-memory state.
struct NullSink;

impl BlockSink for NullSink {
    fn append_or_replace(&self, _block: &Block) -> Result<(), StorageError> {
        Ok(())
    }
}

fn context_with(chain: Blockchain) -> NodeContext {
    NodeContext {
        blockchain: Arc::new(RwLock::new(chain)),
        mempool: Arc::new(Mutex::new(Mempool::new())),
        fees: Arc::new(FeeEstimator::new()),
        store: Arc::new(NullSink),
    }
}

fn engine_with(
    port: u16,
    boot_uri: &str,
    dir: &tempfile::TempDir,
    ctx: NodeContext,
) -> Arc<PeerEngine> {
    let config = NetworkConfig {
        listen_port: port,
        boot_node: boot_uri.to_string(),
        max_connect_retries: 1,
        connect_backoff_secs: 0,
        max_boot_retries: 0,
        boot_backoff_secs: 0,
        tx_pool_cooldown_secs: 0,
        response_timeout_secs: 5,
        peers_file: dir.path().join(format!("peers-{port}.json")),
        ..NetworkConfig::default()
    };
    PeerEngine::new(config, ctx)
}

/// Mine a coinbase-only block onto the chain and return it.
fn mine_empty(chain: &mut Blockchain, miner: &str) -> Block {
    let coinbase = Transaction::coinbase(miner, chain.tip().height + 1, 0).unwrap();
    let block = Block::mine(chain.tip(), vec![coinbase]).unwrap();
    chain.append_block(block.clone()).unwrap();
    block
}

async fn wait_until(deadline_secs: u64, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(deadline_secs);
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    check()
}

// ----------------------------------------------------------------------
// Direct sync and gossip between two live nodes
// ----------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn two_nodes_sync_and_gossip() {
    let dir = tempfile::tempdir().unwrap();
    // Nothing listens on the boot port; registration is disabled (0 retries).
    let boot_uri = format!("ws://127.0.0.1:{}", free_port());

    // Node A starts at height 3 with funds for `sender`.
    let sender = Keypair::generate();
    let mut chain_a = Blockchain::new();
    mine_empty(&mut chain_a, &sender.address());
    mine_empty(&mut chain_a, "AGminer");
    mine_empty(&mut chain_a, "AGminer");

    let ctx_a = context_with(chain_a);
    let engine_a = engine_with(free_port(), &boot_uri, &dir, ctx_a.clone());
    engine_a.start();
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Node B starts at genesis and dials A.
    let ctx_b = context_with(Blockchain::new());
    let engine_b = engine_with(free_port(), &boot_uri, &dir, ctx_b.clone());
    engine_b.start();

    let a_uri = engine_a.my_uri().to_string();
    {
        let engine_b = engine_b.clone();
        tokio::spawn(async move { engine_b.connect_to_peer(a_uri).await });
    }

    // B observes A's longer chain over the handshake and syncs it.
    let synced = {
        let ctx_b = ctx_b.clone();
        wait_until(15, move || ctx_b.blockchain.read().current_height() == 3).await
    };
    assert!(synced, "node B failed to sync to height 3");
    assert_eq!(
        ctx_b.blockchain.read().tip().hash,
        ctx_a.blockchain.read().tip().hash
    );

    // Transaction gossip: B pools a spend and broadcasts it to A.
    let request = signed_request(&sender, "AGrecipient", 10 * COIN, Priority::Medium);
    let tx = {
        let chain = ctx_b.blockchain.read();
        let pool = ctx_b.mempool.lock();
        Transaction::create_spend(&request, chain.utxo_set(), pool.transactions()).unwrap()
    };
    ctx_b.mempool.lock().set(tx.clone()).unwrap();
    engine_b.broadcast_transaction(&tx).await;

    let arrived = {
        let ctx_a = ctx_a.clone();
        let tx_id = tx.id.clone();
        wait_until(10, move || ctx_a.mempool.lock().contains(&tx_id)).await
    };
    assert!(arrived, "transaction did not reach node A");

    // Block gossip: A mines the pooled transaction, B appends the block.
    let block = {
        let template = {
            let chain = ctx_a.blockchain.read();
            let coinbase =
                Transaction::coinbase("AGminer", chain.tip().height + 1, tx.fee).unwrap();
            vec![coinbase, tx.clone()]
        };
        let tip = ctx_a.blockchain.read().tip().clone();
        let block = Block::mine(&tip, template).unwrap();
        ctx_a.blockchain.write().append_block(block.clone()).unwrap();
        ctx_a.mempool.lock().clear_chain_transactions(std::slice::from_ref(&block));
        block
    };
    engine_a.broadcast_block(&block).await;

    let appended = {
        let ctx_b = ctx_b.clone();
        wait_until(10, move || ctx_b.blockchain.read().current_height() == 4).await
    };
    assert!(appended, "node B did not append the gossiped block");
    // The confirmed transaction is pruned from B's pool.
    assert!(!ctx_b.mempool.lock().contains(&tx.id));

    engine_a.shutdown();
    engine_b.shutdown();
}

// ----------------------------------------------------------------------
// Relay fallback and RELAY_FAILURE handling
// ----------------------------------------------------------------------

/// A minimal boot-node stand-in: answers registrations with an empty peer
/// list and every relay request with RELAY_FAILURE.
async fn run_boot_stub(listener: tokio::net::TcpListener) {
    loop {
        let Ok((stream, _)) = listener.accept().await else { return };
        tokio::spawn(async move {
            let Ok(ws) = tokio_tungstenite::accept_async(stream).await else { return };
            let (mut sink, mut stream) = ws.split();
            while let Some(Ok(message)) = stream.next().await {
                let env = match &message {
                    Message::Binary(bytes) => Envelope::decode_binary(bytes).ok(),
                    Message::Text(text) => Envelope::decode_text(text).ok(),
                    _ => None,
                };
                let Some(env) = env else { continue };
                let reply = match env.kind {
                    MessageKind::RegisterPeer => {
                        Envelope::new(MessageKind::PeerList, &Vec::<String>::new(), "boot").unwrap()
                    }
                    MessageKind::RelayMessage => {
                        let payload: RelayPayload = env.payload().unwrap();
                        Envelope::new(
                            MessageKind::RelayFailure,
                            &RelayFailurePayload {
                                target_uri: payload.target_uri,
                                reason: "target not connected".to_string(),
                            },
                            "boot",
                        )
                        .unwrap()
                    }
                    _ => continue,
                };
                let _ = sink.send(Message::Binary(reply.encode().unwrap())).await;
            }
        });
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn relay_failure_removes_peer() {
    let boot_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let boot_uri = format!("ws://{}", boot_listener.local_addr().unwrap());
    tokio::spawn(run_boot_stub(boot_listener));

    let dir = tempfile::tempdir().unwrap();
    let engine = engine_with(free_port(), &boot_uri, &dir, context_with(Blockchain::new()));

    // Nothing listens on the target: direct retries exhaust and the engine
    // falls back to relaying REQUEST_CHAIN_LENGTH through the boot node,
    // which reports the target unreachable.
    let dead_peer = format!("ws://127.0.0.1:{}", free_port());
    engine.clone().connect_to_peer(dead_peer.clone()).await;

    let removed = {
        let engine = engine.clone();
        let dead = dead_peer.clone();
        wait_until(10, move || {
            engine.peer_failures(&dead) >= 1 && !engine.peer_uris().contains(&dead)
        })
        .await
    };
    assert!(removed, "relay failure did not remove the peer");
    assert!(engine.peer_failures(&dead_peer) >= 1);
    assert!(!engine.is_known_peer(&dead_peer));

    engine.shutdown();
}
