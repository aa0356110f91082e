//! Full node composition and lifecycle.
//!
//! [`Node`] wires the chain, mempool, fee estimator, block store, and peer
//! engine together. On startup the block store is replayed: the persisted
//! chain is installed when valid, otherwise the node falls back to a
//! genesis-only chain. Mining runs on a blocking worker so the event loop
//! stays responsive.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use ember_core::block::Block;
use ember_core::blockchain::Blockchain;
use ember_core::constants::{BLOCK_SIZE_LIMIT, FEE_RATE_UPDATE_INTERVAL_SECS};
use ember_core::error::{
    BlockError, ChainError, EmberError, StorageError, TransactionError,
};
use ember_core::fee_estimator::{FeeEstimator, FULLNESS_WINDOW};
use ember_core::mempool::Mempool;
use ember_core::transaction::{SpendRequest, Transaction};
use ember_network::{NodeContext, PeerEngine};

use crate::config::NodeConfig;
use crate::storage::BlockStore;

/// Node-level errors: consensus failures plus operational faults.
#[derive(Error, Debug)]
pub enum NodeError {
    #[error(transparent)]
    Ember(#[from] EmberError),
    #[error("internal: {0}")]
    Internal(String),
}

impl From<TransactionError> for NodeError {
    fn from(e: TransactionError) -> Self {
        NodeError::Ember(e.into())
    }
}

impl From<BlockError> for NodeError {
    fn from(e: BlockError) -> Self {
        NodeError::Ember(e.into())
    }
}

impl From<ChainError> for NodeError {
    fn from(e: ChainError) -> Self {
        NodeError::Ember(e.into())
    }
}

impl From<StorageError> for NodeError {
    fn from(e: StorageError) -> Self {
        NodeError::Ember(e.into())
    }
}

/// Result of mining one block.
#[derive(Debug, Clone)]
pub struct MineOutcome {
    pub block: Block,
    /// Coinbase value paid to the miner (subsidy + fees), in micro-coins.
    pub reward: u64,
    /// The miner's confirmed balance after the block, in micro-coins.
    pub balance: u64,
}

/// The running node: shared state plus the peer engine.
pub struct Node {
    config: NodeConfig,
    blockchain: Arc<RwLock<Blockchain>>,
    mempool: Arc<Mutex<Mempool>>,
    fees: Arc<FeeEstimator>,
    store: Arc<BlockStore>,
    engine: Arc<PeerEngine>,
    shutdown: broadcast::Sender<()>,
}

impl Node {
    /// Open the block store, replay it into memory, and assemble the node.
    pub fn new(config: NodeConfig) -> Result<Arc<Self>, NodeError> {
        std::fs::create_dir_all(&config.data_dir)
            .map_err(|e| NodeError::Internal(format!("cannot create data dir: {e}")))?;

        let store = Arc::new(BlockStore::open(config.db_path())?);
        let blockchain = Arc::new(RwLock::new(load_chain(&store)));
        let mempool = Arc::new(Mutex::new(Mempool::new()));
        let fees = Arc::new(FeeEstimator::new());

        let ctx = NodeContext {
            blockchain: blockchain.clone(),
            mempool: mempool.clone(),
            fees: fees.clone(),
            store: store.clone(),
        };
        let engine = PeerEngine::new(config.network_config(), ctx);

        let (shutdown, _) = broadcast::channel(1);
        Ok(Arc::new(Self { config, blockchain, mempool, fees, store, engine, shutdown }))
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn blockchain(&self) -> &Arc<RwLock<Blockchain>> {
        &self.blockchain
    }

    pub fn mempool(&self) -> &Arc<Mutex<Mempool>> {
        &self.mempool
    }

    pub fn fees(&self) -> &Arc<FeeEstimator> {
        &self.fees
    }

    pub fn engine(&self) -> &Arc<PeerEngine> {
        &self.engine
    }

    /// Launch the peer engine and the fee-rate refresh timer.
    pub fn start(self: &Arc<Self>) {
        self.engine.start();

        let node = self.clone();
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_secs(FEE_RATE_UPDATE_INTERVAL_SECS));
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = interval.tick() => node.refresh_fee_rate(),
                }
            }
        });
        info!(api = %self.config.api_addr(), "node started");
    }

    /// Stop background tasks and flush the store.
    pub fn stop(&self) {
        let _ = self.shutdown.send(());
        self.engine.shutdown();
        if let Err(e) = self.store.flush() {
            error!("failed to flush block store: {e}");
        }
        info!("node stopped");
    }

    /// Recompute the advisory fee rate from current state.
    pub fn refresh_fee_rate(&self) {
        let mempool_size = self.mempool.lock().len();
        let recent: Vec<Block> = {
            let chain = self.blockchain.read();
            chain.recent_blocks(FULLNESS_WINDOW).to_vec()
        };
        self.fees.update(mempool_size, &recent);
    }

    /// Mine the next block for `miner_address`: fill the template from the
    /// mempool by fee priority, run proof-of-work on a blocking worker,
    /// append, persist, prune the mempool, and gossip the block.
    pub async fn mine(&self, miner_address: &str) -> Result<MineOutcome, NodeError> {
        let (tip, template) = {
            let chain = self.blockchain.read();
            let pool = self.mempool.lock();
            (chain.tip().clone(), assemble_template(&pool, miner_address, chain.tip().height + 1)?)
        };

        let mined = tokio::task::spawn_blocking(move || Block::mine(&tip, template))
            .await
            .map_err(|e| NodeError::Internal(format!("mining task failed: {e}")))??;

        self.blockchain.write().append_block(mined.clone())?;
        self.store.append_block(&mined)?;
        self.mempool.lock().clear_chain_transactions(std::slice::from_ref(&mined));

        let reward = mined.coinbase().map(|tx| tx.total_output()).unwrap_or(0);
        let balance = self.blockchain.read().balance(miner_address);
        info!(height = mined.height, hash = %mined.hash, "mined block");

        self.engine.broadcast_block(&mined).await;
        Ok(MineOutcome { block: mined, reward, balance })
    }

    /// Assemble, validate, pool, and gossip a spend submitted via the API.
    pub async fn submit_transaction(&self, request: SpendRequest) -> Result<Transaction, NodeError> {
        let tx = {
            let chain = self.blockchain.read();
            let pool = self.mempool.lock();
            Transaction::create_spend(&request, chain.utxo_set(), pool.transactions())?
        };
        self.mempool.lock().set(tx.clone())?;
        info!(tx_id = %tx.id, "transaction accepted");

        self.engine.broadcast_transaction(&tx).await;
        Ok(tx)
    }

    /// Confirmed balance and pending spends for an address.
    pub fn wallet_info(&self, address: &str) -> (u64, u64) {
        let balance = self.blockchain.read().balance(address);
        let pending = self.mempool.lock().pending_spends(address);
        (balance, pending)
    }
}

/// Replay the block store into an in-memory chain, falling back to
/// genesis-only when the persisted chain does not validate.
fn load_chain(store: &BlockStore) -> Blockchain {
    let mut chain = Blockchain::new();
    match store.load_all() {
        Ok(stored) if stored.len() > 1 => match chain.replace_chain(stored) {
            Ok(()) => info!(height = chain.current_height(), "chain loaded from store"),
            Err(e) => warn!("stored chain rejected, starting from genesis: {e}"),
        },
        Ok(_) => info!("block store holds genesis only"),
        Err(e) => warn!("failed to read block store, starting from genesis: {e}"),
    }
    chain
}

/// Build a block template: coinbase first, then mempool transactions by
/// descending fee rate until the size limit is reached.
fn assemble_template(
    pool: &Mempool,
    miner_address: &str,
    height: u64,
) -> Result<Vec<Transaction>, TransactionError> {
    let mut selected = Vec::new();
    let mut total_size: u64 = 0;
    let mut total_fees: u64 = 0;

    for tx in pool.priority_transactions() {
        if total_size + tx.size > BLOCK_SIZE_LIMIT as u64 {
            continue;
        }
        total_size += tx.size;
        total_fees += tx.fee;
        selected.push(tx);
    }

    let mut template = vec![Transaction::coinbase(miner_address, height, total_fees)?];
    template.extend(selected);
    Ok(template)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_core::constants::{Priority, COIN, MIN_FEE};
    use ember_core::crypto::Keypair;
    use ember_core::genesis;

    fn test_config(dir: &tempfile::TempDir) -> NodeConfig {
        NodeConfig {
            data_dir: dir.path().to_path_buf(),
            ..NodeConfig::default()
        }
    }

    fn signed_request(kp: &Keypair, recipient: &str, amount: u64) -> SpendRequest {
        SpendRequest {
            address: kp.address(),
            public_key: kp.public_key_hex(),
            signature: kp.sign_spend(recipient, amount, Priority::Medium).unwrap(),
            recipient: recipient.to_string(),
            amount,
            priority: Priority::Medium,
        }
    }

    #[tokio::test]
    async fn fresh_node_starts_at_genesis() {
        let dir = tempfile::tempdir().unwrap();
        let node = Node::new(test_config(&dir)).unwrap();
        assert_eq!(node.blockchain().read().current_height(), 0);
        assert_eq!(
            node.blockchain().read().chain()[0],
            *genesis::genesis_block()
        );
    }

    #[tokio::test]
    async fn mine_pays_miner_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let node = Node::new(test_config(&dir)).unwrap();
        let kp = Keypair::generate();

        let outcome = node.mine(&kp.address()).await.unwrap();
        assert_eq!(outcome.block.height, 1);
        assert_eq!(outcome.reward, 50 * COIN);
        assert_eq!(outcome.balance, 50 * COIN);

        // Persisted: a rebuilt node resumes at height 1.
        node.stop();
        drop(node);
        let node = Node::new(test_config(&dir)).unwrap();
        assert_eq!(node.blockchain().read().current_height(), 1);
    }

    #[tokio::test]
    async fn submit_then_mine_confirms_transaction() {
        let dir = tempfile::tempdir().unwrap();
        let node = Node::new(test_config(&dir)).unwrap();
        let kp = Keypair::generate();
        node.mine(&kp.address()).await.unwrap();

        let tx = node
            .submit_transaction(signed_request(&kp, "AGrecipient", 10 * COIN))
            .await
            .unwrap();
        assert_eq!(node.mempool().lock().len(), 1);
        assert_eq!(tx.fee, MIN_FEE);

        let outcome = node.mine("AGotherminer").await.unwrap();
        // Coinbase + the submitted spend.
        assert_eq!(outcome.block.data.len(), 2);
        assert_eq!(outcome.reward, 50 * COIN + MIN_FEE);
        assert!(node.mempool().lock().is_empty());

        let (balance, pending) = node.wallet_info(&kp.address());
        assert_eq!(balance, 39_999_000);
        assert_eq!(pending, 0);
    }

    #[tokio::test]
    async fn submit_rejects_insufficient_funds() {
        let dir = tempfile::tempdir().unwrap();
        let node = Node::new(test_config(&dir)).unwrap();
        let kp = Keypair::generate();

        let err = node
            .submit_transaction(signed_request(&kp, "AGrecipient", 10 * COIN))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            NodeError::Ember(EmberError::Transaction(TransactionError::InsufficientFunds { .. }))
        ));
    }

    #[tokio::test]
    async fn double_submit_rejected_against_pool() {
        let dir = tempfile::tempdir().unwrap();
        let node = Node::new(test_config(&dir)).unwrap();
        let kp = Keypair::generate();
        node.mine(&kp.address()).await.unwrap();

        node.submit_transaction(signed_request(&kp, "AGrecipient", 30 * COIN))
            .await
            .unwrap();
        // Remaining spendable is below 30 EMB now.
        let err = node
            .submit_transaction(signed_request(&kp, "AGother", 30 * COIN))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            NodeError::Ember(EmberError::Transaction(TransactionError::InsufficientFunds { .. }))
        ));
    }

    #[tokio::test]
    async fn wallet_info_reports_pending() {
        let dir = tempfile::tempdir().unwrap();
        let node = Node::new(test_config(&dir)).unwrap();
        let kp = Keypair::generate();
        node.mine(&kp.address()).await.unwrap();

        node.submit_transaction(signed_request(&kp, "AGrecipient", 10 * COIN))
            .await
            .unwrap();
        let (balance, pending) = node.wallet_info(&kp.address());
        assert_eq!(balance, 50 * COIN);
        assert_eq!(pending, 10 * COIN + MIN_FEE);
    }

    #[tokio::test]
    async fn refresh_fee_rate_runs() {
        let dir = tempfile::tempdir().unwrap();
        let node = Node::new(test_config(&dir)).unwrap();
        node.refresh_fee_rate();
        assert!(node.fees().current_rate() >= ember_core::constants::DEFAULT_FEE_RATE);
    }
}
