//! RocksDB-backed durable block store.
//!
//! A single ordered log keyed by big-endian height, one row per accepted
//! block, serialized as canonical JSON. `append_or_replace` overwrites the
//! row at the block's height, so replaying after a chain replacement keeps
//! the log consistent. On first open the genesis block is written.

use std::path::Path;

use rocksdb::{IteratorMode, Options, DB};
use tracing::{debug, info};

use ember_core::block::Block;
use ember_core::error::StorageError;
use ember_core::genesis;
use ember_network::BlockSink;

/// Durable, height-keyed block log.
pub struct BlockStore {
    db: DB,
}

impl BlockStore {
    /// Open or create the store at `path`. Writes genesis if empty.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        let db = DB::open(&opts, path.as_ref())
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        let store = Self { db };

        if store.count()? == 0 {
            store.append_block(genesis::genesis_block())?;
            info!("empty block store, wrote genesis");
        }
        Ok(store)
    }

    fn height_key(height: u64) -> [u8; 8] {
        height.to_be_bytes()
    }

    /// Insert or overwrite the row at the block's height.
    pub fn append_block(&self, block: &Block) -> Result<(), StorageError> {
        let value =
            serde_json::to_vec(block).map_err(|e| StorageError::Backend(e.to_string()))?;
        self.db
            .put(Self::height_key(block.height), value)
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        debug!(height = block.height, "block persisted");
        Ok(())
    }

    /// All stored blocks, ordered by height.
    pub fn load_all(&self) -> Result<Vec<Block>, StorageError> {
        let mut blocks = Vec::new();
        for entry in self.db.iterator(IteratorMode::Start) {
            let (key, value) = entry.map_err(|e| StorageError::Backend(e.to_string()))?;
            let height = match <[u8; 8]>::try_from(key.as_ref()) {
                Ok(bytes) => u64::from_be_bytes(bytes),
                Err(_) => {
                    return Err(StorageError::Backend(format!(
                        "unexpected key of length {}",
                        key.len()
                    )))
                }
            };
            let block: Block = serde_json::from_slice(&value).map_err(|e| {
                StorageError::CorruptRow { height, reason: e.to_string() }
            })?;
            blocks.push(block);
        }
        Ok(blocks)
    }

    /// Number of stored blocks.
    pub fn count(&self) -> Result<u64, StorageError> {
        let mut count = 0;
        for entry in self.db.iterator(IteratorMode::Start) {
            entry.map_err(|e| StorageError::Backend(e.to_string()))?;
            count += 1;
        }
        Ok(count)
    }

    /// Flush in-memory buffers to disk.
    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush().map_err(|e| StorageError::Backend(e.to_string()))
    }
}

impl BlockSink for BlockStore {
    fn append_or_replace(&self, block: &Block) -> Result<(), StorageError> {
        self.append_block(block)
    }
}
