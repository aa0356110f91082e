//! Startup and on-demand chain synchronization.
//!
//! The procedure of one sync run:
//!
//! 1. Poll every reliable peer for its chain length, in parallel.
//! 2. If exactly one peer has a longer or equal chain, request its full
//!    chain and replace on success.
//! 3. Otherwise pick the longest and fetch the missing blocks in adaptive
//!    chunks, growing the chunk size on success and shrinking it (plus
//!    bumping the peer's failure counter) on failure.
//! 4. Replace the chain (which rebuilds the UTXO set); on failure the local
//!    state is untouched.
//! 5. Kick off a mempool reconciliation round.
//!
//! Runs are serialized by the engine's `syncing_chain` flag; a second
//! attempt while one is in flight returns immediately.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tracing::{debug, info, warn};

use ember_core::block::Block;
use ember_core::error::ChainError;

use crate::engine::PeerEngine;
use crate::protocol::MessageKind;

/// Consecutive failed chunk fetches before a sync run is abandoned.
const MAX_CHUNK_FAILURES: u32 = 5;

/// Run one synchronization pass against the current peer set.
pub async fn sync_with_peers(engine: Arc<PeerEngine>) {
    if engine.syncing_flag().swap(true, Ordering::SeqCst) {
        debug!("chain sync already in progress");
        return;
    }

    let outcome = run_sync(&engine).await;
    engine.syncing_flag().store(false, Ordering::SeqCst);

    if let Err(e) = outcome {
        warn!("chain sync aborted: {e}");
    }
    // Step 5: reconcile the mempool after chain sync.
    engine.maybe_reconcile_tx_pool().await;
}

async fn run_sync(engine: &Arc<PeerEngine>) -> Result<(), String> {
    let local_length = engine.context().blockchain.read().len() as u64;

    // Step 1: poll reliable peers for their chain length, in parallel.
    let uris: Vec<String> = {
        let registry = engine.registry().lock();
        let mut uris = registry.direct_uris();
        uris.extend(registry.relay_uris());
        uris.retain(|uri| registry.is_reliable(uri));
        uris
    };
    if uris.is_empty() {
        debug!("no peers to sync with");
        return Ok(());
    }

    let polls = uris.into_iter().map(|uri| {
        let engine = engine.clone();
        async move {
            let result = engine
                .request(
                    &uri,
                    MessageKind::RequestChainLength,
                    Value::Null,
                    MessageKind::ResponseChainLength,
                )
                .await;
            (uri, result)
        }
    });

    let mut lengths: HashMap<String, u64> = HashMap::new();
    for (uri, result) in futures_util::future::join_all(polls).await {
        match result {
            Ok(value) => {
                if let Some(length) = value.as_u64() {
                    debug!(peer = %uri, length, "peer chain length");
                    if length >= local_length {
                        lengths.insert(uri, length);
                    }
                }
            }
            Err(e) => {
                debug!(peer = %uri, "length poll failed: {e}");
                engine.registry().lock().record_failure(&uri);
            }
        }
    }

    if lengths.is_empty() {
        info!("no peers have a longer or equal chain");
        return Ok(());
    }

    // Step 2: a single candidate gets asked for its whole chain.
    if lengths.len() == 1 {
        let (uri, length) = lengths.into_iter().next().expect("one entry");
        if length == local_length {
            debug!(peer = %uri, "single peer is at our height");
            return Ok(());
        }
        info!(peer = %uri, length, "single peer ahead, requesting full chain");
        let value = engine
            .request(&uri, MessageKind::RequestChain, Value::Null, MessageKind::ResponseChain)
            .await
            .map_err(|e| e.to_string())?;
        let blocks: Vec<Block> =
            serde_json::from_value(value).map_err(|e| format!("bad chain payload: {e}"))?;

        return match engine.install_chain(blocks) {
            Ok(height) => {
                info!(height, peer = %uri, "synced full chain");
                engine.registry().lock().record_success(&uri);
                Ok(())
            }
            Err(ChainError::NotLonger { .. }) => Ok(()),
            Err(e) => {
                engine.registry().lock().record_failure(&uri);
                Err(format!("full chain from {uri} rejected: {e}"))
            }
        };
    }

    // Step 3: fetch [local_length, longest) from the longest peer in chunks.
    let (best_uri, best_length) = lengths
        .into_iter()
        .max_by_key(|(_, length)| *length)
        .expect("lengths not empty");
    if best_length <= local_length {
        return Ok(());
    }
    info!(peer = %best_uri, best_length, local_length, "fetching missing blocks");

    let mut missing: Vec<Block> = Vec::new();
    let mut next_height = local_length;
    let mut failures = 0u32;

    while next_height < best_length {
        let fetched = engine
            .request(
                &best_uri,
                MessageKind::RequestBlocks,
                json!(next_height),
                MessageKind::ResponseBlocks,
            )
            .await
            .ok()
            .and_then(|value| serde_json::from_value::<Vec<Block>>(value).ok())
            .map(|blocks| {
                // A single-peer responder ships its whole chain minus
                // genesis; drop anything we already have.
                blocks
                    .into_iter()
                    .filter(|b| b.height >= next_height)
                    .collect::<Vec<Block>>()
            })
            .filter(|blocks| !blocks.is_empty());

        match fetched {
            Some(blocks) => {
                debug!(
                    from = next_height,
                    count = blocks.len(),
                    peer = %best_uri,
                    "received block chunk"
                );
                next_height += blocks.len() as u64;
                missing.extend(blocks);
                engine.registry().lock().record_success(&best_uri);
                engine.chunk().lock().grow();
                failures = 0;
            }
            None => {
                warn!(from = next_height, peer = %best_uri, "chunk fetch failed, retrying");
                engine.registry().lock().record_failure(&best_uri);
                engine.chunk().lock().shrink();
                failures += 1;
                if failures >= MAX_CHUNK_FAILURES {
                    return Err(format!(
                        "{MAX_CHUNK_FAILURES} consecutive chunk failures from {best_uri}"
                    ));
                }
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }

    if missing.is_empty() {
        warn!(peer = %best_uri, "no missing blocks received");
        return Ok(());
    }

    // Step 4: install local chain + fetched suffix; rebuild happens inside.
    let mut candidate = engine.context().blockchain.read().chain().to_vec();
    candidate.extend(missing);
    match engine.install_chain(candidate) {
        Ok(height) => {
            info!(height, peer = %best_uri, "chain extended from peer");
            Ok(())
        }
        Err(e) => Err(format!("candidate chain rejected: {e}")),
    }
}
