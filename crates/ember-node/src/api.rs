//! HTTP API surface.
//!
//! Read-only views over the chain, mempool, and fee estimator, plus the two
//! mutating entry points: mine and submit-transaction. Consensus failures
//! surface as 4xx with the rule that triggered; unexpected faults as 5xx.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use ember_core::amount::format_coins;
use ember_core::blockchain::total_subsidy;
use ember_core::constants::{
    Priority, BLOCK_SUBSIDY, BPS, HALVING_INTERVAL, PRIORITY_MULTIPLIERS_BPS,
};
use ember_core::error::EmberError;
use ember_core::fee_estimator::{block_fullness_bps, FULLNESS_WINDOW};
use ember_core::transaction::SpendRequest;

use crate::node::{Node, NodeError};

type AppState = Arc<Node>;

// ── Error mapping ────────────────────────────────────────────────────────────

struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn not_found(what: impl Into<String>) -> Self {
        Self { status: StatusCode::NOT_FOUND, message: what.into() }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self { status: StatusCode::BAD_REQUEST, message: message.into() }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

impl From<NodeError> for ApiError {
    fn from(e: NodeError) -> Self {
        let status = match &e {
            NodeError::Ember(EmberError::Transaction(_))
            | NodeError::Ember(EmberError::Block(_))
            | NodeError::Ember(EmberError::Chain(_)) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self { status, message: e.to_string() }
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

// ── Router ───────────────────────────────────────────────────────────────────

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(status))
        .route("/health", get(health))
        .route("/peers", get(peers))
        .route("/mine", post(mine))
        .route("/blockchain", get(full_chain))
        .route("/blockchain/paginated", get(paginated_blocks))
        .route("/blockchain/latest", get(latest_blocks))
        .route("/blockchain/range", get(block_range))
        .route("/blockchain/height", get(chain_height))
        .route("/blockchain/halving", get(halving_info))
        .route("/blockchain/height/:height", get(block_by_height))
        .route("/blockchain/hash/:hash", get(block_by_hash))
        .route("/blockchain/tx/:tx_id", get(chain_transaction))
        .route("/transactions", get(mempool_transactions))
        .route("/transactions/:tx_id", get(transaction_by_id))
        .route("/transactions/address/:address", get(transactions_for_address))
        .route("/wallet/info/:address", get(wallet_info))
        .route("/wallet/transact", post(transact))
        .route("/fee-rate", get(fee_rate))
        .layer(cors)
        .with_state(state)
}

/// Bind and serve the API until the process stops.
pub async fn serve(state: AppState) -> std::io::Result<()> {
    let addr = state.config().api_addr();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "API listening");
    axum::serve(listener, router(state)).await
}

// ── Status ───────────────────────────────────────────────────────────────────

async fn status(State(node): State<AppState>) -> Json<Value> {
    let chain = node.blockchain().read();
    Json(json!({
        "name": "ember",
        "height": chain.current_height(),
        "tip_hash": chain.tip().hash,
        "mempool_size": node.mempool().lock().len(),
    }))
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn peers(State(node): State<AppState>) -> Json<Value> {
    let uris = node.engine().peer_uris();
    Json(json!({ "count": uris.len(), "peers": uris }))
}

// ── Mining ───────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct MineRequest {
    address: String,
}

async fn mine(State(node): State<AppState>, Json(req): Json<MineRequest>) -> ApiResult<Value> {
    if req.address.is_empty() {
        return Err(ApiError::bad_request("miner address required"));
    }
    let outcome = node.mine(&req.address).await?;
    Ok(Json(json!({
        "block": outcome.block,
        "reward": outcome.reward,
        "reward_coins": format_coins(outcome.reward),
        "balance": outcome.balance,
        "balance_coins": format_coins(outcome.balance),
    })))
}

// ── Chain views ──────────────────────────────────────────────────────────────

async fn full_chain(State(node): State<AppState>) -> Json<Value> {
    let chain = node.blockchain().read();
    Json(json!({
        "chain": chain.chain(),
        "utxo_set": chain.utxo_set(),
        "current_height": chain.current_height(),
    }))
}

#[derive(Deserialize)]
struct Pagination {
    page: Option<u64>,
    per_page: Option<u64>,
}

async fn paginated_blocks(
    State(node): State<AppState>,
    Query(q): Query<Pagination>,
) -> ApiResult<Value> {
    let page = q.page.unwrap_or(1).max(1);
    let per_page = q.per_page.unwrap_or(10).clamp(1, 100);

    let chain = node.blockchain().read();
    let total = chain.len() as u64;
    let start = (page - 1) * per_page;
    if start >= total && page > 1 {
        return Err(ApiError::not_found(format!("page {page} out of range")));
    }
    let end = (start + per_page).min(total);
    let blocks = &chain.chain()[start as usize..end as usize];

    Ok(Json(json!({
        "blocks": blocks,
        "page": page,
        "per_page": per_page,
        "total_blocks": total,
    })))
}

#[derive(Deserialize)]
struct LatestQuery {
    limit: Option<u64>,
}

async fn latest_blocks(State(node): State<AppState>, Query(q): Query<LatestQuery>) -> Json<Value> {
    let limit = q.limit.unwrap_or(10).clamp(1, 100) as usize;
    let chain = node.blockchain().read();
    let mut blocks = chain.recent_blocks(limit).to_vec();
    blocks.reverse(); // newest first
    Json(json!(blocks))
}

#[derive(Deserialize)]
struct RangeQuery {
    start: u64,
    end: u64,
}

async fn block_range(State(node): State<AppState>, Query(q): Query<RangeQuery>) -> ApiResult<Value> {
    if q.end < q.start {
        return Err(ApiError::bad_request("end before start"));
    }
    let chain = node.blockchain().read();
    let total = chain.len() as u64;
    if q.start >= total {
        return Err(ApiError::not_found("start beyond tip"));
    }
    let end = (q.end + 1).min(total);
    Ok(Json(json!({
        "blocks": &chain.chain()[q.start as usize..end as usize],
        "start": q.start,
        "end": end - 1,
    })))
}

async fn chain_height(State(node): State<AppState>) -> Json<Value> {
    Json(json!({ "height": node.blockchain().read().current_height() }))
}

async fn halving_info(State(node): State<AppState>) -> Json<Value> {
    let block_count = node.blockchain().read().len() as u64;
    let epoch = block_count / HALVING_INTERVAL;
    Json(json!({
        "block_count": block_count,
        "halving_interval": HALVING_INTERVAL,
        "current_subsidy": BLOCK_SUBSIDY >> epoch.min(63),
        "blocks_until_halving": HALVING_INTERVAL - block_count % HALVING_INTERVAL,
        "total_issued": total_subsidy(block_count),
    }))
}

async fn block_by_height(
    State(node): State<AppState>,
    Path(height): Path<u64>,
) -> ApiResult<Value> {
    let chain = node.blockchain().read();
    match chain.block_by_height(height) {
        Some(block) => Ok(Json(json!(block))),
        None => Err(ApiError::not_found(format!("no block at height {height}"))),
    }
}

async fn block_by_hash(State(node): State<AppState>, Path(hash): Path<String>) -> ApiResult<Value> {
    let chain = node.blockchain().read();
    match chain.block_by_hash(&hash) {
        Some(block) => Ok(Json(json!(block))),
        None => Err(ApiError::not_found(format!("no block with hash {hash}"))),
    }
}

async fn chain_transaction(
    State(node): State<AppState>,
    Path(tx_id): Path<String>,
) -> ApiResult<Value> {
    let chain = node.blockchain().read();
    match chain.find_transaction(&tx_id) {
        Some((tx, height)) => Ok(Json(json!({ "transaction": tx, "block_height": height }))),
        None => Err(ApiError::not_found(format!("transaction {tx_id} not found"))),
    }
}

// ── Transactions ─────────────────────────────────────────────────────────────

async fn mempool_transactions(State(node): State<AppState>) -> Json<Value> {
    let pool = node.mempool().lock();
    let txs: Vec<_> = pool.transactions().values().collect();
    Json(json!({ "transactions": txs, "count": txs.len() }))
}

async fn transaction_by_id(
    State(node): State<AppState>,
    Path(tx_id): Path<String>,
) -> ApiResult<Value> {
    // Mempool first, then the chain.
    if let Some(tx) = node.mempool().lock().get(&tx_id) {
        return Ok(Json(json!({ "transaction": tx, "status": "pending" })));
    }
    let chain = node.blockchain().read();
    match chain.find_transaction(&tx_id) {
        Some((tx, height)) => Ok(Json(json!({
            "transaction": tx,
            "status": "confirmed",
            "block_height": height,
        }))),
        None => Err(ApiError::not_found(format!("transaction {tx_id} not found"))),
    }
}

async fn transactions_for_address(
    State(node): State<AppState>,
    Path(address): Path<String>,
) -> Json<Value> {
    let chain = node.blockchain().read();
    let txs: Vec<Value> = chain
        .transactions_for_address(&address)
        .into_iter()
        .map(|(tx, height)| json!({ "transaction": tx, "block_height": height }))
        .collect();
    Json(json!(txs))
}

// ── Wallet ───────────────────────────────────────────────────────────────────

async fn wallet_info(State(node): State<AppState>, Path(address): Path<String>) -> Json<Value> {
    let (balance, pending) = node.wallet_info(&address);
    Json(json!({
        "address": address,
        "balance": balance,
        "balance_coins": format_coins(balance),
        "pending_spends": pending,
        "pending_spends_coins": format_coins(pending),
        "spendable": balance.saturating_sub(pending),
    }))
}

async fn transact(
    State(node): State<AppState>,
    Json(request): Json<SpendRequest>,
) -> ApiResult<Value> {
    let tx = node.submit_transaction(request).await?;
    Ok(Json(json!({ "transaction": tx, "status": "pending" })))
}

// ── Fee panel ────────────────────────────────────────────────────────────────

async fn fee_rate(State(node): State<AppState>) -> Json<Value> {
    let mempool_size = node.mempool().lock().len();
    let recent = node.blockchain().read().recent_blocks(FULLNESS_WINDOW).to_vec();
    node.fees().ensure_updated(mempool_size, &recent);

    let multipliers: Value = PRIORITY_MULTIPLIERS_BPS
        .iter()
        .map(|(p, bps)| (p.as_str().to_string(), json!(*bps as f64 / BPS as f64)))
        .collect::<serde_json::Map<String, Value>>()
        .into();

    Json(json!({
        "fee_rate": node.fees().current_rate(),
        "mempool_size": mempool_size,
        "block_fullness_bps": block_fullness_bps(&recent),
        "priority_multipliers": multipliers,
        "priority_rates": {
            "low": Priority::Low.fee_rate(),
            "medium": Priority::Medium.fee_rate(),
            "high": Priority::High.fee_rate(),
        },
    }))
}
