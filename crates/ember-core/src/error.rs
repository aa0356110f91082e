//! Error types for the Ember protocol.
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransactionError {
    #[error("unknown UTXO: {0}")] UnknownUtxo(String),
    #[error("UTXO {utxo} does not belong to sender {sender}")] ForeignUtxo { utxo: String, sender: String },
    #[error("insufficient funds: available {available}, required {required}")] InsufficientFunds { available: u64, required: u64 },
    #[error("invalid signature: {0}")] InvalidSignature(String),
    #[error("fee {fee} below minimum {minimum}")] FeeTooLow { fee: u64, minimum: u64 },
    #[error("conservation violated: input {input} != outputs {outputs} + fee {fee}")] ConservationViolated { input: u64, outputs: u64, fee: u64 },
    #[error("input amount {input} does not match spendable UTXO total {spendable}")] InputAmountMismatch { input: u64, spendable: u64 },
    #[error("missing prev_tx_ids")] MissingPrevTxIds,
    #[error("sender may not be the coinbase address")] CoinbaseSender,
    #[error("invalid coinbase: {0}")] InvalidCoinbase(String),
    #[error("no recipient output distinct from the sender")] NoRecipient,
    #[error("invalid amount: {0}")] InvalidAmount(String),
    #[error("unknown fee rate {0}, cannot derive priority")] UnknownFeeRate(u64),
    #[error("serialization: {0}")] Serialization(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BlockError {
    #[error("proof of work requirement not met")] InvalidPoW,
    #[error("last hash mismatch")] LastHashMismatch,
    #[error("difficulty {got} outside [{min}, {max}]")] DifficultyOutOfWindow { got: u32, min: u32, max: u32 },
    #[error("timestamp not after parent")] TimestampNotAfterParent,
    #[error("timestamp in the future")] TimestampInFuture,
    #[error("height {got}, expected {expected}")] HeightMismatch { got: u64, expected: u64 },
    #[error("merkle root mismatch: expected {expected}, got {got}")] MerkleRootMismatch { expected: String, got: String },
    #[error("block data exceeds size limit: {size} > {max}")] OversizedBlock { size: usize, max: usize },
    #[error("block hash mismatch")] HashMismatch,
    #[error("tx count {got} does not match data length {expected}")] TxCountMismatch { got: u64, expected: u64 },
    #[error("multiple coinbase transactions")] MultipleCoinbase,
    #[error("missing coinbase transaction")] MissingCoinbase,
    #[error("coinbase output {got} exceeds subsidy {subsidy} + fees {fees}")] ExcessiveCoinbase { got: u64, subsidy: u64, fees: u64 },
    #[error("transaction {index}: {source}")] Transaction { index: usize, source: TransactionError },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    #[error("genesis block mismatch")] GenesisMismatch,
    #[error("new chain must be longer: {candidate} <= {current}")] NotLonger { candidate: usize, current: usize },
    #[error("empty candidate chain")] EmptyChain,
    #[error("UTXO {utxo} for address {address} not found or already spent")] MissingUtxo { utxo: String, address: String },
    #[error("block {height}: {source}")] Block { height: u64, source: BlockError },
    #[error("rebuild failed at tx {tx_id}: {reason}")] RebuildFailed { tx_id: String, reason: String },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("invalid public key encoding")] InvalidPublicKey,
    #[error("invalid signature encoding")] InvalidSignature,
    #[error("signature recovery failed")] RecoveryFailed,
    #[error("invalid private key")] InvalidPrivateKey,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")] MalformedFrame(String),
    #[error("unknown message tag: {0}")] UnknownTag(String),
    #[error("bad compression: {0}")] BadCompression(String),
    #[error("invalid base64 in relay payload")] InvalidBase64,
    #[error("frame exceeds limit: {size} > {max}")] FrameTooLarge { size: usize, max: usize },
    #[error("unexpected payload for {tag}: {reason}")] BadPayload { tag: String, reason: String },
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("connect to {uri} failed: {reason}")] Connect { uri: String, reason: String },
    #[error("send to {uri} failed: {reason}")] Send { uri: String, reason: String },
    #[error("receive from {uri} failed: {reason}")] Receive { uri: String, reason: String },
    #[error("timed out waiting for {what} from {uri}")] Timeout { uri: String, what: String },
    #[error("boot node relay failed for {target_uri}: {reason}")] RelayFailure { target_uri: String, reason: String },
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("storage: {0}")] Backend(String),
    #[error("corrupt block row at height {height}: {reason}")] CorruptRow { height: u64, reason: String },
}

#[derive(Error, Debug)]
pub enum EmberError {
    #[error(transparent)] Transaction(#[from] TransactionError),
    #[error(transparent)] Block(#[from] BlockError),
    #[error(transparent)] Chain(#[from] ChainError),
    #[error(transparent)] Crypto(#[from] CryptoError),
    #[error(transparent)] Protocol(#[from] ProtocolError),
    #[error(transparent)] Transport(#[from] TransportError),
    #[error(transparent)] Storage(#[from] StorageError),
}
