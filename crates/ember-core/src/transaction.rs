//! Transaction model, construction, and validation.
//!
//! Two levels of validation, mirroring how the rest of the crate is split:
//!
//! - **Static** ([`Transaction::validate`]): checks that need no external
//!   state: conservation, minimum fee, coinbase reward arithmetic, and the
//!   signature (the signer's address is recovered from the signature and
//!   compared case-insensitively with the input address).
//! - **Contextual** ([`Transaction::validate_against`]): checks against a
//!   UTXO snapshot and the mempool. Every consumed id must be an unspent
//!   output of the sender (or a chained mempool spend), and the declared
//!   input amount must equal the spendable total net of pending spends.
//!
//! Amounts are u64 micro-coins throughout.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::blockchain::UtxoSet;
use crate::constants::{
    Priority, BASE_TX_SIZE, BLOCK_SUBSIDY, COINBASE_ADDRESS, FEE_RATE_PRECISION, HALVING_INTERVAL,
    MIN_FEE,
};
use crate::crypto::{recover_address, signing_message};
use crate::error::TransactionError;
use crate::hashing::canonical_json;
use crate::mempool::pending_spends_in;
use crate::now_nanos;

/// Mined reward subsidy at a given height: `BLOCK_SUBSIDY >> (h / HALVING_INTERVAL)`.
pub fn block_subsidy(height: u64) -> u64 {
    let epoch = height / HALVING_INTERVAL;
    if epoch >= 64 {
        return 0;
    }
    BLOCK_SUBSIDY >> epoch
}

/// Input of a regular spend transaction.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct SpendInput {
    /// Creation time in nanoseconds since epoch; newer timestamps replace
    /// older entries with the same id in the mempool.
    pub timestamp: u64,
    /// Sum of consumed UTXO values net of the sender's pending spends.
    pub amount: u64,
    /// Fee paid to the miner.
    pub fee: u64,
    /// Sender address.
    pub address: String,
    /// Compressed SEC1 public key, hex.
    pub public_key: String,
    /// 65-byte recoverable ECDSA signature, hex.
    pub signature: String,
    /// Unspent transaction ids being consumed. Never empty.
    pub prev_tx_ids: Vec<String>,
}

/// Input of a coinbase transaction.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct CoinbaseInput {
    pub timestamp: u64,
    /// Always [`COINBASE_ADDRESS`].
    pub address: String,
    pub public_key: String,
    pub signature: String,
    pub coinbase_data: String,
    pub block_height: u64,
    /// Protocol-issued portion of the reward at `block_height`.
    pub subsidy: u64,
    /// Collected fees of the other transactions in the block.
    pub fees: u64,
}

/// A transaction input: either protocol issuance or a spend.
///
/// Untagged on the wire; the two variants have disjoint field sets
/// (`coinbase_data`/`subsidy` vs `prev_tx_ids`/`amount`), so canonical JSON
/// stays free of an extra discriminant.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(untagged)]
pub enum TxInput {
    Coinbase(CoinbaseInput),
    Spend(SpendInput),
}

impl TxInput {
    /// Creation timestamp in nanoseconds.
    pub fn timestamp(&self) -> u64 {
        match self {
            TxInput::Coinbase(c) => c.timestamp,
            TxInput::Spend(s) => s.timestamp,
        }
    }

    /// The sender address (or `"coinbase"`).
    pub fn address(&self) -> &str {
        match self {
            TxInput::Coinbase(c) => &c.address,
            TxInput::Spend(s) => &s.address,
        }
    }
}

/// Everything a client submits to spend coins; the node assembles the
/// transaction from this plus its UTXO and mempool views.
#[derive(Deserialize, Clone, Debug)]
pub struct SpendRequest {
    pub address: String,
    pub public_key: String,
    pub signature: String,
    pub recipient: String,
    /// Amount in micro-coins.
    pub amount: u64,
    pub priority: Priority,
}

/// A transaction transferring value, or minting it when `is_coinbase`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Transaction {
    /// Unique id. Coinbase ids carry a `"coinbase_"` prefix.
    pub id: String,
    pub input: TxInput,
    /// Recipient address to amount. Ordered so canonical JSON is stable.
    pub output: BTreeMap<String, u64>,
    /// Fee in micro-coins. Zero for coinbase.
    pub fee: u64,
    /// Size in bytes, never below [`BASE_TX_SIZE`].
    pub size: u64,
    /// Fee rate in milli-micro per byte; identifies the chosen priority.
    pub fee_rate: u64,
    pub is_coinbase: bool,
}

impl Transaction {
    /// Build the coinbase transaction for a block at `height` paying
    /// `miner_address` the subsidy plus `total_fees`.
    pub fn coinbase(
        miner_address: &str,
        height: u64,
        total_fees: u64,
    ) -> Result<Transaction, TransactionError> {
        if miner_address.is_empty() {
            return Err(TransactionError::InvalidCoinbase("empty miner address".into()));
        }
        let subsidy = block_subsidy(height);
        let reward = subsidy
            .checked_add(total_fees)
            .ok_or_else(|| TransactionError::InvalidCoinbase("reward overflow".into()))?;
        if reward == 0 {
            return Err(TransactionError::InvalidCoinbase("zero reward".into()));
        }
        let mut output = BTreeMap::new();
        output.insert(miner_address.to_string(), reward);
        Ok(Transaction {
            id: format!("coinbase_{}", Uuid::new_v4()),
            input: TxInput::Coinbase(CoinbaseInput {
                timestamp: now_nanos(),
                address: COINBASE_ADDRESS.to_string(),
                public_key: COINBASE_ADDRESS.to_string(),
                signature: COINBASE_ADDRESS.to_string(),
                coinbase_data: format!("Height:{height}"),
                block_height: height,
                subsidy,
                fees: total_fees,
            }),
            output,
            fee: 0,
            size: BASE_TX_SIZE,
            fee_rate: 0,
            is_coinbase: true,
        })
    }

    /// Assemble a spend transaction from a signed request.
    ///
    /// Consumes every UTXO belonging to the sender (plus chained mempool
    /// outputs), pays the recipient, and returns change to the sender. The
    /// declared input amount is the spendable balance: confirmed UTXO total
    /// minus the sender's pending spends already sitting in the mempool.
    ///
    /// Fails with [`TransactionError::InsufficientFunds`] when the spendable
    /// balance does not cover `amount + fee`, and with
    /// [`TransactionError::InvalidSignature`] when the provided signature
    /// does not recover to the sender's address.
    pub fn create_spend(
        request: &SpendRequest,
        utxo_set: &UtxoSet,
        pool: &BTreeMap<String, Transaction>,
    ) -> Result<Transaction, TransactionError> {
        if request.amount == 0 {
            return Err(TransactionError::InvalidAmount("amount must be positive".into()));
        }
        if request.address == COINBASE_ADDRESS {
            return Err(TransactionError::CoinbaseSender);
        }
        if request.recipient == request.address || request.recipient.is_empty() {
            return Err(TransactionError::NoRecipient);
        }

        let fee_rate = request.priority.fee_rate();
        let fee = (BASE_TX_SIZE * fee_rate / FEE_RATE_PRECISION).max(MIN_FEE);
        let required = request
            .amount
            .checked_add(fee)
            .ok_or_else(|| TransactionError::InvalidAmount("amount overflow".into()))?;

        // Check the signature before touching the ledger.
        let message = signing_message(
            &request.recipient,
            request.amount,
            request.priority,
            &request.public_key,
        );
        let recovered = recover_address(&message, &request.signature)
            .map_err(|e| TransactionError::InvalidSignature(e.to_string()))?;
        if !recovered.eq_ignore_ascii_case(&request.address) {
            return Err(TransactionError::InvalidSignature(format!(
                "recovered {recovered}, expected {}",
                request.address
            )));
        }

        // Select every confirmed UTXO of the sender.
        let mut prev_tx_ids = Vec::new();
        let mut confirmed: u64 = 0;
        for (tx_id, outputs) in utxo_set {
            if let Some(value) = outputs.get(&request.address) {
                prev_tx_ids.push(tx_id.clone());
                confirmed += value;
            }
        }
        // Chain onto unconfirmed change sitting in the mempool.
        for tx in pool.values() {
            if tx.input.address() == request.address
                && tx.output.contains_key(&request.address)
                && !prev_tx_ids.contains(&tx.id)
            {
                prev_tx_ids.push(tx.id.clone());
            }
        }
        if prev_tx_ids.is_empty() {
            return Err(TransactionError::InsufficientFunds { available: 0, required });
        }

        let pending = pending_spends_in(pool, &request.address);
        let spendable = confirmed.saturating_sub(pending);
        if spendable < required {
            return Err(TransactionError::InsufficientFunds {
                available: spendable,
                required,
            });
        }

        let mut output = BTreeMap::new();
        output.insert(request.recipient.clone(), request.amount);
        let change = spendable - required;
        if change > 0 {
            output.insert(request.address.clone(), change);
        }

        let input = TxInput::Spend(SpendInput {
            timestamp: now_nanos(),
            amount: spendable,
            fee,
            address: request.address.clone(),
            public_key: request.public_key.clone(),
            signature: request.signature.clone(),
            prev_tx_ids,
        });
        let size = estimate_size(&input, &output);

        Ok(Transaction {
            id: Uuid::new_v4().to_string(),
            input,
            output,
            fee,
            size,
            fee_rate,
            is_coinbase: false,
        })
    }

    /// The recipient output: first entry whose address differs from the
    /// sender's, with its amount.
    pub fn recipient(&self) -> Option<(&str, u64)> {
        let sender = self.input.address();
        self.output
            .iter()
            .find(|(addr, _)| addr.as_str() != sender)
            .map(|(addr, value)| (addr.as_str(), *value))
    }

    /// Sum of all output values, saturating on adversarial inputs so the
    /// conservation check fails instead of panicking.
    pub fn total_output(&self) -> u64 {
        self.output.values().fold(0u64, |acc, v| acc.saturating_add(*v))
    }

    /// Static validation: conservation, fees, coinbase arithmetic, signature.
    pub fn validate(&self) -> Result<(), TransactionError> {
        match &self.input {
            TxInput::Coinbase(input) => self.validate_coinbase(input),
            TxInput::Spend(input) => self.validate_spend(input),
        }
    }

    fn validate_coinbase(&self, input: &CoinbaseInput) -> Result<(), TransactionError> {
        if !self.is_coinbase {
            return Err(TransactionError::InvalidCoinbase(
                "coinbase input on a non-coinbase transaction".into(),
            ));
        }
        if self.output.len() != 1 {
            return Err(TransactionError::InvalidCoinbase(format!(
                "expected one output, found {}",
                self.output.len()
            )));
        }
        let value = self.total_output();
        if value == 0 {
            return Err(TransactionError::InvalidCoinbase("zero output".into()));
        }
        let expected = block_subsidy(input.block_height)
            .checked_add(input.fees)
            .ok_or_else(|| TransactionError::InvalidCoinbase("reward overflow".into()))?;
        if value != expected {
            return Err(TransactionError::InvalidCoinbase(format!(
                "output {value} does not match subsidy + fees {expected}"
            )));
        }
        Ok(())
    }

    fn validate_spend(&self, input: &SpendInput) -> Result<(), TransactionError> {
        if self.is_coinbase {
            return Err(TransactionError::InvalidCoinbase(
                "spend input on a coinbase transaction".into(),
            ));
        }
        if input.address == COINBASE_ADDRESS {
            return Err(TransactionError::CoinbaseSender);
        }
        if self.fee < MIN_FEE {
            return Err(TransactionError::FeeTooLow { fee: self.fee, minimum: MIN_FEE });
        }
        let outputs = self.total_output();
        let expected = outputs
            .checked_add(self.fee)
            .ok_or_else(|| TransactionError::InvalidAmount("output overflow".into()))?;
        if input.amount != expected {
            return Err(TransactionError::ConservationViolated {
                input: input.amount,
                outputs,
                fee: self.fee,
            });
        }
        if input.prev_tx_ids.is_empty() {
            return Err(TransactionError::MissingPrevTxIds);
        }

        // Reconstruct the signed message and recover the signer.
        let priority = Priority::from_fee_rate(self.fee_rate)
            .ok_or(TransactionError::UnknownFeeRate(self.fee_rate))?;
        let (recipient, amount) = self.recipient().ok_or(TransactionError::NoRecipient)?;
        let message = signing_message(recipient, amount, priority, &input.public_key);
        let recovered = recover_address(&message, &input.signature)
            .map_err(|e| TransactionError::InvalidSignature(e.to_string()))?;
        if !recovered.eq_ignore_ascii_case(&input.address) {
            return Err(TransactionError::InvalidSignature(format!(
                "recovered {recovered}, expected {}",
                input.address
            )));
        }
        Ok(())
    }

    /// Contextual validation against a UTXO snapshot and the mempool.
    ///
    /// Every consumed id must either be an unspent output of the sender or a
    /// chained spend still in the mempool, and the declared input amount must
    /// equal the spendable UTXO total minus the sender's pending spends.
    pub fn validate_against(
        &self,
        utxo_set: &UtxoSet,
        pool: &BTreeMap<String, Transaction>,
    ) -> Result<(), TransactionError> {
        self.validate()?;

        let TxInput::Spend(input) = &self.input else {
            return Ok(());
        };

        let mut spendable: u64 = 0;
        for prev_tx_id in &input.prev_tx_ids {
            match utxo_set.get(prev_tx_id) {
                Some(outputs) => match outputs.get(&input.address) {
                    Some(value) => spendable += value,
                    None => {
                        return Err(TransactionError::ForeignUtxo {
                            utxo: prev_tx_id.clone(),
                            sender: input.address.clone(),
                        })
                    }
                },
                None if pool.contains_key(prev_tx_id) => {
                    // Chained spend of an unconfirmed output.
                }
                None => return Err(TransactionError::UnknownUtxo(prev_tx_id.clone())),
            }
        }

        let pending = pending_spends_in(pool, &input.address);
        let expected = spendable.saturating_sub(pending);
        if input.amount != expected {
            return Err(TransactionError::InputAmountMismatch {
                input: input.amount,
                spendable: expected,
            });
        }
        Ok(())
    }

    /// Canonical JSON serialization of this transaction.
    pub fn canonical(&self) -> Result<String, TransactionError> {
        canonical_json(self)
    }
}

/// Size heuristic: serialized input plus outputs, floored at [`BASE_TX_SIZE`].
fn estimate_size(input: &TxInput, output: &BTreeMap<String, u64>) -> u64 {
    let input_len = canonical_json(input).map(|s| s.len()).unwrap_or(0) as u64;
    let output_len = canonical_json(output).map(|s| s.len()).unwrap_or(0) as u64;
    BASE_TX_SIZE.max(input_len + output_len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::COIN;
    use crate::crypto::Keypair;

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    /// A UTXO set with one confirmed output to `address`.
    fn utxo_with(tx_id: &str, address: &str, value: u64) -> UtxoSet {
        let mut outputs = BTreeMap::new();
        outputs.insert(address.to_string(), value);
        let mut set = BTreeMap::new();
        set.insert(tx_id.to_string(), outputs);
        set
    }

    /// A signed request spending `amount` to `recipient`.
    fn signed_request(kp: &Keypair, recipient: &str, amount: u64, priority: Priority) -> SpendRequest {
        SpendRequest {
            address: kp.address(),
            public_key: kp.public_key_hex(),
            signature: kp.sign_spend(recipient, amount, priority).unwrap(),
            recipient: recipient.to_string(),
            amount,
            priority,
        }
    }

    fn empty_pool() -> BTreeMap<String, Transaction> {
        BTreeMap::new()
    }

    // ------------------------------------------------------------------
    // Subsidy schedule
    // ------------------------------------------------------------------

    #[test]
    fn subsidy_halves_per_interval() {
        assert_eq!(block_subsidy(0), BLOCK_SUBSIDY);
        assert_eq!(block_subsidy(HALVING_INTERVAL - 1), BLOCK_SUBSIDY);
        assert_eq!(block_subsidy(HALVING_INTERVAL), BLOCK_SUBSIDY / 2);
        assert_eq!(block_subsidy(3 * HALVING_INTERVAL), BLOCK_SUBSIDY / 8);
    }

    #[test]
    fn subsidy_eventually_zero() {
        assert_eq!(block_subsidy(64 * HALVING_INTERVAL), 0);
        assert_eq!(block_subsidy(u64::MAX), 0);
    }

    // ------------------------------------------------------------------
    // Coinbase
    // ------------------------------------------------------------------

    #[test]
    fn coinbase_pays_subsidy_plus_fees() {
        let tx = Transaction::coinbase("AGminer", 1, 1_000).unwrap();
        assert!(tx.is_coinbase);
        assert!(tx.id.starts_with("coinbase_"));
        assert_eq!(tx.total_output(), BLOCK_SUBSIDY + 1_000);
        assert_eq!(tx.fee, 0);
        tx.validate().unwrap();
    }

    #[test]
    fn coinbase_rejects_empty_miner() {
        assert!(Transaction::coinbase("", 1, 0).is_err());
    }

    #[test]
    fn coinbase_with_wrong_reward_fails_validation() {
        let mut tx = Transaction::coinbase("AGminer", 1, 0).unwrap();
        *tx.output.get_mut("AGminer").unwrap() += 1;
        assert!(matches!(
            tx.validate(),
            Err(TransactionError::InvalidCoinbase(_))
        ));
    }

    #[test]
    fn coinbase_with_extra_output_fails_validation() {
        let mut tx = Transaction::coinbase("AGminer", 1, 0).unwrap();
        tx.output.insert("AGother".into(), 1);
        assert!(tx.validate().is_err());
    }

    // ------------------------------------------------------------------
    // Spend construction
    // ------------------------------------------------------------------

    #[test]
    fn spend_with_default_fee_and_change() {
        // 50 EMB confirmed, spend 10 at medium priority.
        let kp = Keypair::generate();
        let utxo = utxo_with("T0", &kp.address(), 50 * COIN);
        let req = signed_request(&kp, "AGrecipient", 10 * COIN, Priority::Medium);

        let tx = Transaction::create_spend(&req, &utxo, &empty_pool()).unwrap();
        assert_eq!(tx.fee, MIN_FEE);
        assert_eq!(tx.output["AGrecipient"], 10 * COIN);
        assert_eq!(tx.output[&kp.address()], 39_999_000); // 39.999 EMB change
        let TxInput::Spend(input) = &tx.input else { panic!("expected spend input") };
        assert_eq!(input.amount, 50 * COIN);
        assert_eq!(input.prev_tx_ids, vec!["T0".to_string()]);

        tx.validate().unwrap();
        tx.validate_against(&utxo, &empty_pool()).unwrap();
    }

    #[test]
    fn high_priority_pays_more() {
        let kp = Keypair::generate();
        let utxo = utxo_with("T0", &kp.address(), 50 * COIN);
        let req = signed_request(&kp, "AGrecipient", 10 * COIN, Priority::High);
        let tx = Transaction::create_spend(&req, &utxo, &empty_pool()).unwrap();
        assert_eq!(tx.fee, 1_500); // 250 B * 6 milli-micro/B
        assert_eq!(tx.fee_rate, Priority::High.fee_rate());
        tx.validate_against(&utxo, &empty_pool()).unwrap();
    }

    #[test]
    fn spend_rejects_insufficient_funds() {
        let kp = Keypair::generate();
        let utxo = utxo_with("T0", &kp.address(), 5 * COIN);
        let req = signed_request(&kp, "AGrecipient", 10 * COIN, Priority::Medium);
        assert!(matches!(
            Transaction::create_spend(&req, &utxo, &empty_pool()),
            Err(TransactionError::InsufficientFunds { .. })
        ));
    }

    #[test]
    fn spend_rejects_bad_signature() {
        let kp = Keypair::generate();
        let other = Keypair::generate();
        let utxo = utxo_with("T0", &kp.address(), 50 * COIN);
        let mut req = signed_request(&kp, "AGrecipient", 10 * COIN, Priority::Medium);
        // Signature from a different key.
        req.signature = other.sign_spend("AGrecipient", 10 * COIN, Priority::Medium).unwrap();
        assert!(matches!(
            Transaction::create_spend(&req, &utxo, &empty_pool()),
            Err(TransactionError::InvalidSignature(_))
        ));
    }

    #[test]
    fn spend_rejects_zero_amount() {
        let kp = Keypair::generate();
        let utxo = utxo_with("T0", &kp.address(), 50 * COIN);
        let mut req = signed_request(&kp, "AGrecipient", COIN, Priority::Medium);
        req.amount = 0;
        assert!(Transaction::create_spend(&req, &utxo, &empty_pool()).is_err());
    }

    #[test]
    fn spend_nets_pending_spends() {
        let kp = Keypair::generate();
        let utxo = utxo_with("T0", &kp.address(), 50 * COIN);

        // First spend enters the pool.
        let req1 = signed_request(&kp, "AGrecipient", 10 * COIN, Priority::Medium);
        let tx1 = Transaction::create_spend(&req1, &utxo, &empty_pool()).unwrap();
        let mut pool = empty_pool();
        pool.insert(tx1.id.clone(), tx1.clone());

        // Second spend chains on the change: spendable = 50 - 10.001 = 39.999.
        let req2 = signed_request(&kp, "AGother", 5 * COIN, Priority::Medium);
        let tx2 = Transaction::create_spend(&req2, &utxo, &pool).unwrap();
        let TxInput::Spend(input) = &tx2.input else { panic!("expected spend input") };
        assert_eq!(input.amount, 39_999_000);
        assert!(input.prev_tx_ids.contains(&tx1.id));
        tx2.validate_against(&utxo, &pool).unwrap();
    }

    // ------------------------------------------------------------------
    // Static validation of deserialized transactions
    // ------------------------------------------------------------------

    #[test]
    fn tampered_conservation_detected() {
        let kp = Keypair::generate();
        let utxo = utxo_with("T0", &kp.address(), 50 * COIN);
        let req = signed_request(&kp, "AGrecipient", 10 * COIN, Priority::Medium);
        let mut tx = Transaction::create_spend(&req, &utxo, &empty_pool()).unwrap();
        *tx.output.get_mut("AGrecipient").unwrap() += 1;
        assert!(matches!(
            tx.validate(),
            Err(TransactionError::ConservationViolated { .. })
        ));
    }

    #[test]
    fn tampered_fee_rate_breaks_priority_derivation() {
        let kp = Keypair::generate();
        let utxo = utxo_with("T0", &kp.address(), 50 * COIN);
        let req = signed_request(&kp, "AGrecipient", 10 * COIN, Priority::Medium);
        let mut tx = Transaction::create_spend(&req, &utxo, &empty_pool()).unwrap();
        tx.fee_rate = 12_345;
        assert!(matches!(
            tx.validate(),
            Err(TransactionError::UnknownFeeRate(12_345))
        ));
    }

    #[test]
    fn priority_swap_invalidates_signature() {
        // Signed "medium" but relabeled as high: the reconstructed message
        // no longer matches the signature.
        let kp = Keypair::generate();
        let utxo = utxo_with("T0", &kp.address(), 50 * COIN);
        let req = signed_request(&kp, "AGrecipient", 10 * COIN, Priority::Medium);
        let mut tx = Transaction::create_spend(&req, &utxo, &empty_pool()).unwrap();
        tx.fee_rate = Priority::High.fee_rate();
        // Keep conservation intact so only the signature check can fail.
        assert!(matches!(
            tx.validate(),
            Err(TransactionError::InvalidSignature(_))
        ));
    }

    #[test]
    fn serde_round_trip_preserves_input_variant() {
        let kp = Keypair::generate();
        let utxo = utxo_with("T0", &kp.address(), 50 * COIN);
        let req = signed_request(&kp, "AGrecipient", 10 * COIN, Priority::Medium);
        let tx = Transaction::create_spend(&req, &utxo, &empty_pool()).unwrap();

        let json = serde_json::to_string(&tx).unwrap();
        let back: Transaction = serde_json::from_str(&json).unwrap();
        assert_eq!(back, tx);
        assert!(matches!(back.input, TxInput::Spend(_)));

        let cb = Transaction::coinbase("AGminer", 1, 0).unwrap();
        let json = serde_json::to_string(&cb).unwrap();
        let back: Transaction = serde_json::from_str(&json).unwrap();
        assert!(matches!(back.input, TxInput::Coinbase(_)));
    }

    // ------------------------------------------------------------------
    // Contextual validation
    // ------------------------------------------------------------------

    #[test]
    fn unknown_utxo_rejected() {
        let kp = Keypair::generate();
        let utxo = utxo_with("T0", &kp.address(), 50 * COIN);
        let req = signed_request(&kp, "AGrecipient", 10 * COIN, Priority::Medium);
        let tx = Transaction::create_spend(&req, &utxo, &empty_pool()).unwrap();

        // Validate against a ledger that no longer has T0.
        let empty_utxo = UtxoSet::new();
        assert!(matches!(
            tx.validate_against(&empty_utxo, &empty_pool()),
            Err(TransactionError::UnknownUtxo(_))
        ));
    }

    #[test]
    fn foreign_utxo_rejected() {
        let kp = Keypair::generate();
        let utxo = utxo_with("T0", &kp.address(), 50 * COIN);
        let req = signed_request(&kp, "AGrecipient", 10 * COIN, Priority::Medium);
        let tx = Transaction::create_spend(&req, &utxo, &empty_pool()).unwrap();

        // Same id, but the output belongs to someone else now.
        let foreign = utxo_with("T0", "AGsomeoneelse", 50 * COIN);
        assert!(matches!(
            tx.validate_against(&foreign, &empty_pool()),
            Err(TransactionError::ForeignUtxo { .. })
        ));
    }

    #[test]
    fn double_spend_against_pool_rejected() {
        // Two spends constructed from the same pristine state; the
        // second is validated after the first entered the pool.
        let kp = Keypair::generate();
        let utxo = utxo_with("T0", &kp.address(), 50 * COIN);

        let req1 = signed_request(&kp, "AGrecipient", 10 * COIN, Priority::Medium);
        let tx1 = Transaction::create_spend(&req1, &utxo, &empty_pool()).unwrap();
        let req2 = signed_request(&kp, "AGother", 10 * COIN, Priority::Medium);
        let tx2 = Transaction::create_spend(&req2, &utxo, &empty_pool()).unwrap();

        let mut pool = empty_pool();
        pool.insert(tx1.id.clone(), tx1.clone());

        // tx2 declared amount 50 but 10.001 is already pending.
        assert!(matches!(
            tx2.validate_against(&utxo, &pool),
            Err(TransactionError::InputAmountMismatch { .. })
        ));
    }
}
