//! secp256k1 cryptographic operations.
//!
//! Transactions are authorized by a recoverable ECDSA signature over a
//! priority-tagged message rather than a sighash:
//!
//! ```text
//! "{recipient}:{amount + 0.00001:.5f}:{priority}:{public_key_hex}"
//! ```
//!
//! Validation recovers the signer's public key from the 65-byte signature,
//! derives the address, and requires a case-insensitive match with the
//! transaction input's sender address. The message rendering is
//! consensus-critical; see [`crate::amount::format_signing_amount`].
//!
//! Addresses are `"AG"` followed by the first 33 hex characters of the
//! SHA-256 digest of the compressed SEC1 public key.

use k256::ecdsa::{RecoveryId, Signature, SigningKey, VerifyingKey};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use sha2::{Digest, Sha256};
use std::fmt;

use crate::amount::format_signing_amount;
use crate::constants::Priority;
use crate::error::CryptoError;

/// Address prefix for wallet addresses.
pub const ADDRESS_PREFIX: &str = "AG";

/// Hex characters of the pubkey digest kept in the address.
const ADDRESS_DIGEST_LEN: usize = 33;

/// secp256k1 keypair for signing spend authorizations.
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    /// Generate a random keypair using the OS cryptographic RNG.
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::random(&mut rand::rngs::OsRng),
        }
    }

    /// Restore a keypair from a 64-hex-char private key.
    pub fn from_hex(hex_key: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(hex_key).map_err(|_| CryptoError::InvalidPrivateKey)?;
        let signing_key =
            SigningKey::from_slice(&bytes).map_err(|_| CryptoError::InvalidPrivateKey)?;
        Ok(Self { signing_key })
    }

    /// The private key as 64 hex characters. Handle with care.
    pub fn to_hex(&self) -> String {
        hex::encode(self.signing_key.to_bytes())
    }

    /// Compressed SEC1 public key as hex (66 characters).
    pub fn public_key_hex(&self) -> String {
        let point = self.signing_key.verifying_key().to_encoded_point(true);
        hex::encode(point.as_bytes())
    }

    /// The wallet address derived from this keypair's public key.
    pub fn address(&self) -> String {
        address_from_verifying_key(self.signing_key.verifying_key())
    }

    /// Sign a spend authorization for the given recipient, amount and
    /// priority. Returns the 65-byte recoverable signature as hex.
    pub fn sign_spend(
        &self,
        recipient: &str,
        amount_micro: u64,
        priority: Priority,
    ) -> Result<String, CryptoError> {
        let message = signing_message(recipient, amount_micro, priority, &self.public_key_hex());
        self.sign_message(&message)
    }

    /// Sign an arbitrary message, returning hex(r || s || recovery_id).
    pub fn sign_message(&self, message: &str) -> Result<String, CryptoError> {
        let (signature, recovery_id) = self
            .signing_key
            .sign_recoverable(message.as_bytes())
            .map_err(|_| CryptoError::InvalidSignature)?;
        let mut bytes = signature.to_vec();
        bytes.push(recovery_id.to_byte());
        Ok(hex::encode(bytes))
    }
}

impl Clone for Keypair {
    fn clone(&self) -> Self {
        Self {
            signing_key: self.signing_key.clone(),
        }
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("address", &self.address())
            .finish_non_exhaustive()
    }
}

/// Build the message string that a sender signs for a spend.
pub fn signing_message(
    recipient: &str,
    amount_micro: u64,
    priority: Priority,
    public_key_hex: &str,
) -> String {
    format!(
        "{recipient}:{}:{priority}:{public_key_hex}",
        format_signing_amount(amount_micro)
    )
}

/// Recover the signer's address from a message and a 65-byte hex signature.
pub fn recover_address(message: &str, signature_hex: &str) -> Result<String, CryptoError> {
    let bytes = hex::decode(signature_hex).map_err(|_| CryptoError::InvalidSignature)?;
    if bytes.len() != 65 {
        return Err(CryptoError::InvalidSignature);
    }
    let signature =
        Signature::from_slice(&bytes[..64]).map_err(|_| CryptoError::InvalidSignature)?;
    let recovery_id =
        RecoveryId::from_byte(bytes[64]).ok_or(CryptoError::InvalidSignature)?;
    let verifying_key = VerifyingKey::recover_from_msg(message.as_bytes(), &signature, recovery_id)
        .map_err(|_| CryptoError::RecoveryFailed)?;
    Ok(address_from_verifying_key(&verifying_key))
}

/// Derive the wallet address for a hex-encoded compressed public key.
pub fn address_from_public_key_hex(public_key_hex: &str) -> Result<String, CryptoError> {
    let bytes = hex::decode(public_key_hex).map_err(|_| CryptoError::InvalidPublicKey)?;
    let verifying_key =
        VerifyingKey::from_sec1_bytes(&bytes).map_err(|_| CryptoError::InvalidPublicKey)?;
    Ok(address_from_verifying_key(&verifying_key))
}

fn address_from_verifying_key(key: &VerifyingKey) -> String {
    let compressed = key.to_encoded_point(true);
    let digest = hex::encode(Sha256::digest(compressed.as_bytes()));
    format!("{ADDRESS_PREFIX}{}", &digest[..ADDRESS_DIGEST_LEN])
}
