//! Shared helpers for the Ember integration tests.

use ember_core::constants::Priority;
use ember_core::crypto::Keypair;
use ember_core::transaction::SpendRequest;

/// Build a fully signed spend request from a keypair.
pub fn signed_request(kp: &Keypair, recipient: &str, amount: u64, priority: Priority) -> SpendRequest {
    SpendRequest {
        address: kp.address(),
        public_key: kp.public_key_hex(),
        signature: kp
            .sign_spend(recipient, amount, priority)
            .expect("signing with a fresh key cannot fail"),
        recipient: recipient.to_string(),
        amount,
        priority,
    }
}

/// Reserve a free localhost port by briefly binding to it.
pub fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .expect("bind to ephemeral port")
        .local_addr()
        .expect("local addr")
        .port()
}
