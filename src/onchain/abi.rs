//! Contract event ABI definitions, function selectors and calldata encoding.
//!
//! The contract is small enough that we hand-encode the two calls we make
//! instead of pulling in a generated binding.

use alloy::primitives::{b256, keccak256, Bytes, B256};

// ─── Event topic0 hashes (keccak256 of event signature) ──────────────────────

/// keccak256("Ping()")
pub const PING_TOPIC: B256 =
    b256!("ca6e822df923f741dfe968d15d80a18abd25bd1e748bcb9ad81fea5bbb7386af");

/// keccak256("Pong(bytes32)")
pub const PONG_TOPIC: B256 =
    b256!("67050610046771547cf1d6e467b904ccfc523370eebc895dad1d9a73349b9804");

// ─── Function selectors (first 4 bytes of keccak256 of the signature) ────────

/// pong(bytes32)
pub const PONG_SELECTOR: [u8; 4] = [0x05, 0xba, 0x79, 0xa2];

/// pinger()
pub const PINGER_SELECTOR: [u8; 4] = [0xb9, 0x73, 0x99, 0xf5];

/// Calldata for `pong(bytes32 _txHash)`.
pub fn encode_pong(ping_tx_hash: B256) -> Bytes {
    let mut data = Vec::with_capacity(4 + 32);
    data.extend_from_slice(&PONG_SELECTOR);
    data.extend_from_slice(ping_tx_hash.as_slice());
    Bytes::from(data)
}

/// Calldata for the `pinger()` view.
pub fn encode_pinger() -> Bytes {
    Bytes::copy_from_slice(&PINGER_SELECTOR)
}

/// Verify that our pre-computed hashes match their signatures.
/// Call this at startup to catch any signature mismatches.
pub fn verify_topic_hashes() -> Vec<(String, bool)> {
    let topics = [("Ping()", PING_TOPIC), ("Pong(bytes32)", PONG_TOPIC)];
    let selectors = [("pong(bytes32)", PONG_SELECTOR), ("pinger()", PINGER_SELECTOR)];

    let mut checks: Vec<(String, bool)> = topics
        .iter()
        .map(|(sig, expected)| (sig.to_string(), keccak256(sig.as_bytes()) == *expected))
        .collect();
    checks.extend(selectors.iter().map(|(sig, expected)| {
        let computed = keccak256(sig.as_bytes());
        (sig.to_string(), computed[..4] == expected[..])
    }));
    checks
}
