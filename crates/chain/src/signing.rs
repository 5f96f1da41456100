//! Canonical signed messages and ERC-191 recovery.

use std::str::FromStr;

use chrono::Utc;
use ethers::types::{Address, Signature};

use crate::error::{ChainError, Result};

/// Signatures older than this are rejected for both claim and vote
/// messages.
pub const MESSAGE_FRESHNESS_MS: i64 = 5 * 60 * 1000;

/// Builds the canonical claim message: `wagmi-claim\naddress:<lower>\ntimestamp:<ms>`.
pub fn canonical_claim_message(address: &str, timestamp_ms: i64) -> String {
    format!("wagmi-claim\naddress:{}\ntimestamp:{}", address.to_ascii_lowercase(), timestamp_ms)
}

/// Builds the canonical allocation-vote message over the *clamped* percent.
pub fn canonical_vote_message(eth_percent: i64, timestamp_ms: i64) -> String {
    let clamped = eth_percent.clamp(0, 100);
    format!("eth_percent:{clamped}\ntimestamp:{timestamp_ms}")
}

/// `true` iff `timestamp_ms` is within `MESSAGE_FRESHNESS_MS` of now, in
/// either direction (the source's clock and ours may disagree slightly).
pub fn is_fresh(timestamp_ms: i64) -> bool {
    let now_ms = Utc::now().timestamp_millis();
    (now_ms - timestamp_ms).abs() <= MESSAGE_FRESHNESS_MS
}

/// Recovers the signer of `message` (ERC-191 personal-message hashing) and
/// compares it case-insensitively against `expected_address`.
pub fn verify_personal_signature(message: &str, signature_hex: &str, expected_address: &str) -> Result<bool> {
    let signature = Signature::from_str(signature_hex.trim_start_matches("0x"))
        .map_err(|e| ChainError::SignatureRecovery(e.to_string()))?;
    let recovered: Address =
        signature.recover(message).map_err(|e| ChainError::SignatureRecovery(e.to_string()))?;
    let expected = Address::from_str(expected_address).map_err(|_| ChainError::InvalidAddress(expected_address.to_string()))?;
    Ok(recovered == expected)
}

/// Full verification: signature recovers to `expected_address` AND the
/// message's timestamp is still fresh.
pub fn verify_claim(address: &str, timestamp_ms: i64, signature_hex: &str) -> Result<bool> {
    if !is_fresh(timestamp_ms) {
        return Ok(false);
    }
    let message = canonical_claim_message(address, timestamp_ms);
    verify_personal_signature(&message, signature_hex, address)
}

pub fn verify_vote(address: &str, eth_percent: i64, timestamp_ms: i64, signature_hex: &str) -> Result<bool> {
    if !is_fresh(timestamp_ms) {
        return Ok(false);
    }
    let message = canonical_vote_message(eth_percent, timestamp_ms);
    verify_personal_signature(&message, signature_hex, address)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::signers::{LocalWallet, Signer};

    #[tokio::test]
    async fn claim_round_trip() {
        let wallet = LocalWallet::new(&mut rand_wallet_rng());
        let address = format!("{:#x}", wallet.address());
        let timestamp = Utc::now().timestamp_millis();
        let message = canonical_claim_message(&address, timestamp);
        let signature = wallet.sign_message(&message).await.unwrap();

        assert!(verify_claim(&address, timestamp, &signature.to_string()).unwrap());
    }

    #[tokio::test]
    async fn vote_round_trip() {
        let wallet = LocalWallet::new(&mut rand_wallet_rng());
        let address = format!("{:#x}", wallet.address());
        let timestamp = Utc::now().timestamp_millis();
        let message = canonical_vote_message(150, timestamp);
        let signature = wallet.sign_message(&message).await.unwrap();

        // Sign over the clamped value (100), so verifying with the raw
        // unclamped input must fail — only 100 is canonical.
        assert!(!verify_vote(&address, 150, timestamp, &signature.to_string()).unwrap());
        assert!(verify_vote(&address, 100, timestamp, &signature.to_string()).unwrap());
    }

    #[test]
    fn stale_timestamp_is_rejected() {
        let old = Utc::now().timestamp_millis() - MESSAGE_FRESHNESS_MS - 1000;
        assert!(!is_fresh(old));
    }

    fn rand_wallet_rng() -> impl rand::RngCore + rand::CryptoRng {
        rand::rngs::OsRng
    }
}
