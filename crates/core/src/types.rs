//! Shared value types: assets, minor-unit amounts, addresses.

use num_bigint::BigInt;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// Lowercased, `0x`-prefixed address used as a storage key.
pub type AddressKey = String;

pub fn lowercase_address(addr: &str) -> AddressKey {
    addr.to_ascii_lowercase()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetKind {
    Native,
    Token,
}

/// Static, process-wide configuration for a single vault asset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Asset {
    pub id: String,
    pub kind: AssetKind,
    pub symbol: String,
    /// Required when `kind == Token`, absent for `Native`.
    pub token_address: Option<String>,
    pub decimals: u32,
    pub price_feed_id: String,
}

impl Asset {
    pub fn unit(&self) -> BigInt {
        BigInt::from(10u64).pow(self.decimals)
    }

    pub fn is_native(&self) -> bool {
        matches!(self.kind, AssetKind::Native)
    }
}

/// Sentinel the quote aggregator uses to denote the chain's native asset.
pub const NATIVE_SENTINEL_ADDRESS: &str = "0xEeeeeEeeeEeEeeEeEeEeeEEEeeeeEeeeeeeeEEeE";

/// Returns the address used to identify `asset` in aggregator quote requests.
pub fn quote_side_address(asset: &Asset) -> Result<&str> {
    match asset.kind {
        AssetKind::Native => Ok(NATIVE_SENTINEL_ADDRESS),
        AssetKind::Token => asset.token_address.as_deref().ok_or_else(|| CoreError::InvalidAsset {
            asset: asset.id.clone(),
            reason: "token asset has no token_address".to_string(),
        }),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetBalance {
    pub asset_id: String,
    pub minor_units: BigInt,
}

/// A single planned transfer within a settlement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetTransferPlan {
    pub asset_id: String,
    pub symbol: String,
    pub kind: AssetKind,
    pub token_address: Option<String>,
    pub decimals: u32,
    pub amount_minor_units: BigInt,
    pub amount_formatted: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_is_ten_to_the_decimals() {
        let asset = Asset {
            id: "usdc".into(),
            kind: AssetKind::Token,
            symbol: "USDC".into(),
            token_address: Some("0xabc".into()),
            decimals: 6,
            price_feed_id: "usdc".into(),
        };
        assert_eq!(asset.unit(), BigInt::from(1_000_000));
    }

    #[test]
    fn native_quote_side_is_sentinel() {
        let asset = Asset {
            id: "eth".into(),
            kind: AssetKind::Native,
            symbol: "ETH".into(),
            token_address: None,
            decimals: 18,
            price_feed_id: "eth".into(),
        };
        assert_eq!(quote_side_address(&asset).unwrap(), NATIVE_SENTINEL_ADDRESS);
    }
}
