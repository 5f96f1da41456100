//! Wire-level types shared by the EVM client and aggregator capabilities.

use num_bigint::BigInt;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockHeader {
    pub number: u64,
    pub hash: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionReceipt {
    pub hash: String,
    pub status: bool,
    pub block_number: u64,
}

/// A mined transaction, joined from `eth_getTransactionByHash` and its
/// receipt, plus confirmations derived against the chain head. Used by the
/// deposit webhook to validate a claimed transaction hash without trusting
/// the caller's body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionDetail {
    pub hash: String,
    pub from: String,
    pub to: Option<String>,
    pub value: BigInt,
    pub chain_id: Option<u64>,
    pub block_number: Option<u64>,
    pub block_hash: Option<String>,
    pub confirmations: u64,
    /// `None` while still pending (no receipt yet).
    pub status: Option<bool>,
}

/// A request to submit a transaction from the vault's signing key.
#[derive(Debug, Clone, Default)]
pub struct SendTransactionRequest {
    pub to: String,
    pub value: Option<BigInt>,
    pub data: Option<Vec<u8>>,
    pub gas: Option<u64>,
    pub gas_price: Option<BigInt>,
}

/// The aggregator's quote response, trimmed to the fields the planner
/// consumes.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatorQuote {
    #[serde(deserialize_with = "deserialize_bigint_string")]
    pub buy_amount: BigInt,
    #[serde(deserialize_with = "deserialize_bigint_string")]
    pub sell_amount: BigInt,
    #[serde(default)]
    pub issues: Option<AggregatorIssues>,
    pub transaction: AggregatorTransaction,
    #[serde(default)]
    pub route: Option<AggregatorRoute>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AggregatorIssues {
    #[serde(default)]
    pub allowance: Option<AggregatorAllowanceIssue>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AggregatorAllowanceIssue {
    pub spender: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatorTransaction {
    pub to: String,
    pub data: String,
    #[serde(default)]
    pub gas: Option<String>,
    #[serde(default)]
    pub gas_price: Option<String>,
    #[serde(default)]
    pub value: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AggregatorRoute {
    #[serde(default)]
    pub fills: Vec<AggregatorFill>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatorFill {
    pub source: String,
    pub proportion_bps: Option<String>,
}

impl AggregatorQuote {
    pub fn allowance_spender(&self) -> Option<&str> {
        self.issues.as_ref()?.allowance.as_ref()?.spender.as_deref()
    }
}

fn deserialize_bigint_string<'de, D>(deserializer: D) -> std::result::Result<BigInt, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::Deserialize as _;
    let raw = String::deserialize(deserializer)?;
    raw.parse::<BigInt>().map_err(serde::de::Error::custom)
}
