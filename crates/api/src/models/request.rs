//! Inbound request bodies.

use serde::Deserialize;
use utoipa::ToSchema;

#[derive(Debug, Deserialize, ToSchema)]
pub struct DepositWebhookBody {
    /// Transaction hash to look up and validate against the live chain.
    pub hash: String,
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct VoteBody {
    pub address: String,
    /// Desired native-asset allocation, 0-100. Clamped before the
    /// canonical message is reconstructed for signature verification.
    pub eth_percent: i64,
    pub signature: String,
    /// Unix milliseconds the client signed over.
    pub timestamp: i64,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ClaimBody {
    pub address: String,
    pub signature: String,
    pub timestamp: i64,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct RebalanceTriggerBody {
    pub manual: bool,
}
