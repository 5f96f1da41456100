//! Outbound response bodies. Deliberately separate DTOs from
//! the core's domain types so the wire contract doesn't shift every time an
//! internal struct gains a field.

use serde::Serialize;
use utoipa::ToSchema;

#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub timestamp: i64,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct DepositResponse {
    pub recorded: bool,
    pub total_value_minor_units: String,
    pub total_transactions: u64,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct VoteResponse {
    pub weighted_eth_percent: f64,
    pub total_weight: f64,
    pub total_voters: u64,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct AssetTransferPlanDto {
    pub asset_id: String,
    pub symbol: String,
    pub amount_formatted: String,
    pub amount_minor_units: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ClaimResponse {
    pub queued: bool,
    pub job_id: String,
    /// One of `queued`, `executing`, `executed`, `failed`.
    pub state: String,
    pub share: f64,
    pub plan: Vec<AssetTransferPlanDto>,
    pub message: Option<String>,
}

impl From<&treasury_core::AssetTransferPlan> for AssetTransferPlanDto {
    fn from(plan: &treasury_core::AssetTransferPlan) -> Self {
        Self {
            asset_id: plan.asset_id.clone(),
            symbol: plan.symbol.clone(),
            amount_formatted: plan.amount_formatted.clone(),
            amount_minor_units: plan.amount_minor_units.to_string(),
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct RebalanceTriggerResponse {
    pub enqueued: bool,
    pub job_id: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct StatusEvent {
    pub is_processing: bool,
}
