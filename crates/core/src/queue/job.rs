use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::AssetTransferPlan;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Rebalance,
    Settlement,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RebalanceReason {
    Deposit,
    Vote,
    Manual,
}

impl RebalanceReason {
    pub fn parse(s: &str) -> Self {
        match s {
            "vote" => Self::Vote,
            "manual" => Self::Manual,
            _ => Self::Deposit,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebalanceJobPayload {
    pub reason: RebalanceReason,
    pub context: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementJobPayload {
    pub address: String,
    /// Claimant share as a rational in `[0, 1]`, kept as `f64` only for
    /// display; every monetary computation derives `amountMinorUnits`
    /// directly from integer division, never from this field.
    pub share: f64,
    pub plan: Vec<AssetTransferPlan>,
    pub total_deposits_minor_units: String,
    pub request_id: String,
    pub requested_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobPayload {
    Rebalance(RebalanceJobPayload),
    Settlement(SettlementJobPayload),
}

impl JobPayload {
    pub fn rebalance(reason: &str, context: Option<serde_json::Value>) -> Self {
        Self::Rebalance(RebalanceJobPayload { reason: RebalanceReason::parse(reason), context })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub payload: JobPayload,
    pub attempts: u32,
    pub enqueued_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
}
