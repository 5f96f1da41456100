//! API request/response DTOs.

pub mod request;
pub mod response;

pub use request::{ClaimBody, DepositWebhookBody, RebalanceTriggerBody, VoteBody};
pub use response::{
    AssetTransferPlanDto, ClaimResponse, DepositResponse, HealthResponse, RebalanceTriggerResponse, StatusEvent,
    VoteResponse,
};
