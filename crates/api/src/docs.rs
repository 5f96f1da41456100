//! OpenAPI schema, served at `/docs` via Swagger UI.

use utoipa::OpenApi;

use crate::models::{
    AssetTransferPlanDto, ClaimBody, ClaimResponse, DepositResponse, DepositWebhookBody, HealthResponse,
    RebalanceTriggerBody, RebalanceTriggerResponse, StatusEvent, VoteBody, VoteResponse,
};
use crate::routes::{
    claim::{__path_submit_claim, submit_claim},
    deposit::{__path_record_deposit, record_deposit},
    health::{__path_health_check, health_check},
    rebalance::{__path_trigger_rebalance, trigger_rebalance},
    status::{__path_status_stream, status_stream},
    vote::{__path_cast_vote, cast_vote},
};

#[derive(OpenApi)]
#[openapi(
    paths(
        health_check,
        record_deposit,
        cast_vote,
        submit_claim,
        trigger_rebalance,
        status_stream,
    ),
    components(schemas(
        HealthResponse,
        DepositWebhookBody,
        DepositResponse,
        VoteBody,
        VoteResponse,
        ClaimBody,
        ClaimResponse,
        AssetTransferPlanDto,
        RebalanceTriggerBody,
        RebalanceTriggerResponse,
        StatusEvent,
    )),
    tags(
        (name = "health", description = "Liveness"),
        (name = "deposit", description = "Deposit webhook"),
        (name = "vote", description = "Allocation voting"),
        (name = "claim", description = "Settlement claims"),
        (name = "rebalance", description = "Manual rebalance trigger"),
        (name = "status", description = "Job processing status"),
    )
)]
pub struct ApiDoc;
