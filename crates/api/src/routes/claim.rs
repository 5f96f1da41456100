//! Claim endpoint: verifies the signed claim message, computes
//! (or returns the existing) pro-rata settlement plan, and queues the
//! transfer job.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use tracing::warn;
use treasury_chain::signing::verify_claim;
use treasury_core::queue::JobPayload;
use treasury_core::{SettlementExecutor, SettlementState};

use crate::error::{ApiError, Result};
use crate::models::{AssetTransferPlanDto, ClaimBody, ClaimResponse};
use crate::state::AppState;

fn state_label(state: SettlementState) -> &'static str {
    match state {
        SettlementState::Queued => "queued",
        SettlementState::Executing => "executing",
        SettlementState::Executed => "executed",
        SettlementState::Failed => "failed",
    }
}

#[utoipa::path(
    post,
    path = "/claims",
    tag = "claim",
    request_body = ClaimBody,
    responses(
        (status = 200, description = "Settlement queued or its current status returned", body = ClaimResponse),
        (status = 400, description = "Address has no claimable deposit"),
        (status = 401, description = "Signature invalid or expired"),
    )
)]
pub async fn submit_claim(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ClaimBody>,
) -> Result<Json<ClaimResponse>> {
    let ok = verify_claim(&body.address, body.timestamp, &body.signature).map_err(treasury_core::CoreError::from)?;
    if !ok {
        return Err(ApiError::Unauthorized("claim signature invalid or expired".to_string()));
    }

    let (status, queued) = state.settlement.claim(&body.address, &state.assets, state.chain.as_ref()).await?;

    // A freshly-queued claim can be executed synchronously right here
    // instead of waiting for the worker's next poll, as long as nothing
    // else (the worker, or a concurrent request) has already claimed it.
    let status = if queued {
        match state.queue.claim_by_id(&status.job_id, state.claim_by_id_max_skip).await? {
            Some(handle) => match handle.job().payload.clone() {
                JobPayload::Settlement(payload) => {
                    let job_id = handle.job().id.clone();
                    let executor = SettlementExecutor::new(
                        state.kv.clone(),
                        state.ledger.clone(),
                        state.votes.clone(),
                        state.queue.clone(),
                        state.chain.as_ref(),
                        state.settlement_execute,
                    );
                    let outcome = executor.run(&job_id, &payload, &state.active_proposal_id, &handle).await;
                    match outcome {
                        Ok(()) => handle.ack().await?,
                        Err(e) => {
                            let requeue = e.is_retryable();
                            handle.fail(requeue).await?;
                        }
                    }
                    state.settlement.get_status(&body.address).await?.unwrap_or(status)
                }
                JobPayload::Rebalance(_) => {
                    warn!(job_id = %status.job_id, "claim_by_id returned a non-settlement job");
                    handle.fail(true).await?;
                    status
                }
            },
            None => status,
        }
    } else {
        status
    };

    Ok(Json(ClaimResponse {
        queued,
        job_id: status.job_id,
        state: state_label(status.state).to_string(),
        share: status.share,
        plan: status.plan.iter().map(AssetTransferPlanDto::from).collect(),
        message: status.message,
    }))
}
