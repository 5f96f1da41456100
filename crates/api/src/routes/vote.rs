//! Allocation vote endpoint: verifies the signed message, then
//! records a deposit-weighted vote and re-aggregates.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;
use num_traits::Zero;
use treasury_chain::signing::verify_vote;
use treasury_core::queue::{EnqueueOptions, JobPayload, JobType};

use crate::error::{ApiError, Result};
use crate::models::{VoteBody, VoteResponse};
use crate::state::AppState;

#[utoipa::path(
    post,
    path = "/votes/{proposal_id}",
    tag = "vote",
    params(("proposal_id" = String, Path, description = "Allocation proposal to vote on")),
    request_body = VoteBody,
    responses(
        (status = 200, description = "Vote recorded, aggregation totals returned", body = VoteResponse),
        (status = 400, description = "Address has no recorded deposit"),
        (status = 401, description = "Signature invalid or expired"),
    )
)]
pub async fn cast_vote(
    State(state): State<Arc<AppState>>,
    Path(proposal_id): Path<String>,
    Json(body): Json<VoteBody>,
) -> Result<Json<VoteResponse>> {
    let clamped = body.eth_percent.clamp(0, 100);
    let ok = verify_vote(&body.address, clamped, body.timestamp, &body.signature)
        .map_err(treasury_core::CoreError::from)?;
    if !ok {
        return Err(ApiError::Unauthorized("vote signature invalid or expired".to_string()));
    }

    let stats = state
        .ledger
        .get_user_stats(&body.address)
        .await?
        .ok_or_else(|| ApiError::BadRequest("address has no recorded deposit".to_string()))?;
    if stats.total_value_minor_units.is_zero() {
        return Err(ApiError::BadRequest("address has no recorded deposit".to_string()));
    }

    state
        .votes
        .record_allocation_vote(&proposal_id, &body.address, clamped, &stats.total_value_minor_units)
        .await?;
    let totals = state.votes.get_allocation_vote_results(&proposal_id).await?;

    if proposal_id == state.active_proposal_id {
        state
            .queue
            .enqueue(JobType::Rebalance, JobPayload::rebalance("vote", None), EnqueueOptions::default())
            .await?;
    }

    Ok(Json(VoteResponse {
        weighted_eth_percent: totals.weighted_eth_percent,
        total_weight: totals.total_weight,
        total_voters: totals.total_voters,
    }))
}
