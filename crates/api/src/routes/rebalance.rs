//! Manual rebalance trigger: an operator-facing escape hatch,
//! distinct from the automatic deposit/vote triggers the worker reacts to.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use treasury_core::queue::{EnqueueOptions, JobPayload, JobType};

use crate::error::{ApiError, Result};
use crate::models::{RebalanceTriggerBody, RebalanceTriggerResponse};
use crate::state::AppState;

#[utoipa::path(
    post,
    path = "/rebalance/trigger",
    tag = "rebalance",
    request_body = RebalanceTriggerBody,
    responses(
        (status = 200, description = "Rebalance job enqueued", body = RebalanceTriggerResponse),
        (status = 400, description = "`manual` must be true"),
    )
)]
pub async fn trigger_rebalance(
    State(state): State<Arc<AppState>>,
    Json(body): Json<RebalanceTriggerBody>,
) -> Result<Json<RebalanceTriggerResponse>> {
    if !body.manual {
        return Err(ApiError::BadRequest("manual must be true to trigger a rebalance".to_string()));
    }

    let job = state
        .queue
        .enqueue(JobType::Rebalance, JobPayload::rebalance("manual", None), EnqueueOptions::default())
        .await?;

    Ok(Json(RebalanceTriggerResponse { enqueued: job.is_some(), job_id: job.map(|j| j.id) }))
}
