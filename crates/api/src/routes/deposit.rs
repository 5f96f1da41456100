//! Deposit webhook: looks the transaction up on-chain rather
//! than trusting the caller's body, validates it, records it, and kicks off
//! a rebalance.

use std::sync::Arc;

use axum::{extract::State, Json};
use chrono::Utc;
use num_traits::Zero;
use tracing::info;
use treasury_core::ledger::TransactionRecord;
use treasury_core::queue::{EnqueueOptions, JobPayload, JobType};

use crate::error::{ApiError, Result};
use crate::models::{DepositResponse, DepositWebhookBody};
use crate::state::AppState;

#[utoipa::path(
    post,
    path = "/webhooks/deposit",
    tag = "deposit",
    request_body = DepositWebhookBody,
    responses(
        (status = 200, description = "Deposit recorded or already known", body = DepositResponse),
        (status = 400, description = "Transaction invalid or does not target the vault"),
    )
)]
pub async fn record_deposit(
    State(state): State<Arc<AppState>>,
    Json(body): Json<DepositWebhookBody>,
) -> Result<Json<DepositResponse>> {
    let detail = state
        .chain
        .get_transaction(&body.hash)
        .await
        .map_err(treasury_core::CoreError::from)?
        .ok_or_else(|| ApiError::BadRequest(format!("unknown transaction: {}", body.hash)))?;

    if detail.status != Some(true) {
        return Err(ApiError::BadRequest("transaction did not succeed".to_string()));
    }
    if let Some(chain_id) = detail.chain_id {
        if chain_id != state.chain.chain_id() {
            return Err(ApiError::Forbidden("transaction was mined on a different chain".to_string()));
        }
    }
    let recipient = detail.to.as_deref().unwrap_or_default();
    if !recipient.eq_ignore_ascii_case(state.chain.vault_address()) {
        return Err(ApiError::Forbidden("transaction recipient is not the vault".to_string()));
    }
    if detail.confirmations < state.required_confirmations {
        return Err(ApiError::BadRequest("not enough confirmations yet".to_string()));
    }
    if detail.value < state.required_deposit_minor_units || detail.value.is_zero() {
        return Err(ApiError::BadRequest("deposit value below the required minimum".to_string()));
    }

    let record = TransactionRecord {
        hash: detail.hash.clone(),
        from: detail.from.clone(),
        to: recipient.to_string(),
        value_minor_units: detail.value.clone(),
        block_number: detail.block_number.unwrap_or(0),
        block_hash: detail.block_hash.clone().unwrap_or_default(),
        timestamp: Utc::now(),
        chain_id: detail.chain_id.unwrap_or_else(|| state.chain.chain_id()),
        confirmations: detail.confirmations,
    };

    let newly_recorded = state.ledger.record_deposit(&record).await?;
    if newly_recorded {
        info!(hash = %detail.hash, from = %detail.from, "deposit recorded");
        state
            .queue
            .enqueue(JobType::Rebalance, JobPayload::rebalance("deposit", None), EnqueueOptions::default())
            .await?;
    }

    let stats = state.ledger.get_user_stats(&detail.from).await?.unwrap_or_default();
    Ok(Json(DepositResponse {
        recorded: newly_recorded,
        total_value_minor_units: stats.total_value_minor_units.to_string(),
        total_transactions: stats.total_transactions,
    }))
}
