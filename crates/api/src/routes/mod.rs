//! API routes

pub mod claim;
pub mod deposit;
pub mod health;
pub mod rebalance;
pub mod status;
pub mod vote;

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

use crate::state::AppState;

/// Builds the main router: every handler here is a thin adapter that
/// validates its own request shape and delegates to `treasury_core`.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/webhooks/deposit", post(deposit::record_deposit))
        .route("/votes/:proposal_id", post(vote::cast_vote))
        .route("/claims", post(claim::submit_claim))
        .route("/rebalance/trigger", post(rebalance::trigger_rebalance))
        .route("/status/stream", get(status::status_stream))
        .with_state(state)
}
