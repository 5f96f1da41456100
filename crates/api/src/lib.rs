//! Treasury API Server
//!
//! Thin HTTP adapters over `treasury_core`: the deposit webhook, the vote
//! and claim endpoints, the manual rebalance trigger, a status stream, and
//! a health check. No business logic lives here — every handler validates
//! its own request shape and then delegates straight to core.

pub mod docs;
pub mod error;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod server;
pub mod state;

pub use docs::ApiDoc;
pub use error::{ApiError, Result};
pub use server::{Server, ServerConfig};
pub use state::AppState;
