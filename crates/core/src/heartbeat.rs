//! Heartbeat capability threaded through long-running job executors so they
//! can refresh lock/processing-record TTLs around suspension points
//!` before/after each suspension point").

use async_trait::async_trait;

use crate::error::Result;

#[async_trait]
pub trait Heartbeat: Send + Sync {
    async fn beat(&self) -> Result<()>;
}

/// Used by tests and one-shot synchronous callers where no job lock backs
/// the operation.
pub struct NullHeartbeat;

#[async_trait]
impl Heartbeat for NullHeartbeat {
    async fn beat(&self) -> Result<()> {
        Ok(())
    }
}
