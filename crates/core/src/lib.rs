//! Server-side core of a shared custodial treasury on an EVM L2: the
//! durable job queue, deposit-weighted vote aggregation, rebalance
//! planner/executor, and settlement executor. Everything here is injected
//! with its dependencies at construction and talks to the outside world
//! only through the capability traits in `treasury_chain` and `kv`.

pub mod config;
pub mod error;
pub mod heartbeat;
pub mod kv;
pub mod ledger;
pub mod lock;
pub mod pricing;
pub mod queue;
pub mod rebalance;
pub mod settlement;
pub mod telemetry;
pub mod treasury;
pub mod types;
pub mod votes;

pub use config::TreasuryConfig;
pub use error::{CoreError, Result};
pub use heartbeat::{Heartbeat, NullHeartbeat};
pub use ledger::{DepositLedger, TransactionRecord, UserStats};
pub use lock::{LockGuard, LockRegistry};
pub use pricing::{PriceCache, PriceSnapshot};
pub use queue::{
    EnqueueOptions, Job, JobHandle, JobPayload, JobQueue, JobType, RebalanceJobPayload, RebalanceReason,
    SettlementJobPayload,
};
pub use rebalance::{RebalanceOutcome, RebalancePlanner};
pub use settlement::{SettlementExecutor, SettlementPlanner, SettlementState, SettlementStatus};
pub use treasury::{TreasuryReader, TreasurySnapshot};
pub use types::{Asset, AssetKind, AssetTransferPlan};
pub use votes::{AggregationTotals, AllocationVote, VoteStore};
