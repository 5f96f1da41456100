//! Process-wide configuration, layered entirely over environment variables.

use serde::Deserialize;

use crate::types::Asset;

#[derive(Debug, Clone, Deserialize)]
pub struct TreasuryConfig {
    /// Redis connection string, e.g. `redis://127.0.0.1:6379`.
    pub redis_url: String,

    /// Vault signing key (hex, no `0x` prefix). Required for execute mode.
    pub vault_signing_key: Option<String>,

    /// Optional explicit vault address override; must match the key-derived
    /// address if both are present (mismatch warns, override wins).
    pub vault_address_override: Option<String>,

    /// JSON-RPC URL for the target L2.
    pub rpc_url: String,

    /// Target L2 chain id.
    pub chain_id: u64,

    /// Configured vault assets, in the order used for deterministic
    /// first-overweight/first-underweight selection.
    pub assets: Vec<Asset>,

    /// Base URL of the external quote aggregator.
    pub aggregator_base_url: String,

    /// Base URL of the coin-price oracle. Defaults to Coinbase's public
    /// spot price API when unset.
    pub price_oracle_base_url: Option<String>,

    /// Minimum native-asset value (minor units) required for a deposit to
    /// be recorded.
    #[serde(default = "default_required_deposit_minor_units")]
    pub required_deposit_minor_units: String,

    /// Minimum confirmations before a deposit webhook is accepted.
    #[serde(default = "default_required_confirmations")]
    pub required_confirmations: u64,

    /// false => planner returns `dry-run`; true => submits transactions.
    #[serde(default)]
    pub rebalance_execute: bool,

    /// false => settlement executor returns `dry-run` without transfers.
    #[serde(default)]
    pub settlement_execute: bool,

    /// Aggregator slippage tolerance in basis points, clamped to [1, 500].
    #[serde(default = "default_slippage_bps")]
    pub slippage_bps: u32,

    /// Lower bound on tolerance, in whole USD.
    #[serde(default = "default_min_usd_delta")]
    pub min_usd_delta: u64,

    /// Upper component of tolerance, as a percent of total USD value.
    #[serde(default = "default_tolerance_percent")]
    pub tolerance_percent: f64,

    /// Ring-buffer size for rebalance outcome history.
    #[serde(default = "default_rebalance_history_limit")]
    pub rebalance_history_limit: usize,

    /// Staleness threshold for settlement dedup, in seconds.
    #[serde(default = "default_settlement_max_age_secs")]
    pub settlement_max_age_secs: i64,

    /// Price cache TTL, in seconds.
    #[serde(default = "default_price_cache_ttl_secs")]
    pub price_cache_ttl_secs: u64,

    /// Worker-scoped lock/processing-record TTL, in seconds.
    #[serde(default = "default_job_lock_ttl_secs")]
    pub job_lock_ttl_secs: u64,

    /// Request-scoped lock TTL, in seconds.
    #[serde(default = "default_request_lock_ttl_secs")]
    pub request_lock_ttl_secs: u64,

    /// Job dedup key TTL, in seconds.
    #[serde(default = "default_job_dedupe_ttl_secs")]
    pub job_dedupe_ttl_secs: u64,

    /// Stale-job sweeper max age, in seconds.
    #[serde(default = "default_job_max_age_secs")]
    pub job_max_age_secs: i64,

    /// Maximum jobs `ClaimById` will skip while scanning for a match.
    #[serde(default = "default_claim_by_id_max_skip")]
    pub claim_by_id_max_skip: usize,

    /// The one continuous allocation proposal this deployment runs (see
    /// the non-goal excluding proposal lifecycles).
    #[serde(default = "default_active_proposal_id")]
    pub active_proposal_id: String,

    /// How long the worker sleeps after an empty `claim_next` before
    /// polling the queue again, in milliseconds.
    #[serde(default = "default_worker_poll_interval_ms")]
    pub worker_poll_interval_ms: u64,

    /// Interface the HTTP API binds to.
    #[serde(default = "default_api_host")]
    pub api_host: String,

    /// Port the HTTP API binds to.
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Whether the HTTP API sends permissive CORS headers.
    #[serde(default = "default_api_enable_cors")]
    pub api_enable_cors: bool,
}

fn default_required_deposit_minor_units() -> String {
    "0".to_string()
}
fn default_required_confirmations() -> u64 {
    1
}
fn default_slippage_bps() -> u32 {
    100
}
fn default_min_usd_delta() -> u64 {
    5
}
fn default_tolerance_percent() -> f64 {
    1.0
}
fn default_rebalance_history_limit() -> usize {
    20
}
fn default_settlement_max_age_secs() -> i64 {
    300
}
fn default_price_cache_ttl_secs() -> u64 {
    60
}
fn default_job_lock_ttl_secs() -> u64 {
    120
}
fn default_request_lock_ttl_secs() -> u64 {
    30
}
fn default_job_dedupe_ttl_secs() -> u64 {
    300
}
fn default_job_max_age_secs() -> i64 {
    300
}
fn default_claim_by_id_max_skip() -> usize {
    64
}
fn default_active_proposal_id() -> String {
    "current".to_string()
}
fn default_worker_poll_interval_ms() -> u64 {
    2000
}
fn default_api_host() -> String {
    "0.0.0.0".to_string()
}
fn default_api_port() -> u16 {
    3000
}
fn default_api_enable_cors() -> bool {
    true
}

impl TreasuryConfig {
    pub fn load() -> std::result::Result<Self, config::ConfigError> {
        let cfg = config::Config::builder()
            .add_source(config::Environment::default().separator("__").try_parsing(true))
            .build()?;
        cfg.try_deserialize()
    }

    pub fn from_env() -> std::result::Result<Self, config::ConfigError> {
        Self::load()
    }

    pub fn slippage_bps_clamped(&self) -> u32 {
        self.slippage_bps.clamp(1, 500)
    }

    pub fn native_asset(&self) -> Option<&Asset> {
        self.assets.iter().find(|a| a.is_native())
    }
}
