//! Shared application state, built once at startup and handed to every
//! handler behind an `Arc`.

use std::sync::Arc;
use std::time::Duration;

use num_bigint::BigInt;
use treasury_chain::{derive_address_from_key, EvmClient, JsonRpcEvmClient};
use treasury_core::kv::{KvStore, RedisStore};
use treasury_core::{
    Asset, CoreError, DepositLedger, JobQueue, LockRegistry, Result, SettlementPlanner, TreasuryConfig, VoteStore,
};

pub struct AppState {
    pub kv: Arc<dyn KvStore>,
    pub ledger: Arc<DepositLedger>,
    pub votes: Arc<VoteStore>,
    pub queue: Arc<JobQueue>,
    pub settlement: SettlementPlanner,
    pub chain: Arc<dyn EvmClient>,
    pub assets: Vec<Asset>,
    pub active_proposal_id: String,
    pub required_deposit_minor_units: BigInt,
    pub required_confirmations: u64,
    pub status_poll_interval: Duration,
    pub version: String,
    pub claim_by_id_max_skip: usize,
    pub settlement_execute: bool,
}

impl AppState {
    /// Builds every dependency from `config`. The chain client only needs
    /// read access here — every write happens through the worker, never
    /// synchronously inside a request handler — but a signing key is
    /// accepted too so a single `.env` can drive both binaries.
    pub async fn connect(config: &TreasuryConfig) -> Result<Self> {
        let kv: Arc<dyn KvStore> = Arc::new(RedisStore::connect(&config.redis_url).await?);
        let locks = Arc::new(LockRegistry::new(kv.clone()));
        let queue = Arc::new(JobQueue::new(kv.clone(), locks, config.job_lock_ttl_secs, config.job_max_age_secs));
        let ledger = Arc::new(DepositLedger::new(kv.clone()));
        let votes = Arc::new(VoteStore::new(kv.clone(), ledger.clone()));
        let settlement = SettlementPlanner::new(kv.clone(), ledger.clone(), queue.clone(), config.settlement_max_age_secs);

        let chain: Arc<dyn EvmClient> = match &config.vault_signing_key {
            Some(key) => {
                if let Some(expected) = &config.vault_address_override {
                    match derive_address_from_key(key) {
                        Ok(derived) if !derived.eq_ignore_ascii_case(expected) => {
                            tracing::warn!(
                                derived,
                                expected,
                                "vault_address_override does not match the signing key's derived address; override wins"
                            );
                        }
                        Err(e) => tracing::warn!(error = %e, "could not derive address from vault signing key to check override"),
                        _ => {}
                    }
                }
                Arc::new(JsonRpcEvmClient::with_signing_key(
                    &config.rpc_url,
                    config.chain_id,
                    key,
                    config.vault_address_override.as_deref(),
                )?)
            }
            None => {
                let vault = config.vault_address_override.as_deref().ok_or_else(|| CoreError::InvalidConfig {
                    field: "vault_address_override".to_string(),
                    reason: "required when no vault_signing_key is configured".to_string(),
                })?;
                Arc::new(JsonRpcEvmClient::read_only(&config.rpc_url, config.chain_id, vault)?)
            }
        };

        let required_deposit_minor_units: BigInt =
            config.required_deposit_minor_units.parse().map_err(|_| CoreError::InvalidConfig {
                field: "required_deposit_minor_units".to_string(),
                reason: "must be an integer string".to_string(),
            })?;

        Ok(Self {
            kv,
            ledger,
            votes,
            queue,
            settlement,
            chain,
            assets: config.assets.clone(),
            active_proposal_id: config.active_proposal_id.clone(),
            required_deposit_minor_units,
            required_confirmations: config.required_confirmations,
            status_poll_interval: Duration::from_millis(150),
            version: env!("CARGO_PKG_VERSION").to_string(),
            claim_by_id_max_skip: config.claim_by_id_max_skip,
            settlement_execute: config.settlement_execute,
        })
    }
}
