//! The worker's single logical loop: claim a job, dispatch it to the
//! rebalance planner or the settlement executor, heartbeat while it runs,
//! ack on success or requeue/fail on error.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};
use treasury_chain::{
    derive_address_from_key, AggregatorClient, CoinbasePriceOracle, EvmClient, HttpAggregatorClient, JsonRpcEvmClient,
    PriceOracleClient,
};
use treasury_core::kv::{KvStore, RedisStore};
use treasury_core::queue::{JobHandle, JobPayload, JobType};
use treasury_core::{
    DepositLedger, Heartbeat, JobQueue, LockRegistry, PriceCache, RebalancePlanner, Result, SettlementExecutor,
    TreasuryConfig, VoteStore,
};

/// Owns every dependency the worker talks to and runs the claim/dispatch
/// loop until the process is killed.
pub struct WorkerLoop {
    kv: Arc<dyn KvStore>,
    queue: Arc<JobQueue>,
    ledger: Arc<DepositLedger>,
    votes: Arc<VoteStore>,
    prices: PriceCache,
    chain: Box<dyn EvmClient>,
    aggregator: Box<dyn AggregatorClient>,
    assets: Vec<treasury_core::Asset>,
    active_proposal_id: String,
    slippage_bps: u32,
    tolerance_percent: f64,
    min_usd_delta: u64,
    rebalance_history_limit: usize,
    rebalance_execute: bool,
    settlement_execute: bool,
    poll_interval: Duration,
}

impl WorkerLoop {
    /// Builds every dependency from `config`: connects to Redis, loads the
    /// vault signing key (if configured, otherwise the client is read-only
    /// and `rebalance_execute`/`settlement_execute` must both be false), and
    /// wires the aggregator and price oracle HTTP clients.
    pub async fn connect(config: &TreasuryConfig) -> Result<Self> {
        if let (true, None) = (config.rebalance_execute || config.settlement_execute, &config.vault_signing_key) {
            return Err(treasury_core::CoreError::InvalidConfig {
                field: "vault_signing_key".to_string(),
                reason: "required when rebalance_execute or settlement_execute is true".to_string(),
            });
        }

        let kv: Arc<dyn KvStore> = Arc::new(RedisStore::connect(&config.redis_url).await?);
        let locks = Arc::new(LockRegistry::new(kv.clone()));
        let queue = Arc::new(JobQueue::new(kv.clone(), locks, config.job_lock_ttl_secs, config.job_max_age_secs));
        let ledger = Arc::new(DepositLedger::new(kv.clone()));
        let votes = Arc::new(VoteStore::new(kv.clone(), ledger.clone()));

        let oracle: Arc<dyn PriceOracleClient> = match &config.price_oracle_base_url {
            Some(url) => Arc::new(CoinbasePriceOracle::new(url.clone())),
            None => Arc::new(CoinbasePriceOracle::default()),
        };
        let prices = PriceCache::new(kv.clone(), oracle, config.price_cache_ttl_secs);

        let chain: Box<dyn EvmClient> = match &config.vault_signing_key {
            Some(key) => {
                if let Some(expected) = &config.vault_address_override {
                    match derive_address_from_key(key) {
                        Ok(derived) if !derived.eq_ignore_ascii_case(expected) => {
                            warn!(derived, expected, "vault_address_override does not match the signing key's derived address; override wins");
                        }
                        Err(e) => warn!(error = %e, "could not derive address from vault signing key to check override"),
                        _ => {}
                    }
                }
                Box::new(JsonRpcEvmClient::with_signing_key(
                    &config.rpc_url,
                    config.chain_id,
                    key,
                    config.vault_address_override.as_deref(),
                )?)
            }
            None => {
                let vault = config
                    .vault_address_override
                    .as_deref()
                    .ok_or_else(|| treasury_core::CoreError::InvalidConfig {
                        field: "vault_address_override".to_string(),
                        reason: "required when no vault_signing_key is configured".to_string(),
                    })?;
                Box::new(JsonRpcEvmClient::read_only(&config.rpc_url, config.chain_id, vault)?)
            }
        };

        let aggregator: Box<dyn AggregatorClient> = Box::new(HttpAggregatorClient::new(config.aggregator_base_url.clone()));

        Ok(Self {
            kv,
            queue,
            ledger,
            votes,
            prices,
            chain,
            aggregator,
            assets: config.assets.clone(),
            active_proposal_id: config.active_proposal_id.clone(),
            slippage_bps: config.slippage_bps_clamped(),
            tolerance_percent: config.tolerance_percent,
            min_usd_delta: config.min_usd_delta,
            rebalance_history_limit: config.rebalance_history_limit,
            rebalance_execute: config.rebalance_execute,
            settlement_execute: config.settlement_execute,
            poll_interval: Duration::from_millis(config.worker_poll_interval_ms),
        })
    }

    /// Runs forever: claim, dispatch, ack/fail, repeat. Never returns `Err`
    /// for a single job's failure — that's carried in the ack/fail outcome,
    /// not propagated to the caller. Only a queue-level claim error is
    /// logged and backed off from.
    pub async fn run(&self) -> ! {
        info!("worker loop starting");
        loop {
            match self.queue.claim_next().await {
                Ok(Some(handle)) => self.handle_job(handle).await,
                Ok(None) => tokio::time::sleep(self.poll_interval).await,
                Err(e) => {
                    error!(error = %e, "claim_next failed");
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }
    }

    async fn handle_job(&self, handle: JobHandle) {
        let job_id = handle.job().id.clone();
        let job_type = handle.job().job_type;

        match self.dispatch(&handle).await {
            Ok(()) => {
                info!(job_id, ?job_type, "job completed");
                if let Err(e) = handle.ack().await {
                    error!(job_id, error = %e, "failed to ack completed job");
                }
            }
            Err(e) => {
                let requeue = e.is_retryable();
                match e.log_level() {
                    tracing::Level::ERROR => error!(job_id, ?job_type, requeue, error = %e, "job failed"),
                    tracing::Level::WARN => warn!(job_id, ?job_type, requeue, error = %e, "job failed"),
                    _ => debug!(job_id, ?job_type, requeue, error = %e, "job failed"),
                }
                if let Err(fail_err) = handle.fail(requeue).await {
                    error!(job_id, error = %fail_err, "failed to mark job as failed");
                }
            }
        }
    }

    async fn dispatch(&self, handle: &JobHandle) -> Result<()> {
        match handle.job().payload.clone() {
            JobPayload::Rebalance(payload) => {
                debug!(reason = ?payload.reason, "running rebalance job");
                let totals = self.votes.get_allocation_vote_results(&self.active_proposal_id).await?;
                let planner = RebalancePlanner::new(
                    self.kv.clone(),
                    self.chain.as_ref(),
                    self.aggregator.as_ref(),
                    &self.prices,
                    &self.assets,
                    self.slippage_bps,
                    self.tolerance_percent,
                    self.min_usd_delta,
                    self.rebalance_history_limit,
                    self.rebalance_execute,
                );
                let outcome = planner.run(totals.weighted_eth_percent, handle).await?;
                info!(mode = %outcome.mode, message = ?outcome.message, "rebalance outcome recorded");
                Ok(())
            }
            JobPayload::Settlement(payload) => {
                debug!(address = %payload.address, "running settlement job");
                let executor = SettlementExecutor::new(
                    self.kv.clone(),
                    self.ledger.clone(),
                    self.votes.clone(),
                    self.queue.clone(),
                    self.chain.as_ref(),
                    self.settlement_execute,
                );
                executor
                    .run(&handle.job().id, &payload, &self.active_proposal_id, handle)
                    .await
            }
        }
    }

    pub async fn job_type_in_flight(&self, job_type: Option<JobType>) -> Result<bool> {
        self.queue.is_processing(job_type).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

    use async_trait::async_trait;
    use num_bigint::BigInt;
    use treasury_chain::{
        types::{AggregatorQuote, AggregatorTransaction, BlockHeader, SendTransactionRequest, TransactionReceipt},
        BlockTag, ChainError, PriceOracleClient, QuoteRequest,
    };
    use treasury_core::kv::MemoryStore;
    use treasury_core::{EnqueueOptions, JobPayload, JobType};

    use super::*;

    struct FakeChain {
        vault: String,
    }

    #[async_trait]
    impl EvmClient for FakeChain {
        fn vault_address(&self) -> &str {
            &self.vault
        }
        fn chain_id(&self) -> u64 {
            8453
        }
        async fn get_balance(&self, _address: &str) -> treasury_chain::Result<BigInt> {
            Ok(BigInt::from(0))
        }
        async fn get_bytecode(&self, _address: &str) -> treasury_chain::Result<Vec<u8>> {
            Ok(vec![])
        }
        async fn read_erc20_balance(&self, _token: &str, _owner: &str) -> treasury_chain::Result<BigInt> {
            Ok(BigInt::from(0))
        }
        async fn read_erc20_allowance(&self, _token: &str, _owner: &str, _spender: &str) -> treasury_chain::Result<BigInt> {
            Ok(BigInt::from(0))
        }
        async fn get_block(&self, _tag: BlockTag) -> treasury_chain::Result<Option<BlockHeader>> {
            Ok(Some(BlockHeader { number: 100, hash: "0xblock".to_string(), timestamp: 0 }))
        }
        async fn get_block_number(&self) -> treasury_chain::Result<u64> {
            Ok(100)
        }
        async fn get_transaction_receipt(&self, _hash: &str) -> treasury_chain::Result<Option<TransactionReceipt>> {
            Ok(None)
        }
        async fn get_transaction(&self, _hash: &str) -> treasury_chain::Result<Option<treasury_chain::TransactionDetail>> {
            Ok(None)
        }
        async fn send_transaction(&self, _req: SendTransactionRequest) -> treasury_chain::Result<String> {
            Err(ChainError::OperationFailed("not used in this test".to_string()))
        }
        async fn wait_for_transaction_receipt(&self, _hash: &str) -> treasury_chain::Result<TransactionReceipt> {
            Err(ChainError::OperationFailed("not used in this test".to_string()))
        }
        async fn approve_erc20(&self, _token: &str, _spender: &str, _amount: &BigInt) -> treasury_chain::Result<String> {
            Err(ChainError::OperationFailed("not used in this test".to_string()))
        }
    }

    struct FakeAggregator;

    #[async_trait]
    impl AggregatorClient for FakeAggregator {
        async fn get_quote(&self, _req: QuoteRequest<'_>) -> treasury_chain::Result<AggregatorQuote> {
            Ok(AggregatorQuote {
                buy_amount: BigInt::from(0),
                sell_amount: BigInt::from(0),
                issues: None,
                transaction: AggregatorTransaction {
                    to: "0xrouter".to_string(),
                    data: "0x".to_string(),
                    gas: None,
                    gas_price: None,
                    value: None,
                },
                route: None,
            })
        }
    }

    struct FakeOracle {
        price: AtomicU64,
    }

    #[async_trait]
    impl PriceOracleClient for FakeOracle {
        async fn spot_price_usd(&self, _symbol: &str) -> treasury_chain::Result<f64> {
            Ok(self.price.load(Ordering::SeqCst) as f64)
        }
    }

    fn worker_for_empty_queue() -> (WorkerLoop, Arc<JobQueue>) {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let locks = Arc::new(LockRegistry::new(kv.clone()));
        let queue = Arc::new(JobQueue::new(kv.clone(), locks, 120, 300));
        let ledger = Arc::new(DepositLedger::new(kv.clone()));
        let votes = Arc::new(VoteStore::new(kv.clone(), ledger.clone()));
        let oracle: Arc<dyn PriceOracleClient> = Arc::new(FakeOracle { price: AtomicU64::new(2000) });
        let prices = PriceCache::new(kv.clone(), oracle, 60);

        let worker = WorkerLoop {
            kv,
            queue: queue.clone(),
            ledger,
            votes,
            prices,
            chain: Box::new(FakeChain { vault: "0xvault".to_string() }),
            aggregator: Box::new(FakeAggregator),
            assets: vec![],
            active_proposal_id: "current".to_string(),
            slippage_bps: 100,
            tolerance_percent: 1.0,
            min_usd_delta: 5,
            rebalance_history_limit: 20,
            rebalance_execute: false,
            settlement_execute: false,
            poll_interval: Duration::from_millis(1),
        };
        (worker, queue)
    }

    #[tokio::test]
    async fn rebalance_dry_run_job_acks_on_zero_balance() {
        let (worker, queue) = worker_for_empty_queue();
        queue
            .enqueue(JobType::Rebalance, JobPayload::rebalance("manual", None), EnqueueOptions::default())
            .await
            .unwrap();

        let handle = queue.claim_next().await.unwrap().unwrap();
        worker.handle_job(handle).await;

        assert_eq!(queue.size().await.unwrap(), 0);
        assert!(!worker.job_type_in_flight(None).await.unwrap());
    }

    #[tokio::test]
    async fn claim_next_on_empty_queue_returns_none() {
        let (_worker, queue) = worker_for_empty_queue();
        assert!(queue.claim_next().await.unwrap().is_none());
    }
}
