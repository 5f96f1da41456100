//! Settlement plan computation and transfer execution.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use num_bigint::BigInt;
use num_traits::Zero;
use serde::{Deserialize, Serialize};
use treasury_chain::{evm::encode_erc20_transfer, types::SendTransactionRequest, EvmClient};
use uuid::Uuid;

use crate::error::{CoreError, Result};
use crate::heartbeat::Heartbeat;
use crate::kv::{KvStore, KvStoreExt, Pipeline, SetOptions};
use crate::ledger::DepositLedger;
use crate::queue::{EnqueueOptions, JobPayload, JobQueue, JobType, SettlementJobPayload};
use crate::treasury::TreasuryReader;
use crate::types::{lowercase_address, Asset, AssetTransferPlan};
use crate::votes::VoteStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettlementState {
    Queued,
    Executing,
    Executed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementStatus {
    pub address: String,
    pub job_id: String,
    pub state: SettlementState,
    pub share: f64,
    pub plan: Vec<AssetTransferPlan>,
    pub tx_hashes: Vec<String>,
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn user_status_key(address: &str) -> String {
    format!("settlement:user:{}", lowercase_address(address))
}

fn job_status_key(job_id: &str) -> String {
    format!("settlement:job:{job_id}")
}

const SETTLEMENT_HISTORY_KEY: &str = "settlement:history";
const SETTLEMENT_HISTORY_LIMIT: i64 = 100;

pub struct SettlementPlanner {
    kv: Arc<dyn KvStore>,
    ledger: Arc<DepositLedger>,
    queue: Arc<JobQueue>,
    settlement_max_age_secs: i64,
}

impl SettlementPlanner {
    pub fn new(kv: Arc<dyn KvStore>, ledger: Arc<DepositLedger>, queue: Arc<JobQueue>, settlement_max_age_secs: i64) -> Self {
        Self { kv, ledger, queue, settlement_max_age_secs }
    }

    /// Computes a pro-rata transfer plan for `address` and enqueues a
    /// settlement job, honoring the dedup rules below. Returns the
    /// queued (or pre-existing) status plus whether a new job was created.
    pub async fn claim(&self, address: &str, assets: &[Asset], chain: &dyn EvmClient) -> Result<(SettlementStatus, bool)> {
        let address = lowercase_address(address);

        if let Some(existing) = self.kv.get_json::<SettlementStatus>(&user_status_key(&address)).await? {
            let stale = matches!(existing.state, SettlementState::Queued | SettlementState::Executing | SettlementState::Failed)
                && Utc::now() - existing.updated_at > Duration::seconds(self.settlement_max_age_secs);

            let superseded_by_new_deposit = existing.state == SettlementState::Executed
                && self
                    .ledger
                    .get_user_stats(&address)
                    .await?
                    .map(|s| s.last_transaction_timestamp.map(|ts| ts > existing.updated_at).unwrap_or(false))
                    .unwrap_or(false);

            if !stale && !superseded_by_new_deposit {
                return Ok((existing, false));
            }

            self.kv.del(&user_status_key(&address)).await?;
            self.kv.del(&format!("jobs:dedupe:settlement:{address}")).await?;
        }

        let stats = self
            .ledger
            .get_user_stats(&address)
            .await?
            .ok_or_else(|| CoreError::NotADepositor(address.clone()))?;
        if stats.total_value_minor_units.is_zero() {
            return Err(CoreError::NotADepositor(address));
        }

        let total_deposits = self.ledger.total_deposits_minor_units().await?;
        if total_deposits.is_zero() {
            return Err(CoreError::NotADepositor(address));
        }

        let claimant_minor = stats.total_value_minor_units.clone();
        let share = claimant_share_f64(&claimant_minor, &total_deposits);

        let chain_assets = TreasuryReader::new(chain, assets).read().await?;
        let mut plan = Vec::with_capacity(assets.len());
        for asset in assets {
            let bal = chain_assets.balance_of(&asset.id);
            let amount = &bal * &claimant_minor / &total_deposits;
            plan.push(AssetTransferPlan {
                asset_id: asset.id.clone(),
                symbol: asset.symbol.clone(),
                kind: asset.kind,
                token_address: asset.token_address.clone(),
                decimals: asset.decimals,
                amount_formatted: format_minor_units(&amount, asset.decimals),
                amount_minor_units: amount,
            });
        }

        let request_id = Uuid::new_v4().to_string();
        let payload = SettlementJobPayload {
            address: address.clone(),
            share,
            plan: plan.clone(),
            total_deposits_minor_units: total_deposits.to_string(),
            request_id: request_id.clone(),
            requested_at: Utc::now(),
        };

        let job = self
            .queue
            .enqueue(
                JobType::Settlement,
                JobPayload::Settlement(payload),
                EnqueueOptions {
                    dedupe_key: Some(format!("settlement:{address}")),
                    dedupe_ttl_secs: self.settlement_max_age_secs.max(1) as u64,
                },
            )
            .await?;

        let Some(job) = job else {
            // Another request won the dedup race; return whatever status it wrote.
            let status = self
                .kv
                .get_json::<SettlementStatus>(&user_status_key(&address))
                .await?
                .ok_or_else(|| CoreError::OperationFailed("settlement dedup race left no status".to_string()))?;
            return Ok((status, false));
        };

        let now = Utc::now();
        let status = SettlementStatus {
            address: address.clone(),
            job_id: job.id.clone(),
            state: SettlementState::Queued,
            share,
            plan,
            tx_hashes: vec![],
            message: None,
            created_at: now,
            updated_at: now,
        };
        self.kv.set_json(&user_status_key(&address), &status, SetOptions::default()).await?;
        self.kv.set_json(&job_status_key(&job.id), &status, SetOptions::default()).await?;

        Ok((status, true))
    }

    pub async fn get_status(&self, address: &str) -> Result<Option<SettlementStatus>> {
        self.kv.get_json(&user_status_key(&lowercase_address(address))).await
    }
}

fn claimant_share_f64(claimant_minor: &BigInt, total: &BigInt) -> f64 {
    if total.is_zero() {
        return 0.0;
    }
    // Display-only; execution uses exact integer division.
    claimant_minor.to_string().parse::<f64>().unwrap_or(0.0) / total.to_string().parse::<f64>().unwrap_or(1.0)
}

fn format_minor_units(amount: &BigInt, decimals: u32) -> String {
    let unit = BigInt::from(10u64).pow(decimals);
    let whole = amount / &unit;
    let frac = (amount - &whole * &unit).to_string();
    let frac_padded = format!("{:0>width$}", frac, width = decimals as usize);
    format!("{whole}.{frac_padded}")
}

pub struct SettlementExecutor<'a> {
    kv: Arc<dyn KvStore>,
    ledger: Arc<DepositLedger>,
    votes: Arc<VoteStore>,
    queue: Arc<JobQueue>,
    chain: &'a dyn EvmClient,
    execute: bool,
}

impl<'a> SettlementExecutor<'a> {
    pub fn new(
        kv: Arc<dyn KvStore>,
        ledger: Arc<DepositLedger>,
        votes: Arc<VoteStore>,
        queue: Arc<JobQueue>,
        chain: &'a dyn EvmClient,
        execute: bool,
    ) -> Self {
        Self { kv, ledger, votes, queue, chain, execute }
    }

    /// Executes the transfers named in `payload`, updating persisted status
    /// as it goes.
    pub async fn run(&self, job_id: &str, payload: &SettlementJobPayload, proposal_id: &str, heartbeat: &dyn Heartbeat) -> Result<()> {
        let address = payload.address.clone();

        let mut status = self
            .kv
            .get_json::<SettlementStatus>(&user_status_key(&address))
            .await?
            .unwrap_or_else(|| SettlementStatus {
                address: address.clone(),
                job_id: job_id.to_string(),
                state: SettlementState::Queued,
                share: payload.share,
                plan: payload.plan.clone(),
                tx_hashes: vec![],
                message: None,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            });

        status.state = SettlementState::Executing;
        status.updated_at = Utc::now();
        self.persist_status(&status).await?;

        if !self.execute {
            status.state = SettlementState::Executed;
            status.message = Some("execution disabled".to_string());
            status.updated_at = Utc::now();
            self.persist_status(&status).await?;
            return Ok(());
        }

        let mut tx_hashes = Vec::new();
        for item in &payload.plan {
            if item.amount_minor_units.is_zero() {
                tracing::info!(asset = %item.asset_id, "skipped zero-amount settlement leg");
                continue;
            }

            heartbeat.beat().await?;
            let tx_result = self.execute_transfer(&address, item).await;
            heartbeat.beat().await?;

            match tx_result {
                Ok(hash) => tx_hashes.push(hash),
                Err(err) => {
                    status.state = SettlementState::Failed;
                    status.message = Some(err.to_string());
                    status.tx_hashes = tx_hashes;
                    status.updated_at = Utc::now();
                    self.persist_status(&status).await?;
                    return Err(CoreError::OperationFailed(format!("settlement transfer failed: {err}")));
                }
            }
        }

        self.ledger.mark_user_settled(&address).await?;
        self.votes.remove_allocation_vote(proposal_id, &address).await?;

        self.queue
            .enqueue(
                JobType::Rebalance,
                JobPayload::rebalance("manual", Some(serde_json::json!({"triggeredBy": "settlement", "address": address}))),
                EnqueueOptions::default(),
            )
            .await?;

        status.state = SettlementState::Executed;
        status.tx_hashes = tx_hashes;
        status.message = None;
        status.updated_at = Utc::now();
        self.persist_status(&status).await?;

        Ok(())
    }

    async fn execute_transfer(&self, claimant: &str, item: &AssetTransferPlan) -> treasury_chain::Result<String> {
        let tx_hash = if item.kind == crate::types::AssetKind::Native {
            self.chain
                .send_transaction(SendTransactionRequest {
                    to: claimant.to_string(),
                    value: Some(item.amount_minor_units.clone()),
                    data: None,
                    gas: None,
                    gas_price: None,
                })
                .await?
        } else {
            let token_address = item.token_address.as_deref().ok_or_else(|| {
                treasury_chain::ChainError::OperationFailed(format!("token asset {} missing address", item.asset_id))
            })?;
            let data = encode_erc20_transfer(claimant, &item.amount_minor_units)?;
            self.chain
                .send_transaction(SendTransactionRequest {
                    to: token_address.to_string(),
                    value: None,
                    data: Some(data),
                    gas: None,
                    gas_price: None,
                })
                .await?
        };
        self.chain.wait_for_transaction_receipt(&tx_hash).await?;
        Ok(tx_hash)
    }

    async fn persist_status(&self, status: &SettlementStatus) -> Result<()> {
        let bytes = serde_json::to_vec(status)?;
        Pipeline::new(self.kv.as_ref())
            .set(user_status_key(&status.address), bytes.clone(), SetOptions::default())
            .set(job_status_key(&status.job_id), bytes.clone(), SetOptions::default())
            .lpush(SETTLEMENT_HISTORY_KEY, bytes)
            .ltrim(SETTLEMENT_HISTORY_KEY, 0, SETTLEMENT_HISTORY_LIMIT - 1)
            .execute()
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heartbeat::NullHeartbeat;
    use crate::kv::MemoryStore;
    use crate::ledger::TransactionRecord;
    use crate::lock::LockRegistry;
    use crate::types::AssetKind;
    use async_trait::async_trait;
    use treasury_chain::types::{BlockHeader, TransactionReceipt};

    struct FakeChain;

    #[async_trait]
    impl EvmClient for FakeChain {
        fn vault_address(&self) -> &str {
            "0xVault"
        }
        fn chain_id(&self) -> u64 {
            8453
        }
        async fn get_balance(&self, _a: &str) -> treasury_chain::Result<BigInt> {
            Ok(BigInt::from(2_000_000_000_000_000_000_i128))
        }
        async fn get_bytecode(&self, _a: &str) -> treasury_chain::Result<Vec<u8>> {
            Ok(vec![0x60])
        }
        async fn read_erc20_balance(&self, _t: &str, _o: &str) -> treasury_chain::Result<BigInt> {
            Ok(BigInt::from(1_000_000))
        }
        async fn read_erc20_allowance(&self, _t: &str, _o: &str, _s: &str) -> treasury_chain::Result<BigInt> {
            Ok(BigInt::from(0))
        }
        async fn get_block(&self, _tag: treasury_chain::BlockTag) -> treasury_chain::Result<Option<BlockHeader>> {
            Ok(Some(BlockHeader { number: 1, hash: "0xb".to_string(), timestamp: 1 }))
        }
        async fn get_block_number(&self) -> treasury_chain::Result<u64> {
            Ok(1)
        }
        async fn get_transaction_receipt(&self, _h: &str) -> treasury_chain::Result<Option<TransactionReceipt>> {
            Ok(None)
        }
        async fn get_transaction(&self, _h: &str) -> treasury_chain::Result<Option<treasury_chain::types::TransactionDetail>> {
            Ok(None)
        }
        async fn send_transaction(&self, _req: SendTransactionRequest) -> treasury_chain::Result<String> {
            Ok("0xtransfer".to_string())
        }
        async fn wait_for_transaction_receipt(&self, hash: &str) -> treasury_chain::Result<TransactionReceipt> {
            Ok(TransactionReceipt { hash: hash.to_string(), status: true, block_number: 2 })
        }
        async fn approve_erc20(&self, _t: &str, _s: &str, _a: &BigInt) -> treasury_chain::Result<String> {
            Ok("0xapprove".to_string())
        }
    }

    fn assets() -> Vec<Asset> {
        vec![
            Asset { id: "eth".into(), kind: AssetKind::Native, symbol: "ETH".into(), token_address: None, decimals: 18, price_feed_id: "ETH".into() },
            Asset { id: "usdc".into(), kind: AssetKind::Token, symbol: "USDC".into(), token_address: Some("0xUsdc".into()), decimals: 6, price_feed_id: "USDC".into() },
        ]
    }

    #[tokio::test]
    async fn claim_computes_prorata_plan_s5() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let ledger = Arc::new(DepositLedger::new(kv.clone()));
        let locks = Arc::new(LockRegistry::new(kv.clone()));
        let queue = Arc::new(JobQueue::new(kv.clone(), locks, 120, 300));
        let chain = FakeChain;

        ledger
            .record_deposit(&TransactionRecord {
                hash: "0x1".into(),
                from: "0xClaimant".into(),
                to: "0xVault".into(),
                value_minor_units: BigInt::from(250_000_000_000_000_000_i128),
                block_number: 1,
                block_hash: "0xb".into(),
                timestamp: Utc::now(),
                chain_id: 8453,
                confirmations: 1,
            })
            .await
            .unwrap();
        ledger
            .record_deposit(&TransactionRecord {
                hash: "0x2".into(),
                from: "0xOther".into(),
                to: "0xVault".into(),
                value_minor_units: BigInt::from(750_000_000_000_000_000_i128),
                block_number: 1,
                block_hash: "0xb".into(),
                timestamp: Utc::now(),
                chain_id: 8453,
                confirmations: 1,
            })
            .await
            .unwrap();

        let planner = SettlementPlanner::new(kv, ledger, queue, 300);
        let assets = assets();
        let (status, created) = planner.claim("0xClaimant", &assets, &chain).await.unwrap();

        assert!(created);
        assert_eq!(status.state, SettlementState::Queued);
        let native_leg = status.plan.iter().find(|p| p.asset_id == "eth").unwrap();
        assert_eq!(native_leg.amount_minor_units, BigInt::from(500_000_000_000_000_000_i128));
        let token_leg = status.plan.iter().find(|p| p.asset_id == "usdc").unwrap();
        assert_eq!(token_leg.amount_minor_units, BigInt::from(250_000));
    }

    #[tokio::test]
    async fn dedup_returns_existing_status_within_window() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let ledger = Arc::new(DepositLedger::new(kv.clone()));
        let locks = Arc::new(LockRegistry::new(kv.clone()));
        let queue = Arc::new(JobQueue::new(kv.clone(), locks, 120, 300));
        let chain = FakeChain;

        ledger
            .record_deposit(&TransactionRecord {
                hash: "0x1".into(),
                from: "0xClaimant".into(),
                to: "0xVault".into(),
                value_minor_units: BigInt::from(1_000_000_000_000_000_000_i128),
                block_number: 1,
                block_hash: "0xb".into(),
                timestamp: Utc::now(),
                chain_id: 8453,
                confirmations: 1,
            })
            .await
            .unwrap();

        let planner = SettlementPlanner::new(kv, ledger, queue, 300);
        let assets = assets();
        let (first, created_first) = planner.claim("0xClaimant", &assets, &chain).await.unwrap();
        let (second, created_second) = planner.claim("0xClaimant", &assets, &chain).await.unwrap();

        assert!(created_first);
        assert!(!created_second);
        assert_eq!(first.job_id, second.job_id);
    }

    #[tokio::test]
    async fn execute_marks_settled_and_removes_vote() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let ledger = Arc::new(DepositLedger::new(kv.clone()));
        let locks = Arc::new(LockRegistry::new(kv.clone()));
        let queue = Arc::new(JobQueue::new(kv.clone(), locks, 120, 300));
        let votes = Arc::new(VoteStore::new(kv.clone(), ledger.clone()));
        let chain = FakeChain;

        ledger
            .record_deposit(&TransactionRecord {
                hash: "0x1".into(),
                from: "0xClaimant".into(),
                to: "0xVault".into(),
                value_minor_units: BigInt::from(1_000_000_000_000_000_000_i128),
                block_number: 1,
                block_hash: "0xb".into(),
                timestamp: Utc::now(),
                chain_id: 8453,
                confirmations: 1,
            })
            .await
            .unwrap();
        votes
            .record_allocation_vote("p1", "0xClaimant", 50, &BigInt::from(1_000_000_000_000_000_000_i128))
            .await
            .unwrap();
        votes.get_allocation_vote_results("p1").await.unwrap();

        let payload = SettlementJobPayload {
            address: "0xclaimant".into(),
            share: 1.0,
            plan: vec![AssetTransferPlan {
                asset_id: "eth".into(),
                symbol: "ETH".into(),
                kind: AssetKind::Native,
                token_address: None,
                decimals: 18,
                amount_minor_units: BigInt::from(1_000_000_000_000_000_000_i128),
                amount_formatted: "1.000000000000000000".into(),
            }],
            total_deposits_minor_units: "1000000000000000000".into(),
            request_id: "req-1".into(),
            requested_at: Utc::now(),
        };

        let executor = SettlementExecutor::new(kv.clone(), ledger.clone(), votes.clone(), queue.clone(), &chain, true);
        executor.run("job-1", &payload, "p1", &NullHeartbeat).await.unwrap();

        let stats = ledger.get_user_stats("0xclaimant").await.unwrap().unwrap();
        assert_eq!(stats.total_value_minor_units, BigInt::from(0));
        assert!(stats.settled_at.is_some());

        let totals = votes.get_allocation_vote_results("p1").await.unwrap();
        assert_eq!(totals.total_voters, 0);

        assert_eq!(queue.size().await.unwrap(), 1);
    }
}
