//! Iterative rebalance planner and executor.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use num_bigint::BigInt;
use num_traits::{Signed, Zero};
use serde::{Deserialize, Serialize};
use treasury_chain::{evm::decode_hex_0x, types::SendTransactionRequest, AggregatorClient, EvmClient, QuoteRequest};

use crate::error::{CoreError, Result};
use crate::heartbeat::Heartbeat;
use crate::kv::{KvStore, KvStoreExt};
use crate::pricing::PriceCache;
use crate::treasury::TreasuryReader;
use crate::types::{quote_side_address, Asset};

const REBALANCE_LAST_KEY: &str = "rebalance:last";
const REBALANCE_HISTORY_KEY: &str = "rebalance:history";
const MAX_ITERATIONS: u32 = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetUsdTotal {
    pub asset_id: String,
    pub balance_minor_units: String,
    pub current_usd_raw: String,
    pub target_usd_raw: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebalanceOutcome {
    pub mode: String,
    pub message: Option<String>,
    pub seller_asset: Option<String>,
    pub buyer_asset: Option<String>,
    pub sell_amount_minor_units: Option<String>,
    pub buy_amount_minor_units: Option<String>,
    pub approve_tx_hash: Option<String>,
    pub submit_tx_hash: Option<String>,
    pub totals_before: Vec<AssetUsdTotal>,
    pub totals_after: Option<Vec<AssetUsdTotal>>,
    pub recorded_at: DateTime<Utc>,
}

impl RebalanceOutcome {
    fn skipped(message: &str, totals_before: Vec<AssetUsdTotal>) -> Self {
        Self {
            mode: "skipped".to_string(),
            message: Some(message.to_string()),
            seller_asset: None,
            buyer_asset: None,
            sell_amount_minor_units: None,
            buy_amount_minor_units: None,
            approve_tx_hash: None,
            submit_tx_hash: None,
            totals_before,
            totals_after: None,
            recorded_at: Utc::now(),
        }
    }
}

struct AssetPlan<'a> {
    asset: &'a Asset,
    balance: BigInt,
    price_raw: BigInt,
    current_usd_raw: BigInt,
    target_usd_raw: BigInt,
}

impl<'a> AssetPlan<'a> {
    fn delta(&self) -> BigInt {
        &self.current_usd_raw - &self.target_usd_raw
    }

    fn unit(&self) -> BigInt {
        self.asset.unit()
    }
}

pub struct RebalancePlanner<'a> {
    kv: Arc<dyn KvStore>,
    chain: &'a dyn EvmClient,
    aggregator: &'a dyn AggregatorClient,
    prices: &'a PriceCache,
    assets: &'a [Asset],
    slippage_bps: u32,
    tolerance_percent: f64,
    min_usd_delta: u64,
    history_limit: usize,
    execute: bool,
}

impl<'a> RebalancePlanner<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        kv: Arc<dyn KvStore>,
        chain: &'a dyn EvmClient,
        aggregator: &'a dyn AggregatorClient,
        prices: &'a PriceCache,
        assets: &'a [Asset],
        slippage_bps: u32,
        tolerance_percent: f64,
        min_usd_delta: u64,
        history_limit: usize,
        execute: bool,
    ) -> Self {
        Self {
            kv,
            chain,
            aggregator,
            prices,
            assets,
            slippage_bps,
            tolerance_percent,
            min_usd_delta,
            history_limit,
            execute,
        }
    }

    /// Runs one full plan/execute cycle and persists the outcome. `heartbeat`
    /// is invoked before/after every suspension point inside the critical
    /// section.
    pub async fn run(&self, weighted_eth_percent: f64, heartbeat: &dyn Heartbeat) -> Result<RebalanceOutcome> {
        let eth_pct = weighted_eth_percent.clamp(0.0, 100.0);

        heartbeat.beat().await?;
        let snapshot = TreasuryReader::new(self.chain, self.assets).read().await?;
        heartbeat.beat().await?;

        let price_pairs: Vec<(String, String)> =
            self.assets.iter().map(|a| (a.id.clone(), a.symbol.clone())).collect();
        let price_results = self.prices.get_prices(&price_pairs).await;
        heartbeat.beat().await?;

        let mut snapshots = Vec::with_capacity(price_results.len());
        for (asset_id, result) in price_results {
            match result {
                Ok(s) => snapshots.push(s),
                Err(err) => {
                    tracing::error!(asset_id = %asset_id, error = %err, "price unavailable, aborting rebalance");
                    return Err(err);
                }
            }
        }
        let snapshot_refs: Vec<&crate::pricing::PriceSnapshot> = snapshots.iter().collect();
        PriceCache::assert_common_scale(&snapshot_refs)?;

        let targets = self.compute_targets(eth_pct);

        let mut plans: Vec<AssetPlan> = Vec::with_capacity(self.assets.len());
        for asset in self.assets {
            let price = snapshots
                .iter()
                .find(|s| s.asset_id == asset.id)
                .ok_or_else(|| CoreError::PriceUnavailable { asset_id: asset.id.clone() })?;
            let balance = snapshot.balance_of(&asset.id);
            let price_raw = BigInt::from(price.price_raw);
            let current_usd_raw = &balance * &price_raw / asset.unit();
            plans.push(AssetPlan {
                asset,
                balance,
                price_raw,
                current_usd_raw,
                target_usd_raw: BigInt::from(0),
            });
        }

        let total_usd_raw: BigInt = plans.iter().fold(BigInt::from(0), |acc, p| acc + &p.current_usd_raw);

        let totals_before = Self::totals_snapshot(&plans);

        if total_usd_raw.is_zero() {
            let outcome = RebalanceOutcome::skipped("zero balance", totals_before);
            self.persist(&outcome).await?;
            return Ok(outcome);
        }

        self.assign_targets(&mut plans, &targets, &total_usd_raw);
        let totals_before = Self::totals_snapshot(&plans);

        let tolerance = self.tolerance_usd_raw(&total_usd_raw);

        let seller_idx = plans.iter().position(|p| p.delta() > tolerance);
        let buyer_idx = plans.iter().position(|p| p.delta() < -&tolerance);

        let (Some(seller_idx), Some(buyer_idx)) = (seller_idx, buyer_idx) else {
            let outcome = RebalanceOutcome::skipped("within tolerance", totals_before);
            self.persist(&outcome).await?;
            return Ok(outcome);
        };

        let seller_delta = plans[seller_idx].delta();
        let buyer_delta = plans[buyer_idx].delta();
        let usd_to_swap = seller_delta.clone().min(-buyer_delta.clone());

        let seller_unit = plans[seller_idx].unit();
        let mut sell_amount = &usd_to_swap * &seller_unit / &plans[seller_idx].price_raw;

        if sell_amount.is_zero() {
            let outcome = RebalanceOutcome::skipped("rounded to zero", totals_before);
            self.persist(&outcome).await?;
            return Ok(outcome);
        }

        let seller_bal = plans[seller_idx].balance.clone();
        let seller_target = plans[seller_idx].target_usd_raw.clone();
        let seller_price_raw = plans[seller_idx].price_raw.clone();
        let buyer_bal = plans[buyer_idx].balance.clone();
        let buyer_target = plans[buyer_idx].target_usd_raw.clone();
        let buyer_price_raw = plans[buyer_idx].price_raw.clone();
        let buyer_unit = plans[buyer_idx].unit();

        let vault_address = self.chain.vault_address().to_string();
        let sell_token = quote_side_address(plans[seller_idx].asset)?.to_string();
        let buy_token = quote_side_address(plans[buyer_idx].asset)?.to_string();

        let mut quote_buy_amount = BigInt::from(0);
        for _ in 0..MAX_ITERATIONS {
            heartbeat.beat().await?;
            let quote = self
                .aggregator
                .get_quote(QuoteRequest {
                    sell_token: &sell_token,
                    buy_token: &buy_token,
                    sell_amount: sell_amount.to_string(),
                    taker: &vault_address,
                    chain_id: self.chain.chain_id(),
                    slippage_bps: self.slippage_bps,
                })
                .await?;
            heartbeat.beat().await?;

            quote_buy_amount = quote.buy_amount.clone();

            let seller_bal_projected = &seller_bal - &sell_amount;
            let buyer_bal_projected = &buyer_bal + &quote_buy_amount;

            let seller_usd_projected = &seller_bal_projected * &seller_price_raw / &seller_unit;
            let buyer_usd_projected = &buyer_bal_projected * &buyer_price_raw / &buyer_unit;

            let seller_delta_projected = &seller_usd_projected - &seller_target;
            let buyer_delta_projected = &buyer_usd_projected - &buyer_target;

            let seller_within = seller_delta_projected.clone().abs() <= tolerance;
            let buyer_within = buyer_delta_projected.clone().abs() <= tolerance;

            if seller_within && buyer_within {
                break;
            }

            if seller_delta_projected <= tolerance {
                // seller is no longer overweight; accept the current quote.
                break;
            }

            let adjustment =
                (&seller_delta_projected + &buyer_delta_projected) / 2 * &seller_unit / &seller_price_raw;
            sell_amount += adjustment;
            if sell_amount >= seller_bal {
                sell_amount = seller_bal.clone();
                break;
            }
        }

        heartbeat.beat().await?;
        let final_quote = self
            .aggregator
            .get_quote(QuoteRequest {
                sell_token: &sell_token,
                buy_token: &buy_token,
                sell_amount: sell_amount.to_string(),
                taker: &vault_address,
                chain_id: self.chain.chain_id(),
                slippage_bps: self.slippage_bps,
            })
            .await?;
        heartbeat.beat().await?;

        let seller_asset_id = plans[seller_idx].asset.id.clone();
        let buyer_asset_id = plans[buyer_idx].asset.id.clone();

        if !self.execute {
            let outcome = RebalanceOutcome {
                mode: "dry-run".to_string(),
                message: Some("execution disabled".to_string()),
                seller_asset: Some(seller_asset_id),
                buyer_asset: Some(buyer_asset_id),
                sell_amount_minor_units: Some(sell_amount.to_string()),
                buy_amount_minor_units: Some(final_quote.buy_amount.to_string()),
                approve_tx_hash: None,
                submit_tx_hash: None,
                totals_before,
                totals_after: None,
                recorded_at: Utc::now(),
            };
            self.persist(&outcome).await?;
            return Ok(outcome);
        }

        let seller_is_native = plans[seller_idx].asset.is_native();
        let mut approve_tx_hash = None;

        if !seller_is_native {
            if let Some(spender) = final_quote.allowance_spender() {
                let token_address = plans[seller_idx]
                    .asset
                    .token_address
                    .as_deref()
                    .ok_or_else(|| CoreError::InvalidAsset {
                        asset: seller_asset_id.clone(),
                        reason: "token asset missing address".to_string(),
                    })?;
                heartbeat.beat().await?;
                let current_allowance =
                    self.chain.read_erc20_allowance(token_address, &vault_address, spender).await?;
                if current_allowance < sell_amount {
                    let tx_hash = self.chain.approve_erc20(token_address, spender, &sell_amount).await?;
                    self.chain.wait_for_transaction_receipt(&tx_hash).await?;
                    approve_tx_hash = Some(tx_hash);
                }
                heartbeat.beat().await?;
            }
        }

        let data = decode_hex_0x(&final_quote.transaction.data)?;
        let value = if seller_is_native {
            Some(sell_amount.clone())
        } else {
            final_quote
                .transaction
                .value
                .as_deref()
                .and_then(|v| v.parse::<BigInt>().ok())
                .or(Some(BigInt::from(0)))
        };

        heartbeat.beat().await?;
        let submit_tx_hash = self
            .chain
            .send_transaction(SendTransactionRequest {
                to: final_quote.transaction.to.clone(),
                value,
                data: Some(data),
                gas: final_quote.transaction.gas.as_deref().and_then(|g| g.parse().ok()),
                gas_price: None,
            })
            .await?;
        self.chain.wait_for_transaction_receipt(&submit_tx_hash).await?;
        heartbeat.beat().await?;

        let post_snapshot = TreasuryReader::new(self.chain, self.assets).read().await?;
        let post_prices = self.prices.get_prices(&price_pairs).await;
        heartbeat.beat().await?;

        let mut totals_after = Vec::with_capacity(self.assets.len());
        for (asset, plan) in self.assets.iter().zip(plans.iter()) {
            let price_raw = post_prices
                .iter()
                .find(|(id, _)| id == &asset.id)
                .and_then(|(_, r)| r.as_ref().ok())
                .map(|s| BigInt::from(s.price_raw))
                .unwrap_or_else(|| plan.price_raw.clone());
            let balance = post_snapshot.balance_of(&asset.id);
            let current_usd_raw = &balance * &price_raw / asset.unit();
            totals_after.push(AssetUsdTotal {
                asset_id: asset.id.clone(),
                balance_minor_units: balance.to_string(),
                current_usd_raw: current_usd_raw.to_string(),
                target_usd_raw: plan.target_usd_raw.to_string(),
            });
        }

        let outcome = RebalanceOutcome {
            mode: "executed".to_string(),
            message: None,
            seller_asset: Some(seller_asset_id),
            buyer_asset: Some(buyer_asset_id),
            sell_amount_minor_units: Some(sell_amount.to_string()),
            buy_amount_minor_units: Some(final_quote.buy_amount.to_string()),
            approve_tx_hash,
            submit_tx_hash: Some(submit_tx_hash),
            totals_before,
            totals_after: Some(totals_after),
            recorded_at: Utc::now(),
        };
        self.persist(&outcome).await?;
        Ok(outcome)
    }

    /// `{nativeTarget: ethPct, firstTokenTarget: 100 - ethPct, rest: 0}`.
    /// Named a single stablecoin target but leaves room for additional
    /// zero-weighted assets.
    fn compute_targets(&self, eth_pct: f64) -> Vec<f64> {
        let mut targets = vec![0.0; self.assets.len()];
        let native_idx = self.assets.iter().position(|a| a.is_native());
        let stable_idx = self.assets.iter().position(|a| !a.is_native());
        if let Some(i) = native_idx {
            targets[i] = eth_pct;
        }
        if let Some(i) = stable_idx {
            targets[i] = 100.0 - eth_pct;
        }
        targets
    }

    fn assign_targets(&self, plans: &mut [AssetPlan<'_>], targets: &[f64], total_usd_raw: &BigInt) {
        let percent_scaled: Vec<i64> = targets.iter().map(|pct| (pct * 10_000.0).round() as i64).collect();
        let mut assigned = BigInt::from(0);
        for (i, plan) in plans.iter_mut().enumerate() {
            let target = total_usd_raw * percent_scaled[i] / (100 * 10_000);
            assigned += &target;
            plan.target_usd_raw = target;
        }
        let remainder = total_usd_raw - &assigned;
        if !remainder.is_zero() {
            if let Some(first) = plans.first_mut() {
                first.target_usd_raw += remainder;
            }
        }
    }

    fn tolerance_usd_raw(&self, total_usd_raw: &BigInt) -> BigInt {
        let pct_scaled = (self.tolerance_percent * 10_000.0).round() as i64;
        let pct_tolerance: BigInt = total_usd_raw * pct_scaled / (100 * 10_000);
        let min_tolerance = BigInt::from(self.min_usd_delta) * BigInt::from(10u64).pow(crate::pricing::PRICE_DECIMALS);
        pct_tolerance.max(min_tolerance)
    }

    fn totals_snapshot(plans: &[AssetPlan<'_>]) -> Vec<AssetUsdTotal> {
        plans
            .iter()
            .map(|p| AssetUsdTotal {
                asset_id: p.asset.id.clone(),
                balance_minor_units: p.balance.to_string(),
                current_usd_raw: p.current_usd_raw.to_string(),
                target_usd_raw: p.target_usd_raw.to_string(),
            })
            .collect()
    }

    async fn persist(&self, outcome: &RebalanceOutcome) -> Result<()> {
        self.kv.set_json(REBALANCE_LAST_KEY, outcome, crate::kv::SetOptions::default()).await?;
        let bytes = serde_json::to_vec(outcome)?;
        self.kv.lpush(REBALANCE_HISTORY_KEY, &bytes).await?;
        self.kv.ltrim(REBALANCE_HISTORY_KEY, 0, self.history_limit.saturating_sub(1) as i64).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heartbeat::NullHeartbeat;
    use crate::kv::MemoryStore;
    use crate::pricing::PriceCache;
    use crate::types::AssetKind;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use treasury_chain::types::{AggregatorQuote, AggregatorTransaction, BlockHeader, TransactionReceipt};
    use treasury_chain::{ChainError, PriceOracleClient};

    struct FakeChain {
        native_balance: std::sync::Mutex<BigInt>,
        stable_balance: std::sync::Mutex<BigInt>,
    }

    #[async_trait]
    impl EvmClient for FakeChain {
        fn vault_address(&self) -> &str {
            "0xVault"
        }
        fn chain_id(&self) -> u64 {
            8453
        }
        async fn get_balance(&self, _address: &str) -> treasury_chain::Result<BigInt> {
            Ok(self.native_balance.lock().unwrap().clone())
        }
        async fn get_bytecode(&self, _address: &str) -> treasury_chain::Result<Vec<u8>> {
            Ok(vec![0x60])
        }
        async fn read_erc20_balance(&self, _token: &str, _owner: &str) -> treasury_chain::Result<BigInt> {
            Ok(self.stable_balance.lock().unwrap().clone())
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
        async fn get_transaction(&self, _hash: &str) -> treasury_chain::Result<Option<treasury_chain::TransactionDetail>> {
            Ok(None)
        }
        async fn send_transaction(&self, req: SendTransactionRequest) -> treasury_chain::Result<String> {
            if let Some(value) = req.value {
                *self.native_balance.lock().unwrap() -= value;
            }
            *self.stable_balance.lock().unwrap() += BigInt::from(1_990_000);
            Ok("0xsubmit".to_string())
        }
        async fn wait_for_transaction_receipt(&self, hash: &str) -> treasury_chain::Result<TransactionReceipt> {
            Ok(TransactionReceipt { hash: hash.to_string(), status: true, block_number: 2 })
        }
        async fn approve_erc20(&self, _t: &str, _s: &str, _a: &BigInt) -> treasury_chain::Result<String> {
            Ok("0xapprove".to_string())
        }
    }

    struct FakeAggregator {
        calls: AtomicU32,
    }

    #[async_trait]
    impl AggregatorClient for FakeAggregator {
        async fn get_quote(&self, req: QuoteRequest<'_>) -> treasury_chain::Result<AggregatorQuote> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let sell: BigInt = req.sell_amount.parse().unwrap();
            let buy: BigInt = &sell * 1990 / 2000;
            Ok(AggregatorQuote {
                buy_amount: buy.clone(),
                sell_amount: sell,
                issues: None,
                transaction: AggregatorTransaction {
                    to: "0xRouter".to_string(),
                    data: "0xdeadbeef".to_string(),
                    gas: None,
                    gas_price: None,
                    value: Some("0".to_string()),
                },
                route: None,
            })
        }
    }

    struct FakeOracle;
    #[async_trait]
    impl PriceOracleClient for FakeOracle {
        async fn spot_price_usd(&self, symbol: &str) -> std::result::Result<f64, ChainError> {
            Ok(if symbol == "ETH" { 2000.0 } else { 1.0 })
        }
    }

    fn assets() -> Vec<Asset> {
        vec![
            Asset {
                id: "eth".into(),
                kind: AssetKind::Native,
                symbol: "ETH".into(),
                token_address: None,
                decimals: 18,
                price_feed_id: "ETH".into(),
            },
            Asset {
                id: "usdc".into(),
                kind: AssetKind::Token,
                symbol: "USDC".into(),
                token_address: Some("0xUsdc".into()),
                decimals: 6,
                price_feed_id: "USDC".into(),
            },
        ]
    }

    #[tokio::test]
    async fn zero_balance_is_skipped() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let chain = FakeChain { native_balance: std::sync::Mutex::new(BigInt::from(0)), stable_balance: std::sync::Mutex::new(BigInt::from(0)) };
        let aggregator = FakeAggregator { calls: AtomicU32::new(0) };
        let prices = PriceCache::new(kv.clone(), Arc::new(FakeOracle), 60);
        let assets = assets();
        let planner = RebalancePlanner::new(kv, &chain, &aggregator, &prices, &assets, 100, 1.0, 5, 20, true);

        let outcome = planner.run(50.0, &NullHeartbeat).await.unwrap();
        assert_eq!(outcome.mode, "skipped");
        assert_eq!(outcome.message.as_deref(), Some("zero balance"));
        assert_eq!(aggregator.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn within_tolerance_is_skipped() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        // 1 native ($2000) + 2000 stable ($2000), consensus 50/50 (S3).
        let chain = FakeChain {
            native_balance: std::sync::Mutex::new(BigInt::from(1_000_000_000_000_000_000_i128)),
            stable_balance: std::sync::Mutex::new(BigInt::from(2_000_000_000_i64)),
        };
        let aggregator = FakeAggregator { calls: AtomicU32::new(0) };
        let prices = PriceCache::new(kv.clone(), Arc::new(FakeOracle), 60);
        let assets = assets();
        let planner = RebalancePlanner::new(kv, &chain, &aggregator, &prices, &assets, 100, 1.0, 5, 20, true);

        let outcome = planner.run(50.0, &NullHeartbeat).await.unwrap();
        assert_eq!(outcome.mode, "skipped");
        assert_eq!(outcome.message.as_deref(), Some("within tolerance"));
    }

    #[tokio::test]
    async fn dry_run_records_planned_swap_without_submitting() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        // 2 native ($4000) + 0 stable, consensus 50/50 (S4).
        let chain = FakeChain {
            native_balance: std::sync::Mutex::new(BigInt::from(2_000_000_000_000_000_000_i128)),
            stable_balance: std::sync::Mutex::new(BigInt::from(0)),
        };
        let aggregator = FakeAggregator { calls: AtomicU32::new(0) };
        let prices = PriceCache::new(kv.clone(), Arc::new(FakeOracle), 60);
        let assets = assets();
        let planner = RebalancePlanner::new(kv, &chain, &aggregator, &prices, &assets, 100, 1.0, 5, 20, false);

        let outcome = planner.run(50.0, &NullHeartbeat).await.unwrap();
        assert_eq!(outcome.mode, "dry-run");
        assert!(outcome.sell_amount_minor_units.is_some());
        assert!(aggregator.calls.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn execute_submits_and_records_totals_after() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let chain = FakeChain {
            native_balance: std::sync::Mutex::new(BigInt::from(2_000_000_000_000_000_000_i128)),
            stable_balance: std::sync::Mutex::new(BigInt::from(0)),
        };
        let aggregator = FakeAggregator { calls: AtomicU32::new(0) };
        let prices = PriceCache::new(kv.clone(), Arc::new(FakeOracle), 60);
        let assets = assets();
        let planner = RebalancePlanner::new(kv, &chain, &aggregator, &prices, &assets, 100, 1.0, 5, 20, true);

        let outcome = planner.run(50.0, &NullHeartbeat).await.unwrap();
        assert_eq!(outcome.mode, "executed");
        assert!(outcome.submit_tx_hash.is_some());
        assert!(outcome.totals_after.is_some());
    }
}
