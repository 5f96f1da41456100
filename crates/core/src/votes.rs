//! Vote store and deposit-weighted aggregation.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use num_bigint::BigInt;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::kv::{KvStore, KvStoreExt};
use crate::ledger::DepositLedger;
use crate::types::lowercase_address;

/// Fixed-point scale used for vote weight.
const WEIGHT_SCALE: i64 = 1_000_000_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationVote {
    pub proposal_id: String,
    pub address: String,
    pub eth_percent: i64,
    /// Weight at scale `WEIGHT_SCALE`; recomputed on every aggregation, never
    /// treated as source-of-truth.
    pub weight_scaled: i64,
    pub deposit_minor_units: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregationTotals {
    pub proposal_id: String,
    pub weighted_eth_percent: f64,
    /// Clamped to `[0, 1]`.
    pub total_weight: f64,
    pub total_voters: u64,
}

fn records_key(proposal_id: &str) -> String {
    format!("allocvote:{proposal_id}:records")
}

fn totals_key(proposal_id: &str) -> String {
    format!("allocvote:{proposal_id}:totals")
}

pub struct VoteStore {
    kv: Arc<dyn KvStore>,
    ledger: Arc<DepositLedger>,
}

impl VoteStore {
    pub fn new(kv: Arc<dyn KvStore>, ledger: Arc<DepositLedger>) -> Self {
        Self { kv, ledger }
    }

    /// Writes the vote record directly; weight is recomputed lazily on the
    /// next aggregation, never stored as authoritative here.
    pub async fn record_allocation_vote(
        &self,
        proposal_id: &str,
        address: &str,
        eth_percent: i64,
        deposit_minor_units: &BigInt,
    ) -> Result<()> {
        let vote = AllocationVote {
            proposal_id: proposal_id.to_string(),
            address: lowercase_address(address),
            eth_percent: eth_percent.clamp(0, 100),
            weight_scaled: 0,
            deposit_minor_units: deposit_minor_units.to_string(),
            timestamp: Utc::now(),
        };
        self.kv.hset_json(&records_key(proposal_id), &vote.address, &vote).await
    }

    pub async fn remove_allocation_vote(&self, proposal_id: &str, address: &str) -> Result<AggregationTotals> {
        self.kv.hdel(&records_key(proposal_id), &lowercase_address(address)).await?;
        self.get_allocation_vote_results(proposal_id).await
    }

    /// Recomputes weights from the live ledger and aggregates. Stateless
    /// and safe under concurrency: the final write is last-writer-wins, and
    /// callers use the returned value directly rather than re-reading
    ///.
    pub async fn get_allocation_vote_results(&self, proposal_id: &str) -> Result<AggregationTotals> {
        let raw_votes: Vec<(String, AllocationVote)> =
            self.kv.hgetall_json(&records_key(proposal_id)).await?;

        let total_deposits = self.ledger.total_deposits_minor_units().await?;

        let mut sum_weighted_pct = 0.0f64;
        let mut raw_total_weight = 0.0f64;
        let mut total_voters = 0u64;
        let mut recomputed = Vec::with_capacity(raw_votes.len());

        for (address, mut vote) in raw_votes {
            let deposit = match self.ledger.get_user_stats(&address).await {
                Ok(Some(stats)) => stats.total_value_minor_units,
                _ => vote.deposit_minor_units.parse().unwrap_or_default(),
            };

            let weight_scaled: i64 = if total_deposits > BigInt::from(0) {
                (&deposit * WEIGHT_SCALE / &total_deposits).try_into().unwrap_or(0)
            } else {
                0
            };
            let weight = weight_scaled as f64 / WEIGHT_SCALE as f64;

            vote.weight_scaled = weight_scaled;
            vote.deposit_minor_units = deposit.to_string();

            if weight_scaled > 0 {
                let pct = vote.eth_percent.clamp(0, 100) as f64;
                sum_weighted_pct += weight * pct;
                raw_total_weight += weight;
                total_voters += 1;
            }

            recomputed.push((address, vote));
        }

        let weighted_eth_percent = if raw_total_weight > 0.0 {
            (sum_weighted_pct / raw_total_weight).clamp(0.0, 100.0)
        } else {
            0.0
        };
        let weighted_eth_percent = (weighted_eth_percent * 10_000.0).round() / 10_000.0;

        // Preserve the ratio between contributions when clamping
        // `totalWeight` to 1 (the Open Question's resolution — see DESIGN.md):
        // scale every vote's weight by the same factor before the clamp.
        let total_weight = raw_total_weight.min(1.0);
        if raw_total_weight > 1.0 {
            let scale = 1.0 / raw_total_weight;
            for (_, vote) in recomputed.iter_mut() {
                vote.weight_scaled = ((vote.weight_scaled as f64) * scale).round() as i64;
            }
        }

        for (address, vote) in &recomputed {
            self.kv.hset_json(&records_key(proposal_id), address, vote).await?;
        }

        let totals = AggregationTotals {
            proposal_id: proposal_id.to_string(),
            weighted_eth_percent,
            total_weight,
            total_voters,
        };
        self.kv.hset_json(&totals_key(proposal_id), "current", &totals).await?;

        Ok(totals)
    }

    pub async fn get_cached_totals(&self, proposal_id: &str) -> Result<Option<AggregationTotals>> {
        self.kv.hget_json(&totals_key(proposal_id), "current").await
    }

    /// Removes votes whose address carries zero live deposit, typically
    /// called opportunistically after settlement.
    pub async fn sweep_stale_votes(&self, proposal_id: &str) -> Result<u64> {
        let raw_votes: Vec<(String, AllocationVote)> =
            self.kv.hgetall_json(&records_key(proposal_id)).await?;
        let mut removed = 0;
        for (address, _) in raw_votes {
            let is_zero = match self.ledger.get_user_stats(&address).await? {
                Some(stats) => stats.total_value_minor_units == BigInt::from(0),
                None => true,
            };
            if is_zero {
                self.kv.hdel(&records_key(proposal_id), &address).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryStore;
    use crate::ledger::TransactionRecord;

    async fn setup_ledger_with(deposits: &[(&str, i64)]) -> (Arc<dyn KvStore>, Arc<DepositLedger>) {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let ledger = Arc::new(DepositLedger::new(kv.clone()));
        for (i, (addr, amount)) in deposits.iter().enumerate() {
            ledger
                .record_deposit(&TransactionRecord {
                    hash: format!("0x{i}"),
                    from: addr.to_string(),
                    to: "0xvault".to_string(),
                    value_minor_units: BigInt::from(*amount),
                    block_number: 1,
                    block_hash: "0xb".to_string(),
                    timestamp: Utc::now(),
                    chain_id: 8453,
                    confirmations: 1,
                })
                .await
                .unwrap();
        }
        (kv, ledger)
    }

    #[tokio::test]
    async fn two_voter_aggregation_matches_spec_scenario() {
        let (kv, ledger) = setup_ledger_with(&[
            ("0xA", 3_000_000_000_000_000_000),
            ("0xB", 1_000_000_000_000_000_000),
        ])
        .await;
        let votes = VoteStore::new(kv, ledger);

        votes
            .record_allocation_vote("p1", "0xA", 80, &BigInt::from(3_000_000_000_000_000_000_i128))
            .await
            .unwrap();
        votes
            .record_allocation_vote("p1", "0xB", 0, &BigInt::from(1_000_000_000_000_000_000_i128))
            .await
            .unwrap();

        let totals = votes.get_allocation_vote_results("p1").await.unwrap();
        assert_eq!(totals.total_voters, 2);
        assert!((totals.weighted_eth_percent - 60.0).abs() < 0.01);
        assert!((totals.total_weight - 1.0).abs() < 0.001);
    }

    #[tokio::test]
    async fn zero_total_deposits_yields_zeroed_totals() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let ledger = Arc::new(DepositLedger::new(kv.clone()));
        let votes = VoteStore::new(kv, ledger);

        votes.record_allocation_vote("p1", "0xA", 80, &BigInt::from(0)).await.unwrap();
        let totals = votes.get_allocation_vote_results("p1").await.unwrap();

        assert_eq!(totals.weighted_eth_percent, 0.0);
        assert_eq!(totals.total_weight, 0.0);
        assert_eq!(totals.total_voters, 0);
    }

    #[tokio::test]
    async fn remove_vote_reaggregates() {
        let (kv, ledger) = setup_ledger_with(&[("0xA", 1_000_000_000_000_000_000)]).await;
        let votes = VoteStore::new(kv, ledger);
        votes
            .record_allocation_vote("p1", "0xA", 80, &BigInt::from(1_000_000_000_000_000_000_i128))
            .await
            .unwrap();
        votes.get_allocation_vote_results("p1").await.unwrap();

        let totals = votes.remove_allocation_vote("p1", "0xA").await.unwrap();
        assert_eq!(totals.total_voters, 0);
    }
}
