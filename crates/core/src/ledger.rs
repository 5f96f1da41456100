//! Deposit ledger and transaction recording.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use num_bigint::BigInt;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::kv::{KvStore, KvStoreExt, SetOptions};
use crate::types::lowercase_address;

/// One year, the TTL on transaction detail and per-user index records.
const ONE_YEAR_SECS: u64 = 365 * 24 * 60 * 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub hash: String,
    pub from: String,
    pub to: String,
    #[serde(with = "bigint_as_string")]
    pub value_minor_units: BigInt,
    pub block_number: u64,
    pub block_hash: String,
    pub timestamp: DateTime<Utc>,
    pub chain_id: u64,
    pub confirmations: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserStats {
    pub address: String,
    #[serde(with = "bigint_as_string")]
    pub total_value_minor_units: BigInt,
    pub total_transactions: u64,
    pub last_transaction_hash: Option<String>,
    pub last_transaction_timestamp: Option<DateTime<Utc>>,
    pub settled_at: Option<DateTime<Utc>>,
}

fn tx_key(hash: &str) -> String {
    format!("tx:{}", hash.to_ascii_lowercase())
}

fn user_tx_key(address: &str) -> String {
    format!("user:tx:{}", lowercase_address(address))
}

fn user_stats_key(address: &str) -> String {
    format!("user:stats:{}", lowercase_address(address))
}

pub struct DepositLedger {
    kv: Arc<dyn KvStore>,
}

impl DepositLedger {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    /// Idempotent on `tx.hash`: a duplicate submission is a no-op, not an
    /// error, so webhook retries never double-count.
    pub async fn record_deposit(&self, tx: &TransactionRecord) -> Result<bool> {
        let key = tx_key(&tx.hash);
        if self.kv.exists(&key).await? {
            return Ok(false);
        }

        self.kv.set_json(&key, tx, SetOptions::ex(ONE_YEAR_SECS)).await?;

        let user_tx = user_tx_key(&tx.from);
        self.kv.zadd(&user_tx, &tx.hash, tx.timestamp.timestamp() as f64).await?;
        self.kv.expire(&user_tx, ONE_YEAR_SECS).await?;

        let stats_key = user_stats_key(&tx.from);
        let mut stats = self.get_user_stats(&tx.from).await?.unwrap_or_else(|| UserStats {
            address: lowercase_address(&tx.from),
            ..Default::default()
        });
        stats.total_transactions += 1;
        stats.total_value_minor_units += &tx.value_minor_units;
        stats.last_transaction_hash = Some(tx.hash.clone());
        stats.last_transaction_timestamp = Some(tx.timestamp);
        self.write_user_stats(&stats_key, &stats).await?;
        self.kv.expire(&stats_key, ONE_YEAR_SECS).await?;

        Ok(true)
    }

    async fn write_user_stats(&self, stats_key: &str, stats: &UserStats) -> Result<()> {
        self.kv.hset(stats_key, "address", stats.address.as_bytes()).await?;
        self.kv
            .hset(stats_key, "totalValueMinorUnits", stats.total_value_minor_units.to_string().as_bytes())
            .await?;
        self.kv.hset(stats_key, "totalTransactions", stats.total_transactions.to_string().as_bytes()).await?;
        if let Some(hash) = &stats.last_transaction_hash {
            self.kv.hset(stats_key, "lastTransactionHash", hash.as_bytes()).await?;
        }
        if let Some(ts) = stats.last_transaction_timestamp {
            self.kv.hset(stats_key, "lastTransactionTimestamp", ts.to_rfc3339().as_bytes()).await?;
        }
        if let Some(settled) = stats.settled_at {
            self.kv.hset(stats_key, "settledAt", settled.to_rfc3339().as_bytes()).await?;
        }
        Ok(())
    }

    pub async fn get_user_stats(&self, address: &str) -> Result<Option<UserStats>> {
        let fields = self.kv.hgetall(&user_stats_key(address)).await?;
        Ok(Self::decode_user_stats(address, fields))
    }

    fn decode_user_stats(address: &str, fields: Vec<(String, Vec<u8>)>) -> Option<UserStats> {
        if fields.is_empty() {
            return None;
        }
        let get = |name: &str| -> Option<String> {
            fields
                .iter()
                .find(|(f, _)| f == name)
                .map(|(_, v)| String::from_utf8_lossy(v).to_string())
        };
        Some(UserStats {
            address: lowercase_address(address),
            total_value_minor_units: get("totalValueMinorUnits").and_then(|s| s.parse().ok()).unwrap_or_default(),
            total_transactions: get("totalTransactions").and_then(|s| s.parse().ok()).unwrap_or(0),
            last_transaction_hash: get("lastTransactionHash"),
            last_transaction_timestamp: get("lastTransactionTimestamp")
                .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                .map(|dt| dt.with_timezone(&Utc)),
            settled_at: get("settledAt")
                .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                .map(|dt| dt.with_timezone(&Utc)),
        })
    }

    /// Iterates `user:stats:*` via `SCAN`, batching until the cursor
    /// returns to zero.
    pub async fn get_all_user_stats(&self) -> Result<Vec<UserStats>> {
        let mut out = Vec::new();
        let mut cursor = 0u64;
        loop {
            let (next, keys) = self.kv.scan(cursor, "user:stats:*", 100).await?;
            for key in keys {
                let address = key.trim_start_matches("user:stats:").to_string();
                let fields = self.kv.hgetall(&key).await?;
                if let Some(stats) = Self::decode_user_stats(&address, fields) {
                    out.push(stats);
                }
            }
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(out)
    }

    pub async fn total_deposits_minor_units(&self) -> Result<BigInt> {
        let all = self.get_all_user_stats().await?;
        Ok(all.iter().fold(BigInt::from(0), |acc, s| acc + &s.total_value_minor_units))
    }

    /// Zeroes the depositor's recorded total and stamps `settledAt`. Prior
    /// transaction records are left intact.
    pub async fn mark_user_settled(&self, address: &str) -> Result<()> {
        let stats_key = user_stats_key(address);
        let mut stats = self
            .get_user_stats(address)
            .await?
            .ok_or_else(|| CoreError::NotADepositor(address.to_string()))?;
        stats.total_value_minor_units = BigInt::from(0);
        stats.settled_at = Some(Utc::now());
        self.write_user_stats(&stats_key, &stats).await?;
        Ok(())
    }

    pub async fn list_user_transactions(&self, address: &str, limit: i64) -> Result<Vec<String>> {
        self.kv.zrange(&user_tx_key(address), 0, limit.saturating_sub(1).max(0), true).await
    }
}

/// Serializes `BigInt` as a decimal string, matching the KV schema's
/// string-typed numeric fields.
mod bigint_as_string {
    use num_bigint::BigInt;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &BigInt, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<BigInt, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryStore;

    fn sample_tx(hash: &str, from: &str, value: i64) -> TransactionRecord {
        TransactionRecord {
            hash: hash.to_string(),
            from: from.to_string(),
            to: "0xvault".to_string(),
            value_minor_units: BigInt::from(value),
            block_number: 100,
            block_hash: "0xblock".to_string(),
            timestamp: Utc::now(),
            chain_id: 8453,
            confirmations: 1,
        }
    }

    #[tokio::test]
    async fn recording_twice_is_idempotent() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let ledger = DepositLedger::new(kv);
        let tx = sample_tx("0xAA", "0xFrom", 100_000_000_000_000);

        assert!(ledger.record_deposit(&tx).await.unwrap());
        assert!(!ledger.record_deposit(&tx).await.unwrap());

        let stats = ledger.get_user_stats("0xFrom").await.unwrap().unwrap();
        assert_eq!(stats.total_transactions, 1);
        assert_eq!(stats.total_value_minor_units, BigInt::from(100_000_000_000_000_i64));
    }

    #[tokio::test]
    async fn mark_settled_zeroes_total_but_keeps_tx_history() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let ledger = DepositLedger::new(kv);
        let tx = sample_tx("0xBB", "0xFrom", 500);
        ledger.record_deposit(&tx).await.unwrap();

        ledger.mark_user_settled("0xFrom").await.unwrap();

        let stats = ledger.get_user_stats("0xFrom").await.unwrap().unwrap();
        assert_eq!(stats.total_value_minor_units, BigInt::from(0));
        assert!(stats.settled_at.is_some());
        assert_eq!(ledger.list_user_transactions("0xFrom", 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn get_all_user_stats_sums_across_depositors() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let ledger = DepositLedger::new(kv);
        ledger.record_deposit(&sample_tx("0x1", "0xA", 3_000_000_000_000_000_000)).await.unwrap();
        ledger.record_deposit(&sample_tx("0x2", "0xB", 1_000_000_000_000_000_000)).await.unwrap();

        let total = ledger.total_deposits_minor_units().await.unwrap();
        assert_eq!(total, BigInt::from(4_000_000_000_000_000_000_i128));
    }
}
