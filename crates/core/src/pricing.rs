//! Per-asset USD price snapshots with TTL and upstream fallback.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::kv::{KvStore, KvStoreExt, SetOptions};
use treasury_chain::PriceOracleClient;

/// Price scale shared by every snapshot this cache writes. The planner
/// rejects any mix of snapshots that don't all carry this value.
pub const PRICE_DECIMALS: u32 = 8;

fn snapshot_key(asset_id: &str) -> String {
    format!("price:snapshot:{asset_id}")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceSnapshot {
    pub asset_id: String,
    pub symbol: String,
    pub price_usd: f64,
    pub source: String,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub price_decimals: u32,
    pub price_raw: i128,
}

pub struct PriceCache {
    kv: Arc<dyn KvStore>,
    oracle: Arc<dyn PriceOracleClient>,
    ttl_secs: u64,
}

impl PriceCache {
    pub fn new(kv: Arc<dyn KvStore>, oracle: Arc<dyn PriceOracleClient>, ttl_secs: u64) -> Self {
        Self { kv, oracle, ttl_secs }
    }

    pub async fn get_price(&self, asset_id: &str, symbol: &str) -> Result<PriceSnapshot> {
        let cached = self.kv.get_json::<PriceSnapshot>(&snapshot_key(asset_id)).await?;
        if let Some(cached) = &cached {
            if cached.expires_at > Utc::now() {
                return Ok(cached.clone());
            }
        }

        match self.fetch_and_cache(asset_id, symbol).await {
            Ok(snapshot) => Ok(snapshot),
            Err(err) => cached.ok_or(err),
        }
    }

    /// Fetches a fresh price from the oracle and writes it to the cache.
    /// Absent or non-finite prices are rejected here; the caller decides
    /// whether to fall back to a stale cached snapshot instead.
    async fn fetch_and_cache(&self, asset_id: &str, symbol: &str) -> Result<PriceSnapshot> {
        let price_usd = self
            .oracle
            .spot_price_usd(symbol)
            .await
            .map_err(|_| CoreError::PriceUnavailable { asset_id: asset_id.to_string() })?;

        if !price_usd.is_finite() || price_usd <= 0.0 {
            return Err(CoreError::PriceUnavailable { asset_id: asset_id.to_string() });
        }

        let now = Utc::now();
        let snapshot = PriceSnapshot {
            asset_id: asset_id.to_string(),
            symbol: symbol.to_string(),
            price_usd,
            source: "coinbase".to_string(),
            updated_at: now,
            expires_at: now + chrono::Duration::seconds(self.ttl_secs as i64),
            price_decimals: PRICE_DECIMALS,
            price_raw: (price_usd * 10f64.powi(PRICE_DECIMALS as i32)).round() as i128,
        };

        self.kv
            .set_json(&snapshot_key(asset_id), &snapshot, SetOptions::ex(self.ttl_secs))
            .await?;

        Ok(snapshot)
    }

    /// Fetches prices for every `(asset_id, symbol)` pair concurrently;
    /// assets that fail to price are simply absent from the result map, not
    /// an error — callers decide whether a missing asset is fatal.
    pub async fn get_prices(&self, assets: &[(String, String)]) -> Vec<(String, Result<PriceSnapshot>)> {
        let futures = assets.iter().map(|(asset_id, symbol)| async move {
            (asset_id.clone(), self.get_price(asset_id, symbol).await)
        });
        join_all(futures).await
    }

    /// Validates that every snapshot in the set shares `price_decimals`;
    /// the rebalance planner requires a common scale.
    pub fn assert_common_scale(snapshots: &[&PriceSnapshot]) -> Result<()> {
        let mut iter = snapshots.iter();
        let Some(first) = iter.next() else {
            return Ok(());
        };
        for other in iter {
            if other.price_decimals != first.price_decimals {
                return Err(CoreError::MismatchedPriceDecimals {
                    a: first.asset_id.clone(),
                    a_decimals: first.price_decimals,
                    b: other.asset_id.clone(),
                    b_decimals: other.price_decimals,
                });
            }
        }
        Ok(())
    }
}
