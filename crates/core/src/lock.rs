//! Distributed mutual exclusion over the KV store.
//!
//! A lock is a `SET key owner_token NX EX ttl`. Release only succeeds if
//! the caller still holds the token it acquired with, so a lock whose TTL
//! expired and was re-acquired by someone else is never released out from
//! under them.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;

use crate::error::{CoreError, Result};
use crate::kv::{KvStore, SetOptions};

/// `lock:operation:<op>:<id|"global">`, id lowercased.
fn lock_key(op: &str, id: &str) -> String {
    let id = if id.is_empty() { "global" } else { id };
    format!("lock:operation:{op}:{}", id.to_ascii_lowercase())
}

/// Generates an owner token unique enough to distinguish this holder from
/// any other process or retry: wall-clock millis plus a random suffix.
fn owner_token() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    let suffix: u32 = rand::thread_rng().gen();
    format!("{millis}-{suffix:08x}")
}

pub struct LockRegistry {
    kv: Arc<dyn KvStore>,
}

impl LockRegistry {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    /// Attempts to acquire `op:id` for `ttl_secs`. Returns `Err(LockConflict)`
    /// if already held.
    pub async fn acquire(&self, op: &str, id: &str, ttl_secs: u64) -> Result<LockGuard> {
        let key = lock_key(op, id);
        let token = owner_token();
        let acquired = self
            .kv
            .set(&key, token.as_bytes(), SetOptions::nx(Some(ttl_secs)))
            .await?;
        if !acquired {
            return Err(CoreError::LockConflict {
                op: op.to_string(),
                id: id.to_string(),
            });
        }
        Ok(LockGuard {
            kv: self.kv.clone(),
            key,
            token,
        })
    }

    pub async fn is_held(&self, op: &str, id: &str) -> Result<bool> {
        self.kv.exists(&lock_key(op, id)).await
    }

    /// Busy-waits for up to `max_retries` attempts, sleeping `delay`
    /// between each.
    pub async fn acquire_with_retry(
        &self,
        op: &str,
        id: &str,
        ttl_secs: u64,
        max_retries: u32,
        delay: std::time::Duration,
    ) -> Result<LockGuard> {
        let mut last_err = None;
        for attempt in 0..=max_retries {
            match self.acquire(op, id, ttl_secs).await {
                Ok(guard) => return Ok(guard),
                Err(e @ CoreError::LockConflict { .. }) => {
                    last_err = Some(e);
                    if attempt < max_retries {
                        tokio::time::sleep(delay).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or(CoreError::LockConflict { op: op.to_string(), id: id.to_string() }))
    }

    /// Acquires a lock keyed by a literal key rather than the canonical
    /// `lock:operation:<op>:<id>` scheme, used for the job queue's single
    /// global gate, `jobs:lock:main`.
    pub async fn acquire_raw(&self, key: &str, ttl_secs: u64) -> Result<LockGuard> {
        let token = owner_token();
        let acquired = self
            .kv
            .set(key, token.as_bytes(), SetOptions::nx(Some(ttl_secs)))
            .await?;
        if !acquired {
            return Err(CoreError::LockConflict { op: "jobs".to_string(), id: key.to_string() });
        }
        Ok(LockGuard { kv: self.kv.clone(), key: key.to_string(), token })
    }
}

/// A held lock. Dropping this without calling `release` leaves the lock to
/// expire naturally via its TTL — the lock is never released implicitly,
/// since that would require blocking I/O in `Drop`.
pub struct LockGuard {
    kv: Arc<dyn KvStore>,
    key: String,
    token: String,
}

impl LockGuard {
    /// Releases the lock only if it still carries this guard's token.
    pub async fn release(self) -> Result<()> {
        if let Some(current) = self.kv.get(&self.key).await? {
            if current == self.token.as_bytes() {
                self.kv.del(&self.key).await?;
            }
        }
        Ok(())
    }

    /// Extends the TTL, used by long-running job handlers as a heartbeat.
    pub async fn renew(&self, ttl_secs: u64) -> Result<bool> {
        match self.kv.get(&self.key).await? {
            Some(current) if current == self.token.as_bytes() => {
                self.kv.expire(&self.key, ttl_secs).await
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryStore;

    #[tokio::test]
    async fn second_acquire_conflicts_until_released() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let registry = LockRegistry::new(kv);

        let guard = registry.acquire("rebalance", "vault-1", 60).await.unwrap();
        assert!(registry.acquire("rebalance", "vault-1", 60).await.is_err());

        guard.release().await.unwrap();
        assert!(registry.acquire("rebalance", "vault-1", 60).await.is_ok());
    }

    #[tokio::test]
    async fn distinct_ids_do_not_conflict() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let registry = LockRegistry::new(kv);

        let _a = registry.acquire("settlement", "round-1", 60).await.unwrap();
        assert!(registry.acquire("settlement", "round-2", 60).await.is_ok());
    }
}
