//! KV driver capability.
//!
//! The core depends on a narrow command set, not a particular
//! implementation — `KvStore` is implemented by `RedisStore` for
//! production and `MemoryStore` for tests, so every component above this
//! module is testable without a live Redis instance.

mod memory_store;
mod redis_store;

pub use memory_store::MemoryStore;
pub use redis_store::RedisStore;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};

use crate::error::{CoreError, Result};

#[derive(Debug, Clone, Default)]
pub struct SetOptions {
    /// Only set if the key does not already exist.
    pub nx: bool,
    /// Expire after this many seconds.
    pub ex_seconds: Option<u64>,
}

impl SetOptions {
    pub fn nx(ex_seconds: Option<u64>) -> Self {
        Self { nx: true, ex_seconds }
    }

    pub fn ex(seconds: u64) -> Self {
        Self { nx: false, ex_seconds: Some(seconds) }
    }
}

/// The minimal KV command set consumed by the treasury core.
///
/// Writes are single-command atomic; compound updates use a client-side
/// `Pipeline`, whose ordering is preserved but whose atomicity across
/// commands is NOT assumed.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Returns `true` iff the write was accepted (for `nx`, only on
    /// absence).
    async fn set(&self, key: &str, value: &[u8], opts: SetOptions) -> Result<bool>;

    async fn del(&self, key: &str) -> Result<u64>;
    async fn exists(&self, key: &str) -> Result<bool>;
    async fn expire(&self, key: &str, seconds: u64) -> Result<bool>;

    async fn hset(&self, key: &str, field: &str, value: &[u8]) -> Result<()>;
    async fn hget(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>>;
    async fn hgetall(&self, key: &str) -> Result<Vec<(String, Vec<u8>)>>;
    async fn hdel(&self, key: &str, field: &str) -> Result<u64>;

    async fn lpush(&self, key: &str, value: &[u8]) -> Result<i64>;
    async fn rpush(&self, key: &str, value: &[u8]) -> Result<i64>;
    async fn lpop(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn llen(&self, key: &str) -> Result<i64>;
    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<Vec<u8>>>;
    async fn ltrim(&self, key: &str, start: i64, stop: i64) -> Result<()>;

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()>;
    /// `rev = true` returns highest score first (mirrors `ZREVRANGE`).
    async fn zrange(&self, key: &str, start: i64, stop: i64, rev: bool) -> Result<Vec<String>>;

    /// Returns `(next_cursor, keys)`. Callers iterate until the cursor
    /// returns to zero.
    async fn scan(&self, cursor: u64, pattern: &str, count: usize) -> Result<(u64, Vec<String>)>;
}

/// JSON convenience helpers layered over the raw byte commands.
///
/// Some deployed drivers auto-decode JSON on `GET`; this crate's drivers do
/// not, but every reader still tolerates replaying historical data that was
/// written by a driver that did: if the
/// stored bytes parse as a JSON string, the inner string is parsed again.
#[async_trait]
pub trait KvStoreExt: KvStore {
    async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key).await? {
            Some(bytes) => Ok(Some(decode_dual_shape(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn set_json<T: Serialize + Sync>(
        &self,
        key: &str,
        value: &T,
        opts: SetOptions,
    ) -> Result<bool> {
        let bytes = serde_json::to_vec(value)?;
        self.set(key, &bytes, opts).await
    }

    async fn hget_json<T: DeserializeOwned>(&self, key: &str, field: &str) -> Result<Option<T>> {
        match self.hget(key, field).await? {
            Some(bytes) => Ok(Some(decode_dual_shape(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn hset_json<T: Serialize + Sync>(&self, key: &str, field: &str, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec(value)?;
        self.hset(key, field, &bytes).await
    }

    async fn hgetall_json<T: DeserializeOwned>(&self, key: &str) -> Result<Vec<(String, T)>> {
        let raw = self.hgetall(key).await?;
        let mut out = Vec::with_capacity(raw.len());
        for (field, bytes) in raw {
            out.push((field, decode_dual_shape(&bytes)?));
        }
        Ok(out)
    }
}

impl<T: KvStore + ?Sized> KvStoreExt for T {}

/// Decodes bytes that are either a direct JSON document, or a JSON string
/// whose contents are themselves JSON (the "pre-decoded-then-re-encoded"
/// shape some drivers produce).
fn decode_dual_shape<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    if let Ok(direct) = serde_json::from_slice::<T>(bytes) {
        return Ok(direct);
    }
    let as_string: String = serde_json::from_slice(bytes).map_err(|e| CoreError::JsonDecode {
        context: "dual-shape KV decode".to_string(),
        error: e.to_string(),
    })?;
    serde_json::from_str(&as_string).map_err(|e| CoreError::JsonDecode {
        context: "dual-shape KV decode (nested)".to_string(),
        error: e.to_string(),
    })
}

/// A client-side sequence of writes executed in order against the same
/// store. No cross-command atomicity is implied.
pub struct Pipeline<'a> {
    store: &'a dyn KvStore,
    ops: Vec<PipelineOp>,
}

enum PipelineOp {
    Set(String, Vec<u8>, SetOptions),
    Lpush(String, Vec<u8>),
    Rpush(String, Vec<u8>),
    Ltrim(String, i64, i64),
    Hset(String, String, Vec<u8>),
    Zadd(String, String, f64),
    Del(String),
}

impl<'a> Pipeline<'a> {
    pub fn new(store: &'a dyn KvStore) -> Self {
        Self { store, ops: Vec::new() }
    }

    pub fn set(mut self, key: impl Into<String>, value: Vec<u8>, opts: SetOptions) -> Self {
        self.ops.push(PipelineOp::Set(key.into(), value, opts));
        self
    }

    pub fn set_json<T: Serialize>(mut self, key: impl Into<String>, value: &T, opts: SetOptions) -> Self {
        let bytes = serde_json::to_vec(value).unwrap_or_default();
        self.ops.push(PipelineOp::Set(key.into(), bytes, opts));
        self
    }

    pub fn lpush(mut self, key: impl Into<String>, value: Vec<u8>) -> Self {
        self.ops.push(PipelineOp::Lpush(key.into(), value));
        self
    }

    pub fn rpush(mut self, key: impl Into<String>, value: Vec<u8>) -> Self {
        self.ops.push(PipelineOp::Rpush(key.into(), value));
        self
    }

    pub fn ltrim(mut self, key: impl Into<String>, start: i64, stop: i64) -> Self {
        self.ops.push(PipelineOp::Ltrim(key.into(), start, stop));
        self
    }

    pub fn hset(mut self, key: impl Into<String>, field: impl Into<String>, value: Vec<u8>) -> Self {
        self.ops.push(PipelineOp::Hset(key.into(), field.into(), value));
        self
    }

    pub fn zadd(mut self, key: impl Into<String>, member: impl Into<String>, score: f64) -> Self {
        self.ops.push(PipelineOp::Zadd(key.into(), member.into(), score));
        self
    }

    pub fn del(mut self, key: impl Into<String>) -> Self {
        self.ops.push(PipelineOp::Del(key.into()));
        self
    }

    pub async fn execute(self) -> Result<()> {
        for op in self.ops {
            match op {
                PipelineOp::Set(key, value, opts) => {
                    self.store.set(&key, &value, opts).await?;
                }
                PipelineOp::Lpush(key, value) => {
                    self.store.lpush(&key, &value).await?;
                }
                PipelineOp::Rpush(key, value) => {
                    self.store.rpush(&key, &value).await?;
                }
                PipelineOp::Ltrim(key, start, stop) => {
                    self.store.ltrim(&key, start, stop).await?;
                }
                PipelineOp::Hset(key, field, value) => {
                    self.store.hset(&key, &field, &value).await?;
                }
                PipelineOp::Zadd(key, member, score) => {
                    self.store.zadd(&key, &member, score).await?;
                }
                PipelineOp::Del(key) => {
                    self.store.del(&key).await?;
                }
            }
        }
        Ok(())
    }
}
