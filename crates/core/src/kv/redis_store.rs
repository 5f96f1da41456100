use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands};

use crate::error::Result;

use super::{KvStore, SetOptions};

/// Production `KvStore` backed by Redis (or a Redis-wire-compatible store),
/// via a `ConnectionManager` that reconnects transparently on drop.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl KvStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn.clone();
        Ok(conn.get(key).await?)
    }

    async fn set(&self, key: &str, value: &[u8], opts: SetOptions) -> Result<bool> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if opts.nx {
            cmd.arg("NX");
        }
        if let Some(seconds) = opts.ex_seconds {
            cmd.arg("EX").arg(seconds);
        }
        let reply: redis::Value = cmd.query_async(&mut conn).await?;
        Ok(!matches!(reply, redis::Value::Nil))
    }

    async fn del(&self, key: &str) -> Result<u64> {
        let mut conn = self.conn.clone();
        Ok(conn.del(key).await?)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        Ok(conn.exists(key).await?)
    }

    async fn expire(&self, key: &str, seconds: u64) -> Result<bool> {
        let mut conn = self.conn.clone();
        Ok(conn.expire(key, seconds as i64).await?)
    }

    async fn hset(&self, key: &str, field: &str, value: &[u8]) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.hset(key, field, value).await?;
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn.clone();
        Ok(conn.hget(key, field).await?)
    }

    async fn hgetall(&self, key: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let mut conn = self.conn.clone();
        let map: std::collections::HashMap<String, Vec<u8>> = conn.hgetall(key).await?;
        Ok(map.into_iter().collect())
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<u64> {
        let mut conn = self.conn.clone();
        Ok(conn.hdel(key, field).await?)
    }

    async fn lpush(&self, key: &str, value: &[u8]) -> Result<i64> {
        let mut conn = self.conn.clone();
        Ok(conn.lpush(key, value).await?)
    }

    async fn rpush(&self, key: &str, value: &[u8]) -> Result<i64> {
        let mut conn = self.conn.clone();
        Ok(conn.rpush(key, value).await?)
    }

    async fn lpop(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn.clone();
        Ok(conn.lpop(key, None).await?)
    }

    async fn llen(&self, key: &str) -> Result<i64> {
        let mut conn = self.conn.clone();
        Ok(conn.llen(key).await?)
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<Vec<u8>>> {
        let mut conn = self.conn.clone();
        Ok(conn.lrange(key, start as isize, stop as isize).await?)
    }

    async fn ltrim(&self, key: &str, start: i64, stop: i64) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.ltrim(key, start as isize, stop as isize).await?;
        Ok(())
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.zadd(key, member, score).await?;
        Ok(())
    }

    async fn zrange(&self, key: &str, start: i64, stop: i64, rev: bool) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        if rev {
            Ok(conn.zrevrange(key, start as isize, stop as isize).await?)
        } else {
            Ok(conn.zrange(key, start as isize, stop as isize).await?)
        }
    }

    async fn scan(&self, cursor: u64, pattern: &str, count: usize) -> Result<(u64, Vec<String>)> {
        let mut conn = self.conn.clone();
        let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg(pattern)
            .arg("COUNT")
            .arg(count)
            .query_async(&mut conn)
            .await?;
        Ok((next, keys))
    }
}
