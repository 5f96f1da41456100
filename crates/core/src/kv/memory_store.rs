use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::error::Result;

use super::{KvStore, SetOptions};

#[derive(Default)]
struct State {
    strings: HashMap<String, (Vec<u8>, Option<Instant>)>,
    hashes: HashMap<String, HashMap<String, Vec<u8>>>,
    lists: HashMap<String, VecDeque<Vec<u8>>>,
    zsets: HashMap<String, Vec<(String, f64)>>,
}

/// In-memory `KvStore` used by unit tests in place of a live Redis server.
///
/// Expiry is honoured lazily on read, same as Redis's own behaviour from
/// the caller's point of view.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn is_expired(entry: &(Vec<u8>, Option<Instant>)) -> bool {
        matches!(entry.1, Some(deadline) if Instant::now() >= deadline)
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut state = self.state.lock().unwrap();
        if let Some(entry) = state.strings.get(key) {
            if Self::is_expired(entry) {
                state.strings.remove(key);
                return Ok(None);
            }
            return Ok(Some(entry.0.clone()));
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: &[u8], opts: SetOptions) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        if opts.nx {
            if let Some(entry) = state.strings.get(key) {
                if !Self::is_expired(entry) {
                    return Ok(false);
                }
            }
        }
        let deadline = opts.ex_seconds.map(|s| Instant::now() + Duration::from_secs(s));
        state.strings.insert(key.to_string(), (value.to_vec(), deadline));
        Ok(true)
    }

    async fn del(&self, key: &str) -> Result<u64> {
        let mut state = self.state.lock().unwrap();
        let mut removed = 0;
        if state.strings.remove(key).is_some() {
            removed += 1;
        }
        if state.hashes.remove(key).is_some() {
            removed += 1;
        }
        if state.lists.remove(key).is_some() {
            removed += 1;
        }
        if state.zsets.remove(key).is_some() {
            removed += 1;
        }
        Ok(removed)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        if let Some(entry) = state.strings.get(key) {
            if Self::is_expired(entry) {
                state.strings.remove(key);
                return Ok(false);
            }
            return Ok(true);
        }
        Ok(state.hashes.contains_key(key) || state.lists.contains_key(key) || state.zsets.contains_key(key))
    }

    async fn expire(&self, key: &str, seconds: u64) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        if let Some(entry) = state.strings.get_mut(key) {
            entry.1 = Some(Instant::now() + Duration::from_secs(seconds));
            return Ok(true);
        }
        Ok(false)
    }

    async fn hset(&self, key: &str, field: &str, value: &[u8]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state
            .hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_vec());
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>> {
        let state = self.state.lock().unwrap();
        Ok(state.hashes.get(key).and_then(|h| h.get(field).cloned()))
    }

    async fn hgetall(&self, key: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .hashes
            .get(key)
            .map(|h| h.iter().map(|(f, v)| (f.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<u64> {
        let mut state = self.state.lock().unwrap();
        if let Some(h) = state.hashes.get_mut(key) {
            return Ok(if h.remove(field).is_some() { 1 } else { 0 });
        }
        Ok(0)
    }

    async fn lpush(&self, key: &str, value: &[u8]) -> Result<i64> {
        let mut state = self.state.lock().unwrap();
        let list = state.lists.entry(key.to_string()).or_default();
        list.push_front(value.to_vec());
        Ok(list.len() as i64)
    }

    async fn rpush(&self, key: &str, value: &[u8]) -> Result<i64> {
        let mut state = self.state.lock().unwrap();
        let list = state.lists.entry(key.to_string()).or_default();
        list.push_back(value.to_vec());
        Ok(list.len() as i64)
    }

    async fn lpop(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut state = self.state.lock().unwrap();
        Ok(state.lists.get_mut(key).and_then(|l| l.pop_front()))
    }

    async fn llen(&self, key: &str) -> Result<i64> {
        let state = self.state.lock().unwrap();
        Ok(state.lists.get(key).map(|l| l.len() as i64).unwrap_or(0))
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<Vec<u8>>> {
        let state = self.state.lock().unwrap();
        let Some(list) = state.lists.get(key) else {
            return Ok(Vec::new());
        };
        Ok(slice_range(list.len(), start, stop)
            .map(|range| list.iter().skip(range.0).take(range.1).cloned().collect())
            .unwrap_or_default())
    }

    async fn ltrim(&self, key: &str, start: i64, stop: i64) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(list) = state.lists.get_mut(key) {
            let len = list.len();
            match slice_range(len, start, stop) {
                Some((skip, take)) => {
                    let trimmed: VecDeque<_> = list.iter().skip(skip).take(take).cloned().collect();
                    *list = trimmed;
                }
                None => list.clear(),
            }
        }
        Ok(())
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let set = state.zsets.entry(key.to_string()).or_default();
        set.retain(|(m, _)| m != member);
        set.push((member.to_string(), score));
        set.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        Ok(())
    }

    async fn zrange(&self, key: &str, start: i64, stop: i64, rev: bool) -> Result<Vec<String>> {
        let state = self.state.lock().unwrap();
        let Some(set) = state.zsets.get(key) else {
            return Ok(Vec::new());
        };
        let mut members: Vec<String> = set.iter().map(|(m, _)| m.clone()).collect();
        if rev {
            members.reverse();
        }
        Ok(slice_range(members.len(), start, stop)
            .map(|(skip, take)| members.into_iter().skip(skip).take(take).collect())
            .unwrap_or_default())
    }

    async fn scan(&self, cursor: u64, pattern: &str, count: usize) -> Result<(u64, Vec<String>)> {
        let state = self.state.lock().unwrap();
        let mut keys: Vec<String> = state
            .strings
            .keys()
            .chain(state.hashes.keys())
            .chain(state.lists.keys())
            .chain(state.zsets.keys())
            .filter(|k| matches_pattern(k, pattern))
            .cloned()
            .collect();
        keys.sort();
        keys.dedup();

        let start = cursor as usize;
        if start >= keys.len() {
            return Ok((0, Vec::new()));
        }
        let end = (start + count.max(1)).min(keys.len());
        let next_cursor = if end >= keys.len() { 0 } else { end as u64 };
        Ok((next_cursor, keys[start..end].to_vec()))
    }
}

/// Translates Redis-style (possibly negative, inclusive) range bounds into
/// `(skip, take)` for a collection of length `len`. Returns `None` for an
/// empty result.
fn slice_range(len: usize, start: i64, stop: i64) -> Option<(usize, usize)> {
    if len == 0 {
        return None;
    }
    let norm = |i: i64| -> i64 {
        if i < 0 {
            (len as i64 + i).max(0)
        } else {
            i
        }
    };
    let start = norm(start).min(len as i64 - 1).max(0) as usize;
    let stop = norm(stop).min(len as i64 - 1);
    if stop < start as i64 {
        return None;
    }
    Some((start, stop as usize - start + 1))
}

/// Supports `*` as a prefix/suffix wildcard, the only pattern shape this
/// codebase's scanners issue.
fn matches_pattern(key: &str, pattern: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix('*') {
        return key.starts_with(prefix);
    }
    key == pattern
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_nx_refuses_overwrite() {
        let store = MemoryStore::new();
        assert!(store.set("k", b"a", SetOptions::nx(None)).await.unwrap());
        assert!(!store.set("k", b"b", SetOptions::nx(None)).await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), Some(b"a".to_vec()));
    }

    #[tokio::test]
    async fn list_push_pop_and_range() {
        let store = MemoryStore::new();
        store.rpush("l", b"1").await.unwrap();
        store.rpush("l", b"2").await.unwrap();
        store.rpush("l", b"3").await.unwrap();
        assert_eq!(store.llen("l").await.unwrap(), 3);
        let range = store.lrange("l", 0, -1).await.unwrap();
        assert_eq!(range, vec![b"1".to_vec(), b"2".to_vec(), b"3".to_vec()]);
        assert_eq!(store.lpop("l").await.unwrap(), Some(b"1".to_vec()));
    }

    #[tokio::test]
    async fn ltrim_caps_history_length() {
        let store = MemoryStore::new();
        for i in 0..5 {
            store.lpush("h", format!("{i}").as_bytes()).await.unwrap();
        }
        store.ltrim("h", 0, 2).await.unwrap();
        assert_eq!(store.llen("h").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn zadd_orders_by_score() {
        let store = MemoryStore::new();
        store.zadd("z", "b", 2.0).await.unwrap();
        store.zadd("z", "a", 1.0).await.unwrap();
        store.zadd("z", "c", 3.0).await.unwrap();
        assert_eq!(store.zrange("z", 0, -1, false).await.unwrap(), vec!["a", "b", "c"]);
        assert_eq!(store.zrange("z", 0, -1, true).await.unwrap(), vec!["c", "b", "a"]);
    }

    #[tokio::test]
    async fn scan_matches_prefix_pattern() {
        let store = MemoryStore::new();
        store.set("vote:1", b"x", SetOptions::default()).await.unwrap();
        store.set("vote:2", b"x", SetOptions::default()).await.unwrap();
        store.set("other", b"x", SetOptions::default()).await.unwrap();
        let (cursor, keys) = store.scan(0, "vote:*", 10).await.unwrap();
        assert_eq!(cursor, 0);
        assert_eq!(keys.len(), 2);
    }
}
