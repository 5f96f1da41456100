use chrono::Utc;

use crate::error::Result;
use crate::kv::KvStore;

use super::job::Job;

/// Decodes a queue entry that may be a direct JSON object or a JSON string
/// wrapping one. Unparsable entries are dropped rather than propagated,
/// matching the sweeper's contract.
pub fn decode_job(bytes: &[u8]) -> Option<Job> {
    if let Ok(job) = serde_json::from_slice::<Job>(bytes) {
        return Some(job);
    }
    let as_string: String = serde_json::from_slice(bytes).ok()?;
    serde_json::from_str(&as_string).ok()
}

/// Drops jobs older than `max_age_secs` and any entry that fails to parse,
/// then rewrites the list from the kept entries in order.
pub async fn sweep_stale_jobs(kv: &dyn KvStore, queue_key: &str, max_age_secs: i64) -> Result<()> {
    let raw = kv.lrange(queue_key, 0, -1).await?;
    if raw.is_empty() {
        return Ok(());
    }

    let now = Utc::now();
    let kept: Vec<Job> = raw
        .iter()
        .filter_map(|bytes| decode_job(bytes))
        .filter(|job| (now - job.enqueued_at).num_seconds() <= max_age_secs)
        .collect();

    if kept.len() == raw.len() {
        return Ok(());
    }

    kv.del(queue_key).await?;
    for job in kept {
        let bytes = serde_json::to_vec(&job)?;
        kv.rpush(queue_key, &bytes).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryStore;
    use crate::queue::{JobPayload, JobType};
    use chrono::Duration;

    fn job_with_age(seconds_ago: i64) -> Job {
        Job {
            id: uuid::Uuid::new_v4().to_string(),
            job_type: JobType::Rebalance,
            payload: JobPayload::rebalance("manual", None),
            attempts: 0,
            enqueued_at: Utc::now() - Duration::seconds(seconds_ago),
            last_attempt_at: None,
        }
    }

    #[tokio::test]
    async fn drops_entries_older_than_max_age() {
        let kv = MemoryStore::new();
        let fresh = job_with_age(10);
        let stale = job_with_age(10_000);
        kv.rpush("q", &serde_json::to_vec(&fresh).unwrap()).await.unwrap();
        kv.rpush("q", &serde_json::to_vec(&stale).unwrap()).await.unwrap();

        sweep_stale_jobs(&kv, "q", 300).await.unwrap();

        let remaining = kv.lrange("q", 0, -1).await.unwrap();
        assert_eq!(remaining.len(), 1);
        let job = decode_job(&remaining[0]).unwrap();
        assert_eq!(job.id, fresh.id);
    }

    #[tokio::test]
    async fn drops_unparsable_entries() {
        let kv = MemoryStore::new();
        kv.rpush("q", b"not json").await.unwrap();
        kv.rpush("q", &serde_json::to_vec(&job_with_age(0)).unwrap()).await.unwrap();

        sweep_stale_jobs(&kv, "q", 300).await.unwrap();

        assert_eq!(kv.llen("q").await.unwrap(), 1);
    }
}
