//! Durable FIFO job queue with global single-consumer gating.

mod job;
mod sweeper;

pub use job::{Job, JobPayload, JobType, RebalanceJobPayload, RebalanceReason, SettlementJobPayload};

use std::sync::Arc;

use chrono::Utc;
use rand::Rng;
use uuid::Uuid;

use crate::error::{CoreError, Result};
use crate::kv::{KvStore, KvStoreExt, SetOptions};
use crate::lock::LockRegistry;

const QUEUE_KEY: &str = "jobs:queue:main";
const GATE_KEY: &str = "jobs:lock:main";

fn processing_key(id: &str) -> String {
    format!("jobs:processing:{id}")
}

fn dedupe_key(raw: &str) -> String {
    format!("jobs:dedupe:{raw}")
}

pub struct EnqueueOptions {
    pub dedupe_key: Option<String>,
    pub dedupe_ttl_secs: u64,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self { dedupe_key: None, dedupe_ttl_secs: 300 }
    }
}

pub struct JobQueue {
    kv: Arc<dyn KvStore>,
    locks: Arc<LockRegistry>,
    job_lock_ttl_secs: u64,
    job_max_age_secs: i64,
}

impl JobQueue {
    pub fn new(kv: Arc<dyn KvStore>, locks: Arc<LockRegistry>, job_lock_ttl_secs: u64, job_max_age_secs: i64) -> Self {
        Self { kv, locks, job_lock_ttl_secs, job_max_age_secs }
    }

    /// Writes a new job to the tail of the queue. Returns `None` if a
    /// dedup key was supplied and already owned by another writer.
    pub async fn enqueue(
        &self,
        job_type: JobType,
        payload: JobPayload,
        opts: EnqueueOptions,
    ) -> Result<Option<Job>> {
        if let Some(raw) = &opts.dedupe_key {
            let accepted = self
                .kv
                .set(&dedupe_key(raw), b"1", SetOptions::nx(Some(opts.dedupe_ttl_secs)))
                .await?;
            if !accepted {
                return Ok(None);
            }
        }

        let job = Job {
            id: Uuid::new_v4().to_string(),
            job_type,
            payload,
            attempts: 0,
            enqueued_at: Utc::now(),
            last_attempt_at: None,
        };
        let bytes = serde_json::to_vec(&job)?;
        self.kv.rpush(QUEUE_KEY, &bytes).await?;
        Ok(Some(job))
    }

    /// Claims the head of the queue under the global consumer gate.
    pub async fn claim_next(&self) -> Result<Option<JobHandle>> {
        let guard = match self.locks.acquire_raw(GATE_KEY, self.job_lock_ttl_secs).await {
            Ok(guard) => guard,
            Err(CoreError::LockConflict { .. }) => return Ok(None),
            Err(e) => return Err(e),
        };

        if rand::thread_rng().gen_bool(0.1) {
            sweeper::sweep_stale_jobs(self.kv.as_ref(), QUEUE_KEY, self.job_max_age_secs).await?;
        }

        let Some(raw) = self.kv.lpop(QUEUE_KEY).await? else {
            guard.release().await?;
            return Ok(None);
        };

        let Some(mut job) = sweeper::decode_job(&raw) else {
            guard.release().await?;
            return Ok(None);
        };

        job.attempts += 1;
        job.last_attempt_at = Some(Utc::now());
        self.kv
            .set_json(&processing_key(&job.id), &job, SetOptions::ex(self.job_lock_ttl_secs))
            .await?;

        Ok(Some(JobHandle {
            kv: self.kv.clone(),
            guard: Some(guard),
            job,
            job_lock_ttl_secs: self.job_lock_ttl_secs,
        }))
    }

    /// Claims a specific job id synchronously, scanning up to `max_skip`
    /// entries and restoring the ones that don't match to the tail in
    /// original order.
    pub async fn claim_by_id(&self, job_id: &str, max_skip: usize) -> Result<Option<JobHandle>> {
        let guard = match self.locks.acquire_raw(GATE_KEY, self.job_lock_ttl_secs).await {
            Ok(guard) => guard,
            Err(CoreError::LockConflict { .. }) => return Ok(None),
            Err(e) => return Err(e),
        };

        sweeper::sweep_stale_jobs(self.kv.as_ref(), QUEUE_KEY, self.job_max_age_secs).await?;

        let mut skipped = Vec::new();
        let mut found: Option<Job> = None;
        for _ in 0..max_skip {
            let Some(raw) = self.kv.lpop(QUEUE_KEY).await? else {
                break;
            };
            let Some(job) = sweeper::decode_job(&raw) else {
                continue;
            };
            if job.id == job_id {
                found = Some(job);
                break;
            }
            skipped.push(job);
        }

        for job in &skipped {
            let bytes = serde_json::to_vec(job)?;
            self.kv.rpush(QUEUE_KEY, &bytes).await?;
        }

        let Some(mut job) = found else {
            guard.release().await?;
            return Ok(None);
        };

        job.attempts += 1;
        job.last_attempt_at = Some(Utc::now());
        self.kv
            .set_json(&processing_key(&job.id), &job, SetOptions::ex(self.job_lock_ttl_secs))
            .await?;

        Ok(Some(JobHandle {
            kv: self.kv.clone(),
            guard: Some(guard),
            job,
            job_lock_ttl_secs: self.job_lock_ttl_secs,
        }))
    }

    pub async fn size(&self) -> Result<i64> {
        self.kv.llen(QUEUE_KEY).await
    }

    pub async fn peek(&self, limit: i64) -> Result<Vec<Job>> {
        let raw = self.kv.lrange(QUEUE_KEY, 0, limit.saturating_sub(1).max(0)).await?;
        Ok(raw.iter().filter_map(|b| sweeper::decode_job(b)).collect())
    }

    pub async fn clear(&self) -> Result<()> {
        self.kv.del(QUEUE_KEY).await?;
        Ok(())
    }

    /// Scans `jobs:processing:*` for any record of the given job type.
    pub async fn is_processing(&self, job_type: Option<JobType>) -> Result<bool> {
        let mut cursor = 0u64;
        loop {
            let (next, keys) = self.kv.scan(cursor, "jobs:processing:*", 50).await?;
            for key in keys {
                if let Some(bytes) = self.kv.get(&key).await? {
                    if let Some(job) = sweeper::decode_job(&bytes) {
                        match job_type {
                            Some(t) if job.job_type == t => return Ok(true),
                            None => return Ok(true),
                            _ => {}
                        }
                    }
                }
            }
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(false)
    }
}

/// A claimed job, with the gate and processing record tied to its lifetime.
pub struct JobHandle {
    kv: Arc<dyn KvStore>,
    guard: Option<crate::lock::LockGuard>,
    job: Job,
    job_lock_ttl_secs: u64,
}

impl JobHandle {
    pub fn job(&self) -> &Job {
        &self.job
    }

    pub async fn ack(mut self) -> Result<()> {
        self.kv.del(&processing_key(&self.job.id)).await?;
        if let Some(guard) = self.guard.take() {
            guard.release().await?;
        }
        Ok(())
    }

    pub async fn fail(mut self, requeue: bool) -> Result<()> {
        self.kv.del(&processing_key(&self.job.id)).await?;
        if requeue {
            let bytes = serde_json::to_vec(&self.job)?;
            self.kv.lpush(QUEUE_KEY, &bytes).await?;
        }
        if let Some(guard) = self.guard.take() {
            guard.release().await?;
        }
        Ok(())
    }

    pub async fn heartbeat(&self) -> Result<()> {
        self.kv
            .set_json(&processing_key(&self.job.id), &self.job, SetOptions::ex(self.job_lock_ttl_secs))
            .await?;
        if let Some(guard) = &self.guard {
            guard.renew(self.job_lock_ttl_secs).await?;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl crate::heartbeat::Heartbeat for JobHandle {
    async fn beat(&self) -> Result<()> {
        self.heartbeat().await
    }
}
