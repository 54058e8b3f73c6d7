//! Durable job queue backing
//!
//! Two logical FIFO streams (`single` and `bulk`) with at-least-once
//! delivery, plus the batch job records and their per-email result rows.
//! Unlike the cache, the job store does not fail open: losing a job record
//! is an error the caller must see.

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::model::VerificationResult;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("job store backend error: {0}")]
    Backend(String),
    #[error("corrupted job record: {0}")]
    Corrupted(String),
}

/// Lifecycle of a batch job. Transitions are monotone except `Failed`,
/// which is terminal from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl BatchStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, BatchStatus::Completed | BatchStatus::Failed)
    }

    /// Whether moving from `self` to `to` respects the lifecycle.
    pub fn can_transition(self, to: BatchStatus) -> bool {
        if self == to {
            return true;
        }
        match (self, to) {
            (BatchStatus::Queued, BatchStatus::Processing) => true,
            (BatchStatus::Processing, BatchStatus::Completed) => true,
            (BatchStatus::Queued | BatchStatus::Processing, BatchStatus::Failed) => true,
            _ => false,
        }
    }
}

/// Durable record of one verification batch.
///
/// Counter invariant: `valid + invalid = processed <= total` at every
/// observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchJob {
    pub batch_id: Uuid,
    pub job_id: Uuid,
    pub owner: String,
    pub total: u64,
    pub processed: u64,
    pub valid: u64,
    pub invalid: u64,
    /// 1-100 once processing has started.
    pub progress: u8,
    pub status: BatchStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub callback_url: Option<String>,
    pub notify_email: Option<String>,
}

impl BatchJob {
    pub fn new(
        owner: &str,
        total: u64,
        callback_url: Option<String>,
        notify_email: Option<String>,
    ) -> Self {
        Self {
            batch_id: Uuid::new_v4(),
            job_id: Uuid::new_v4(),
            owner: owner.to_string(),
            total,
            processed: 0,
            valid: 0,
            invalid: 0,
            progress: 0,
            status: BatchStatus::Queued,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error: None,
            callback_url,
            notify_email,
        }
    }

    /// Recompute the 1-100 progress tick from the counters.
    pub fn tick(&mut self) {
        self.progress = if self.total == 0 {
            100
        } else {
            ((self.processed * 100 / self.total).clamp(1, 100)) as u8
        };
    }
}

/// The two logical work queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStream {
    Single,
    Bulk,
}

impl JobStream {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStream::Single => "single",
            JobStream::Bulk => "bulk",
        }
    }
}

/// One unit of queued work: the payload plus its delivery attempt counter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    pub job_id: Uuid,
    pub batch_id: Uuid,
    pub emails: Vec<String>,
    pub attempt: u32,
    pub enqueued_at: DateTime<Utc>,
}

pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

/// Durable FIFO queue and job record store.
pub trait JobStore: Send + Sync {
    fn create_job<'a>(&'a self, job: &'a BatchJob) -> StoreFuture<'a, ()>;
    fn load_job<'a>(&'a self, batch_id: Uuid) -> StoreFuture<'a, Option<BatchJob>>;
    /// Persist an updated job record. Implementations reject lifecycle
    /// violations with [`StoreError::Corrupted`].
    fn update_job<'a>(&'a self, job: &'a BatchJob) -> StoreFuture<'a, ()>;
    fn enqueue<'a>(&'a self, stream: JobStream, item: &'a QueueItem) -> StoreFuture<'a, ()>;
    fn dequeue<'a>(&'a self, stream: JobStream) -> StoreFuture<'a, Option<QueueItem>>;
    fn append_result<'a>(
        &'a self,
        batch_id: Uuid,
        row: &'a VerificationResult,
    ) -> StoreFuture<'a, ()>;
    fn results<'a>(&'a self, batch_id: Uuid) -> StoreFuture<'a, Vec<VerificationResult>>;
    fn request_cancel<'a>(&'a self, batch_id: Uuid) -> StoreFuture<'a, ()>;
    fn cancel_requested<'a>(&'a self, batch_id: Uuid) -> StoreFuture<'a, bool>;
    /// Schedule a terminal job and its rows for removal after `retention`.
    fn expire_terminal<'a>(&'a self, batch_id: Uuid, retention: Duration) -> StoreFuture<'a, ()>;
}

fn backend<E: std::fmt::Display>(e: E) -> StoreError {
    StoreError::Backend(e.to_string())
}

/// Redis-backed store: job records as JSON strings, queues as lists
/// (`LPUSH`/`RPOP` for FIFO), result rows as list entries.
pub struct RedisJobStore {
    conn: redis::aio::MultiplexedConnection,
    prefix: String,
}

impl RedisJobStore {
    pub async fn connect(url: &str, prefix: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url).map_err(backend)?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(backend)?;
        info!("Connected job store to {} (prefix '{}')", url, prefix);
        Ok(Self {
            conn,
            prefix: prefix.to_string(),
        })
    }

    fn job_key(&self, batch_id: Uuid) -> String {
        format!("{}:job:{}", self.prefix, batch_id)
    }

    fn queue_key(&self, stream: JobStream) -> String {
        format!("{}:queue:{}", self.prefix, stream.as_str())
    }

    fn results_key(&self, batch_id: Uuid) -> String {
        format!("{}:results:{}", self.prefix, batch_id)
    }

    fn cancel_key(&self, batch_id: Uuid) -> String {
        format!("{}:cancel:{}", self.prefix, batch_id)
    }
}

impl JobStore for RedisJobStore {
    fn create_job<'a>(&'a self, job: &'a BatchJob) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let json = serde_json::to_string(job).map_err(backend)?;
            conn.set::<_, _, ()>(self.job_key(job.batch_id), json)
                .await
                .map_err(backend)
        })
    }

    fn load_job<'a>(&'a self, batch_id: Uuid) -> StoreFuture<'a, Option<BatchJob>> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let raw: Option<String> = conn.get(self.job_key(batch_id)).await.map_err(backend)?;
            match raw {
                Some(json) => serde_json::from_str(&json)
                    .map(Some)
                    .map_err(|e| StoreError::Corrupted(e.to_string())),
                None => Ok(None),
            }
        })
    }

    fn update_job<'a>(&'a self, job: &'a BatchJob) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            if let Some(existing) = self.load_job(job.batch_id).await? {
                if !existing.status.can_transition(job.status) {
                    return Err(StoreError::Corrupted(format!(
                        "illegal status transition {:?} -> {:?} for batch {}",
                        existing.status, job.status, job.batch_id
                    )));
                }
            }
            let mut conn = self.conn.clone();
            let json = serde_json::to_string(job).map_err(backend)?;
            conn.set::<_, _, ()>(self.job_key(job.batch_id), json)
                .await
                .map_err(backend)
        })
    }

    fn enqueue<'a>(&'a self, stream: JobStream, item: &'a QueueItem) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let json = serde_json::to_string(item).map_err(backend)?;
            conn.lpush::<_, _, ()>(self.queue_key(stream), json)
                .await
                .map_err(backend)
        })
    }

    fn dequeue<'a>(&'a self, stream: JobStream) -> StoreFuture<'a, Option<QueueItem>> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let raw: Option<String> = conn
                .rpop(self.queue_key(stream), None)
                .await
                .map_err(backend)?;
            match raw {
                Some(json) => serde_json::from_str(&json)
                    .map(Some)
                    .map_err(|e| StoreError::Corrupted(e.to_string())),
                None => Ok(None),
            }
        })
    }

    fn append_result<'a>(
        &'a self,
        batch_id: Uuid,
        row: &'a VerificationResult,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let json = serde_json::to_string(row).map_err(backend)?;
            conn.rpush::<_, _, ()>(self.results_key(batch_id), json)
                .await
                .map_err(backend)
        })
    }

    fn results<'a>(&'a self, batch_id: Uuid) -> StoreFuture<'a, Vec<VerificationResult>> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let rows: Vec<String> = conn
                .lrange(self.results_key(batch_id), 0, -1)
                .await
                .map_err(backend)?;
            rows.iter()
                .map(|json| {
                    serde_json::from_str(json).map_err(|e| StoreError::Corrupted(e.to_string()))
                })
                .collect()
        })
    }

    fn request_cancel<'a>(&'a self, batch_id: Uuid) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            conn.set::<_, _, ()>(self.cancel_key(batch_id), "1")
                .await
                .map_err(backend)
        })
    }

    fn cancel_requested<'a>(&'a self, batch_id: Uuid) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            conn.exists(self.cancel_key(batch_id)).await.map_err(backend)
        })
    }

    fn expire_terminal<'a>(&'a self, batch_id: Uuid, retention: Duration) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let secs = retention.as_secs().max(1) as i64;
            conn.expire::<_, ()>(self.job_key(batch_id), secs)
                .await
                .map_err(backend)?;
            conn.expire::<_, ()>(self.results_key(batch_id), secs)
                .await
                .map_err(backend)?;
            // A stale cancel flag must not outlive its job.
            conn.expire::<_, ()>(self.cancel_key(batch_id), secs)
                .await
                .map_err(backend)
        })
    }
}

#[derive(Default)]
struct MemoryInner {
    jobs: HashMap<Uuid, BatchJob>,
    queues: HashMap<JobStream, VecDeque<QueueItem>>,
    results: HashMap<Uuid, Vec<VerificationResult>>,
    cancels: HashSet<Uuid>,
    expiries: HashMap<Uuid, Instant>,
}

impl MemoryInner {
    fn purge_expired(&mut self) {
        let now = Instant::now();
        let expired: Vec<Uuid> = self
            .expiries
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            self.jobs.remove(&id);
            self.results.remove(&id);
            self.cancels.remove(&id);
            self.expiries.remove(&id);
        }
    }
}

/// In-process store for tests and single-node deployments.
#[derive(Default)]
pub struct MemoryJobStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl JobStore for MemoryJobStore {
    fn create_job<'a>(&'a self, job: &'a BatchJob) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut inner = self.inner.lock().expect("store lock poisoned");
            inner.jobs.insert(job.batch_id, job.clone());
            Ok(())
        })
    }

    fn load_job<'a>(&'a self, batch_id: Uuid) -> StoreFuture<'a, Option<BatchJob>> {
        Box::pin(async move {
            let mut inner = self.inner.lock().expect("store lock poisoned");
            inner.purge_expired();
            Ok(inner.jobs.get(&batch_id).cloned())
        })
    }

    fn update_job<'a>(&'a self, job: &'a BatchJob) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut inner = self.inner.lock().expect("store lock poisoned");
            if let Some(existing) = inner.jobs.get(&job.batch_id) {
                if !existing.status.can_transition(job.status) {
                    return Err(StoreError::Corrupted(format!(
                        "illegal status transition {:?} -> {:?} for batch {}",
                        existing.status, job.status, job.batch_id
                    )));
                }
            }
            inner.jobs.insert(job.batch_id, job.clone());
            Ok(())
        })
    }

    fn enqueue<'a>(&'a self, stream: JobStream, item: &'a QueueItem) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut inner = self.inner.lock().expect("store lock poisoned");
            inner.queues.entry(stream).or_default().push_back(item.clone());
            Ok(())
        })
    }

    fn dequeue<'a>(&'a self, stream: JobStream) -> StoreFuture<'a, Option<QueueItem>> {
        Box::pin(async move {
            let mut inner = self.inner.lock().expect("store lock poisoned");
            Ok(inner.queues.entry(stream).or_default().pop_front())
        })
    }

    fn append_result<'a>(
        &'a self,
        batch_id: Uuid,
        row: &'a VerificationResult,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut inner = self.inner.lock().expect("store lock poisoned");
            inner.results.entry(batch_id).or_default().push(row.clone());
            Ok(())
        })
    }

    fn results<'a>(&'a self, batch_id: Uuid) -> StoreFuture<'a, Vec<VerificationResult>> {
        Box::pin(async move {
            let inner = self.inner.lock().expect("store lock poisoned");
            Ok(inner.results.get(&batch_id).cloned().unwrap_or_default())
        })
    }

    fn request_cancel<'a>(&'a self, batch_id: Uuid) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut inner = self.inner.lock().expect("store lock poisoned");
            inner.cancels.insert(batch_id);
            Ok(())
        })
    }

    fn cancel_requested<'a>(&'a self, batch_id: Uuid) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let inner = self.inner.lock().expect("store lock poisoned");
            Ok(inner.cancels.contains(&batch_id))
        })
    }

    fn expire_terminal<'a>(&'a self, batch_id: Uuid, retention: Duration) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut inner = self.inner.lock().expect("store lock poisoned");
            inner.expiries.insert(batch_id, Instant::now() + retention);
            Ok(())
        })
    }
}
