//! Batch verification executor
//!
//! Durable work queues with two streams: `single` (one address per job) and
//! `bulk` (a list per job). Workers dequeue, fan out into the verifier
//! pipeline, keep the job counters flushed, observe cancellation at email
//! boundaries, and send a best-effort completion notification.

pub mod export;
pub mod store;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cache::{ttl, CacheStore};
use crate::model::{VerificationResult, VerifyOptions};
use crate::pipeline::VerifierPipeline;
use crate::notify::Notifier;
use crate::EngineError;

use export::ExportFormat;
use store::{BatchJob, BatchStatus, JobStore, JobStream, QueueItem, StoreError};

pub type CreditFuture<'a> = Pin<Box<dyn Future<Output = Option<u64>> + Send + 'a>>;

/// Remaining-credit lookup consulted synchronously at submission.
/// `None` means unmetered.
pub trait CreditCheck: Send + Sync {
    fn remaining<'a>(&'a self, owner: &'a str) -> CreditFuture<'a>;
}

/// No metering: every submission is accepted.
pub struct UnlimitedCredit;

impl CreditCheck for UnlimitedCredit {
    fn remaining<'a>(&'a self, _owner: &'a str) -> CreditFuture<'a> {
        Box::pin(async { None })
    }
}

/// Metering against the usage counters the executor maintains in the cache.
pub struct CachedCredit {
    cache: Arc<dyn CacheStore>,
    limit: u64,
}

impl CachedCredit {
    pub fn new(cache: Arc<dyn CacheStore>, limit: u64) -> Self {
        Self { cache, limit }
    }
}

impl CreditCheck for CachedCredit {
    fn remaining<'a>(&'a self, owner: &'a str) -> CreditFuture<'a> {
        Box::pin(async move {
            let used = self
                .cache
                .get(&format!("usage:{}", owner))
                .await
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(0);
            Some(self.limit.saturating_sub(used))
        })
    }
}

/// Tuning for the executor and its workers.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub single_concurrency: usize,
    pub bulk_concurrency: usize,
    /// Pause between emails, deferring to downstream rate governance.
    pub inter_email_delay: Duration,
    /// Flush counters to the job record every N emails.
    pub flush_every: u64,
    pub enqueue_attempts: u32,
    /// First retry backoff; doubles per attempt.
    pub enqueue_backoff: Duration,
    /// Retention of terminal jobs and their rows.
    pub retention: Duration,
    /// Options handed to every worker-side `verify`.
    pub verify_options: VerifyOptions,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            single_concurrency: 20,
            bulk_concurrency: 5,
            inter_email_delay: Duration::from_millis(50),
            flush_every: 50,
            enqueue_attempts: 3,
            enqueue_backoff: Duration::from_secs(5),
            retention: Duration::from_secs(7 * 24 * 3600),
            verify_options: VerifyOptions::default(),
        }
    }
}

/// Owns submission, the worker loops, and result export.
pub struct BatchExecutor {
    store: Arc<dyn JobStore>,
    pipeline: Arc<VerifierPipeline>,
    notifier: Arc<dyn Notifier>,
    credit: Arc<dyn CreditCheck>,
    cache: Arc<dyn CacheStore>,
    config: BatchConfig,
    shutdown: watch::Sender<bool>,
}

impl BatchExecutor {
    pub fn new(
        store: Arc<dyn JobStore>,
        pipeline: Arc<VerifierPipeline>,
        notifier: Arc<dyn Notifier>,
        credit: Arc<dyn CreditCheck>,
        cache: Arc<dyn CacheStore>,
        config: BatchConfig,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            store,
            pipeline,
            notifier,
            credit,
            cache,
            config,
            shutdown,
        }
    }

    /// Queue a single-address verification job.
    pub async fn submit_single(
        &self,
        owner: &str,
        email: &str,
        callback_url: Option<String>,
        notify_email: Option<String>,
    ) -> Result<(Uuid, Uuid), EngineError> {
        self.submit(owner, vec![email.to_string()], callback_url, notify_email, JobStream::Single)
            .await
    }

    /// Queue a bulk verification job. Returns `(batch_id, job_id)`.
    ///
    /// Submission is rejected synchronously when the owner's remaining
    /// credit does not cover the batch.
    pub async fn submit_bulk(
        &self,
        owner: &str,
        emails: Vec<String>,
        callback_url: Option<String>,
        notify_email: Option<String>,
    ) -> Result<(Uuid, Uuid), EngineError> {
        self.submit(owner, emails, callback_url, notify_email, JobStream::Bulk)
            .await
    }

    async fn submit(
        &self,
        owner: &str,
        emails: Vec<String>,
        callback_url: Option<String>,
        notify_email: Option<String>,
        stream: JobStream,
    ) -> Result<(Uuid, Uuid), EngineError> {
        if owner.is_empty() {
            return Err(EngineError::Input("owner must not be empty".to_string()));
        }
        if emails.is_empty() {
            return Err(EngineError::Input("no emails submitted".to_string()));
        }

        if let Some(remaining) = self.credit.remaining(owner).await {
            if remaining < emails.len() as u64 {
                debug!("Rejecting batch for {}: {} credits left, {} needed", owner, remaining, emails.len());
                return Err(EngineError::QuotaExhausted {
                    owner: owner.to_string(),
                });
            }
        }

        let job = BatchJob::new(owner, emails.len() as u64, callback_url, notify_email);
        self.store.create_job(&job).await.map_err(store_error)?;

        let item = QueueItem {
            job_id: job.job_id,
            batch_id: job.batch_id,
            emails,
            attempt: 1,
            enqueued_at: Utc::now(),
        };
        if let Err(e) = self.enqueue_with_retry(stream, &item).await {
            let mut failed = job.clone();
            failed.status = BatchStatus::Failed;
            failed.error = Some(format!("enqueue failed: {}", e));
            let _ = self.store.update_job(&failed).await;
            return Err(EngineError::Transient(format!("enqueue failed: {}", e)));
        }

        info!(
            "Submitted {} batch {} ({} emails) for {}",
            stream.as_str(),
            job.batch_id,
            job.total,
            owner
        );
        Ok((job.batch_id, job.job_id))
    }

    async fn enqueue_with_retry(
        &self,
        stream: JobStream,
        item: &QueueItem,
    ) -> Result<(), StoreError> {
        let mut backoff = self.config.enqueue_backoff;
        let mut attempt = 1;
        loop {
            match self.store.enqueue(stream, item).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < self.config.enqueue_attempts => {
                    warn!("Enqueue attempt {} failed ({}); retrying in {:?}", attempt, e, backoff);
                    sleep(backoff).await;
                    backoff *= 2;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Spawn the worker fleet. Handles finish when [`shutdown`](Self::shutdown)
    /// is called.
    pub fn spawn_workers(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        for _ in 0..self.config.single_concurrency {
            let executor = Arc::clone(self);
            handles.push(tokio::spawn(async move {
                executor.worker_loop(JobStream::Single).await;
            }));
        }
        for _ in 0..self.config.bulk_concurrency {
            let executor = Arc::clone(self);
            handles.push(tokio::spawn(async move {
                executor.worker_loop(JobStream::Bulk).await;
            }));
        }
        info!(
            "Spawned {} single and {} bulk workers",
            self.config.single_concurrency, self.config.bulk_concurrency
        );
        handles
    }

    /// Ask all workers to stop after their current item.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    async fn worker_loop(&self, stream: JobStream) {
        let mut shutdown_rx = self.shutdown.subscribe();
        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            match self.process_next(stream).await {
                Ok(true) => {}
                Ok(false) => {
                    tokio::select! {
                        _ = sleep(Duration::from_millis(500)) => {}
                        _ = shutdown_rx.changed() => break,
                    }
                }
                Err(e) => {
                    warn!("Worker error on {} stream: {}", stream.as_str(), e);
                    sleep(Duration::from_secs(1)).await;
                }
            }
        }
        debug!("Worker for {} stream stopped", stream.as_str());
    }

    /// Dequeue and process at most one item. Returns whether an item was
    /// processed.
    pub async fn process_next(&self, stream: JobStream) -> Result<bool, EngineError> {
        let Some(item) = self.store.dequeue(stream).await.map_err(store_error)? else {
            return Ok(false);
        };
        self.process_item(item).await?;
        Ok(true)
    }

    async fn process_item(&self, item: QueueItem) -> Result<(), EngineError> {
        let Some(mut job) = self.store.load_job(item.batch_id).await.map_err(store_error)? else {
            warn!("Dropping queue item for unknown batch {}", item.batch_id);
            return Ok(());
        };
        if job.status.is_terminal() {
            // At-least-once delivery: the batch already finished elsewhere.
            debug!("Skipping redelivered item for terminal batch {}", job.batch_id);
            return Ok(());
        }

        if job.status == BatchStatus::Queued {
            job.status = BatchStatus::Processing;
            job.started_at = Some(Utc::now());
            if let Err(e) = self.store.update_job(&job).await {
                return self.fail_job(&mut job, &e.to_string()).await;
            }
        }

        let total = item.emails.len();
        for (index, email) in item.emails.iter().enumerate() {
            // Cancellation is observed between emails, never mid-probe.
            if self
                .store
                .cancel_requested(job.batch_id)
                .await
                .map_err(store_error)?
            {
                info!("Batch {} cancelled after {} emails", job.batch_id, job.processed);
                return self.fail_job(&mut job, "cancelled").await;
            }

            let result = self.pipeline.verify(email, &self.config.verify_options).await;
            if result.is_valid {
                job.valid += 1;
            } else {
                job.invalid += 1;
            }
            job.processed += 1;
            job.tick();

            if let Err(e) = self.store.append_result(job.batch_id, &result).await {
                return self.fail_job(&mut job, &e.to_string()).await;
            }
            self.cache
                .incr(&format!("usage:{}", job.owner), ttl::USAGE_SNAPSHOT)
                .await;

            if job.processed % self.config.flush_every == 0 {
                if let Err(e) = self.store.update_job(&job).await {
                    return self.fail_job(&mut job, &e.to_string()).await;
                }
            }
            if index + 1 < total {
                sleep(self.config.inter_email_delay).await;
            }
        }

        job.status = BatchStatus::Completed;
        job.completed_at = Some(Utc::now());
        job.tick();
        self.store.update_job(&job).await.map_err(store_error)?;
        self.store
            .expire_terminal(job.batch_id, self.config.retention)
            .await
            .map_err(store_error)?;
        info!(
            "Batch {} completed: {}/{} valid",
            job.batch_id, job.valid, job.total
        );

        if let Some(notify_email) = &job.notify_email {
            if let Err(e) = self
                .notifier
                .send_batch_complete(notify_email, &job.batch_id.to_string(), job.processed)
                .await
            {
                warn!("Completion notification for {} failed: {}", job.batch_id, e);
            }
        }
        Ok(())
    }

    async fn fail_job(&self, job: &mut BatchJob, reason: &str) -> Result<(), EngineError> {
        error!("Batch {} failed: {}", job.batch_id, reason);
        job.status = BatchStatus::Failed;
        job.completed_at = Some(Utc::now());
        job.error = Some(reason.to_string());
        self.store.update_job(job).await.map_err(store_error)?;
        self.store
            .expire_terminal(job.batch_id, self.config.retention)
            .await
            .map_err(store_error)?;
        Ok(())
    }

    /// Fetch a batch record, enforcing ownership.
    pub async fn get_batch(&self, batch_id: Uuid, owner: &str) -> Result<BatchJob, EngineError> {
        let job = self
            .store
            .load_job(batch_id)
            .await
            .map_err(store_error)?
            .filter(|job| job.owner == owner);
        job.ok_or_else(|| EngineError::Input(format!("unknown batch {}", batch_id)))
    }

    /// Render the per-email result rows of a batch.
    pub async fn get_batch_results(
        &self,
        batch_id: Uuid,
        owner: &str,
        format: ExportFormat,
    ) -> Result<String, EngineError> {
        self.get_batch(batch_id, owner).await?;
        let rows: Vec<VerificationResult> =
            self.store.results(batch_id).await.map_err(store_error)?;
        Ok(export::render(&rows, format))
    }

    /// Administrative cancellation; workers observe it at email boundaries.
    pub async fn cancel(&self, batch_id: Uuid, owner: &str) -> Result<(), EngineError> {
        self.get_batch(batch_id, owner).await?;
        self.store
            .request_cancel(batch_id)
            .await
            .map_err(store_error)
    }
}

fn store_error(e: StoreError) -> EngineError {
    match e {
        StoreError::Backend(msg) => EngineError::Transient(msg),
        StoreError::Corrupted(msg) => EngineError::fatal(msg),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::dns::DnsResolver;
    use crate::governor::{DomainLimit, RateGovernor, RateLimits};
    use crate::notify::NoopNotifier;
    use crate::policy::DomainPolicy;
    use crate::smtp::{ProbeConfig, SmtpProbe};
    use pretty_assertions::assert_eq;
    use store::MemoryJobStore;

    fn offline_executor(credit: Arc<dyn CreditCheck>) -> Arc<BatchExecutor> {
        let cache: Arc<dyn CacheStore> = Arc::new(MemoryCache::new());
        let dns = Arc::new(DnsResolver::new(cache.clone()));
        let policy = Arc::new(DomainPolicy::new().unwrap());
        let governor = RateGovernor::new(
            cache.clone(),
            RateLimits::new(DomainLimit { per_minute: 1_000, per_hour: 10_000 }),
            vec![],
        );
        let pipeline = Arc::new(VerifierPipeline::new(
            cache.clone(),
            dns,
            policy,
            governor,
            SmtpProbe::new(ProbeConfig::default()),
        ));
        let config = BatchConfig {
            inter_email_delay: Duration::from_millis(1),
            verify_options: VerifyOptions {
                check_mx: false,
                check_smtp: false,
                check_catch_all: false,
                check_spam_trap: false,
                timeout_ms: 2_000,
                ..VerifyOptions::default()
            },
            ..BatchConfig::default()
        };
        Arc::new(BatchExecutor::new(
            Arc::new(MemoryJobStore::new()),
            pipeline,
            Arc::new(NoopNotifier),
            credit,
            cache,
            config,
        ))
    }

    /// Three inputs that fail before any network work.
    fn malformed_batch() -> Vec<String> {
        vec![
            "not-an-email".to_string(),
            "bad@@example.com".to_string(),
            "trail.@example.com".to_string(),
        ]
    }

    #[tokio::test]
    async fn test_bulk_batch_lifecycle() {
        let executor = offline_executor(Arc::new(UnlimitedCredit));
        let (batch_id, job_id) = executor
            .submit_bulk("acme", malformed_batch(), None, None)
            .await
            .unwrap();
        assert_ne!(batch_id, job_id);

        let queued = executor.get_batch(batch_id, "acme").await.unwrap();
        assert_eq!(queued.status, BatchStatus::Queued);
        assert_eq!(queued.total, 3);

        assert!(executor.process_next(JobStream::Bulk).await.unwrap());

        let done = executor.get_batch(batch_id, "acme").await.unwrap();
        assert_eq!(done.status, BatchStatus::Completed);
        assert_eq!(done.processed, 3);
        assert_eq!(done.valid, 0);
        assert_eq!(done.invalid, 3);
        assert_eq!(done.valid + done.invalid, done.processed);
        assert!(done.processed <= done.total);
        assert_eq!(done.progress, 100);
        assert!(done.started_at.is_some());
        assert!(done.completed_at.is_some());

        // Nothing left on the queue.
        assert!(!executor.process_next(JobStream::Bulk).await.unwrap());
    }

    #[tokio::test]
    async fn test_csv_export_row_count() {
        let executor = offline_executor(Arc::new(UnlimitedCredit));
        let (batch_id, _) = executor
            .submit_bulk("acme", malformed_batch(), None, None)
            .await
            .unwrap();
        executor.process_next(JobStream::Bulk).await.unwrap();

        let csv = executor
            .get_batch_results(batch_id, "acme", ExportFormat::Csv)
            .await
            .unwrap();
        assert_eq!(csv.trim_end().lines().count(), 4); // header + 3 rows

        let json = executor
            .get_batch_results(batch_id, "acme", ExportFormat::Json)
            .await
            .unwrap();
        let rows: Vec<VerificationResult> = serde_json::from_str(&json).unwrap();
        assert_eq!(rows.len(), 3);
    }

    #[tokio::test]
    async fn test_cancellation_at_email_boundary() {
        let executor = offline_executor(Arc::new(UnlimitedCredit));
        let (batch_id, _) = executor
            .submit_bulk("acme", malformed_batch(), None, None)
            .await
            .unwrap();
        executor.cancel(batch_id, "acme").await.unwrap();
        executor.process_next(JobStream::Bulk).await.unwrap();

        let job = executor.get_batch(batch_id, "acme").await.unwrap();
        assert_eq!(job.status, BatchStatus::Failed);
        assert_eq!(job.error, Some("cancelled".to_string()));
        assert_eq!(job.processed, 0);
    }

    struct FixedCredit(u64);

    impl CreditCheck for FixedCredit {
        fn remaining<'a>(&'a self, _owner: &'a str) -> CreditFuture<'a> {
            let left = self.0;
            Box::pin(async move { Some(left) })
        }
    }

    #[tokio::test]
    async fn test_insufficient_credit_rejected_synchronously() {
        let executor = offline_executor(Arc::new(FixedCredit(2)));
        let denied = executor
            .submit_bulk("acme", malformed_batch(), None, None)
            .await;
        assert!(matches!(denied, Err(EngineError::QuotaExhausted { .. })));
    }

    #[tokio::test]
    async fn test_owner_isolation() {
        let executor = offline_executor(Arc::new(UnlimitedCredit));
        let (batch_id, _) = executor
            .submit_bulk("acme", malformed_batch(), None, None)
            .await
            .unwrap();
        assert!(executor.get_batch(batch_id, "intruder").await.is_err());
        assert!(executor
            .get_batch_results(batch_id, "intruder", ExportFormat::Csv)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_empty_submission_rejected() {
        let executor = offline_executor(Arc::new(UnlimitedCredit));
        let denied = executor.submit_bulk("acme", Vec::new(), None, None).await;
        assert!(matches!(denied, Err(EngineError::Input(_))));
    }

    #[tokio::test]
    async fn test_single_stream_submission() {
        let executor = offline_executor(Arc::new(UnlimitedCredit));
        let (batch_id, _) = executor
            .submit_single("acme", "not-an-email", None, None)
            .await
            .unwrap();
        assert!(executor.process_next(JobStream::Single).await.unwrap());
        let job = executor.get_batch(batch_id, "acme").await.unwrap();
        assert_eq!(job.status, BatchStatus::Completed);
        assert_eq!(job.total, 1);
        assert_eq!(job.invalid, 1);
    }

    #[tokio::test]
    async fn test_usage_counter_accrues() {
        let executor = offline_executor(Arc::new(UnlimitedCredit));
        executor
            .submit_bulk("acme", malformed_batch(), None, None)
            .await
            .unwrap();
        executor.process_next(JobStream::Bulk).await.unwrap();
        assert_eq!(executor.cache.get("usage:acme").await, Some("3".to_string()));
    }

    #[tokio::test]
    async fn test_workers_drain_queue_and_shut_down() {
        let executor = offline_executor(Arc::new(UnlimitedCredit));
        let (batch_id, _) = executor
            .submit_bulk("acme", malformed_batch(), None, None)
            .await
            .unwrap();
        let handles = executor.spawn_workers();
        // Give the fleet time to pick the job up.
        for _ in 0..100 {
            let job = executor.get_batch(batch_id, "acme").await.unwrap();
            if job.status == BatchStatus::Completed {
                break;
            }
            sleep(Duration::from_millis(20)).await;
        }
        let job = executor.get_batch(batch_id, "acme").await.unwrap();
        assert_eq!(job.status, BatchStatus::Completed);

        executor.shutdown();
        for handle in handles {
            handle.await.unwrap();
        }
    }
}
