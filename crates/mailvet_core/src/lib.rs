//! # mailvet_core
//!
//! Email verification engine: decides whether a message sent to an address
//! would be delivered, and extracts secondary intelligence about the
//! address and its domain.
//!
//! ## Features
//!
//! - **Verification pipeline** combining syntax, DNS, disposable-domain,
//!   SMTP mailbox, catch-all and spam-trap checks into one result
//! - **Rate-governed probing** with per-domain windowed budgets and a
//!   rotating source-IP pool
//! - **Enrichment** deriving person name, company name and provider
//!   classification from verified addresses
//! - **Batch execution** over durable FIFO queues with resumable progress,
//!   cancellation and completion notification
//! - **Fail-open caching**: the engine stays correct (if slower) with the
//!   cache backend down
//!
//! ## Example
//!
//! ```rust,no_run
//! use mailvet_core::{Engine, EngineConfig, VerifyOptions};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = Engine::builder(EngineConfig::default()).build()?;
//!     let result = engine.verify("user@example.com", &VerifyOptions::default()).await;
//!     println!("valid: {}", result.is_valid);
//!     Ok(())
//! }
//! ```
//!
//! Verdicts are probabilistic: servers lie (catch-all, greylisting,
//! tarpits), so a positive result never guarantees delivery.

pub mod batch;
pub mod cache;
pub mod config;
pub mod deliverability;
pub mod dns;
pub mod enrich;
pub mod governor;
pub mod model;
pub mod notify;
pub mod pipeline;
pub mod policy;
pub mod smtp;

use std::sync::Arc;

use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use batch::store::{BatchJob, JobStore, MemoryJobStore, RedisJobStore};
use batch::{BatchConfig, BatchExecutor, CreditCheck, UnlimitedCredit};
use cache::{CacheStore, MemoryCache, RedisCache};
use dns::DnsResolver;
use enrich::Enricher;
use governor::{RateGovernor, RateLimits};
use pipeline::VerifierPipeline;
use policy::DomainPolicy;
use smtp::{ProbeConfig, SmtpProbe};

pub use batch::export::ExportFormat;
pub use batch::store::{BatchStatus, JobStream};
pub use config::{init_tracing, EngineConfig};
pub use model::{
    DomainCategory, Enrichment, MailboxCheck, MxRecord, PossibleName, VerificationDetails,
    VerificationResult, VerifyOptions,
};
pub use notify::{NoopNotifier, Notifier, SmtpNotifier};
pub use pipeline::PipelineStats;

/// Closed set of failure tags carried in [`VerificationResult::errors`].
pub mod tags {
    pub const INVALID_FORMAT: &str = "Invalid email format";
    pub const NO_MX_RECORDS: &str = "No MX records found for domain";
    pub const DNS_FAILURE: &str = "DNS lookup failed";
    pub const ADDRESS_REJECTED: &str = "address rejected";
    pub const TIMEOUT: &str = "timeout";
    pub const RATE_LIMITED: &str = "rate limited";
    pub const SMTP_CONNECTION_FAILED: &str = "connection failed";
    pub const SMTP_CONNECTION_CLOSED: &str = "connection closed";
    pub const SMTP_RESPONSE_OVERFLOW: &str = "response too large";
    pub const SMTP_UNEXPECTED_REPLY: &str = "unexpected reply";
    pub const SMTP_DEFERRED: &str = "temporarily deferred";
}

/// Engine-level failures, grouped by how callers should react.
///
/// `Input` maps to a 400-class signal, the policy denials to 429/403,
/// `Transient`/`Permanent` are annotations that rarely escape the pipeline,
/// and `Fatal` is a 500-class signal carrying a correlation id.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid input: {0}")]
    Input(String),
    #[error("per-minute rate limit exceeded for {domain}")]
    RateLimitMinute { domain: String },
    #[error("per-hour rate limit exceeded for {domain}")]
    RateLimitHour { domain: String },
    #[error("outbound SMTP to {domain} is blocked")]
    DomainBlocked { domain: String },
    #[error("verification quota exhausted for {owner}")]
    QuotaExhausted { owner: String },
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("permanent failure: {0}")]
    Permanent(String),
    #[error("internal error [{correlation_id}]: {message}")]
    Fatal { correlation_id: Uuid, message: String },
}

impl EngineError {
    /// Wrap an unrecoverable internal failure with a fresh correlation id.
    pub fn fatal(message: impl Into<String>) -> Self {
        EngineError::Fatal {
            correlation_id: Uuid::new_v4(),
            message: message.into(),
        }
    }

    /// Whether this failure is a policy decision rather than a fault.
    pub fn is_policy_denial(&self) -> bool {
        matches!(
            self,
            EngineError::RateLimitMinute { .. }
                | EngineError::RateLimitHour { .. }
                | EngineError::DomainBlocked { .. }
                | EngineError::QuotaExhausted { .. }
        )
    }
}

/// The assembled engine: verification, enrichment and batch execution over
/// collaborator-provided stores.
///
/// The engine owns no process-wide state; every collaborator is injected at
/// construction and shared by reference from there on.
pub struct Engine {
    pipeline: Arc<VerifierPipeline>,
    enricher: Enricher,
    executor: Arc<BatchExecutor>,
}

impl Engine {
    /// Start building an engine over the given configuration.
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder {
            config,
            cache: None,
            jobs: None,
            notifier: None,
            credit: None,
            probe_config: None,
            rate_limits: None,
        }
    }

    /// Build an engine wired to the Redis backend named in the
    /// configuration. The cache degrades to misses if unreachable; an
    /// unreachable job store is an error.
    pub async fn connect(config: EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;
        let cache = Arc::new(RedisCache::connect(&config.redis_url).await);
        let jobs = RedisJobStore::connect(&config.redis_url, &config.queue_prefix)
            .await
            .map_err(|e| EngineError::Transient(e.to_string()))?;
        Engine::builder(config)
            .with_cache(cache)
            .with_job_store(Arc::new(jobs))
            .build()
    }

    /// Verify one address. Total: always produces a result.
    pub async fn verify(&self, email: &str, options: &VerifyOptions) -> VerificationResult {
        self.pipeline.verify(email, options).await
    }

    /// Verify and, when valid, enrich one address.
    pub async fn enrich(&self, email: &str, options: &VerifyOptions) -> VerificationResult {
        self.enricher.enrich(email, options).await
    }

    /// Queue a bulk verification job; returns `(batch_id, job_id)`.
    pub async fn submit_bulk(
        &self,
        owner: &str,
        emails: Vec<String>,
        callback_url: Option<String>,
        notify_email: Option<String>,
    ) -> Result<(Uuid, Uuid), EngineError> {
        self.executor
            .submit_bulk(owner, emails, callback_url, notify_email)
            .await
    }

    /// Fetch a batch record, enforcing ownership.
    pub async fn get_batch(&self, batch_id: Uuid, owner: &str) -> Result<BatchJob, EngineError> {
        self.executor.get_batch(batch_id, owner).await
    }

    /// Render a batch's per-email results as JSON or CSV.
    pub async fn get_batch_results(
        &self,
        batch_id: Uuid,
        owner: &str,
        format: ExportFormat,
    ) -> Result<String, EngineError> {
        self.executor.get_batch_results(batch_id, owner, format).await
    }

    /// Spawn the batch worker fleet.
    pub fn spawn_workers(&self) -> Vec<tokio::task::JoinHandle<()>> {
        self.executor.spawn_workers()
    }

    /// Ask the worker fleet to stop after current items.
    pub fn shutdown_workers(&self) {
        self.executor.shutdown()
    }

    /// Direct access to the batch executor, for edges that need
    /// cancellation or the single stream.
    pub fn executor(&self) -> &Arc<BatchExecutor> {
        &self.executor
    }

    /// Snapshot of the engine's static wiring.
    pub fn stats(&self) -> PipelineStats {
        self.pipeline.stats()
    }
}

/// Builder wiring collaborators into an [`Engine`].
///
/// Anything not provided falls back to in-memory defaults, which is the
/// right shape for tests and for degraded single-node operation.
pub struct EngineBuilder {
    config: EngineConfig,
    cache: Option<Arc<dyn CacheStore>>,
    jobs: Option<Arc<dyn JobStore>>,
    notifier: Option<Arc<dyn Notifier>>,
    credit: Option<Arc<dyn CreditCheck>>,
    probe_config: Option<ProbeConfig>,
    rate_limits: Option<RateLimits>,
}

impl EngineBuilder {
    pub fn with_cache(mut self, cache: Arc<dyn CacheStore>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_job_store(mut self, jobs: Arc<dyn JobStore>) -> Self {
        self.jobs = Some(jobs);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn with_credit_check(mut self, credit: Arc<dyn CreditCheck>) -> Self {
        self.credit = Some(credit);
        self
    }

    /// Override the probe identity and ports (the `MAIL FROM` envelope is
    /// configured here, out of band of the main configuration document).
    pub fn with_probe_config(mut self, probe_config: ProbeConfig) -> Self {
        self.probe_config = Some(probe_config);
        self
    }

    pub fn with_rate_limits(mut self, rate_limits: RateLimits) -> Self {
        self.rate_limits = Some(rate_limits);
        self
    }

    pub fn build(self) -> Result<Engine, EngineError> {
        self.config.validate()?;

        let cache = self
            .cache
            .unwrap_or_else(|| Arc::new(MemoryCache::new()) as Arc<dyn CacheStore>);
        let jobs = self
            .jobs
            .unwrap_or_else(|| Arc::new(MemoryJobStore::new()) as Arc<dyn JobStore>);
        let notifier = self
            .notifier
            .unwrap_or_else(|| Arc::new(NoopNotifier) as Arc<dyn Notifier>);
        let credit = self
            .credit
            .unwrap_or_else(|| Arc::new(UnlimitedCredit) as Arc<dyn CreditCheck>);

        let policy =
            Arc::new(DomainPolicy::new().map_err(|e| EngineError::fatal(e.to_string()))?);
        let dns = Arc::new(DnsResolver::new(cache.clone()));
        let governor = RateGovernor::new(
            cache.clone(),
            self.rate_limits.unwrap_or_default(),
            self.config.parsed_ip_pool(),
        );
        let probe = SmtpProbe::new(self.probe_config.unwrap_or_default());

        let pipeline = Arc::new(VerifierPipeline::new(
            cache.clone(),
            dns,
            policy.clone(),
            governor,
            probe,
        ));

        let batch_config = BatchConfig {
            single_concurrency: self.config.verification_concurrency,
            bulk_concurrency: self.config.bulk_concurrency,
            ..BatchConfig::default()
        };
        let executor = Arc::new(BatchExecutor::new(
            jobs,
            pipeline.clone(),
            notifier,
            credit,
            cache,
            batch_config,
        ));
        let enricher = Enricher::new(pipeline.clone(), policy);

        let stats = pipeline.stats();
        info!(
            "Engine assembled: {} disposable domains, {} free providers, {} pool IPs",
            stats.disposable_domains, stats.free_providers, stats.ip_pool_size
        );

        Ok(Engine {
            pipeline,
            enricher,
            executor,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn offline_options() -> VerifyOptions {
        VerifyOptions {
            check_mx: false,
            check_smtp: false,
            check_catch_all: false,
            check_spam_trap: false,
            timeout_ms: 2_000,
            ..VerifyOptions::default()
        }
    }

    #[tokio::test]
    async fn test_engine_builds_with_defaults() {
        let engine = Engine::builder(EngineConfig::default()).build().unwrap();
        let stats = engine.stats();
        assert!(stats.disposable_domains > 0);
        assert!(stats.free_providers > 0);
        assert_eq!(stats.ip_pool_size, 0);
    }

    #[tokio::test]
    async fn test_engine_verify_is_total() {
        let engine = Engine::builder(EngineConfig::default()).build().unwrap();
        let result = engine.verify("not-an-email", &offline_options()).await;
        assert!(!result.is_valid);
        assert_eq!(result.errors, vec![tags::INVALID_FORMAT.to_string()]);
    }

    #[tokio::test]
    async fn test_engine_rejects_invalid_config() {
        let config = EngineConfig {
            ip_pool: vec!["nope".to_string()],
            ..EngineConfig::default()
        };
        assert!(Engine::builder(config).build().is_err());
    }

    #[tokio::test]
    async fn test_engine_batch_round_trip() {
        let engine = Engine::builder(EngineConfig::default()).build().unwrap();
        let (batch_id, _) = engine
            .submit_bulk("owner", vec!["not-an-email".to_string()], None, None)
            .await
            .unwrap();
        engine
            .executor()
            .process_next(JobStream::Bulk)
            .await
            .unwrap();
        let job = engine.get_batch(batch_id, "owner").await.unwrap();
        assert_eq!(job.status, BatchStatus::Completed);
        assert_eq!(job.invalid, 1);

        let csv = engine
            .get_batch_results(batch_id, "owner", ExportFormat::Csv)
            .await
            .unwrap();
        assert_eq!(csv.trim_end().lines().count(), 2);
    }

    #[test]
    fn test_policy_denial_classification() {
        assert!(EngineError::RateLimitMinute { domain: "x.com".into() }.is_policy_denial());
        assert!(EngineError::QuotaExhausted { owner: "o".into() }.is_policy_denial());
        assert!(!EngineError::Input("bad".into()).is_policy_denial());
        assert!(!EngineError::fatal("boom").is_policy_denial());
    }
}
