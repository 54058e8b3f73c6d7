//! Verification pipeline
//!
//! Orchestrates syntax, DNS, policy, SMTP, catch-all and spam-trap checks
//! into one [`VerificationResult`]. `verify` is total: every failure inside
//! the pipeline is folded into the result's error tags, and the overall
//! deadline produces a partial result rather than an error.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::timeout;
use tracing::{debug, instrument, warn};

use crate::cache::{ttl, CacheStore};
use crate::deliverability::{dmarc_and_dkim, spf_present};
use crate::dns::{normalize_domain, DnsError, DnsResolver};
use crate::governor::RateGovernor;
use crate::model::{MailboxCheck, MxRecord, VerificationResult, VerifyOptions};
use crate::policy::DomainPolicy;
use crate::smtp::{random_local_part, ProbeOutcome, SmtpProbe};
use crate::tags;
use crate::EngineError;

/// Budget for the TXT intelligence block (SPF/DMARC/DKIM presence and the
/// spam-trap TXT heuristic). Deliberately small: these lookups refine the
/// result but must not dominate the deadline.
const INTEL_BUDGET: Duration = Duration::from_secs(4);

/// Verification orchestrator. Request-local state only; all cross-request
/// coordination goes through the cache store.
pub struct VerifierPipeline {
    cache: Arc<dyn CacheStore>,
    dns: Arc<DnsResolver>,
    policy: Arc<DomainPolicy>,
    governor: RateGovernor,
    probe: SmtpProbe,
}

enum MxOutcome {
    Found(Vec<MxRecord>),
    Failed(DnsError),
    DeadlineHit,
    Skipped,
}

impl VerifierPipeline {
    pub fn new(
        cache: Arc<dyn CacheStore>,
        dns: Arc<DnsResolver>,
        policy: Arc<DomainPolicy>,
        governor: RateGovernor,
        probe: SmtpProbe,
    ) -> Self {
        Self {
            cache,
            dns,
            policy,
            governor,
            probe,
        }
    }

    /// Verify one address. Never fails; the result carries whatever could
    /// be gathered before the deadline.
    #[instrument(skip(self, options), fields(email = %email))]
    pub async fn verify(&self, email: &str, options: &VerifyOptions) -> VerificationResult {
        let started = Instant::now();
        let deadline = started + Duration::from_millis(options.timeout_ms);
        let email = email.trim().to_lowercase();

        // Step 1: split on the last '@'.
        let Some((local, raw_domain)) = email.rsplit_once('@') else {
            debug!("No '@' in input");
            let mut result = VerificationResult::new(&email, "");
            result.push_error(tags::INVALID_FORMAT);
            return self.finish(result, started, false).await;
        };

        // Step 2: RFC-lite syntax over the ASCII-compatible domain.
        let domain = match normalize_domain(raw_domain) {
            Ok(ascii) if options.check_syntax => {
                if syntax_valid(local, &ascii) {
                    ascii
                } else {
                    let mut result = VerificationResult::new(&email, &ascii);
                    result.push_error(tags::INVALID_FORMAT);
                    return self.finish(result, started, options.cache_results).await;
                }
            }
            Ok(ascii) => ascii,
            Err(_) => {
                let mut result = VerificationResult::new(&email, raw_domain);
                result.push_error(tags::INVALID_FORMAT);
                return self.finish(result, started, options.cache_results).await;
            }
        };

        let mut result = VerificationResult::new(&email, &domain);
        result.format_valid = true;

        // Step 3: verification cache.
        let cache_key = format!("verify:{}", email);
        if options.use_cache {
            if let Some(cached) = self.cache.get(&cache_key).await {
                match serde_json::from_str::<VerificationResult>(&cached) {
                    Ok(mut hit) => {
                        debug!("Verification cache hit");
                        hit.from_cache = true;
                        return hit;
                    }
                    Err(e) => warn!("Discarding undecodable cached result: {}", e),
                }
            }
        }

        // Step 4: independent lookups, joined under the deadline.
        let (is_disposable, is_role, suggestion, mx_outcome) = tokio::join!(
            async { options.check_disposable && self.policy.is_disposable(&domain) },
            async { options.check_role_account && self.policy.is_role_account(local) },
            async {
                if options.check_typos {
                    self.policy.suggest(&email)
                } else {
                    None
                }
            },
            async {
                if !options.check_mx {
                    return MxOutcome::Skipped;
                }
                match timeout(remaining(deadline), self.dns.mx(&domain, options.alt_dns)).await {
                    Ok(Ok(records)) => MxOutcome::Found(records),
                    Ok(Err(e)) => MxOutcome::Failed(e),
                    Err(_) => MxOutcome::DeadlineHit,
                }
            },
        );

        result.is_disposable = is_disposable;
        result.is_role_account = is_role;
        result.suggestion = suggestion;

        match mx_outcome {
            MxOutcome::Found(records) => {
                result.has_mx = true;
                result.details.mx_records = records;
            }
            MxOutcome::Failed(DnsError::DomainNotFound) | MxOutcome::Failed(DnsError::NoRecords) => {
                result.push_error(tags::NO_MX_RECORDS);
            }
            MxOutcome::Failed(e) => {
                debug!("MX lookup failed: {}", e);
                result.push_error(tags::DNS_FAILURE);
            }
            MxOutcome::DeadlineHit => {
                result.push_error(tags::TIMEOUT);
            }
            MxOutcome::Skipped => {}
        }

        // Steps 5-8 only make sense with a mail exchange to talk to.
        if result.has_mx {
            let probe_ip = self.smtp_stage(&mut result, &domain, deadline, options).await;
            self.catch_all_stage(&mut result, &domain, probe_ip, deadline, options)
                .await;
            self.intelligence_stage(&mut result, local, &domain, deadline, options)
                .await;
        }

        // Step 9: aggregate and cache.
        result.details.reputation = reputation_score(&result);
        self.finish(result, started, options.cache_results).await
    }

    /// Governor gate plus the mailbox probe. Returns the pool IP used, for
    /// reuse by the catch-all stage.
    async fn smtp_stage(
        &self,
        result: &mut VerificationResult,
        domain: &str,
        deadline: Instant,
        options: &VerifyOptions,
    ) -> Option<IpAddr> {
        if !options.check_smtp {
            return None;
        }
        if remaining(deadline).is_zero() {
            result.push_error(tags::TIMEOUT);
            return None;
        }

        if self.governor.is_blocked(domain).await {
            debug!("Domain {} is quarantined; skipping SMTP", domain);
            result.smtp_blocked_by_policy = true;
            result.details.mailbox_check = MailboxCheck::BlockedByPolicy;
            return None;
        }

        let delay = self.governor.delay(domain).await;
        if !delay.is_zero() {
            tokio::time::sleep(delay.min(remaining(deadline))).await;
        }

        let ip = match self.governor.acquire(domain).await {
            Ok(ip) => ip,
            Err(EngineError::RateLimitMinute { .. }) | Err(EngineError::RateLimitHour { .. }) => {
                result.smtp_blocked_by_policy = true;
                result.details.mailbox_check = MailboxCheck::BlockedByPolicy;
                result.push_error(tags::RATE_LIMITED);
                return None;
            }
            Err(e) => {
                warn!("Governor failure treated as policy block: {}", e);
                result.smtp_blocked_by_policy = true;
                result.details.mailbox_check = MailboxCheck::BlockedByPolicy;
                return None;
            }
        };

        let exchange = result.details.mx_records[0].exchange.clone();
        let outcome = match timeout(
            remaining(deadline),
            self.probe.probe(&exchange, &result.email, Some(ip)),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => ProbeOutcome::Inconclusive(tags::TIMEOUT),
        };

        match outcome {
            ProbeOutcome::Accepted => {
                result.smtp_ok = true;
                result.details.mailbox_check = MailboxCheck::Accepted;
                self.governor.report_success(domain).await;
            }
            ProbeOutcome::Rejected => {
                result.push_error(tags::ADDRESS_REJECTED);
                result.details.mailbox_check = MailboxCheck::Rejected;
                self.governor.report_failure(domain, tags::ADDRESS_REJECTED).await;
            }
            ProbeOutcome::Inconclusive(tag) => {
                result.push_error(tag);
                result.details.mailbox_check = MailboxCheck::Inconclusive;
                self.governor.report_failure(domain, tag).await;
            }
        }
        Some(ip)
    }

    /// Probe a random local part to detect catch-all configurations.
    async fn catch_all_stage(
        &self,
        result: &mut VerificationResult,
        domain: &str,
        probe_ip: Option<IpAddr>,
        deadline: Instant,
        options: &VerifyOptions,
    ) {
        if !options.check_catch_all
            || !result.smtp_ok
            || result.is_disposable
            || remaining(deadline).is_zero()
        {
            return;
        }
        // The extra connection consumes governor budget like any other.
        let ip = match self.governor.acquire(domain).await {
            Ok(ip) => ip,
            Err(_) => probe_ip.unwrap_or(crate::governor::UNBOUND_IP),
        };

        let rcpt = format!("{}@{}", random_local_part(), domain);
        let exchange = &result.details.mx_records[0].exchange;
        if let Ok(ProbeOutcome::Accepted) =
            timeout(remaining(deadline), self.probe.probe(exchange, &rcpt, Some(ip))).await
        {
            debug!("Random recipient accepted; {} looks catch-all", domain);
            result.is_catch_all = true;
        }
    }

    /// TXT-derived signals: SPF/DMARC/DKIM presence and the spam-trap
    /// heuristics. All failures here are silent; these are refinements.
    async fn intelligence_stage(
        &self,
        result: &mut VerificationResult,
        local: &str,
        domain: &str,
        deadline: Instant,
        options: &VerifyOptions,
    ) {
        let budget = remaining(deadline).min(INTEL_BUDGET);
        if budget.is_zero() {
            return;
        }

        let mut txt_matches_trap = false;
        let _ = timeout(budget, async {
            if let Ok(records) = self.dns.txt(domain).await {
                result.details.has_spf = spf_present(&records);
                txt_matches_trap = records.iter().flatten().any(|s| {
                    let lower = s.to_lowercase();
                    lower.contains("spam") || lower.contains("trap") || lower.contains("honeypot")
                });
            }
            let (has_dmarc, has_dkim) =
                dmarc_and_dkim(&self.dns, domain, Duration::from_secs(2)).await;
            result.details.has_dmarc = has_dmarc;
            result.details.has_dkim = has_dkim;
        })
        .await;

        if options.check_spam_trap {
            result.is_spam_trap = looks_like_trap_local(local) || txt_matches_trap;
        }
    }

    /// Stamp the timing, derive verdicts, and write through the cache.
    async fn finish(
        &self,
        mut result: VerificationResult,
        started: Instant,
        cache_results: bool,
    ) -> VerificationResult {
        result.finalize();
        result.processing_ms = started.elapsed().as_millis() as u64;

        if cache_results && !result.email.is_empty() {
            let ttl = if result.is_valid {
                ttl::VERIFY_POSITIVE
            } else {
                ttl::VERIFY_NEGATIVE
            };
            if let Ok(json) = serde_json::to_string(&result) {
                let key = format!("verify:{}", result.email);
                self.cache.set(&key, &json, ttl).await;
            }
        }
        result
    }

    pub fn policy(&self) -> &Arc<DomainPolicy> {
        &self.policy
    }

    /// Snapshot of the embedded tables, for startup logs and health output.
    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            disposable_domains: self.policy.disposable_count(),
            free_providers: self.policy.free_provider_count(),
            ip_pool_size: self.governor.pool_size(),
        }
    }
}

/// Static facts about a pipeline's wiring.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PipelineStats {
    pub disposable_domains: usize,
    pub free_providers: usize,
    pub ip_pool_size: usize,
}

fn remaining(deadline: Instant) -> Duration {
    deadline.saturating_duration_since(Instant::now())
}

/// RFC-lite syntax: bounded local part without doubled dots, hyphen-safe
/// labels, and a real TLD.
fn syntax_valid(local: &str, domain: &str) -> bool {
    if local.is_empty() || local.len() > 64 {
        return false;
    }
    if local.contains("..") || local.starts_with('.') || local.ends_with('.') {
        return false;
    }
    if !local
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "!#$%&'*+-/=?^_`{|}~.".contains(c))
    {
        return false;
    }

    let labels: Vec<&str> = domain.split('.').collect();
    if labels.len() < 2 {
        return false;
    }
    for label in &labels {
        if label.is_empty() || label.len() > 63 {
            return false;
        }
        if label.starts_with('-') || label.ends_with('-') {
            return false;
        }
        if !label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return false;
        }
    }
    let tld = labels[labels.len() - 1];
    tld.len() >= 2 && tld.chars().all(|c| c.is_ascii_alphabetic())
}

/// Vowel-free machine-generated local parts read as seeded trap addresses.
fn looks_like_trap_local(local: &str) -> bool {
    local.len() >= 8
        && local
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        && !local.chars().any(|c| matches!(c, 'a' | 'e' | 'i' | 'o' | 'u'))
}

/// Fold the gathered signals into a 0-10 reputation score.
fn reputation_score(result: &VerificationResult) -> u8 {
    let mut score: i32 = 5;
    if result.smtp_ok {
        score += 2;
    }
    if result.details.has_spf {
        score += 1;
    }
    if result.details.has_dmarc {
        score += 1;
    }
    if result.details.has_dkim {
        score += 1;
    }
    if !result.has_mx {
        score -= 2;
    }
    if result.is_disposable {
        score -= 3;
    }
    if result.is_spam_trap {
        score -= 3;
    }
    if result.is_catch_all {
        score -= 2;
    }
    if result.is_role_account {
        score -= 1;
    }
    if result.suggestion.is_some() {
        score -= 1;
    }
    score.clamp(0, 10) as u8
}
