//! Outbound SMTP rate governance
//!
//! Per-domain sliding-window counters live in the cache store so every
//! worker observes the same budget. The governor is the only component that
//! mutates the counters, the block list, and the IP-pool index. With the
//! cache unavailable it fails open: connections proceed from the default IP
//! and nothing reads as blocked.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::cache::{ttl, CacheStore};
use crate::EngineError;

/// Outbound budget for one recipient domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DomainLimit {
    pub per_minute: i64,
    pub per_hour: i64,
}

/// Per-domain limit table with a default row.
#[derive(Debug, Clone)]
pub struct RateLimits {
    table: HashMap<String, DomainLimit>,
    default: DomainLimit,
}

impl RateLimits {
    pub fn new(default: DomainLimit) -> Self {
        Self {
            table: HashMap::new(),
            default,
        }
    }

    pub fn with_limit(mut self, domain: &str, limit: DomainLimit) -> Self {
        self.table.insert(domain.to_lowercase(), limit);
        self
    }

    pub fn limit_for(&self, domain: &str) -> DomainLimit {
        self.table
            .get(&domain.to_lowercase())
            .copied()
            .unwrap_or(self.default)
    }
}

impl Default for RateLimits {
    /// Conservative defaults; the majors tolerate more probes per window.
    fn default() -> Self {
        Self::new(DomainLimit {
            per_minute: 30,
            per_hour: 300,
        })
        .with_limit("gmail.com", DomainLimit { per_minute: 100, per_hour: 1000 })
        .with_limit("googlemail.com", DomainLimit { per_minute: 100, per_hour: 1000 })
        .with_limit("yahoo.com", DomainLimit { per_minute: 50, per_hour: 500 })
        .with_limit("hotmail.com", DomainLimit { per_minute: 50, per_hour: 500 })
        .with_limit("outlook.com", DomainLimit { per_minute: 50, per_hour: 500 })
        .with_limit("aol.com", DomainLimit { per_minute: 30, per_hour: 300 })
        .with_limit("icloud.com", DomainLimit { per_minute: 30, per_hour: 300 })
    }
}

/// Guards outbound SMTP connections.
pub struct RateGovernor {
    cache: Arc<dyn CacheStore>,
    limits: RateLimits,
    pool: Vec<IpAddr>,
}

/// Returned when the pool is empty or the cache is down: callers treat it as
/// "do not bind a source address".
pub const UNBOUND_IP: IpAddr = IpAddr::V4(Ipv4Addr::UNSPECIFIED);

impl RateGovernor {
    pub fn new(cache: Arc<dyn CacheStore>, limits: RateLimits, pool: Vec<IpAddr>) -> Self {
        Self { cache, limits, pool }
    }

    /// Take one slot of the domain's minute and hour budgets and pick the
    /// next IP from the pool.
    ///
    /// Both counters are incremented before the limit check, so a denied
    /// call still consumes budget; counters only ever shrink by TTL expiry.
    pub async fn acquire(&self, domain: &str) -> Result<IpAddr, EngineError> {
        let domain = domain.to_lowercase();
        let limit = self.limits.limit_for(&domain);

        let minute_key = format!("smtp:{}:minute", domain);
        let Some(minute) = self.cache.incr(&minute_key, ttl::MINUTE_WINDOW).await else {
            warn!("Rate counters unavailable; failing open for {}", domain);
            return Ok(self.default_ip());
        };
        if minute > limit.per_minute {
            debug!("Minute budget exhausted for {} ({}/{})", domain, minute, limit.per_minute);
            return Err(EngineError::RateLimitMinute { domain });
        }

        let hour_key = format!("smtp:{}:hour", domain);
        if let Some(hour) = self.cache.incr(&hour_key, ttl::HOUR_WINDOW).await {
            if hour > limit.per_hour {
                debug!("Hour budget exhausted for {} ({}/{})", domain, hour, limit.per_hour);
                return Err(EngineError::RateLimitHour { domain });
            }
        }

        Ok(self.next_ip().await)
    }

    /// Progressive pre-send delay once the minute window passes 80% of its
    /// budget: `(usage_ratio - 0.8) * 10s`, floored at zero.
    pub async fn delay(&self, domain: &str) -> Duration {
        let domain = domain.to_lowercase();
        let limit = self.limits.limit_for(&domain);
        let minute_key = format!("smtp:{}:minute", domain);
        let count = self
            .cache
            .get(&minute_key)
            .await
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0);

        let ratio = count as f64 / limit.per_minute.max(1) as f64;
        if ratio <= 0.8 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64((ratio - 0.8) * 10.0)
    }

    /// Quarantine a domain for `seconds`.
    pub async fn mark_blocked(&self, domain: &str, seconds: u64) {
        let key = format!("smtp:blocked:{}", domain.to_lowercase());
        warn!("Blocking outbound SMTP to {} for {}s", domain, seconds);
        self.cache.set(&key, "1", Duration::from_secs(seconds)).await;
    }

    /// Whether a domain is currently quarantined. Answers `false` when the
    /// cache is unavailable.
    pub async fn is_blocked(&self, domain: &str) -> bool {
        let key = format!("smtp:blocked:{}", domain.to_lowercase());
        self.cache.exists(&key).await
    }

    /// Record a successful probe for hourly observability counters.
    pub async fn report_success(&self, domain: &str) {
        let key = format!("smtp:stats:{}:success", domain.to_lowercase());
        self.cache.incr(&key, ttl::HOUR_WINDOW).await;
    }

    /// Record a failed probe for hourly observability counters.
    pub async fn report_failure(&self, domain: &str, reason: &str) {
        debug!("Probe failure for {}: {}", domain, reason);
        let key = format!("smtp:stats:{}:failure", domain.to_lowercase());
        self.cache.incr(&key, ttl::HOUR_WINDOW).await;
    }

    pub fn pool_size(&self) -> usize {
        self.pool.len()
    }

    fn default_ip(&self) -> IpAddr {
        self.pool.first().copied().unwrap_or(UNBOUND_IP)
    }

    async fn next_ip(&self) -> IpAddr {
        if self.pool.is_empty() {
            return UNBOUND_IP;
        }
        // Round-robin index shared across workers through the cache. The
        // index key deliberately never expires within a day so rotation
        // continues across restarts.
        match self.cache.incr("smtp:ip_index", Duration::from_secs(86_400)).await {
            Some(index) => self.pool[(index as usize) % self.pool.len()],
            None => self.default_ip(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheFuture, MemoryCache};
    use pretty_assertions::assert_eq;

    fn governor_with(pool: Vec<IpAddr>, limits: RateLimits) -> RateGovernor {
        RateGovernor::new(Arc::new(MemoryCache::new()), limits, pool)
    }

    #[tokio::test]
    async fn test_minute_limit_enforced() {
        let limits = RateLimits::new(DomainLimit { per_minute: 100, per_hour: 10_000 });
        let governor = governor_with(vec![], limits);

        for _ in 0..100 {
            governor.acquire("gmail.com").await.unwrap();
        }
        let denied = governor.acquire("gmail.com").await;
        assert!(matches!(
            denied,
            Err(EngineError::RateLimitMinute { ref domain }) if domain == "gmail.com"
        ));
    }

    #[tokio::test]
    async fn test_hour_limit_enforced() {
        let limits = RateLimits::new(DomainLimit { per_minute: 1_000, per_hour: 3 });
        let governor = governor_with(vec![], limits);

        for _ in 0..3 {
            governor.acquire("example.com").await.unwrap();
        }
        let denied = governor.acquire("example.com").await;
        assert!(matches!(denied, Err(EngineError::RateLimitHour { .. })));
    }

    #[tokio::test]
    async fn test_round_robin_pool() {
        let pool: Vec<IpAddr> = vec![
            "10.0.0.1".parse().unwrap(),
            "10.0.0.2".parse().unwrap(),
            "10.0.0.3".parse().unwrap(),
        ];
        let limits = RateLimits::default();
        let governor = governor_with(pool.clone(), limits);

        let first = governor.acquire("example.com").await.unwrap();
        let second = governor.acquire("example.com").await.unwrap();
        let third = governor.acquire("example.com").await.unwrap();
        let fourth = governor.acquire("example.com").await.unwrap();
        assert_eq!(first, pool[1]);
        assert_eq!(second, pool[2]);
        assert_eq!(third, pool[0]);
        assert_eq!(fourth, pool[1]);
    }

    #[tokio::test]
    async fn test_delay_progression() {
        let limits = RateLimits::new(DomainLimit { per_minute: 100, per_hour: 10_000 });
        let governor = governor_with(vec![], limits);

        assert_eq!(governor.delay("example.com").await, Duration::ZERO);

        for _ in 0..90 {
            governor.acquire("example.com").await.unwrap();
        }
        let delay = governor.delay("example.com").await;
        // 90% usage: (0.9 - 0.8) * 10s = 1s.
        assert!(delay >= Duration::from_millis(900) && delay <= Duration::from_millis(1100));
    }

    #[tokio::test]
    async fn test_block_and_unblock() {
        let governor = governor_with(vec![], RateLimits::default());
        assert!(!governor.is_blocked("example.com").await);
        governor.mark_blocked("example.com", 60).await;
        assert!(governor.is_blocked("example.com").await);
    }

    /// Cache stub whose every operation behaves as an outage.
    struct DownCache;

    impl CacheStore for DownCache {
        fn get<'a>(&'a self, _key: &'a str) -> CacheFuture<'a, Option<String>> {
            Box::pin(async { None })
        }
        fn set<'a>(&'a self, _key: &'a str, _value: &'a str, _ttl: Duration) -> CacheFuture<'a, ()> {
            Box::pin(async {})
        }
        fn incr<'a>(&'a self, _key: &'a str, _ttl: Duration) -> CacheFuture<'a, Option<i64>> {
            Box::pin(async { None })
        }
        fn set_ttl<'a>(&'a self, _key: &'a str, _ttl: Duration) -> CacheFuture<'a, ()> {
            Box::pin(async {})
        }
        fn exists<'a>(&'a self, _key: &'a str) -> CacheFuture<'a, bool> {
            Box::pin(async { false })
        }
    }

    #[tokio::test]
    async fn test_fails_open_without_cache() {
        let pool: Vec<IpAddr> = vec!["10.0.0.7".parse().unwrap()];
        let governor = RateGovernor::new(Arc::new(DownCache), RateLimits::default(), pool.clone());

        // Unlimited acquires succeed from the default IP; nothing is blocked.
        for _ in 0..500 {
            assert_eq!(governor.acquire("gmail.com").await.unwrap(), pool[0]);
        }
        assert!(!governor.is_blocked("gmail.com").await);
        assert_eq!(governor.delay("gmail.com").await, Duration::ZERO);
    }
}
