//! DNS resolution with primary and fallback resolver sets
//!
//! MX lookups are the hot path and are cached for 24 hours through the
//! [`CacheStore`]. TXT/NS/SOA answers are uncached at this layer. On
//! timeouts and transient failures the query can be retried once against a
//! hard-coded set of public resolvers; NXDOMAIN is never retried.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use hickory_resolver::config::{NameServerConfigGroup, ResolverConfig, ResolverOpts};
use hickory_resolver::error::{ResolveError, ResolveErrorKind};
use hickory_resolver::proto::op::ResponseCode;
use hickory_resolver::TokioAsyncResolver;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cache::{ttl, CacheStore};
use crate::model::MxRecord;

/// Public resolvers used when the primary set times out or SERVFAILs.
const SECONDARY_NAMESERVERS: [IpAddr; 3] = [
    IpAddr::V4(std::net::Ipv4Addr::new(8, 8, 8, 8)),
    IpAddr::V4(std::net::Ipv4Addr::new(1, 1, 1, 1)),
    IpAddr::V4(std::net::Ipv4Addr::new(9, 9, 9, 9)),
];

const SECONDARY_TIMEOUT: Duration = Duration::from_secs(5);

/// Classified DNS failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DnsError {
    /// NXDOMAIN: the domain does not exist. Never retried.
    #[error("domain not found")]
    DomainNotFound,
    /// The domain exists but the answer was empty.
    #[error("no records")]
    NoRecords,
    #[error("DNS query timed out")]
    Timeout,
    #[error("transient DNS failure: {0}")]
    Transient(String),
}

impl DnsError {
    /// Whether a retry against the fallback resolvers is worthwhile.
    fn retryable(&self) -> bool {
        matches!(self, DnsError::Timeout | DnsError::Transient(_))
    }
}

/// Start-of-authority summary for a domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SoaRecord {
    pub mname: String,
    pub rname: String,
    pub serial: u32,
}

/// Resolver wrapper over the system configuration with an optional public
/// fallback set.
pub struct DnsResolver {
    primary: TokioAsyncResolver,
    secondary: TokioAsyncResolver,
    cache: Arc<dyn CacheStore>,
}

impl DnsResolver {
    /// Build the primary resolver from the process configuration (falling
    /// back to the library defaults when no system configuration exists)
    /// and the secondary resolver from the public set.
    pub fn new(cache: Arc<dyn CacheStore>) -> Self {
        let mut opts = ResolverOpts::default();
        opts.timeout = Duration::from_secs(5);
        opts.attempts = 2;

        let primary = match TokioAsyncResolver::tokio_from_system_conf() {
            Ok(resolver) => {
                info!("DNS resolver initialized from system configuration");
                resolver
            }
            Err(e) => {
                warn!("No usable system resolver configuration ({}); using defaults", e);
                TokioAsyncResolver::tokio(ResolverConfig::default(), opts.clone())
            }
        };

        let mut secondary_opts = ResolverOpts::default();
        secondary_opts.timeout = SECONDARY_TIMEOUT;
        secondary_opts.attempts = 1;
        let group = NameServerConfigGroup::from_ips_clear(&SECONDARY_NAMESERVERS, 53, true);
        let secondary = TokioAsyncResolver::tokio(
            ResolverConfig::from_parts(None, Vec::new(), group),
            secondary_opts,
        );

        Self {
            primary,
            secondary,
            cache,
        }
    }

    /// Resolve MX records for `domain`, ascending by priority with ties in
    /// answer order. Cached for 24 hours keyed by the lowercase domain.
    ///
    /// # Arguments
    /// * `domain` - domain to query; IDNA-normalised before use
    /// * `alt_dns` - retry once against the public fallback set on
    ///   timeout/SERVFAIL
    pub async fn mx(&self, domain: &str, alt_dns: bool) -> Result<Vec<MxRecord>, DnsError> {
        let ascii = normalize_domain(domain)?;
        let cache_key = format!("dns:mx:{}", ascii);

        if let Some(cached) = self.cache.get(&cache_key).await {
            if let Ok(records) = serde_json::from_str::<Vec<MxRecord>>(&cached) {
                debug!("MX cache hit for {}", ascii);
                return if records.is_empty() {
                    Err(DnsError::NoRecords)
                } else {
                    Ok(records)
                };
            }
        }

        let records = match self.mx_query(&self.primary, &ascii).await {
            Ok(records) => records,
            Err(e) if e.retryable() && alt_dns => {
                debug!("Primary MX lookup for {} failed ({}); trying fallback set", ascii, e);
                self.mx_query(&self.secondary, &ascii).await?
            }
            Err(e) => return Err(e),
        };

        if let Ok(json) = serde_json::to_string(&records) {
            self.cache.set(&cache_key, &json, ttl::MX).await;
        }

        if records.is_empty() {
            Err(DnsError::NoRecords)
        } else {
            Ok(records)
        }
    }

    async fn mx_query(
        &self,
        resolver: &TokioAsyncResolver,
        ascii: &str,
    ) -> Result<Vec<MxRecord>, DnsError> {
        let lookup = resolver.mx_lookup(ascii).await.map_err(classify)?;
        let mut records: Vec<MxRecord> = lookup
            .iter()
            .map(|mx| MxRecord {
                exchange: normalize_exchange(&mx.exchange().to_utf8()),
                priority: mx.preference(),
            })
            .collect();
        // sort_by_key is stable, so equal priorities keep answer order.
        records.sort_by_key(|r| r.priority);
        debug!("Resolved {} MX record(s) for {}", records.len(), ascii);
        Ok(records)
    }

    /// Resolve TXT records. Each answer is the record's list of character
    /// strings, undecoded beyond UTF-8.
    pub async fn txt(&self, domain: &str) -> Result<Vec<Vec<String>>, DnsError> {
        let ascii = normalize_domain(domain)?;
        let lookup = self.primary.txt_lookup(ascii).await.map_err(classify)?;
        let records: Vec<Vec<String>> = lookup
            .iter()
            .map(|txt| {
                txt.txt_data()
                    .iter()
                    .map(|data| String::from_utf8_lossy(data).to_string())
                    .collect()
            })
            .collect();
        if records.is_empty() {
            return Err(DnsError::NoRecords);
        }
        Ok(records)
    }

    /// Resolve NS records.
    pub async fn ns(&self, domain: &str) -> Result<Vec<String>, DnsError> {
        let ascii = normalize_domain(domain)?;
        let lookup = self.primary.ns_lookup(ascii).await.map_err(classify)?;
        let records: Vec<String> = lookup
            .iter()
            .map(|ns| normalize_exchange(&ns.0.to_utf8()))
            .collect();
        if records.is_empty() {
            return Err(DnsError::NoRecords);
        }
        Ok(records)
    }

    /// Resolve the SOA record.
    pub async fn soa(&self, domain: &str) -> Result<SoaRecord, DnsError> {
        let ascii = normalize_domain(domain)?;
        let lookup = self.primary.soa_lookup(ascii).await.map_err(classify)?;
        lookup
            .iter()
            .next()
            .map(|soa| SoaRecord {
                mname: normalize_exchange(&soa.mname().to_utf8()),
                rname: normalize_exchange(&soa.rname().to_utf8()),
                serial: soa.serial(),
            })
            .ok_or(DnsError::NoRecords)
    }
}

/// Lowercase and IDNA-encode a domain for DNS use.
pub fn normalize_domain(domain: &str) -> Result<String, DnsError> {
    let trimmed = domain.trim().trim_end_matches('.');
    if trimmed.is_empty() {
        return Err(DnsError::DomainNotFound);
    }
    idna::domain_to_ascii(trimmed)
        .map(|ascii| ascii.to_lowercase())
        .map_err(|e| DnsError::Transient(format!("IDNA conversion failed: {}", e)))
}

fn normalize_exchange(exchange: &str) -> String {
    exchange.trim_end_matches('.').to_ascii_lowercase()
}

fn classify(err: ResolveError) -> DnsError {
    match err.kind() {
        ResolveErrorKind::NoRecordsFound { response_code, .. } => {
            if *response_code == ResponseCode::NXDomain {
                DnsError::DomainNotFound
            } else {
                DnsError::NoRecords
            }
        }
        ResolveErrorKind::Timeout => DnsError::Timeout,
        other => DnsError::Transient(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_resolver_construction() {
        // Must not panic regardless of whether a system resolv.conf exists.
        let _resolver = DnsResolver::new(Arc::new(MemoryCache::new()));
    }

    #[test]
    fn test_normalize_domain() {
        assert_eq!(normalize_domain("Example.COM.").unwrap(), "example.com");
        assert_eq!(normalize_domain(" gmail.com ").unwrap(), "gmail.com");
        assert!(normalize_domain("").is_err());
        // Internationalised domains become ASCII-compatible.
        assert_eq!(normalize_domain("bücher.de").unwrap(), "xn--bcher-kva.de");
    }

    #[test]
    fn test_normalize_exchange() {
        assert_eq!(
            normalize_exchange("ASPMX.L.GOOGLE.COM."),
            "aspmx.l.google.com"
        );
    }

    #[test]
    fn test_mx_sort_is_stable() {
        let mut records = vec![
            MxRecord { exchange: "mx-b.example.com".into(), priority: 10 },
            MxRecord { exchange: "mx-c.example.com".into(), priority: 5 },
            MxRecord { exchange: "mx-a.example.com".into(), priority: 10 },
        ];
        records.sort_by_key(|r| r.priority);
        assert_eq!(records[0].exchange, "mx-c.example.com");
        // Equal priorities keep their original order.
        assert_eq!(records[1].exchange, "mx-b.example.com");
        assert_eq!(records[2].exchange, "mx-a.example.com");
    }

    #[tokio::test]
    async fn test_mx_cache_hit_skips_resolution() {
        let cache = Arc::new(MemoryCache::new());
        let records = vec![MxRecord {
            exchange: "mx.cached.example".to_string(),
            priority: 10,
        }];
        cache
            .set(
                "dns:mx:cached.example",
                &serde_json::to_string(&records).unwrap(),
                Duration::from_secs(60),
            )
            .await;

        let resolver = DnsResolver::new(cache);
        let resolved = resolver.mx("cached.example", false).await.unwrap();
        assert_eq!(resolved, records);
    }

    #[tokio::test]
    async fn test_cached_empty_answer_is_no_records() {
        let cache = Arc::new(MemoryCache::new());
        cache
            .set("dns:mx:empty.example", "[]", Duration::from_secs(60))
            .await;
        let resolver = DnsResolver::new(cache);
        assert_eq!(
            resolver.mx("empty.example", false).await,
            Err(DnsError::NoRecords)
        );
    }
}
