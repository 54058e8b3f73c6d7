//! Email authentication presence checks
//!
//! Detects whether a domain publishes SPF, DMARC, and DKIM records. Only
//! presence is reported; policy strictness analysis belongs to the caller's
//! scoring.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use tracing::debug;

use crate::dns::DnsResolver;

/// DKIM selectors worth checking blind. Kept short: each one is a DNS
/// round-trip on the verification path.
const COMMON_DKIM_SELECTORS: &[&str] = &["default", "google", "selector1", "k1"];

/// Presence flags for a domain's authentication records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AuthPresence {
    pub has_spf: bool,
    pub has_dkim: bool,
    pub has_dmarc: bool,
}

/// Scan `txt_records` (already fetched for the domain) for an SPF policy.
pub fn spf_present(txt_records: &[Vec<String>]) -> bool {
    txt_records.iter().any(|record| {
        record
            .first()
            .map(|s| s.trim().to_lowercase().starts_with("v=spf1"))
            .unwrap_or(false)
    })
}

/// Check DMARC and DKIM presence with bounded DNS work.
///
/// Each lookup is capped by `per_lookup`; failures simply read as absent.
pub async fn dmarc_and_dkim(
    dns: &Arc<DnsResolver>,
    domain: &str,
    per_lookup: Duration,
) -> (bool, bool) {
    let dmarc_domain = format!("_dmarc.{}", domain);
    let has_dmarc = match timeout(per_lookup, dns.txt(&dmarc_domain)).await {
        Ok(Ok(records)) => records.iter().any(|record| {
            record
                .first()
                .map(|s| s.trim().to_lowercase().starts_with("v=dmarc1"))
                .unwrap_or(false)
        }),
        _ => false,
    };

    let mut has_dkim = false;
    for selector in COMMON_DKIM_SELECTORS {
        let dkim_domain = format!("{}._domainkey.{}", selector, domain);
        if let Ok(Ok(records)) = timeout(per_lookup, dns.txt(&dkim_domain)).await {
            if records
                .iter()
                .any(|record| record.concat().to_lowercase().contains("v=dkim1"))
            {
                debug!("DKIM selector '{}' present for {}", selector, domain);
                has_dkim = true;
                break;
            }
        }
    }

    (has_dmarc, has_dkim)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spf_present() {
        let records = vec![
            vec!["google-site-verification=abc".to_string()],
            vec!["v=spf1 include:_spf.google.com ~all".to_string()],
        ];
        assert!(spf_present(&records));
    }

    #[test]
    fn test_spf_absent() {
        let records = vec![vec!["v=DMARC1; p=none".to_string()]];
        assert!(!spf_present(&records));
        assert!(!spf_present(&[]));
    }

    #[test]
    fn test_spf_case_insensitive() {
        let records = vec![vec!["V=SPF1 -all".to_string()]];
        assert!(spf_present(&records));
    }
}
