//! In-memory domain intelligence
//!
//! Disposable and free-provider membership, typo suggestions, role-account
//! detection, and domain categorisation. Everything here is pure and
//! synchronous; the embedded lists are compiled into the binary.

use std::collections::{HashMap, HashSet};

use anyhow::Result;
use fastbloom::BloomFilter;
use textdistance::str::levenshtein;
use tracing::{debug, info, warn};

use crate::model::DomainCategory;

/// Local parts addressed at a function rather than a person.
pub const ROLE_ACCOUNTS: &[&str] = &[
    "admin",
    "administrator",
    "webmaster",
    "hostmaster",
    "postmaster",
    "abuse",
    "security",
    "support",
    "info",
    "contact",
    "sales",
    "marketing",
    "help",
    "noreply",
    "no-reply",
];

/// Common misspellings corrected before any distance computation.
const TYPO_CORRECTIONS: &[(&str, &str)] = &[
    ("gamil.com", "gmail.com"),
    ("gmai.com", "gmail.com"),
    ("gmal.com", "gmail.com"),
    ("gmial.com", "gmail.com"),
    ("gnail.com", "gmail.com"),
    ("hotmal.com", "hotmail.com"),
    ("hotmial.com", "hotmail.com"),
    ("hotnail.com", "hotmail.com"),
    ("outlok.com", "outlook.com"),
    ("outloook.com", "outlook.com"),
    ("yaho.com", "yahoo.com"),
    ("yahooo.com", "yahoo.com"),
    ("yhaoo.com", "yahoo.com"),
];

/// Canonical domains used as Levenshtein targets.
const WELL_KNOWN_DOMAINS: &[&str] = &[
    "gmail.com",
    "yahoo.com",
    "hotmail.com",
    "outlook.com",
    "aol.com",
    "icloud.com",
    "protonmail.com",
    "zoho.com",
    "mail.com",
    "gmx.com",
    "yandex.com",
    "live.com",
    "msn.com",
    "me.com",
    "fastmail.com",
    "comcast.net",
    "verizon.net",
];

/// Providers that predate the consumer-webmail era.
const LEGACY_PROVIDERS: &[&str] = &[
    "aol.com",
    "compuserve.com",
    "earthlink.net",
    "juno.com",
    "netzero.net",
    "prodigy.net",
];

/// Long-established consumer providers.
const ESTABLISHED_PROVIDERS: &[&str] = &[
    "gmail.com",
    "googlemail.com",
    "yahoo.com",
    "hotmail.com",
    "outlook.com",
    "live.com",
    "msn.com",
    "icloud.com",
    "me.com",
    "mail.com",
    "gmx.com",
];

const DISPOSABLE_LIST: &str = include_str!("../data/disposable_domains.txt");
const FREE_PROVIDER_LIST: &str = include_str!("../data/free_providers.txt");

/// Membership tables and heuristics for domains and local parts.
///
/// Disposable lookups go through a Bloom filter first: a negative answer is
/// definite and skips the exact set, a positive answer is confirmed against
/// it, so the final answer is exact-match semantics at Bloom-filter speed.
pub struct DomainPolicy {
    disposable_filter: BloomFilter,
    disposable: HashSet<String>,
    free_providers: HashSet<String>,
    typo_corrections: HashMap<&'static str, &'static str>,
    role_accounts: HashSet<&'static str>,
}

impl DomainPolicy {
    /// Build the policy tables from the embedded lists.
    pub fn new() -> Result<Self> {
        let disposable = parse_domain_list(DISPOSABLE_LIST)?;
        let free_providers = parse_domain_list(FREE_PROVIDER_LIST)?;

        let disposable_filter =
            BloomFilter::with_false_pos(0.001).items(disposable.iter().cloned());

        info!(
            "Domain policy initialized: {} disposable domains, {} free providers",
            disposable.len(),
            free_providers.len()
        );

        Ok(Self {
            disposable_filter,
            disposable,
            free_providers,
            typo_corrections: TYPO_CORRECTIONS.iter().copied().collect(),
            role_accounts: ROLE_ACCOUNTS.iter().copied().collect(),
        })
    }

    /// Case-insensitive exact membership in the disposable list.
    pub fn is_disposable(&self, domain: &str) -> bool {
        let normalized = domain.to_lowercase();
        self.disposable_filter.contains(&normalized) && self.disposable.contains(&normalized)
    }

    /// Case-insensitive exact membership in the free-provider list.
    pub fn is_free_provider(&self, domain: &str) -> bool {
        self.free_providers.contains(&domain.to_lowercase())
    }

    /// Whether `local` is a function address rather than a person.
    pub fn is_role_account(&self, local: &str) -> bool {
        self.role_accounts.contains(local.to_lowercase().as_str())
    }

    /// Suggest a corrected address when the domain looks like a typo.
    ///
    /// The hard-coded correction map wins; otherwise the nearest well-known
    /// domain within Levenshtein distance 2 (and not an exact match) is
    /// suggested.
    pub fn suggest(&self, email: &str) -> Option<String> {
        let (local, domain) = email.rsplit_once('@')?;
        if local.is_empty() || domain.is_empty() {
            return None;
        }
        let domain = domain.to_lowercase();

        if let Some(corrected) = self.typo_corrections.get(domain.as_str()) {
            debug!("Typo map hit: {} -> {}", domain, corrected);
            return Some(format!("{}@{}", local, corrected));
        }

        let mut nearest: Option<(&str, usize)> = None;
        for candidate in WELL_KNOWN_DOMAINS {
            let distance = levenshtein(&domain, candidate);
            if distance == 0 {
                return None;
            }
            if nearest.map(|(_, best)| distance < best).unwrap_or(true) {
                nearest = Some((candidate, distance));
            }
        }

        match nearest {
            Some((candidate, distance)) if distance <= 2 => {
                debug!(
                    "Typo suggestion: {} -> {} (distance {})",
                    domain, candidate, distance
                );
                Some(format!("{}@{}", local, candidate))
            }
            _ => None,
        }
    }

    /// Classify a domain by provider age and top-level domain.
    pub fn category(&self, domain: &str) -> DomainCategory {
        let normalized = domain.to_lowercase();
        if LEGACY_PROVIDERS.contains(&normalized.as_str()) {
            return DomainCategory::Legacy;
        }
        if ESTABLISHED_PROVIDERS.contains(&normalized.as_str()) {
            return DomainCategory::Established;
        }
        let tld = normalized.rsplit('.').next().unwrap_or("");
        match tld {
            "edu" | "gov" | "mil" => DomainCategory::Institutional,
            "org" | "net" => DomainCategory::Organization,
            _ => DomainCategory::Standard,
        }
    }

    pub fn disposable_count(&self) -> usize {
        self.disposable.len()
    }

    pub fn free_provider_count(&self) -> usize {
        self.free_providers.len()
    }
}

/// Parse an embedded domain list: one domain per line, `#` comments.
fn parse_domain_list(content: &str) -> Result<HashSet<String>> {
    let mut domains = HashSet::new();
    let mut invalid = 0usize;

    for line in content.lines() {
        let domain = line.trim();
        if domain.is_empty() || domain.starts_with('#') {
            continue;
        }
        if domain.contains('.') && !domain.contains(char::is_whitespace) {
            domains.insert(domain.to_lowercase());
        } else {
            invalid += 1;
            warn!("Skipping malformed list entry: '{}'", domain);
        }
    }

    if domains.is_empty() {
        return Err(anyhow::anyhow!("embedded domain list is empty"));
    }
    if invalid > 0 {
        warn!("Skipped {} malformed list entries", invalid);
    }
    Ok(domains)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn policy() -> DomainPolicy {
        DomainPolicy::new().unwrap()
    }

    #[test]
    fn test_disposable_membership() {
        let policy = policy();
        assert!(policy.is_disposable("mailinator.com"));
        assert!(policy.is_disposable("MAILINATOR.COM"));
        assert!(policy.is_disposable("guerrillamail.com"));
        assert!(!policy.is_disposable("gmail.com"));
        assert!(!policy.is_disposable("example.com"));
        // Exact match only: subdomains are not members.
        assert!(!policy.is_disposable("sub.mailinator.com"));
    }

    #[test]
    fn test_free_provider_membership() {
        let policy = policy();
        assert!(policy.is_free_provider("gmail.com"));
        assert!(policy.is_free_provider("Yahoo.Com"));
        assert!(!policy.is_free_provider("acme-inc.com"));
    }

    #[test]
    fn test_role_accounts() {
        let policy = policy();
        assert!(policy.is_role_account("info"));
        assert!(policy.is_role_account("POSTMASTER"));
        assert!(policy.is_role_account("no-reply"));
        assert!(!policy.is_role_account("john.doe"));
    }

    #[test]
    fn test_suggest_via_typo_map() {
        let policy = policy();
        assert_eq!(
            policy.suggest("a@gmal.com"),
            Some("a@gmail.com".to_string())
        );
        assert_eq!(
            policy.suggest("user@hotmial.com"),
            Some("user@hotmail.com".to_string())
        );
    }

    #[test]
    fn test_suggest_via_distance() {
        let policy = policy();
        assert_eq!(
            policy.suggest("user@gmaill.com"),
            Some("user@gmail.com".to_string())
        );
        assert_eq!(
            policy.suggest("user@gmall.com"),
            Some("user@gmail.com".to_string())
        );
    }

    #[test]
    fn test_suggest_exact_match_is_not_a_typo() {
        let policy = policy();
        assert_eq!(policy.suggest("user@gmail.com"), None);
        assert_eq!(policy.suggest("user@yahoo.com"), None);
    }

    #[test]
    fn test_suggest_distance_threshold() {
        let policy = policy();
        assert_eq!(policy.suggest("user@completely-different.com"), None);
        assert_eq!(policy.suggest("not-an-email"), None);
    }

    #[test]
    fn test_category() {
        let policy = policy();
        assert_eq!(policy.category("aol.com"), DomainCategory::Legacy);
        assert_eq!(policy.category("gmail.com"), DomainCategory::Established);
        assert_eq!(policy.category("mit.edu"), DomainCategory::Institutional);
        assert_eq!(policy.category("army.mil"), DomainCategory::Institutional);
        assert_eq!(policy.category("mozilla.org"), DomainCategory::Organization);
        assert_eq!(policy.category("example.net"), DomainCategory::Organization);
        assert_eq!(policy.category("acme-inc.com"), DomainCategory::Standard);
    }

    #[test]
    fn test_parse_domain_list() {
        let content = "# comment\nfoo.example\n\nbar.example\nnot a domain\n";
        let domains = parse_domain_list(content).unwrap();
        assert_eq!(domains.len(), 2);
        assert!(domains.contains("foo.example"));
        assert!(domains.contains("bar.example"));
    }
}
