//! Result model for the verification engine
//!
//! Every verification produces a [`VerificationResult`] with a fixed shape:
//! optional parts are explicit `Option`s, never fields that appear and
//! disappear depending on which checks ran.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single MX record: exchange host plus preference.
///
/// Lists of MX records are always stable-sorted ascending by priority, with
/// ties kept in answer order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MxRecord {
    pub exchange: String,
    pub priority: u16,
}

/// Outcome of the mailbox-level SMTP check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MailboxCheck {
    /// RCPT was accepted by the exchange.
    Accepted,
    /// RCPT was permanently rejected (550/553).
    Rejected,
    /// The dialogue did not reach a definite answer.
    Inconclusive,
    /// The check was disabled by options or gated out earlier in the run.
    Skipped,
    /// The domain is blocked or rate-limited; no connection was attempted.
    BlockedByPolicy,
}

/// Nested DNS and SMTP intelligence attached to a result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationDetails {
    /// MX records in preference order.
    pub mx_records: Vec<MxRecord>,
    /// The domain publishes an SPF policy.
    pub has_spf: bool,
    /// At least one common DKIM selector resolves.
    pub has_dkim: bool,
    /// The domain publishes a DMARC policy.
    pub has_dmarc: bool,
    /// Mailbox-level check outcome.
    pub mailbox_check: MailboxCheck,
    /// Reputation score, 0 (worst) to 10 (best).
    pub reputation: u8,
}

impl Default for VerificationDetails {
    fn default() -> Self {
        Self {
            mx_records: Vec::new(),
            has_spf: false,
            has_dkim: false,
            has_dmarc: false,
            mailbox_check: MailboxCheck::Skipped,
            reputation: 0,
        }
    }
}

/// Guessed person name derived from the local part.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PossibleName {
    pub full: String,
    pub first: String,
    pub last: Option<String>,
}

/// Rough age/character classification of a domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DomainCategory {
    Legacy,
    Established,
    Institutional,
    Organization,
    Standard,
}

/// Secondary intelligence derived from a verified address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Enrichment {
    pub possible_name: Option<PossibleName>,
    pub possible_company: Option<String>,
    pub is_free_provider: bool,
    pub domain_category: DomainCategory,
}

/// Complete verification result for one email address.
///
/// Immutable once returned: the pipeline builds it, derives the aggregate
/// verdicts, and hands it out. Serialises to JSON and back without loss.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub email: String,
    pub domain: String,
    pub timestamp: DateTime<Utc>,
    pub processing_ms: u64,

    pub format_valid: bool,
    pub has_mx: bool,
    pub is_disposable: bool,
    pub is_catch_all: bool,
    pub is_role_account: bool,
    pub is_spam_trap: bool,
    pub smtp_ok: bool,
    /// The domain is blocked or rate-limited, so SMTP was skipped. Counts
    /// toward `is_valid` to avoid false negatives on domains we refuse to
    /// probe.
    pub smtp_blocked_by_policy: bool,

    /// Aggregate verdict, derived in [`finalize`](Self::finalize).
    pub is_valid: bool,
    /// Stricter verdict: valid, mailbox confirmed, not catch-all, not a role
    /// account.
    pub is_live: bool,
    /// The result was served from the verification cache.
    pub from_cache: bool,

    /// Corrected address when the domain looks like a typo.
    pub suggestion: Option<String>,
    /// Ordered failure tags from the closed set in [`crate::tags`].
    pub errors: Vec<String>,
    pub details: VerificationDetails,
    /// Present only on the enrichment path, and only for valid addresses.
    pub enrichment: Option<Enrichment>,
}

impl VerificationResult {
    /// Start an empty result for `email` with every signal negative.
    pub fn new(email: &str, domain: &str) -> Self {
        Self {
            email: email.to_string(),
            domain: domain.to_string(),
            timestamp: Utc::now(),
            processing_ms: 0,
            format_valid: false,
            has_mx: false,
            is_disposable: false,
            is_catch_all: false,
            is_role_account: false,
            is_spam_trap: false,
            smtp_ok: false,
            smtp_blocked_by_policy: false,
            is_valid: false,
            is_live: false,
            from_cache: false,
            suggestion: None,
            errors: Vec::new(),
            details: VerificationDetails::default(),
            enrichment: None,
        }
    }

    /// Derive the aggregate verdicts from the collected signals.
    pub fn finalize(&mut self) {
        self.is_valid = self.format_valid
            && self.has_mx
            && !self.is_disposable
            && (self.smtp_ok || self.smtp_blocked_by_policy)
            && !self.is_spam_trap;
        self.is_live =
            self.is_valid && self.smtp_ok && !self.is_catch_all && !self.is_role_account;
    }

    /// Append an error tag unless it is already present.
    pub fn push_error(&mut self, tag: &str) {
        if !self.errors.iter().any(|e| e == tag) {
            self.errors.push(tag.to_string());
        }
    }
}

/// Options controlling a single `verify` call.
///
/// The defaults run every check with a 10 second overall deadline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyOptions {
    pub use_cache: bool,
    pub check_syntax: bool,
    pub check_mx: bool,
    pub check_disposable: bool,
    pub check_typos: bool,
    pub check_catch_all: bool,
    pub check_smtp: bool,
    pub check_spam_trap: bool,
    pub check_role_account: bool,
    pub cache_results: bool,
    /// Retry DNS once against the public fallback resolvers on transient
    /// failures.
    pub alt_dns: bool,
    pub timeout_ms: u64,
}

impl Default for VerifyOptions {
    fn default() -> Self {
        Self {
            use_cache: true,
            check_syntax: true,
            check_mx: true,
            check_disposable: true,
            check_typos: true,
            check_catch_all: true,
            check_smtp: true,
            check_spam_trap: true,
            check_role_account: true,
            cache_results: true,
            alt_dns: false,
            timeout_ms: 10_000,
        }
    }
}

impl VerifyOptions {
    /// Defaults for the enrichment path, which tolerates a longer deadline.
    pub fn advanced() -> Self {
        Self {
            timeout_ms: 30_000,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample_result() -> VerificationResult {
        let mut result = VerificationResult::new("user@example.com", "example.com");
        result.format_valid = true;
        result.has_mx = true;
        result.smtp_ok = true;
        result.details.mx_records.push(MxRecord {
            exchange: "mx1.example.com".to_string(),
            priority: 10,
        });
        result.details.mailbox_check = MailboxCheck::Accepted;
        result.details.reputation = 7;
        result.finalize();
        result
    }

    #[test]
    fn test_finalize_valid_and_live() {
        let result = sample_result();
        assert!(result.is_valid);
        assert!(result.is_live);
    }

    #[test]
    fn test_blocked_by_policy_counts_as_valid() {
        let mut result = VerificationResult::new("user@example.com", "example.com");
        result.format_valid = true;
        result.has_mx = true;
        result.smtp_blocked_by_policy = true;
        result.finalize();
        assert!(result.is_valid);
        // Not live: the mailbox itself was never confirmed.
        assert!(!result.is_live);
    }

    #[test]
    fn test_disposable_never_valid() {
        let mut result = sample_result();
        result.is_disposable = true;
        result.finalize();
        assert!(!result.is_valid);
        assert!(!result.is_live);
    }

    #[test]
    fn test_catch_all_valid_but_not_live() {
        let mut result = sample_result();
        result.is_catch_all = true;
        result.finalize();
        assert!(result.is_valid);
        assert!(!result.is_live);
    }

    #[test]
    fn test_push_error_deduplicates() {
        let mut result = VerificationResult::new("a@b.com", "b.com");
        result.push_error("timeout");
        result.push_error("timeout");
        assert_eq!(result.errors, vec!["timeout".to_string()]);
    }

    #[test]
    fn test_json_round_trip() {
        let result = sample_result();
        let json = serde_json::to_string(&result).unwrap();
        let back: VerificationResult = serde_json::from_str(&json).unwrap();
        assert_eq!(result, back);
    }

    #[test]
    fn test_default_options() {
        let options = VerifyOptions::default();
        assert!(options.use_cache);
        assert!(options.check_smtp);
        assert!(!options.alt_dns);
        assert_eq!(options.timeout_ms, 10_000);
        assert_eq!(VerifyOptions::advanced().timeout_ms, 30_000);
    }
}
