//! Enrichment of verified addresses
//!
//! Derives a guessed person name from the local part, a guessed company
//! name from the domain, and provider/category flags. Enrichment only runs
//! for addresses that verified as valid; everything here is pure string
//! work on top of the policy tables.

use std::sync::Arc;

use tracing::{debug, instrument};

use crate::model::{Enrichment, PossibleName, VerificationResult, VerifyOptions};
use crate::pipeline::VerifierPipeline;
use crate::policy::{DomainPolicy, ROLE_ACCOUNTS};

/// Second-level + TLD pairs where the registrable name sits one label
/// deeper.
const COUNTRY_COMPOUNDS: &[&str] = &["co.uk", "com.au", "co.nz", "co.jp", "co.za", "com.br"];

pub struct Enricher {
    pipeline: Arc<VerifierPipeline>,
    policy: Arc<DomainPolicy>,
}

impl Enricher {
    pub fn new(pipeline: Arc<VerifierPipeline>, policy: Arc<DomainPolicy>) -> Self {
        Self { pipeline, policy }
    }

    /// Verify `email` and, when valid, attach the derived intelligence.
    #[instrument(skip(self, options), fields(email = %email))]
    pub async fn enrich(&self, email: &str, options: &VerifyOptions) -> VerificationResult {
        let mut result = self.pipeline.verify(email, options).await;
        if !result.is_valid {
            debug!("Skipping enrichment of invalid address");
            return result;
        }

        let local = result
            .email
            .rsplit_once('@')
            .map(|(local, _)| local)
            .unwrap_or("");
        let is_free = self.policy.is_free_provider(&result.domain);

        result.enrichment = Some(Enrichment {
            possible_name: possible_name(local),
            possible_company: if is_free {
                None
            } else {
                possible_company(&result.domain)
            },
            is_free_provider: is_free,
            domain_category: self.policy.category(&result.domain),
        });
        result
    }
}

/// Guess a person name from a local part.
///
/// Role prefixes and trailing digits are stripped, separators become
/// spaces, and each word is title-cased. One word maps to a first name,
/// several to first plus the rest as a last name.
pub fn possible_name(local: &str) -> Option<PossibleName> {
    let mut candidate = local.to_lowercase();

    for role in ROLE_ACCOUNTS {
        if candidate == *role {
            return None;
        }
        for sep in ['.', '_', '-'] {
            let prefix = format!("{}{}", role, sep);
            if let Some(rest) = candidate.strip_prefix(&prefix) {
                candidate = rest.to_string();
                break;
            }
        }
    }

    let candidate = candidate.trim_end_matches(|c: char| c.is_ascii_digit());
    let spaced = candidate.replace(['.', '_', '-'], " ");
    let words: Vec<String> = spaced
        .split_whitespace()
        .map(title_case)
        .filter(|w| !w.is_empty())
        .collect();

    match words.as_slice() {
        [] => None,
        [first] => Some(PossibleName {
            full: first.clone(),
            first: first.clone(),
            last: None,
        }),
        [first, rest @ ..] => {
            let last = rest.join(" ");
            Some(PossibleName {
                full: format!("{} {}", first, last),
                first: first.clone(),
                last: Some(last),
            })
        }
    }
}

/// Guess a company name from a domain: the registrable label, with
/// separators spaced out and title-cased.
pub fn possible_company(domain: &str) -> Option<String> {
    let domain = domain.to_lowercase();
    let labels: Vec<&str> = domain.split('.').collect();
    if labels.len() < 2 {
        return None;
    }

    let tail = labels[labels.len() - 2..].join(".");
    let name_label = if COUNTRY_COMPOUNDS.contains(&tail.as_str()) {
        if labels.len() < 3 {
            return None;
        }
        labels[labels.len() - 3]
    } else {
        labels[labels.len() - 2]
    };

    let spaced = name_label.replace(['-', '_'], " ");
    let name = spaced
        .split_whitespace()
        .map(title_case)
        .collect::<Vec<_>>()
        .join(" ");
    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}

fn title_case(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
