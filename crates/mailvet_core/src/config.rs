//! Engine configuration
//!
//! Layered loading: built-in defaults, then an optional `Config.toml`, then
//! `MAILVET_`-prefixed environment variables. Unknown keys are rejected at
//! extraction time and the result is validated before the engine starts.

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::EngineError;

/// Full configuration surface of the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// Cache and queue backend.
    pub redis_url: String,
    /// Source addresses rotated across outbound SMTP connections.
    pub ip_pool: Vec<String>,
    /// Key prefix for the job store.
    pub queue_prefix: String,
    /// Single-stream worker count.
    pub verification_concurrency: usize,
    /// Bulk-stream worker count.
    pub bulk_concurrency: usize,
    /// Origins allowed by the HTTP edge; carried here so one document
    /// configures the whole deployment.
    pub allowed_origins: Vec<String>,
    pub log_level: String,
    pub enable_metrics: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            ip_pool: Vec::new(),
            queue_prefix: "mailvet".to_string(),
            verification_concurrency: 20,
            bulk_concurrency: 5,
            allowed_origins: Vec::new(),
            log_level: "info".to_string(),
            enable_metrics: false,
        }
    }
}

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

impl EngineConfig {
    /// Load defaults, `Config.toml` (if present), and `MAILVET_*` env vars.
    pub fn load() -> Result<Self, EngineError> {
        let mut figment = Figment::from(Serialized::defaults(EngineConfig::default()));
        if std::path::Path::new("Config.toml").exists() {
            figment = figment.merge(Toml::file("Config.toml"));
        }
        figment = figment.merge(Env::prefixed("MAILVET_"));

        let config: EngineConfig = figment
            .extract()
            .map_err(|e| EngineError::Input(format!("configuration rejected: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Semantic validation beyond what deserialization enforces.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.redis_url.is_empty() {
            return Err(EngineError::Input("redis_url must not be empty".to_string()));
        }
        for entry in &self.ip_pool {
            entry.parse::<std::net::IpAddr>().map_err(|_| {
                EngineError::Input(format!("ip_pool entry '{}' is not an IP address", entry))
            })?;
        }
        if self.queue_prefix.is_empty()
            || self.queue_prefix.contains(char::is_whitespace)
            || self.queue_prefix.contains(':')
        {
            return Err(EngineError::Input(format!(
                "queue_prefix '{}' must be non-empty without whitespace or ':'",
                self.queue_prefix
            )));
        }
        if self.verification_concurrency == 0 || self.bulk_concurrency == 0 {
            return Err(EngineError::Input(
                "worker concurrency must be at least 1".to_string(),
            ));
        }
        if !LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(EngineError::Input(format!(
                "log_level '{}' is not one of {:?}",
                self.log_level, LOG_LEVELS
            )));
        }
        Ok(())
    }

    /// Parsed IP pool; call after [`validate`](Self::validate).
    pub fn parsed_ip_pool(&self) -> Vec<std::net::IpAddr> {
        self.ip_pool
            .iter()
            .filter_map(|entry| entry.parse().ok())
            .collect()
    }
}

/// Install a global `tracing` subscriber honoring the configured level.
///
/// Meant for binaries embedding the engine; the library itself never
/// installs one.
pub fn init_tracing(config: &EngineConfig, json_logs: bool) -> Result<(), EngineError> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.log_level.clone().into());

    let registry = tracing_subscriber::registry().with(env_filter);
    let result = if json_logs {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()
    };
    result.map_err(|e| EngineError::Input(format!("tracing init failed: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.verification_concurrency, 20);
        assert_eq!(config.bulk_concurrency, 5);
        assert_eq!(config.queue_prefix, "mailvet");
        assert_eq!(config.log_level, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_bad_ip_pool_rejected() {
        let config = EngineConfig {
            ip_pool: vec!["10.0.0.1".to_string(), "not-an-ip".to_string()],
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_ip_pool_parses() {
        let config = EngineConfig {
            ip_pool: vec!["10.0.0.1".to_string(), "2001:db8::1".to_string()],
            ..EngineConfig::default()
        };
        assert!(config.validate().is_ok());
        assert_eq!(config.parsed_ip_pool().len(), 2);
    }

    #[test]
    fn test_bad_queue_prefix_rejected() {
        for prefix in ["", "has space", "has:colon"] {
            let config = EngineConfig {
                queue_prefix: prefix.to_string(),
                ..EngineConfig::default()
            };
            assert!(config.validate().is_err(), "prefix '{}' accepted", prefix);
        }
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let config = EngineConfig {
            verification_concurrency: 0,
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_log_level_rejected() {
        let config = EngineConfig {
            log_level: "verbose".to_string(),
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_keys_rejected() {
        let figment = Figment::from(Serialized::defaults(EngineConfig::default()))
            .merge(Toml::string("surprise_key = true"));
        let extracted: Result<EngineConfig, _> = figment.extract();
        assert!(extracted.is_err());
    }
}
