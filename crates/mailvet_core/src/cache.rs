//! Keyed TTL store behind the engine
//!
//! All cross-request state (verification results, DNS answers, rate
//! counters, block flags, usage snapshots) goes through [`CacheStore`]. The
//! store is fail-open by contract: a backend failure degrades to a miss and
//! is never surfaced to callers, so the engine stays correct (if slower)
//! with the cache down.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use redis::AsyncCommands;
use tracing::{debug, info, warn};

/// TTLs for the cache key families.
///
/// Verification results are cached long on the positive side and shorter on
/// the negative side so transient delivery problems age out faster.
pub mod ttl {
    use std::time::Duration;

    /// MX answers keyed by domain.
    pub const MX: Duration = Duration::from_secs(24 * 3600);
    /// Results where the address came out valid.
    pub const VERIFY_POSITIVE: Duration = Duration::from_secs(24 * 3600);
    /// Results where the address came out invalid.
    pub const VERIFY_NEGATIVE: Duration = Duration::from_secs(12 * 3600);
    /// Per-owner usage snapshots.
    pub const USAGE_SNAPSHOT: Duration = Duration::from_secs(3600);
    /// Per-domain minute window.
    pub const MINUTE_WINDOW: Duration = Duration::from_secs(60);
    /// Per-domain hour window.
    pub const HOUR_WINDOW: Duration = Duration::from_secs(3600);
}

pub type CacheFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Opaque string-keyed TTL store.
///
/// Implementations must be safe under concurrent access and must not block
/// the caller on backend failures: `get` misses, `incr` returns `None`,
/// `set`/`set_ttl` drop the write, `exists` answers `false`.
pub trait CacheStore: Send + Sync {
    fn get<'a>(&'a self, key: &'a str) -> CacheFuture<'a, Option<String>>;
    fn set<'a>(&'a self, key: &'a str, value: &'a str, ttl: Duration) -> CacheFuture<'a, ()>;
    /// Atomically increment `key`, creating it with `ttl` on first use.
    /// `None` means the backend was unavailable.
    fn incr<'a>(&'a self, key: &'a str, ttl: Duration) -> CacheFuture<'a, Option<i64>>;
    fn set_ttl<'a>(&'a self, key: &'a str, ttl: Duration) -> CacheFuture<'a, ()>;
    fn exists<'a>(&'a self, key: &'a str) -> CacheFuture<'a, bool>;
}

/// Redis-backed store using one multiplexed connection.
///
/// Construction attempts a single connection; if it fails the store starts
/// degraded and every operation behaves as a miss.
pub struct RedisCache {
    conn: Option<redis::aio::MultiplexedConnection>,
}

impl RedisCache {
    /// Connect to `url` (e.g. `redis://127.0.0.1:6379`).
    ///
    /// A connection failure is logged and produces a degraded store rather
    /// than an error.
    pub async fn connect(url: &str) -> Self {
        let conn = match redis::Client::open(url) {
            Ok(client) => match client.get_multiplexed_async_connection().await {
                Ok(conn) => {
                    info!("Connected to cache backend at {}", url);
                    Some(conn)
                }
                Err(e) => {
                    warn!("Cache backend unreachable ({}); running degraded: {}", url, e);
                    None
                }
            },
            Err(e) => {
                warn!("Invalid cache URL {}; running degraded: {}", url, e);
                None
            }
        };
        Self { conn }
    }

    fn connection(&self) -> Option<redis::aio::MultiplexedConnection> {
        self.conn.clone()
    }
}

impl CacheStore for RedisCache {
    fn get<'a>(&'a self, key: &'a str) -> CacheFuture<'a, Option<String>> {
        Box::pin(async move {
            let mut conn = self.connection()?;
            match conn.get::<_, Option<String>>(key).await {
                Ok(value) => value,
                Err(e) => {
                    warn!("Cache GET {} failed, treating as miss: {}", key, e);
                    None
                }
            }
        })
    }

    fn set<'a>(&'a self, key: &'a str, value: &'a str, ttl: Duration) -> CacheFuture<'a, ()> {
        Box::pin(async move {
            let Some(mut conn) = self.connection() else {
                return;
            };
            if let Err(e) = conn
                .set_ex::<_, _, ()>(key, value, ttl.as_secs().max(1))
                .await
            {
                warn!("Cache SET {} failed, dropping write: {}", key, e);
            }
        })
    }

    fn incr<'a>(&'a self, key: &'a str, ttl: Duration) -> CacheFuture<'a, Option<i64>> {
        Box::pin(async move {
            let mut conn = self.connection()?;
            let count = match conn.incr::<_, _, i64>(key, 1).await {
                Ok(count) => count,
                Err(e) => {
                    warn!("Cache INCR {} failed: {}", key, e);
                    return None;
                }
            };
            if count == 1 {
                if let Err(e) = conn.expire::<_, ()>(key, ttl.as_secs().max(1) as i64).await {
                    warn!("Cache EXPIRE {} failed: {}", key, e);
                }
            }
            Some(count)
        })
    }

    fn set_ttl<'a>(&'a self, key: &'a str, ttl: Duration) -> CacheFuture<'a, ()> {
        Box::pin(async move {
            let Some(mut conn) = self.connection() else {
                return;
            };
            if let Err(e) = conn.expire::<_, ()>(key, ttl.as_secs().max(1) as i64).await {
                warn!("Cache EXPIRE {} failed: {}", key, e);
            }
        })
    }

    fn exists<'a>(&'a self, key: &'a str) -> CacheFuture<'a, bool> {
        Box::pin(async move {
            let Some(mut conn) = self.connection() else {
                return false;
            };
            match conn.exists::<_, bool>(key).await {
                Ok(found) => found,
                Err(e) => {
                    warn!("Cache EXISTS {} failed, answering false: {}", key, e);
                    false
                }
            }
        })
    }
}

struct MemoryEntry {
    value: String,
    expires_at: Instant,
}

/// In-process TTL store for tests and cache-less deployments.
///
/// Expired entries are dropped lazily on access.
#[derive(Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<String, MemoryEntry>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn read_live(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        {
            let entries = self.entries.read().expect("cache lock poisoned");
            match entries.get(key) {
                Some(entry) if entry.expires_at > now => return Some(entry.value.clone()),
                Some(_) => {}
                None => return None,
            }
        }
        // Entry exists but is expired; drop it.
        self.entries.write().expect("cache lock poisoned").remove(key);
        None
    }
}

impl CacheStore for MemoryCache {
    fn get<'a>(&'a self, key: &'a str) -> CacheFuture<'a, Option<String>> {
        Box::pin(async move { self.read_live(key) })
    }

    fn set<'a>(&'a self, key: &'a str, value: &'a str, ttl: Duration) -> CacheFuture<'a, ()> {
        Box::pin(async move {
            debug!("memory cache set {} (ttl {:?})", key, ttl);
            self.entries.write().expect("cache lock poisoned").insert(
                key.to_string(),
                MemoryEntry {
                    value: value.to_string(),
                    expires_at: Instant::now() + ttl,
                },
            );
        })
    }

    fn incr<'a>(&'a self, key: &'a str, ttl: Duration) -> CacheFuture<'a, Option<i64>> {
        Box::pin(async move {
            let mut entries = self.entries.write().expect("cache lock poisoned");
            let now = Instant::now();
            match entries.get_mut(key) {
                Some(entry) if entry.expires_at > now => {
                    let next = entry.value.parse::<i64>().unwrap_or(0) + 1;
                    entry.value = next.to_string();
                    Some(next)
                }
                _ => {
                    entries.insert(
                        key.to_string(),
                        MemoryEntry {
                            value: "1".to_string(),
                            expires_at: now + ttl,
                        },
                    );
                    Some(1)
                }
            }
        })
    }

    fn set_ttl<'a>(&'a self, key: &'a str, ttl: Duration) -> CacheFuture<'a, ()> {
        Box::pin(async move {
            let mut entries = self.entries.write().expect("cache lock poisoned");
            if let Some(entry) = entries.get_mut(key) {
                entry.expires_at = Instant::now() + ttl;
            }
        })
    }

    fn exists<'a>(&'a self, key: &'a str) -> CacheFuture<'a, bool> {
        Box::pin(async move { self.read_live(key).is_some() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_set_and_get() {
        let cache = MemoryCache::new();
        cache.set("k", "v", Duration::from_secs(60)).await;
        assert_eq!(cache.get("k").await, Some("v".to_string()));
        assert!(cache.exists("k").await);
        assert_eq!(cache.get("missing").await, None);
    }

    #[tokio::test]
    async fn test_entries_expire() {
        let cache = MemoryCache::new();
        cache.set("k", "v", Duration::from_millis(20)).await;
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(cache.get("k").await, None);
        assert!(!cache.exists("k").await);
    }

    #[tokio::test]
    async fn test_incr_creates_and_counts() {
        let cache = MemoryCache::new();
        assert_eq!(cache.incr("n", Duration::from_secs(60)).await, Some(1));
        assert_eq!(cache.incr("n", Duration::from_secs(60)).await, Some(2));
        assert_eq!(cache.incr("n", Duration::from_secs(60)).await, Some(3));
    }

    #[tokio::test]
    async fn test_incr_restarts_after_expiry() {
        let cache = MemoryCache::new();
        assert_eq!(cache.incr("n", Duration::from_millis(20)).await, Some(1));
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(cache.incr("n", Duration::from_secs(60)).await, Some(1));
    }

    #[tokio::test]
    async fn test_set_ttl_extends_entry() {
        let cache = MemoryCache::new();
        cache.set("k", "v", Duration::from_millis(20)).await;
        cache.set_ttl("k", Duration::from_secs(60)).await;
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(cache.get("k").await, Some("v".to_string()));
    }
}
