//! Key/value cache for resolved contexts and other derived data.
//!
//! The in-memory backend is always available. With the `redis-cache` feature
//! a Redis backend can be selected; if Redis is unreachable at startup the
//! cache falls back to memory.

use crate::config::{CacheBackendKind, CacheConfig};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Storage behind [`Cache`]. Failures are absorbed: a broken backend behaves
/// like an empty one.
pub trait CacheBackend: Send + Sync {
    fn name(&self) -> &'static str;
    fn get(&self, key: &str) -> Option<Value>;
    fn set(&self, key: &str, value: &Value, ttl: Duration);
    fn delete(&self, key: &str) -> bool;
    /// Remove every key starting with `prefix`. Returns the number removed.
    fn delete_prefix(&self, prefix: &str) -> usize;
    fn len(&self) -> usize;
    fn clear(&self);
}

struct Entry {
    value: Value,
    expires_at: Instant,
}

/// Bounded in-process cache with per-entry TTL.
pub struct MemoryCache {
    entries: Mutex<HashMap<String, Entry>>,
    max_entries: usize,
}

impl MemoryCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            max_entries: max_entries.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make room for one entry: drop expired entries first, then the entry
    /// closest to expiry.
    fn evict(entries: &mut HashMap<String, Entry>, max_entries: usize) {
        let now = Instant::now();
        entries.retain(|_, entry| entry.expires_at > now);
        while entries.len() >= max_entries {
            let Some(victim) = entries
                .iter()
                .min_by_key(|(_, entry)| entry.expires_at)
                .map(|(key, _)| key.clone())
            else {
                break;
            };
            entries.remove(&victim);
        }
    }
}

impl CacheBackend for MemoryCache {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn get(&self, key: &str) -> Option<Value> {
        let mut entries = self.lock();
        match entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    fn set(&self, key: &str, value: &Value, ttl: Duration) {
        let mut entries = self.lock();
        if !entries.contains_key(key) && entries.len() >= self.max_entries {
            Self::evict(&mut entries, self.max_entries);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: value.clone(),
                expires_at: Instant::now() + ttl,
            },
        );
    }

    fn delete(&self, key: &str) -> bool {
        self.lock().remove(key).is_some()
    }

    fn delete_prefix(&self, prefix: &str) -> usize {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|key, _| !key.starts_with(prefix));
        before - entries.len()
    }

    fn len(&self) -> usize {
        let now = Instant::now();
        self.lock().values().filter(|e| e.expires_at > now).count()
    }

    fn clear(&self) {
        self.lock().clear();
    }
}

#[cfg(feature = "redis-cache")]
pub use redis_backend::RedisCache;

#[cfg(feature = "redis-cache")]
mod redis_backend {
    use super::CacheBackend;
    use redis::Commands;
    use serde_json::Value;
    use std::sync::{Mutex, PoisonError};
    use std::time::Duration;
    use tracing::warn;

    const NAMESPACE: &str = "taskhub:";

    /// Redis-backed cache. Runtime errors are logged and treated as misses.
    pub struct RedisCache {
        conn: Mutex<redis::Connection>,
    }

    impl RedisCache {
        pub fn connect(url: &str) -> redis::RedisResult<Self> {
            let client = redis::Client::open(url)?;
            let mut conn = client.get_connection_with_timeout(Duration::from_secs(2))?;
            redis::cmd("PING").query::<String>(&mut conn)?;
            Ok(Self {
                conn: Mutex::new(conn),
            })
        }

        fn with_conn<T>(&self, op: &str, default: T, f: impl FnOnce(&mut redis::Connection) -> redis::RedisResult<T>) -> T {
            let mut conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
            match f(&mut conn) {
                Ok(value) => value,
                Err(e) => {
                    warn!(op, error = %e, "Redis cache operation failed");
                    default
                }
            }
        }
    }

    impl CacheBackend for RedisCache {
        fn name(&self) -> &'static str {
            "redis"
        }

        fn get(&self, key: &str) -> Option<Value> {
            let raw: Option<String> =
                self.with_conn("get", None, |conn| conn.get(format!("{NAMESPACE}{key}")));
            raw.and_then(|s| serde_json::from_str(&s).ok())
        }

        fn set(&self, key: &str, value: &Value, ttl: Duration) {
            let seconds = ttl.as_secs().max(1);
            self.with_conn("set", (), |conn| {
                conn.set_ex(format!("{NAMESPACE}{key}"), value.to_string(), seconds)
            });
        }

        fn delete(&self, key: &str) -> bool {
            let removed: usize = self.with_conn("del", 0, |conn| conn.del(format!("{NAMESPACE}{key}")));
            removed > 0
        }

        fn delete_prefix(&self, prefix: &str) -> usize {
            self.with_conn("delete_prefix", 0, |conn| {
                let keys: Vec<String> = conn
                    .scan_match::<_, String>(format!("{NAMESPACE}{prefix}*"))?
                    .collect();
                if keys.is_empty() {
                    return Ok(0);
                }
                conn.del(keys)
            })
        }

        fn len(&self) -> usize {
            self.with_conn("len", 0, |conn| {
                let keys: Vec<String> = conn.scan_match::<_, String>(format!("{NAMESPACE}*"))?.collect();
                Ok(keys.len())
            })
        }

        fn clear(&self) {
            self.delete_prefix("");
        }
    }
}

/// Point-in-time cache statistics.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub backend: &'static str,
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub invalidations: u64,
    pub hit_rate: f64,
}

/// Cache facade with hit/miss accounting.
pub struct Cache {
    backend: Box<dyn CacheBackend>,
    default_ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    invalidations: AtomicU64,
}

impl Cache {
    pub fn new(backend: Box<dyn CacheBackend>, default_ttl: Duration) -> Self {
        Self {
            backend,
            default_ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            sets: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
        }
    }

    pub fn in_memory(max_entries: usize, default_ttl: Duration) -> Self {
        Self::new(Box::new(MemoryCache::new(max_entries)), default_ttl)
    }

    /// Build the configured backend, falling back to memory when Redis is
    /// unavailable.
    pub fn from_config(config: &CacheConfig) -> Self {
        let ttl = Duration::from_secs(config.default_ttl_seconds);
        match config.backend {
            CacheBackendKind::Memory => {}
            #[cfg(feature = "redis-cache")]
            CacheBackendKind::Redis => match RedisCache::connect(&config.redis_url()) {
                Ok(redis) => {
                    info!(host = %config.redis_host, port = config.redis_port, "Using Redis cache");
                    return Self::new(Box::new(redis), ttl);
                }
                Err(e) => {
                    warn!(error = %e, "Redis unavailable, falling back to in-memory cache");
                }
            },
            #[cfg(not(feature = "redis-cache"))]
            CacheBackendKind::Redis => {
                warn!("Built without the redis-cache feature, using in-memory cache");
            }
        }
        info!(max_entries = config.max_entries, "Using in-memory cache");
        Self::in_memory(config.max_entries, ttl)
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        let value = self.backend.get(key);
        if value.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        value
    }

    pub fn set(&self, key: &str, value: &Value) {
        self.set_with_ttl(key, value, self.default_ttl);
    }

    pub fn set_with_ttl(&self, key: &str, value: &Value, ttl: Duration) {
        self.sets.fetch_add(1, Ordering::Relaxed);
        self.backend.set(key, value, ttl);
    }

    pub fn delete(&self, key: &str) -> bool {
        self.invalidations.fetch_add(1, Ordering::Relaxed);
        self.backend.delete(key)
    }

    pub fn delete_prefix(&self, prefix: &str) -> usize {
        self.invalidations.fetch_add(1, Ordering::Relaxed);
        self.backend.delete_prefix(prefix)
    }

    pub fn clear(&self) {
        self.backend.clear();
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        CacheStats {
            backend: self.backend.name(),
            entries: self.backend.len(),
            hits,
            misses,
            sets: self.sets.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
        }
    }
}
