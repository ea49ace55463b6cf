//! Stale-while-revalidate cache over a durable key/value store.
//!
//! Every value is wrapped in a [`CacheEnvelope`] carrying a version tag and the
//! time it was saved. Reads never fail: a storage error, a malformed or
//! foreign-version envelope, and an entry older than the caller's max-age all
//! read as "absent". Writes never fail either; a failed write is logged and
//! dropped. Nothing is evicted in the background.

use futures_util::future::{self, BoxFuture, FutureExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::cache::storage::{KeyValueStore, StorageError};
use crate::clock::Clock;
use crate::config::CacheConfig;
use crate::observability::metrics;

/// Stored form of a cached value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEnvelope<T> {
    pub version: String,
    /// Milliseconds since the Unix epoch.
    pub saved_at: u64,
    pub data: T,
}

/// A value read back from the cache.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedEntry<T> {
    pub data: T,
    pub saved_at: u64,
}

/// Result of [`SwrCache::get_with_staleness`].
#[derive(Debug, Clone, PartialEq)]
pub struct Staleness<T> {
    pub data: Option<T>,
    pub is_stale: bool,
    /// Age of the entry; `None` when absent (an infinitely old entry).
    pub age: Option<Duration>,
}

/// Envelope metadata without the payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntryInfo {
    pub key: String,
    pub version: String,
    pub saved_at: u64,
    pub age_ms: u64,
    pub current_version: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwrOptions {
    /// Past this age a cached value is still served but refreshed.
    pub stale_after: Duration,
    /// Past this age a cached value is treated as absent.
    pub expire_after: Duration,
}

/// Outcome of [`SwrCache::swr_fetch`].
pub struct SwrResult<T, E> {
    /// Cached value usable right now, if present and not expired.
    pub cached: Option<T>,
    /// Whether `fresh` performs a network fetch.
    pub needs_fetch: bool,
    /// Resolves to fresh data (or the cached value when it is still fresh).
    pub fresh: BoxFuture<'static, Result<T, E>>,
}

/// Namespaced, versioned cache handle. Cheap to clone.
#[derive(Clone)]
pub struct SwrCache {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    version: Arc<str>,
    namespace: Arc<str>,
}

/// Build a collision-free key for a user-scoped resource.
pub fn cache_key(user_id: &str, kind: &str) -> String {
    format!("{kind}:{user_id}")
}

impl SwrCache {
    pub fn new(store: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>, config: &CacheConfig) -> Self {
        Self {
            store,
            clock,
            version: Arc::from(config.version.as_str()),
            namespace: Arc::from(config.namespace.as_str()),
        }
    }

    fn storage_key(&self, key: &str) -> String {
        format!("{}{}", self.namespace, key)
    }

    /// Store `data` under `key`, replacing any previous value.
    pub fn set<T: Serialize>(&self, key: &str, data: &T) {
        let envelope = CacheEnvelope {
            version: self.version.to_string(),
            saved_at: self.clock.now_ms(),
            data,
        };
        let result = serde_json::to_string(&envelope)
            .map_err(StorageError::from)
            .and_then(|json| self.store.set_item(&self.storage_key(key), &json));
        if let Err(e) = result {
            tracing::debug!(key, error = %e, "Cache write dropped");
        }
    }

    fn read<T: DeserializeOwned>(&self, key: &str) -> Option<CacheEnvelope<T>> {
        let raw = match self.store.get_item(&self.storage_key(key)) {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                tracing::debug!(key, error = %e, "Cache read failed");
                return None;
            }
        };
        match serde_json::from_str::<CacheEnvelope<T>>(&raw) {
            Ok(envelope) if *envelope.version == *self.version => Some(envelope),
            Ok(envelope) => {
                tracing::debug!(key, version = %envelope.version, "Ignoring cache entry from another version");
                None
            }
            Err(e) => {
                tracing::debug!(key, error = %e, "Ignoring malformed cache entry");
                None
            }
        }
    }

    fn age_of(&self, saved_at: u64) -> Duration {
        Duration::from_millis(self.clock.now_ms().saturating_sub(saved_at))
    }

    /// Read `key`, treating entries older than `max_age` as absent.
    pub fn get<T: DeserializeOwned>(&self, key: &str, max_age: Option<Duration>) -> Option<CachedEntry<T>> {
        let Some(envelope) = self.read::<T>(key) else {
            metrics::record_cache_lookup("miss");
            return None;
        };
        if max_age.is_some_and(|max_age| self.age_of(envelope.saved_at) > max_age) {
            metrics::record_cache_lookup("expired");
            return None;
        }
        metrics::record_cache_lookup("hit");
        Some(CachedEntry {
            data: envelope.data,
            saved_at: envelope.saved_at,
        })
    }

    /// Read `key` along with its age and whether it is older than `stale_after`.
    pub fn get_with_staleness<T: DeserializeOwned>(&self, key: &str, stale_after: Duration) -> Staleness<T> {
        match self.get::<T>(key, None) {
            Some(entry) => {
                let age = self.age_of(entry.saved_at);
                Staleness {
                    data: Some(entry.data),
                    is_stale: age > stale_after,
                    age: Some(age),
                }
            }
            None => Staleness {
                data: None,
                is_stale: true,
                age: None,
            },
        }
    }

    /// Envelope metadata for `key`, regardless of version.
    pub fn inspect(&self, key: &str) -> Option<EntryInfo> {
        let raw = self.store.get_item(&self.storage_key(key)).ok().flatten()?;
        let envelope: CacheEnvelope<serde_json::Value> = serde_json::from_str(&raw).ok()?;
        Some(EntryInfo {
            key: key.to_string(),
            current_version: *envelope.version == *self.version,
            age_ms: self.age_of(envelope.saved_at).as_millis() as u64,
            version: envelope.version,
            saved_at: envelope.saved_at,
        })
    }

    pub fn remove(&self, key: &str) {
        if let Err(e) = self.store.remove_item(&self.storage_key(key)) {
            tracing::debug!(key, error = %e, "Cache remove failed");
        }
    }

    /// Remove every entry whose key starts with `prefix`. Returns how many were removed.
    pub fn remove_by_prefix(&self, prefix: &str) -> usize {
        let full_prefix = self.storage_key(prefix);
        let keys = match self.store.keys() {
            Ok(keys) => keys,
            Err(e) => {
                tracing::debug!(prefix, error = %e, "Cache key listing failed");
                return 0;
            }
        };

        let mut removed = 0;
        for key in keys.iter().filter(|k| k.starts_with(&full_prefix)) {
            match self.store.remove_item(key) {
                Ok(()) => removed += 1,
                Err(e) => tracing::debug!(key = %key, error = %e, "Cache remove failed"),
            }
        }
        removed
    }

    /// Serve the cached value now and refresh it if it is stale, absent or expired.
    ///
    /// `fetch` is only invoked when `needs_fetch` is true. The refresh is spawned
    /// on the runtime, so it completes and writes back even if `fresh` is dropped.
    /// A successful fetch is written back before `fresh` resolves.
    pub fn swr_fetch<T, E, F, Fut>(&self, key: &str, fetch: F, options: SwrOptions) -> SwrResult<T, E>
    where
        T: Serialize + DeserializeOwned + Clone + Send + 'static,
        E: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let entry = self.get::<T>(key, Some(options.expire_after));
        let needs_fetch = entry
            .as_ref()
            .map_or(true, |entry| self.age_of(entry.saved_at) > options.stale_after);
        let cached = entry.map(|entry| entry.data);

        let fresh = match (&cached, needs_fetch) {
            (Some(data), false) => future::ready(Ok(data.clone())).boxed(),
            _ => {
                if cached.is_some() {
                    metrics::record_cache_lookup("stale");
                }
                let cache = self.clone();
                let key = key.to_string();
                let refresh = tokio::spawn(async move {
                    let data = fetch().await?;
                    cache.set(&key, &data);
                    Ok(data)
                });
                async move {
                    match refresh.await {
                        Ok(outcome) => outcome,
                        Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
                        // only happens while the runtime shuts down
                        Err(_) => future::pending().await,
                    }
                }
                .boxed()
            }
        };

        SwrResult {
            cached,
            needs_fetch,
            fresh,
        }
    }
}

impl std::fmt::Debug for SwrCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SwrCache")
            .field("version", &self.version)
            .field("namespace", &self.namespace)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::storage::{MemoryStore, UnavailableStore};
    use crate::clock::ManualClock;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn cache_with(store: Arc<dyn KeyValueStore>) -> (Arc<ManualClock>, SwrCache) {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let cache = SwrCache::new(store, clock.clone(), &CacheConfig::default());
        (clock, cache)
    }

    fn cache() -> (Arc<ManualClock>, Arc<MemoryStore>, SwrCache) {
        let store = Arc::new(MemoryStore::new());
        let (clock, cache) = cache_with(store.clone());
        (clock, store, cache)
    }

    fn opts(stale_ms: u64, expire_ms: u64) -> SwrOptions {
        SwrOptions {
            stale_after: Duration::from_millis(stale_ms),
            expire_after: Duration::from_millis(expire_ms),
        }
    }

    #[test]
    fn test_round_trip_without_max_age() {
        let (clock, _store, cache) = cache();
        cache.set("profile:u1", &json!({"points": 120, "rank": 4}));
        clock.advance(Duration::from_secs(86_400 * 30));

        let entry = cache.get::<serde_json::Value>("profile:u1", None).unwrap();
        assert_eq!(entry.data, json!({"points": 120, "rank": 4}));
    }

    #[test]
    fn test_leaderboard_expires_after_max_age() {
        let (clock, _store, cache) = cache();
        let leaderboard = vec!["alice".to_string(), "bob".to_string()];
        cache.set("leaderboard", &leaderboard);
        let max_age = Some(Duration::from_millis(30_000));

        clock.advance(Duration::from_secs(10));
        let entry = cache.get::<Vec<String>>("leaderboard", max_age).unwrap();
        assert_eq!(entry.data, leaderboard);

        clock.advance(Duration::from_secs(30));
        assert!(cache.get::<Vec<String>>("leaderboard", max_age).is_none());
    }

    #[test]
    fn test_envelope_is_namespaced_and_versioned() {
        let (clock, store, cache) = cache();
        cache.set("mining:u1", &42u64);

        let raw = store.get_item("arxon_cache:mining:u1").unwrap().unwrap();
        let envelope: CacheEnvelope<u64> = serde_json::from_str(&raw).unwrap();
        assert_eq!(envelope.version, "v1");
        assert_eq!(envelope.saved_at, clock.now_ms());
        assert_eq!(envelope.data, 42);
        assert!(raw.contains("\"savedAt\""));
    }

    #[test]
    fn test_wrong_version_and_malformed_read_as_absent() {
        let (_clock, store, cache) = cache();
        store
            .set_item("arxon_cache:old", r#"{"version":"v0","savedAt":1,"data":5}"#)
            .unwrap();
        store.set_item("arxon_cache:junk", "{not json").unwrap();

        assert!(cache.get::<u32>("old", None).is_none());
        assert!(cache.get::<u32>("junk", None).is_none());
        // right version but wrong payload shape
        cache.set("shape", &"text");
        assert!(cache.get::<u32>("shape", None).is_none());
    }

    #[test]
    fn test_storage_failures_are_absorbed() {
        let (_clock, cache) = cache_with(Arc::new(UnavailableStore));
        cache.set("k", &1u8);
        assert!(cache.get::<u8>("k", None).is_none());
        cache.remove("k");
        assert_eq!(cache.remove_by_prefix(""), 0);

        let (_clock, cache) = cache_with(Arc::new(MemoryStore::with_quota(16)));
        cache.set("big", &"x".repeat(64));
        assert!(cache.get::<String>("big", None).is_none());
    }

    #[test]
    fn test_staleness() {
        let (clock, _store, cache) = cache();
        let absent = cache.get_with_staleness::<u32>("missing", Duration::from_secs(5));
        assert_eq!(
            absent,
            Staleness {
                data: None,
                is_stale: true,
                age: None
            }
        );

        cache.set("balance", &10u32);
        clock.advance(Duration::from_secs(3));
        let fresh = cache.get_with_staleness::<u32>("balance", Duration::from_secs(5));
        assert_eq!(fresh.data, Some(10));
        assert!(!fresh.is_stale);
        assert_eq!(fresh.age, Some(Duration::from_secs(3)));

        clock.advance(Duration::from_secs(3));
        assert!(cache.get_with_staleness::<u32>("balance", Duration::from_secs(5)).is_stale);
    }

    #[test]
    fn test_remove_and_remove_by_prefix() {
        let (_clock, store, cache) = cache();
        cache.set("user:u1:profile", &1);
        cache.set("user:u1:stats", &2);
        cache.set("user:u2:profile", &3);
        store.set_item("pending_referral", "ABC").unwrap();

        cache.remove("missing");
        cache.remove("user:u2:profile");
        assert!(cache.get::<i32>("user:u2:profile", None).is_none());

        assert_eq!(cache.remove_by_prefix("user:u1:"), 2);
        assert_eq!(cache.remove_by_prefix("user:u1:"), 0);
        // keys outside the namespace are untouched
        assert_eq!(store.keys().unwrap(), vec!["pending_referral"]);
    }

    #[test]
    fn test_inspect_reports_metadata() {
        let (clock, _store, cache) = cache();
        cache.set("arena", &json!([1, 2]));
        clock.advance(Duration::from_millis(1_500));

        let info = cache.inspect("arena").unwrap();
        assert_eq!(info.age_ms, 1_500);
        assert!(info.current_version);
        assert!(cache.inspect("missing").is_none());
    }

    #[tokio::test]
    async fn test_swr_fresh_entry_skips_fetch() {
        let (clock, _store, cache) = cache();
        cache.set("leaderboard", &vec![1u32, 2, 3]);
        clock.advance(Duration::from_secs(1));

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let result = cache.swr_fetch(
            "leaderboard",
            move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(vec![9u32])
            },
            opts(5_000, 60_000),
        );

        assert!(!result.needs_fetch);
        assert_eq!(result.cached, Some(vec![1, 2, 3]));
        assert_eq!(result.fresh.await.unwrap(), vec![1, 2, 3]);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_swr_stale_entry_serves_cached_and_writes_back() {
        let (clock, _store, cache) = cache();
        cache.set("leaderboard", &vec![1u32]);
        clock.advance(Duration::from_secs(10));

        let result = cache.swr_fetch(
            "leaderboard",
            || async { Ok::<_, String>(vec![7u32, 8]) },
            opts(5_000, 60_000),
        );
        assert!(result.needs_fetch);
        assert_eq!(result.cached, Some(vec![1]));
        assert_eq!(result.fresh.await.unwrap(), vec![7, 8]);

        let entry = cache.get::<Vec<u32>>("leaderboard", None).unwrap();
        assert_eq!(entry.data, vec![7, 8]);
        assert_eq!(entry.saved_at, clock.now_ms());
    }

    #[tokio::test(start_paused = true)]
    async fn test_swr_refresh_completes_when_caller_only_renders_cached() {
        let (clock, _store, cache) = cache();
        cache.set("mining", &1u32);
        clock.advance(Duration::from_secs(10));

        let result = cache.swr_fetch(
            "mining",
            || async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok::<_, String>(2u32)
            },
            opts(5_000, 60_000),
        );
        assert_eq!(result.cached, Some(1));
        drop(result.fresh);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(cache.get::<u32>("mining", None).unwrap().data, 2);
    }

    #[tokio::test]
    async fn test_swr_expired_is_treated_as_absent() {
        let (clock, _store, cache) = cache();
        cache.set("arena", &1u32);
        clock.advance(Duration::from_secs(120));

        let result = cache.swr_fetch("arena", || async { Ok::<_, String>(2u32) }, opts(5_000, 60_000));
        assert!(result.needs_fetch);
        assert_eq!(result.cached, None);
        assert_eq!(result.fresh.await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_swr_failed_fetch_keeps_old_entry() {
        let (clock, _store, cache) = cache();
        cache.set("arena", &1u32);
        clock.advance(Duration::from_secs(10));

        let result = cache.swr_fetch(
            "arena",
            || async { Err::<u32, _>("backend down".to_string()) },
            opts(5_000, 60_000),
        );
        assert_eq!(result.fresh.await.unwrap_err(), "backend down");
        assert_eq!(cache.get::<u32>("arena", None).unwrap().data, 1);
    }

    #[test]
    fn test_cache_key_is_namespaced_by_user_and_kind() {
        assert_eq!(cache_key("u-42", "mining"), "mining:u-42");
        assert_ne!(cache_key("a", "b"), cache_key("b", "a"));
    }
}
