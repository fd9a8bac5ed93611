//! Named TTL caches with capacity eviction.
//!
//! A [`Cache`] stores values for a bounded time. When a `put` pushes the
//! cache past `max_size`, expired entries are dropped first and then the
//! configured [`EvictionPolicy`] picks victims. [`CacheManager`] owns the
//! named caches and sweeps expired entries in the background.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use relaybus_core::ClockSource;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::service::registry::{ManagedService, ServiceContext};
use crate::service::worker::{BackgroundRunnable, BackgroundWorker, SweepTask};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Victim selection once a cache is over capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EvictionPolicy {
    /// Least recently accessed.
    #[default]
    Lru,
    /// Least frequently accessed.
    Lfu,
    /// Oldest inserted.
    Fifo,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub max_size: usize,
    pub default_ttl_seconds: u64,
    pub eviction_policy: EvictionPolicy,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: 1_000,
            default_ttl_seconds: 300,
            eviction_policy: EvictionPolicy::Lru,
        }
    }
}

/// Settings for the cache manager and the caches it creates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheManagerConfig {
    /// Cadence of the expiry sweep (ms).
    pub sweep_interval_ms: u64,
    /// Settings for caches created without an explicit config.
    pub default_cache: CacheConfig,
    /// Caches created when the manager starts, by name.
    pub caches: HashMap<String, CacheConfig>,
}

impl Default for CacheManagerConfig {
    fn default() -> Self {
        Self {
            sweep_interval_ms: 60_000,
            default_cache: CacheConfig::default(),
            caches: HashMap::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

/// A stored value with its bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<V> {
    pub value: V,
    pub creation_ms: u64,
    pub expiration_ms: u64,
    pub last_access_ms: u64,
    pub access_count: u64,
}

impl<V> CacheEntry<V> {
    /// An entry is expired once `now` is strictly past its expiration.
    #[must_use]
    pub fn is_expired(&self, now: u64) -> bool {
        now > self.expiration_ms
    }
}

/// Counters of one cache.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct CacheStats {
    pub size: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
}

impl CacheStats {
    /// Fraction of lookups that hit, 0.0 when there were none.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// A named TTL cache.
pub struct Cache<V> {
    name: String,
    config: CacheConfig,
    entries: Mutex<HashMap<String, CacheEntry<V>>>,
    clock: Arc<dyn ClockSource>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

impl<V: Clone + Send + Sync + 'static> Cache<V> {
    #[must_use]
    pub fn new(name: impl Into<String>, config: CacheConfig, clock: Arc<dyn ClockSource>) -> Self {
        Self {
            name: name.into(),
            config,
            entries: Mutex::new(HashMap::new()),
            clock,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Stores `value` with the default TTL. Returns the previous live value.
    pub fn put(&self, key: impl Into<String>, value: V) -> Option<V> {
        self.put_with_ttl(key, value, self.config.default_ttl_seconds)
    }

    /// Stores `value` for `ttl_seconds`. Returns the previous live value.
    pub fn put_with_ttl(&self, key: impl Into<String>, value: V, ttl_seconds: u64) -> Option<V> {
        let key = key.into();
        let now = self.clock.now();
        let entry = CacheEntry {
            value,
            creation_ms: now,
            expiration_ms: now.saturating_add(ttl_seconds.saturating_mul(1_000)),
            last_access_ms: now,
            access_count: 0,
        };

        let mut entries = self.entries.lock();
        let previous = entries
            .insert(key.clone(), entry)
            .filter(|old| !old.is_expired(now))
            .map(|old| old.value);
        if entries.len() > self.config.max_size {
            self.enforce_capacity(&mut entries, &key, now);
        }
        previous
    }

    /// Returns the live value for `key`, recording the access.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        let live = entries.get(key).map(|e| !e.is_expired(now));
        let value = match live {
            Some(true) => entries.get_mut(key).map(|entry| {
                entry.last_access_ms = now;
                entry.access_count += 1;
                entry.value.clone()
            }),
            Some(false) => {
                entries.remove(key);
                self.expirations.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => None,
        };
        drop(entries);

        if value.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("relaybus_cache_hits_total", "cache" => self.name.clone())
                .increment(1);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("relaybus_cache_misses_total", "cache" => self.name.clone())
                .increment(1);
        }
        value
    }

    /// Full entry for `key`, without recording an access.
    #[must_use]
    pub fn entry(&self, key: &str) -> Option<CacheEntry<V>> {
        let now = self.clock.now();
        self.entries
            .lock()
            .get(key)
            .filter(|e| !e.is_expired(now))
            .cloned()
    }

    pub fn remove(&self, key: &str) -> Option<V> {
        self.entries.lock().remove(key).map(|e| e.value)
    }

    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        let now = self.clock.now();
        self.entries
            .lock()
            .get(key)
            .is_some_and(|e| !e.is_expired(now))
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Number of stored entries, including expired ones not yet swept.
    #[must_use]
    pub fn size(&self) -> usize {
        self.entries.lock().len()
    }

    /// Keys of live entries, sorted.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        let now = self.clock.now();
        let mut keys: Vec<_> = self
            .entries
            .lock()
            .iter()
            .filter(|(_, e)| !e.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Drops every expired entry and returns how many were removed.
    pub fn remove_expired_entries(&self) -> usize {
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, e| !e.is_expired(now));
        let removed = before - entries.len();
        drop(entries);
        if removed > 0 {
            self.expirations
                .fetch_add(removed as u64, Ordering::Relaxed);
            debug!(cache = %self.name, removed, "expired cache entries removed");
        }
        removed
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            size: self.size(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
        }
    }

    /// Shrinks `entries` to `max_size`: expired entries first, then policy
    /// victims. `protected` (the key just written) goes only if it is alone.
    fn enforce_capacity(
        &self,
        entries: &mut HashMap<String, CacheEntry<V>>,
        protected: &str,
        now: u64,
    ) {
        let before = entries.len();
        entries.retain(|k, e| k == protected || !e.is_expired(now));
        let expired = before - entries.len();
        if expired > 0 {
            self.expirations
                .fetch_add(expired as u64, Ordering::Relaxed);
        }

        let mut evicted = 0_u64;
        while entries.len() > self.config.max_size {
            let victim = self
                .pick_victim(entries, protected)
                .or_else(|| (entries.len() == 1).then(|| protected.to_string()));
            let Some(victim) = victim else { break };
            entries.remove(&victim);
            evicted += 1;
        }

        if evicted > 0 {
            self.evictions.fetch_add(evicted, Ordering::Relaxed);
            metrics::counter!("relaybus_cache_evictions_total", "cache" => self.name.clone())
                .increment(evicted);
            debug!(
                cache = %self.name,
                evicted,
                policy = ?self.config.eviction_policy,
                "cache entries evicted"
            );
        }
    }

    fn pick_victim(
        &self,
        entries: &HashMap<String, CacheEntry<V>>,
        protected: &str,
    ) -> Option<String> {
        let candidates = entries.iter().filter(|(k, _)| k.as_str() != protected);
        let victim = match self.config.eviction_policy {
            EvictionPolicy::Lru => candidates.min_by_key(|(k, e)| (e.last_access_ms, k.as_str())),
            EvictionPolicy::Lfu => {
                candidates.min_by_key(|(k, e)| (e.access_count, e.last_access_ms, k.as_str()))
            }
            EvictionPolicy::Fifo => candidates.min_by_key(|(k, e)| (e.creation_ms, k.as_str())),
        };
        victim.map(|(k, _)| k.clone())
    }
}

impl<V> std::fmt::Debug for Cache<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("name", &self.name)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// CacheManager
// ---------------------------------------------------------------------------

struct ExpirySweeper<V: Clone + Send + Sync + 'static> {
    manager: Weak<CacheManager<V>>,
}

#[async_trait]
impl<V: Clone + Send + Sync + 'static> BackgroundRunnable for ExpirySweeper<V> {
    type Task = SweepTask;

    async fn run(&mut self, _task: SweepTask) {
        self.on_tick().await;
    }

    async fn on_tick(&mut self) {
        if let Some(manager) = self.manager.upgrade() {
            manager.sweep_expired();
        }
    }
}

/// Owner of the named caches.
pub struct CacheManager<V: Clone + Send + Sync + 'static> {
    this: Weak<Self>,
    config: CacheManagerConfig,
    caches: DashMap<String, Arc<Cache<V>>>,
    clock: Arc<dyn ClockSource>,
    sweeper: Mutex<Option<BackgroundWorker<ExpirySweeper<V>>>>,
    shutdown_timeout: Mutex<Duration>,
}

impl<V: Clone + Send + Sync + 'static> CacheManager<V> {
    /// Creates the manager and the caches listed in `config`.
    #[must_use]
    pub fn new(config: CacheManagerConfig, clock: Arc<dyn ClockSource>) -> Arc<Self> {
        let manager = Arc::new_cyclic(|this| Self {
            this: this.clone(),
            config,
            caches: DashMap::new(),
            clock,
            sweeper: Mutex::new(None),
            shutdown_timeout: Mutex::new(Duration::from_secs(5)),
        });
        for (name, cache_config) in &manager.config.caches {
            manager.create_cache(name, cache_config.clone());
        }
        manager
    }

    /// Creates (or replaces) a cache.
    pub fn create_cache(&self, name: &str, config: CacheConfig) -> Arc<Cache<V>> {
        let cache = Arc::new(Cache::new(name, config, self.clock.clone()));
        self.caches.insert(name.to_string(), cache.clone());
        debug!(cache = name, "cache created");
        cache
    }

    #[must_use]
    pub fn get_cache(&self, name: &str) -> Option<Arc<Cache<V>>> {
        self.caches.get(name).map(|c| c.value().clone())
    }

    /// Returns the named cache, creating it with the default settings.
    pub fn get_or_create_cache(&self, name: &str) -> Arc<Cache<V>> {
        self.caches
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(Cache::new(
                    name,
                    self.config.default_cache.clone(),
                    self.clock.clone(),
                ))
            })
            .clone()
    }

    pub fn remove_cache(&self, name: &str) -> bool {
        self.caches.remove(name).is_some()
    }

    /// Cache names, sorted.
    #[must_use]
    pub fn cache_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.caches.iter().map(|c| c.key().clone()).collect();
        names.sort();
        names
    }

    /// Removes expired entries from every cache. Returns the total removed.
    pub fn sweep_expired(&self) -> usize {
        let caches: Vec<_> = self.caches.iter().map(|c| c.value().clone()).collect();
        caches.iter().map(|c| c.remove_expired_entries()).sum()
    }
}

#[async_trait]
impl<V: Clone + Send + Sync + 'static> ManagedService for CacheManager<V> {
    fn name(&self) -> &'static str {
        "cache"
    }

    async fn init(&self, ctx: &ServiceContext) -> anyhow::Result<()> {
        *self.shutdown_timeout.lock() = Duration::from_millis(ctx.config.shutdown_timeout_ms);
        let mut sweeper = self.sweeper.lock();
        if sweeper.is_none() {
            *sweeper = Some(BackgroundWorker::start(
                "cache-expiry",
                ExpirySweeper {
                    manager: self.this.clone(),
                },
                self.config.sweep_interval_ms,
            ));
        }
        drop(sweeper);
        info!(
            caches = self.caches.len(),
            sweep_interval_ms = self.config.sweep_interval_ms,
            "cache manager started"
        );
        Ok(())
    }

    async fn reset(&self) -> anyhow::Result<()> {
        for cache in self.caches.iter() {
            cache.value().clear();
        }
        Ok(())
    }

    async fn shutdown(&self, terminate: bool) -> anyhow::Result<()> {
        let timeout = *self.shutdown_timeout.lock();
        let sweeper = self.sweeper.lock().take();
        if let Some(mut worker) = sweeper {
            if terminate {
                worker.abort();
            } else {
                worker.stop_within(timeout).await;
            }
        }
        self.caches.clear();
        info!("cache manager stopped");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use relaybus_core::ManualClock;

    use super::*;
    use crate::service::config::BusConfig;

    fn cache(max_size: usize, policy: EvictionPolicy) -> (Cache<String>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(0));
        let config = CacheConfig {
            max_size,
            default_ttl_seconds: 10,
            eviction_policy: policy,
        };
        (Cache::new("test", config, clock.clone()), clock)
    }

    #[test]
    fn get_before_ttl_returns_value_and_counts_access() {
        let (cache, clock) = cache(10, EvictionPolicy::Lru);
        cache.put("k", "v".to_string());

        clock.advance(Duration::from_secs(10));
        assert_eq!(cache.get("k").as_deref(), Some("v"));
        assert_eq!(cache.entry("k").unwrap().access_count, 1);
        assert_eq!(cache.stats().hits, 1);
    }

    #[test]
    fn get_after_ttl_returns_none() {
        let (cache, clock) = cache(10, EvictionPolicy::Lru);
        cache.put_with_ttl("k", "v".to_string(), 1);

        clock.advance(Duration::from_millis(1_001));
        assert!(cache.get("k").is_none());
        assert!(!cache.contains_key("k"));
        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.expirations, 1);
        assert_eq!(stats.size, 0);
    }

    #[test]
    fn put_returns_previous_live_value() {
        let (cache, clock) = cache(10, EvictionPolicy::Lru);
        assert!(cache.put("k", "a".into()).is_none());
        assert_eq!(cache.put("k", "b".into()).as_deref(), Some("a"));

        clock.advance(Duration::from_secs(11));
        assert!(cache.put("k", "c".into()).is_none());
    }

    #[test]
    fn remove_expired_entries_purges_only_expired() {
        let (cache, clock) = cache(10, EvictionPolicy::Lru);
        cache.put_with_ttl("short", "1".into(), 1);
        cache.put_with_ttl("long", "2".into(), 100);

        clock.advance(Duration::from_secs(2));
        assert_eq!(cache.remove_expired_entries(), 1);
        assert_eq!(cache.keys(), vec!["long".to_string()]);
    }

    #[test]
    fn lru_evicts_least_recently_accessed() {
        let (cache, clock) = cache(2, EvictionPolicy::Lru);
        cache.put("a", "1".into());
        clock.advance(Duration::from_millis(1));
        cache.put("b", "2".into());
        clock.advance(Duration::from_millis(1));
        cache.get("a");
        clock.advance(Duration::from_millis(1));
        cache.put("c", "3".into());

        assert_eq!(cache.keys(), vec!["a".to_string(), "c".to_string()]);
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn lfu_evicts_least_frequently_accessed() {
        let (cache, _) = cache(2, EvictionPolicy::Lfu);
        cache.put("a", "1".into());
        cache.put("b", "2".into());
        cache.get("a");
        cache.get("a");
        cache.get("b");
        cache.put("c", "3".into());

        assert_eq!(cache.keys(), vec!["a".to_string(), "c".to_string()]);
    }

    #[test]
    fn fifo_evicts_oldest_insertion() {
        let (cache, clock) = cache(2, EvictionPolicy::Fifo);
        cache.put("a", "1".into());
        clock.advance(Duration::from_millis(1));
        cache.put("b", "2".into());
        cache.get("a");
        clock.advance(Duration::from_millis(1));
        cache.put("c", "3".into());

        assert_eq!(cache.keys(), vec!["b".to_string(), "c".to_string()]);
    }

    #[test]
    fn expired_entries_go_before_policy_victims() {
        let (cache, clock) = cache(2, EvictionPolicy::Fifo);
        cache.put("old", "1".into());
        cache.put_with_ttl("short", "2".into(), 1);
        clock.advance(Duration::from_secs(2));
        cache.put("new", "3".into());

        assert_eq!(cache.keys(), vec!["new".to_string(), "old".to_string()]);
        assert_eq!(cache.stats().evictions, 0);
        assert_eq!(cache.stats().expirations, 1);
    }

    #[test]
    fn zero_capacity_keeps_nothing() {
        let (cache, _) = cache(0, EvictionPolicy::Lru);
        cache.put("a", "1".into());
        assert_eq!(cache.size(), 0);
    }

    #[test]
    fn hit_ratio_reflects_lookups() {
        let (cache, _) = cache(10, EvictionPolicy::Lru);
        assert!(cache.stats().hit_ratio().abs() < f64::EPSILON);
        cache.put("a", "1".into());
        cache.get("a");
        cache.get("missing");
        assert!((cache.stats().hit_ratio() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn manager_creates_and_removes_named_caches() {
        let clock = Arc::new(ManualClock::new(0));
        let mut config = CacheManagerConfig::default();
        config.caches.insert("preset".into(), CacheConfig::default());
        let manager: Arc<CacheManager<String>> = CacheManager::new(config, clock);

        assert!(manager.get_cache("preset").is_some());
        assert!(manager.get_cache("lazy").is_none());
        let lazy = manager.get_or_create_cache("lazy");
        lazy.put("k", "v".into());
        assert_eq!(
            manager.get_or_create_cache("lazy").get("k").as_deref(),
            Some("v")
        );
        assert_eq!(manager.cache_names(), vec!["lazy".to_string(), "preset".to_string()]);

        assert!(manager.remove_cache("lazy"));
        assert!(!manager.remove_cache("lazy"));
    }

    #[tokio::test]
    async fn background_sweep_removes_expired_entries() {
        let clock = Arc::new(ManualClock::new(0));
        let manager: Arc<CacheManager<String>> = CacheManager::new(
            CacheManagerConfig {
                sweep_interval_ms: 10,
                ..CacheManagerConfig::default()
            },
            clock.clone(),
        );
        let ctx = ServiceContext {
            config: Arc::new(BusConfig::default()),
        };
        manager.init(&ctx).await.unwrap();

        let cache = manager.get_or_create_cache("c");
        cache.put_with_ttl("k", "v".into(), 1);
        clock.advance(Duration::from_secs(2));
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(cache.size(), 0);

        manager.shutdown(false).await.unwrap();
        assert!(manager.cache_names().is_empty());
    }
}
