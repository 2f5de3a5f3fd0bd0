//! Bounded per-tenant resource cache.
//!
//! Holds at most `capacity` entries. The least recently used entry is evicted
//! when a new tenant is inserted at capacity, and entries idle for longer than
//! `ttl` expire. Every value that leaves the cache (eviction, expiry, explicit
//! teardown, replacement) is passed to the teardown hook exactly once.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use cadence_types::config::TenantCacheConfig;
use cadence_types::run::TenantId;

/// Callback receiving values removed from the cache.
pub type TeardownHook<V> = Arc<dyn Fn(&TenantId, V) + Send + Sync>;

struct Entry<V> {
    value: V,
    last_used: Instant,
    tick: u64,
}

struct Inner<V> {
    entries: HashMap<TenantId, Entry<V>>,
    tick: u64,
}

/// LRU + TTL cache keyed by tenant.
pub struct TenantCache<V: Clone> {
    inner: Mutex<Inner<V>>,
    capacity: usize,
    ttl: Duration,
    teardown: Option<TeardownHook<V>>,
}

impl<V: Clone> TenantCache<V> {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                tick: 0,
            }),
            capacity: capacity.max(1),
            ttl,
            teardown: None,
        }
    }

    pub fn from_config(config: &TenantCacheConfig) -> Self {
        Self::new(config.capacity, Duration::from_secs(config.ttl_secs))
    }

    /// Install the hook invoked for every value leaving the cache.
    pub fn with_teardown(mut self, hook: impl Fn(&TenantId, V) + Send + Sync + 'static) -> Self {
        self.teardown = Some(Arc::new(hook));
        self
    }

    fn lock(&self) -> MutexGuard<'_, Inner<V>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn release(&self, removed: Vec<(TenantId, V)>) {
        if let Some(hook) = &self.teardown {
            for (tenant, value) in removed {
                tracing::debug!(tenant = %tenant, "tearing down tenant resource");
                hook(&tenant, value);
            }
        }
    }

    /// Look up a live entry, refreshing its recency. Expired entries are torn down.
    pub fn get(&self, tenant: &TenantId) -> Option<V> {
        let now = Instant::now();
        let mut removed = Vec::new();
        let hit = {
            let mut inner = self.lock();
            inner.tick += 1;
            let tick = inner.tick;
            let expired = match inner.entries.get_mut(tenant) {
                Some(entry) if now.duration_since(entry.last_used) > self.ttl => true,
                Some(entry) => {
                    entry.last_used = now;
                    entry.tick = tick;
                    return Some(entry.value.clone());
                }
                None => false,
            };
            if expired {
                if let Some(entry) = inner.entries.remove(tenant) {
                    removed.push((tenant.clone(), entry.value));
                }
            }
            None
        };
        self.release(removed);
        hit
    }

    /// Insert or replace a tenant's value, evicting the least recently used
    /// entry if the cache is full.
    pub fn insert(&self, tenant: TenantId, value: V) {
        let now = Instant::now();
        let mut removed = Vec::new();
        {
            let mut inner = self.lock();
            inner.tick += 1;
            let tick = inner.tick;

            if let Some(old) = inner.entries.remove(&tenant) {
                removed.push((tenant.clone(), old.value));
            }
            Self::drain_expired(&mut inner, now, self.ttl, &mut removed);

            while inner.entries.len() >= self.capacity {
                let lru = inner
                    .entries
                    .iter()
                    .min_by_key(|(_, e)| e.tick)
                    .map(|(k, _)| k.clone());
                match lru.and_then(|k| inner.entries.remove(&k).map(|e| (k, e.value))) {
                    Some(evicted) => {
                        tracing::debug!(tenant = %evicted.0, "evicting least recently used tenant");
                        removed.push(evicted);
                    }
                    None => break,
                }
            }

            inner.entries.insert(
                tenant,
                Entry {
                    value,
                    last_used: now,
                    tick,
                },
            );
        }
        self.release(removed);
    }

    /// Return the cached value or build one with `init`.
    ///
    /// If a concurrent caller filled the slot while `init` ran, the existing
    /// value wins and the freshly built one goes straight to teardown.
    pub async fn get_or_try_insert_with<F, Fut, E>(&self, tenant: &TenantId, init: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(value) = self.get(tenant) {
            return Ok(value);
        }
        let created = init().await?;
        if let Some(existing) = self.get(tenant) {
            self.release(vec![(tenant.clone(), created)]);
            return Ok(existing);
        }
        self.insert(tenant.clone(), created.clone());
        Ok(created)
    }

    /// Remove a tenant's entry and run the teardown hook. Returns `true` if present.
    pub fn teardown(&self, tenant: &TenantId) -> bool {
        let removed = self.lock().entries.remove(tenant);
        match removed {
            Some(entry) => {
                self.release(vec![(tenant.clone(), entry.value)]);
                true
            }
            None => false,
        }
    }

    /// Tear down every idle-expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let mut removed = Vec::new();
        {
            let mut inner = self.lock();
            Self::drain_expired(&mut inner, Instant::now(), self.ttl, &mut removed);
        }
        let count = removed.len();
        self.release(removed);
        count
    }

    /// Tear down everything (process shutdown).
    pub fn clear(&self) {
        let removed: Vec<(TenantId, V)> = self
            .lock()
            .entries
            .drain()
            .map(|(k, e)| (k, e.value))
            .collect();
        self.release(removed);
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn drain_expired(
        inner: &mut Inner<V>,
        now: Instant,
        ttl: Duration,
        removed: &mut Vec<(TenantId, V)>,
    ) {
        let expired: Vec<TenantId> = inner
            .entries
            .iter()
            .filter(|(_, e)| now.duration_since(e.last_used) > ttl)
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired {
            if let Some(entry) = inner.entries.remove(&key) {
                removed.push((key, entry.value));
            }
        }
    }
}

impl<V: Clone> std::fmt::Debug for TenantCache<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantCache")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .field("ttl", &self.ttl)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    fn recording_cache(capacity: usize, ttl: Duration) -> (TenantCache<u32>, Arc<StdMutex<Vec<String>>>) {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        let cache = TenantCache::new(capacity, ttl).with_teardown(move |tenant, value| {
            sink.lock().unwrap().push(format!("{tenant}:{value}"));
        });
        (cache, log)
    }

    fn t(id: &str) -> TenantId {
        TenantId::new(id)
    }

    #[test]
    fn evicts_least_recently_used_at_capacity() {
        let (cache, log) = recording_cache(2, Duration::from_secs(60));
        cache.insert(t("a"), 1);
        cache.insert(t("b"), 2);
        // touch a so b becomes the LRU entry
        assert_eq!(cache.get(&t("a")), Some(1));
        cache.insert(t("c"), 3);

        assert_eq!(cache.len(), 2);
        assert!(cache.get(&t("b")).is_none());
        assert_eq!(*log.lock().unwrap(), vec!["b:2".to_string()]);
    }

    #[test]
    fn expired_entries_are_torn_down_on_access() {
        let (cache, log) = recording_cache(4, Duration::from_millis(0));
        cache.insert(t("a"), 1);
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get(&t("a")).is_none());
        assert!(cache.is_empty());
        assert_eq!(*log.lock().unwrap(), vec!["a:1".to_string()]);
    }

    #[test]
    fn purge_expired_counts_removals() {
        let (cache, log) = recording_cache(4, Duration::from_millis(0));
        cache.insert(t("a"), 1);
        std::thread::sleep(Duration::from_millis(5));
        // inserting b drains the already-expired a
        cache.insert(t("b"), 2);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(log.lock().unwrap().len(), 2);
    }

    #[test]
    fn explicit_teardown_and_replacement_invoke_hook() {
        let (cache, log) = recording_cache(4, Duration::from_secs(60));
        cache.insert(t("a"), 1);
        cache.insert(t("a"), 2);
        assert!(cache.teardown(&t("a")));
        assert!(!cache.teardown(&t("a")));
        assert_eq!(
            *log.lock().unwrap(),
            vec!["a:1".to_string(), "a:2".to_string()]
        );
    }

    #[test]
    fn never_exceeds_capacity() {
        let (cache, log) = recording_cache(3, Duration::from_secs(60));
        for i in 0..10u32 {
            cache.insert(t(&format!("tenant-{i}")), i);
            assert!(cache.len() <= 3);
        }
        assert_eq!(log.lock().unwrap().len(), 7);
        cache.clear();
        assert_eq!(log.lock().unwrap().len(), 10);
    }

    #[tokio::test]
    async fn get_or_try_insert_with_builds_once() {
        let cache: TenantCache<u32> = TenantCache::new(4, Duration::from_secs(60));
        let v = cache
            .get_or_try_insert_with(&t("a"), || async { Ok::<_, String>(7) })
            .await
            .unwrap();
        assert_eq!(v, 7);

        let v = cache
            .get_or_try_insert_with(&t("a"), || async { Err::<u32, _>("should not run".to_string()) })
            .await
            .unwrap();
        assert_eq!(v, 7);
    }

    #[tokio::test]
    async fn init_errors_are_propagated_and_not_cached() {
        let cache: TenantCache<u32> = TenantCache::new(4, Duration::from_secs(60));
        let res = cache
            .get_or_try_insert_with(&t("a"), || async { Err::<u32, _>("boom") })
            .await;
        assert_eq!(res, Err("boom"));
        assert!(cache.is_empty());
    }
}
