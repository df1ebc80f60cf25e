//! Memory cache that counts client references.
//!
//! Every cached value is in one of two pools:
//!
//! ```text
//!   put / get ──► in use (client_count > 0)   never evicted
//!                     │  last client handle closes
//!                     ▼
//!               exclusive (LRU order)          evicted oldest-first
//!                     │  get
//!                     └──► back to in use
//! ```
//!
//! Replacing a key while clients still hold the old value orphans the old
//! entry: it leaves the cache immediately and is released when its last
//! client closes.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use lru::LruCache;
use parking_lot::Mutex;
use tracing::debug;

use super::params::{MemoryCacheParams, MemoryTrimType};
use super::MemoryCache;
use crate::resource::{ResourceHandle, ResourceReleaser};

/// Reports the size a value occupies in the cache.
pub trait ValueSizer<V>: Send + Sync {
    fn size_in_bytes(&self, value: &V) -> usize;
}

impl<V, F> ValueSizer<V> for F
where
    F: Fn(&V) -> usize + Send + Sync,
{
    fn size_in_bytes(&self, value: &V) -> usize {
        self(value)
    }
}

struct CacheEntry<V: Send + Sync + 'static> {
    id: u64,
    /// The cache's own reference.
    value: ResourceHandle<V>,
    size: usize,
    client_count: usize,
    is_orphan: bool,
}

struct CacheState<K, V: Send + Sync + 'static> {
    entries: HashMap<K, CacheEntry<V>>,
    /// Keys of entries with no clients, least recently released first.
    exclusive: LruCache<K, ()>,
    orphans: HashMap<u64, CacheEntry<V>>,
    total_size: usize,
    exclusive_size: usize,
    params: MemoryCacheParams,
    next_entry_id: u64,
}

impl<K: Eq + Hash + Clone, V: Send + Sync + 'static> CacheState<K, V> {
    fn in_use_count(&self) -> usize {
        self.entries.len() - self.exclusive.len()
    }

    fn in_use_size(&self) -> usize {
        self.total_size - self.exclusive_size
    }

    fn can_cache_new_value(&self, size: usize) -> bool {
        size <= self.params.max_cache_entry_size
            && self.in_use_count() < self.params.max_cache_entries
            && self.in_use_size() + size <= self.params.max_cache_size
    }

    fn remove_exclusive(&mut self, key: &K) {
        if self.exclusive.pop(key).is_some() {
            if let Some(entry) = self.entries.get(key) {
                self.exclusive_size -= entry.size;
            }
        }
    }

    fn remove_entry(&mut self, key: &K) -> Option<CacheEntry<V>> {
        self.remove_exclusive(key);
        let entry = self.entries.remove(key)?;
        self.total_size -= entry.size;
        Some(entry)
    }

    /// Parks `entry` until its clients close, or returns its handle to be
    /// closed now when it has none.
    fn make_orphan(&mut self, mut entry: CacheEntry<V>) -> Option<ResourceHandle<V>> {
        if entry.client_count == 0 {
            return Some(entry.value);
        }
        entry.is_orphan = true;
        self.orphans.insert(entry.id, entry);
        None
    }

    /// Evicts exclusive entries, oldest first, until both limits hold.
    fn trim_exclusively_owned(&mut self, max_count: usize, max_size: usize) -> Vec<ResourceHandle<V>> {
        let mut evicted = Vec::new();
        while self.exclusive.len() > max_count || self.exclusive_size > max_size {
            let Some((key, ())) = self.exclusive.pop_lru() else {
                break;
            };
            if let Some(entry) = self.entries.remove(&key) {
                self.exclusive_size -= entry.size;
                self.total_size -= entry.size;
                evicted.push(entry.value);
            }
        }
        evicted
    }
}

struct CacheInner<K, V: Send + Sync + 'static> {
    name: &'static str,
    state: Mutex<CacheState<K, V>>,
    sizer: Box<dyn ValueSizer<V>>,
    evictions: AtomicU64,
}

/// A size- and count-bounded cache of reference-counted values.
///
/// Handles returned by `get` and `put` are client handles: closing the
/// last one moves the entry to the exclusive pool, where it becomes
/// eligible for eviction. The lock is never held while a value is released.
pub struct CountingMemoryCache<K, V: Send + Sync + 'static> {
    inner: Arc<CacheInner<K, V>>,
}

impl<K, V: Send + Sync + 'static> Clone for CountingMemoryCache<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V> CountingMemoryCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    pub fn new(
        name: &'static str,
        params: MemoryCacheParams,
        sizer: impl ValueSizer<V> + 'static,
    ) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                name,
                state: Mutex::new(CacheState {
                    entries: HashMap::new(),
                    exclusive: LruCache::unbounded(),
                    orphans: HashMap::new(),
                    total_size: 0,
                    exclusive_size: 0,
                    params,
                    next_entry_id: 0,
                }),
                sizer: Box::new(sizer),
                evictions: AtomicU64::new(0),
            }),
        }
    }

    /// Builds a client handle over `pin`'s value.
    ///
    /// The client holds `pin` until its last clone closes, so the value
    /// outlives eviction or orphaning for as long as a client needs it.
    fn client_reference(
        &self,
        key: &K,
        entry_id: u64,
        shared: Arc<V>,
        pin: ResourceHandle<V>,
    ) -> ResourceHandle<V> {
        let cache: Weak<CacheInner<K, V>> = Arc::downgrade(&self.inner);
        let key = key.clone();
        let pin = Mutex::new(Some(pin));
        let releaser: Arc<dyn ResourceReleaser<V>> = Arc::new(move |_: &V| {
            if let Some(inner) = cache.upgrade() {
                CountingMemoryCache { inner }.release_client_reference(&key, entry_id);
            }
            drop(pin.lock().take());
        });
        ResourceHandle::of_shared(shared, releaser)
    }

    fn release_client_reference(&self, key: &K, entry_id: u64) {
        let to_close = {
            let mut state = self.inner.state.lock();
            let now_exclusive = match state.entries.get_mut(key) {
                Some(entry) if entry.id == entry_id => {
                    entry.client_count = entry.client_count.saturating_sub(1);
                    (entry.client_count == 0).then_some(entry.size)
                }
                _ => None,
            };

            if let Some(size) = now_exclusive {
                state.exclusive.put(key.clone(), ());
                state.exclusive_size += size;
                None
            } else {
                let orphan_done = match state.orphans.get_mut(&entry_id) {
                    Some(orphan) if orphan.is_orphan => {
                        orphan.client_count = orphan.client_count.saturating_sub(1);
                        orphan.client_count == 0
                    }
                    _ => false,
                };
                if orphan_done {
                    state.orphans.remove(&entry_id).map(|orphan| orphan.value)
                } else {
                    None
                }
            }
        };
        drop(to_close);
        self.maybe_evict_entries();
    }

    /// Returns a client handle to the value for `key`, if cached.
    pub fn get(&self, key: &K) -> Option<ResourceHandle<V>> {
        let client = {
            let mut state = self.inner.state.lock();
            state.remove_exclusive(key);
            let entry = state.entries.get_mut(key)?;
            let pin = entry.value.try_clone().ok()?;
            let shared = Arc::clone(pin.shared_value()?);
            entry.client_count += 1;
            let id = entry.id;
            drop(state);
            self.client_reference(key, id, shared, pin)
        };
        self.maybe_evict_entries();
        Some(client)
    }

    /// Caches `value` under `key`, replacing any previous entry.
    ///
    /// Returns a client handle to the cached value, or `None` when the
    /// value cannot be cached: it exceeds the per-entry cap, or entries in
    /// use already fill the cache. The caller's handle is unaffected.
    pub fn put(&self, key: K, value: &ResourceHandle<V>) -> Option<ResourceHandle<V>> {
        let size = self.inner.sizer.size_in_bytes(value.get().ok()?);

        let (client, replaced) = {
            let mut state = self.inner.state.lock();
            let replaced = state
                .remove_entry(&key)
                .and_then(|old| state.make_orphan(old));

            let mut client = None;
            if state.can_cache_new_value(size) {
                let own = value.clone_or_none();
                let pin = own.as_ref().and_then(ResourceHandle::clone_or_none);
                let shared = own.as_ref().and_then(|h| h.shared_value().cloned());
                if let (Some(own), Some(pin), Some(shared)) = (own, pin, shared) {
                    let id = state.next_entry_id;
                    state.next_entry_id += 1;
                    state.total_size += size;
                    state.entries.insert(
                        key.clone(),
                        CacheEntry {
                            id,
                            value: own,
                            size,
                            client_count: 1,
                            is_orphan: false,
                        },
                    );
                    client = Some((id, shared, pin));
                }
            }
            (client, replaced)
        };
        drop(replaced);

        let client = client.map(|(id, shared, pin)| self.client_reference(&key, id, shared, pin));
        self.maybe_evict_entries();
        client
    }

    /// Marks `key` as recently used without taking a reference.
    pub fn probe(&self, key: &K) {
        self.inner.state.lock().exclusive.promote(key);
    }

    pub fn contains(&self, key: &K) -> bool {
        self.inner.state.lock().entries.contains_key(key)
    }

    pub fn contains_matching(&self, predicate: &dyn Fn(&K) -> bool) -> bool {
        self.inner.state.lock().entries.keys().any(predicate)
    }

    /// Removes every entry whose key matches. Entries still in use are
    /// orphaned. Returns the number removed.
    pub fn remove_all(&self, predicate: &dyn Fn(&K) -> bool) -> usize {
        let (removed, to_close) = {
            let mut state = self.inner.state.lock();
            let keys: Vec<K> = state.entries.keys().filter(|k| predicate(k)).cloned().collect();
            let mut to_close = Vec::new();
            for key in &keys {
                if let Some(entry) = state.remove_entry(key) {
                    to_close.extend(state.make_orphan(entry));
                }
            }
            (keys.len(), to_close)
        };
        if removed > 0 {
            debug!(cache = self.inner.name, removed, "removed memory cache entries");
        }
        drop(to_close);
        removed
    }

    pub fn clear(&self) -> usize {
        self.remove_all(&|_| true)
    }

    /// Drops exclusive entries in response to memory pressure.
    pub fn trim(&self, trim_type: MemoryTrimType) {
        let evicted = {
            let mut state = self.inner.state.lock();
            let target_cache_size =
                (state.total_size as f64 * (1.0 - trim_type.trim_ratio())).max(0.0) as usize;
            let target_queue_size = target_cache_size.saturating_sub(state.in_use_size());
            state.trim_exclusively_owned(usize::MAX, target_queue_size)
        };
        self.record_evictions(evicted, "trim");
    }

    pub fn set_params(&self, params: MemoryCacheParams) {
        self.inner.state.lock().params = params;
        self.maybe_evict_entries();
    }

    pub fn params(&self) -> MemoryCacheParams {
        self.inner.state.lock().params
    }

    /// Evicts until the exclusive pool fits in what in-use entries leave.
    pub fn maybe_evict_entries(&self) {
        let evicted = {
            let mut state = self.inner.state.lock();
            let params = state.params;
            let max_count = params
                .max_eviction_queue_entries
                .min(params.max_cache_entries.saturating_sub(state.in_use_count()));
            let max_size = params
                .max_eviction_queue_size
                .min(params.max_cache_size.saturating_sub(state.in_use_size()));
            state.trim_exclusively_owned(max_count, max_size)
        };
        self.record_evictions(evicted, "limit");
    }

    fn record_evictions(&self, evicted: Vec<ResourceHandle<V>>, reason: &'static str) {
        if evicted.is_empty() {
            return;
        }
        self.inner
            .evictions
            .fetch_add(evicted.len() as u64, Ordering::Relaxed);
        debug!(
            cache = self.inner.name,
            count = evicted.len(),
            reason,
            "evicted memory cache entries"
        );
        drop(evicted);
    }

    pub fn count(&self) -> usize {
        self.inner.state.lock().entries.len()
    }

    pub fn size_in_bytes(&self) -> usize {
        self.inner.state.lock().total_size
    }

    pub fn in_use_count(&self) -> usize {
        self.inner.state.lock().in_use_count()
    }

    pub fn in_use_size_in_bytes(&self) -> usize {
        self.inner.state.lock().in_use_size()
    }

    pub fn eviction_queue_count(&self) -> usize {
        self.inner.state.lock().exclusive.len()
    }

    pub fn eviction_queue_size_in_bytes(&self) -> usize {
        self.inner.state.lock().exclusive_size
    }

    /// Entries removed from the cache that clients still hold.
    pub fn orphan_count(&self) -> usize {
        self.inner.state.lock().orphans.len()
    }

    pub fn eviction_count(&self) -> u64 {
        self.inner.evictions.load(Ordering::Relaxed)
    }

    pub fn name(&self) -> &'static str {
        self.inner.name
    }
}

impl<K, V> MemoryCache<K, V> for CountingMemoryCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    fn get(&self, key: &K) -> Option<ResourceHandle<V>> {
        CountingMemoryCache::get(self, key)
    }

    fn put(&self, key: K, value: &ResourceHandle<V>) -> Option<ResourceHandle<V>> {
        CountingMemoryCache::put(self, key, value)
    }

    fn probe(&self, key: &K) {
        CountingMemoryCache::probe(self, key)
    }

    fn contains(&self, key: &K) -> bool {
        CountingMemoryCache::contains(self, key)
    }

    fn contains_matching(&self, predicate: &dyn Fn(&K) -> bool) -> bool {
        CountingMemoryCache::contains_matching(self, predicate)
    }

    fn remove_all(&self, predicate: &dyn Fn(&K) -> bool) -> usize {
        CountingMemoryCache::remove_all(self, predicate)
    }

    fn trim(&self, trim_type: MemoryTrimType) {
        CountingMemoryCache::trim(self, trim_type)
    }

    fn count(&self) -> usize {
        CountingMemoryCache::count(self)
    }

    fn size_in_bytes(&self) -> usize {
        CountingMemoryCache::size_in_bytes(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    const KB: usize = 1024;

    struct Tracked {
        releases: Arc<AtomicUsize>,
    }

    impl Tracked {
        fn new() -> Self {
            Self {
                releases: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn value(&self, size: usize) -> ResourceHandle<Vec<u8>> {
            let releases = Arc::clone(&self.releases);
            ResourceHandle::new(vec![0u8; size], move |_: &Vec<u8>| {
                releases.fetch_add(1, Ordering::SeqCst);
            })
        }

        fn released(&self) -> usize {
            self.releases.load(Ordering::SeqCst)
        }
    }

    fn create_test_cache(max_size: usize, max_entries: usize) -> CountingMemoryCache<String, Vec<u8>> {
        CountingMemoryCache::new(
            "test",
            MemoryCacheParams::new(max_size, max_entries),
            |v: &Vec<u8>| v.len(),
        )
    }

    fn key(name: &str) -> String {
        name.to_string()
    }

    #[test]
    fn test_put_and_get() {
        let cache = create_test_cache(10 * KB, 10);
        let tracked = Tracked::new();
        let mut original = tracked.value(KB);

        let mut client = cache.put(key("a"), &original).unwrap();
        original.close().unwrap();
        assert_eq!(cache.count(), 1);
        assert_eq!(cache.in_use_count(), 1);

        let mut second = cache.get(&key("a")).unwrap();
        assert_eq!(second.get().unwrap().len(), KB);

        client.close().unwrap();
        assert_eq!(cache.eviction_queue_count(), 0);
        second.close().unwrap();
        assert_eq!(cache.eviction_queue_count(), 1);
        assert_eq!(cache.eviction_queue_size_in_bytes(), KB);
        assert_eq!(tracked.released(), 0);
    }

    #[test]
    fn test_miss_returns_none() {
        let cache = create_test_cache(10 * KB, 10);
        assert!(cache.get(&key("missing")).is_none());
        assert!(!cache.contains(&key("missing")));
    }

    #[test]
    fn test_oversized_value_not_cached() {
        let cache = CountingMemoryCache::new(
            "test",
            MemoryCacheParams::new(10 * KB, 10).with_max_entry_size(KB),
            |v: &Vec<u8>| v.len(),
        );
        let tracked = Tracked::new();
        let value = tracked.value(2 * KB);
        assert!(cache.put(key("big"), &value).is_none());
        assert_eq!(cache.count(), 0);
        assert!(value.is_valid());
    }

    #[test]
    fn test_eviction_scenario_k1_k2() {
        let cache = create_test_cache(150 * KB, 10);
        let tracked = Tracked::new();

        let v1 = tracked.value(100 * KB);
        let c1 = cache.put(key("k1"), &v1).unwrap();
        drop(v1);
        drop(c1);
        assert_eq!(cache.eviction_queue_count(), 1);

        let v2 = tracked.value(100 * KB);
        let c2 = cache.put(key("k2"), &v2).unwrap();
        drop(v2);

        assert!(!cache.contains(&key("k1")));
        assert!(cache.contains(&key("k2")));
        assert_eq!(tracked.released(), 1);
        assert_eq!(cache.size_in_bytes(), 100 * KB);
        drop(c2);
    }

    #[test]
    fn test_shared_entries_never_evicted() {
        let cache = create_test_cache(150 * KB, 10);
        let tracked = Tracked::new();

        let v1 = tracked.value(100 * KB);
        let c1 = cache.put(key("k1"), &v1).unwrap();
        let v2 = tracked.value(100 * KB);
        let c2 = cache.put(key("k2"), &v2);

        // Entries in use fill the cache; the second value is rejected.
        assert!(c2.is_none());
        assert!(cache.contains(&key("k1")));
        assert_eq!(tracked.released(), 0);
        drop((v1, c1, v2));
    }

    #[test]
    fn test_lru_order_of_exclusive_entries() {
        let cache = create_test_cache(3 * KB, 10);
        let tracked = Tracked::new();

        for name in ["a", "b", "c"] {
            let value = tracked.value(KB);
            drop(cache.put(key(name), &value));
        }
        // Touch "a" so "b" is now the oldest exclusive entry.
        cache.probe(&key("a"));

        let value = tracked.value(KB);
        drop(cache.put(key("d"), &value));

        assert!(cache.contains(&key("a")));
        assert!(!cache.contains(&key("b")));
        assert!(cache.contains(&key("c")));
        assert!(cache.contains(&key("d")));
    }

    #[test]
    fn test_replacing_key_orphans_old_entry() {
        let cache = create_test_cache(10 * KB, 10);
        let old_tracker = Tracked::new();
        let new_tracker = Tracked::new();

        let old_value = old_tracker.value(KB);
        let old_client = cache.put(key("a"), &old_value).unwrap();
        drop(old_value);

        let new_value = new_tracker.value(2 * KB);
        let new_client = cache.put(key("a"), &new_value).unwrap();
        drop(new_value);

        assert_eq!(cache.orphan_count(), 1);
        assert_eq!(cache.count(), 1);
        assert_eq!(old_tracker.released(), 0);
        assert_eq!(old_client.get().unwrap().len(), KB);

        drop(old_client);
        assert_eq!(cache.orphan_count(), 0);
        assert_eq!(old_tracker.released(), 1);
        assert_eq!(new_client.get().unwrap().len(), 2 * KB);
    }

    #[test]
    fn test_remove_all_by_predicate() {
        let cache = create_test_cache(10 * KB, 10);
        let tracked = Tracked::new();
        for name in ["img/a", "img/b", "other"] {
            let value = tracked.value(KB);
            drop(cache.put(key(name), &value));
        }

        let removed = cache.remove_all(&|k: &String| k.starts_with("img/"));
        assert_eq!(removed, 2);
        assert_eq!(cache.count(), 1);
        assert_eq!(tracked.released(), 2);
        assert!(cache.contains_matching(&|k: &String| k == "other"));
    }

    #[test]
    fn test_trim_drops_exclusive_entries() {
        let cache = create_test_cache(10 * KB, 10);
        let tracked = Tracked::new();
        for name in ["a", "b", "c", "d"] {
            let value = tracked.value(KB);
            drop(cache.put(key(name), &value));
        }
        let value = tracked.value(KB);
        let held = cache.put(key("held"), &value).unwrap();

        cache.trim(MemoryTrimType::Moderate);
        assert!(cache.size_in_bytes() <= 3 * KB);
        assert!(cache.contains(&key("held")));

        cache.trim(MemoryTrimType::Critical);
        assert_eq!(cache.count(), 1);
        assert!(cache.contains(&key("held")));
        drop((held, value));
    }

    #[test]
    fn test_entry_count_limit() {
        let cache = create_test_cache(100 * KB, 2);
        let tracked = Tracked::new();
        for name in ["a", "b", "c"] {
            let value = tracked.value(KB);
            drop(cache.put(key(name), &value));
        }
        assert_eq!(cache.count(), 2);
        assert!(!cache.contains(&key("a")));
        assert_eq!(cache.eviction_count(), 1);
    }

    #[test]
    fn test_set_params_shrinks_cache() {
        let cache = create_test_cache(10 * KB, 10);
        let tracked = Tracked::new();
        for name in ["a", "b", "c"] {
            let value = tracked.value(KB);
            drop(cache.put(key(name), &value));
        }
        cache.set_params(MemoryCacheParams::new(KB, 10));
        assert_eq!(cache.count(), 1);
        assert!(cache.contains(&key("c")));
    }

    #[test]
    fn test_client_outliving_cache_is_safe() {
        let tracked = Tracked::new();
        let client = {
            let cache = create_test_cache(10 * KB, 10);
            let value = tracked.value(KB);
            cache.put(key("a"), &value).unwrap()
        };
        assert_eq!(client.get().unwrap().len(), KB);
        assert_eq!(tracked.released(), 0);
        drop(client);
        assert_eq!(tracked.released(), 1);
    }
}
