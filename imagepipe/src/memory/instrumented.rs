//! Memory cache decorator reporting hits, misses and puts.

use std::sync::Arc;

use super::params::MemoryTrimType;
use super::MemoryCache;
use crate::key::CacheKey;
use crate::resource::ResourceHandle;
use crate::stats::CacheStatsTracker;

/// Which tier a memory cache serves, for stats routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryTier {
    Decoded,
    Encoded,
}

/// Wraps a memory cache and reports every lookup to a stats tracker.
pub struct InstrumentedMemoryCache<V: Send + Sync + 'static> {
    inner: Arc<dyn MemoryCache<CacheKey, V>>,
    tracker: Arc<dyn CacheStatsTracker>,
    tier: MemoryTier,
}

impl<V: Send + Sync + 'static> InstrumentedMemoryCache<V> {
    pub fn new(
        inner: Arc<dyn MemoryCache<CacheKey, V>>,
        tracker: Arc<dyn CacheStatsTracker>,
        tier: MemoryTier,
    ) -> Self {
        Self {
            inner,
            tracker,
            tier,
        }
    }

    fn on_hit(&self, key: &CacheKey) {
        match self.tier {
            MemoryTier::Decoded => self.tracker.on_decoded_cache_hit(key),
            MemoryTier::Encoded => self.tracker.on_encoded_cache_hit(key),
        }
    }

    fn on_miss(&self, key: &CacheKey) {
        match self.tier {
            MemoryTier::Decoded => self.tracker.on_decoded_cache_miss(key),
            MemoryTier::Encoded => self.tracker.on_encoded_cache_miss(key),
        }
    }

    fn on_put(&self, key: &CacheKey) {
        match self.tier {
            MemoryTier::Decoded => self.tracker.on_decoded_cache_put(key),
            MemoryTier::Encoded => self.tracker.on_encoded_cache_put(key),
        }
    }
}

impl<V: Send + Sync + 'static> MemoryCache<CacheKey, V> for InstrumentedMemoryCache<V> {
    fn get(&self, key: &CacheKey) -> Option<ResourceHandle<V>> {
        let result = self.inner.get(key);
        match result {
            Some(_) => self.on_hit(key),
            None => self.on_miss(key),
        }
        result
    }

    fn put(&self, key: CacheKey, value: &ResourceHandle<V>) -> Option<ResourceHandle<V>> {
        self.on_put(&key);
        self.inner.put(key, value)
    }

    fn probe(&self, key: &CacheKey) {
        self.inner.probe(key)
    }

    fn contains(&self, key: &CacheKey) -> bool {
        self.inner.contains(key)
    }

    fn contains_matching(&self, predicate: &dyn Fn(&CacheKey) -> bool) -> bool {
        self.inner.contains_matching(predicate)
    }

    fn remove_all(&self, predicate: &dyn Fn(&CacheKey) -> bool) -> usize {
        self.inner.remove_all(predicate)
    }

    fn trim(&self, trim_type: MemoryTrimType) {
        self.inner.trim(trim_type)
    }

    fn count(&self) -> usize {
        self.inner.count()
    }

    fn size_in_bytes(&self) -> usize {
        self.inner.size_in_bytes()
    }
}
