//! In-memory caches for decoded images and encoded bytes.

mod counting;
mod instrumented;
mod params;

pub use counting::{CountingMemoryCache, ValueSizer};
pub use instrumented::{InstrumentedMemoryCache, MemoryTier};
pub use params::{MemoryCacheParams, MemoryTrimType};

use crate::image::{DecodedImage, EncodedBytes};
use crate::key::CacheKey;
use crate::resource::ResourceHandle;

/// Operations the pipeline needs from a memory cache.
pub trait MemoryCache<K, V: Send + Sync + 'static>: Send + Sync {
    fn get(&self, key: &K) -> Option<ResourceHandle<V>>;

    /// Caches `value`; see [`CountingMemoryCache::put`].
    fn put(&self, key: K, value: &ResourceHandle<V>) -> Option<ResourceHandle<V>>;

    fn probe(&self, key: &K);

    fn contains(&self, key: &K) -> bool;

    fn contains_matching(&self, predicate: &dyn Fn(&K) -> bool) -> bool;

    fn remove_all(&self, predicate: &dyn Fn(&K) -> bool) -> usize;

    fn trim(&self, trim_type: MemoryTrimType);

    fn count(&self) -> usize;

    fn size_in_bytes(&self) -> usize;
}

/// The decoded image cache as seen by producers.
pub type DecodedMemoryCache = dyn MemoryCache<CacheKey, DecodedImage>;

/// The encoded bytes cache as seen by producers.
pub type EncodedMemoryCache = dyn MemoryCache<CacheKey, EncodedBytes>;
