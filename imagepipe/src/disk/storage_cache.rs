//! Size-bounded, indexed disk store.

use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::config::DiskCacheConfig;
use super::error::CacheError;
use super::eviction::{EntryEvictionComparator, EvictionReason, LruEvictionComparator};
use super::free_space::{FreeSpaceProvider, StatvfsFreeSpace};
use super::index::DiskIndex;
use super::listener::{CacheEventListener, NoOpCacheEventListener};
use super::storage::{BinaryResource, DiskStorage};
use crate::executor::Executor;
use crate::key::CacheKey;

/// Eviction stops once the cache is at this fraction of its limit.
const EVICTION_TARGET_PERCENTAGE: f64 = 0.98;

/// Which size limit currently applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpaceTier {
    Normal,
    /// Free space could not accommodate growth to `max_size`.
    Low,
    /// Free space is below `very_low_space_threshold`.
    VeryLow,
}

/// Disk store with an in-memory index, tiered size limits and eviction.
pub struct DiskStorageCache {
    config: DiskCacheConfig,
    storage: DiskStorage,
    index: DiskIndex,
    comparator: Arc<dyn EntryEvictionComparator>,
    free_space: Arc<dyn FreeSpaceProvider>,
    listener: Arc<dyn CacheEventListener>,
    /// Serializes index population against index updates from writes.
    index_lock: Mutex<()>,
    /// Serializes eviction passes.
    eviction_lock: Mutex<()>,
}

impl DiskStorageCache {
    pub fn open(config: DiskCacheConfig) -> Result<Self, CacheError> {
        config.validate()?;
        let storage = DiskStorage::open(&config.base_directory, &config.version)?;
        info!(
            root = %storage.root().display(),
            max_size = config.max_size,
            "Opened disk cache"
        );
        Ok(Self {
            config,
            storage,
            index: DiskIndex::new(),
            comparator: Arc::new(LruEvictionComparator),
            free_space: Arc::new(StatvfsFreeSpace),
            listener: Arc::new(NoOpCacheEventListener),
            index_lock: Mutex::new(()),
            eviction_lock: Mutex::new(()),
        })
    }

    pub fn with_comparator(mut self, comparator: Arc<dyn EntryEvictionComparator>) -> Self {
        self.comparator = comparator;
        self
    }

    pub fn with_free_space_provider(mut self, provider: Arc<dyn FreeSpaceProvider>) -> Self {
        self.free_space = provider;
        self
    }

    pub fn with_listener(mut self, listener: Arc<dyn CacheEventListener>) -> Self {
        self.listener = listener;
        self
    }

    pub fn config(&self) -> &DiskCacheConfig {
        &self.config
    }

    pub fn root(&self) -> &Path {
        self.storage.root()
    }

    /// Scans the tree and rebuilds the index. Returns the entry count.
    pub fn populate_index(&self) -> Result<usize, CacheError> {
        let _guard = self.index_lock.lock();
        let scan = self.storage.scan()?;
        let count = scan.entries.len();
        self.index.populate(scan.entries);
        info!(
            root = %self.storage.root().display(),
            entries = count,
            size_bytes = self.index.total_size(),
            "Disk cache index populated"
        );
        Ok(count)
    }

    /// Populates the index on `executor` without blocking the caller.
    pub fn populate_in_background(self: &Arc<Self>, executor: &dyn Executor) {
        let cache = Arc::clone(self);
        executor.execute(Box::new(move || {
            if let Err(e) = cache.populate_index() {
                warn!(error = %e, "Disk cache index population failed");
            }
        }));
    }

    fn ensure_populated(&self) {
        if self.index.is_populated() {
            return;
        }
        if let Err(e) = self.populate_index() {
            warn!(error = %e, "Disk cache index population failed");
        }
    }

    /// Looks up `key`, recording the access.
    pub fn get_resource(&self, key: &CacheKey) -> Option<BinaryResource> {
        self.ensure_populated();
        let resource_id = key.resource_id();
        match self.storage.resource(&resource_id) {
            Some(resource) => {
                self.record_access(&resource_id, &resource);
                self.listener.on_hit(key);
                Some(resource)
            }
            None => {
                // The file can vanish under us, e.g. removed by hand.
                self.index.remove(&resource_id);
                self.listener.on_miss(key);
                None
            }
        }
    }

    fn record_access(&self, resource_id: &str, resource: &BinaryResource) {
        let now = SystemTime::now();
        if !self.index.contains(resource_id) {
            let _guard = self.index_lock.lock();
            self.index.record(resource_id, resource.size(), now);
        } else {
            self.index.touch(resource_id, now);
        }
        if let Err(e) = self.storage.touch(resource_id, now) {
            debug!(resource_id, error = %e, "Failed to update access time");
        }
    }

    /// Writes a new entry for `key` through `writer`.
    ///
    /// The size limit is re-evaluated and enforced before the write.
    pub fn insert<F>(&self, key: &CacheKey, writer: F) -> Result<BinaryResource, CacheError>
    where
        F: FnOnce(&mut dyn Write) -> io::Result<()>,
    {
        self.ensure_populated();
        self.listener.on_write_attempt(key);
        self.maybe_evict();

        let resource_id = key.resource_id();
        match self.storage.write(&resource_id, writer) {
            Ok(resource) => {
                {
                    let _guard = self.index_lock.lock();
                    self.index
                        .record(&resource_id, resource.size(), SystemTime::now());
                }
                self.listener.on_write_success(key, resource.size());
                debug!(key = %key, size = resource.size(), "Wrote disk cache entry");
                Ok(resource)
            }
            Err(e) => {
                self.listener.on_write_exception(key, &e);
                Err(e)
            }
        }
    }

    pub fn remove(&self, key: &CacheKey) -> Result<(), CacheError> {
        let resource_id = key.resource_id();
        self.storage.remove(&resource_id)?;
        self.index.remove(&resource_id);
        Ok(())
    }

    /// Index-only check; never touches the filesystem.
    pub fn has_key_sync(&self, key: &CacheKey) -> bool {
        self.index.contains(&key.resource_id())
    }

    /// Checks the index, falling back to the filesystem.
    pub fn has_key(&self, key: &CacheKey) -> bool {
        self.ensure_populated();
        let resource_id = key.resource_id();
        if self.index.contains(&resource_id) {
            return true;
        }
        match self.storage.resource(&resource_id) {
            Some(resource) => {
                let _guard = self.index_lock.lock();
                self.index
                    .record(&resource_id, resource.size(), SystemTime::now());
                true
            }
            None => false,
        }
    }

    /// Like `has_key` but also records an access on a hit.
    pub fn probe(&self, key: &CacheKey) -> bool {
        self.ensure_populated();
        let resource_id = key.resource_id();
        match self.storage.resource(&resource_id) {
            Some(resource) => {
                self.record_access(&resource_id, &resource);
                true
            }
            None => false,
        }
    }

    pub fn clear_all(&self) -> Result<(), CacheError> {
        let _guard = self.index_lock.lock();
        let result = self.storage.clear_all();
        self.index.clear();
        self.listener.on_cleared();
        info!(root = %self.storage.root().display(), "Cleared disk cache");
        result
    }

    /// Removes entries not accessed within `max_age`.
    ///
    /// Returns the age of the oldest remaining entry.
    pub fn clear_old_entries(&self, max_age: Duration) -> Duration {
        self.ensure_populated();
        let _guard = self.eviction_lock.lock();
        let now = SystemTime::now();
        let mut oldest_remaining = Duration::ZERO;
        let mut removed = 0usize;

        for candidate in self.index.candidates() {
            let age = now
                .duration_since(candidate.metadata.last_accessed)
                .unwrap_or(Duration::ZERO);
            if age >= max_age {
                if self.evict_one(&candidate.resource_id, EvictionReason::ContentStale) {
                    removed += 1;
                }
            } else {
                oldest_remaining = oldest_remaining.max(age);
            }
        }

        if removed > 0 {
            info!(removed, max_age_secs = max_age.as_secs(), "Removed stale disk cache entries");
        }
        oldest_remaining
    }

    /// Drops stale entries (when a max age is configured) and enforces the
    /// current size limit. Returns the number of entries removed.
    pub fn prune(&self) -> usize {
        self.ensure_populated();
        let before = self.index.entry_count();
        if let Some(max_age) = self.config.max_age {
            self.clear_old_entries(max_age);
        }
        self.maybe_evict();
        before.saturating_sub(self.index.entry_count())
    }

    /// Shrinks to the very-low-space limit.
    pub fn trim_to_minimum(&self) {
        self.ensure_populated();
        let minimum = self.config.very_low_space_max_size;
        if self.index.total_size() > minimum {
            self.evict_to(minimum, EvictionReason::CacheManagerTrimmed);
        }
    }

    pub fn trim_to_nothing(&self) -> Result<(), CacheError> {
        self.clear_all()
    }

    pub fn size(&self) -> u64 {
        self.ensure_populated();
        self.index.total_size()
    }

    pub fn count(&self) -> usize {
        self.ensure_populated();
        self.index.entry_count()
    }

    pub fn space_tier(&self) -> SpaceTier {
        let Some(available) = self.free_space.available_bytes(self.storage.root()) else {
            return SpaceTier::Normal;
        };
        if available < self.config.very_low_space_threshold {
            SpaceTier::VeryLow
        } else if available < self.config.max_size.saturating_sub(self.index.total_size()) {
            SpaceTier::Low
        } else {
            SpaceTier::Normal
        }
    }

    /// The size limit for the current free-space tier.
    pub fn effective_size_limit(&self) -> u64 {
        match self.space_tier() {
            SpaceTier::Normal => self.config.max_size,
            SpaceTier::Low => self.config.low_space_max_size,
            SpaceTier::VeryLow => self.config.very_low_space_max_size,
        }
    }

    fn maybe_evict(&self) {
        let limit = self.effective_size_limit();
        if self.index.total_size() > limit {
            let target = (limit as f64 * EVICTION_TARGET_PERCENTAGE) as u64;
            self.evict_to(target, EvictionReason::CacheFull);
        }
    }

    fn evict_to(&self, target: u64, reason: EvictionReason) {
        let _guard = self.eviction_lock.lock();
        let size_before = self.index.total_size();
        if size_before <= target {
            return;
        }

        let mut candidates = self.index.candidates();
        self.comparator.sort(&mut candidates, SystemTime::now());

        let mut evicted = 0usize;
        for candidate in candidates {
            if self.index.total_size() <= target {
                break;
            }
            if self.evict_one(&candidate.resource_id, reason) {
                evicted += 1;
            }
        }

        info!(
            %reason,
            evicted,
            size_before,
            size_after = self.index.total_size(),
            target,
            "Disk cache eviction complete"
        );
    }

    fn evict_one(&self, resource_id: &str, reason: EvictionReason) -> bool {
        match self.storage.remove(resource_id) {
            Ok(_) => {
                let size = self
                    .index
                    .remove(resource_id)
                    .map_or(0, |m| m.size_bytes);
                self.listener.on_eviction(resource_id, reason, size);
                true
            }
            Err(e) => {
                warn!(resource_id, error = %e, "Failed to evict disk cache entry");
                false
            }
        }
    }
}
