//! Memory cache limits and trim policy.

/// Bytes in one megabyte.
const MB: usize = 1024 * 1024;

/// Limits for a [`CountingMemoryCache`](super::CountingMemoryCache).
///
/// `max_cache_size` and `max_cache_entries` bound every entry, shared or
/// not. The eviction queue limits bound only exclusively owned entries,
/// which are the only ones eviction may remove.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryCacheParams {
    pub max_cache_size: usize,
    pub max_cache_entries: usize,
    pub max_eviction_queue_size: usize,
    pub max_eviction_queue_entries: usize,
    pub max_cache_entry_size: usize,
}

impl MemoryCacheParams {
    /// Limits with the eviction queue and entry caps equal to the totals.
    pub fn new(max_cache_size: usize, max_cache_entries: usize) -> Self {
        Self {
            max_cache_size,
            max_cache_entries,
            max_eviction_queue_size: max_cache_size,
            max_eviction_queue_entries: max_cache_entries,
            max_cache_entry_size: max_cache_size,
        }
    }

    pub fn with_eviction_queue(mut self, size: usize, entries: usize) -> Self {
        self.max_eviction_queue_size = size;
        self.max_eviction_queue_entries = entries;
        self
    }

    pub fn with_max_entry_size(mut self, size: usize) -> Self {
        self.max_cache_entry_size = size;
        self
    }

    /// Defaults for the decoded image cache.
    pub fn decoded_default() -> Self {
        Self::new(128 * MB, 256)
    }

    /// Defaults for the encoded bytes cache.
    pub fn encoded_default() -> Self {
        Self::new(16 * MB, 512).with_max_entry_size(4 * MB)
    }
}

impl Default for MemoryCacheParams {
    fn default() -> Self {
        Self::decoded_default()
    }
}

/// How aggressively to shrink a cache in response to memory pressure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryTrimType {
    /// The system is moderately low on memory.
    Moderate,
    /// The application moved to the background.
    AppBackgrounded,
    /// The system is running low on memory.
    SystemLow,
    /// Memory is critically low; drop everything that can be dropped.
    Critical,
}

impl MemoryTrimType {
    /// Fraction of the cache to drop.
    pub fn trim_ratio(&self) -> f64 {
        match self {
            Self::Moderate | Self::SystemLow => 0.5,
            Self::AppBackgrounded | Self::Critical => 1.0,
        }
    }
}
