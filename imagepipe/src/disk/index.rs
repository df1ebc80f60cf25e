//! In-memory index of disk cache entries.
//!
//! Tracks size and last access per resource id so eviction never has to
//! walk the directory tree. The index is ephemeral: it is rebuilt from the
//! tree (using file mtimes as access times) when the cache starts.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::SystemTime;

use dashmap::DashMap;

use super::storage::StoredEntry;

/// Metadata kept per entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryMetadata {
    pub size_bytes: u64,
    pub last_accessed: SystemTime,
}

/// An entry considered for eviction.
#[derive(Debug, Clone)]
pub struct EvictionCandidate {
    pub resource_id: String,
    pub metadata: EntryMetadata,
}

/// Thread-safe index keyed by resource id.
#[derive(Debug, Default)]
pub struct DiskIndex {
    entries: DashMap<String, EntryMetadata>,
    total_size: AtomicU64,
    populated: AtomicBool,
}

impl DiskIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a new entry or replaces an existing one.
    pub fn record(&self, resource_id: &str, size: u64, now: SystemTime) {
        let metadata = EntryMetadata {
            size_bytes: size,
            last_accessed: now,
        };
        if let Some(old) = self.entries.insert(resource_id.to_string(), metadata) {
            self.total_size.fetch_sub(old.size_bytes, Ordering::Relaxed);
        }
        self.total_size.fetch_add(size, Ordering::Relaxed);
    }

    /// Updates the access time. Does nothing for unknown ids.
    pub fn touch(&self, resource_id: &str, now: SystemTime) {
        if let Some(mut entry) = self.entries.get_mut(resource_id) {
            entry.last_accessed = now;
        }
    }

    pub fn remove(&self, resource_id: &str) -> Option<EntryMetadata> {
        let (_, metadata) = self.entries.remove(resource_id)?;
        self.total_size
            .fetch_sub(metadata.size_bytes, Ordering::Relaxed);
        Some(metadata)
    }

    pub fn contains(&self, resource_id: &str) -> bool {
        self.entries.contains_key(resource_id)
    }

    pub fn get(&self, resource_id: &str) -> Option<EntryMetadata> {
        self.entries.get(resource_id).map(|e| *e.value())
    }

    pub fn total_size(&self) -> u64 {
        self.total_size.load(Ordering::Relaxed)
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Every entry, unordered.
    pub fn candidates(&self) -> Vec<EvictionCandidate> {
        self.entries
            .iter()
            .map(|e| EvictionCandidate {
                resource_id: e.key().clone(),
                metadata: *e.value(),
            })
            .collect()
    }

    /// Replaces the contents with scanned entries and marks the index
    /// populated.
    pub fn populate(&self, scanned: Vec<StoredEntry>) {
        self.clear();
        for entry in scanned {
            self.record(&entry.resource_id, entry.size, entry.modified);
        }
        self.populated.store(true, Ordering::Release);
    }

    pub fn is_populated(&self) -> bool {
        self.populated.load(Ordering::Acquire)
    }

    pub fn clear(&self) {
        self.entries.clear();
        self.total_size.store(0, Ordering::Relaxed);
    }
}
