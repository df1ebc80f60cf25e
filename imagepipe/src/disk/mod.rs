//! On-disk encoded image cache.
//!
//! Three layers, outermost first:
//!
//! - [`BufferedDiskCache`]: staging area plus executor dispatch
//! - [`DiskStorageCache`]: index, size tiers and eviction
//! - [`DiskStorage`]: the versioned, sharded directory tree

mod buffered;
mod config;
mod error;
pub mod eviction;
mod free_space;
pub mod index;
mod listener;
mod staging;
mod storage;
mod storage_cache;

pub use buffered::{BufferedDiskCache, DiskLookup, LookupCallback};
pub use config::{DiskCacheConfig, DEFAULT_VERY_LOW_SPACE_THRESHOLD};
pub use error::CacheError;
pub use eviction::{
    EntryEvictionComparator, EvictionReason, LruEvictionComparator, ScoreBasedEvictionComparator,
};
pub use free_space::{FixedFreeSpace, FreeSpaceProvider, StatvfsFreeSpace};
pub use listener::{CacheEventListener, NoOpCacheEventListener};
pub use staging::StagingArea;
pub use storage::{BinaryResource, DiskStorage};
pub use storage_cache::{DiskStorageCache, SpaceTier};
