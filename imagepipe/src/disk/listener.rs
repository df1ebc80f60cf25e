use crate::key::CacheKey;

use super::error::CacheError;
use super::eviction::EvictionReason;

/// Disk cache events. Observers only; all methods default to no-ops.
pub trait CacheEventListener: Send + Sync {
    fn on_hit(&self, _key: &CacheKey) {}
    fn on_miss(&self, _key: &CacheKey) {}
    fn on_write_attempt(&self, _key: &CacheKey) {}
    fn on_write_success(&self, _key: &CacheKey, _size: u64) {}
    fn on_read_exception(&self, _key: &CacheKey, _error: &CacheError) {}
    fn on_write_exception(&self, _key: &CacheKey, _error: &CacheError) {}
    fn on_eviction(&self, _resource_id: &str, _reason: EvictionReason, _size: u64) {}
    fn on_cleared(&self) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpCacheEventListener;

impl CacheEventListener for NoOpCacheEventListener {}
