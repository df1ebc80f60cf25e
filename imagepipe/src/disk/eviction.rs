//! Eviction ordering for the disk cache.

use std::fmt;
use std::time::SystemTime;

use super::index::EvictionCandidate;

/// Why an entry left the disk cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionReason {
    /// Over the effective size limit.
    CacheFull,
    /// Older than the configured max age.
    ContentStale,
    /// Explicit remove or clear.
    UserForced,
    /// Trimmed by `trim_to_minimum`/`trim_to_nothing`.
    CacheManagerTrimmed,
}

impl fmt::Display for EvictionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::CacheFull => "cache_full",
            Self::ContentStale => "content_stale",
            Self::UserForced => "user_forced",
            Self::CacheManagerTrimmed => "cache_manager_trimmed",
        };
        f.write_str(name)
    }
}

/// Orders candidates so the first element is evicted first.
pub trait EntryEvictionComparator: Send + Sync {
    fn sort(&self, candidates: &mut [EvictionCandidate], now: SystemTime);
}

/// Least recently accessed first.
#[derive(Debug, Default, Clone, Copy)]
pub struct LruEvictionComparator;

impl EntryEvictionComparator for LruEvictionComparator {
    fn sort(&self, candidates: &mut [EvictionCandidate], _now: SystemTime) {
        candidates.sort_by_key(|c| c.metadata.last_accessed);
    }
}

/// Weighs age against size; highest score evicted first.
///
/// `score = age_weight * age_secs + size_weight * size_bytes`
#[derive(Debug, Clone, Copy)]
pub struct ScoreBasedEvictionComparator {
    pub age_weight: f32,
    pub size_weight: f32,
}

impl ScoreBasedEvictionComparator {
    pub fn new(age_weight: f32, size_weight: f32) -> Self {
        Self {
            age_weight,
            size_weight,
        }
    }

    fn score(&self, candidate: &EvictionCandidate, now: SystemTime) -> f64 {
        let age = now
            .duration_since(candidate.metadata.last_accessed)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        f64::from(self.age_weight) * age
            + f64::from(self.size_weight) * candidate.metadata.size_bytes as f64
    }
}

impl EntryEvictionComparator for ScoreBasedEvictionComparator {
    fn sort(&self, candidates: &mut [EvictionCandidate], now: SystemTime) {
        candidates.sort_by(|a, b| self.score(b, now).total_cmp(&self.score(a, now)));
    }
}
