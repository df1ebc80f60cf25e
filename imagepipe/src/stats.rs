//! Cache statistics tracking and reporting.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::key::CacheKey;

/// Hooks fired for every cache tier lookup.
///
/// All methods default to no-ops; trackers override what they need.
pub trait CacheStatsTracker: Send + Sync {
    fn on_decoded_cache_hit(&self, _key: &CacheKey) {}
    fn on_decoded_cache_miss(&self, _key: &CacheKey) {}
    fn on_decoded_cache_put(&self, _key: &CacheKey) {}

    fn on_encoded_cache_hit(&self, _key: &CacheKey) {}
    fn on_encoded_cache_miss(&self, _key: &CacheKey) {}
    fn on_encoded_cache_put(&self, _key: &CacheKey) {}

    fn on_staging_area_hit(&self, _key: &CacheKey) {}
    fn on_staging_area_miss(&self, _key: &CacheKey) {}

    fn on_disk_cache_hit(&self, _key: &CacheKey) {}
    fn on_disk_cache_miss(&self, _key: &CacheKey) {}
    fn on_disk_cache_get_fail(&self, _key: &CacheKey) {}
    fn on_disk_cache_put(&self, _key: &CacheKey) {}
    fn on_disk_cache_write_fail(&self, _key: &CacheKey) {}
}

/// Tracker that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpStatsTracker;

impl CacheStatsTracker for NoOpStatsTracker {}

#[derive(Debug, Default)]
struct TierCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    puts: AtomicU64,
    failures: AtomicU64,
}

impl TierCounters {
    fn snapshot(&self) -> TierStats {
        TierStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            puts: self.puts.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Counters for one tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TierStats {
    pub hits: u64,
    pub misses: u64,
    pub puts: u64,
    pub failures: u64,
}

impl TierStats {
    /// Hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Tracker keeping atomic counters per tier.
#[derive(Debug)]
pub struct CountingStatsTracker {
    decoded: TierCounters,
    encoded: TierCounters,
    staging: TierCounters,
    disk: TierCounters,
    created_at: Instant,
}

impl Default for CountingStatsTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl CountingStatsTracker {
    pub fn new() -> Self {
        Self {
            decoded: TierCounters::default(),
            encoded: TierCounters::default(),
            staging: TierCounters::default(),
            disk: TierCounters::default(),
            created_at: Instant::now(),
        }
    }

    pub fn snapshot(&self) -> CacheStats {
        CacheStats {
            decoded_memory: self.decoded.snapshot(),
            encoded_memory: self.encoded.snapshot(),
            staging: self.staging.snapshot(),
            disk: self.disk.snapshot(),
            uptime: self.created_at.elapsed(),
        }
    }
}

impl CacheStatsTracker for CountingStatsTracker {
    fn on_decoded_cache_hit(&self, _key: &CacheKey) {
        TierCounters::bump(&self.decoded.hits);
    }

    fn on_decoded_cache_miss(&self, _key: &CacheKey) {
        TierCounters::bump(&self.decoded.misses);
    }

    fn on_decoded_cache_put(&self, _key: &CacheKey) {
        TierCounters::bump(&self.decoded.puts);
    }

    fn on_encoded_cache_hit(&self, _key: &CacheKey) {
        TierCounters::bump(&self.encoded.hits);
    }

    fn on_encoded_cache_miss(&self, _key: &CacheKey) {
        TierCounters::bump(&self.encoded.misses);
    }

    fn on_encoded_cache_put(&self, _key: &CacheKey) {
        TierCounters::bump(&self.encoded.puts);
    }

    fn on_staging_area_hit(&self, _key: &CacheKey) {
        TierCounters::bump(&self.staging.hits);
    }

    fn on_staging_area_miss(&self, _key: &CacheKey) {
        TierCounters::bump(&self.staging.misses);
    }

    fn on_disk_cache_hit(&self, _key: &CacheKey) {
        TierCounters::bump(&self.disk.hits);
    }

    fn on_disk_cache_miss(&self, _key: &CacheKey) {
        TierCounters::bump(&self.disk.misses);
    }

    fn on_disk_cache_get_fail(&self, _key: &CacheKey) {
        TierCounters::bump(&self.disk.failures);
    }

    fn on_disk_cache_put(&self, _key: &CacheKey) {
        TierCounters::bump(&self.disk.puts);
    }

    fn on_disk_cache_write_fail(&self, _key: &CacheKey) {
        TierCounters::bump(&self.disk.failures);
    }
}

/// Fans hooks out to several trackers.
#[derive(Default, Clone)]
pub struct ForwardingStatsTracker {
    trackers: Vec<Arc<dyn CacheStatsTracker>>,
}

impl ForwardingStatsTracker {
    pub fn new(trackers: Vec<Arc<dyn CacheStatsTracker>>) -> Self {
        Self { trackers }
    }
}

macro_rules! forward_hooks {
    ($($hook:ident),* $(,)?) => {
        impl CacheStatsTracker for ForwardingStatsTracker {
            $(
                fn $hook(&self, key: &CacheKey) {
                    for tracker in &self.trackers {
                        tracker.$hook(key);
                    }
                }
            )*
        }
    };
}

forward_hooks!(
    on_decoded_cache_hit,
    on_decoded_cache_miss,
    on_decoded_cache_put,
    on_encoded_cache_hit,
    on_encoded_cache_miss,
    on_encoded_cache_put,
    on_staging_area_hit,
    on_staging_area_miss,
    on_disk_cache_hit,
    on_disk_cache_miss,
    on_disk_cache_get_fail,
    on_disk_cache_put,
    on_disk_cache_write_fail,
);

/// Point-in-time view of the counters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheStats {
    pub decoded_memory: TierStats,
    pub encoded_memory: TierStats,
    pub staging: TierStats,
    pub disk: TierStats,
    pub uptime: Duration,
}

impl CacheStats {
    /// Fraction of decoded lookups served by any cache tier.
    ///
    /// A decoded miss falls through to the encoded tier, an encoded miss to
    /// disk, so only disk misses reach the network.
    pub fn overall_hit_rate(&self) -> f64 {
        let hits = self.decoded_memory.hits
            + self.encoded_memory.hits
            + self.staging.hits
            + self.disk.hits;
        let total = hits + self.disk.misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

/// A stats snapshot plus tier sizes, for reporting.
#[derive(Debug, Clone, Default)]
pub struct CacheStatistics {
    pub stats: CacheStats,
    pub decoded_memory_entries: usize,
    pub decoded_memory_bytes: usize,
    pub encoded_memory_entries: usize,
    pub encoded_memory_bytes: usize,
    pub disk_entries: usize,
    pub disk_bytes: u64,
    pub disk_limit_bytes: u64,
}

impl CacheStatistics {
    /// Human-readable multi-line report.
    pub fn format(&self) -> String {
        let s = &self.stats;
        format!(
            r#"imagepipe Cache Statistics

DECODED MEMORY CACHE
  Entries:     {}
  Size:        {:.2} MB
  Hits:        {}
  Misses:      {}
  Hit Rate:    {:.1}%

ENCODED MEMORY CACHE
  Entries:     {}
  Size:        {:.2} MB
  Hits:        {}
  Misses:      {}
  Hit Rate:    {:.1}%

DISK CACHE
  Entries:     {}
  Size:        {:.2} MB of {:.2} MB
  Hits:        {} (+{} staged)
  Misses:      {}
  Writes:      {}
  Failures:    {}
  Hit Rate:    {:.1}%

OVERALL
  Hit Rate:    {:.1}%
  Uptime:      {}s
"#,
            self.decoded_memory_entries,
            mb(self.decoded_memory_bytes as u64),
            s.decoded_memory.hits,
            s.decoded_memory.misses,
            s.decoded_memory.hit_rate() * 100.0,
            self.encoded_memory_entries,
            mb(self.encoded_memory_bytes as u64),
            s.encoded_memory.hits,
            s.encoded_memory.misses,
            s.encoded_memory.hit_rate() * 100.0,
            self.disk_entries,
            mb(self.disk_bytes),
            mb(self.disk_limit_bytes),
            s.disk.hits,
            s.staging.hits,
            s.disk.misses,
            s.disk.puts,
            s.disk.failures,
            s.disk.hit_rate() * 100.0,
            s.overall_hit_rate() * 100.0,
            s.uptime.as_secs(),
        )
    }
}

fn mb(bytes: u64) -> f64 {
    bytes as f64 / (1024.0 * 1024.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::encoded_key_for_uri;
    use crate::request::ImageUri;

    fn key() -> CacheKey {
        encoded_key_for_uri(&ImageUri::parse("https://example.com/a.jpg").unwrap())
    }

    #[test]
    fn test_hit_rate_no_requests() {
        assert_eq!(TierStats::default().hit_rate(), 0.0);
    }

    #[test]
    fn test_hit_rate_mixed() {
        let stats = TierStats {
            hits: 75,
            misses: 25,
            ..Default::default()
        };
        assert_eq!(stats.hit_rate(), 0.75);
    }

    #[test]
    fn test_counting_tracker_routes_by_tier() {
        let tracker = CountingStatsTracker::new();
        let k = key();
        tracker.on_decoded_cache_hit(&k);
        tracker.on_decoded_cache_miss(&k);
        tracker.on_disk_cache_hit(&k);
        tracker.on_disk_cache_put(&k);
        tracker.on_disk_cache_write_fail(&k);

        let stats = tracker.snapshot();
        assert_eq!(stats.decoded_memory.hits, 1);
        assert_eq!(stats.decoded_memory.misses, 1);
        assert_eq!(stats.disk.hits, 1);
        assert_eq!(stats.disk.puts, 1);
        assert_eq!(stats.disk.failures, 1);
        assert_eq!(stats.encoded_memory, TierStats::default());
    }

    #[test]
    fn test_overall_hit_rate() {
        let stats = CacheStats {
            decoded_memory: TierStats {
                hits: 70,
                misses: 30,
                ..Default::default()
            },
            disk: TierStats {
                hits: 20,
                misses: 10,
                ..Default::default()
            },
            ..Default::default()
        };
        // 70 + 20 hits out of 100 lookups that reached a terminal tier.
        assert_eq!(stats.overall_hit_rate(), 0.9);
    }

    #[test]
    fn test_forwarding_reaches_all() {
        let a = Arc::new(CountingStatsTracker::new());
        let b = Arc::new(CountingStatsTracker::new());
        let forwarding =
            ForwardingStatsTracker::new(vec![a.clone() as Arc<dyn CacheStatsTracker>, b.clone()]);
        forwarding.on_encoded_cache_put(&key());
        assert_eq!(a.snapshot().encoded_memory.puts, 1);
        assert_eq!(b.snapshot().encoded_memory.puts, 1);
    }

    #[test]
    fn test_format_contains_sections() {
        let statistics = CacheStatistics {
            disk_entries: 3,
            ..Default::default()
        };
        let report = statistics.format();
        assert!(report.contains("DECODED MEMORY CACHE"));
        assert!(report.contains("DISK CACHE"));
        assert!(report.contains("Entries:     3"));
    }
}
