//! Everything an [`ImagePipeline`](crate::pipeline::ImagePipeline) is built from.

use std::sync::Arc;
use std::time::Duration;

use crate::disk::{DiskCacheConfig, FreeSpaceProvider};
use crate::executor::{ExecutorConfig, ExecutorSupplier};
use crate::image::{ImageDecoder, PixelBufferAllocator};
use crate::key::CacheKeyFactory;
use crate::memory::MemoryCacheParams;
use crate::pipeline::SequenceOptions;
use crate::producer::RequestListener;
use crate::producers::{LocalSourceResolver, NetworkFetcher};
use crate::stats::CacheStatsTracker;

use super::file::{days_to_duration, ConfigFile, DEFAULT_NETWORK_TIMEOUT_SECS};

/// Pipeline configuration.
///
/// Capabilities left as `None` get the built-in implementation: the
/// `image` crate decoder on heap buffers, a reqwest fetcher, a directory
/// resolver with no roots and `statvfs` free space.
#[derive(Clone)]
pub struct ImagePipelineConfig {
    pub decoded_memory: MemoryCacheParams,
    pub encoded_memory: MemoryCacheParams,
    pub main_disk: DiskCacheConfig,
    /// `None` routes small-image requests to the main disk cache.
    pub small_disk: Option<DiskCacheConfig>,
    pub executors: ExecutorConfig,
    pub sequence: SequenceOptions,
    pub network_timeout: Duration,
    pub request_listeners: Vec<Arc<dyn RequestListener>>,
    pub stats_trackers: Vec<Arc<dyn CacheStatsTracker>>,
    pub executor_supplier: Option<Arc<dyn ExecutorSupplier>>,
    pub decoder: Option<Arc<dyn ImageDecoder>>,
    pub allocator: Option<Arc<dyn PixelBufferAllocator>>,
    pub network_fetcher: Option<Arc<dyn NetworkFetcher>>,
    pub local_resolver: Option<Arc<dyn LocalSourceResolver>>,
    pub key_factory: Option<Arc<dyn CacheKeyFactory>>,
    pub free_space: Option<Arc<dyn FreeSpaceProvider>>,
}

impl Default for ImagePipelineConfig {
    fn default() -> Self {
        Self {
            decoded_memory: MemoryCacheParams::decoded_default(),
            encoded_memory: MemoryCacheParams::encoded_default(),
            main_disk: DiskCacheConfig::default(),
            small_disk: Some(DiskCacheConfig::small(DiskCacheConfig::default_directory(
                "small",
            ))),
            executors: ExecutorConfig::default(),
            sequence: SequenceOptions::default(),
            network_timeout: Duration::from_secs(DEFAULT_NETWORK_TIMEOUT_SECS),
            request_listeners: Vec::new(),
            stats_trackers: Vec::new(),
            executor_supplier: None,
            decoder: None,
            allocator: None,
            network_fetcher: None,
            local_resolver: None,
            key_factory: None,
            free_space: None,
        }
    }
}

impl ImagePipelineConfig {
    /// Defaults with a single disk cache rooted at `directory`.
    pub fn with_disk_directory(directory: impl Into<std::path::PathBuf>) -> Self {
        Self {
            main_disk: DiskCacheConfig::main(directory),
            small_disk: None,
            ..Self::default()
        }
    }

    /// Applies the settings from a config file.
    pub fn from_config_file(file: &ConfigFile) -> Self {
        let memory = &file.memory;
        let decoded_memory =
            MemoryCacheParams::new(memory.decoded_size as usize, memory.decoded_entries);
        let encoded_memory =
            MemoryCacheParams::new(memory.encoded_size as usize, memory.encoded_entries)
                .with_max_entry_size(memory.encoded_max_entry_size as usize);

        let pipeline = &file.pipeline;
        let executors = ExecutorConfig {
            network_threads: pipeline.network_threads,
            storage_read_threads: pipeline.storage_read_threads,
            storage_write_threads: pipeline.storage_write_threads,
            decode_threads: pipeline.decode_threads,
            ..ExecutorConfig::default()
        };
        let sequence = SequenceOptions {
            resizing_enabled: pipeline.resizing_enabled,
            keep_cancelled_fetch_as_low_priority: pipeline.keep_cancelled_fetch_as_low_priority,
            max_simultaneous_thumbnail_requests: pipeline.max_thumbnail_requests,
            ..SequenceOptions::default()
        };

        Self {
            decoded_memory,
            encoded_memory,
            main_disk: file.main_disk_cache(),
            small_disk: Some(file.small_disk_cache()),
            executors,
            sequence,
            network_timeout: Duration::from_secs(pipeline.network_timeout_secs),
            ..Self::default()
        }
    }

    pub fn with_decoded_memory(mut self, params: MemoryCacheParams) -> Self {
        self.decoded_memory = params;
        self
    }

    pub fn with_encoded_memory(mut self, params: MemoryCacheParams) -> Self {
        self.encoded_memory = params;
        self
    }

    pub fn with_main_disk(mut self, config: DiskCacheConfig) -> Self {
        self.main_disk = config;
        self
    }

    pub fn with_small_disk(mut self, config: Option<DiskCacheConfig>) -> Self {
        self.small_disk = config;
        self
    }

    /// Drops disk entries not accessed within `days` on prune.
    pub fn with_disk_max_age_days(mut self, days: u64) -> Self {
        let max_age = days_to_duration(days);
        self.main_disk.max_age = Some(max_age);
        if let Some(small) = self.small_disk.as_mut() {
            small.max_age = Some(max_age);
        }
        self
    }

    pub fn with_executors(mut self, executors: ExecutorConfig) -> Self {
        self.executors = executors;
        self
    }

    pub fn with_executor_supplier(mut self, supplier: Arc<dyn ExecutorSupplier>) -> Self {
        self.executor_supplier = Some(supplier);
        self
    }

    pub fn with_sequence_options(mut self, options: SequenceOptions) -> Self {
        self.sequence = options;
        self
    }

    pub fn with_network_timeout(mut self, timeout: Duration) -> Self {
        self.network_timeout = timeout;
        self
    }

    pub fn with_request_listener(mut self, listener: Arc<dyn RequestListener>) -> Self {
        self.request_listeners.push(listener);
        self
    }

    pub fn with_stats_tracker(mut self, tracker: Arc<dyn CacheStatsTracker>) -> Self {
        self.stats_trackers.push(tracker);
        self
    }

    pub fn with_decoder(mut self, decoder: Arc<dyn ImageDecoder>) -> Self {
        self.decoder = Some(decoder);
        self
    }

    pub fn with_allocator(mut self, allocator: Arc<dyn PixelBufferAllocator>) -> Self {
        self.allocator = Some(allocator);
        self
    }

    pub fn with_network_fetcher(mut self, fetcher: Arc<dyn NetworkFetcher>) -> Self {
        self.network_fetcher = Some(fetcher);
        self
    }

    pub fn with_local_resolver(mut self, resolver: Arc<dyn LocalSourceResolver>) -> Self {
        self.local_resolver = Some(resolver);
        self
    }

    pub fn with_key_factory(mut self, factory: Arc<dyn CacheKeyFactory>) -> Self {
        self.key_factory = Some(factory);
        self
    }

    pub fn with_free_space_provider(mut self, provider: Arc<dyn FreeSpaceProvider>) -> Self {
        self.free_space = Some(provider);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_file_overrides_apply() {
        let mut file = ConfigFile::default();
        file.memory.decoded_size = 8 * 1024 * 1024;
        file.memory.encoded_max_entry_size = 1024 * 1024;
        file.pipeline.decode_threads = 3;
        file.pipeline.resizing_enabled = false;
        file.pipeline.network_timeout_secs = 5;

        let config = ImagePipelineConfig::from_config_file(&file);
        assert_eq!(config.decoded_memory.max_cache_size, 8 * 1024 * 1024);
        assert_eq!(config.encoded_memory.max_cache_entry_size, 1024 * 1024);
        assert_eq!(config.executors.decode_threads, 3);
        assert!(!config.sequence.resizing_enabled);
        assert_eq!(config.network_timeout, Duration::from_secs(5));
        assert!(config.small_disk.is_some());
    }

    #[test]
    fn test_max_age_applies_to_both_disk_caches() {
        let config = ImagePipelineConfig::default().with_disk_max_age_days(1);
        assert_eq!(config.main_disk.max_age, Some(Duration::from_secs(86_400)));
        assert_eq!(
            config.small_disk.and_then(|c| c.max_age),
            Some(Duration::from_secs(86_400))
        );
    }

    #[test]
    fn test_single_directory_has_no_small_cache() {
        let config = ImagePipelineConfig::with_disk_directory("/tmp/imagepipe-test");
        assert!(config.small_disk.is_none());
        assert_eq!(
            config.main_disk.base_directory,
            std::path::PathBuf::from("/tmp/imagepipe-test")
        );
    }
}
