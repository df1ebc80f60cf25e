//! The entry point for loading images.
//!
//! [`ImagePipeline`] owns the caches, executors and producer chains. Each
//! fetch or prefetch returns a [`DataSource`] that delivers the request's
//! results; dropping it cancels the request.
//!
//! ```ignore
//! use imagepipe::config::ImagePipelineConfig;
//! use imagepipe::pipeline::ImagePipeline;
//! use imagepipe::request::{CallerContext, ImageRequest};
//!
//! let pipeline = ImagePipeline::new(ImagePipelineConfig::default())?;
//! let request = ImageRequest::from_uri("https://example.com/cat.jpg")?;
//! let image = pipeline
//!     .fetch_decoded_image(request, CallerContext::default())
//!     .result()
//!     .await
//!     .into_result()?;
//! ```

mod data_source;
mod sequence;

pub use data_source::{DataEvent, DataSource, Outcome, OutcomeError};
pub use sequence::{
    ProducerSequenceFactory, SequenceDependencies, SequenceOptions,
    DEFAULT_MAX_SIMULTANEOUS_THUMBNAIL_REQUESTS,
};

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use thiserror::Error;
use tokio::runtime::Handle;
use tracing::{debug, info};

use crate::config::ImagePipelineConfig;
use crate::disk::{
    BufferedDiskCache, CacheError, DiskCacheConfig, DiskStorageCache, StatvfsFreeSpace,
};
use crate::executor::{ExecutorSupplier, ThreadHandoffQueue, TokioExecutorSupplier};
use crate::image::{DecodedImage, EncodedBytes, HeapPixelAllocator, ImageCrateDecoder, ImageRef};
use crate::key::{encoded_key_for_uri, CacheKey, CacheKeyFactory, DefaultCacheKeyFactory};
use crate::memory::{
    CountingMemoryCache, DecodedMemoryCache, EncodedMemoryCache, InstrumentedMemoryCache,
    MemoryTier, MemoryTrimType,
};
use crate::producer::{
    FetchError, ForwardingRequestListener, LoggingRequestListener, Producer, ProducerContext,
    ProducerListener, RequestListener,
};
use crate::producers::{
    DirectoryResolver, DiskCaches, HttpNetworkFetcher, MultiplexStats, NetworkFetcher,
};
use crate::request::{CallerContext, ImageRequest, ImageUri, Priority, RequestLevel};
use crate::resource::ResourceHandle;
use crate::stats::{
    CacheStatistics, CacheStatsTracker, CountingStatsTracker, ForwardingStatsTracker,
};

/// Errors building a pipeline.
#[derive(Debug, Error)]
pub enum PipelineBuildError {
    #[error("disk cache: {0}")]
    Disk(#[from] CacheError),

    #[error("network fetcher: {0}")]
    Network(#[from] FetchError),

    #[error("no tokio runtime available; provide an executor supplier or build inside a runtime")]
    NoRuntime,
}

/// Loads images through the memory, disk and network tiers.
pub struct ImagePipeline {
    sequences: ProducerSequenceFactory,
    decoded_memory: Arc<CountingMemoryCache<CacheKey, DecodedImage>>,
    encoded_memory: Arc<CountingMemoryCache<CacheKey, EncodedBytes>>,
    listener: Arc<ForwardingRequestListener>,
    stats: Arc<CountingStatsTracker>,
}

impl ImagePipeline {
    /// Builds a pipeline on the current tokio runtime.
    pub fn new(config: ImagePipelineConfig) -> Result<Self, PipelineBuildError> {
        let executors: Arc<dyn ExecutorSupplier> = match &config.executor_supplier {
            Some(supplier) => Arc::clone(supplier),
            None => {
                let handle = Handle::try_current().map_err(|_| PipelineBuildError::NoRuntime)?;
                Arc::new(TokioExecutorSupplier::new(handle, &config.executors))
            }
        };
        Self::with_executors(config, executors)
    }

    /// Builds a pipeline whose pools run on `handle`.
    pub fn with_runtime(
        config: ImagePipelineConfig,
        handle: Handle,
    ) -> Result<Self, PipelineBuildError> {
        let executors = Arc::new(TokioExecutorSupplier::new(handle, &config.executors));
        Self::with_executors(config, executors)
    }

    fn with_executors(
        config: ImagePipelineConfig,
        executors: Arc<dyn ExecutorSupplier>,
    ) -> Result<Self, PipelineBuildError> {
        let stats = Arc::new(CountingStatsTracker::new());
        let tracker: Arc<dyn CacheStatsTracker> = if config.stats_trackers.is_empty() {
            Arc::clone(&stats) as Arc<dyn CacheStatsTracker>
        } else {
            let mut trackers = vec![Arc::clone(&stats) as Arc<dyn CacheStatsTracker>];
            trackers.extend(config.stats_trackers.iter().cloned());
            Arc::new(ForwardingStatsTracker::new(trackers))
        };

        let allocator = config
            .allocator
            .clone()
            .unwrap_or_else(|| Arc::new(HeapPixelAllocator::new()));
        let decoder = config
            .decoder
            .clone()
            .unwrap_or_else(|| Arc::new(ImageCrateDecoder::new(Arc::clone(&allocator))));

        let decoded_memory = Arc::new(CountingMemoryCache::new(
            "decoded",
            config.decoded_memory,
            |image: &DecodedImage| image.size_in_bytes(),
        ));
        let encoded_memory = Arc::new(CountingMemoryCache::new(
            "encoded",
            config.encoded_memory,
            |bytes: &EncodedBytes| bytes.size_in_bytes(),
        ));
        let decoded_cache: Arc<DecodedMemoryCache> = Arc::new(InstrumentedMemoryCache::new(
            decoded_memory.clone(),
            Arc::clone(&tracker),
            MemoryTier::Decoded,
        ));
        let encoded_cache: Arc<EncodedMemoryCache> = Arc::new(InstrumentedMemoryCache::new(
            encoded_memory.clone(),
            Arc::clone(&tracker),
            MemoryTier::Encoded,
        ));

        let open_disk = |disk: &DiskCacheConfig| -> Result<Arc<BufferedDiskCache>, CacheError> {
            let free_space = config
                .free_space
                .clone()
                .unwrap_or_else(|| Arc::new(StatvfsFreeSpace));
            let storage =
                Arc::new(DiskStorageCache::open(disk.clone())?.with_free_space_provider(free_space));
            if disk.index_populate_at_startup {
                storage.populate_in_background(executors.for_background_tasks().as_ref());
            }
            Ok(Arc::new(BufferedDiskCache::new(
                storage,
                executors.for_local_storage_read(),
                executors.for_local_storage_write(),
                Arc::clone(&tracker),
            )))
        };
        let main_disk = open_disk(&config.main_disk)?;
        let disk_caches = match &config.small_disk {
            Some(small) => DiskCaches::new(main_disk, open_disk(small)?),
            None => DiskCaches::single(main_disk),
        };

        let network_fetcher: Arc<dyn NetworkFetcher> = match &config.network_fetcher {
            Some(fetcher) => Arc::clone(fetcher),
            None => Arc::new(HttpNetworkFetcher::with_timeout(config.network_timeout)?),
        };
        let local_resolver = config
            .local_resolver
            .clone()
            .unwrap_or_else(|| Arc::new(DirectoryResolver::new()));
        let key_factory = config
            .key_factory
            .clone()
            .unwrap_or_else(|| Arc::new(DefaultCacheKeyFactory));

        let mut listeners = config.request_listeners.clone();
        if listeners.is_empty() {
            listeners.push(Arc::new(LoggingRequestListener));
        }
        let listener = Arc::new(ForwardingRequestListener::new(listeners));

        let handoff_queue = Arc::new(ThreadHandoffQueue::new(
            executors.for_lightweight_background_tasks(),
        ));
        let deps = SequenceDependencies {
            executors,
            handoff_queue,
            decoder,
            allocator,
            decoded_cache,
            encoded_cache,
            disk_caches,
            key_factory,
            network_fetcher,
            local_resolver,
        };

        info!(
            decoded_limit = config.decoded_memory.max_cache_size,
            encoded_limit = config.encoded_memory.max_cache_size,
            disk = %config.main_disk.base_directory.display(),
            "Image pipeline ready"
        );

        Ok(Self {
            sequences: ProducerSequenceFactory::new(deps, config.sequence),
            decoded_memory,
            encoded_memory,
            listener,
            stats,
        })
    }

    fn deps(&self) -> &SequenceDependencies {
        self.sequences.dependencies()
    }

    fn key_factory(&self) -> &dyn CacheKeyFactory {
        self.deps().key_factory.as_ref()
    }

    fn submit<T: Send + 'static>(
        &self,
        producer: Arc<dyn Producer<T>>,
        request: ImageRequest,
        caller: CallerContext,
        level_on_submit: RequestLevel,
        is_prefetch: bool,
    ) -> DataSource<T> {
        let lowest_permitted_level = request.lowest_permitted_level().max(level_on_submit);
        let priority = if is_prefetch {
            Priority::Medium
        } else {
            request.priority()
        };
        let intermediate_results_expected = !is_prefetch && request.is_progressive();
        let request = Arc::new(request);
        let producer_listener: Arc<dyn ProducerListener> = self.listener.clone();
        let context = ProducerContext::builder(Arc::clone(&request))
            .caller_context(caller)
            .lowest_permitted_level(lowest_permitted_level)
            .listener(producer_listener)
            .priority(priority)
            .prefetch(is_prefetch)
            .intermediate_results_expected(intermediate_results_expected)
            .build();

        self.listener
            .on_request_start(&request, context.id(), is_prefetch);
        let request_listener: Arc<dyn RequestListener> = self.listener.clone();
        let (source, consumer) = DataSource::new(context.clone(), request_listener);
        producer.produce(consumer, context);
        source
    }

    /// Fetches and decodes `request`, serving from any cache tier.
    pub fn fetch_decoded_image(
        &self,
        request: ImageRequest,
        caller: CallerContext,
    ) -> DataSource<ImageRef> {
        let producer = self.sequences.decoded_image_sequence(&request);
        self.submit(producer, request, caller, RequestLevel::FullFetch, false)
    }

    /// Like [`fetch_decoded_image`](Self::fetch_decoded_image) but completes
    /// with `None` unless the decoded image is already in memory.
    pub fn fetch_image_from_bitmap_cache(
        &self,
        request: ImageRequest,
        caller: CallerContext,
    ) -> DataSource<ImageRef> {
        let producer = self.sequences.decoded_image_sequence(&request);
        self.submit(producer, request, caller, RequestLevel::BitmapMemoryCache, false)
    }

    /// Fetches the encoded bytes of `request` without decoding them.
    pub fn fetch_encoded_image(
        &self,
        request: ImageRequest,
        caller: CallerContext,
    ) -> DataSource<ResourceHandle<EncodedBytes>> {
        let producer = self.sequences.encoded_image_sequence(&request);
        self.submit(producer, request, caller, RequestLevel::FullFetch, false)
    }

    /// Loads and decodes `request` into the decoded memory cache.
    pub fn prefetch_to_bitmap_cache(
        &self,
        request: ImageRequest,
        caller: CallerContext,
    ) -> DataSource<()> {
        let producer = self.sequences.decoded_prefetch_sequence(&request);
        self.submit(producer, request, caller, RequestLevel::FullFetch, true)
    }

    /// Loads `request` into the encoded caches without decoding it.
    pub fn prefetch_to_disk_cache(
        &self,
        request: ImageRequest,
        caller: CallerContext,
    ) -> DataSource<()> {
        let producer = self.sequences.encoded_prefetch_sequence(&request);
        self.submit(producer, request, caller, RequestLevel::FullFetch, true)
    }

    /// Whether the decoded image for `request` is in memory.
    pub fn is_in_bitmap_memory_cache(&self, request: &ImageRequest) -> bool {
        let key = self
            .key_factory()
            .postprocessed_cache_key(request, &CallerContext::default());
        self.deps().decoded_cache.contains(&key)
    }

    /// Whether any decoded image of `uri` is in memory.
    pub fn is_uri_in_bitmap_memory_cache(&self, uri: &ImageUri) -> bool {
        self.deps()
            .decoded_cache
            .contains_matching(&|key: &CacheKey| key.contains_uri(uri))
    }

    fn disk_cache_for(&self, request: &ImageRequest) -> (&Arc<BufferedDiskCache>, CacheKey) {
        let key = self
            .key_factory()
            .encoded_cache_key(request, &CallerContext::default());
        (self.deps().disk_caches.for_choice(request.cache_choice()), key)
    }

    /// Checks the disk cache for `request` on the calling thread.
    pub fn is_in_disk_cache_sync(&self, request: &ImageRequest) -> bool {
        let (cache, key) = self.disk_cache_for(request);
        cache.disk_check_sync(&key)
    }

    /// Checks the disk cache for `request` on the storage-read pool.
    pub async fn is_in_disk_cache(&self, request: &ImageRequest) -> bool {
        let (cache, key) = self.disk_cache_for(request);
        cache.contains(&key).await
    }

    /// Removes every memory cache entry for `uri`. Returns the number of
    /// entries removed.
    pub fn evict_from_memory_cache(&self, uri: &ImageUri) -> usize {
        let matches_uri = |key: &CacheKey| key.contains_uri(uri);
        let removed = self.deps().decoded_cache.remove_all(&matches_uri)
            + self.deps().encoded_cache.remove_all(&matches_uri);
        debug!(uri = %uri, removed, "Evicted from memory caches");
        removed
    }

    /// Removes `uri` from both disk caches.
    pub async fn evict_from_disk_cache(&self, uri: &ImageUri) {
        let key = encoded_key_for_uri(uri);
        let removals = self
            .deps()
            .disk_caches
            .distinct()
            .into_iter()
            .map(|cache| cache.remove(&key));
        join_all(removals).await;
        debug!(uri = %uri, "Evicted from disk caches");
    }

    /// Removes `uri` from every cache tier.
    pub async fn evict_from_cache(&self, uri: &ImageUri) {
        self.evict_from_memory_cache(uri);
        self.evict_from_disk_cache(uri).await;
    }

    /// Drops every memory cache entry. Images still held by callers stay
    /// valid until released.
    pub fn clear_memory_caches(&self) {
        let decoded = self.decoded_memory.clear();
        let encoded = self.encoded_memory.clear();
        info!(decoded, encoded, "Memory caches cleared");
    }

    pub async fn clear_disk_caches(&self) {
        let clears = self
            .deps()
            .disk_caches
            .distinct()
            .into_iter()
            .map(|cache| cache.clear_all());
        join_all(clears).await;
        info!("Disk caches cleared");
    }

    pub async fn clear_caches(&self) {
        self.clear_memory_caches();
        self.clear_disk_caches().await;
    }

    /// Removes disk entries older than each cache's max age and shrinks
    /// caches over their current limit. Returns the entries removed.
    pub fn prune_disk_caches(&self) -> usize {
        self.deps()
            .disk_caches
            .distinct()
            .into_iter()
            .map(|cache| cache.storage().prune())
            .sum()
    }

    /// Removes disk entries not accessed within `max_age`.
    pub fn clear_old_disk_entries(&self, max_age: Duration) {
        for cache in self.deps().disk_caches.distinct() {
            cache.storage().clear_old_entries(max_age);
        }
    }

    /// Holds newly submitted requests until [`resume`](Self::resume).
    pub fn pause(&self) {
        self.deps().handoff_queue.start_queueing();
    }

    /// Starts held requests in submission order.
    pub fn resume(&self) {
        self.deps().handoff_queue.stop_queueing();
    }

    pub fn is_paused(&self) -> bool {
        self.deps().handoff_queue.is_queueing()
    }

    /// Shrinks both memory caches in response to memory pressure.
    pub fn trim_memory(&self, trim_type: MemoryTrimType) {
        self.decoded_memory.trim(trim_type);
        self.encoded_memory.trim(trim_type);
    }

    /// Hit counters and tier sizes.
    pub fn stats(&self) -> CacheStatistics {
        let disk_caches = self.deps().disk_caches.distinct();
        CacheStatistics {
            stats: self.stats.snapshot(),
            decoded_memory_entries: self.decoded_memory.count(),
            decoded_memory_bytes: self.decoded_memory.size_in_bytes(),
            encoded_memory_entries: self.encoded_memory.count(),
            encoded_memory_bytes: self.encoded_memory.size_in_bytes(),
            disk_entries: disk_caches.iter().map(|c| c.storage().count()).sum(),
            disk_bytes: disk_caches.iter().map(|c| c.storage().size()).sum(),
            disk_limit_bytes: disk_caches
                .iter()
                .map(|c| c.storage().effective_size_limit())
                .sum(),
        }
    }

    /// Request coalescing counters across every multiplexer.
    pub fn multiplex_stats(&self) -> MultiplexStats {
        self.sequences.multiplex_stats()
    }

    pub fn disk_caches(&self) -> &DiskCaches {
        &self.deps().disk_caches
    }
}
