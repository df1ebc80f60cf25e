//! Assembly of producer chains per source type.
//!
//! Chains are built on first use and shared by every later request for the
//! same source type, so the multiplexers inside them see all requests.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use crate::executor::{ExecutorSupplier, ThreadHandoffQueue};
use crate::image::{EncodedBytes, EncodedImage, ImageDecoder, ImageRef, PixelBufferAllocator};
use crate::key::{CacheKey, CacheKeyFactory};
use crate::memory::{DecodedMemoryCache, EncodedMemoryCache};
use crate::producer::{Producer, ProducerContext};
use crate::producers::{
    AddImageTransformMetaDataProducer, BitmapMemoryCacheProducer, BranchOnSeparateImagesProducer,
    DataFetchProducer, DecodeProducer, DiskCacheReadProducer, DiskCacheWriteProducer, DiskCaches,
    EncodedMemoryCacheProducer, LocalExifThumbnailProducer, LocalFetchProducer,
    LocalSourceResolver, MultiplexProducer, MultiplexStats, NetworkFetchProducer, NetworkFetcher,
    PostprocessedBitmapMemoryCacheProducer, PostprocessorProducer, ResizeAndRotateProducer,
    SwallowResultProducer, ThreadHandoffProducer, ThrottlingProducer, ThumbnailBranchProducer,
    ThumbnailProducer, ToBytesProducer,
};
use crate::request::{ImageRequest, RequestLevel, SourceType};
use crate::resource::ResourceHandle;

/// Default number of local thumbnail lookups allowed at once.
pub const DEFAULT_MAX_SIMULTANEOUS_THUMBNAIL_REQUESTS: usize = 5;

/// Tunables for the assembled chains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceOptions {
    pub resizing_enabled: bool,
    pub keep_cancelled_fetch_as_low_priority: bool,
    pub max_simultaneous_thumbnail_requests: usize,
    pub network_intermediate_interval: Duration,
}

impl Default for SequenceOptions {
    fn default() -> Self {
        Self {
            resizing_enabled: true,
            keep_cancelled_fetch_as_low_priority: false,
            max_simultaneous_thumbnail_requests: DEFAULT_MAX_SIMULTANEOUS_THUMBNAIL_REQUESTS,
            network_intermediate_interval: crate::producers::DEFAULT_INTERMEDIATE_INTERVAL,
        }
    }
}

/// Everything the chains are built from.
pub struct SequenceDependencies {
    pub executors: Arc<dyn ExecutorSupplier>,
    pub handoff_queue: Arc<ThreadHandoffQueue>,
    pub decoder: Arc<dyn ImageDecoder>,
    pub allocator: Arc<dyn PixelBufferAllocator>,
    pub decoded_cache: Arc<DecodedMemoryCache>,
    pub encoded_cache: Arc<EncodedMemoryCache>,
    pub disk_caches: DiskCaches,
    pub key_factory: Arc<dyn CacheKeyFactory>,
    pub network_fetcher: Arc<dyn NetworkFetcher>,
    pub local_resolver: Arc<dyn LocalSourceResolver>,
}

const SOURCE_TYPES: usize = 6;

fn slot(source_type: SourceType) -> usize {
    match source_type {
        SourceType::Network => 0,
        SourceType::LocalFile => 1,
        SourceType::LocalContent => 2,
        SourceType::LocalAsset => 3,
        SourceType::LocalResource => 4,
        SourceType::Data => 5,
    }
}

/// One lazily built chain per source type.
struct PerSource<T> {
    slots: [OnceLock<T>; SOURCE_TYPES],
}

impl<T> PerSource<T> {
    fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| OnceLock::new()),
        }
    }

    fn get_or_init(&self, source_type: SourceType, init: impl FnOnce() -> T) -> &T {
        self.slots[slot(source_type)].get_or_init(init)
    }
}

type DecodedChain = Arc<dyn Producer<ImageRef>>;
type EncodedChain = Arc<dyn Producer<EncodedImage>>;
type PrefetchChain = Arc<dyn Producer<()>>;
type BytesChain = Arc<dyn Producer<ResourceHandle<EncodedBytes>>>;
type StatsFn = Box<dyn Fn() -> MultiplexStats + Send + Sync>;

/// Builds and memoizes the producer chain for each kind of request.
pub struct ProducerSequenceFactory {
    deps: SequenceDependencies,
    options: SequenceOptions,
    encoded: PerSource<EncodedChain>,
    below_bitmap_get: PerSource<DecodedChain>,
    decoded: PerSource<DecodedChain>,
    postprocessed: PerSource<DecodedChain>,
    bitmap_prefetch: PerSource<PrefetchChain>,
    postprocessed_prefetch: PerSource<PrefetchChain>,
    disk_prefetch: PerSource<PrefetchChain>,
    encoded_bytes: PerSource<BytesChain>,
    multiplex_stats: Mutex<Vec<StatsFn>>,
}

impl ProducerSequenceFactory {
    pub fn new(deps: SequenceDependencies, options: SequenceOptions) -> Self {
        Self {
            deps,
            options,
            encoded: PerSource::new(),
            below_bitmap_get: PerSource::new(),
            decoded: PerSource::new(),
            postprocessed: PerSource::new(),
            bitmap_prefetch: PerSource::new(),
            postprocessed_prefetch: PerSource::new(),
            disk_prefetch: PerSource::new(),
            encoded_bytes: PerSource::new(),
            multiplex_stats: Mutex::new(Vec::new()),
        }
    }

    pub fn dependencies(&self) -> &SequenceDependencies {
        &self.deps
    }

    /// Chain producing decoded images for `request`.
    pub fn decoded_image_sequence(&self, request: &ImageRequest) -> DecodedChain {
        let source_type = request.source_type();
        if request.postprocessor().is_some() {
            return Arc::clone(self.postprocessed_sequence(source_type));
        }
        Arc::clone(self.decoded_sequence(source_type))
    }

    /// Chain that decodes `request` into the decoded memory cache.
    pub fn decoded_prefetch_sequence(&self, request: &ImageRequest) -> PrefetchChain {
        let source_type = request.source_type();
        let chains = if request.postprocessor().is_some() {
            &self.postprocessed_prefetch
        } else {
            &self.bitmap_prefetch
        };
        Arc::clone(chains.get_or_init(source_type, || {
            Arc::new(SwallowResultProducer::new(self.decoded_image_sequence(request)))
        }))
    }

    /// Chain that fetches `request` into the encoded caches without
    /// decoding.
    pub fn encoded_prefetch_sequence(&self, request: &ImageRequest) -> PrefetchChain {
        let source_type = request.source_type();
        Arc::clone(self.disk_prefetch.get_or_init(source_type, || {
            Arc::new(SwallowResultProducer::new(Arc::clone(
                self.encoded_sequence(source_type),
            )))
        }))
    }

    /// Chain producing the encoded bytes for `request`.
    pub fn encoded_image_sequence(&self, request: &ImageRequest) -> BytesChain {
        let source_type = request.source_type();
        Arc::clone(self.encoded_bytes.get_or_init(source_type, || {
            let handoff = ThreadHandoffProducer::background(
                Arc::clone(self.encoded_sequence(source_type)),
                Arc::clone(&self.deps.handoff_queue),
            );
            Arc::new(ToBytesProducer::new(Arc::new(handoff)))
        }))
    }

    /// Combined counters of every multiplexer built so far.
    pub fn multiplex_stats(&self) -> MultiplexStats {
        self.multiplex_stats
            .lock()
            .iter()
            .map(|stats| stats())
            .fold(MultiplexStats::default(), |acc, s| MultiplexStats {
                total_requests: acc.total_requests + s.total_requests,
                coalesced_requests: acc.coalesced_requests + s.coalesced_requests,
                new_requests: acc.new_requests + s.new_requests,
            })
    }

    fn decoded_sequence(&self, source_type: SourceType) -> &DecodedChain {
        self.decoded.get_or_init(source_type, || {
            Arc::new(BitmapMemoryCacheProducer::get_only(
                Arc::clone(&self.deps.decoded_cache),
                Arc::clone(&self.deps.key_factory),
                Arc::clone(self.below_bitmap_get_sequence(source_type)),
            ))
        })
    }

    fn postprocessed_sequence(&self, source_type: SourceType) -> &DecodedChain {
        self.postprocessed.get_or_init(source_type, || {
            let postprocessor = PostprocessorProducer::new(
                Arc::clone(self.below_bitmap_get_sequence(source_type)),
                self.deps.executors.for_decode(),
                Arc::clone(&self.deps.allocator),
            );
            Arc::new(PostprocessedBitmapMemoryCacheProducer::new(
                Arc::clone(&self.deps.decoded_cache),
                Arc::clone(&self.deps.key_factory),
                Arc::new(postprocessor),
            ))
        })
    }

    /// handoff → multiplex → bitmap cache → decode → transforms → encoded
    fn below_bitmap_get_sequence(&self, source_type: SourceType) -> &DecodedChain {
        self.below_bitmap_get.get_or_init(source_type, || {
            debug!(source = %source_type, "Building decoded image chain");
            let decode = DecodeProducer::new(
                Arc::clone(&self.deps.decoder),
                self.deps.executors.for_decode(),
                self.transformed_encoded_sequence(source_type),
            );
            let bitmap_cache = BitmapMemoryCacheProducer::new(
                Arc::clone(&self.deps.decoded_cache),
                Arc::clone(&self.deps.key_factory),
                Arc::new(decode),
            );
            let key_factory = Arc::clone(&self.deps.key_factory);
            let multiplex = Arc::new(MultiplexProducer::<(CacheKey, RequestLevel), ImageRef>::new(
                "BitmapMemoryCacheKeyMultiplexProducer",
                Arc::new(bitmap_cache),
                Arc::new(move |context: &ProducerContext| {
                    (
                        key_factory.decoded_cache_key(context.request(), context.caller_context()),
                        context.lowest_permitted_level(),
                    )
                }),
                self.options.keep_cancelled_fetch_as_low_priority,
            ));
            self.track(&multiplex);
            Arc::new(ThreadHandoffProducer::new(
                multiplex,
                Arc::clone(&self.deps.handoff_queue),
            ))
        })
    }

    /// Resize/rotate planning and metadata over the encoded chain, with the
    /// thumbnail branch in front for local sources.
    fn transformed_encoded_sequence(&self, source_type: SourceType) -> EncodedChain {
        let metadata = AddImageTransformMetaDataProducer::new(
            Arc::clone(&self.deps.decoder),
            Arc::clone(self.encoded_sequence(source_type)),
        );
        let transformed: EncodedChain = Arc::new(ResizeAndRotateProducer::new(
            Arc::new(metadata),
            self.options.resizing_enabled,
        ));
        if !source_type.is_local() {
            return transformed;
        }

        let thumbnails: Vec<Arc<dyn ThumbnailProducer>> =
            vec![Arc::new(LocalExifThumbnailProducer::new(
                Arc::clone(&self.deps.local_resolver),
                self.deps.executors.for_local_storage_read(),
                Arc::clone(&self.deps.decoder),
            ))];
        let throttled = ThrottlingProducer::<EncodedImage>::new(
            Arc::new(ThumbnailBranchProducer::new(thumbnails)),
            self.deps.executors.for_lightweight_background_tasks(),
            self.options.max_simultaneous_thumbnail_requests,
        );
        Arc::new(BranchOnSeparateImagesProducer::new(
            Arc::new(throttled),
            transformed,
        ))
    }

    /// multiplex → encoded memory cache → [disk read → disk write] → fetch
    ///
    /// Local sources skip the disk cache and data URIs skip encoded caching
    /// altogether.
    fn encoded_sequence(&self, source_type: SourceType) -> &EncodedChain {
        self.encoded.get_or_init(source_type, || -> EncodedChain {
            debug!(source = %source_type, "Building encoded image chain");
            let fetch = self.fetch_producer(source_type);
            if source_type == SourceType::Data {
                return fetch;
            }

            let below_memory: EncodedChain = if source_type == SourceType::Network {
                let write = DiskCacheWriteProducer::new(
                    self.deps.disk_caches.clone(),
                    Arc::clone(&self.deps.key_factory),
                    fetch,
                );
                Arc::new(DiskCacheReadProducer::new(
                    self.deps.disk_caches.clone(),
                    Arc::clone(&self.deps.key_factory),
                    Arc::new(write),
                ))
            } else {
                fetch
            };
            let memory = EncodedMemoryCacheProducer::new(
                Arc::clone(&self.deps.encoded_cache),
                Arc::clone(&self.deps.key_factory),
                below_memory,
            );

            let key_factory = Arc::clone(&self.deps.key_factory);
            let multiplex = Arc::new(
                MultiplexProducer::<(CacheKey, RequestLevel), EncodedImage>::new(
                    "EncodedCacheKeyMultiplexProducer",
                    Arc::new(memory),
                    Arc::new(move |context: &ProducerContext| {
                        (
                            key_factory
                                .encoded_cache_key(context.request(), context.caller_context()),
                            context.lowest_permitted_level(),
                        )
                    }),
                    self.options.keep_cancelled_fetch_as_low_priority,
                ),
            );
            self.track(&multiplex);
            multiplex
        })
    }

    fn fetch_producer(&self, source_type: SourceType) -> EncodedChain {
        match source_type {
            SourceType::Network => Arc::new(
                NetworkFetchProducer::new(
                    Arc::clone(&self.deps.network_fetcher),
                    self.deps.executors.for_network(),
                )
                .with_intermediate_interval(self.options.network_intermediate_interval),
            ),
            SourceType::Data => Arc::new(DataFetchProducer::new(
                self.deps.executors.for_local_storage_read(),
            )),
            SourceType::LocalFile
            | SourceType::LocalContent
            | SourceType::LocalAsset
            | SourceType::LocalResource => Arc::new(LocalFetchProducer::new(
                Arc::clone(&self.deps.local_resolver),
                self.deps.executors.for_local_storage_read(),
            )),
        }
    }

    fn track<T: crate::producers::CloneableResult>(
        &self,
        multiplex: &Arc<MultiplexProducer<(CacheKey, RequestLevel), T>>,
    ) {
        let multiplex = Arc::clone(multiplex);
        self.multiplex_stats
            .lock()
            .push(Box::new(move || multiplex.stats()));
    }
}
