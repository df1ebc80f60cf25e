//! Pipeline stages.
//!
//! Each stage implements [`Producer`](crate::producer::Producer) and wraps
//! the consumer it is handed before passing work upstream. Stages that only
//! transform results forward failure, cancellation and progress unchanged.

/// Implements the non-result consumer methods by forwarding to the
/// `downstream` field.
macro_rules! forward_non_result_events {
    () => {
        fn on_failure(&self, error: $crate::producer::PipelineError) {
            self.downstream.on_failure(error);
        }

        fn on_cancellation(&self) {
            self.downstream.on_cancellation();
        }

        fn on_progress_update(&self, progress: f32) {
            self.downstream.on_progress_update(progress);
        }
    };
}

pub(crate) use forward_non_result_events;

mod bitmap_cache;
mod data;
mod decode;
mod disk_cache;
mod encoded_cache;
mod handoff;
mod local;
mod metadata;
mod multiplex;
mod network;
mod postprocess;
mod resize;
mod swallow;
mod throttling;
mod thumbnail;
mod to_bytes;

pub use bitmap_cache::BitmapMemoryCacheProducer;
pub use data::{decode_data_uri, DataFetchProducer};
pub use decode::DecodeProducer;
pub use disk_cache::{DiskCacheReadProducer, DiskCacheWriteProducer, DiskCaches};
pub use encoded_cache::EncodedMemoryCacheProducer;
pub use handoff::ThreadHandoffProducer;
pub use local::{
    DirectoryResolver, LocalExifThumbnailProducer, LocalFetchProducer, LocalSourceResolver,
};
pub use metadata::AddImageTransformMetaDataProducer;
pub use multiplex::{CloneableResult, MultiplexProducer, MultiplexStats};
pub use network::{
    FetchResponse, HttpNetworkFetcher, NetworkFetchProducer, NetworkFetcher,
    DEFAULT_INTERMEDIATE_INTERVAL,
};
pub use postprocess::{PostprocessedBitmapMemoryCacheProducer, PostprocessorProducer};
pub use resize::{determine_sample_size, ResizeAndRotateProducer};
pub use swallow::SwallowResultProducer;
pub use throttling::ThrottlingProducer;
pub use thumbnail::{
    is_image_big_enough, BranchOnSeparateImagesProducer, ThumbnailBranchProducer,
    ThumbnailProducer,
};
pub use to_bytes::ToBytesProducer;

#[cfg(test)]
pub(crate) mod test_support {
    //! Scripted producers for stage tests.

    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use bytes::Bytes;
    use parking_lot::Mutex;

    use crate::image::{
        DecodedImage, EncodedBytes, EncodedImage, HeapPixelBuffer, ImageRef, QualityInfo,
    };
    use crate::disk::{BufferedDiskCache, DiskCacheConfig, DiskStorageCache, FixedFreeSpace};
    use crate::executor::InlineExecutor;
    use crate::key::CacheKey;
    use crate::memory::{CountingMemoryCache, MemoryCacheParams};
    use crate::producer::{Consumer, PipelineError, Producer, ProducerContext, Status};
    use crate::request::ImageRequest;
    use crate::resource::ResourceHandle;
    use crate::stats::NoOpStatsTracker;

    /// What a [`ScriptedProducer`] does when asked to produce.
    #[derive(Clone)]
    pub enum Script {
        Bytes(&'static [u8]),
        Empty,
        Fail(PipelineError),
        /// Keep the consumer and context for the test to drive.
        Hold,
    }

    /// Producer of encoded images following a fixed script.
    pub struct ScriptedProducer {
        script: Script,
        pub calls: AtomicUsize,
        pub held: Mutex<Vec<(Arc<dyn Consumer<EncodedImage>>, ProducerContext)>>,
    }

    impl ScriptedProducer {
        pub fn new(script: Script) -> Arc<Self> {
            Arc::new(Self {
                script,
                calls: AtomicUsize::new(0),
                held: Mutex::new(Vec::new()),
            })
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        /// Delivers a final result to every held consumer.
        pub fn complete_held(&self, data: &'static [u8]) {
            let held: Vec<_> = self.held.lock().drain(..).collect();
            for (consumer, _) in held {
                consumer.on_final_result(
                    Some(EncodedImage::from_bytes(Bytes::from_static(data))),
                    Status::NONE,
                );
            }
        }
    }

    impl Producer<EncodedImage> for ScriptedProducer {
        fn produce(&self, consumer: Arc<dyn Consumer<EncodedImage>>, context: ProducerContext) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.script {
                Script::Bytes(data) => consumer.on_final_result(
                    Some(EncodedImage::from_bytes(Bytes::from_static(data))),
                    Status::NONE,
                ),
                Script::Empty => consumer.on_final_result(None, Status::NONE),
                Script::Fail(error) => consumer.on_failure(error.clone()),
                Script::Hold => self.held.lock().push((consumer, context)),
            }
        }

        fn name(&self) -> &'static str {
            "ScriptedProducer"
        }
    }

    /// Producer delegating to a closure.
    pub struct FnProducer<T> {
        calls: AtomicUsize,
        body: Box<dyn Fn(Arc<dyn Consumer<T>>, ProducerContext) + Send + Sync>,
    }

    impl<T> FnProducer<T> {
        pub fn new(
            body: impl Fn(Arc<dyn Consumer<T>>, ProducerContext) + Send + Sync + 'static,
        ) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                body: Box::new(body),
            })
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl<T> Producer<T> for FnProducer<T> {
        fn produce(&self, consumer: Arc<dyn Consumer<T>>, context: ProducerContext) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            (self.body)(consumer, context);
        }

        fn name(&self) -> &'static str {
            "FnProducer"
        }
    }

    /// A small decoded image of the given quality.
    pub fn decoded(quality: QualityInfo) -> ImageRef {
        ResourceHandle::unmanaged(DecodedImage::new(
            4,
            4,
            quality,
            0,
            Box::new(HeapPixelBuffer::new(vec![0; 64])),
        ))
    }

    pub fn decoded_cache() -> Arc<CountingMemoryCache<CacheKey, DecodedImage>> {
        Arc::new(CountingMemoryCache::new(
            "test-decoded",
            MemoryCacheParams::new(1 << 20, 64),
            |image: &DecodedImage| image.size_in_bytes(),
        ))
    }

    pub fn encoded_cache() -> Arc<CountingMemoryCache<CacheKey, EncodedBytes>> {
        Arc::new(CountingMemoryCache::new(
            "test-encoded",
            MemoryCacheParams::new(1 << 20, 64),
            |bytes: &EncodedBytes| bytes.size_in_bytes(),
        ))
    }

    /// A disk cache under `dir` whose reads and writes run inline.
    pub fn buffered_disk_cache(dir: &Path) -> Arc<BufferedDiskCache> {
        let storage = DiskStorageCache::open(DiskCacheConfig::main(dir))
            .unwrap()
            .with_free_space_provider(Arc::new(FixedFreeSpace::new(u64::MAX)));
        Arc::new(BufferedDiskCache::new(
            Arc::new(storage),
            Arc::new(InlineExecutor),
            Arc::new(InlineExecutor),
            Arc::new(NoOpStatsTracker),
        ))
    }

    pub fn context_for(uri: &str) -> ProducerContext {
        let request = ImageRequest::from_uri(uri).unwrap();
        ProducerContext::builder(Arc::new(request)).build()
    }

    pub fn context_with(request: ImageRequest) -> ProducerContext {
        ProducerContext::builder(Arc::new(request)).build()
    }
}
