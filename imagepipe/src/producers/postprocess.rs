//! Postprocessing and caching of postprocessed results.

use std::sync::Arc;

use tracing::{debug, trace};

use crate::executor::Executor;
use crate::image::{DecodeError, DecodedImage, ImageRef, PixelBufferAllocator, Postprocessor};
use crate::key::CacheKeyFactory;
use crate::memory::DecodedMemoryCache;
use crate::producer::{Consumer, PipelineError, Producer, ProducerContext, Status};

use super::bitmap_cache::CachingConsumer;
use super::forward_non_result_events;

const PRODUCER_NAME: &str = "PostprocessorProducer";
const CACHE_PRODUCER_NAME: &str = "PostprocessedBitmapMemoryCacheProducer";

/// Runs the request's postprocessor over the final decoded image.
///
/// Intermediate results are dropped when a postprocessor is set. Requests
/// without one pass straight through.
pub struct PostprocessorProducer {
    input: Arc<dyn Producer<ImageRef>>,
    executor: Arc<dyn Executor>,
    allocator: Arc<dyn PixelBufferAllocator>,
}

impl PostprocessorProducer {
    pub fn new(
        input: Arc<dyn Producer<ImageRef>>,
        executor: Arc<dyn Executor>,
        allocator: Arc<dyn PixelBufferAllocator>,
    ) -> Self {
        Self {
            input,
            executor,
            allocator,
        }
    }
}

impl Producer<ImageRef> for PostprocessorProducer {
    fn produce(&self, consumer: Arc<dyn Consumer<ImageRef>>, context: ProducerContext) {
        let Some(postprocessor) = context.request().postprocessor().cloned() else {
            self.input.produce(consumer, context);
            return;
        };
        let consumer = Arc::new(PostprocessorConsumer {
            downstream: consumer,
            postprocessor,
            executor: Arc::clone(&self.executor),
            allocator: Arc::clone(&self.allocator),
            context: context.clone(),
        });
        self.input.produce(consumer, context);
    }

    fn name(&self) -> &'static str {
        PRODUCER_NAME
    }
}

struct PostprocessorConsumer {
    downstream: Arc<dyn Consumer<ImageRef>>,
    postprocessor: Arc<dyn Postprocessor>,
    executor: Arc<dyn Executor>,
    allocator: Arc<dyn PixelBufferAllocator>,
    context: ProducerContext,
}

fn run_postprocessor(
    postprocessor: &dyn Postprocessor,
    source: &ImageRef,
    allocator: &dyn PixelBufferAllocator,
) -> Result<DecodedImage, DecodeError> {
    let source = source.get().map_err(|_| DecodeError::InvalidInput)?;
    postprocessor
        .process(source, allocator)
        .map_err(|e| match e {
            DecodeError::Postprocess { .. } => e,
            other => DecodeError::Postprocess {
                name: postprocessor.name().to_string(),
                reason: other.to_string(),
            },
        })
}

impl Consumer<ImageRef> for PostprocessorConsumer {
    fn on_intermediate_result(&self, _result: ImageRef, _status: Status) {
        trace!(request_id = self.context.id(), "Dropping intermediate before postprocessing");
    }

    fn on_final_result(&self, result: Option<ImageRef>, status: Status) {
        let Some(source) = result else {
            self.downstream.on_final_result(None, status);
            return;
        };

        let downstream = Arc::clone(&self.downstream);
        let postprocessor = Arc::clone(&self.postprocessor);
        let allocator = Arc::clone(&self.allocator);
        let context = self.context.clone();
        self.executor.execute(Box::new(move || {
            let listener = context.listener();
            listener.on_producer_start(context.id(), PRODUCER_NAME);
            if context.is_cancelled() {
                listener.on_producer_finish_with_cancellation(context.id(), PRODUCER_NAME);
                downstream.on_cancellation();
                return;
            }

            let outcome = run_postprocessor(postprocessor.as_ref(), &source, allocator.as_ref());
            drop(source);
            let extras = [("postprocessor", postprocessor.name().to_string())];
            match outcome {
                Ok(processed) => {
                    listener.on_producer_finish_with_success(context.id(), PRODUCER_NAME, &extras);
                    downstream.on_progress_update(1.0);
                    downstream.on_final_result(Some(processed.into_handle(allocator)), status);
                }
                Err(e) => {
                    debug!(request_id = context.id(), error = %e, "Postprocessing failed");
                    let error = PipelineError::Decode(e);
                    listener.on_producer_finish_with_failure(
                        context.id(),
                        PRODUCER_NAME,
                        &error,
                        &extras,
                    );
                    downstream.on_failure(error);
                }
            }
        }));
    }

    forward_non_result_events!();
}

/// Memory cache for postprocessed images.
///
/// Only postprocessors that report a cache id are cached; everything else is
/// passed through to the input.
pub struct PostprocessedBitmapMemoryCacheProducer {
    cache: Arc<DecodedMemoryCache>,
    key_factory: Arc<dyn CacheKeyFactory>,
    input: Arc<dyn Producer<ImageRef>>,
}

impl PostprocessedBitmapMemoryCacheProducer {
    pub fn new(
        cache: Arc<DecodedMemoryCache>,
        key_factory: Arc<dyn CacheKeyFactory>,
        input: Arc<dyn Producer<ImageRef>>,
    ) -> Self {
        Self {
            cache,
            key_factory,
            input,
        }
    }
}

impl Producer<ImageRef> for PostprocessedBitmapMemoryCacheProducer {
    fn produce(&self, consumer: Arc<dyn Consumer<ImageRef>>, context: ProducerContext) {
        let listener = Arc::clone(context.listener());
        let request_id = context.id().to_string();
        listener.on_producer_start(&request_id, CACHE_PRODUCER_NAME);

        let request = context.request();
        let cacheable = request.is_memory_cache_enabled()
            && request
                .postprocessor()
                .is_some_and(|pp| pp.cache_id().is_some());
        if !cacheable {
            listener.on_producer_finish_with_success(
                &request_id,
                CACHE_PRODUCER_NAME,
                &[("cached_value_found", "false".to_string())],
            );
            self.input.produce(consumer, context);
            return;
        }

        let key = self
            .key_factory
            .postprocessed_cache_key(request, context.caller_context());
        if let Some(cached) = self.cache.get(&key) {
            listener.on_producer_finish_with_success(
                &request_id,
                CACHE_PRODUCER_NAME,
                &[("cached_value_found", "true".to_string())],
            );
            listener.on_ultimate_producer_reached(&request_id, CACHE_PRODUCER_NAME, true);
            consumer.on_progress_update(1.0);
            consumer.on_final_result(Some(cached), Status::NONE);
            return;
        }

        listener.on_producer_finish_with_success(
            &request_id,
            CACHE_PRODUCER_NAME,
            &[("cached_value_found", "false".to_string())],
        );
        let consumer = Arc::new(CachingConsumer {
            downstream: consumer,
            cache: Arc::clone(&self.cache),
            key,
        });
        self.input.produce(consumer, context);
    }

    fn name(&self) -> &'static str {
        CACHE_PRODUCER_NAME
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::InlineExecutor;
    use crate::image::{HeapPixelAllocator, QualityInfo};
    use crate::key::DefaultCacheKeyFactory;
    use crate::producer::test_support::{Event, RecordingConsumer};
    use crate::producers::test_support::{context_with, decoded, decoded_cache, FnProducer};
    use crate::request::ImageRequest;

    const URI: &str = "https://example.com/photo.jpg";

    struct Halve {
        cache_id: Option<String>,
    }

    impl Postprocessor for Halve {
        fn name(&self) -> &str {
            "halve"
        }

        fn cache_id(&self) -> Option<String> {
            self.cache_id.clone()
        }

        fn process(
            &self,
            source: &DecodedImage,
            allocator: &dyn PixelBufferAllocator,
        ) -> Result<DecodedImage, DecodeError> {
            let (width, height) = (source.width() / 2, source.height() / 2);
            let buffer = allocator.allocate(width, height, Default::default())?;
            Ok(DecodedImage::new(
                width,
                height,
                source.quality(),
                source.rotation_angle(),
                buffer,
            ))
        }
    }

    struct Broken;

    impl Postprocessor for Broken {
        fn name(&self) -> &str {
            "broken"
        }

        fn process(
            &self,
            _source: &DecodedImage,
            _allocator: &dyn PixelBufferAllocator,
        ) -> Result<DecodedImage, DecodeError> {
            Err(DecodeError::Malformed("no pixels".into()))
        }
    }

    fn decoding_input() -> Arc<FnProducer<ImageRef>> {
        FnProducer::new(|consumer: Arc<dyn Consumer<ImageRef>>, _| {
            consumer.on_intermediate_result(decoded(QualityInfo::partial(1, false)), Status::NONE);
            consumer.on_final_result(Some(decoded(QualityInfo::FULL)), Status::NONE);
        })
    }

    fn postprocessor_producer(input: Arc<FnProducer<ImageRef>>) -> PostprocessorProducer {
        PostprocessorProducer::new(
            input,
            Arc::new(InlineExecutor),
            Arc::new(HeapPixelAllocator::new()),
        )
    }

    #[test]
    fn test_final_result_is_postprocessed() {
        let producer = postprocessor_producer(decoding_input());
        let request = ImageRequest::from_uri(URI)
            .unwrap()
            .with_postprocessor(Arc::new(Halve { cache_id: None }));
        let consumer = RecordingConsumer::<ImageRef>::new();
        producer.produce(consumer.clone(), context_with(request));

        let events = consumer.events.lock();
        assert!(!events.iter().any(|e| matches!(e, Event::Intermediate(_))));
        let Some(Event::Final(Some(image))) = events.last() else {
            panic!("expected a final image");
        };
        assert_eq!(image.get().unwrap().width(), 2);
    }

    #[test]
    fn test_without_postprocessor_passes_through() {
        let producer = postprocessor_producer(decoding_input());
        let consumer = RecordingConsumer::<ImageRef>::new();
        producer.produce(
            consumer.clone(),
            context_with(ImageRequest::from_uri(URI).unwrap()),
        );

        let events = consumer.events.lock();
        assert!(matches!(events[0], Event::Intermediate(_)));
        assert!(matches!(
            events.last(),
            Some(Event::Final(Some(image))) if image.get().unwrap().width() == 4
        ));
    }

    #[test]
    fn test_postprocessor_error_fails_request() {
        let producer = postprocessor_producer(decoding_input());
        let request = ImageRequest::from_uri(URI)
            .unwrap()
            .with_postprocessor(Arc::new(Broken));
        let consumer = RecordingConsumer::<ImageRef>::new();
        producer.produce(consumer.clone(), context_with(request));

        assert!(matches!(
            consumer.events.lock().last(),
            Some(Event::Failure(PipelineError::Decode(DecodeError::Postprocess { name, .. })))
                if name == "broken"
        ));
    }

    #[test]
    fn test_cacheable_postprocessor_result_is_cached_and_reused() {
        let cache = decoded_cache();
        let input = FnProducer::new(|consumer: Arc<dyn Consumer<ImageRef>>, _| {
            consumer.on_final_result(Some(decoded(QualityInfo::FULL)), Status::NONE);
        });
        let producer = PostprocessedBitmapMemoryCacheProducer::new(
            cache.clone(),
            Arc::new(DefaultCacheKeyFactory),
            input.clone(),
        );
        let request = ImageRequest::from_uri(URI).unwrap().with_postprocessor(Arc::new(Halve {
            cache_id: Some("v1".into()),
        }));
        let key = DefaultCacheKeyFactory.postprocessed_cache_key(&request, &Default::default());

        producer.produce(RecordingConsumer::<ImageRef>::new(), context_with(request.clone()));
        assert!(cache.contains(&key));

        let second = RecordingConsumer::<ImageRef>::new();
        producer.produce(second.clone(), context_with(request));
        assert_eq!(input.calls(), 1);
        assert!(matches!(second.events.lock().last(), Some(Event::Final(Some(_)))));
    }

    #[test]
    fn test_uncacheable_postprocessor_is_not_cached() {
        let cache = decoded_cache();
        let input = FnProducer::new(|consumer: Arc<dyn Consumer<ImageRef>>, _| {
            consumer.on_final_result(Some(decoded(QualityInfo::FULL)), Status::NONE);
        });
        let producer = PostprocessedBitmapMemoryCacheProducer::new(
            cache.clone(),
            Arc::new(DefaultCacheKeyFactory),
            input,
        );
        let request = ImageRequest::from_uri(URI)
            .unwrap()
            .with_postprocessor(Arc::new(Halve { cache_id: None }));
        producer.produce(RecordingConsumer::<ImageRef>::new(), context_with(request));

        assert_eq!(cache.count(), 0);
    }
}
