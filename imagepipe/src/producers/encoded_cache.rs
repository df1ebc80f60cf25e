//! Encoded memory cache lookup and population.

use std::sync::Arc;

use crate::image::EncodedImage;
use crate::key::{CacheKey, CacheKeyFactory};
use crate::memory::EncodedMemoryCache;
use crate::producer::{Consumer, Producer, ProducerContext, Status};
use crate::request::RequestLevel;

use super::forward_non_result_events;

const PRODUCER_NAME: &str = "EncodedMemoryCacheProducer";

/// Serves encoded bytes from memory and caches fetched bytes.
pub struct EncodedMemoryCacheProducer {
    cache: Arc<EncodedMemoryCache>,
    key_factory: Arc<dyn CacheKeyFactory>,
    input: Arc<dyn Producer<EncodedImage>>,
}

impl EncodedMemoryCacheProducer {
    pub fn new(
        cache: Arc<EncodedMemoryCache>,
        key_factory: Arc<dyn CacheKeyFactory>,
        input: Arc<dyn Producer<EncodedImage>>,
    ) -> Self {
        Self {
            cache,
            key_factory,
            input,
        }
    }
}

impl Producer<EncodedImage> for EncodedMemoryCacheProducer {
    fn produce(&self, consumer: Arc<dyn Consumer<EncodedImage>>, context: ProducerContext) {
        let listener = Arc::clone(context.listener());
        let request_id = context.id().to_string();
        listener.on_producer_start(&request_id, PRODUCER_NAME);

        let request = context.request();
        if !request.is_memory_cache_enabled() {
            listener.on_producer_finish_with_success(&request_id, PRODUCER_NAME, &[]);
            self.input.produce(consumer, context);
            return;
        }

        let key = self
            .key_factory
            .encoded_cache_key(request, context.caller_context());

        if let Some(bytes) = self.cache.get(&key) {
            let mut image = EncodedImage::new(bytes);
            image.set_encoded_cache_key(key);
            listener.on_producer_finish_with_success(
                &request_id,
                PRODUCER_NAME,
                &[("cached_value_found", "true".to_string())],
            );
            listener.on_ultimate_producer_reached(&request_id, PRODUCER_NAME, true);
            consumer.on_progress_update(1.0);
            consumer.on_final_result(Some(image), Status::NONE);
            return;
        }

        listener.on_producer_finish_with_success(
            &request_id,
            PRODUCER_NAME,
            &[("cached_value_found", "false".to_string())],
        );
        if context.lowest_permitted_level() >= RequestLevel::EncodedMemoryCache {
            listener.on_ultimate_producer_reached(&request_id, PRODUCER_NAME, false);
            consumer.on_final_result(None, Status::NONE);
            return;
        }

        let consumer = Arc::new(EncodedCachingConsumer {
            downstream: consumer,
            cache: Arc::clone(&self.cache),
            key,
        });
        self.input.produce(consumer, context);
    }

    fn name(&self) -> &'static str {
        PRODUCER_NAME
    }
}

struct EncodedCachingConsumer {
    downstream: Arc<dyn Consumer<EncodedImage>>,
    cache: Arc<EncodedMemoryCache>,
    key: CacheKey,
}

impl Consumer<EncodedImage> for EncodedCachingConsumer {
    fn on_intermediate_result(&self, result: EncodedImage, status: Status) {
        self.downstream.on_intermediate_result(result, status);
    }

    fn on_final_result(&self, result: Option<EncodedImage>, status: Status) {
        let Some(image) = result else {
            self.downstream.on_final_result(None, status);
            return;
        };
        if status.do_not_cache_encoded {
            self.downstream.on_final_result(Some(image), status);
            return;
        }

        let cached = image
            .byte_handle()
            .and_then(|bytes| self.cache.put(self.key.clone(), &bytes));
        match cached {
            Some(bytes) => {
                let mut from_cache = EncodedImage::new(bytes);
                from_cache.copy_metadata_from(&image);
                from_cache.set_encoded_cache_key(self.key.clone());
                drop(image);
                self.downstream.on_progress_update(1.0);
                self.downstream.on_final_result(Some(from_cache), status);
            }
            None => self.downstream.on_final_result(Some(image), status),
        }
    }

    forward_non_result_events!();
}
