//! Decoded memory cache lookup and population.

use std::sync::Arc;

use crate::image::{DecodedImage, ImageRef};
use crate::key::{CacheKey, CacheKeyFactory};
use crate::memory::DecodedMemoryCache;
use crate::producer::{Consumer, Producer, ProducerContext, Status};
use crate::request::RequestLevel;

use super::forward_non_result_events;

const PRODUCER_NAME: &str = "BitmapMemoryCacheProducer";
const GET_PRODUCER_NAME: &str = "BitmapMemoryCacheGetProducer";

/// Serves full-quality decoded images from memory and caches what the
/// upstream decodes.
///
/// A cached image that is not full quality is delivered as an intermediate
/// result and the request continues upstream.
pub struct BitmapMemoryCacheProducer {
    cache: Arc<DecodedMemoryCache>,
    key_factory: Arc<dyn CacheKeyFactory>,
    input: Arc<dyn Producer<ImageRef>>,
    write_to_cache: bool,
    name: &'static str,
}

impl BitmapMemoryCacheProducer {
    pub fn new(
        cache: Arc<DecodedMemoryCache>,
        key_factory: Arc<dyn CacheKeyFactory>,
        input: Arc<dyn Producer<ImageRef>>,
    ) -> Self {
        Self {
            cache,
            key_factory,
            input,
            write_to_cache: true,
            name: PRODUCER_NAME,
        }
    }

    /// A lookup-only variant placed before the thread handoff.
    pub fn get_only(
        cache: Arc<DecodedMemoryCache>,
        key_factory: Arc<dyn CacheKeyFactory>,
        input: Arc<dyn Producer<ImageRef>>,
    ) -> Self {
        Self {
            write_to_cache: false,
            name: GET_PRODUCER_NAME,
            ..Self::new(cache, key_factory, input)
        }
    }
}

impl Producer<ImageRef> for BitmapMemoryCacheProducer {
    fn produce(&self, consumer: Arc<dyn Consumer<ImageRef>>, context: ProducerContext) {
        let listener = Arc::clone(context.listener());
        let request_id = context.id().to_string();
        listener.on_producer_start(&request_id, self.name);

        let request = context.request();
        if !request.is_memory_cache_enabled() {
            listener.on_producer_finish_with_success(
                &request_id,
                self.name,
                &[("cached_value_found", "false".to_string())],
            );
            self.input.produce(consumer, context);
            return;
        }

        let key = self
            .key_factory
            .decoded_cache_key(request, context.caller_context());

        if let Some(cached) = self.cache.get(&key) {
            let is_final = cached.get().is_ok_and(DecodedImage::is_full_quality);
            if is_final {
                listener.on_producer_finish_with_success(
                    &request_id,
                    self.name,
                    &[("cached_value_found", "true".to_string())],
                );
                listener.on_ultimate_producer_reached(&request_id, self.name, true);
                consumer.on_progress_update(1.0);
                consumer.on_final_result(Some(cached), Status::NONE);
                return;
            }
            consumer.on_intermediate_result(cached, Status::NONE);
        }

        if context.lowest_permitted_level() >= RequestLevel::BitmapMemoryCache {
            listener.on_producer_finish_with_success(
                &request_id,
                self.name,
                &[("cached_value_found", "false".to_string())],
            );
            listener.on_ultimate_producer_reached(&request_id, self.name, false);
            consumer.on_final_result(None, Status::NONE);
            return;
        }

        let consumer: Arc<dyn Consumer<ImageRef>> = if self.write_to_cache {
            Arc::new(CachingConsumer {
                downstream: consumer,
                cache: Arc::clone(&self.cache),
                key,
            })
        } else {
            consumer
        };
        listener.on_producer_finish_with_success(
            &request_id,
            self.name,
            &[("cached_value_found", "false".to_string())],
        );
        self.input.produce(consumer, context);
    }

    fn name(&self) -> &'static str {
        self.name
    }
}

/// Caches upstream results and hands the cache's copy downstream.
pub(crate) struct CachingConsumer {
    pub(crate) downstream: Arc<dyn Consumer<ImageRef>>,
    pub(crate) cache: Arc<DecodedMemoryCache>,
    pub(crate) key: CacheKey,
}

impl CachingConsumer {
    fn cache_and_unwrap(&self, result: ImageRef) -> ImageRef {
        self.cache.put(self.key.clone(), &result).unwrap_or(result)
    }
}

impl Consumer<ImageRef> for CachingConsumer {
    fn on_intermediate_result(&self, result: ImageRef, status: Status) {
        if status.placeholder {
            self.downstream.on_intermediate_result(result, status);
            return;
        }

        // A better image already cached wins over a new partial one.
        if let Some(existing) = self.cache.get(&self.key) {
            let keep_existing = match (existing.get(), result.get()) {
                (Ok(old), Ok(new)) => {
                    old.is_full_quality() || old.quality().quality >= new.quality().quality
                }
                _ => false,
            };
            if keep_existing {
                drop(result);
                self.downstream.on_intermediate_result(existing, status);
                return;
            }
        }

        let cached = self.cache_and_unwrap(result);
        self.downstream.on_intermediate_result(cached, status);
    }

    fn on_final_result(&self, result: Option<ImageRef>, status: Status) {
        let Some(result) = result else {
            self.downstream.on_final_result(None, status);
            return;
        };
        if status.placeholder {
            self.downstream.on_final_result(Some(result), status);
            return;
        }
        let cached = self.cache_and_unwrap(result);
        self.downstream.on_progress_update(1.0);
        self.downstream.on_final_result(Some(cached), status);
    }

    forward_non_result_events!();
}
