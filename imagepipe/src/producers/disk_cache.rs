//! Disk cache read and write stages.

use std::sync::Arc;

use crate::disk::{BufferedDiskCache, DiskLookup};
use crate::image::EncodedImage;
use crate::key::{CacheKey, CacheKeyFactory};
use crate::producer::{Consumer, Producer, ProducerContext, Status};
use crate::request::{CacheChoice, RequestLevel};

use super::forward_non_result_events;

const READ_PRODUCER_NAME: &str = "DiskCacheReadProducer";
const WRITE_PRODUCER_NAME: &str = "DiskCacheWriteProducer";

/// The disk cache instances a request may be routed to.
#[derive(Clone)]
pub struct DiskCaches {
    default: Arc<BufferedDiskCache>,
    small: Arc<BufferedDiskCache>,
}

impl DiskCaches {
    pub fn new(default: Arc<BufferedDiskCache>, small: Arc<BufferedDiskCache>) -> Self {
        Self { default, small }
    }

    /// Routes every request to the same cache.
    pub fn single(cache: Arc<BufferedDiskCache>) -> Self {
        Self {
            small: Arc::clone(&cache),
            default: cache,
        }
    }

    pub fn for_choice(&self, choice: CacheChoice) -> &Arc<BufferedDiskCache> {
        match choice {
            CacheChoice::Default => &self.default,
            CacheChoice::Small => &self.small,
        }
    }

    pub fn default_cache(&self) -> &Arc<BufferedDiskCache> {
        &self.default
    }

    pub fn small_cache(&self) -> &Arc<BufferedDiskCache> {
        &self.small
    }

    /// Both caches, without repeating a shared instance.
    pub fn distinct(&self) -> Vec<&Arc<BufferedDiskCache>> {
        if Arc::ptr_eq(&self.default, &self.small) {
            vec![&self.default]
        } else {
            vec![&self.default, &self.small]
        }
    }
}

/// Serves encoded images from disk, falling back to the input on a miss.
pub struct DiskCacheReadProducer {
    caches: DiskCaches,
    key_factory: Arc<dyn CacheKeyFactory>,
    input: Arc<dyn Producer<EncodedImage>>,
}

impl DiskCacheReadProducer {
    pub fn new(
        caches: DiskCaches,
        key_factory: Arc<dyn CacheKeyFactory>,
        input: Arc<dyn Producer<EncodedImage>>,
    ) -> Self {
        Self {
            caches,
            key_factory,
            input,
        }
    }
}

/// Runs the input unless the request forbids going below the disk tier.
fn produce_from_input(
    input: &Arc<dyn Producer<EncodedImage>>,
    consumer: Arc<dyn Consumer<EncodedImage>>,
    context: ProducerContext,
) {
    if context.lowest_permitted_level() >= RequestLevel::DiskCache {
        context
            .listener()
            .on_ultimate_producer_reached(context.id(), READ_PRODUCER_NAME, false);
        consumer.on_final_result(None, Status::NONE);
    } else {
        input.produce(consumer, context);
    }
}

impl Producer<EncodedImage> for DiskCacheReadProducer {
    fn produce(&self, consumer: Arc<dyn Consumer<EncodedImage>>, context: ProducerContext) {
        let listener = Arc::clone(context.listener());
        let request_id = context.id().to_string();

        let request = context.request();
        if !request.is_disk_cache_enabled() {
            produce_from_input(&self.input, consumer, context);
            return;
        }

        listener.on_producer_start(&request_id, READ_PRODUCER_NAME);
        let key = self
            .key_factory
            .encoded_cache_key(request, context.caller_context());
        let cache = self.caches.for_choice(request.cache_choice());
        let token = context.cancellation_token();
        let input = Arc::clone(&self.input);
        let lookup_key = key.clone();

        cache.get_with_callback(
            &lookup_key,
            token,
            Box::new(move |lookup| match lookup {
                DiskLookup::Hit(mut image) => {
                    let size = image.size();
                    image.set_encoded_cache_key(key);
                    listener.on_producer_finish_with_success(
                        &request_id,
                        READ_PRODUCER_NAME,
                        &[
                            ("cached_value_found", "true".to_string()),
                            ("encoded_image_size", size.to_string()),
                        ],
                    );
                    listener.on_ultimate_producer_reached(&request_id, READ_PRODUCER_NAME, true);
                    consumer.on_progress_update(1.0);
                    consumer.on_final_result(Some(image), Status::NONE);
                }
                DiskLookup::Miss => {
                    listener.on_producer_finish_with_success(
                        &request_id,
                        READ_PRODUCER_NAME,
                        &[("cached_value_found", "false".to_string())],
                    );
                    produce_from_input(&input, consumer, context);
                }
                DiskLookup::Cancelled => {
                    listener.on_producer_finish_with_cancellation(&request_id, READ_PRODUCER_NAME);
                    consumer.on_cancellation();
                }
            }),
        );
    }

    fn name(&self) -> &'static str {
        READ_PRODUCER_NAME
    }
}

/// Writes fetched encoded images to disk.
pub struct DiskCacheWriteProducer {
    caches: DiskCaches,
    key_factory: Arc<dyn CacheKeyFactory>,
    input: Arc<dyn Producer<EncodedImage>>,
}

impl DiskCacheWriteProducer {
    pub fn new(
        caches: DiskCaches,
        key_factory: Arc<dyn CacheKeyFactory>,
        input: Arc<dyn Producer<EncodedImage>>,
    ) -> Self {
        Self {
            caches,
            key_factory,
            input,
        }
    }
}

impl Producer<EncodedImage> for DiskCacheWriteProducer {
    fn produce(&self, consumer: Arc<dyn Consumer<EncodedImage>>, context: ProducerContext) {
        if context.lowest_permitted_level() >= RequestLevel::DiskCache {
            context
                .listener()
                .on_producer_event(context.id(), WRITE_PRODUCER_NAME, "skipped_below_disk");
            consumer.on_final_result(None, Status::NONE);
            return;
        }

        let request = context.request();
        if !request.is_disk_cache_enabled() {
            self.input.produce(consumer, context);
            return;
        }

        let consumer = Arc::new(DiskWriteConsumer {
            downstream: consumer,
            cache: Arc::clone(self.caches.for_choice(request.cache_choice())),
            key: self
                .key_factory
                .encoded_cache_key(request, context.caller_context()),
        });
        self.input.produce(consumer, context);
    }

    fn name(&self) -> &'static str {
        WRITE_PRODUCER_NAME
    }
}

struct DiskWriteConsumer {
    downstream: Arc<dyn Consumer<EncodedImage>>,
    cache: Arc<BufferedDiskCache>,
    key: CacheKey,
}

impl Consumer<EncodedImage> for DiskWriteConsumer {
    fn on_intermediate_result(&self, result: EncodedImage, status: Status) {
        self.downstream.on_intermediate_result(result, status);
    }

    fn on_final_result(&self, result: Option<EncodedImage>, status: Status) {
        if let Some(image) = &result {
            if !status.do_not_cache_encoded {
                let key = image.encoded_cache_key().unwrap_or(&self.key);
                self.cache.put(key, image);
            }
        }
        self.downstream.on_final_result(result, status);
    }

    forward_non_result_events!();
}
