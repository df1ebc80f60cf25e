//! Thumbnail sources for local images.
//!
//! Local files often carry embedded or platform-generated thumbnails. When
//! one is large enough for the request it is served instead of decoding the
//! full image; otherwise the full image is fetched.

use std::sync::Arc;

use tracing::debug;

use crate::image::EncodedImage;
use crate::producer::{Consumer, PipelineError, Producer, ProducerContext, Status};
use crate::request::ResizeOptions;

const BRANCH_PRODUCER_NAME: &str = "ThumbnailBranchProducer";
const SEPARATE_IMAGES_PRODUCER_NAME: &str = "BranchOnSeparateImagesProducer";

/// An image may be up to a quarter smaller than requested and still be
/// used: requested / actual <= 4 / 3.
const ACCEPTABLE_RATIO_NUMERATOR: u64 = 4;
const ACCEPTABLE_RATIO_DENOMINATOR: u64 = 3;

/// A producer of thumbnails for some images.
pub trait ThumbnailProducer: Producer<EncodedImage> {
    /// Whether this producer can produce a thumbnail satisfying `resize`.
    fn can_provide_image_for_size(&self, resize: Option<&ResizeOptions>) -> bool;
}

fn acceptable_size(size: u32) -> u64 {
    size as u64 * ACCEPTABLE_RATIO_NUMERATOR / ACCEPTABLE_RATIO_DENOMINATOR
}

/// Whether a `width` x `height` image is close enough to the requested size.
///
/// Without resize options the image must reach the default maximum bitmap
/// size in both dimensions.
pub fn is_image_big_enough(width: u32, height: u32, resize: Option<&ResizeOptions>) -> bool {
    let (target_width, target_height) = match resize {
        Some(resize) => (resize.width, resize.height),
        None => (
            ResizeOptions::DEFAULT_MAX_BITMAP_SIZE,
            ResizeOptions::DEFAULT_MAX_BITMAP_SIZE,
        ),
    };
    acceptable_size(width) >= target_width as u64 && acceptable_size(height) >= target_height as u64
}

/// [`is_image_big_enough`] for an encoded image, after its rotation.
fn is_encoded_image_big_enough(image: &EncodedImage, resize: Option<&ResizeOptions>) -> bool {
    let (Some(width), Some(height)) = (image.width(), image.height()) else {
        return false;
    };
    match image.rotation_angle() {
        90 | 270 => is_image_big_enough(height, width, resize),
        _ => is_image_big_enough(width, height, resize),
    }
}

/// Tries each thumbnail producer in order until one yields a big enough
/// image.
///
/// Produces `None` when none can.
pub struct ThumbnailBranchProducer {
    producers: Arc<[Arc<dyn ThumbnailProducer>]>,
}

impl ThumbnailBranchProducer {
    pub fn new(producers: Vec<Arc<dyn ThumbnailProducer>>) -> Self {
        Self {
            producers: producers.into(),
        }
    }
}

/// Starts the first producer at or after `start` that can serve the
/// request. Returns `false` if there is none.
fn produce_from(
    producers: &Arc<[Arc<dyn ThumbnailProducer>]>,
    start: usize,
    downstream: Arc<dyn Consumer<EncodedImage>>,
    context: ProducerContext,
) -> bool {
    let resize = context.request().resize().copied();
    let Some(index) = (start..producers.len())
        .find(|&i| producers[i].can_provide_image_for_size(resize.as_ref()))
    else {
        return false;
    };
    let consumer = Arc::new(ThumbnailConsumer {
        downstream,
        context: context.clone(),
        producers: Arc::clone(producers),
        index,
    });
    producers[index].produce(consumer, context);
    true
}

impl Producer<EncodedImage> for ThumbnailBranchProducer {
    fn produce(&self, consumer: Arc<dyn Consumer<EncodedImage>>, context: ProducerContext) {
        if context.request().resize().is_none() {
            // Full-size requests cannot be satisfied by a thumbnail.
            consumer.on_final_result(None, Status::NONE);
            return;
        }
        if !produce_from(&self.producers, 0, Arc::clone(&consumer), context) {
            consumer.on_final_result(None, Status::NONE);
        }
    }

    fn name(&self) -> &'static str {
        BRANCH_PRODUCER_NAME
    }
}

struct ThumbnailConsumer {
    downstream: Arc<dyn Consumer<EncodedImage>>,
    context: ProducerContext,
    producers: Arc<[Arc<dyn ThumbnailProducer>]>,
    index: usize,
}

impl ThumbnailConsumer {
    fn try_next(&self) -> bool {
        produce_from(
            &self.producers,
            self.index + 1,
            Arc::clone(&self.downstream),
            self.context.clone(),
        )
    }
}

impl Consumer<EncodedImage> for ThumbnailConsumer {
    fn on_intermediate_result(&self, result: EncodedImage, status: Status) {
        self.downstream.on_intermediate_result(result, status);
    }

    fn on_final_result(&self, result: Option<EncodedImage>, status: Status) {
        let resize = self.context.request().resize();
        match result {
            Some(image) if is_encoded_image_big_enough(&image, resize) => {
                self.downstream.on_final_result(Some(image), status);
            }
            other => {
                drop(other);
                if !self.try_next() {
                    self.downstream.on_final_result(None, status);
                }
            }
        }
    }

    fn on_failure(&self, error: PipelineError) {
        debug!(
            request_id = self.context.id(),
            producer = self.producers[self.index].name(),
            error = %error,
            "Thumbnail producer failed"
        );
        if !self.try_next() {
            self.downstream.on_failure(error);
        }
    }

    fn on_cancellation(&self) {
        self.downstream.on_cancellation();
    }

    fn on_progress_update(&self, progress: f32) {
        self.downstream.on_progress_update(progress);
    }
}

/// Serves the first producer's image when it is big enough and falls back
/// to the second producer otherwise.
pub struct BranchOnSeparateImagesProducer {
    first: Arc<dyn Producer<EncodedImage>>,
    second: Arc<dyn Producer<EncodedImage>>,
}

impl BranchOnSeparateImagesProducer {
    pub fn new(first: Arc<dyn Producer<EncodedImage>>, second: Arc<dyn Producer<EncodedImage>>) -> Self {
        Self { first, second }
    }
}

impl Producer<EncodedImage> for BranchOnSeparateImagesProducer {
    fn produce(&self, consumer: Arc<dyn Consumer<EncodedImage>>, context: ProducerContext) {
        let first_consumer = Arc::new(OnFirstImageConsumer {
            downstream: consumer,
            context: context.clone(),
            second: Arc::clone(&self.second),
        });
        self.first.produce(first_consumer, context);
    }

    fn name(&self) -> &'static str {
        SEPARATE_IMAGES_PRODUCER_NAME
    }
}

struct OnFirstImageConsumer {
    downstream: Arc<dyn Consumer<EncodedImage>>,
    context: ProducerContext,
    second: Arc<dyn Producer<EncodedImage>>,
}

impl OnFirstImageConsumer {
    fn start_second(&self) {
        self.second
            .produce(Arc::clone(&self.downstream), self.context.clone());
    }
}

impl Consumer<EncodedImage> for OnFirstImageConsumer {
    fn on_intermediate_result(&self, result: EncodedImage, status: Status) {
        let request = self.context.request();
        if request.local_thumbnail_preview()
            || is_encoded_image_big_enough(&result, request.resize())
        {
            self.downstream.on_intermediate_result(result, status);
        }
    }

    fn on_final_result(&self, result: Option<EncodedImage>, status: Status) {
        let request = self.context.request();
        let Some(image) = result else {
            self.start_second();
            return;
        };
        if is_encoded_image_big_enough(&image, request.resize()) {
            self.downstream.on_final_result(Some(image), status);
            return;
        }
        if request.local_thumbnail_preview() {
            // Show the small image while the full one loads.
            self.downstream.on_intermediate_result(image, status);
        }
        self.start_second();
    }

    fn on_failure(&self, error: PipelineError) {
        debug!(request_id = self.context.id(), error = %error, "First image failed");
        self.start_second();
    }

    fn on_cancellation(&self) {
        self.downstream.on_cancellation();
    }

    fn on_progress_update(&self, progress: f32) {
        self.downstream.on_progress_update(progress);
    }
}
