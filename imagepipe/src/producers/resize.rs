//! Downsample and rotation planning.
//!
//! No pixels are touched here: the stage records the sample size and
//! rotation on the encoded image and the decoder applies them.

use std::sync::Arc;

use crate::image::EncodedImage;
use crate::producer::{Consumer, Producer, ProducerContext, Status};
use crate::request::{ResizeOptions, Rotation};

use super::forward_non_result_events;

const PRODUCER_NAME: &str = "ResizeAndRotateProducer";

/// Fraction of the gap between two sample sizes that still rounds to the
/// smaller one.
const ROUNDUP_FRACTION: f64 = 1.0 / 3.0;

/// Sample size for decoding a `width` x `height` image to fit `resize`.
///
/// Dimensions are taken after `rotation`. JPEG decoders only downsample by
/// powers of two, so JPEG sample sizes are powers of two. The result keeps
/// the larger decoded dimension within the request's maximum bitmap size.
pub fn determine_sample_size(
    resize: Option<&ResizeOptions>,
    width: u32,
    height: u32,
    rotation: Rotation,
    is_jpeg: bool,
) -> u32 {
    if width == 0 || height == 0 {
        return 1;
    }
    let (width, height) = if rotation.swaps_dimensions() {
        (height, width)
    } else {
        (width, height)
    };

    let ratio = resize.map_or(1.0, |r| {
        (r.width as f64 / width as f64).max(r.height as f64 / height as f64)
    });
    let mut sample_size = if is_jpeg {
        ratio_to_sample_size_jpeg(ratio)
    } else {
        ratio_to_sample_size(ratio)
    };

    let max_bitmap_size = resize
        .map_or(ResizeOptions::DEFAULT_MAX_BITMAP_SIZE, |r| r.max_bitmap_size)
        .max(1) as f64;
    let max_dimension = width.max(height) as f64;
    while max_dimension / sample_size as f64 > max_bitmap_size {
        if is_jpeg {
            sample_size *= 2;
        } else {
            sample_size += 1;
        }
    }
    sample_size
}

fn ratio_to_sample_size(ratio: f64) -> u32 {
    if ratio > 0.5 + 0.5 * ROUNDUP_FRACTION || ratio <= 0.0 {
        return 1;
    }
    let mut sample_size: u32 = 2;
    loop {
        let n = sample_size as f64;
        let interval = 1.0 / (n * n - n);
        let compare = 1.0 / n + interval * ROUNDUP_FRACTION;
        if compare <= ratio {
            return sample_size - 1;
        }
        sample_size += 1;
    }
}

fn ratio_to_sample_size_jpeg(ratio: f64) -> u32 {
    if ratio > 0.5 + 0.5 * ROUNDUP_FRACTION || ratio <= 0.0 {
        return 1;
    }
    let mut sample_size: u32 = 2;
    loop {
        let interval = 1.0 / (2.0 * sample_size as f64);
        let compare = interval + interval * ROUNDUP_FRACTION;
        if compare <= ratio {
            return sample_size;
        }
        sample_size *= 2;
    }
}

/// Annotates encoded images with the sample size and rotation to decode
/// with.
pub struct ResizeAndRotateProducer {
    input: Arc<dyn Producer<EncodedImage>>,
    resizing_enabled: bool,
}

impl ResizeAndRotateProducer {
    pub fn new(input: Arc<dyn Producer<EncodedImage>>, resizing_enabled: bool) -> Self {
        Self {
            input,
            resizing_enabled,
        }
    }
}

impl Producer<EncodedImage> for ResizeAndRotateProducer {
    fn produce(&self, consumer: Arc<dyn Consumer<EncodedImage>>, context: ProducerContext) {
        let consumer = Arc::new(TransformingConsumer {
            downstream: consumer,
            context: context.clone(),
            resizing_enabled: self.resizing_enabled,
        });
        self.input.produce(consumer, context);
    }

    fn name(&self) -> &'static str {
        PRODUCER_NAME
    }
}

struct TransformingConsumer {
    downstream: Arc<dyn Consumer<EncodedImage>>,
    context: ProducerContext,
    resizing_enabled: bool,
}

impl TransformingConsumer {
    fn transform(&self, mut image: EncodedImage, status: Status, is_last: bool) -> (EncodedImage, Status) {
        if status.resizing_done {
            return (image, status);
        }
        let (Some(width), Some(height)) = (image.width(), image.height()) else {
            return (image, status);
        };

        let request = self.context.request();
        let rotation = request.rotation().resolve(image.rotation_angle());
        let sample_size = if self.resizing_enabled {
            determine_sample_size(
                request.resize(),
                width,
                height,
                rotation,
                image.format().is_jpeg(),
            )
        } else {
            1
        };
        image.set_sample_size(sample_size);
        image.set_rotation_angle(rotation.degrees());

        if is_last {
            let listener = self.context.listener();
            listener.on_producer_start(self.context.id(), PRODUCER_NAME);
            listener.on_producer_finish_with_success(
                self.context.id(),
                PRODUCER_NAME,
                &[
                    ("original_size", format!("{width}x{height}")),
                    (
                        "requested_size",
                        request.resize().map_or_else(|| "unspecified".into(), |r| r.to_string()),
                    ),
                    ("sample_size", sample_size.to_string()),
                    ("rotation", rotation.degrees().to_string()),
                ],
            );
        }
        (image, status.with_resizing_done())
    }
}

impl Consumer<EncodedImage> for TransformingConsumer {
    fn on_intermediate_result(&self, result: EncodedImage, status: Status) {
        let (image, status) = self.transform(result, status, false);
        self.downstream.on_intermediate_result(image, status);
    }

    fn on_final_result(&self, result: Option<EncodedImage>, status: Status) {
        match result {
            Some(result) => {
                let (image, status) = self.transform(result, status, true);
                self.downstream.on_final_result(Some(image), status);
            }
            None => self.downstream.on_final_result(None, status),
        }
    }

    forward_non_result_events!();
}
