//! Header probing for format, dimensions and orientation.

use std::sync::Arc;

use tracing::trace;

use crate::image::{EncodedImage, ImageDecoder};
use crate::producer::{Consumer, Producer, ProducerContext, Status};

use super::forward_non_result_events;

const PRODUCER_NAME: &str = "AddImageTransformMetaDataProducer";

/// Fills in the metadata downstream stages plan transforms from.
pub struct AddImageTransformMetaDataProducer {
    decoder: Arc<dyn ImageDecoder>,
    input: Arc<dyn Producer<EncodedImage>>,
}

impl AddImageTransformMetaDataProducer {
    pub fn new(decoder: Arc<dyn ImageDecoder>, input: Arc<dyn Producer<EncodedImage>>) -> Self {
        Self { decoder, input }
    }
}

impl Producer<EncodedImage> for AddImageTransformMetaDataProducer {
    fn produce(&self, consumer: Arc<dyn Consumer<EncodedImage>>, context: ProducerContext) {
        let consumer = Arc::new(MetadataConsumer {
            downstream: consumer,
            decoder: Arc::clone(&self.decoder),
        });
        self.input.produce(consumer, context);
    }

    fn name(&self) -> &'static str {
        PRODUCER_NAME
    }
}

struct MetadataConsumer {
    downstream: Arc<dyn Consumer<EncodedImage>>,
    decoder: Arc<dyn ImageDecoder>,
}

impl MetadataConsumer {
    fn annotate(&self, mut image: EncodedImage) -> EncodedImage {
        if image.is_metadata_available() {
            return image;
        }
        let probed = image.data().and_then(|data| self.decoder.probe(data));
        match probed {
            Some(metadata) => image.apply_metadata(&metadata),
            // Partial data may not contain the full header yet.
            None => trace!(size = image.size(), "Header probe found no metadata"),
        }
        image
    }
}

impl Consumer<EncodedImage> for MetadataConsumer {
    fn on_intermediate_result(&self, result: EncodedImage, status: Status) {
        self.downstream
            .on_intermediate_result(self.annotate(result), status);
    }

    fn on_final_result(&self, result: Option<EncodedImage>, status: Status) {
        self.downstream
            .on_final_result(result.map(|image| self.annotate(image)), status);
    }

    forward_non_result_events!();
}
