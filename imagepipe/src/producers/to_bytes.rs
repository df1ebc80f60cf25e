//! Exposes encoded images as shared byte handles.

use std::sync::Arc;

use tracing::warn;

use crate::image::{EncodedBytes, EncodedImage};
use crate::producer::{Consumer, Producer, ProducerContext, Status};
use crate::resource::ResourceHandle;

use super::forward_non_result_events;

const PRODUCER_NAME: &str = "ToBytesProducer";

/// Adapts the encoded chain for callers that want the raw bytes.
pub struct ToBytesProducer {
    input: Arc<dyn Producer<EncodedImage>>,
}

impl ToBytesProducer {
    pub fn new(input: Arc<dyn Producer<EncodedImage>>) -> Self {
        Self { input }
    }
}

impl Producer<ResourceHandle<EncodedBytes>> for ToBytesProducer {
    fn produce(
        &self,
        consumer: Arc<dyn Consumer<ResourceHandle<EncodedBytes>>>,
        context: ProducerContext,
    ) {
        self.input
            .produce(Arc::new(ToBytesConsumer { downstream: consumer }), context);
    }

    fn name(&self) -> &'static str {
        PRODUCER_NAME
    }
}

struct ToBytesConsumer {
    downstream: Arc<dyn Consumer<ResourceHandle<EncodedBytes>>>,
}

impl Consumer<EncodedImage> for ToBytesConsumer {
    fn on_intermediate_result(&self, result: EncodedImage, status: Status) {
        if let Some(bytes) = result.byte_handle() {
            self.downstream.on_intermediate_result(bytes, status);
        }
    }

    fn on_final_result(&self, result: Option<EncodedImage>, status: Status) {
        let bytes = result.and_then(|image| {
            let bytes = image.byte_handle();
            if bytes.is_none() {
                warn!("Final encoded image was already closed");
            }
            bytes
        });
        self.downstream.on_final_result(bytes, status);
    }

    forward_non_result_events!();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::producer::test_support::{Event, RecordingConsumer};
    use crate::producers::test_support::{context_for, Script, ScriptedProducer};

    #[test]
    fn test_final_image_becomes_bytes() {
        let producer = ToBytesProducer::new(ScriptedProducer::new(Script::Bytes(b"payload")));
        let consumer = RecordingConsumer::<ResourceHandle<EncodedBytes>>::new();
        producer.produce(consumer.clone(), context_for("https://example.com/a.jpg"));

        let events = consumer.events.lock();
        let Some(Event::Final(Some(bytes))) = events.last() else {
            panic!("expected bytes");
        };
        assert_eq!(bytes.get().unwrap().bytes().as_ref(), b"payload");
    }

    #[test]
    fn test_empty_final_stays_empty() {
        let producer = ToBytesProducer::new(ScriptedProducer::new(Script::Empty));
        let consumer = RecordingConsumer::<ResourceHandle<EncodedBytes>>::new();
        producer.produce(consumer.clone(), context_for("https://example.com/a.jpg"));

        assert!(matches!(consumer.events.lock()[..], [Event::Final(None)]));
    }
}
