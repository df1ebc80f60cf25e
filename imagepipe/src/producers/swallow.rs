//! Discards results for requests that only populate caches.

use std::marker::PhantomData;
use std::sync::Arc;

use crate::producer::{Consumer, PipelineError, Producer, ProducerContext, Status};

const PRODUCER_NAME: &str = "SwallowResultProducer";

/// Runs the input for its side effects and reports completion without a
/// value.
pub struct SwallowResultProducer<T> {
    input: Arc<dyn Producer<T>>,
}

impl<T> SwallowResultProducer<T> {
    pub fn new(input: Arc<dyn Producer<T>>) -> Self {
        Self { input }
    }
}

impl<T: Send + 'static> Producer<()> for SwallowResultProducer<T> {
    fn produce(&self, consumer: Arc<dyn Consumer<()>>, context: ProducerContext) {
        let consumer = Arc::new(SwallowConsumer {
            downstream: consumer,
            _result: PhantomData,
        });
        self.input.produce(consumer, context);
    }

    fn name(&self) -> &'static str {
        PRODUCER_NAME
    }
}

struct SwallowConsumer<T> {
    downstream: Arc<dyn Consumer<()>>,
    _result: PhantomData<fn(T)>,
}

impl<T: Send + 'static> Consumer<T> for SwallowConsumer<T> {
    fn on_intermediate_result(&self, _result: T, _status: Status) {}

    fn on_final_result(&self, result: Option<T>, status: Status) {
        drop(result);
        self.downstream.on_final_result(None, status);
    }

    fn on_failure(&self, error: PipelineError) {
        self.downstream.on_failure(error);
    }

    fn on_cancellation(&self) {
        self.downstream.on_cancellation();
    }

    fn on_progress_update(&self, progress: f32) {
        self.downstream.on_progress_update(progress);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::EncodedImage;
    use crate::producer::test_support::{Event, RecordingConsumer};
    use crate::producers::test_support::{context_for, Script, ScriptedProducer};

    #[test]
    fn test_result_is_replaced_by_empty_final() {
        let input = ScriptedProducer::new(Script::Bytes(b"abc"));
        let producer = SwallowResultProducer::<EncodedImage>::new(input);
        let consumer = RecordingConsumer::<()>::new();
        producer.produce(consumer.clone(), context_for("https://example.com/a.jpg"));

        assert!(matches!(consumer.events.lock()[..], [Event::Final(None)]));
    }

    #[test]
    fn test_failure_is_forwarded() {
        let input = ScriptedProducer::new(Script::Fail(PipelineError::Internal("down".into())));
        let producer = SwallowResultProducer::<EncodedImage>::new(input);
        let consumer = RecordingConsumer::<()>::new();
        producer.produce(consumer.clone(), context_for("https://example.com/a.jpg"));

        assert!(matches!(consumer.events.lock()[..], [Event::Failure(_)]));
    }
}
