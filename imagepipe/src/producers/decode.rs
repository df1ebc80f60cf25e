//! Decoding stage.
//!
//! Encoded results are decoded on the decode executor. Only the most recent
//! pending result is kept: a newer partial result replaces one that has not
//! started decoding, and at most one decode per request runs at a time.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::executor::Executor;
use crate::image::{EncodedImage, ImageDecoder, ImageRef, QualityInfo};
use crate::producer::{
    Consumer, PipelineError, Producer, ProducerContext, ProducerContextCallbacks, Status,
};

const PRODUCER_NAME: &str = "DecodeProducer";

/// Scales upstream progress so that only the decoded final result reports
/// completion.
const PROGRESS_SCALE: f32 = 0.99;

/// Turns encoded images into decoded ones.
pub struct DecodeProducer {
    decoder: Arc<dyn ImageDecoder>,
    executor: Arc<dyn Executor>,
    input: Arc<dyn Producer<EncodedImage>>,
}

impl DecodeProducer {
    pub fn new(
        decoder: Arc<dyn ImageDecoder>,
        executor: Arc<dyn Executor>,
        input: Arc<dyn Producer<EncodedImage>>,
    ) -> Self {
        Self {
            decoder,
            executor,
            input,
        }
    }
}

impl Producer<ImageRef> for DecodeProducer {
    fn produce(&self, consumer: Arc<dyn Consumer<ImageRef>>, context: ProducerContext) {
        let job = Arc::new(DecodeJob {
            decoder: Arc::clone(&self.decoder),
            executor: Arc::clone(&self.executor),
            downstream: consumer,
            context: context.clone(),
            state: Mutex::new(JobState::default()),
            partial_scans: AtomicU32::new(0),
        });
        context.add_callbacks(Arc::new(DecodeCallbacks {
            job: Arc::downgrade(&job),
        }));
        self.input.produce(Arc::new(DecodeConsumer { job }), context);
    }

    fn name(&self) -> &'static str {
        PRODUCER_NAME
    }
}

struct PendingDecode {
    image: EncodedImage,
    status: Status,
    is_last: bool,
}

#[derive(Default)]
struct JobState {
    pending: Option<PendingDecode>,
    running: bool,
    finished: bool,
}

struct DecodeJob {
    decoder: Arc<dyn ImageDecoder>,
    executor: Arc<dyn Executor>,
    downstream: Arc<dyn Consumer<ImageRef>>,
    context: ProducerContext,
    state: Mutex<JobState>,
    partial_scans: AtomicU32,
}

impl DecodeJob {
    /// Replaces the pending input. Returns `false` once the job finished.
    fn update(&self, image: EncodedImage, status: Status, is_last: bool) -> bool {
        let replaced = {
            let mut state = self.state.lock();
            if state.finished {
                return false;
            }
            state.pending.replace(PendingDecode {
                image,
                status,
                is_last,
            })
        };
        drop(replaced);
        true
    }

    /// Marks the job finished, releasing any pending input.
    fn finish(&self) -> bool {
        let pending = {
            let mut state = self.state.lock();
            if state.finished {
                return false;
            }
            state.finished = true;
            state.pending.take()
        };
        drop(pending);
        true
    }

    fn schedule(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if state.finished || state.running || state.pending.is_none() {
                return;
            }
            state.running = true;
        }
        let job = Arc::clone(self);
        self.executor.execute(Box::new(move || job.run()));
    }

    fn run(self: Arc<Self>) {
        let next = {
            let mut state = self.state.lock();
            let next = if state.finished {
                None
            } else {
                state.pending.take()
            };
            if next.is_none() {
                state.running = false;
            }
            next
        };
        let Some(pending) = next else {
            return;
        };

        let is_last = pending.is_last;
        self.decode(pending);

        self.state.lock().running = false;
        if !is_last {
            // A newer result may have arrived while decoding.
            self.schedule();
        }
    }

    fn decode(&self, pending: PendingDecode) {
        let PendingDecode {
            image,
            status,
            is_last,
        } = pending;
        let request_id = self.context.id();
        let listener = self.context.listener();

        if is_last {
            listener.on_producer_start(request_id, PRODUCER_NAME);
        }
        let quality = if is_last {
            QualityInfo::FULL
        } else {
            QualityInfo::partial(self.partial_scans.fetch_add(1, Ordering::Relaxed) + 1, false)
        };

        let result =
            self.decoder
                .decode(&image, quality, self.context.request().decode_options());
        match result {
            Ok(decoded) => {
                if is_last && !self.finish() {
                    return;
                }
                if !is_last && self.state.lock().finished {
                    return;
                }
                if is_last {
                    let (width, height) = decoded
                        .get()
                        .map(|d| (d.width(), d.height()))
                        .unwrap_or_default();
                    listener.on_producer_finish_with_success(
                        request_id,
                        PRODUCER_NAME,
                        &[
                            ("image_size", format!("{width}x{height}")),
                            ("encoded_size", image.size().to_string()),
                            ("sample_size", image.sample_size().to_string()),
                        ],
                    );
                    self.downstream.on_progress_update(1.0);
                    self.downstream.on_final_result(Some(decoded), status);
                } else {
                    trace!(request_id, scan = quality.quality, "Partial decode delivered");
                    self.downstream.on_intermediate_result(decoded, status);
                }
            }
            Err(e) if !is_last => {
                debug!(request_id, error = %e, "Ignoring failed partial decode");
            }
            Err(e) => {
                if !self.finish() {
                    return;
                }
                let error = PipelineError::from(e);
                listener.on_producer_finish_with_failure(request_id, PRODUCER_NAME, &error, &[]);
                self.downstream.on_failure(error);
            }
        }
    }
}

struct DecodeConsumer {
    job: Arc<DecodeJob>,
}

impl Consumer<EncodedImage> for DecodeConsumer {
    fn on_intermediate_result(&self, result: EncodedImage, status: Status) {
        let job = &self.job;
        if !job.context.is_intermediate_results_expected() || !job.decoder.supports_partial(&result)
        {
            return;
        }
        if job.update(result, status, false) {
            job.schedule();
        }
    }

    fn on_final_result(&self, result: Option<EncodedImage>, status: Status) {
        let job = &self.job;
        match result {
            Some(image) => {
                if job.update(image, status, true) {
                    job.schedule();
                }
            }
            None => {
                if job.finish() {
                    job.context.listener().on_producer_finish_with_success(
                        job.context.id(),
                        PRODUCER_NAME,
                        &[],
                    );
                    job.downstream.on_final_result(None, status);
                }
            }
        }
    }

    fn on_failure(&self, error: PipelineError) {
        if self.job.finish() {
            self.job.downstream.on_failure(error);
        }
    }

    fn on_cancellation(&self) {
        if self.job.finish() {
            self.job.downstream.on_cancellation();
        }
    }

    fn on_progress_update(&self, progress: f32) {
        self.job.downstream.on_progress_update(progress * PROGRESS_SCALE);
    }
}

struct DecodeCallbacks {
    job: Weak<DecodeJob>,
}

impl ProducerContextCallbacks for DecodeCallbacks {
    fn on_is_intermediate_results_expected_changed(&self) {
        if let Some(job) = self.job.upgrade() {
            if job.context.is_intermediate_results_expected() {
                job.schedule();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::InlineExecutor;
    use crate::image::{DecodeError, DecodedImage};
    use crate::producer::test_support::{Event, RecordingConsumer};
    use crate::producers::test_support::{context_for, decoded, FnProducer};
    use crate::request::{ImageDecodeOptions, ImageRequest};
    use crate::resource::ResourceHandle;
    use bytes::Bytes;

    /// Decodes anything except bytes starting with `bad`.
    struct StubDecoder {
        partial: bool,
    }

    impl ImageDecoder for StubDecoder {
        fn decode(
            &self,
            encoded: &EncodedImage,
            quality: QualityInfo,
            _options: &ImageDecodeOptions,
        ) -> Result<ResourceHandle<DecodedImage>, DecodeError> {
            match encoded.data() {
                Some(data) if data.starts_with(b"bad") => {
                    Err(DecodeError::Malformed("stub".into()))
                }
                Some(_) => Ok(decoded(quality)),
                None => Err(DecodeError::InvalidInput),
            }
        }

        fn supports_partial(&self, _encoded: &EncodedImage) -> bool {
            self.partial
        }
    }

    fn image(data: &'static [u8]) -> EncodedImage {
        EncodedImage::from_bytes(Bytes::from_static(data))
    }

    fn producer(
        partial: bool,
        input: Arc<FnProducer<EncodedImage>>,
    ) -> DecodeProducer {
        DecodeProducer::new(Arc::new(StubDecoder { partial }), Arc::new(InlineExecutor), input)
    }

    fn progressive_context() -> ProducerContext {
        ProducerContext::builder(Arc::new(
            ImageRequest::from_uri("https://example.com/p.jpg").unwrap(),
        ))
        .intermediate_results_expected(true)
        .build()
    }

    #[test]
    fn test_final_result_is_decoded_at_full_quality() {
        let input = FnProducer::new(|consumer: Arc<dyn Consumer<EncodedImage>>, _| {
            consumer.on_final_result(Some(image(b"ok")), Status::NONE)
        });
        let consumer = RecordingConsumer::<ImageRef>::new();
        producer(false, input).produce(consumer.clone(), context_for("https://example.com/a.png"));

        assert!(matches!(
            consumer.events.lock().last(),
            Some(Event::Final(Some(image))) if image.get().unwrap().is_full_quality()
        ));
    }

    #[test]
    fn test_partial_results_decoded_when_expected() {
        let input = FnProducer::new(|consumer: Arc<dyn Consumer<EncodedImage>>, _| {
            consumer.on_intermediate_result(image(b"part"), Status::NONE);
            consumer.on_final_result(Some(image(b"full")), Status::NONE);
        });
        let consumer = RecordingConsumer::<ImageRef>::new();
        producer(true, input).produce(consumer.clone(), progressive_context());

        let events = consumer.events.lock();
        assert!(matches!(
            &events[0],
            Event::Intermediate(image) if image.get().unwrap().quality().quality == 1
        ));
        assert!(matches!(events.last(), Some(Event::Final(Some(_)))));
    }

    #[test]
    fn test_partial_results_skipped_when_not_expected() {
        let input = FnProducer::new(|consumer: Arc<dyn Consumer<EncodedImage>>, _| {
            consumer.on_intermediate_result(image(b"part"), Status::NONE);
            consumer.on_final_result(Some(image(b"full")), Status::NONE);
        });
        let consumer = RecordingConsumer::<ImageRef>::new();
        producer(true, input).produce(consumer.clone(), context_for("https://example.com/p.jpg"));

        let events = consumer.events.lock();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], Event::Progress(_)));
        assert!(matches!(events[1], Event::Final(Some(_))));
    }

    #[test]
    fn test_failed_partial_decode_is_ignored() {
        let input = FnProducer::new(|consumer: Arc<dyn Consumer<EncodedImage>>, _| {
            consumer.on_intermediate_result(image(b"bad part"), Status::NONE);
            consumer.on_final_result(Some(image(b"full")), Status::NONE);
        });
        let consumer = RecordingConsumer::<ImageRef>::new();
        producer(true, input).produce(consumer.clone(), progressive_context());

        assert_eq!(consumer.terminal_count(), 1);
        assert!(matches!(consumer.events.lock().last(), Some(Event::Final(Some(_)))));
    }

    #[test]
    fn test_failed_final_decode_fails_request() {
        let input = FnProducer::new(|consumer: Arc<dyn Consumer<EncodedImage>>, _| {
            consumer.on_final_result(Some(image(b"bad")), Status::NONE)
        });
        let consumer = RecordingConsumer::<ImageRef>::new();
        producer(false, input).produce(consumer.clone(), context_for("https://example.com/a.png"));

        assert!(matches!(
            consumer.events.lock().last(),
            Some(Event::Failure(PipelineError::Decode(DecodeError::Malformed(_))))
        ));
    }

    #[test]
    fn test_empty_final_result_is_forwarded() {
        let input = FnProducer::new(|consumer: Arc<dyn Consumer<EncodedImage>>, _| {
            consumer.on_final_result(None, Status::NONE)
        });
        let consumer = RecordingConsumer::<ImageRef>::new();
        producer(false, input).produce(consumer.clone(), context_for("https://example.com/a.png"));

        assert!(matches!(consumer.events.lock()[0], Event::Final(None)));
    }
}
