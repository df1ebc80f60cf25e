//! Caps the number of requests running through an input at once.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use crate::executor::Executor;
use crate::producer::{Consumer, PipelineError, Producer, ProducerContext, Status};

const PRODUCER_NAME: &str = "ThrottlingProducer";

type Waiting<T> = (Arc<dyn Consumer<T>>, ProducerContext);

struct ThrottleState<T> {
    running: usize,
    waiting: VecDeque<Waiting<T>>,
}

struct Throttle<T> {
    input: Arc<dyn Producer<T>>,
    executor: Arc<dyn Executor>,
    max_simultaneous_requests: usize,
    state: Mutex<ThrottleState<T>>,
}

/// Lets at most `max_simultaneous_requests` requests into the input; the
/// rest wait in arrival order and start on the executor as slots free up.
pub struct ThrottlingProducer<T> {
    throttle: Arc<Throttle<T>>,
}

impl<T: Send + 'static> ThrottlingProducer<T> {
    pub fn new(
        input: Arc<dyn Producer<T>>,
        executor: Arc<dyn Executor>,
        max_simultaneous_requests: usize,
    ) -> Self {
        Self {
            throttle: Arc::new(Throttle {
                input,
                executor,
                max_simultaneous_requests: max_simultaneous_requests.max(1),
                state: Mutex::new(ThrottleState {
                    running: 0,
                    waiting: VecDeque::new(),
                }),
            }),
        }
    }

    pub fn running(&self) -> usize {
        self.throttle.state.lock().running
    }

    pub fn waiting(&self) -> usize {
        self.throttle.state.lock().waiting.len()
    }
}

impl<T: Send + 'static> Throttle<T> {
    fn produce_internal(self: &Arc<Self>, consumer: Arc<dyn Consumer<T>>, context: ProducerContext) {
        context
            .listener()
            .on_producer_finish_with_success(context.id(), PRODUCER_NAME, &[]);
        let consumer = Arc::new(ThrottledConsumer {
            downstream: consumer,
            throttle: Arc::clone(self),
        });
        self.input.produce(consumer, context);
    }

    /// Frees a slot, handing it to the oldest waiting request that is still
    /// wanted.
    fn on_request_finished(self: &Arc<Self>) {
        let mut abandoned = Vec::new();
        let next = {
            let mut state = self.state.lock();
            let mut next = None;
            while let Some((consumer, context)) = state.waiting.pop_front() {
                if context.is_cancelled() {
                    abandoned.push(consumer);
                } else {
                    next = Some((consumer, context));
                    break;
                }
            }
            if next.is_none() {
                state.running -= 1;
            }
            next
        };

        for consumer in abandoned {
            consumer.on_cancellation();
        }
        if let Some((consumer, context)) = next {
            trace!(request_id = context.id(), "Starting throttled request");
            let throttle = Arc::clone(self);
            self.executor
                .execute(Box::new(move || throttle.produce_internal(consumer, context)));
        }
    }
}

impl<T: Send + 'static> Producer<T> for ThrottlingProducer<T> {
    fn produce(&self, consumer: Arc<dyn Consumer<T>>, context: ProducerContext) {
        context.listener().on_producer_start(context.id(), PRODUCER_NAME);
        let start_now = {
            let mut state = self.throttle.state.lock();
            if state.running >= self.throttle.max_simultaneous_requests {
                state.waiting.push_back((consumer.clone(), context.clone()));
                false
            } else {
                state.running += 1;
                true
            }
        };
        if start_now {
            self.throttle.produce_internal(consumer, context);
        } else {
            trace!(request_id = context.id(), "Request throttled");
        }
    }

    fn name(&self) -> &'static str {
        PRODUCER_NAME
    }
}

struct ThrottledConsumer<T> {
    downstream: Arc<dyn Consumer<T>>,
    throttle: Arc<Throttle<T>>,
}

impl<T: Send + 'static> Consumer<T> for ThrottledConsumer<T> {
    fn on_intermediate_result(&self, result: T, status: Status) {
        self.downstream.on_intermediate_result(result, status);
    }

    fn on_final_result(&self, result: Option<T>, status: Status) {
        self.downstream.on_final_result(result, status);
        self.throttle.on_request_finished();
    }

    fn on_failure(&self, error: PipelineError) {
        self.downstream.on_failure(error);
        self.throttle.on_request_finished();
    }

    fn on_cancellation(&self) {
        self.downstream.on_cancellation();
        self.throttle.on_request_finished();
    }

    fn on_progress_update(&self, progress: f32) {
        self.downstream.on_progress_update(progress);
    }
}
