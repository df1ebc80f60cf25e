//! Moves the rest of a request onto the hand-off queue's executor.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use tracing::trace;

use crate::executor::{TaskId, ThreadHandoffQueue};
use crate::producer::{Consumer, Producer, ProducerContext, ProducerContextCallbacks, ProducerListener};

const PRODUCER_NAME: &str = "ThreadHandoffProducer";
const BACKGROUND_PRODUCER_NAME: &str = "BackgroundThreadHandoffProducer";

const QUEUED: u8 = 0;
const RUNNING: u8 = 1;
const CANCELLED: u8 = 2;

/// Starts the input on the queue's executor instead of the calling thread.
///
/// A request cancelled while its start is still queued never reaches the
/// input.
pub struct ThreadHandoffProducer<T> {
    input: Arc<dyn Producer<T>>,
    queue: Arc<ThreadHandoffQueue>,
    name: &'static str,
}

impl<T> ThreadHandoffProducer<T> {
    pub fn new(input: Arc<dyn Producer<T>>, queue: Arc<ThreadHandoffQueue>) -> Self {
        Self {
            input,
            queue,
            name: PRODUCER_NAME,
        }
    }

    /// Variant used by the encoded-only and prefetch chains.
    pub fn background(input: Arc<dyn Producer<T>>, queue: Arc<ThreadHandoffQueue>) -> Self {
        Self {
            input,
            queue,
            name: BACKGROUND_PRODUCER_NAME,
        }
    }
}

impl<T: Send + 'static> Producer<T> for ThreadHandoffProducer<T> {
    fn produce(&self, consumer: Arc<dyn Consumer<T>>, context: ProducerContext) {
        let listener = Arc::clone(context.listener());
        let request_id = context.id().to_string();
        let name = self.name;
        listener.on_producer_start(&request_id, name);

        let state = Arc::new(AtomicU8::new(QUEUED));
        let task = {
            let state = Arc::clone(&state);
            let input = Arc::clone(&self.input);
            let consumer = Arc::clone(&consumer);
            let context = context.clone();
            let listener = Arc::clone(&listener);
            let request_id = request_id.clone();
            Box::new(move || {
                if state
                    .compare_exchange(QUEUED, RUNNING, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    return;
                }
                listener.on_producer_finish_with_success(&request_id, name, &[]);
                input.produce(consumer, context);
            })
        };

        let task_id = self.queue.add_to_queue_or_execute(task);
        context.add_callbacks(Arc::new(HandoffCallbacks {
            state,
            queue: Arc::clone(&self.queue),
            task_id,
            consumer,
            listener,
            request_id,
            name,
        }));
    }

    fn name(&self) -> &'static str {
        self.name
    }
}

struct HandoffCallbacks<T> {
    state: Arc<AtomicU8>,
    queue: Arc<ThreadHandoffQueue>,
    task_id: TaskId,
    consumer: Arc<dyn Consumer<T>>,
    listener: Arc<dyn ProducerListener>,
    request_id: String,
    name: &'static str,
}

impl<T> ProducerContextCallbacks for HandoffCallbacks<T> {
    fn on_cancellation_requested(&self) {
        if self
            .state
            .compare_exchange(QUEUED, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let removed = self.queue.remove(self.task_id);
        trace!(request_id = %self.request_id, removed, "Cancelled before hand-off");
        self.listener
            .on_producer_finish_with_cancellation(&self.request_id, self.name);
        self.consumer.on_cancellation();
    }
}
