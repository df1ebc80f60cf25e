//! Caller-facing handle to one request's results.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::trace;

use crate::producer::{
    Consumer, GuardedConsumer, PipelineError, ProducerContext, ProducerContextCallbacks,
    RequestListener, Status,
};

/// Something that happened to a request, in delivery order.
#[derive(Debug)]
pub enum DataEvent<T> {
    Intermediate(T),
    Progress(f32),
    Final(Option<T>),
    Failure(PipelineError),
    Cancelled,
}

impl<T> DataEvent<T> {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Final(_) | Self::Failure(_) | Self::Cancelled)
    }
}

/// How a request ended.
#[derive(Debug)]
pub enum Outcome<T> {
    /// The request finished. `None` when the lowest permitted level was
    /// reached without the image, and for prefetches.
    Success(Option<T>),
    Failure(PipelineError),
    Cancelled,
}

/// Why a request ended without a result.
///
/// Cancellation is kept apart from failures so callers can match on it.
#[derive(Debug, Error)]
pub enum OutcomeError {
    #[error(transparent)]
    Failed(#[from] PipelineError),

    #[error("request was cancelled")]
    Cancelled,
}

impl<T> Outcome<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// The image, if the request produced one.
    pub fn into_result(self) -> Result<Option<T>, OutcomeError> {
        match self {
            Self::Success(value) => Ok(value),
            Self::Failure(error) => Err(OutcomeError::Failed(error)),
            Self::Cancelled => Err(OutcomeError::Cancelled),
        }
    }
}

/// Receives the events of one request.
///
/// Exactly one terminal event is delivered. Closing or dropping the data
/// source before then cancels the request.
pub struct DataSource<T> {
    receiver: mpsc::UnboundedReceiver<DataEvent<T>>,
    context: ProducerContext,
    progress: Arc<AtomicU32>,
    finished: bool,
}

impl<T: Send + 'static> DataSource<T> {
    /// Creates a data source for `context` and the consumer feeding it.
    pub(crate) fn new(
        context: ProducerContext,
        listener: Arc<dyn RequestListener>,
    ) -> (Self, Arc<dyn Consumer<T>>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let progress = Arc::new(AtomicU32::new(0f32.to_bits()));
        let consumer = GuardedConsumer::wrap(Arc::new(DataSourceConsumer {
            sender,
            progress: Arc::clone(&progress),
            context: context.clone(),
            listener,
        }));
        context.add_callbacks(Arc::new(CancelOnRequest {
            consumer: Arc::downgrade(&consumer),
        }));
        let source = Self {
            receiver,
            context,
            progress,
            finished: false,
        };
        (source, consumer)
    }

    pub fn request_id(&self) -> &str {
        self.context.id()
    }

    /// Latest reported progress in `[0, 1]`.
    pub fn progress(&self) -> f32 {
        f32::from_bits(self.progress.load(Ordering::Acquire))
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Waits for the next event. Returns `None` after the terminal event.
    pub async fn next_event(&mut self) -> Option<DataEvent<T>> {
        if self.finished {
            return None;
        }
        let event = self.receiver.recv().await;
        match &event {
            Some(event) if event.is_terminal() => self.finished = true,
            Some(_) => {}
            None => self.finished = true,
        }
        event
    }

    /// Waits for the request to end, skipping intermediate results.
    pub async fn result(mut self) -> Outcome<T> {
        while let Some(event) = self.next_event().await {
            match event {
                DataEvent::Final(value) => return Outcome::Success(value),
                DataEvent::Failure(error) => return Outcome::Failure(error),
                DataEvent::Cancelled => return Outcome::Cancelled,
                DataEvent::Intermediate(_) | DataEvent::Progress(_) => {}
            }
        }
        Outcome::Cancelled
    }

    /// Cancels the request. Events already queued stay readable.
    pub fn close(&self) {
        if !self.finished {
            self.context.cancel();
        }
    }
}

impl<T> Drop for DataSource<T> {
    fn drop(&mut self) {
        if !self.finished {
            trace!(request_id = self.context.id(), "Data source dropped before completion");
            self.context.cancel();
        }
    }
}

struct DataSourceConsumer<T> {
    sender: mpsc::UnboundedSender<DataEvent<T>>,
    progress: Arc<AtomicU32>,
    context: ProducerContext,
    listener: Arc<dyn RequestListener>,
}

impl<T> DataSourceConsumer<T> {
    fn send(&self, event: DataEvent<T>) {
        // A closed receiver means the caller stopped listening.
        let _ = self.sender.send(event);
    }

    fn set_progress(&self, progress: f32) {
        self.progress
            .store(progress.clamp(0.0, 1.0).to_bits(), Ordering::Release);
    }
}

impl<T: Send + 'static> Consumer<T> for DataSourceConsumer<T> {
    fn on_intermediate_result(&self, result: T, _status: Status) {
        self.send(DataEvent::Intermediate(result));
    }

    fn on_final_result(&self, result: Option<T>, _status: Status) {
        self.set_progress(1.0);
        self.listener.on_request_success(
            self.context.request(),
            self.context.id(),
            self.context.is_prefetch(),
        );
        self.send(DataEvent::Final(result));
    }

    fn on_failure(&self, error: PipelineError) {
        self.listener.on_request_failure(
            self.context.request(),
            self.context.id(),
            &error,
            self.context.is_prefetch(),
        );
        self.send(DataEvent::Failure(error));
    }

    fn on_cancellation(&self) {
        self.listener.on_request_cancellation(self.context.id());
        self.send(DataEvent::Cancelled);
    }

    fn on_progress_update(&self, progress: f32) {
        self.set_progress(progress);
        self.send(DataEvent::Progress(progress));
    }
}

/// Ends the data source as soon as its request is cancelled, without
/// waiting for the chain to wind down.
struct CancelOnRequest<T> {
    consumer: Weak<dyn Consumer<T>>,
}

impl<T: Send + 'static> ProducerContextCallbacks for CancelOnRequest<T> {
    fn on_cancellation_requested(&self) {
        if let Some(consumer) = self.consumer.upgrade() {
            consumer.on_cancellation();
        }
    }
}
