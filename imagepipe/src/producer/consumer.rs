//! Consumers and the per-request state machine.

use std::cell::Cell;
use std::sync::Arc;

use parking_lot::ReentrantMutex;
use tracing::trace;

use super::error::PipelineError;

/// Flags describing a delivered result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Status {
    /// The result stands in for the real image and must not be cached as it.
    pub placeholder: bool,
    /// The encoded result must not be written to encoded caches.
    pub do_not_cache_encoded: bool,
    /// Resizing has already been applied upstream.
    pub resizing_done: bool,
}

impl Status {
    pub const NONE: Status = Status {
        placeholder: false,
        do_not_cache_encoded: false,
        resizing_done: false,
    };

    pub fn with_resizing_done(mut self) -> Self {
        self.resizing_done = true;
        self
    }

    pub fn with_do_not_cache_encoded(mut self) -> Self {
        self.do_not_cache_encoded = true;
        self
    }
}

/// Receives the results of a producer.
pub trait Consumer<T>: Send + Sync {
    /// A partial result; more will follow.
    fn on_intermediate_result(&self, result: T, status: Status);

    /// The last result. `None` means the request completed without an image,
    /// for example because the lowest permitted level was reached on a miss.
    fn on_final_result(&self, result: Option<T>, status: Status);

    fn on_failure(&self, error: PipelineError);

    fn on_cancellation(&self);

    /// Progress in `[0.0, 1.0]`.
    fn on_progress_update(&self, _progress: f32) {}
}

/// Lifecycle of a consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Pending,
    Intermediate,
    Finished,
    Failed,
    Cancelled,
}

impl ConsumerState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Failed | Self::Cancelled)
    }
}

/// Enforces `Pending → Intermediate* → {Finished | Failed | Cancelled}`.
///
/// The first terminal event wins; anything afterwards is dropped. Delivery
/// happens under a reentrant lock so events reach the inner consumer in the
/// order they were accepted, and an inner consumer may call back into this
/// one from the same thread.
pub struct GuardedConsumer<T> {
    inner: Arc<dyn Consumer<T>>,
    state: ReentrantMutex<Cell<ConsumerState>>,
}

impl<T: Send + 'static> GuardedConsumer<T> {
    pub fn new(inner: Arc<dyn Consumer<T>>) -> Self {
        Self {
            inner,
            state: ReentrantMutex::new(Cell::new(ConsumerState::Pending)),
        }
    }

    /// Wraps `inner` and returns it ready to hand to a producer.
    pub fn wrap(inner: Arc<dyn Consumer<T>>) -> Arc<dyn Consumer<T>> {
        Arc::new(Self::new(inner))
    }

    pub fn state(&self) -> ConsumerState {
        self.state.lock().get()
    }
}

impl<T: Send + 'static> Consumer<T> for GuardedConsumer<T> {
    fn on_intermediate_result(&self, result: T, status: Status) {
        let guard = self.state.lock();
        if guard.get().is_terminal() {
            trace!(state = ?guard.get(), "dropping intermediate result after terminal event");
            return;
        }
        guard.set(ConsumerState::Intermediate);
        self.inner.on_intermediate_result(result, status);
    }

    fn on_final_result(&self, result: Option<T>, status: Status) {
        let guard = self.state.lock();
        if guard.get().is_terminal() {
            trace!(state = ?guard.get(), "dropping final result after terminal event");
            return;
        }
        guard.set(ConsumerState::Finished);
        self.inner.on_final_result(result, status);
    }

    fn on_failure(&self, error: PipelineError) {
        let guard = self.state.lock();
        if guard.get().is_terminal() {
            trace!(state = ?guard.get(), %error, "dropping failure after terminal event");
            return;
        }
        guard.set(ConsumerState::Failed);
        self.inner.on_failure(error);
    }

    fn on_cancellation(&self) {
        let guard = self.state.lock();
        if guard.get().is_terminal() {
            trace!(state = ?guard.get(), "dropping cancellation after terminal event");
            return;
        }
        guard.set(ConsumerState::Cancelled);
        self.inner.on_cancellation();
    }

    fn on_progress_update(&self, progress: f32) {
        let guard = self.state.lock();
        if !guard.get().is_terminal() {
            self.inner.on_progress_update(progress);
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::{Event, RecordingConsumer};
    use super::*;

    #[test]
    fn test_terminal_state_is_sticky() {
        let recorder = RecordingConsumer::<u32>::new();
        let guarded = GuardedConsumer::new(recorder.clone());

        guarded.on_intermediate_result(1, Status::NONE);
        guarded.on_final_result(Some(2), Status::NONE);
        guarded.on_failure(PipelineError::Internal("late".into()));
        guarded.on_cancellation();
        guarded.on_intermediate_result(3, Status::NONE);

        assert_eq!(guarded.state(), ConsumerState::Finished);
        assert_eq!(
            *recorder.events.lock(),
            vec![Event::Intermediate(1), Event::Final(Some(2))]
        );
    }

    #[test]
    fn test_cancellation_blocks_later_result() {
        let recorder = RecordingConsumer::<u32>::new();
        let guarded = GuardedConsumer::new(recorder.clone());

        guarded.on_cancellation();
        guarded.on_final_result(Some(1), Status::NONE);
        guarded.on_progress_update(0.5);

        assert_eq!(guarded.state(), ConsumerState::Cancelled);
        assert_eq!(*recorder.events.lock(), vec![Event::Cancellation]);
    }

    #[test]
    fn test_failure_is_delivered_once() {
        let recorder = RecordingConsumer::<u32>::new();
        let guarded = GuardedConsumer::new(recorder.clone());
        guarded.on_failure(PipelineError::Internal("boom".into()));
        guarded.on_failure(PipelineError::Internal("again".into()));
        assert_eq!(recorder.terminal_count(), 1);
    }
}
