//! Per-request state shared by every stage of one execution.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use super::listener::{NoOpProducerListener, ProducerListener};
use crate::request::{CallerContext, ImageRequest, Priority, RequestLevel};

/// Global counter for request ids.
static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(0);

fn next_request_id() -> String {
    format!("req-{}", NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed))
}

/// Notifications about changes to a context.
///
/// All methods default to no-ops. They are invoked outside of any lock.
pub trait ProducerContextCallbacks: Send + Sync {
    fn on_cancellation_requested(&self) {}
    fn on_is_prefetch_changed(&self) {}
    fn on_is_intermediate_results_expected_changed(&self) {}
    fn on_priority_changed(&self) {}
}

type Callbacks = Vec<Arc<dyn ProducerContextCallbacks>>;

struct MutableState {
    priority: Priority,
    is_prefetch: bool,
    is_intermediate_results_expected: bool,
    is_cancelled: bool,
    callbacks: Callbacks,
}

struct ContextInner {
    id: String,
    request: Arc<ImageRequest>,
    caller_context: CallerContext,
    lowest_permitted_level: RequestLevel,
    listener: Arc<dyn ProducerListener>,
    cancellation: CancellationToken,
    state: Mutex<MutableState>,
    extras: Mutex<HashMap<String, String>>,
}

/// Handle to the shared state of one request execution.
///
/// Cloning is cheap and every clone observes the same state.
#[derive(Clone)]
pub struct ProducerContext {
    inner: Arc<ContextInner>,
}

impl ProducerContext {
    pub fn builder(request: Arc<ImageRequest>) -> ProducerContextBuilder {
        ProducerContextBuilder::new(request)
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn request(&self) -> &ImageRequest {
        &self.inner.request
    }

    pub fn request_arc(&self) -> Arc<ImageRequest> {
        Arc::clone(&self.inner.request)
    }

    pub fn caller_context(&self) -> &CallerContext {
        &self.inner.caller_context
    }

    pub fn lowest_permitted_level(&self) -> RequestLevel {
        self.inner.lowest_permitted_level
    }

    pub fn listener(&self) -> &Arc<dyn ProducerListener> {
        &self.inner.listener
    }

    pub fn priority(&self) -> Priority {
        self.inner.state.lock().priority
    }

    pub fn is_prefetch(&self) -> bool {
        self.inner.state.lock().is_prefetch
    }

    pub fn is_intermediate_results_expected(&self) -> bool {
        self.inner.state.lock().is_intermediate_results_expected
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.state.lock().is_cancelled
    }

    /// Completes when the context is cancelled.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.inner.cancellation.cancelled()
    }

    /// Token cancelled together with this context.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.cancellation.clone()
    }

    /// Registers `callbacks`. If the context is already cancelled the
    /// cancellation callback fires immediately.
    pub fn add_callbacks(&self, callbacks: Arc<dyn ProducerContextCallbacks>) {
        let cancelled = {
            let mut state = self.inner.state.lock();
            state.callbacks.push(Arc::clone(&callbacks));
            state.is_cancelled
        };
        if cancelled {
            callbacks.on_cancellation_requested();
        }
    }

    /// Cancels the request and notifies every registered callback.
    pub fn cancel(&self) {
        Self::call_on_cancellation_requested(self.cancel_no_callbacks());
    }

    /// Marks the context cancelled and returns the callbacks to notify.
    /// Returns nothing when already cancelled.
    pub fn cancel_no_callbacks(&self) -> Callbacks {
        let callbacks = {
            let mut state = self.inner.state.lock();
            if state.is_cancelled {
                return Vec::new();
            }
            state.is_cancelled = true;
            state.callbacks.clone()
        };
        self.inner.cancellation.cancel();
        callbacks
    }

    pub fn set_priority_no_callbacks(&self, priority: Priority) -> Callbacks {
        let mut state = self.inner.state.lock();
        if state.priority == priority {
            return Vec::new();
        }
        state.priority = priority;
        state.callbacks.clone()
    }

    pub fn set_is_prefetch_no_callbacks(&self, is_prefetch: bool) -> Callbacks {
        let mut state = self.inner.state.lock();
        if state.is_prefetch == is_prefetch {
            return Vec::new();
        }
        state.is_prefetch = is_prefetch;
        state.callbacks.clone()
    }

    pub fn set_is_intermediate_results_expected_no_callbacks(&self, expected: bool) -> Callbacks {
        let mut state = self.inner.state.lock();
        if state.is_intermediate_results_expected == expected {
            return Vec::new();
        }
        state.is_intermediate_results_expected = expected;
        state.callbacks.clone()
    }

    pub fn call_on_cancellation_requested(callbacks: Callbacks) {
        for cb in callbacks {
            cb.on_cancellation_requested();
        }
    }

    pub fn call_on_is_prefetch_changed(callbacks: Callbacks) {
        for cb in callbacks {
            cb.on_is_prefetch_changed();
        }
    }

    pub fn call_on_is_intermediate_results_expected_changed(callbacks: Callbacks) {
        for cb in callbacks {
            cb.on_is_intermediate_results_expected_changed();
        }
    }

    pub fn call_on_priority_changed(callbacks: Callbacks) {
        for cb in callbacks {
            cb.on_priority_changed();
        }
    }

    pub fn set_extra(&self, key: impl Into<String>, value: impl Into<String>) {
        self.inner.extras.lock().insert(key.into(), value.into());
    }

    pub fn extra(&self, key: &str) -> Option<String> {
        self.inner.extras.lock().get(key).cloned()
    }

    pub fn extras(&self) -> HashMap<String, String> {
        self.inner.extras.lock().clone()
    }
}

impl fmt::Debug for ProducerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("ProducerContext")
            .field("id", &self.inner.id)
            .field("uri", &self.inner.request.uri().as_str())
            .field("priority", &state.priority)
            .field("is_prefetch", &state.is_prefetch)
            .field("is_cancelled", &state.is_cancelled)
            .finish()
    }
}

/// Builder for [`ProducerContext`]. Defaults come from the request.
pub struct ProducerContextBuilder {
    request: Arc<ImageRequest>,
    id: Option<String>,
    caller_context: CallerContext,
    lowest_permitted_level: RequestLevel,
    listener: Arc<dyn ProducerListener>,
    priority: Priority,
    is_prefetch: bool,
    is_intermediate_results_expected: bool,
}

impl ProducerContextBuilder {
    fn new(request: Arc<ImageRequest>) -> Self {
        Self {
            lowest_permitted_level: request.lowest_permitted_level(),
            priority: request.priority(),
            is_intermediate_results_expected: request.is_progressive(),
            request,
            id: None,
            caller_context: CallerContext::default(),
            listener: Arc::new(NoOpProducerListener),
            is_prefetch: false,
        }
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn caller_context(mut self, caller_context: CallerContext) -> Self {
        self.caller_context = caller_context;
        self
    }

    pub fn lowest_permitted_level(mut self, level: RequestLevel) -> Self {
        self.lowest_permitted_level = level;
        self
    }

    pub fn listener(mut self, listener: Arc<dyn ProducerListener>) -> Self {
        self.listener = listener;
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn prefetch(mut self, is_prefetch: bool) -> Self {
        self.is_prefetch = is_prefetch;
        self
    }

    pub fn intermediate_results_expected(mut self, expected: bool) -> Self {
        self.is_intermediate_results_expected = expected;
        self
    }

    pub fn build(self) -> ProducerContext {
        ProducerContext {
            inner: Arc::new(ContextInner {
                id: self.id.unwrap_or_else(next_request_id),
                request: self.request,
                caller_context: self.caller_context,
                lowest_permitted_level: self.lowest_permitted_level,
                listener: self.listener,
                cancellation: CancellationToken::new(),
                state: Mutex::new(MutableState {
                    priority: self.priority,
                    is_prefetch: self.is_prefetch,
                    is_intermediate_results_expected: self.is_intermediate_results_expected,
                    is_cancelled: false,
                    callbacks: Vec::new(),
                }),
                extras: Mutex::new(HashMap::new()),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingCallbacks {
        cancelled: AtomicUsize,
        priority: AtomicUsize,
    }

    impl ProducerContextCallbacks for CountingCallbacks {
        fn on_cancellation_requested(&self) {
            self.cancelled.fetch_add(1, Ordering::SeqCst);
        }

        fn on_priority_changed(&self) {
            self.priority.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn context() -> ProducerContext {
        let request = ImageRequest::from_uri("https://example.com/a.jpg").unwrap();
        ProducerContext::builder(Arc::new(request)).build()
    }

    #[test]
    fn test_cancel_notifies_once() {
        let ctx = context();
        let callbacks = Arc::new(CountingCallbacks::default());
        ctx.add_callbacks(callbacks.clone());

        ctx.cancel();
        ctx.cancel();

        assert!(ctx.is_cancelled());
        assert!(ctx.cancellation_token().is_cancelled());
        assert_eq!(callbacks.cancelled.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_late_callbacks_see_cancellation() {
        let ctx = context();
        ctx.cancel();
        let callbacks = Arc::new(CountingCallbacks::default());
        ctx.add_callbacks(callbacks.clone());
        assert_eq!(callbacks.cancelled.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_priority_change_returns_callbacks_only_on_change() {
        let ctx = context();
        let callbacks = Arc::new(CountingCallbacks::default());
        ctx.add_callbacks(callbacks.clone());

        assert!(ctx.set_priority_no_callbacks(Priority::Medium).is_empty());
        let pending = ctx.set_priority_no_callbacks(Priority::High);
        assert_eq!(pending.len(), 1);
        ProducerContext::call_on_priority_changed(pending);

        assert_eq!(ctx.priority(), Priority::High);
        assert_eq!(callbacks.priority.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_ids_are_unique_and_clones_share_state() {
        let a = context();
        let b = context();
        assert_ne!(a.id(), b.id());

        let clone = a.clone();
        clone.set_extra("origin", "disk");
        assert_eq!(a.extra("origin").as_deref(), Some("disk"));
    }

    #[tokio::test]
    async fn test_cancelled_future_completes() {
        let ctx = context();
        let waiter = ctx.clone();
        let handle = tokio::spawn(async move { waiter.cancelled().await });
        ctx.cancel();
        handle.await.unwrap();
    }
}
