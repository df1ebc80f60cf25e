//! Telemetry hooks for producers and requests.
//!
//! Listeners observe; they never change control flow.

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::error::PipelineError;
use crate::request::ImageRequest;

/// Extra key/value pairs a producer reports on completion.
pub type Extras<'a> = &'a [(&'static str, String)];

/// Per-stage events.
pub trait ProducerListener: Send + Sync {
    fn on_producer_start(&self, _request_id: &str, _producer: &str) {}

    fn on_producer_event(&self, _request_id: &str, _producer: &str, _event: &str) {}

    fn on_producer_finish_with_success(&self, _request_id: &str, _producer: &str, _extras: Extras<'_>) {}

    fn on_producer_finish_with_failure(
        &self,
        _request_id: &str,
        _producer: &str,
        _error: &PipelineError,
        _extras: Extras<'_>,
    ) {
    }

    fn on_producer_finish_with_cancellation(&self, _request_id: &str, _producer: &str) {}

    /// The stage that served the request; `successful` is whether it had the
    /// image.
    fn on_ultimate_producer_reached(&self, _request_id: &str, _producer: &str, _successful: bool) {}
}

/// Listener that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpProducerListener;

impl ProducerListener for NoOpProducerListener {}

/// Request-level events in addition to the per-stage ones.
pub trait RequestListener: ProducerListener {
    fn on_request_start(&self, _request: &ImageRequest, _request_id: &str, _is_prefetch: bool) {}

    fn on_request_success(&self, _request: &ImageRequest, _request_id: &str, _is_prefetch: bool) {}

    fn on_request_failure(
        &self,
        _request: &ImageRequest,
        _request_id: &str,
        _error: &PipelineError,
        _is_prefetch: bool,
    ) {
    }

    fn on_request_cancellation(&self, _request_id: &str) {}
}

/// Logs request and producer events through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingRequestListener;

impl ProducerListener for LoggingRequestListener {
    fn on_producer_start(&self, request_id: &str, producer: &str) {
        debug!(request_id, producer, "producer started");
    }

    fn on_producer_event(&self, request_id: &str, producer: &str, event: &str) {
        debug!(request_id, producer, event, "producer event");
    }

    fn on_producer_finish_with_success(&self, request_id: &str, producer: &str, extras: Extras<'_>) {
        debug!(request_id, producer, ?extras, "producer finished");
    }

    fn on_producer_finish_with_failure(
        &self,
        request_id: &str,
        producer: &str,
        error: &PipelineError,
        extras: Extras<'_>,
    ) {
        warn!(request_id, producer, %error, ?extras, "producer failed");
    }

    fn on_producer_finish_with_cancellation(&self, request_id: &str, producer: &str) {
        debug!(request_id, producer, "producer cancelled");
    }

    fn on_ultimate_producer_reached(&self, request_id: &str, producer: &str, successful: bool) {
        debug!(request_id, producer, successful, "ultimate producer reached");
    }
}

impl RequestListener for LoggingRequestListener {
    fn on_request_start(&self, request: &ImageRequest, request_id: &str, is_prefetch: bool) {
        debug!(request_id, uri = %request.uri(), is_prefetch, "request started");
    }

    fn on_request_success(&self, request: &ImageRequest, request_id: &str, is_prefetch: bool) {
        info!(request_id, uri = %request.uri(), is_prefetch, "request succeeded");
    }

    fn on_request_failure(
        &self,
        request: &ImageRequest,
        request_id: &str,
        error: &PipelineError,
        is_prefetch: bool,
    ) {
        warn!(request_id, uri = %request.uri(), is_prefetch, %error, "request failed");
    }

    fn on_request_cancellation(&self, request_id: &str) {
        debug!(request_id, "request cancelled");
    }
}

/// Fans every event out to a list of listeners.
#[derive(Default, Clone)]
pub struct ForwardingRequestListener {
    listeners: Vec<Arc<dyn RequestListener>>,
}

impl ForwardingRequestListener {
    pub fn new(listeners: Vec<Arc<dyn RequestListener>>) -> Self {
        Self { listeners }
    }

    pub fn add(&mut self, listener: Arc<dyn RequestListener>) {
        self.listeners.push(listener);
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }
}

impl ProducerListener for ForwardingRequestListener {
    fn on_producer_start(&self, request_id: &str, producer: &str) {
        for l in &self.listeners {
            l.on_producer_start(request_id, producer);
        }
    }

    fn on_producer_event(&self, request_id: &str, producer: &str, event: &str) {
        for l in &self.listeners {
            l.on_producer_event(request_id, producer, event);
        }
    }

    fn on_producer_finish_with_success(&self, request_id: &str, producer: &str, extras: Extras<'_>) {
        for l in &self.listeners {
            l.on_producer_finish_with_success(request_id, producer, extras);
        }
    }

    fn on_producer_finish_with_failure(
        &self,
        request_id: &str,
        producer: &str,
        error: &PipelineError,
        extras: Extras<'_>,
    ) {
        for l in &self.listeners {
            l.on_producer_finish_with_failure(request_id, producer, error, extras);
        }
    }

    fn on_producer_finish_with_cancellation(&self, request_id: &str, producer: &str) {
        for l in &self.listeners {
            l.on_producer_finish_with_cancellation(request_id, producer);
        }
    }

    fn on_ultimate_producer_reached(&self, request_id: &str, producer: &str, successful: bool) {
        for l in &self.listeners {
            l.on_ultimate_producer_reached(request_id, producer, successful);
        }
    }
}

impl RequestListener for ForwardingRequestListener {
    fn on_request_start(&self, request: &ImageRequest, request_id: &str, is_prefetch: bool) {
        for l in &self.listeners {
            l.on_request_start(request, request_id, is_prefetch);
        }
    }

    fn on_request_success(&self, request: &ImageRequest, request_id: &str, is_prefetch: bool) {
        for l in &self.listeners {
            l.on_request_success(request, request_id, is_prefetch);
        }
    }

    fn on_request_failure(
        &self,
        request: &ImageRequest,
        request_id: &str,
        error: &PipelineError,
        is_prefetch: bool,
    ) {
        for l in &self.listeners {
            l.on_request_failure(request, request_id, error, is_prefetch);
        }
    }

    fn on_request_cancellation(&self, request_id: &str) {
        for l in &self.listeners {
            l.on_request_cancellation(request_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counting {
        starts: AtomicUsize,
        successes: AtomicUsize,
    }

    impl ProducerListener for Counting {
        fn on_producer_start(&self, _request_id: &str, _producer: &str) {
            self.starts.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl RequestListener for Counting {
        fn on_request_success(&self, _request: &ImageRequest, _id: &str, _prefetch: bool) {
            self.successes.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_forwarding_reaches_every_listener() {
        let a = Arc::new(Counting::default());
        let b = Arc::new(Counting::default());
        let forwarding = ForwardingRequestListener::new(vec![a.clone() as Arc<dyn RequestListener>, b.clone()]);
        let request = ImageRequest::from_uri("https://example.com/a.jpg").unwrap();

        forwarding.on_producer_start("req-1", "NetworkFetchProducer");
        forwarding.on_request_success(&request, "req-1", false);

        for listener in [&a, &b] {
            assert_eq!(listener.starts.load(Ordering::SeqCst), 1);
            assert_eq!(listener.successes.load(Ordering::SeqCst), 1);
        }
    }
}
