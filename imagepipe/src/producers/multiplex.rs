//! Deduplication of identical in-flight requests.
//!
//! Requests mapping to the same key share one upstream execution. Each
//! attached consumer receives its own copy of every result. The upstream
//! runs against a shared context whose priority, prefetch and
//! intermediate-results flags are derived from the attached consumers and
//! recomputed whenever one attaches or leaves.
//!
//! # Locking
//!
//! A multiplexer's state lock may be held while taking the producer's table
//! lock, never the reverse. No lock is held while calling a consumer or a
//! context callback.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, ReentrantMutex};
use tracing::{debug, info, trace};

use crate::image::EncodedImage;
use crate::producer::{
    Consumer, PipelineError, Producer, ProducerContext, ProducerContextCallbacks, Status,
};
use crate::request::Priority;
use crate::resource::ResourceHandle;

/// A result that can be copied for each attached consumer.
pub trait CloneableResult: Send + 'static {
    /// An independently owned copy, or `None` if the result was released.
    fn clone_result(&self) -> Option<Self>
    where
        Self: Sized;
}

impl<T: Send + Sync + 'static> CloneableResult for ResourceHandle<T> {
    fn clone_result(&self) -> Option<Self> {
        self.clone_or_none()
    }
}

impl CloneableResult for EncodedImage {
    fn clone_result(&self) -> Option<Self> {
        self.clone_or_none()
    }
}

/// Key identifying requests that may share an execution.
pub trait MultiplexKey: Eq + Hash + Clone + Debug + Send + Sync + 'static {}

impl<K: Eq + Hash + Clone + Debug + Send + Sync + 'static> MultiplexKey for K {}

/// Derives the multiplex key from a request context.
pub type KeyExtractor<K> = Arc<dyn Fn(&ProducerContext) -> K + Send + Sync>;

/// Counters describing how well requests are being shared.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MultiplexStats {
    /// Total requests seen.
    pub total_requests: u64,
    /// Requests that attached to an execution already in flight.
    pub coalesced_requests: u64,
    /// Requests that started a new execution.
    pub new_requests: u64,
}

impl MultiplexStats {
    /// Fraction of requests served by an existing execution.
    pub fn coalescing_ratio(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.coalesced_requests as f64 / self.total_requests as f64
        }
    }
}

#[derive(Default)]
struct Counters {
    total: AtomicU64,
    coalesced: AtomicU64,
    new: AtomicU64,
}

struct Shared<K, T> {
    name: &'static str,
    input: Arc<dyn Producer<T>>,
    keep_cancelled_fetch_as_low_priority: bool,
    multiplexers: Mutex<HashMap<K, Arc<Multiplexer<K, T>>>>,
    counters: Counters,
}

/// Shares one upstream execution among requests with equal keys.
pub struct MultiplexProducer<K, T> {
    shared: Arc<Shared<K, T>>,
    key_fn: KeyExtractor<K>,
}

impl<K: MultiplexKey, T: CloneableResult> MultiplexProducer<K, T> {
    /// Creates a multiplexer over `input`.
    ///
    /// With `keep_cancelled_fetch_as_low_priority`, an execution whose last
    /// non-prefetch consumer cancels keeps running at low priority so a
    /// later request can pick it up.
    pub fn new(
        name: &'static str,
        input: Arc<dyn Producer<T>>,
        key_fn: KeyExtractor<K>,
        keep_cancelled_fetch_as_low_priority: bool,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                name,
                input,
                keep_cancelled_fetch_as_low_priority,
                multiplexers: Mutex::new(HashMap::new()),
                counters: Counters::default(),
            }),
            key_fn,
        }
    }

    pub fn stats(&self) -> MultiplexStats {
        let counters = &self.shared.counters;
        MultiplexStats {
            total_requests: counters.total.load(Ordering::Relaxed),
            coalesced_requests: counters.coalesced.load(Ordering::Relaxed),
            new_requests: counters.new.load(Ordering::Relaxed),
        }
    }

    /// Number of executions currently in flight.
    pub fn in_flight_count(&self) -> usize {
        self.shared.multiplexers.lock().len()
    }

    pub fn log_stats(&self) {
        let stats = self.stats();
        info!(
            multiplexer = self.shared.name,
            total = stats.total_requests,
            coalesced = stats.coalesced_requests,
            new = stats.new_requests,
            ratio = format!("{:.1}%", stats.coalescing_ratio() * 100.0),
            in_flight = self.in_flight_count(),
            "Multiplexer statistics"
        );
    }

    fn get_or_create(&self, key: &K) -> (Arc<Multiplexer<K, T>>, bool) {
        let mut table = self.shared.multiplexers.lock();
        if let Some(existing) = table.get(key) {
            return (Arc::clone(existing), false);
        }
        let multiplexer = Arc::new(Multiplexer::new(
            key.clone(),
            Arc::downgrade(&self.shared),
        ));
        table.insert(key.clone(), Arc::clone(&multiplexer));
        (multiplexer, true)
    }
}

impl<K: MultiplexKey, T: CloneableResult> Producer<T> for MultiplexProducer<K, T> {
    fn produce(&self, consumer: Arc<dyn Consumer<T>>, context: ProducerContext) {
        let key = (self.key_fn)(&context);
        self.shared.counters.total.fetch_add(1, Ordering::Relaxed);

        loop {
            let (multiplexer, created) = self.get_or_create(&key);
            if multiplexer.add_new_consumer(Arc::clone(&consumer), context.clone()) {
                if created {
                    self.shared.counters.new.fetch_add(1, Ordering::Relaxed);
                    trace!(multiplexer = self.shared.name, key = ?key, "New execution");
                    multiplexer.start_input_producer_if_has_attached_consumers();
                } else {
                    self.shared.counters.coalesced.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        multiplexer = self.shared.name,
                        key = ?key,
                        request_id = context.id(),
                        "Request attached to in-flight execution"
                    );
                }
                return;
            }
            // Retired between lookup and attach.
            trace!(multiplexer = self.shared.name, key = ?key, "Retrying attach");
        }
    }

    fn name(&self) -> &'static str {
        self.shared.name
    }
}

/// One attached consumer.
struct Attached<T> {
    id: u64,
    consumer: Arc<dyn Consumer<T>>,
    context: ProducerContext,
    /// Serializes deliveries to this consumer.
    delivery: ReentrantMutex<()>,
}

struct MultiplexerState<T> {
    consumers: Vec<Arc<Attached<T>>>,
    last_intermediate: Option<(T, Status)>,
    last_progress: f32,
    shared_context: Option<ProducerContext>,
    /// Identifies the current upstream run; results from older runs are
    /// dropped.
    run: Option<u64>,
    next_attach_id: u64,
    next_run_id: u64,
}

struct Multiplexer<K, T> {
    key: K,
    owner: Weak<Shared<K, T>>,
    state: Mutex<MultiplexerState<T>>,
}

type CallbackList = Vec<Arc<dyn ProducerContextCallbacks>>;

impl<K: MultiplexKey, T: CloneableResult> Multiplexer<K, T> {
    fn new(key: K, owner: Weak<Shared<K, T>>) -> Self {
        Self {
            key,
            owner,
            state: Mutex::new(MultiplexerState {
                consumers: Vec::new(),
                last_intermediate: None,
                last_progress: 0.0,
                shared_context: None,
                run: None,
                next_attach_id: 0,
                next_run_id: 0,
            }),
        }
    }

    /// Whether the table still maps our key to this multiplexer.
    fn is_registered(self: &Arc<Self>) -> bool {
        self.owner.upgrade().is_some_and(|owner| {
            owner
                .multiplexers
                .lock()
                .get(&self.key)
                .is_some_and(|current| Arc::ptr_eq(current, self))
        })
    }

    fn remove_from_table(self: &Arc<Self>) {
        if let Some(owner) = self.owner.upgrade() {
            let mut table = owner.multiplexers.lock();
            if table
                .get(&self.key)
                .is_some_and(|current| Arc::ptr_eq(current, self))
            {
                table.remove(&self.key);
            }
        }
    }

    /// Attaches a consumer. Returns `false` if this multiplexer was retired
    /// and the caller must look up a fresh one.
    fn add_new_consumer(
        self: &Arc<Self>,
        consumer: Arc<dyn Consumer<T>>,
        context: ProducerContext,
    ) -> bool {
        let attached;
        let replay;
        let progress;
        let (prefetch_callbacks, priority_callbacks, intermediate_callbacks);
        {
            let mut state = self.state.lock();
            if !self.is_registered() {
                return false;
            }
            state.next_attach_id += 1;
            attached = Arc::new(Attached {
                id: state.next_attach_id,
                consumer,
                context: context.clone(),
                delivery: ReentrantMutex::new(()),
            });
            state.consumers.push(Arc::clone(&attached));

            prefetch_callbacks = Self::update_is_prefetch(&state);
            priority_callbacks = Self::update_priority(&state);
            intermediate_callbacks = Self::update_is_intermediate_results_expected(&state);
            replay = state
                .last_intermediate
                .as_ref()
                .and_then(|(result, status)| result.clone_result().map(|copy| (copy, *status)));
            progress = state.last_progress;
        }

        ProducerContext::call_on_is_prefetch_changed(prefetch_callbacks);
        ProducerContext::call_on_priority_changed(priority_callbacks);
        ProducerContext::call_on_is_intermediate_results_expected_changed(intermediate_callbacks);

        {
            let _delivery = attached.delivery.lock();
            if let Some((result, status)) = replay {
                attached.consumer.on_intermediate_result(result, status);
            }
            if progress > 0.0 {
                attached.consumer.on_progress_update(progress);
            }
        }

        context.add_callbacks(Arc::new(AttachedCallbacks {
            multiplexer: Arc::downgrade(self),
            attach_id: attached.id,
        }));
        true
    }

    fn start_input_producer_if_has_attached_consumers(self: &Arc<Self>) {
        let Some(owner) = self.owner.upgrade() else {
            self.cancel_all_consumers();
            return;
        };

        let (context, run) = {
            let mut state = self.state.lock();
            let Some(first) = state.consumers.first().map(|a| a.context.clone()) else {
                self.remove_from_table();
                return;
            };
            let context = ProducerContext::builder(first.request_arc())
                .id(first.id())
                .caller_context(first.caller_context().clone())
                .lowest_permitted_level(first.lowest_permitted_level())
                .listener(Arc::clone(first.listener()))
                .priority(Self::compute_priority(&state))
                .prefetch(Self::compute_is_prefetch(&state))
                .intermediate_results_expected(Self::compute_is_intermediate_results_expected(
                    &state,
                ))
                .build();
            state.next_run_id += 1;
            let run = state.next_run_id;
            state.run = Some(run);
            state.shared_context = Some(context.clone());
            (context, run)
        };

        let forwarding = Arc::new(ForwardingConsumer {
            multiplexer: Arc::clone(self),
            run,
        });
        owner.input.produce(forwarding, context);
    }

    fn cancel_all_consumers(self: &Arc<Self>) {
        let detached = std::mem::take(&mut self.state.lock().consumers);
        self.remove_from_table();
        for attached in detached {
            let _delivery = attached.delivery.lock();
            attached.consumer.on_cancellation();
        }
    }

    fn on_consumer_cancelled(self: &Arc<Self>, attach_id: u64) {
        let removed;
        let mut orphaned_context = None;
        let (mut prefetch_callbacks, mut priority_callbacks, mut intermediate_callbacks) =
            (Vec::new(), Vec::new(), Vec::new());
        {
            let mut state = self.state.lock();
            let Some(position) = state.consumers.iter().position(|a| a.id == attach_id) else {
                return;
            };
            removed = state.consumers.remove(position);
            if state.consumers.is_empty() {
                orphaned_context = state.shared_context.clone();
            } else {
                prefetch_callbacks = Self::update_is_prefetch(&state);
                priority_callbacks = Self::update_priority(&state);
                intermediate_callbacks = Self::update_is_intermediate_results_expected(&state);
            }
        }

        ProducerContext::call_on_is_prefetch_changed(prefetch_callbacks);
        ProducerContext::call_on_priority_changed(priority_callbacks);
        ProducerContext::call_on_is_intermediate_results_expected_changed(intermediate_callbacks);

        if let Some(context) = orphaned_context {
            let keep = self
                .owner
                .upgrade()
                .is_some_and(|owner| owner.keep_cancelled_fetch_as_low_priority);
            if keep && !context.is_prefetch() {
                debug!(key = ?self.key, "Keeping cancelled execution at low priority");
                ProducerContext::call_on_priority_changed(
                    context.set_priority_no_callbacks(Priority::Low),
                );
            } else {
                debug!(key = ?self.key, "Cancelling execution with no consumers left");
                context.cancel();
            }
        }

        let _delivery = removed.delivery.lock();
        removed.consumer.on_cancellation();
    }

    fn refresh_shared_parameters(&self) {
        let (prefetch_callbacks, priority_callbacks, intermediate_callbacks) = {
            let state = self.state.lock();
            (
                Self::update_is_prefetch(&state),
                Self::update_priority(&state),
                Self::update_is_intermediate_results_expected(&state),
            )
        };
        ProducerContext::call_on_is_prefetch_changed(prefetch_callbacks);
        ProducerContext::call_on_priority_changed(priority_callbacks);
        ProducerContext::call_on_is_intermediate_results_expected_changed(intermediate_callbacks);
    }

    fn on_next_result(self: &Arc<Self>, run: u64, result: Option<T>, status: Status, is_last: bool) {
        let targets;
        let previous;
        {
            let mut state = self.state.lock();
            if state.run != Some(run) {
                return;
            }
            previous = state.last_intermediate.take();
            if is_last {
                targets = std::mem::take(&mut state.consumers);
                state.run = None;
                state.shared_context = None;
                self.remove_from_table();
            } else {
                state.last_intermediate = result
                    .as_ref()
                    .and_then(CloneableResult::clone_result)
                    .map(|copy| (copy, status));
                targets = state.consumers.clone();
            }
        }
        drop(previous);

        for attached in targets {
            let _delivery = attached.delivery.lock();
            let copy = result.as_ref().and_then(CloneableResult::clone_result);
            if is_last {
                attached.consumer.on_final_result(copy, status);
            } else if let Some(copy) = copy {
                attached.consumer.on_intermediate_result(copy, status);
            }
        }
    }

    fn on_failure(self: &Arc<Self>, run: u64, error: PipelineError) {
        let (targets, previous) = {
            let mut state = self.state.lock();
            if state.run != Some(run) {
                return;
            }
            state.run = None;
            state.shared_context = None;
            self.remove_from_table();
            (
                std::mem::take(&mut state.consumers),
                state.last_intermediate.take(),
            )
        };
        drop(previous);

        for attached in targets {
            let _delivery = attached.delivery.lock();
            attached.consumer.on_failure(error.clone());
        }
    }

    fn on_cancelled(self: &Arc<Self>, run: u64) {
        let previous = {
            let mut state = self.state.lock();
            if state.run != Some(run) {
                return;
            }
            state.run = None;
            state.shared_context = None;
            state.last_intermediate.take()
        };
        drop(previous);
        // Consumers still attached did not ask for this; run again for them.
        self.start_input_producer_if_has_attached_consumers();
    }

    fn on_progress(&self, run: u64, progress: f32) {
        let targets = {
            let mut state = self.state.lock();
            if state.run != Some(run) {
                return;
            }
            state.last_progress = progress;
            state.consumers.clone()
        };
        for attached in targets {
            let _delivery = attached.delivery.lock();
            attached.consumer.on_progress_update(progress);
        }
    }

    fn compute_is_prefetch(state: &MultiplexerState<T>) -> bool {
        state.consumers.iter().all(|a| a.context.is_prefetch())
    }

    fn compute_priority(state: &MultiplexerState<T>) -> Priority {
        state
            .consumers
            .iter()
            .map(|a| a.context.priority())
            .max()
            .unwrap_or(Priority::Low)
    }

    fn compute_is_intermediate_results_expected(state: &MultiplexerState<T>) -> bool {
        state
            .consumers
            .iter()
            .any(|a| a.context.is_intermediate_results_expected())
    }

    fn update_is_prefetch(state: &MultiplexerState<T>) -> CallbackList {
        state.shared_context.as_ref().map_or_else(Vec::new, |context| {
            context.set_is_prefetch_no_callbacks(Self::compute_is_prefetch(state))
        })
    }

    fn update_priority(state: &MultiplexerState<T>) -> CallbackList {
        state.shared_context.as_ref().map_or_else(Vec::new, |context| {
            context.set_priority_no_callbacks(Self::compute_priority(state))
        })
    }

    fn update_is_intermediate_results_expected(state: &MultiplexerState<T>) -> CallbackList {
        state.shared_context.as_ref().map_or_else(Vec::new, |context| {
            context.set_is_intermediate_results_expected_no_callbacks(
                Self::compute_is_intermediate_results_expected(state),
            )
        })
    }
}

/// Registered on each attached consumer's own context.
struct AttachedCallbacks<K, T> {
    multiplexer: Weak<Multiplexer<K, T>>,
    attach_id: u64,
}

impl<K: MultiplexKey, T: CloneableResult> ProducerContextCallbacks for AttachedCallbacks<K, T> {
    fn on_cancellation_requested(&self) {
        if let Some(multiplexer) = self.multiplexer.upgrade() {
            multiplexer.on_consumer_cancelled(self.attach_id);
        }
    }

    fn on_is_prefetch_changed(&self) {
        if let Some(multiplexer) = self.multiplexer.upgrade() {
            multiplexer.refresh_shared_parameters();
        }
    }

    fn on_is_intermediate_results_expected_changed(&self) {
        if let Some(multiplexer) = self.multiplexer.upgrade() {
            multiplexer.refresh_shared_parameters();
        }
    }

    fn on_priority_changed(&self) {
        if let Some(multiplexer) = self.multiplexer.upgrade() {
            multiplexer.refresh_shared_parameters();
        }
    }
}

/// Receives the upstream results of one run.
struct ForwardingConsumer<K, T> {
    multiplexer: Arc<Multiplexer<K, T>>,
    run: u64,
}

impl<K: MultiplexKey, T: CloneableResult> Consumer<T> for ForwardingConsumer<K, T> {
    fn on_intermediate_result(&self, result: T, status: Status) {
        self.multiplexer
            .on_next_result(self.run, Some(result), status, false);
    }

    fn on_final_result(&self, result: Option<T>, status: Status) {
        self.multiplexer.on_next_result(self.run, result, status, true);
    }

    fn on_failure(&self, error: PipelineError) {
        self.multiplexer.on_failure(self.run, error);
    }

    fn on_cancellation(&self) {
        self.multiplexer.on_cancelled(self.run);
    }

    fn on_progress_update(&self, progress: f32) {
        self.multiplexer.on_progress(self.run, progress);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::producer::test_support::{Event, RecordingConsumer};
    use crate::producers::test_support::{context_with, Script, ScriptedProducer};
    use crate::request::ImageRequest;
    use bytes::Bytes;

    fn multiplexer(
        input: Arc<ScriptedProducer>,
        keep_cancelled: bool,
    ) -> MultiplexProducer<String, EncodedImage> {
        MultiplexProducer::new(
            "TestMultiplexProducer",
            input,
            Arc::new(|context: &ProducerContext| context.request().uri().as_str().to_string()),
            keep_cancelled,
        )
    }

    fn request(priority: Priority) -> ImageRequest {
        ImageRequest::from_uri("https://example.com/a.jpg")
            .unwrap()
            .with_priority(priority)
    }

    fn final_bytes(consumer: &RecordingConsumer<EncodedImage>) -> Option<Bytes> {
        consumer.events.lock().iter().find_map(|event| match event {
            Event::Final(Some(image)) => image.data().cloned(),
            _ => None,
        })
    }

    #[test]
    fn test_identical_requests_share_one_execution() {
        let input = ScriptedProducer::new(Script::Hold);
        let producer = multiplexer(Arc::clone(&input), false);
        let consumers: Vec<_> = (0..3).map(|_| RecordingConsumer::<EncodedImage>::new()).collect();

        for consumer in &consumers {
            producer.produce(consumer.clone(), context_with(request(Priority::Medium)));
        }
        assert_eq!(input.calls(), 1);
        assert_eq!(producer.in_flight_count(), 1);

        input.complete_held(b"shared");
        for consumer in &consumers {
            assert_eq!(final_bytes(consumer).unwrap().as_ref(), b"shared");
            assert_eq!(consumer.terminal_count(), 1);
        }
        assert_eq!(producer.in_flight_count(), 0);

        let stats = producer.stats();
        assert_eq!(stats.total_requests, 3);
        assert_eq!(stats.new_requests, 1);
        assert_eq!(stats.coalesced_requests, 2);
        assert!((stats.coalescing_ratio() - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_completed_key_starts_fresh_execution() {
        let input = ScriptedProducer::new(Script::Bytes(b"x"));
        let producer = multiplexer(Arc::clone(&input), false);

        producer.produce(RecordingConsumer::<EncodedImage>::new(), context_with(request(Priority::Medium)));
        producer.produce(RecordingConsumer::<EncodedImage>::new(), context_with(request(Priority::Medium)));

        assert_eq!(input.calls(), 2);
        assert_eq!(producer.in_flight_count(), 0);
    }

    #[test]
    fn test_upstream_cancelled_only_when_last_consumer_leaves() {
        let input = ScriptedProducer::new(Script::Hold);
        let producer = multiplexer(Arc::clone(&input), false);
        let first = RecordingConsumer::<EncodedImage>::new();
        let second = RecordingConsumer::<EncodedImage>::new();
        let first_context = context_with(request(Priority::Medium));
        let second_context = context_with(request(Priority::Medium));

        producer.produce(first.clone(), first_context.clone());
        producer.produce(second.clone(), second_context.clone());
        let shared_context = input.held.lock()[0].1.clone();

        first_context.cancel();
        assert!(matches!(first.events.lock().last(), Some(Event::Cancellation)));
        assert!(!shared_context.is_cancelled());

        second_context.cancel();
        assert!(matches!(second.events.lock().last(), Some(Event::Cancellation)));
        assert!(shared_context.is_cancelled());
    }

    #[test]
    fn test_shared_priority_tracks_attached_consumers() {
        let input = ScriptedProducer::new(Script::Hold);
        let producer = multiplexer(Arc::clone(&input), false);
        let low_context = context_with(request(Priority::Low));
        let high_context = context_with(request(Priority::High));

        producer.produce(RecordingConsumer::<EncodedImage>::new(), low_context.clone());
        let shared_context = input.held.lock()[0].1.clone();
        assert_eq!(shared_context.priority(), Priority::Low);

        producer.produce(RecordingConsumer::<EncodedImage>::new(), high_context.clone());
        assert_eq!(shared_context.priority(), Priority::High);

        high_context.cancel();
        assert_eq!(shared_context.priority(), Priority::Low);
    }

    #[test]
    fn test_cancelled_fetch_kept_at_low_priority_and_reused() {
        let input = ScriptedProducer::new(Script::Hold);
        let producer = multiplexer(Arc::clone(&input), true);
        let first_context = context_with(request(Priority::High));

        producer.produce(RecordingConsumer::<EncodedImage>::new(), first_context.clone());
        let shared_context = input.held.lock()[0].1.clone();
        first_context.cancel();

        assert!(!shared_context.is_cancelled());
        assert_eq!(shared_context.priority(), Priority::Low);

        let late = RecordingConsumer::<EncodedImage>::new();
        producer.produce(late.clone(), context_with(request(Priority::Medium)));
        assert_eq!(input.calls(), 1);
        assert_eq!(shared_context.priority(), Priority::Medium);

        input.complete_held(b"kept");
        assert_eq!(final_bytes(&late).unwrap().as_ref(), b"kept");
    }

    #[test]
    fn test_failure_reaches_every_consumer() {
        let input = ScriptedProducer::new(Script::Hold);
        let producer = multiplexer(Arc::clone(&input), false);
        let first = RecordingConsumer::<EncodedImage>::new();
        let second = RecordingConsumer::<EncodedImage>::new();

        producer.produce(first.clone(), context_with(request(Priority::Medium)));
        producer.produce(second.clone(), context_with(request(Priority::Medium)));

        let (consumer, _) = input.held.lock().pop().unwrap();
        consumer.on_failure(PipelineError::Internal("boom".into()));

        for recorded in [&first, &second] {
            assert!(matches!(
                recorded.events.lock().last(),
                Some(Event::Failure(PipelineError::Internal(reason))) if reason == "boom"
            ));
        }
        assert_eq!(producer.in_flight_count(), 0);
    }

    #[test]
    fn test_upstream_cancellation_restarts_for_attached_consumers() {
        let input = ScriptedProducer::new(Script::Hold);
        let producer = multiplexer(Arc::clone(&input), false);
        let consumer = RecordingConsumer::<EncodedImage>::new();

        producer.produce(consumer.clone(), context_with(request(Priority::Medium)));
        let (upstream, _) = input.held.lock().pop().unwrap();
        upstream.on_cancellation();

        assert_eq!(input.calls(), 2);
        assert_eq!(consumer.terminal_count(), 0);

        // The stale run is ignored.
        upstream.on_final_result(
            Some(EncodedImage::from_bytes(Bytes::from_static(b"stale"))),
            Status::NONE,
        );
        assert_eq!(consumer.terminal_count(), 0);

        input.complete_held(b"fresh");
        assert_eq!(final_bytes(&consumer).unwrap().as_ref(), b"fresh");
    }

    #[test]
    fn test_late_consumer_receives_last_intermediate_and_progress() {
        let input = ScriptedProducer::new(Script::Hold);
        let producer = multiplexer(Arc::clone(&input), false);

        producer.produce(RecordingConsumer::<EncodedImage>::new(), context_with(request(Priority::Medium)));
        {
            let held = input.held.lock();
            let upstream = &held[0].0;
            upstream.on_intermediate_result(
                EncodedImage::from_bytes(Bytes::from_static(b"partial")),
                Status::NONE,
            );
            upstream.on_progress_update(0.5);
        }

        let late = RecordingConsumer::<EncodedImage>::new();
        producer.produce(late.clone(), context_with(request(Priority::Medium)));

        let events = late.events.lock();
        assert!(matches!(
            &events[0],
            Event::Intermediate(image) if image.data().unwrap().as_ref() == b"partial"
        ));
        assert!(matches!(events[1], Event::Progress(p) if (p - 0.5).abs() < f32::EPSILON));
    }
}
