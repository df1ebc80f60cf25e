//! The producer/consumer protocol every pipeline stage speaks.
//!
//! A [`Producer`] starts work for a request and reports through a
//! [`Consumer`]. Stages compose by wrapping the downstream consumer and
//! passing the wrapper to the next producer upstream:
//!
//! ```text
//!  caller ◄── consumer ◄── cache-get ◄── decode ◄── fetch
//!               │             │            │          │
//!               └─────────────┴── ProducerContext ────┘
//!                 (priority, cancellation, listener, extras)
//! ```
//!
//! Each consumer sees zero or more intermediate results followed by exactly
//! one terminal event: a final result (possibly empty), a failure, or a
//! cancellation.

mod consumer;
mod context;
mod error;
mod listener;

pub use consumer::{Consumer, ConsumerState, GuardedConsumer, Status};
#[cfg(test)]
pub(crate) use consumer::test_support;
pub use context::{ProducerContext, ProducerContextBuilder, ProducerContextCallbacks};
pub use error::{FetchError, PipelineError};
pub use listener::{
    Extras, ForwardingRequestListener, LoggingRequestListener, NoOpProducerListener,
    ProducerListener, RequestListener,
};

use std::sync::Arc;

/// A pipeline stage.
///
/// `produce` must not block: long work is moved onto an executor. The
/// consumer receives every result it is handed by value and owns it.
pub trait Producer<T>: Send + Sync {
    fn produce(&self, consumer: Arc<dyn Consumer<T>>, context: ProducerContext);

    /// Stage name reported to listeners.
    fn name(&self) -> &'static str;
}
