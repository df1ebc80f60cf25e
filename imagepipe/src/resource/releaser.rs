//! Release callbacks invoked when the last handle to a resource closes.

/// Returns a resource to wherever it came from.
///
/// Implementations must tolerate being called from any thread. A releaser is
/// never called more than once per shared resource.
pub trait ResourceReleaser<T>: Send + Sync {
    fn release(&self, value: &T);
}

impl<T, F> ResourceReleaser<T> for F
where
    F: Fn(&T) + Send + Sync,
{
    fn release(&self, value: &T) {
        self(value)
    }
}

/// Releaser for values that need no cleanup beyond being dropped.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpReleaser;

impl<T> ResourceReleaser<T> for NoOpReleaser {
    fn release(&self, _value: &T) {}
}
