//! Closeable shared handle over a reference-counted value.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tracing::{trace, warn};

use super::releaser::{NoOpReleaser, ResourceReleaser};

/// Errors from using a handle after it has been closed.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum HandleError {
    /// The handle no longer references a value.
    #[error("resource handle is closed")]
    Closed,

    /// `close()` was called on a handle that was already closed.
    #[error("resource handle was already closed")]
    AlreadyClosed,
}

/// The value every handle for one resource points at.
struct SharedResource<T> {
    value: Arc<T>,
    ref_count: AtomicUsize,
    releaser: Arc<dyn ResourceReleaser<T>>,
}

impl<T> SharedResource<T> {
    fn new(value: Arc<T>, releaser: Arc<dyn ResourceReleaser<T>>) -> Self {
        Self {
            value,
            ref_count: AtomicUsize::new(1),
            releaser,
        }
    }

    /// Increments the count unless it already reached zero.
    fn add_reference(&self) -> Result<(), HandleError> {
        let mut current = self.ref_count.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return Err(HandleError::Closed);
            }
            match self.ref_count.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }
    }

    /// Decrements the count, releasing the value when it reaches zero.
    fn delete_reference(&self) {
        if self.ref_count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.releaser.release(&self.value);
        }
    }

    fn count(&self) -> usize {
        self.ref_count.load(Ordering::Acquire)
    }
}

/// A closeable, cloneable reference to a pooled value.
///
/// Each handle owns one unit of the shared count. `try_clone` adds a unit,
/// `close` (or drop) removes this handle's unit. When the count reaches zero
/// the releaser runs synchronously on the closing thread.
pub struct ResourceHandle<T: Send + Sync + 'static> {
    shared: Option<Arc<SharedResource<T>>>,
}

impl<T: Send + Sync + 'static> ResourceHandle<T> {
    /// Wraps `value` in a fresh handle that releases through `releaser`.
    pub fn new(value: T, releaser: impl ResourceReleaser<T> + 'static) -> Self {
        Self::of_shared(Arc::new(value), Arc::new(releaser))
    }

    /// Wraps `value` with no cleanup beyond dropping it.
    pub fn unmanaged(value: T) -> Self {
        Self::new(value, NoOpReleaser)
    }

    /// Starts a new reference count over an already shared value.
    ///
    /// The memory cache uses this to hand out client handles over its own
    /// copy of a value while tracking client lifetimes separately.
    pub fn of_shared(value: Arc<T>, releaser: Arc<dyn ResourceReleaser<T>>) -> Self {
        Self {
            shared: Some(Arc::new(SharedResource::new(value, releaser))),
        }
    }

    /// Returns a new handle to the same resource.
    pub fn try_clone(&self) -> Result<Self, HandleError> {
        let shared = self.shared.as_ref().ok_or(HandleError::Closed)?;
        shared.add_reference()?;
        Ok(Self {
            shared: Some(Arc::clone(shared)),
        })
    }

    /// Like [`try_clone`](Self::try_clone) but maps a closed handle to `None`.
    pub fn clone_or_none(&self) -> Option<Self> {
        self.try_clone().ok()
    }

    /// Clones an optional handle, treating a closed handle as absent.
    pub fn clone_option(handle: &Option<Self>) -> Option<Self> {
        handle.as_ref().and_then(Self::clone_or_none)
    }

    /// Gives up this handle's reference.
    ///
    /// Closing twice is reported as [`HandleError::AlreadyClosed`] and never
    /// releases the value a second time.
    pub fn close(&mut self) -> Result<(), HandleError> {
        match self.shared.take() {
            Some(shared) => {
                shared.delete_reference();
                Ok(())
            }
            None => {
                warn!("close() called on an already closed resource handle");
                Err(HandleError::AlreadyClosed)
            }
        }
    }

    /// Closes every handle yielded by `handles`, ignoring already closed ones.
    pub fn close_all<'a>(handles: impl IntoIterator<Item = &'a mut Self>) {
        for handle in handles {
            if handle.is_valid() {
                let _ = handle.close();
            }
        }
    }

    /// Whether this handle still references a value.
    pub fn is_valid(&self) -> bool {
        self.shared.is_some()
    }

    /// Borrows the value.
    pub fn get(&self) -> Result<&T, HandleError> {
        self.shared
            .as_ref()
            .map(|shared| shared.value.as_ref())
            .ok_or(HandleError::Closed)
    }

    /// The underlying shared value, for building derived handles.
    pub(crate) fn shared_value(&self) -> Option<&Arc<T>> {
        self.shared.as_ref().map(|shared| &shared.value)
    }

    /// Number of open handles sharing this resource, zero when closed.
    pub fn shared_count(&self) -> usize {
        self.shared.as_ref().map_or(0, |shared| shared.count())
    }

    /// Whether both handles point at the same underlying value.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        match (self.shared_value(), other.shared_value()) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl<T: Send + Sync + 'static> Drop for ResourceHandle<T> {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            trace!(remaining = shared.count() - 1, "resource handle dropped without close");
            shared.delete_reference();
        }
    }
}

impl<T: Send + Sync + fmt::Debug + 'static> fmt::Debug for ResourceHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.shared {
            Some(shared) => f
                .debug_struct("ResourceHandle")
                .field("value", &shared.value)
                .field("shared_count", &shared.count())
                .finish(),
            None => f.write_str("ResourceHandle(<closed>)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_handle(value: u32) -> (ResourceHandle<u32>, Arc<AtomicUsize>) {
        let releases = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&releases);
        let handle = ResourceHandle::new(value, move |_: &u32| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        (handle, releases)
    }

    #[test]
    fn test_release_runs_once_after_last_close() {
        let (mut a, releases) = counting_handle(7);
        let mut b = a.try_clone().unwrap();
        assert_eq!(a.shared_count(), 2);

        a.close().unwrap();
        assert_eq!(releases.load(Ordering::SeqCst), 0);
        assert_eq!(*b.get().unwrap(), 7);

        b.close().unwrap();
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_double_close_is_reported_not_released_twice() {
        let (mut a, releases) = counting_handle(1);
        a.close().unwrap();
        assert_eq!(a.close(), Err(HandleError::AlreadyClosed));
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_closed_handle_rejects_access_and_clone() {
        let (mut a, _) = counting_handle(1);
        a.close().unwrap();
        assert!(!a.is_valid());
        assert_eq!(a.get(), Err(HandleError::Closed));
        assert!(a.try_clone().is_err());
        assert!(a.clone_or_none().is_none());
        assert_eq!(a.shared_count(), 0);
    }

    #[test]
    fn test_drop_releases() {
        let (a, releases) = counting_handle(3);
        let b = a.try_clone().unwrap();
        drop(a);
        assert_eq!(releases.load(Ordering::SeqCst), 0);
        drop(b);
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_ptr_eq_tracks_underlying_value() {
        let (a, _) = counting_handle(3);
        let b = a.try_clone().unwrap();
        let (c, _) = counting_handle(3);
        assert!(a.ptr_eq(&b));
        assert!(!a.ptr_eq(&c));
    }

    #[test]
    fn test_of_shared_counts_independently() {
        let value = Arc::new(5u32);
        let releases = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&releases);
        let releaser: Arc<dyn ResourceReleaser<u32>> = Arc::new(move |_: &u32| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let mut first = ResourceHandle::of_shared(Arc::clone(&value), Arc::clone(&releaser));
        let second = ResourceHandle::of_shared(Arc::clone(&value), releaser);
        first.close().unwrap();
        assert_eq!(releases.load(Ordering::SeqCst), 1);
        assert_eq!(*second.get().unwrap(), 5);
    }

    #[test]
    fn test_close_all_skips_closed_handles() {
        let (a, releases) = counting_handle(9);
        let mut handles = vec![a.try_clone().unwrap(), a.try_clone().unwrap(), a];
        handles[0].close().unwrap();
        ResourceHandle::close_all(handles.iter_mut());
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Clone(usize),
        Close(usize),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0usize..16).prop_map(Op::Clone),
            (0usize..16).prop_map(Op::Close),
        ]
    }

    proptest! {
        #[test]
        fn prop_release_happens_exactly_once(ops in proptest::collection::vec(op_strategy(), 0..64)) {
            let (root, releases) = counting_handle(42);
            let mut handles = vec![root];

            for op in ops {
                match op {
                    Op::Clone(i) => {
                        let idx = i % handles.len();
                        if let Some(clone) = handles[idx].clone_or_none() {
                            handles.push(clone);
                        }
                    }
                    Op::Close(i) => {
                        let idx = i % handles.len();
                        let _ = handles[idx].close();
                    }
                }
                let open = handles.iter().filter(|h| h.is_valid()).count();
                let released = releases.load(Ordering::SeqCst);
                prop_assert!(released <= 1);
                prop_assert_eq!(released == 1, open == 0);
            }

            ResourceHandle::close_all(handles.iter_mut());
            prop_assert_eq!(releases.load(Ordering::SeqCst), 1);
        }
    }
}
