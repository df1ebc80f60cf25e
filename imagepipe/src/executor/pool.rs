//! Executor implementations.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tracing::{trace, warn};

/// A unit of blocking work.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Runs tasks and futures on behalf of pipeline stages.
pub trait Executor: Send + Sync {
    /// Runs a synchronous task, possibly on another thread.
    fn execute(&self, task: Task);

    /// Drives a future to completion.
    fn spawn(&self, future: BoxFuture<'static, ()>);

    fn name(&self) -> &str;
}

/// Runs `f` on `executor` and returns a receiver for its result.
///
/// The receiver errors if the executor drops the task without running it.
pub fn submit<R, F>(executor: &dyn Executor, f: F) -> oneshot::Receiver<R>
where
    R: Send + 'static,
    F: FnOnce() -> R + Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    executor.execute(Box::new(move || {
        let _ = tx.send(f());
    }));
    rx
}

/// A bounded pool on a tokio runtime.
///
/// Capacity is enforced with a semaphore; blocking tasks run on
/// `spawn_blocking` once a permit is held.
#[derive(Debug)]
pub struct PoolExecutor {
    name: String,
    handle: Handle,
    semaphore: Arc<Semaphore>,
    capacity: usize,
    in_flight: Arc<AtomicUsize>,
}

impl PoolExecutor {
    pub fn new(name: impl Into<String>, handle: Handle, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            name: name.into(),
            handle,
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }
}

impl Executor for PoolExecutor {
    fn execute(&self, task: Task) {
        let semaphore = Arc::clone(&self.semaphore);
        let in_flight = Arc::clone(&self.in_flight);
        let name = self.name.clone();
        self.handle.spawn(async move {
            let Ok(_permit) = semaphore.acquire_owned().await else {
                return;
            };
            in_flight.fetch_add(1, Ordering::Relaxed);
            if let Err(e) = tokio::task::spawn_blocking(task).await {
                warn!(pool = %name, error = %e, "executor task panicked");
            }
            in_flight.fetch_sub(1, Ordering::Relaxed);
        });
    }

    fn spawn(&self, future: BoxFuture<'static, ()>) {
        let semaphore = Arc::clone(&self.semaphore);
        let in_flight = Arc::clone(&self.in_flight);
        self.handle.spawn(async move {
            let Ok(_permit) = semaphore.acquire_owned().await else {
                return;
            };
            in_flight.fetch_add(1, Ordering::Relaxed);
            future.await;
            in_flight.fetch_sub(1, Ordering::Relaxed);
        });
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Runs tasks one at a time in submission order.
#[derive(Debug)]
pub struct SerialExecutor {
    name: String,
    handle: Handle,
    sender: mpsc::UnboundedSender<Task>,
}

impl SerialExecutor {
    pub fn new(name: impl Into<String>, handle: Handle) -> Self {
        let name = name.into();
        let (sender, mut receiver) = mpsc::unbounded_channel::<Task>();
        let worker_name = name.clone();
        handle.spawn(async move {
            while let Some(task) = receiver.recv().await {
                if let Err(e) = tokio::task::spawn_blocking(task).await {
                    warn!(pool = %worker_name, error = %e, "serial task panicked");
                }
            }
            trace!(pool = %worker_name, "serial executor stopped");
        });
        Self {
            name,
            handle,
            sender,
        }
    }
}

impl Executor for SerialExecutor {
    fn execute(&self, task: Task) {
        if self.sender.send(task).is_err() {
            warn!(pool = %self.name, "serial executor worker is gone, task dropped");
        }
    }

    fn spawn(&self, future: BoxFuture<'static, ()>) {
        self.handle.spawn(future);
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Runs tasks immediately on the calling thread.
///
/// Futures are spawned on the ambient tokio runtime when there is one, and
/// driven to completion in place otherwise.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineExecutor;

impl Executor for InlineExecutor {
    fn execute(&self, task: Task) {
        task();
    }

    fn spawn(&self, future: BoxFuture<'static, ()>) {
        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(future);
            }
            Err(_) => futures::executor::block_on(future),
        }
    }

    fn name(&self) -> &str {
        "inline"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_pool_runs_tasks() {
        let pool = PoolExecutor::new("test", Handle::current(), 2);
        let rx = submit(&pool, || 21 * 2);
        assert_eq!(rx.await.unwrap(), 42);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_pool_respects_capacity() {
        let pool = PoolExecutor::new("test", Handle::current(), 1);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut receivers = Vec::new();
        for _ in 0..4 {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            receivers.push(submit(&pool, move || {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(10));
                running.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for rx in receivers {
            rx.await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_serial_preserves_order() {
        let serial = SerialExecutor::new("serial", Handle::current());
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..10 {
            let order = Arc::clone(&order);
            serial.execute(Box::new(move || order.lock().push(i)));
        }
        let done = submit(&serial, || ());
        done.await.unwrap();
        assert_eq!(*order.lock(), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_inline_runs_on_caller() {
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ran);
        InlineExecutor.execute(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
