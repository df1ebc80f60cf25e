//! Pausable FIFO hand-off of producer starts.
//!
//! While queueing, new tasks wait in order. `stop_queueing` releases them
//! to the executor in submission order; tasks submitted during the flush
//! join the tail of the queue so ordering holds across the transition.
//! A task only leaves the queue unexecuted through [`ThreadHandoffQueue::remove`].

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use super::pool::{Executor, Task};

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(0);

/// Identifies a task submitted to a [`ThreadHandoffQueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(u64);

impl TaskId {
    fn next() -> Self {
        Self(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }
}

struct QueueState {
    queueing: bool,
    flushing: bool,
    queue: VecDeque<(TaskId, Task)>,
}

/// Queue in front of the lightweight executor.
pub struct ThreadHandoffQueue {
    executor: Arc<dyn Executor>,
    state: Mutex<QueueState>,
}

impl ThreadHandoffQueue {
    pub fn new(executor: Arc<dyn Executor>) -> Self {
        Self {
            executor,
            state: Mutex::new(QueueState {
                queueing: false,
                flushing: false,
                queue: VecDeque::new(),
            }),
        }
    }

    /// Queues `task` while paused, otherwise hands it to the executor.
    pub fn add_to_queue_or_execute(&self, task: Task) -> TaskId {
        let id = TaskId::next();
        {
            let mut state = self.state.lock();
            if state.queueing || state.flushing {
                state.queue.push_back((id, task));
                return id;
            }
        }
        self.executor.execute(task);
        id
    }

    /// Pauses: subsequent tasks wait until [`stop_queueing`](Self::stop_queueing).
    pub fn start_queueing(&self) {
        let mut state = self.state.lock();
        if !state.queueing {
            debug!("hand-off queue paused");
        }
        state.queueing = true;
    }

    /// Resumes and flushes waiting tasks in FIFO order.
    pub fn stop_queueing(&self) {
        {
            let mut state = self.state.lock();
            state.queueing = false;
            if state.flushing {
                return;
            }
            state.flushing = true;
            debug!(pending = state.queue.len(), "hand-off queue resumed");
        }

        loop {
            let next = {
                let mut state = self.state.lock();
                if state.queueing {
                    state.flushing = false;
                    return;
                }
                match state.queue.pop_front() {
                    Some(entry) => entry,
                    None => {
                        state.flushing = false;
                        return;
                    }
                }
            };
            self.executor.execute(next.1);
        }
    }

    /// Drops a queued task that has not been handed to the executor yet.
    pub fn remove(&self, id: TaskId) -> bool {
        let mut state = self.state.lock();
        match state.queue.iter().position(|(queued, _)| *queued == id) {
            Some(index) => {
                state.queue.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn is_queueing(&self) -> bool {
        self.state.lock().queueing
    }

    pub fn pending(&self) -> usize {
        self.state.lock().queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::InlineExecutor;

    fn recorder(order: &Arc<Mutex<Vec<u32>>>, value: u32) -> Task {
        let order = Arc::clone(order);
        Box::new(move || order.lock().push(value))
    }

    #[test]
    fn test_executes_immediately_when_not_queueing() {
        let queue = ThreadHandoffQueue::new(Arc::new(InlineExecutor));
        let order = Arc::new(Mutex::new(Vec::new()));
        queue.add_to_queue_or_execute(recorder(&order, 1));
        assert_eq!(*order.lock(), vec![1]);
    }

    #[test]
    fn test_flush_preserves_submission_order() {
        let queue = ThreadHandoffQueue::new(Arc::new(InlineExecutor));
        let order = Arc::new(Mutex::new(Vec::new()));

        queue.start_queueing();
        for i in 0..5 {
            queue.add_to_queue_or_execute(recorder(&order, i));
        }
        assert!(order.lock().is_empty());
        assert_eq!(queue.pending(), 5);

        queue.stop_queueing();
        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
        assert!(!queue.is_queueing());
    }

    #[test]
    fn test_removed_task_never_runs() {
        let queue = ThreadHandoffQueue::new(Arc::new(InlineExecutor));
        let order = Arc::new(Mutex::new(Vec::new()));

        queue.start_queueing();
        queue.add_to_queue_or_execute(recorder(&order, 1));
        let removed = queue.add_to_queue_or_execute(recorder(&order, 2));
        queue.add_to_queue_or_execute(recorder(&order, 3));

        assert!(queue.remove(removed));
        assert!(!queue.remove(removed));
        queue.stop_queueing();
        assert_eq!(*order.lock(), vec![1, 3]);
    }

    #[test]
    fn test_task_submitted_during_flush_runs_after_earlier_tasks() {
        let queue = Arc::new(ThreadHandoffQueue::new(Arc::new(InlineExecutor)));
        let order = Arc::new(Mutex::new(Vec::new()));

        queue.start_queueing();
        let q = Arc::clone(&queue);
        let o = Arc::clone(&order);
        queue.add_to_queue_or_execute(Box::new(move || {
            o.lock().push(1);
            q.add_to_queue_or_execute(recorder(&o, 3));
        }));
        queue.add_to_queue_or_execute(recorder(&order, 2));

        queue.stop_queueing();
        assert_eq!(*order.lock(), vec![1, 2, 3]);
    }
}
