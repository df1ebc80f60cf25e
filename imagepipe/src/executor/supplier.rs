//! Executor pool wiring.

use std::sync::Arc;

use tokio::runtime::Handle;

use super::pool::{Executor, InlineExecutor, PoolExecutor, SerialExecutor};

/// Default concurrent network fetches.
pub const DEFAULT_NETWORK_THREADS: usize = 3;

/// Default concurrent disk reads.
pub const DEFAULT_STORAGE_READ_THREADS: usize = 2;

/// Default concurrent disk writes.
pub const DEFAULT_STORAGE_WRITE_THREADS: usize = 1;

/// Decode pool size multiplier over available CPUs.
pub const DECODE_CAPACITY_MULTIPLIER: f64 = 1.25;

/// Minimum decode pool addition over available CPUs.
pub const MIN_DECODE_CAPACITY_ADDITION: usize = 2;

/// Pool capacities.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorConfig {
    pub network_threads: usize,
    pub storage_read_threads: usize,
    pub storage_write_threads: usize,
    pub decode_threads: usize,
    pub background_threads: usize,
}

impl ExecutorConfig {
    /// `max(cpus * 1.25, cpus + 2)`
    pub fn default_decode_threads() -> usize {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        let scaled = (cpus as f64 * DECODE_CAPACITY_MULTIPLIER).ceil() as usize;
        scaled.max(cpus + MIN_DECODE_CAPACITY_ADDITION)
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self {
            network_threads: DEFAULT_NETWORK_THREADS,
            storage_read_threads: DEFAULT_STORAGE_READ_THREADS,
            storage_write_threads: DEFAULT_STORAGE_WRITE_THREADS,
            decode_threads: Self::default_decode_threads(),
            background_threads: cpus,
        }
    }
}

/// Supplies the executor for each kind of pipeline work.
pub trait ExecutorSupplier: Send + Sync {
    fn for_network(&self) -> Arc<dyn Executor>;
    fn for_local_storage_read(&self) -> Arc<dyn Executor>;
    fn for_local_storage_write(&self) -> Arc<dyn Executor>;
    fn for_decode(&self) -> Arc<dyn Executor>;
    fn for_background_tasks(&self) -> Arc<dyn Executor>;
    /// Must execute tasks serially in submission order.
    fn for_lightweight_background_tasks(&self) -> Arc<dyn Executor>;
    fn for_ui_affinity(&self) -> Arc<dyn Executor>;
}

/// Pools backed by a tokio runtime.
pub struct TokioExecutorSupplier {
    network: Arc<dyn Executor>,
    storage_read: Arc<dyn Executor>,
    storage_write: Arc<dyn Executor>,
    decode: Arc<dyn Executor>,
    background: Arc<dyn Executor>,
    lightweight: Arc<dyn Executor>,
    ui: Arc<dyn Executor>,
}

impl TokioExecutorSupplier {
    pub fn new(handle: Handle, config: &ExecutorConfig) -> Self {
        let pool = |name: &str, capacity: usize| -> Arc<dyn Executor> {
            Arc::new(PoolExecutor::new(name, handle.clone(), capacity))
        };
        Self {
            network: pool("network", config.network_threads),
            storage_read: pool("storage-read", config.storage_read_threads),
            storage_write: pool("storage-write", config.storage_write_threads),
            decode: pool("decode", config.decode_threads),
            background: pool("background", config.background_threads),
            lightweight: Arc::new(SerialExecutor::new("lightweight", handle.clone())),
            ui: Arc::new(SerialExecutor::new("ui", handle.clone())),
        }
    }
}

impl ExecutorSupplier for TokioExecutorSupplier {
    fn for_network(&self) -> Arc<dyn Executor> {
        Arc::clone(&self.network)
    }

    fn for_local_storage_read(&self) -> Arc<dyn Executor> {
        Arc::clone(&self.storage_read)
    }

    fn for_local_storage_write(&self) -> Arc<dyn Executor> {
        Arc::clone(&self.storage_write)
    }

    fn for_decode(&self) -> Arc<dyn Executor> {
        Arc::clone(&self.decode)
    }

    fn for_background_tasks(&self) -> Arc<dyn Executor> {
        Arc::clone(&self.background)
    }

    fn for_lightweight_background_tasks(&self) -> Arc<dyn Executor> {
        Arc::clone(&self.lightweight)
    }

    fn for_ui_affinity(&self) -> Arc<dyn Executor> {
        Arc::clone(&self.ui)
    }
}

/// Every pool runs inline on the caller. Deterministic; used in tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineExecutorSupplier;

impl ExecutorSupplier for InlineExecutorSupplier {
    fn for_network(&self) -> Arc<dyn Executor> {
        Arc::new(InlineExecutor)
    }

    fn for_local_storage_read(&self) -> Arc<dyn Executor> {
        Arc::new(InlineExecutor)
    }

    fn for_local_storage_write(&self) -> Arc<dyn Executor> {
        Arc::new(InlineExecutor)
    }

    fn for_decode(&self) -> Arc<dyn Executor> {
        Arc::new(InlineExecutor)
    }

    fn for_background_tasks(&self) -> Arc<dyn Executor> {
        Arc::new(InlineExecutor)
    }

    fn for_lightweight_background_tasks(&self) -> Arc<dyn Executor> {
        Arc::new(InlineExecutor)
    }

    fn for_ui_affinity(&self) -> Arc<dyn Executor> {
        Arc::new(InlineExecutor)
    }
}
