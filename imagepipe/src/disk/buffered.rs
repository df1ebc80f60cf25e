//! Disk cache fronted by the staging area.
//!
//! Reads consult the staging area first, so an image accepted by `put` is
//! visible before its write lands. Disk I/O runs on the storage executors and
//! every failure degrades to a miss or a no-op.

use std::io::Write;
use std::sync::Arc;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::error::CacheError;
use super::staging::StagingArea;
use super::storage_cache::DiskStorageCache;
use crate::executor::{submit, Executor};
use crate::image::EncodedImage;
use crate::key::CacheKey;
use crate::stats::CacheStatsTracker;

/// Outcome of a disk lookup.
#[derive(Debug)]
pub enum DiskLookup {
    Hit(EncodedImage),
    Miss,
    Cancelled,
}

impl DiskLookup {
    pub fn is_hit(&self) -> bool {
        matches!(self, Self::Hit(_))
    }
}

/// Callback receiving a lookup outcome.
pub type LookupCallback = Box<dyn FnOnce(DiskLookup) + Send + 'static>;

pub struct BufferedDiskCache {
    storage: Arc<DiskStorageCache>,
    staging: Arc<StagingArea>,
    read_executor: Arc<dyn Executor>,
    write_executor: Arc<dyn Executor>,
    stats: Arc<dyn CacheStatsTracker>,
}

impl BufferedDiskCache {
    pub fn new(
        storage: Arc<DiskStorageCache>,
        read_executor: Arc<dyn Executor>,
        write_executor: Arc<dyn Executor>,
        stats: Arc<dyn CacheStatsTracker>,
    ) -> Self {
        Self {
            storage,
            staging: Arc::new(StagingArea::new()),
            read_executor,
            write_executor,
            stats,
        }
    }

    pub fn storage(&self) -> &Arc<DiskStorageCache> {
        &self.storage
    }

    pub fn staging(&self) -> &StagingArea {
        &self.staging
    }

    /// Looks up `key`. Staged images are returned synchronously; otherwise
    /// the disk read runs on the read executor and `callback` fires there.
    pub fn get_with_callback(&self, key: &CacheKey, token: CancellationToken, callback: LookupCallback) {
        if let Some(image) = self.staging.get(key) {
            self.stats.on_staging_area_hit(key);
            callback(DiskLookup::Hit(image));
            return;
        }
        self.stats.on_staging_area_miss(key);

        let key = key.clone();
        let storage = Arc::clone(&self.storage);
        let staging = Arc::clone(&self.staging);
        let stats = Arc::clone(&self.stats);
        self.read_executor.execute(Box::new(move || {
            if token.is_cancelled() {
                callback(DiskLookup::Cancelled);
                return;
            }
            // The write may have been staged while we were queued.
            if let Some(image) = staging.get(&key) {
                stats.on_staging_area_hit(&key);
                callback(DiskLookup::Hit(image));
                return;
            }
            let lookup = read_from_disk(&storage, stats.as_ref(), &key);
            if token.is_cancelled() {
                callback(DiskLookup::Cancelled);
            } else {
                callback(lookup);
            }
        }));
    }

    pub async fn get(&self, key: &CacheKey, token: CancellationToken) -> DiskLookup {
        let (tx, rx) = oneshot::channel();
        self.get_with_callback(
            key,
            token,
            Box::new(move |lookup| {
                let _ = tx.send(lookup);
            }),
        );
        rx.await.unwrap_or(DiskLookup::Miss)
    }

    /// Stages `image` and writes it on the write executor.
    pub fn put(&self, key: &CacheKey, image: &EncodedImage) {
        let Some(copy) = image.clone_or_none() else {
            debug!(key = %key, "Skipping disk write of closed image");
            return;
        };
        let Some(bytes) = copy.data().cloned() else {
            return;
        };
        self.staging.put(key.clone(), &copy);

        let key = key.clone();
        let storage = Arc::clone(&self.storage);
        let staging = Arc::clone(&self.staging);
        let stats = Arc::clone(&self.stats);
        self.write_executor.execute(Box::new(move || {
            match storage.insert(&key, |w| w.write_all(&bytes)) {
                Ok(_) => stats.on_disk_cache_put(&key),
                Err(e) => {
                    warn!(key = %key, error = %e, "Disk cache write failed");
                    stats.on_disk_cache_write_fail(&key);
                }
            }
            staging.remove_if_same(&key, &copy);
        }));
    }

    /// Staging or in-memory index; no I/O.
    pub fn contains_sync(&self, key: &CacheKey) -> bool {
        self.staging.contains_key(key) || self.storage.has_key_sync(key)
    }

    /// Like `contains_sync` but falls back to the filesystem on this thread.
    pub fn disk_check_sync(&self, key: &CacheKey) -> bool {
        self.contains_sync(key) || self.storage.has_key(key)
    }

    pub async fn contains(&self, key: &CacheKey) -> bool {
        if self.contains_sync(key) {
            return true;
        }
        let storage = Arc::clone(&self.storage);
        let key = key.clone();
        submit(self.read_executor.as_ref(), move || storage.has_key(&key))
            .await
            .unwrap_or(false)
    }

    /// Records an access without reading the content.
    pub async fn probe(&self, key: &CacheKey) -> bool {
        if self.staging.contains_key(key) {
            return true;
        }
        let storage = Arc::clone(&self.storage);
        let key = key.clone();
        submit(self.read_executor.as_ref(), move || storage.probe(&key))
            .await
            .unwrap_or(false)
    }

    /// Unstages `key` immediately and deletes it from disk on the write
    /// executor. The receiver resolves once the file is gone.
    pub fn remove(&self, key: &CacheKey) -> oneshot::Receiver<()> {
        self.staging.remove(key);
        let storage = Arc::clone(&self.storage);
        let key = key.clone();
        submit(self.write_executor.as_ref(), move || {
            if let Err(e) = storage.remove(&key) {
                warn!(key = %key, error = %e, "Disk cache remove failed");
            }
        })
    }

    pub fn clear_all(&self) -> oneshot::Receiver<()> {
        self.staging.clear_all();
        let storage = Arc::clone(&self.storage);
        submit(self.write_executor.as_ref(), move || {
            if let Err(e) = storage.clear_all() {
                warn!(error = %e, "Disk cache clear failed");
            }
        })
    }
}

fn read_from_disk(storage: &DiskStorageCache, stats: &dyn CacheStatsTracker, key: &CacheKey) -> DiskLookup {
    let Some(resource) = storage.get_resource(key) else {
        stats.on_disk_cache_miss(key);
        return DiskLookup::Miss;
    };
    match resource.read() {
        Ok(bytes) => {
            stats.on_disk_cache_hit(key);
            let mut image = EncodedImage::from_bytes(bytes);
            image.set_encoded_cache_key(key.clone());
            DiskLookup::Hit(image)
        }
        Err(e) => {
            let error = CacheError::at(resource.path(), e);
            warn!(key = %key, error = %error, "Disk cache read failed");
            stats.on_disk_cache_get_fail(key);
            DiskLookup::Miss
        }
    }
}
