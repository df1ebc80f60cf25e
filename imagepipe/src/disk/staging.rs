//! Write-behind staging area.
//!
//! Holds encoded images between the moment a disk write is accepted and the
//! moment it lands, so reads issued in between still hit.

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::trace;

use crate::image::EncodedImage;
use crate::key::CacheKey;

#[derive(Debug, Default)]
pub struct StagingArea {
    entries: Mutex<HashMap<CacheKey, EncodedImage>>,
}

impl StagingArea {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stages a copy of `image`. A previously staged image for the key is
    /// released.
    pub fn put(&self, key: CacheKey, image: &EncodedImage) {
        let Some(copy) = image.clone_or_none() else {
            return;
        };
        let previous = self.entries.lock().insert(key, copy);
        // Release outside the lock.
        drop(previous);
        self.log_count();
    }

    /// A fresh copy of the staged image, if any.
    pub fn get(&self, key: &CacheKey) -> Option<EncodedImage> {
        let mut entries = self.entries.lock();
        let copy = entries.get(key).and_then(EncodedImage::clone_or_none);
        if copy.is_none() {
            // Closed behind our back: drop the dead entry.
            entries.remove(key);
        }
        copy
    }

    pub fn contains_key(&self, key: &CacheKey) -> bool {
        self.entries
            .lock()
            .get(key)
            .is_some_and(EncodedImage::is_valid)
    }

    pub fn remove(&self, key: &CacheKey) -> bool {
        let removed = self.entries.lock().remove(key);
        let found = removed.is_some();
        drop(removed);
        if found {
            self.log_count();
        }
        found
    }

    /// Removes the entry only if it still holds the same bytes as `image`.
    ///
    /// A write completing for an older image must not unstage a newer one.
    pub fn remove_if_same(&self, key: &CacheKey, image: &EncodedImage) -> bool {
        let removed = {
            let mut entries = self.entries.lock();
            match entries.get(key) {
                Some(staged) if staged.same_bytes(image) => entries.remove(key),
                _ => None,
            }
        };
        let found = removed.is_some();
        drop(removed);
        if found {
            self.log_count();
        }
        found
    }

    pub fn clear_all(&self) {
        let drained: Vec<EncodedImage> = self.entries.lock().drain().map(|(_, v)| v).collect();
        drop(drained);
        self.log_count();
    }

    pub fn count(&self) -> usize {
        self.entries.lock().len()
    }

    fn log_count(&self) {
        trace!(count = self.count(), "Staging area size");
    }
}
