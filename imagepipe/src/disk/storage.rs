//! On-disk layout of a cache instance.
//!
//! ```text
//! <base>/<version>/<shard>/<resource_id>.cnt
//! <base>/<version>/<shard>/<resource_id>.<pid>-<n>.tmp
//! ```
//!
//! Shards are `00` to `99`, derived from the first byte of the resource id.
//! Content is written to a temp file in the target shard and renamed into
//! place, so readers never observe a partial `.cnt` file.

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use tracing::{debug, info, warn};

use super::error::CacheError;

const CONTENT_EXTENSION: &str = "cnt";
const TEMP_EXTENSION: &str = "tmp";
const SHARD_COUNT: u32 = 100;

/// Temp files younger than this may belong to a write still in progress.
pub const TEMP_FILE_LIFETIME: Duration = Duration::from_secs(30 * 60);

/// A committed entry on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryResource {
    path: PathBuf,
    size: u64,
}

impl BinaryResource {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn read(&self) -> io::Result<Bytes> {
        fs::read(&self.path).map(Bytes::from)
    }
}

/// A content file found while scanning the tree.
#[derive(Debug, Clone)]
pub struct StoredEntry {
    pub resource_id: String,
    pub size: u64,
    pub modified: SystemTime,
}

/// Result of scanning the directory tree.
#[derive(Debug, Default)]
pub struct ScanResult {
    pub entries: Vec<StoredEntry>,
    pub temp_files_removed: usize,
    pub skipped: usize,
}

/// File-level operations for one versioned cache directory.
#[derive(Debug)]
pub struct DiskStorage {
    root: PathBuf,
    temp_counter: AtomicU64,
}

impl DiskStorage {
    /// Opens `<base>/<version>`, creating it and removing directories left
    /// behind by other layout versions.
    pub fn open(base: &Path, version: &str) -> Result<Self, CacheError> {
        let root = base.join(version);
        fs::create_dir_all(&root).map_err(|e| CacheError::at(&root, e))?;
        remove_stale_versions(base, version);
        Ok(Self {
            root,
            temp_counter: AtomicU64::new(0),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Shard directory name for a resource id.
    pub fn shard_for(resource_id: &str) -> String {
        let byte = resource_id
            .get(..2)
            .and_then(|h| u8::from_str_radix(h, 16).ok())
            .unwrap_or(0);
        format!("{:02}", u32::from(byte) % SHARD_COUNT)
    }

    pub fn content_path(&self, resource_id: &str) -> PathBuf {
        self.root
            .join(Self::shard_for(resource_id))
            .join(format!("{resource_id}.{CONTENT_EXTENSION}"))
    }

    fn temp_path(&self, resource_id: &str) -> PathBuf {
        let n = self.temp_counter.fetch_add(1, Ordering::Relaxed);
        self.root.join(Self::shard_for(resource_id)).join(format!(
            "{resource_id}.{}-{n}.{TEMP_EXTENSION}",
            std::process::id()
        ))
    }

    /// Writes a new entry through `writer` and commits it atomically.
    ///
    /// The temp file is removed if the writer or the rename fails.
    pub fn write<F>(&self, resource_id: &str, writer: F) -> Result<BinaryResource, CacheError>
    where
        F: FnOnce(&mut dyn Write) -> io::Result<()>,
    {
        let temp = self.temp_path(resource_id);
        if let Some(shard) = temp.parent() {
            fs::create_dir_all(shard).map_err(|e| CacheError::at(shard, e))?;
        }

        let result = write_temp(&temp, writer).and_then(|size| {
            let target = self.content_path(resource_id);
            fs::rename(&temp, &target).map_err(|e| CacheError::at(&target, e))?;
            Ok(BinaryResource { path: target, size })
        });

        if result.is_err() {
            if let Err(e) = fs::remove_file(&temp) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!(path = %temp.display(), error = %e, "Failed to remove temp file");
                }
            }
        }
        result
    }

    /// The committed entry for `resource_id`, if present.
    pub fn resource(&self, resource_id: &str) -> Option<BinaryResource> {
        let path = self.content_path(resource_id);
        let metadata = fs::metadata(&path).ok()?;
        metadata.is_file().then(|| BinaryResource {
            path,
            size: metadata.len(),
        })
    }

    /// Records an access by bumping the file's mtime.
    pub fn touch(&self, resource_id: &str, now: SystemTime) -> io::Result<()> {
        File::options()
            .write(true)
            .open(self.content_path(resource_id))?
            .set_modified(now)
    }

    /// Deletes an entry, returning the bytes freed.
    pub fn remove(&self, resource_id: &str) -> Result<u64, CacheError> {
        let path = self.content_path(resource_id);
        let size = match fs::metadata(&path) {
            Ok(m) => m.len(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(CacheError::at(&path, e)),
        };
        match fs::remove_file(&path) {
            Ok(()) => Ok(size),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(CacheError::at(&path, e)),
        }
    }

    /// Scans every shard. Temp files older than [`TEMP_FILE_LIFETIME`]
    /// belong to writes that never committed and are deleted; younger ones
    /// are left for their writer.
    pub fn scan(&self) -> Result<ScanResult, CacheError> {
        let now = SystemTime::now();
        let mut result = ScanResult::default();
        let shards = fs::read_dir(&self.root).map_err(|e| CacheError::at(&self.root, e))?;

        for shard in shards.flatten() {
            let shard_path = shard.path();
            if !shard_path.is_dir() {
                continue;
            }
            let files = match fs::read_dir(&shard_path) {
                Ok(files) => files,
                Err(e) => {
                    warn!(path = %shard_path.display(), error = %e, "Failed to read cache shard");
                    continue;
                }
            };

            for file in files.flatten() {
                let path = file.path();
                match path.extension().and_then(|e| e.to_str()) {
                    Some(CONTENT_EXTENSION) => {}
                    Some(TEMP_EXTENSION) => {
                        if is_expired_temp(&file, now) && fs::remove_file(&path).is_ok() {
                            result.temp_files_removed += 1;
                        }
                        continue;
                    }
                    _ => {
                        result.skipped += 1;
                        continue;
                    }
                }

                let (Some(resource_id), Ok(metadata)) = (
                    path.file_stem().and_then(|s| s.to_str()),
                    file.metadata(),
                ) else {
                    result.skipped += 1;
                    continue;
                };

                result.entries.push(StoredEntry {
                    resource_id: resource_id.to_string(),
                    size: metadata.len(),
                    modified: metadata.modified().unwrap_or_else(|_| SystemTime::now()),
                });
            }
        }

        debug!(
            root = %self.root.display(),
            entries = result.entries.len(),
            temp_files_removed = result.temp_files_removed,
            skipped = result.skipped,
            "Scanned disk cache"
        );
        Ok(result)
    }

    /// Removes every entry and recreates the empty root.
    pub fn clear_all(&self) -> Result<(), CacheError> {
        match fs::remove_dir_all(&self.root) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(CacheError::at(&self.root, e)),
        }
        fs::create_dir_all(&self.root).map_err(|e| CacheError::at(&self.root, e))
    }
}

fn is_expired_temp(file: &fs::DirEntry, now: SystemTime) -> bool {
    file.metadata()
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| now.duration_since(modified).ok())
        .is_some_and(|age| age > TEMP_FILE_LIFETIME)
}

fn write_temp<F>(temp: &Path, writer: F) -> Result<u64, CacheError>
where
    F: FnOnce(&mut dyn Write) -> io::Result<()>,
{
    let file = File::create(temp).map_err(|e| CacheError::at(temp, e))?;
    let mut out = BufWriter::new(file);
    writer(&mut out).map_err(|e| CacheError::at(temp, e))?;
    let file = out
        .into_inner()
        .map_err(|e| CacheError::at(temp, e.into_error()))?;
    file.sync_all().map_err(|e| CacheError::at(temp, e))?;
    let size = file.metadata().map_err(|e| CacheError::at(temp, e))?.len();
    Ok(size)
}

/// Deletes sibling directories that look like other layout versions.
fn remove_stale_versions(base: &Path, current: &str) {
    let Ok(siblings) = fs::read_dir(base) else {
        return;
    };
    for sibling in siblings.flatten() {
        let name = sibling.file_name();
        let Some(name) = name.to_str() else { continue };
        if name == current || !is_version_dir(name) || !sibling.path().is_dir() {
            continue;
        }
        match fs::remove_dir_all(sibling.path()) {
            Ok(()) => info!(version = name, "Removed stale cache version"),
            Err(e) => warn!(version = name, error = %e, "Failed to remove stale cache version"),
        }
    }
}

fn is_version_dir(name: &str) -> bool {
    name.strip_prefix('v')
        .is_some_and(|rest| !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit() || b == b'.'))
}
