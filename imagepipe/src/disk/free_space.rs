//! Device free-space probing.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

/// Reports the bytes available to the cache on the device holding `path`.
pub trait FreeSpaceProvider: Send + Sync {
    /// `None` when the platform cannot tell; the cache then assumes plenty.
    fn available_bytes(&self, path: &Path) -> Option<u64>;
}

/// Queries the filesystem with `statvfs`.
#[derive(Debug, Default, Clone, Copy)]
pub struct StatvfsFreeSpace;

impl FreeSpaceProvider for StatvfsFreeSpace {
    fn available_bytes(&self, path: &Path) -> Option<u64> {
        statvfs_available(path)
            .map_err(|e| tracing::debug!(path = %path.display(), error = %e, "statvfs failed"))
            .ok()
    }
}

#[cfg(unix)]
#[allow(clippy::unnecessary_cast)] // field widths vary by platform
fn statvfs_available(path: &Path) -> std::io::Result<u64> {
    use std::ffi::CString;
    use std::mem::MaybeUninit;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    let mut stat = MaybeUninit::<libc::statvfs>::uninit();

    // SAFETY: c_path is NUL-terminated and stat points to writable memory
    let result = unsafe { libc::statvfs(c_path.as_ptr(), stat.as_mut_ptr()) };

    if result == 0 {
        // SAFETY: statvfs succeeded, stat is initialized
        let stat = unsafe { stat.assume_init() };
        Ok(stat.f_bavail as u64 * stat.f_frsize as u64)
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
fn statvfs_available(_path: &Path) -> std::io::Result<u64> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "statvfs not available on this platform",
    ))
}

/// Reports a settable amount of free space.
#[derive(Debug)]
pub struct FixedFreeSpace(AtomicU64);

impl FixedFreeSpace {
    pub fn new(bytes: u64) -> Self {
        Self(AtomicU64::new(bytes))
    }

    pub fn set(&self, bytes: u64) {
        self.0.store(bytes, Ordering::Relaxed);
    }
}

impl FreeSpaceProvider for FixedFreeSpace {
    fn available_bytes(&self, _path: &Path) -> Option<u64> {
        Some(self.0.load(Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_is_settable() {
        let provider = FixedFreeSpace::new(10);
        provider.set(20);
        assert_eq!(provider.available_bytes(Path::new("/")), Some(20));
    }

    #[cfg(unix)]
    #[test]
    fn test_statvfs_reports_for_temp_dir() {
        let dir = tempfile::TempDir::new().unwrap();
        assert!(StatvfsFreeSpace.available_bytes(dir.path()).is_some());
    }
}
