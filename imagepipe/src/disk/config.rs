//! Disk cache configuration.

use std::path::PathBuf;
use std::time::Duration;

use super::error::CacheError;

const MB: u64 = 1024 * 1024;

/// Free space below which the cache shrinks to `very_low_space_max_size`.
pub const DEFAULT_VERY_LOW_SPACE_THRESHOLD: u64 = 100 * MB;

/// Configuration for one on-disk cache instance.
#[derive(Debug, Clone, PartialEq)]
pub struct DiskCacheConfig {
    /// Directory holding the versioned cache tree.
    pub base_directory: PathBuf,
    /// Layout version; entries under any other version directory are removed.
    pub version: String,
    /// Size limit while the device has plenty of free space.
    pub max_size: u64,
    /// Size limit when free space could not accommodate `max_size`.
    pub low_space_max_size: u64,
    /// Size limit when free space drops below `very_low_space_threshold`.
    pub very_low_space_max_size: u64,
    pub very_low_space_threshold: u64,
    /// Entries not accessed within this window are dropped by `prune`.
    pub max_age: Option<Duration>,
    /// Scan the directory tree on a background executor at startup instead
    /// of on first access.
    pub index_populate_at_startup: bool,
}

impl DiskCacheConfig {
    /// Default main cache under `base_directory`.
    pub fn main(base_directory: impl Into<PathBuf>) -> Self {
        Self {
            base_directory: base_directory.into(),
            version: "v1".to_string(),
            max_size: 40 * MB,
            low_space_max_size: 10 * MB,
            very_low_space_max_size: 2 * MB,
            very_low_space_threshold: DEFAULT_VERY_LOW_SPACE_THRESHOLD,
            max_age: None,
            index_populate_at_startup: false,
        }
    }

    /// Default small-image cache under `base_directory`.
    pub fn small(base_directory: impl Into<PathBuf>) -> Self {
        Self {
            max_size: 10 * MB,
            low_space_max_size: 2 * MB,
            very_low_space_max_size: 2 * MB,
            ..Self::main(base_directory)
        }
    }

    /// Platform cache directory for the named instance.
    pub fn default_directory(name: &str) -> PathBuf {
        dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("imagepipe")
            .join(name)
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_max_size(mut self, max_size: u64) -> Self {
        self.max_size = max_size;
        self
    }

    pub fn with_low_space_max_size(mut self, size: u64) -> Self {
        self.low_space_max_size = size;
        self
    }

    pub fn with_very_low_space_max_size(mut self, size: u64) -> Self {
        self.very_low_space_max_size = size;
        self
    }

    pub fn with_very_low_space_threshold(mut self, threshold: u64) -> Self {
        self.very_low_space_threshold = threshold;
        self
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }

    pub fn with_index_populate_at_startup(mut self, eager: bool) -> Self {
        self.index_populate_at_startup = eager;
        self
    }

    /// Limits must not grow as free space shrinks.
    pub fn validate(&self) -> Result<(), CacheError> {
        if self.version.is_empty() || self.version.contains(['/', '\\']) {
            return Err(CacheError::InvalidConfig(format!(
                "version must be a single path component, got '{}'",
                self.version
            )));
        }
        if self.low_space_max_size > self.max_size
            || self.very_low_space_max_size > self.low_space_max_size
        {
            return Err(CacheError::InvalidConfig(format!(
                "size limits must satisfy very_low ({}) <= low ({}) <= max ({})",
                self.very_low_space_max_size, self.low_space_max_size, self.max_size
            )));
        }
        Ok(())
    }
}

impl Default for DiskCacheConfig {
    fn default() -> Self {
        Self::main(Self::default_directory("main"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(DiskCacheConfig::main("/tmp/a").validate().is_ok());
        assert!(DiskCacheConfig::small("/tmp/a").validate().is_ok());
    }

    #[test]
    fn test_small_is_smaller() {
        let main = DiskCacheConfig::main("/tmp/a");
        let small = DiskCacheConfig::small("/tmp/a");
        assert!(small.max_size < main.max_size);
        assert_eq!(small.version, main.version);
    }

    #[test]
    fn test_inverted_limits_rejected() {
        let config = DiskCacheConfig::main("/tmp/a").with_low_space_max_size(100 * MB);
        assert!(matches!(config.validate(), Err(CacheError::InvalidConfig(_))));
    }

    #[test]
    fn test_version_must_be_component() {
        let config = DiskCacheConfig::main("/tmp/a").with_version("v1/../x");
        assert!(config.validate().is_err());
    }
}
