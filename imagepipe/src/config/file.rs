//! The user configuration file at `~/.imagepipe/config.ini`.
//!
//! Missing keys keep their defaults, so an empty file is a valid
//! configuration. Parsing lives in [`super::parser`] and serialization in
//! [`super::writer`].

use std::path::{Path, PathBuf};

use ini::Ini;
use thiserror::Error;

use crate::disk::DiskCacheConfig;
use crate::executor::ExecutorConfig;
use crate::memory::MemoryCacheParams;
use crate::pipeline::DEFAULT_MAX_SIMULTANEOUS_THUMBNAIL_REQUESTS;

/// Default HTTP timeout in seconds.
pub const DEFAULT_NETWORK_TIMEOUT_SECS: u64 = 30;

/// Default log file name.
pub const DEFAULT_LOG_FILE: &str = "imagepipe.log";

#[derive(Debug, Error)]
pub enum ConfigFileError {
    #[error("failed to read config file: {0}")]
    ReadError(#[from] ini::Error),

    #[error("failed to write config file: {0}")]
    WriteError(String),

    #[error("invalid configuration: {section}.{key} = '{value}' - {reason}")]
    InvalidValue {
        section: String,
        key: String,
        value: String,
        reason: String,
    },

    #[error("failed to create config directory: {0}")]
    DirectoryError(std::io::Error),
}

/// `[cache]`: where cache trees live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheSettings {
    pub directory: PathBuf,
    pub version: String,
}

/// `[memory]`: limits of the two memory caches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemorySettings {
    pub decoded_size: u64,
    pub decoded_entries: usize,
    pub encoded_size: u64,
    pub encoded_entries: usize,
    pub encoded_max_entry_size: u64,
}

/// `[disk]`: limits of the main and small disk caches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskSettings {
    pub max_size: u64,
    pub low_space_max_size: u64,
    pub very_low_space_max_size: u64,
    pub small_max_size: u64,
    pub max_age_days: Option<u64>,
    pub populate_at_startup: bool,
}

/// `[pipeline]`: pool sizes and chain options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineSettings {
    pub network_threads: usize,
    pub decode_threads: usize,
    pub storage_read_threads: usize,
    pub storage_write_threads: usize,
    pub network_timeout_secs: u64,
    pub max_thumbnail_requests: usize,
    pub resizing_enabled: bool,
    pub keep_cancelled_fetch_as_low_priority: bool,
}

/// `[logging]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingSettings {
    pub directory: PathBuf,
    pub file: String,
}

/// Parsed contents of `config.ini`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigFile {
    pub cache: CacheSettings,
    pub memory: MemorySettings,
    pub disk: DiskSettings,
    pub pipeline: PipelineSettings,
    pub logging: LoggingSettings,
}

impl Default for ConfigFile {
    fn default() -> Self {
        let decoded = MemoryCacheParams::decoded_default();
        let encoded = MemoryCacheParams::encoded_default();
        let main = DiskCacheConfig::main(PathBuf::new());
        let small = DiskCacheConfig::small(PathBuf::new());
        let executors = ExecutorConfig::default();

        Self {
            cache: CacheSettings {
                directory: default_cache_directory(),
                version: main.version,
            },
            memory: MemorySettings {
                decoded_size: decoded.max_cache_size as u64,
                decoded_entries: decoded.max_cache_entries,
                encoded_size: encoded.max_cache_size as u64,
                encoded_entries: encoded.max_cache_entries,
                encoded_max_entry_size: encoded.max_cache_entry_size as u64,
            },
            disk: DiskSettings {
                max_size: main.max_size,
                low_space_max_size: main.low_space_max_size,
                very_low_space_max_size: main.very_low_space_max_size,
                small_max_size: small.max_size,
                max_age_days: None,
                populate_at_startup: main.index_populate_at_startup,
            },
            pipeline: PipelineSettings {
                network_threads: executors.network_threads,
                decode_threads: executors.decode_threads,
                storage_read_threads: executors.storage_read_threads,
                storage_write_threads: executors.storage_write_threads,
                network_timeout_secs: DEFAULT_NETWORK_TIMEOUT_SECS,
                max_thumbnail_requests: DEFAULT_MAX_SIMULTANEOUS_THUMBNAIL_REQUESTS,
                resizing_enabled: true,
                keep_cancelled_fetch_as_low_priority: false,
            },
            logging: LoggingSettings {
                directory: config_directory().join("logs"),
                file: DEFAULT_LOG_FILE.to_string(),
            },
        }
    }
}

impl ConfigFile {
    /// Loads `~/.imagepipe/config.ini`, or defaults if it does not exist.
    pub fn load() -> Result<Self, ConfigFileError> {
        Self::load_from(&config_file_path())
    }

    /// Loads `path`, or defaults if it does not exist.
    pub fn load_from(path: &Path) -> Result<Self, ConfigFileError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let ini = Ini::load_from_file(path)?;
        super::parser::parse_ini(&ini)
    }

    pub fn save(&self) -> Result<(), ConfigFileError> {
        self.save_to(&config_file_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigFileError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(ConfigFileError::DirectoryError)?;
        }
        std::fs::write(path, self.to_ini_string())
            .map_err(|e| ConfigFileError::WriteError(e.to_string()))
    }

    /// The settings as a commented INI document.
    pub fn to_ini_string(&self) -> String {
        super::writer::to_config_string(self)
    }

    /// Writes the defaults unless a config file already exists.
    pub fn ensure_exists() -> Result<PathBuf, ConfigFileError> {
        let path = config_file_path();
        if !path.exists() {
            Self::default().save_to(&path)?;
        }
        Ok(path)
    }

    /// The main disk cache described by these settings.
    pub fn main_disk_cache(&self) -> DiskCacheConfig {
        let mut config = DiskCacheConfig::main(self.cache.directory.join("main"))
            .with_version(self.cache.version.clone())
            .with_max_size(self.disk.max_size)
            .with_low_space_max_size(self.disk.low_space_max_size)
            .with_very_low_space_max_size(self.disk.very_low_space_max_size)
            .with_index_populate_at_startup(self.disk.populate_at_startup);
        if let Some(days) = self.disk.max_age_days {
            config = config.with_max_age(days_to_duration(days));
        }
        config
    }

    /// The small-image disk cache described by these settings.
    pub fn small_disk_cache(&self) -> DiskCacheConfig {
        let small = DiskCacheConfig::small(self.cache.directory.join("small"))
            .with_version(self.cache.version.clone())
            .with_max_size(self.disk.small_max_size)
            .with_index_populate_at_startup(self.disk.populate_at_startup);
        let low = small.low_space_max_size.min(self.disk.small_max_size);
        let mut config = small
            .with_low_space_max_size(low)
            .with_very_low_space_max_size(low.min(self.disk.very_low_space_max_size));
        if let Some(days) = self.disk.max_age_days {
            config = config.with_max_age(days_to_duration(days));
        }
        config
    }
}

/// Whole days as a `Duration`, saturating on overflow.
pub fn days_to_duration(days: u64) -> std::time::Duration {
    std::time::Duration::from_secs(days.saturating_mul(24 * 60 * 60))
}

/// `~/.imagepipe`
pub fn config_directory() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".imagepipe")
}

/// `~/.imagepipe/config.ini`
pub fn config_file_path() -> PathBuf {
    config_directory().join("config.ini")
}

/// Platform cache directory for imagepipe's disk caches.
pub fn default_cache_directory() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("imagepipe")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_follow_component_defaults() {
        let config = ConfigFile::default();
        assert_eq!(config.memory.decoded_size, 128 * 1024 * 1024);
        assert_eq!(config.disk.max_size, 40 * 1024 * 1024);
        assert_eq!(config.disk.small_max_size, 10 * 1024 * 1024);
        assert_eq!(config.pipeline.max_thumbnail_requests, 5);
        assert_eq!(config.logging.file, "imagepipe.log");
    }

    #[test]
    fn test_cancelled_fetches_are_not_kept_by_default() {
        let config = ConfigFile::default();
        assert!(!config.pipeline.keep_cancelled_fetch_as_low_priority);
        assert!(!crate::pipeline::SequenceOptions::default().keep_cancelled_fetch_as_low_priority);
    }

    #[test]
    fn test_load_nonexistent_returns_defaults() {
        let dir = TempDir::new().unwrap();
        let config = ConfigFile::load_from(&dir.path().join("missing.ini")).unwrap();
        assert_eq!(config, ConfigFile::default());
    }

    #[test]
    fn test_saved_file_loads_back() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.ini");

        let mut config = ConfigFile::default();
        config.cache.directory = dir.path().join("caches");
        config.disk.max_size = 64 * 1024 * 1024;
        config.disk.max_age_days = Some(7);
        config.pipeline.resizing_enabled = false;
        config.save_to(&path).unwrap();

        assert_eq!(ConfigFile::load_from(&path).unwrap(), config);
    }

    #[test]
    fn test_disk_cache_configs_are_valid() {
        let mut config = ConfigFile::default();
        config.disk.small_max_size = 1024 * 1024;
        config.disk.max_age_days = Some(2);

        let main = config.main_disk_cache();
        let small = config.small_disk_cache();
        assert!(main.validate().is_ok());
        assert!(small.validate().is_ok());
        assert_eq!(small.max_size, 1024 * 1024);
        assert_eq!(main.max_age, Some(std::time::Duration::from_secs(2 * 86_400)));
        assert!(main.base_directory.ends_with("main"));
        assert!(small.base_directory.ends_with("small"));
    }
}
