//! Pipeline configuration and the INI config file.
//!
//! [`ImagePipelineConfig`] is the programmatic surface. [`ConfigFile`]
//! reads user overrides from `~/.imagepipe/config.ini`:
//!
//! ```
//! use imagepipe::config::{ConfigFile, ImagePipelineConfig};
//!
//! let file = ConfigFile::default();
//! let config = ImagePipelineConfig::from_config_file(&file);
//! assert_eq!(config.main_disk.max_size, file.disk.max_size);
//! ```

mod file;
mod parser;
mod pipeline;
mod size;
mod writer;

pub use file::{
    config_directory, config_file_path, days_to_duration, default_cache_directory,
    CacheSettings, ConfigFile, ConfigFileError, DiskSettings, LoggingSettings, MemorySettings,
    PipelineSettings, DEFAULT_LOG_FILE, DEFAULT_NETWORK_TIMEOUT_SECS,
};
pub use pipeline::ImagePipelineConfig;
pub use size::{format_size, parse_size, Size, SizeParseError};
