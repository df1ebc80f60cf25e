use std::path::PathBuf;

use thiserror::Error;

/// Disk cache errors.
///
/// These never reach a consumer: the buffered cache logs them and turns them
/// into misses or no-ops.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Cache I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cache I/O error at {path}: {source}")]
    IoAt {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Cache write for {resource_id} was abandoned: {reason}")]
    WriteAbandoned { resource_id: String, reason: String },

    #[error("Invalid cache configuration: {0}")]
    InvalidConfig(String),
}

impl CacheError {
    pub(crate) fn at(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::IoAt {
            path: path.into(),
            source,
        }
    }
}
