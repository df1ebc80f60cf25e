//! Terminal failure types delivered through the consumer protocol.

use thiserror::Error;

use crate::image::DecodeError;

/// Errors obtaining encoded bytes from a source.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("HTTP {status} fetching {uri}")]
    Http { status: u16, uri: String },

    #[error("network error fetching {uri}: {reason}")]
    Network { uri: String, reason: String },

    #[error("I/O error reading {path}: {reason}")]
    Io { path: String, reason: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("no fetcher for source {0}")]
    UnsupportedSource(String),

    #[error("invalid data URI: {0}")]
    InvalidDataUri(String),
}

/// The failure outcome of a request.
///
/// Cloneable so that a multiplexed failure reaches every attached consumer
/// unchanged.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PipelineError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("pipeline error: {0}")]
    Internal(String),
}
