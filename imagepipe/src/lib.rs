//! imagepipe - image loading pipeline with a three-tier cache
//!
//! Requests flow through a chain of producers: decoded memory cache,
//! request multiplexing, decode, encoded memory cache, disk cache and
//! finally the network or a local source. Identical concurrent requests
//! share one fetch, and every decoded buffer is reference counted so it is
//! released exactly when its last user lets go.
//!
//! # High-Level API
//!
//! [`pipeline::ImagePipeline`] is the entry point:
//!
//! ```ignore
//! use imagepipe::config::ImagePipelineConfig;
//! use imagepipe::pipeline::ImagePipeline;
//! use imagepipe::request::{CallerContext, ImageRequest};
//!
//! let pipeline = ImagePipeline::new(ImagePipelineConfig::default())?;
//! let request = ImageRequest::from_uri("https://example.com/cat.jpg")?;
//! let source = pipeline.fetch_decoded_image(request, CallerContext::default());
//! let image = source.result().await.into_result()?;
//! ```

pub mod config;
pub mod disk;
pub mod executor;
pub mod image;
pub mod key;
pub mod logging;
pub mod memory;
pub mod pipeline;
pub mod producer;
pub mod producers;
pub mod request;
pub mod resource;
pub mod stats;

pub use config::ImagePipelineConfig;
pub use pipeline::{
    DataEvent, DataSource, ImagePipeline, Outcome, OutcomeError, PipelineBuildError,
};
pub use request::{CallerContext, ImageRequest, ImageUri};

/// Version of the imagepipe library and CLI, shared across the workspace.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
