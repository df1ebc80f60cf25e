//! Image requests: what to load and how to transform it.
//!
//! An [`ImageRequest`] is immutable once built and is shared by every stage
//! of the pipeline through the producer context.

mod options;
mod uri;

pub use options::{
    CacheChoice, ImageDecodeOptions, PixelFormat, Priority, RequestLevel, ResizeOptions,
    Rotation, RotationOptions,
};
pub use uri::{ImageUri, SourceType};

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::image::Postprocessor;

/// Errors building a request.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RequestError {
    #[error("invalid image URI '{uri}': {reason}")]
    InvalidUri { uri: String, reason: String },

    #[error("unsupported URI scheme '{0}'")]
    UnsupportedScheme(String),
}

/// Opaque caller information carried alongside a request.
///
/// The salt partitions cache keys, so two callers with different salts
/// never share cached entries for the same URI.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallerContext {
    pub tag: Option<String>,
    pub cache_salt: Option<String>,
}

impl CallerContext {
    pub fn with_tag(tag: impl Into<String>) -> Self {
        Self {
            tag: Some(tag.into()),
            cache_salt: None,
        }
    }

    pub fn with_cache_salt(mut self, salt: impl Into<String>) -> Self {
        self.cache_salt = Some(salt.into());
        self
    }
}

/// A request for one image.
#[derive(Clone)]
pub struct ImageRequest {
    uri: ImageUri,
    cache_choice: CacheChoice,
    priority: Priority,
    lowest_permitted_level: RequestLevel,
    resize: Option<ResizeOptions>,
    rotation: RotationOptions,
    decode_options: ImageDecodeOptions,
    progressive: bool,
    local_thumbnail_preview: bool,
    disk_cache_enabled: bool,
    memory_cache_enabled: bool,
    postprocessor: Option<Arc<dyn Postprocessor>>,
}

impl ImageRequest {
    pub fn new(uri: ImageUri) -> Self {
        Self {
            uri,
            cache_choice: CacheChoice::Default,
            priority: Priority::Medium,
            lowest_permitted_level: RequestLevel::FullFetch,
            resize: None,
            rotation: RotationOptions::AutoRotate,
            decode_options: ImageDecodeOptions::default(),
            progressive: false,
            local_thumbnail_preview: false,
            disk_cache_enabled: true,
            memory_cache_enabled: true,
            postprocessor: None,
        }
    }

    /// Parses `uri` and builds a default request for it.
    pub fn from_uri(uri: &str) -> Result<Self, RequestError> {
        Ok(Self::new(ImageUri::parse(uri)?))
    }

    pub fn with_cache_choice(mut self, choice: CacheChoice) -> Self {
        self.cache_choice = choice;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_lowest_permitted_level(mut self, level: RequestLevel) -> Self {
        self.lowest_permitted_level = level;
        self
    }

    pub fn with_resize(mut self, resize: ResizeOptions) -> Self {
        self.resize = Some(resize);
        self
    }

    pub fn with_rotation(mut self, rotation: RotationOptions) -> Self {
        self.rotation = rotation;
        self
    }

    pub fn with_decode_options(mut self, options: ImageDecodeOptions) -> Self {
        self.decode_options = options;
        self
    }

    /// Ask for intermediate (partial-quality) results while bytes arrive.
    pub fn with_progressive(mut self, progressive: bool) -> Self {
        self.progressive = progressive;
        self
    }

    /// Try a local thumbnail before decoding the full local image.
    pub fn with_local_thumbnail_preview(mut self, enabled: bool) -> Self {
        self.local_thumbnail_preview = enabled;
        self
    }

    pub fn with_disk_cache_enabled(mut self, enabled: bool) -> Self {
        self.disk_cache_enabled = enabled;
        self
    }

    pub fn with_memory_cache_enabled(mut self, enabled: bool) -> Self {
        self.memory_cache_enabled = enabled;
        self
    }

    pub fn with_postprocessor(mut self, postprocessor: Arc<dyn Postprocessor>) -> Self {
        self.postprocessor = Some(postprocessor);
        self
    }

    pub fn uri(&self) -> &ImageUri {
        &self.uri
    }

    pub fn source_type(&self) -> SourceType {
        self.uri.source_type()
    }

    pub fn cache_choice(&self) -> CacheChoice {
        self.cache_choice
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn lowest_permitted_level(&self) -> RequestLevel {
        self.lowest_permitted_level
    }

    pub fn resize(&self) -> Option<&ResizeOptions> {
        self.resize.as_ref()
    }

    pub fn rotation(&self) -> RotationOptions {
        self.rotation
    }

    pub fn decode_options(&self) -> &ImageDecodeOptions {
        &self.decode_options
    }

    pub fn is_progressive(&self) -> bool {
        self.progressive
    }

    pub fn local_thumbnail_preview(&self) -> bool {
        self.local_thumbnail_preview
    }

    pub fn is_disk_cache_enabled(&self) -> bool {
        self.disk_cache_enabled
    }

    pub fn is_memory_cache_enabled(&self) -> bool {
        self.memory_cache_enabled
    }

    pub fn postprocessor(&self) -> Option<&Arc<dyn Postprocessor>> {
        self.postprocessor.as_ref()
    }
}

impl fmt::Debug for ImageRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageRequest")
            .field("uri", &self.uri.as_str())
            .field("cache_choice", &self.cache_choice)
            .field("priority", &self.priority)
            .field("lowest_permitted_level", &self.lowest_permitted_level)
            .field("resize", &self.resize)
            .field("rotation", &self.rotation)
            .field("progressive", &self.progressive)
            .field(
                "postprocessor",
                &self.postprocessor.as_ref().map(|p| p.name().to_string()),
            )
            .finish()
    }
}
