//! Decoder capability.

use thiserror::Error;

use super::decoded::{DecodedImage, QualityInfo};
use super::encoded::{EncodedImage, ImageFormat, ImageMetadata};
use crate::request::ImageDecodeOptions;
use crate::resource::ResourceHandle;

/// Errors turning encoded bytes into pixels.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("malformed image data: {0}")]
    Malformed(String),

    #[error("unsupported image format {0:?}")]
    Unsupported(ImageFormat),

    #[error("pixel buffer allocation failed: {0}")]
    Allocation(String),

    #[error("postprocessor '{name}' failed: {reason}")]
    Postprocess { name: String, reason: String },

    #[error("encoded image is no longer valid")]
    InvalidInput,
}

/// Turns encoded images into decoded ones.
///
/// Implementations are called from the decode executor and may block.
pub trait ImageDecoder: Send + Sync {
    /// Decodes `encoded`.
    ///
    /// `quality.full_quality == false` requests a partial decode of a
    /// progressive image whose bytes are still arriving. The encoded image's
    /// `sample_size` and `rotation_angle` describe the transform to apply.
    fn decode(
        &self,
        encoded: &EncodedImage,
        quality: QualityInfo,
        options: &ImageDecodeOptions,
    ) -> Result<ResourceHandle<DecodedImage>, DecodeError>;

    /// Reads format, dimensions and orientation from the header.
    fn probe(&self, _data: &[u8]) -> Option<ImageMetadata> {
        None
    }

    /// Whether a partial decode of `encoded` is meaningful.
    fn supports_partial(&self, _encoded: &EncodedImage) -> bool {
        false
    }
}
