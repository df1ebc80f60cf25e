//! Image values flowing through the pipeline and the capabilities that
//! produce them.
//!
//! - [`EncodedImage`]: compressed bytes plus metadata, cached in the encoded
//!   memory cache and on disk
//! - [`DecodedImage`]: a pixel buffer from the [`PixelBufferAllocator`],
//!   cached in the decoded memory cache
//! - [`ImageDecoder`]: turns the former into the latter

mod allocator;
mod decoded;
mod decoder;
mod encoded;
pub(crate) mod exif;
mod image_crate;
mod postprocess;

pub use allocator::{HeapPixelAllocator, HeapPixelBuffer, PixelBuffer, PixelBufferAllocator};
pub use decoded::{DecodedImage, QualityInfo};
pub use decoder::{DecodeError, ImageDecoder};
pub use encoded::{EncodedBytes, EncodedImage, ImageFormat, ImageMetadata};
pub use exif::{find_exif_thumbnail, ExifThumbnail};
pub use image_crate::ImageCrateDecoder;
pub use postprocess::Postprocessor;

use crate::resource::ResourceHandle;

/// A decoded image as handed to consumers and stored in the decoded cache.
pub type ImageRef = ResourceHandle<DecodedImage>;
