//! [`ImageDecoder`] backed by the `image` crate.

use std::io::Cursor;
use std::sync::Arc;

use image::metadata::Orientation;
use image::{DynamicImage, ImageDecoder as _, ImageReader};
use tracing::debug;

use super::allocator::PixelBufferAllocator;
use super::decoded::{DecodedImage, QualityInfo};
use super::decoder::{DecodeError, ImageDecoder};
use super::encoded::{EncodedImage, ImageFormat, ImageMetadata};
use crate::request::{ImageDecodeOptions, PixelFormat, Rotation};
use crate::resource::ResourceHandle;

/// Decodes every still format the `image` crate understands.
///
/// Partial decodes are not supported; progressive requests receive only the
/// final result.
pub struct ImageCrateDecoder {
    allocator: Arc<dyn PixelBufferAllocator>,
}

impl ImageCrateDecoder {
    pub fn new(allocator: Arc<dyn PixelBufferAllocator>) -> Self {
        Self { allocator }
    }
}

fn map_format(format: image::ImageFormat) -> ImageFormat {
    match format {
        image::ImageFormat::Jpeg => ImageFormat::Jpeg,
        image::ImageFormat::Png => ImageFormat::Png,
        image::ImageFormat::Gif => ImageFormat::Gif,
        image::ImageFormat::WebP => ImageFormat::Webp,
        image::ImageFormat::Bmp => ImageFormat::Bmp,
        image::ImageFormat::Ico => ImageFormat::Ico,
        image::ImageFormat::Tiff => ImageFormat::Tiff,
        _ => ImageFormat::Unknown,
    }
}

fn orientation_angle(orientation: Orientation) -> u16 {
    match orientation {
        Orientation::Rotate90 | Orientation::Rotate90FlipH => 90,
        Orientation::Rotate180 => 180,
        Orientation::Rotate270 | Orientation::Rotate270FlipH => 270,
        _ => 0,
    }
}

/// Converts RGBA pixels into `format`, writing into `out`.
fn write_pixels(rgba: &[u8], format: PixelFormat, out: &mut [u8]) {
    match format {
        PixelFormat::Rgba8888 => {
            let len = out.len().min(rgba.len());
            out[..len].copy_from_slice(&rgba[..len]);
        }
        PixelFormat::Alpha8 => {
            for (dst, px) in out.iter_mut().zip(rgba.chunks_exact(4)) {
                *dst = px[3];
            }
        }
        PixelFormat::Rgb565 => {
            for (dst, px) in out.chunks_exact_mut(2).zip(rgba.chunks_exact(4)) {
                let packed = ((px[0] as u16 >> 3) << 11) | ((px[1] as u16 >> 2) << 5) | (px[2] as u16 >> 3);
                dst.copy_from_slice(&packed.to_le_bytes());
            }
        }
    }
}

impl ImageDecoder for ImageCrateDecoder {
    fn decode(
        &self,
        encoded: &EncodedImage,
        quality: QualityInfo,
        options: &ImageDecodeOptions,
    ) -> Result<ResourceHandle<DecodedImage>, DecodeError> {
        let data = encoded.data().ok_or(DecodeError::InvalidInput)?;

        let mut image: DynamicImage = image::load_from_memory(data).map_err(|e| match e {
            image::ImageError::Unsupported(_) => DecodeError::Unsupported(encoded.format()),
            other => DecodeError::Malformed(other.to_string()),
        })?;

        let sample_size = encoded.sample_size();
        if sample_size > 1 {
            let width = (image.width() / sample_size).max(1);
            let height = (image.height() / sample_size).max(1);
            image = image.thumbnail_exact(width, height);
        }

        image = match Rotation::from_degrees(encoded.rotation_angle()).unwrap_or_default() {
            Rotation::Deg0 => image,
            Rotation::Deg90 => image.rotate90(),
            Rotation::Deg180 => image.rotate180(),
            Rotation::Deg270 => image.rotate270(),
        };

        let (width, height) = (image.width(), image.height());
        let mut buffer = self.allocator.allocate(width, height, options.pixel_format)?;
        if let Some(out) = buffer.as_bytes_mut() {
            write_pixels(image.to_rgba8().as_raw(), options.pixel_format, out);
        }

        debug!(
            width,
            height,
            sample_size,
            format = ?encoded.format(),
            "decoded image"
        );

        Ok(DecodedImage::new(width, height, quality, encoded.rotation_angle(), buffer)
            .into_handle(Arc::clone(&self.allocator)))
    }

    fn probe(&self, data: &[u8]) -> Option<ImageMetadata> {
        let reader = ImageReader::new(Cursor::new(data)).with_guessed_format().ok()?;
        let format = reader.format().map(map_format).unwrap_or_default();
        let mut decoder = reader.into_decoder().ok()?;
        let (width, height) = decoder.dimensions();
        let rotation_angle = decoder.orientation().map(orientation_angle).unwrap_or(0);
        Some(ImageMetadata {
            format,
            width,
            height,
            rotation_angle,
        })
    }
}
