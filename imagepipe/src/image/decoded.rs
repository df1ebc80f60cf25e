//! Decoded images.

use std::sync::Arc;

use super::allocator::{PixelBuffer, PixelBufferAllocator};
use crate::resource::ResourceHandle;

/// How complete a decoded image is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QualityInfo {
    /// Monotonic quality number; progressive scans increase it.
    pub quality: u32,
    /// Good enough to display in place of the final image.
    pub good_enough: bool,
    pub full_quality: bool,
}

impl QualityInfo {
    pub const FULL: QualityInfo = QualityInfo {
        quality: u32::MAX,
        good_enough: true,
        full_quality: true,
    };

    /// Quality of the `scan`th partial decode.
    pub fn partial(scan: u32, good_enough: bool) -> Self {
        Self {
            quality: scan,
            good_enough,
            full_quality: false,
        }
    }
}

/// Decoded pixels plus geometry.
#[derive(Debug)]
pub struct DecodedImage {
    width: u32,
    height: u32,
    quality: QualityInfo,
    rotation_angle: u16,
    buffer: Box<dyn PixelBuffer>,
}

impl DecodedImage {
    pub fn new(
        width: u32,
        height: u32,
        quality: QualityInfo,
        rotation_angle: u16,
        buffer: Box<dyn PixelBuffer>,
    ) -> Self {
        Self {
            width,
            height,
            quality,
            rotation_angle,
            buffer,
        }
    }

    /// Wraps this image in a handle that returns its buffer to `allocator`.
    pub fn into_handle(self, allocator: Arc<dyn PixelBufferAllocator>) -> ResourceHandle<Self> {
        ResourceHandle::new(self, move |image: &DecodedImage| {
            allocator.release(image.buffer())
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn quality(&self) -> QualityInfo {
        self.quality
    }

    pub fn is_full_quality(&self) -> bool {
        self.quality.full_quality
    }

    pub fn rotation_angle(&self) -> u16 {
        self.rotation_angle
    }

    pub fn buffer(&self) -> &dyn PixelBuffer {
        self.buffer.as_ref()
    }

    pub fn size_in_bytes(&self) -> usize {
        self.buffer.byte_size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::HeapPixelAllocator;
    use crate::request::PixelFormat;

    #[test]
    fn test_closing_handle_returns_buffer() {
        let allocator = Arc::new(HeapPixelAllocator::new());
        let buffer = allocator.allocate(10, 10, PixelFormat::Rgba8888).unwrap();
        let image = DecodedImage::new(10, 10, QualityInfo::FULL, 0, buffer);
        assert_eq!(image.size_in_bytes(), 400);

        let mut handle = image.into_handle(allocator.clone());
        let clone = handle.try_clone().unwrap();
        handle.close().unwrap();
        assert_eq!(allocator.live_buffers(), 1);
        drop(clone);
        assert_eq!(allocator.live_buffers(), 0);
    }
}
