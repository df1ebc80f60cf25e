//! Encoded image bytes and their metadata.

use std::fmt;
use std::ops::Deref;

use bytes::Bytes;

use crate::key::CacheKey;
use crate::resource::{HandleError, ResourceHandle};

/// Container format detected from the encoded header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ImageFormat {
    Jpeg,
    Png,
    Gif,
    Webp,
    Bmp,
    Ico,
    Tiff,
    #[default]
    Unknown,
}

impl ImageFormat {
    /// Sniffs the format from magic bytes.
    pub fn detect(data: &[u8]) -> Self {
        match data {
            [0xFF, 0xD8, 0xFF, ..] => Self::Jpeg,
            [0x89, b'P', b'N', b'G', ..] => Self::Png,
            [b'G', b'I', b'F', b'8', ..] => Self::Gif,
            [b'R', b'I', b'F', b'F', _, _, _, _, b'W', b'E', b'B', b'P', ..] => Self::Webp,
            [b'B', b'M', ..] => Self::Bmp,
            [0x00, 0x00, 0x01, 0x00, ..] => Self::Ico,
            [b'I', b'I', 0x2A, 0x00, ..] | [b'M', b'M', 0x00, 0x2A, ..] => Self::Tiff,
            _ => Self::Unknown,
        }
    }

    pub fn is_jpeg(&self) -> bool {
        matches!(self, Self::Jpeg)
    }
}

/// Metadata probed from an encoded header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ImageMetadata {
    pub format: ImageFormat,
    pub width: u32,
    pub height: u32,
    /// Clockwise rotation recorded in the image (EXIF orientation).
    pub rotation_angle: u16,
}

/// Immutable encoded bytes; the encoded memory cache value type.
#[derive(Clone, PartialEq, Eq)]
pub struct EncodedBytes(Bytes);

impl EncodedBytes {
    pub fn new(bytes: Bytes) -> Self {
        Self(bytes)
    }

    pub fn bytes(&self) -> &Bytes {
        &self.0
    }

    pub fn size_in_bytes(&self) -> usize {
        self.0.len()
    }
}

impl Deref for EncodedBytes {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for EncodedBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EncodedBytes({} bytes)", self.0.len())
    }
}

/// Encoded bytes plus everything the pipeline learned about them.
///
/// Owns one handle to the bytes; [`try_clone`](Self::try_clone) produces an
/// independently owned copy sharing the same bytes.
#[derive(Debug)]
pub struct EncodedImage {
    bytes: ResourceHandle<EncodedBytes>,
    format: ImageFormat,
    width: Option<u32>,
    height: Option<u32>,
    rotation_angle: u16,
    sample_size: u32,
    encoded_cache_key: Option<CacheKey>,
}

impl EncodedImage {
    pub fn new(bytes: ResourceHandle<EncodedBytes>) -> Self {
        let format = bytes
            .get()
            .map(|b| ImageFormat::detect(b))
            .unwrap_or_default();
        Self {
            bytes,
            format,
            width: None,
            height: None,
            rotation_angle: 0,
            sample_size: 1,
            encoded_cache_key: None,
        }
    }

    /// Wraps freshly fetched bytes that need no pooled release.
    pub fn from_bytes(bytes: Bytes) -> Self {
        Self::new(ResourceHandle::unmanaged(EncodedBytes::new(bytes)))
    }

    pub fn try_clone(&self) -> Result<Self, HandleError> {
        Ok(Self {
            bytes: self.bytes.try_clone()?,
            format: self.format,
            width: self.width,
            height: self.height,
            rotation_angle: self.rotation_angle,
            sample_size: self.sample_size,
            encoded_cache_key: self.encoded_cache_key.clone(),
        })
    }

    pub fn clone_or_none(&self) -> Option<Self> {
        self.try_clone().ok()
    }

    pub fn is_valid(&self) -> bool {
        self.bytes.is_valid()
    }

    pub fn close(&mut self) {
        if self.bytes.is_valid() {
            let _ = self.bytes.close();
        }
    }

    /// The encoded data, or `None` once closed.
    pub fn data(&self) -> Option<&Bytes> {
        self.bytes.get().ok().map(EncodedBytes::bytes)
    }

    pub fn size(&self) -> usize {
        self.data().map_or(0, Bytes::len)
    }

    /// A new handle to the underlying bytes.
    pub fn byte_handle(&self) -> Option<ResourceHandle<EncodedBytes>> {
        self.bytes.clone_or_none()
    }

    /// Whether both images share the same underlying bytes.
    pub fn same_bytes(&self, other: &EncodedImage) -> bool {
        self.bytes.ptr_eq(&other.bytes)
    }

    pub fn format(&self) -> ImageFormat {
        self.format
    }

    pub fn width(&self) -> Option<u32> {
        self.width
    }

    pub fn height(&self) -> Option<u32> {
        self.height
    }

    pub fn rotation_angle(&self) -> u16 {
        self.rotation_angle
    }

    pub fn sample_size(&self) -> u32 {
        self.sample_size
    }

    pub fn set_sample_size(&mut self, sample_size: u32) {
        self.sample_size = sample_size.max(1);
    }

    pub fn set_rotation_angle(&mut self, angle: u16) {
        self.rotation_angle = angle;
    }

    pub fn encoded_cache_key(&self) -> Option<&CacheKey> {
        self.encoded_cache_key.as_ref()
    }

    pub fn set_encoded_cache_key(&mut self, key: CacheKey) {
        self.encoded_cache_key = Some(key);
    }

    /// Whether dimensions have been probed.
    pub fn is_metadata_available(&self) -> bool {
        self.width.is_some() && self.height.is_some()
    }

    pub fn apply_metadata(&mut self, metadata: &ImageMetadata) {
        if metadata.format != ImageFormat::Unknown {
            self.format = metadata.format;
        }
        self.width = Some(metadata.width);
        self.height = Some(metadata.height);
        self.rotation_angle = metadata.rotation_angle;
    }

    /// Copies metadata (not bytes) from `other`.
    pub fn copy_metadata_from(&mut self, other: &EncodedImage) {
        self.format = other.format;
        self.width = other.width;
        self.height = other.height;
        self.rotation_angle = other.rotation_angle;
        self.sample_size = other.sample_size;
        self.encoded_cache_key = other.encoded_cache_key.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PNG_HEADER: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];

    #[test]
    fn test_format_detection() {
        assert_eq!(ImageFormat::detect(&[0xFF, 0xD8, 0xFF, 0xE0]), ImageFormat::Jpeg);
        assert_eq!(ImageFormat::detect(PNG_HEADER), ImageFormat::Png);
        assert_eq!(ImageFormat::detect(b"GIF89a"), ImageFormat::Gif);
        assert_eq!(ImageFormat::detect(b"RIFF\0\0\0\0WEBPVP8 "), ImageFormat::Webp);
        assert_eq!(ImageFormat::detect(b"hello"), ImageFormat::Unknown);
    }

    #[test]
    fn test_clone_shares_bytes_and_metadata() {
        let mut image = EncodedImage::from_bytes(Bytes::from_static(PNG_HEADER));
        image.apply_metadata(&ImageMetadata {
            format: ImageFormat::Png,
            width: 10,
            height: 20,
            rotation_angle: 90,
        });

        let clone = image.try_clone().unwrap();
        assert!(clone.same_bytes(&image));
        assert_eq!(clone.width(), Some(10));
        assert_eq!(clone.rotation_angle(), 90);
        assert_eq!(clone.format(), ImageFormat::Png);
    }

    #[test]
    fn test_closed_image_has_no_data() {
        let mut image = EncodedImage::from_bytes(Bytes::from_static(b"abc"));
        assert_eq!(image.size(), 3);
        image.close();
        assert!(!image.is_valid());
        assert!(image.data().is_none());
        assert!(image.clone_or_none().is_none());
    }
}
