//! Transform and decode options carried by an image request.

use std::fmt;

/// Target size hint for downsampling.
///
/// The decoded image is never smaller than the target: the sample size is
/// chosen so that both dimensions stay at or above it, up to rounding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResizeOptions {
    pub width: u32,
    pub height: u32,
    /// Upper bound on either decoded dimension.
    pub max_bitmap_size: u32,
}

impl ResizeOptions {
    /// Default ceiling on a decoded dimension.
    pub const DEFAULT_MAX_BITMAP_SIZE: u32 = 2048;

    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            max_bitmap_size: Self::DEFAULT_MAX_BITMAP_SIZE,
        }
    }

    /// A square target for `size`.
    pub fn for_square_size(size: u32) -> Self {
        Self::new(size, size)
    }

    pub fn with_max_bitmap_size(mut self, max: u32) -> Self {
        self.max_bitmap_size = max;
        self
    }
}

impl fmt::Display for ResizeOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// A clockwise rotation in multiples of 90 degrees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Rotation {
    #[default]
    Deg0,
    Deg90,
    Deg180,
    Deg270,
}

impl Rotation {
    pub fn degrees(&self) -> u16 {
        match self {
            Self::Deg0 => 0,
            Self::Deg90 => 90,
            Self::Deg180 => 180,
            Self::Deg270 => 270,
        }
    }

    /// Maps an angle to the nearest supported rotation, or `None` when it
    /// is not a multiple of 90.
    pub fn from_degrees(degrees: u16) -> Option<Self> {
        match degrees % 360 {
            0 => Some(Self::Deg0),
            90 => Some(Self::Deg90),
            180 => Some(Self::Deg180),
            270 => Some(Self::Deg270),
            _ => None,
        }
    }

    /// Whether width and height swap after applying this rotation.
    pub fn swaps_dimensions(&self) -> bool {
        matches!(self, Self::Deg90 | Self::Deg270)
    }
}

/// How the pipeline picks the rotation applied to a decoded image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RotationOptions {
    /// Use the orientation recorded in the encoded image's metadata.
    #[default]
    AutoRotate,
    /// Never rotate.
    Disabled,
    /// Always apply the given rotation, ignoring metadata.
    Forced(Rotation),
}

impl RotationOptions {
    /// The rotation to apply for an image whose metadata says `metadata_angle`.
    pub fn resolve(&self, metadata_angle: u16) -> Rotation {
        match self {
            Self::AutoRotate => Rotation::from_degrees(metadata_angle).unwrap_or_default(),
            Self::Disabled => Rotation::Deg0,
            Self::Forced(rotation) => *rotation,
        }
    }
}

impl fmt::Display for RotationOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AutoRotate => f.write_str("auto"),
            Self::Disabled => f.write_str("none"),
            Self::Forced(rotation) => write!(f, "{}", rotation.degrees()),
        }
    }
}

/// Pixel layout requested from the decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PixelFormat {
    #[default]
    Rgba8888,
    Rgb565,
    Alpha8,
}

impl PixelFormat {
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            Self::Rgba8888 => 4,
            Self::Rgb565 => 2,
            Self::Alpha8 => 1,
        }
    }
}

/// Options forwarded to the decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ImageDecodeOptions {
    pub pixel_format: PixelFormat,
    /// For multi-frame formats, decode only the first frame.
    pub decode_preview_frame: bool,
    /// Treat animated formats as still images.
    pub force_static_image: bool,
}

impl fmt::Display for ImageDecodeOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?}/preview={}/static={}",
            self.pixel_format, self.decode_preview_frame, self.force_static_image
        )
    }
}

/// Request urgency. Ordered so that the maximum is the most urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

/// The deepest tier a request may reach.
///
/// Ordered from most to least permissive: a request with
/// `lowest_permitted_level = DiskCache` may be served from memory or disk but
/// never triggers a fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum RequestLevel {
    #[default]
    FullFetch,
    DiskCache,
    EncodedMemoryCache,
    BitmapMemoryCache,
}

/// Which disk cache instance stores the encoded bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CacheChoice {
    #[default]
    Default,
    Small,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_level_ordering() {
        assert!(RequestLevel::FullFetch < RequestLevel::DiskCache);
        assert!(RequestLevel::DiskCache < RequestLevel::EncodedMemoryCache);
        assert!(RequestLevel::EncodedMemoryCache < RequestLevel::BitmapMemoryCache);
    }

    #[test]
    fn test_priority_max_is_most_urgent() {
        let max = [Priority::Low, Priority::High, Priority::Medium]
            .into_iter()
            .max()
            .unwrap();
        assert_eq!(max, Priority::High);
    }

    #[test]
    fn test_rotation_resolution() {
        assert_eq!(RotationOptions::AutoRotate.resolve(90), Rotation::Deg90);
        assert_eq!(RotationOptions::AutoRotate.resolve(45), Rotation::Deg0);
        assert_eq!(RotationOptions::Disabled.resolve(270), Rotation::Deg0);
        assert_eq!(
            RotationOptions::Forced(Rotation::Deg180).resolve(90),
            Rotation::Deg180
        );
    }
}
