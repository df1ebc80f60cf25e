use super::allocator::PixelBufferAllocator;
use super::decoded::DecodedImage;
use super::decoder::DecodeError;

/// A pixel transform applied after decoding.
///
/// Postprocessors with a `cache_id` get their own decoded-cache entries;
/// without one the output is recomputed for every request.
pub trait Postprocessor: Send + Sync {
    fn name(&self) -> &str;

    fn cache_id(&self) -> Option<String> {
        None
    }

    /// Produces a new image from `source`, allocating through `allocator`.
    fn process(
        &self,
        source: &DecodedImage,
        allocator: &dyn PixelBufferAllocator,
    ) -> Result<DecodedImage, DecodeError>;
}
