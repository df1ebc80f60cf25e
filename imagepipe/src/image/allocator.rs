//! Pixel buffer allocation.
//!
//! The pipeline never touches pixels itself; decoders ask an allocator for
//! storage and the decoded image's release hands it back.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::trace;

use super::decoder::DecodeError;
use crate::request::PixelFormat;

/// Opaque storage for decoded pixels.
pub trait PixelBuffer: Send + Sync + fmt::Debug {
    fn byte_size(&self) -> usize;

    fn as_any(&self) -> &dyn Any;

    /// Raw pixel bytes, when the buffer lives in addressable memory.
    fn as_bytes(&self) -> Option<&[u8]> {
        None
    }

    /// Writable pixel bytes, for decoders filling the buffer.
    fn as_bytes_mut(&mut self) -> Option<&mut [u8]> {
        None
    }
}

/// Source of pixel buffers.
pub trait PixelBufferAllocator: Send + Sync {
    fn allocate(
        &self,
        width: u32,
        height: u32,
        format: PixelFormat,
    ) -> Result<Box<dyn PixelBuffer>, DecodeError>;

    /// Called exactly once per buffer, when its decoded image is released.
    fn release(&self, buffer: &dyn PixelBuffer);
}

/// A heap-backed pixel buffer.
pub struct HeapPixelBuffer {
    data: Vec<u8>,
}

impl HeapPixelBuffer {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }
}

impl fmt::Debug for HeapPixelBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HeapPixelBuffer({} bytes)", self.data.len())
    }
}

impl PixelBuffer for HeapPixelBuffer {
    fn byte_size(&self) -> usize {
        self.data.len()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_bytes(&self) -> Option<&[u8]> {
        Some(&self.data)
    }

    fn as_bytes_mut(&mut self) -> Option<&mut [u8]> {
        Some(&mut self.data)
    }
}

/// Allocates heap buffers and tracks live allocations.
#[derive(Debug, Default)]
pub struct HeapPixelAllocator {
    live_buffers: AtomicUsize,
    live_bytes: AtomicUsize,
    /// Refuse allocations that would push live bytes past this.
    max_live_bytes: Option<usize>,
}

impl HeapPixelAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_live_bytes(max: usize) -> Self {
        Self {
            max_live_bytes: Some(max),
            ..Self::default()
        }
    }

    pub fn live_buffers(&self) -> usize {
        self.live_buffers.load(Ordering::Acquire)
    }

    pub fn live_bytes(&self) -> usize {
        self.live_bytes.load(Ordering::Acquire)
    }
}

impl PixelBufferAllocator for HeapPixelAllocator {
    fn allocate(
        &self,
        width: u32,
        height: u32,
        format: PixelFormat,
    ) -> Result<Box<dyn PixelBuffer>, DecodeError> {
        let size = (width as usize)
            .checked_mul(height as usize)
            .and_then(|px| px.checked_mul(format.bytes_per_pixel()))
            .ok_or_else(|| {
                DecodeError::Allocation(format!("{}x{} overflows buffer size", width, height))
            })?;

        if let Some(max) = self.max_live_bytes {
            if self.live_bytes() + size > max {
                return Err(DecodeError::Allocation(format!(
                    "{} bytes requested with {} of {} live",
                    size,
                    self.live_bytes(),
                    max
                )));
            }
        }

        self.live_buffers.fetch_add(1, Ordering::AcqRel);
        self.live_bytes.fetch_add(size, Ordering::AcqRel);
        trace!(width, height, size, "allocated pixel buffer");
        Ok(Box::new(HeapPixelBuffer::new(vec![0; size])))
    }

    fn release(&self, buffer: &dyn PixelBuffer) {
        self.live_buffers.fetch_sub(1, Ordering::AcqRel);
        self.live_bytes.fetch_sub(buffer.byte_size(), Ordering::AcqRel);
    }
}
