//! Zero-copy `IoBuf` wrapper for `Bytes`, so an encoded frame can be handed to a `compio` write
//! directly instead of being copied into a `Vec<u8>` first.

use bytes::Bytes;

/// Wraps an already-refcounted [`Bytes`] so it can be passed to `compio` write operations
/// without an extra copy.
///
/// SAFETY: `Bytes` is immutable and refcounted, so exposing it as `IoBuf` (a read-only view with
/// a stable pointer for the duration of the write) is sound.
pub struct IoBytes(Bytes);

impl IoBytes {
    #[must_use]
    pub const fn new(bytes: Bytes) -> Self {
        Self(bytes)
    }
}

impl From<Bytes> for IoBytes {
    fn from(bytes: Bytes) -> Self {
        Self(bytes)
    }
}

unsafe impl compio::buf::IoBuf for IoBytes {
    #[inline]
    fn as_buf_ptr(&self) -> *const u8 {
        self.0.as_ptr()
    }

    #[inline]
    fn buf_len(&self) -> usize {
        self.0.len()
    }

    #[inline]
    fn buf_capacity(&self) -> usize {
        self.0.len()
    }
}
