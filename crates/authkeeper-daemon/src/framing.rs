//! Length-prefixed frame codec for the endpoint sockets.
//!
//! Each frame is a 4-byte little-endian payload length followed by the
//! payload, matching the integer encoding of the record format carried
//! inside. The length is validated against the configured cap *before* any
//! allocation, so a hostile length prefix cannot exhaust memory.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Length of the frame header.
const HEADER_LEN: usize = 4;

/// Default maximum frame size. Requests here are tiny (a header plus a
/// 32-byte-capped password or a bounded policy body); 64 KiB leaves ample
/// slack for pipelined batches.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024;

/// Frame-level errors.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// Declared or produced frame exceeds the size cap.
    #[error("frame of {size} bytes exceeds maximum of {max}")]
    FrameTooLarge {
        /// Frame size.
        size: usize,
        /// Configured cap.
        max: usize,
    },

    /// Underlying socket error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Length-prefixed codec used with [`tokio_util::codec::Framed`].
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    /// Codec with the default size cap.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Codec with a custom size cap.
    #[must_use]
    pub const fn with_max_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, FrameError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let length = u32::from_le_bytes([src[0], src[1], src[2], src[3]]) as usize;

        // Validate before reserving or allocating anything.
        if length > self.max_frame_size {
            return Err(FrameError::FrameTooLarge {
                size: length,
                max: self.max_frame_size,
            });
        }

        let total = HEADER_LEN + length;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        Ok(Some(src.split_to(length).freeze()))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), FrameError> {
        if item.len() > self.max_frame_size {
            return Err(FrameError::FrameTooLarge {
                size: item.len(),
                max: self.max_frame_size,
            });
        }

        dst.reserve(HEADER_LEN + item.len());
        dst.put_u32_le(item.len() as u32);
        dst.extend_from_slice(&item);
        Ok(())
    }
}
