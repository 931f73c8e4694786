//! Length-prefixed frame codec for the admin socket.
//!
//! Each frame consists of an 8-byte header followed by the JSON payload:
//!
//! ```text
//! +------------------------+----------------+------------------+
//! | Length (4 bytes, BE)   | Zero (4 bytes) | Payload          |
//! +------------------------+----------------+------------------+
//! ```
//!
//! Only the first four header bytes carry the payload length; the trailing
//! four are written as zero and ignored on decode. The frame length is
//! validated before any allocation, and frames above [`MAX_FRAME_SIZE`]
//! are rejected.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::ProtocolError;

/// Length of the frame header.
pub const HEADER_LEN: usize = 8;

/// Maximum payload size (1 MiB).
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Frame codec implementing the 8-byte-header length-prefixed framing.
///
/// Used with [`tokio_util::codec::Framed`] or driven directly against a
/// [`BytesMut`] read buffer, as the connection server does.
#[derive(Debug, Clone, Default)]
pub struct FrameCodec;

impl FrameCodec {
    /// Creates a new frame codec.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = ProtocolError;

    /// Decodes one frame from the input buffer.
    ///
    /// The length is validated against [`MAX_FRAME_SIZE`] before the
    /// payload is awaited or split off, so a hostile length prefix cannot
    /// force a large allocation.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, ProtocolError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if length > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: length,
                max: MAX_FRAME_SIZE,
            });
        }

        let total_len = HEADER_LEN + length;
        if src.len() < total_len {
            src.reserve(total_len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        Ok(Some(src.split_to(length).freeze()))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        if item.len() > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: item.len(),
                max: MAX_FRAME_SIZE,
            });
        }

        dst.reserve(HEADER_LEN + item.len());
        #[allow(clippy::cast_possible_truncation)] // Validated above
        dst.put_u32(item.len() as u32);
        dst.put_u32(0);
        dst.extend_from_slice(&item);
        Ok(())
    }
}

impl Encoder<&[u8]> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: &[u8], dst: &mut BytesMut) -> Result<(), ProtocolError> {
        self.encode(Bytes::copy_from_slice(item), dst)
    }
}
