//! Admin-socket protocol: framing and the request/response envelope.
//!
//! The protocol stack is two layers: length-prefixed frames
//! ([`framing::FrameCodec`]) carrying JSON envelopes
//! ([`messages`]). The parser produces plain request records consumed by
//! the lifecycle controller; the response builder consumes instance
//! records only, so neither layer depends on the other's internals.

pub mod framing;
pub mod messages;

use thiserror::Error;

pub use framing::{FrameCodec, HEADER_LEN, MAX_FRAME_SIZE};
pub use messages::{CreateRequest, ParseError, Request, RequestKind};

/// Transport-level protocol errors.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A frame length exceeded the protocol cap.
    #[error("frame of {size} bytes exceeds maximum of {max}")]
    FrameTooLarge {
        /// Claimed or actual payload size.
        size: usize,
        /// Maximum allowed payload size.
        max: usize,
    },

    /// The peer closed the connection mid-frame.
    #[error("connection closed inside a partial frame")]
    TruncatedFrame,

    /// Socket I/O failed.
    #[error("socket I/O error: {0}")]
    Io(#[from] std::io::Error),
}
