//! NSQ frame codec.
//!
//! Every broker frame is:
//!
//! ```text
//! [ size: u32 BE ][ frame type: u32 BE ][ payload: size - 4 bytes ]
//! ```
//!
//! `size` counts the frame type field plus the payload.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use quay_core::error::QuayError;
use thiserror::Error;

/// Protocol magic sent right after connecting.
pub const MAGIC_V2: &[u8; 4] = b"  V2";

/// Payload of a heartbeat response frame.
pub const HEARTBEAT: &[u8] = b"_heartbeat_";

/// Plain acknowledgement payload.
pub const OK: &[u8] = b"OK";

/// Payload answering `CLS`.
pub const CLOSE_WAIT: &[u8] = b"CLOSE_WAIT";

/// Default ceiling for a single frame.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

const HEADER_LEN: usize = 8;

/// Frame decoding errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame of {size} bytes exceeds limit of {max}")]
    TooLarge { size: usize, max: usize },

    #[error("unknown frame type {0}")]
    UnknownFrameType(u32),

    #[error("malformed frame: {0}")]
    Malformed(&'static str),
}

impl From<FrameError> for QuayError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::TooLarge { size, max } => QuayError::FrameTooLarge { size, max },
            other => QuayError::Protocol(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Response,
    Error,
    Message,
}

impl FrameType {
    pub const fn as_u32(self) -> u32 {
        match self {
            Self::Response => 0,
            Self::Error => 1,
            Self::Message => 2,
        }
    }
}

impl TryFrom<u32> for FrameType {
    type Error = FrameError;

    fn try_from(value: u32) -> Result<Self, FrameError> {
        match value {
            0 => Ok(Self::Response),
            1 => Ok(Self::Error),
            2 => Ok(Self::Message),
            other => Err(FrameError::UnknownFrameType(other)),
        }
    }
}

/// A decoded broker frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: FrameType,
    pub payload: Bytes,
}

impl Frame {
    #[inline]
    pub fn is_heartbeat(&self) -> bool {
        self.frame_type == FrameType::Response && self.payload == HEARTBEAT
    }
}

/// Stateful frame decoder.
///
/// Bytes are pushed in as they arrive; complete frames are split off the
/// front without copying.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: BytesMut,
    max_frame_size: usize,
}

impl FrameDecoder {
    #[must_use]
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(8 * 1024),
            max_frame_size,
        }
    }

    /// Append received bytes.
    #[inline]
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Decode a single frame
    ///
    /// Returns:
    /// - Ok(Some(frame)) → frame decoded
    /// - Ok(None) → need more data
    /// - Err → protocol violation
    pub fn decode(&mut self) -> Result<Option<Frame>, FrameError> {
        if self.buf.len() < 4 {
            return Ok(None);
        }
        let size = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if size < 4 {
            return Err(FrameError::Malformed("frame size smaller than frame type"));
        }
        if size > self.max_frame_size {
            return Err(FrameError::TooLarge {
                size,
                max: self.max_frame_size,
            });
        }
        if self.buf.len() < 4 + size {
            self.buf.reserve(4 + size - self.buf.len());
            return Ok(None);
        }

        self.buf.advance(4);
        let frame_type = FrameType::try_from(self.buf.get_u32())?;
        let payload = self.buf.split_to(size - 4).freeze();
        Ok(Some(Frame {
            frame_type,
            payload,
        }))
    }

    /// Hand over bytes received past the last decoded frame.
    ///
    /// Used when the stream switches to TLS or compression: those bytes
    /// belong to the new layer and must not be parsed as frames.
    pub fn take_buffered(&mut self) -> Bytes {
        self.buf.split().freeze()
    }

    #[inline]
    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }
}

/// Encode one frame. Brokers send frames; the client only needs this for
/// tests and fake brokers.
pub fn encode_frame(frame_type: FrameType, payload: &[u8], dst: &mut BytesMut) {
    dst.reserve(HEADER_LEN + payload.len());
    dst.put_u32((payload.len() + 4) as u32);
    dst.put_u32(frame_type.as_u32());
    dst.put_slice(payload);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_bytes(frame_type: FrameType, payload: &[u8]) -> BytesMut {
        let mut buf = BytesMut::new();
        encode_frame(frame_type, payload, &mut buf);
        buf
    }

    #[test]
    fn test_decode_response() {
        let mut decoder = FrameDecoder::new(DEFAULT_MAX_FRAME_SIZE);
        decoder.extend(&frame_bytes(FrameType::Response, b"OK"));
        let frame = decoder.decode().unwrap().unwrap();
        assert_eq!(frame.frame_type, FrameType::Response);
        assert_eq!(&frame.payload[..], b"OK");
        assert_eq!(decoder.decode().unwrap(), None);
    }

    #[test]
    fn test_partial_frame_needs_more() {
        let wire = frame_bytes(FrameType::Message, &[7u8; 40]);
        let mut decoder = FrameDecoder::new(DEFAULT_MAX_FRAME_SIZE);
        for b in &wire[..wire.len() - 1] {
            decoder.extend(&[*b]);
            assert_eq!(decoder.decode().unwrap(), None);
        }
        decoder.extend(&wire[wire.len() - 1..]);
        let frame = decoder.decode().unwrap().unwrap();
        assert_eq!(frame.payload.len(), 40);
    }

    #[test]
    fn test_zero_length_payload() {
        let mut decoder = FrameDecoder::new(DEFAULT_MAX_FRAME_SIZE);
        decoder.extend(&frame_bytes(FrameType::Response, b""));
        let frame = decoder.decode().unwrap().unwrap();
        assert!(frame.payload.is_empty());
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut decoder = FrameDecoder::new(1024);
        decoder.extend(&[0x00, 0x10, 0x00, 0x00, 0, 0, 0, 0]);
        let err = decoder.decode().unwrap_err();
        assert_eq!(err, FrameError::TooLarge { size: 0x0010_0000, max: 1024 });
        assert!(matches!(QuayError::from(err), QuayError::FrameTooLarge { .. }));
    }

    #[test]
    fn test_unknown_frame_type() {
        let mut decoder = FrameDecoder::new(DEFAULT_MAX_FRAME_SIZE);
        decoder.extend(&[0, 0, 0, 4, 0, 0, 0, 9]);
        assert_eq!(decoder.decode(), Err(FrameError::UnknownFrameType(9)));
    }

    #[test]
    fn test_undersized_length_rejected() {
        let mut decoder = FrameDecoder::new(DEFAULT_MAX_FRAME_SIZE);
        decoder.extend(&[0, 0, 0, 2, 0, 0]);
        assert!(matches!(decoder.decode(), Err(FrameError::Malformed(_))));
    }

    #[test]
    fn test_heartbeat_detection() {
        let mut decoder = FrameDecoder::new(DEFAULT_MAX_FRAME_SIZE);
        decoder.extend(&frame_bytes(FrameType::Response, HEARTBEAT));
        assert!(decoder.decode().unwrap().unwrap().is_heartbeat());
    }

    #[test]
    fn test_take_buffered_returns_tail() {
        let mut decoder = FrameDecoder::new(DEFAULT_MAX_FRAME_SIZE);
        let mut wire = frame_bytes(FrameType::Response, b"{}");
        wire.extend_from_slice(b"\xff\x06\x00\x00sNaPpY");
        decoder.extend(&wire);
        decoder.decode().unwrap().unwrap();
        assert_eq!(&decoder.take_buffered()[..], b"\xff\x06\x00\x00sNaPpY");
        assert_eq!(decoder.buffered_len(), 0);
    }
}
