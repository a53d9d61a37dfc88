//! Codec for encoding and decoding protocol frames
//!
//! Length-delimited framing with a fixed 10-byte header. The codec performs
//! bounds checking only; payloads are opaque bytes. The declared length is
//! validated against the 16 MiB cap before any payload is read, so an
//! oversized declaration never causes an allocation.

use crate::constants::{HEADER_SIZE, MAX_PAYLOAD_SIZE, PROTOCOL_VERSION};
use crate::error::ProtocolError;
use crate::frame::Frame;
use crate::types::MessageType;
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Tunnel frame codec.
///
/// One `TunnelCodec` consumes one transport read half; writers share a
/// second instance behind the session's write lock, so every encode is a
/// whole-frame operation.
#[derive(Debug, Clone, Copy, Default)]
pub struct TunnelCodec;

impl TunnelCodec {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for TunnelCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
        if src.len() < HEADER_SIZE {
            src.reserve(HEADER_SIZE - src.len());
            return Ok(None);
        }

        // Peek the header without consuming; version and length are
        // validated before the payload is touched.
        let version = src[0];
        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedProto);
        }

        let length = u32::from_be_bytes([src[6], src[7], src[8], src[9]]);
        if length > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge);
        }

        let total = HEADER_SIZE + length as usize;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let mut frame = src.split_to(total);
        let version = frame.get_u8();
        let msg_type = MessageType::from_u8(frame.get_u8());
        let stream_id = frame.get_u32();
        frame.advance(4); // length, already validated
        let payload = frame.freeze();

        Ok(Some(Frame {
            version,
            msg_type,
            stream_id,
            payload,
        }))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            // Transport ended mid-frame: distinguish a truncated header
            // from a truncated payload.
            None if src.len() < HEADER_SIZE => Err(ProtocolError::ShortHeader),
            None => Err(ProtocolError::InvalidLength),
        }
    }
}

impl Encoder<Frame> for TunnelCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        if frame.payload.len() > MAX_PAYLOAD_SIZE as usize {
            return Err(ProtocolError::PayloadTooLarge);
        }

        dst.reserve(HEADER_SIZE + frame.payload.len());
        dst.put_u8(frame.version);
        dst.put_u8(frame.msg_type.as_u8());
        dst.put_u32(frame.stream_id);
        #[allow(clippy::cast_possible_truncation)]
        dst.put_u32(frame.payload.len() as u32);
        dst.extend_from_slice(&frame.payload);
        Ok(())
    }
}
