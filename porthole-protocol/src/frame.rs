//! Protocol frame definition

use crate::constants::PROTOCOL_VERSION;
use crate::types::MessageType;
use bytes::Bytes;

/// The unit of wire transfer: a fixed header plus an opaque payload.
///
/// Header layout (all integers big-endian):
///
/// ```text
/// ┌──────────────┬───────────┬────────────────┬──────────────┬─────────┐
/// │ Version (u8) │ Type (u8) │ StreamID (u32) │ Length (u32) │ Payload │
/// └──────────────┴───────────┴────────────────┴──────────────┴─────────┘
/// ```
///
/// `stream_id` is 0 for control frames and the owning stream's id for
/// `StreamOpen`/`StreamData`/`StreamClose`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub version: u8,
    pub msg_type: MessageType,
    pub stream_id: u32,
    pub payload: Bytes,
}

impl Frame {
    /// A control frame (stream id 0).
    #[must_use]
    pub fn control(msg_type: MessageType, payload: Bytes) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            msg_type,
            stream_id: 0,
            payload,
        }
    }

    /// A frame addressed to a specific stream.
    #[must_use]
    pub fn stream(msg_type: MessageType, stream_id: u32, payload: Bytes) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            msg_type,
            stream_id,
            payload,
        }
    }

    /// An empty heartbeat frame.
    #[must_use]
    pub fn heartbeat() -> Self {
        Self::control(MessageType::Heartbeat, Bytes::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructors_stamp_version() {
        let f = Frame::control(MessageType::Heartbeat, Bytes::new());
        assert_eq!(f.version, PROTOCOL_VERSION);
        assert_eq!(f.stream_id, 0);

        let f = Frame::stream(MessageType::StreamData, 7, Bytes::from_static(b"x"));
        assert_eq!(f.stream_id, 7);
        assert_eq!(f.msg_type, MessageType::StreamData);
    }
}
