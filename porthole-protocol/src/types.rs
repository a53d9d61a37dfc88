//! Message types, peer roles, and the capability bitfield

use bitflags::bitflags;

/// Wire message type discriminator.
///
/// Values 1..=11 are assigned in declaration order. Anything else decodes as
/// [`MessageType::Unknown`] so that a newer peer's frames survive the trip
/// through the codec; the session decides whether to ignore or reject them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Handshake,
    HandshakeAck,
    Auth,
    AuthOk,
    AuthErr,
    BindOk,
    StreamOpen,
    StreamData,
    StreamClose,
    Heartbeat,
    Error,
    /// Forward-compatibility passthrough for unassigned type bytes.
    Unknown(u8),
}

impl MessageType {
    #[must_use]
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Handshake,
            2 => Self::HandshakeAck,
            3 => Self::Auth,
            4 => Self::AuthOk,
            5 => Self::AuthErr,
            6 => Self::BindOk,
            7 => Self::StreamOpen,
            8 => Self::StreamData,
            9 => Self::StreamClose,
            10 => Self::Heartbeat,
            11 => Self::Error,
            other => Self::Unknown(other),
        }
    }

    #[must_use]
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Handshake => 1,
            Self::HandshakeAck => 2,
            Self::Auth => 3,
            Self::AuthOk => 4,
            Self::AuthErr => 5,
            Self::BindOk => 6,
            Self::StreamOpen => 7,
            Self::StreamData => 8,
            Self::StreamClose => 9,
            Self::Heartbeat => 10,
            Self::Error => 11,
            Self::Unknown(other) => other,
        }
    }
}

/// Which end of the tunnel a peer is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PeerRole {
    Client = 1,
    Server = 2,
}

impl PeerRole {
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Client),
            2 => Some(Self::Server),
            _ => None,
        }
    }
}

bitflags! {
    /// Optional protocol features, advertised in the handshake and
    /// negotiated as the bitwise AND of both peers' sets.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Capability: u64 {
        const HEARTBEAT   = 1;
        const COMPRESSION = 1 << 1;
        const RECONNECT   = 1 << 2;
        const METRICS     = 1 << 3;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_type_round_trip() {
        for value in 0..=u8::MAX {
            assert_eq!(MessageType::from_u8(value).as_u8(), value);
        }
    }

    #[test]
    fn known_assignments() {
        assert_eq!(MessageType::Handshake.as_u8(), 1);
        assert_eq!(MessageType::Error.as_u8(), 11);
        assert_eq!(MessageType::from_u8(12), MessageType::Unknown(12));
    }

    #[test]
    fn role_parsing() {
        assert_eq!(PeerRole::from_u8(1), Some(PeerRole::Client));
        assert_eq!(PeerRole::from_u8(2), Some(PeerRole::Server));
        assert_eq!(PeerRole::from_u8(3), None);
    }

    #[test]
    fn capability_bits() {
        assert_eq!(Capability::HEARTBEAT.bits(), 1);
        assert_eq!(Capability::COMPRESSION.bits(), 2);
        assert_eq!(Capability::RECONNECT.bits(), 4);
        assert_eq!(Capability::METRICS.bits(), 8);
    }
}
