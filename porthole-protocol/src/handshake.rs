//! Handshake and bind payloads, capability negotiation
//!
//! The handshake payload is fixed-layout:
//!
//! ```text
//! role: u8 | capabilities: u64 BE | expose_len: u16 BE | expose: bytes
//! ```
//!
//! `expose` is the client's local target address, opaque to the server and
//! echoed back in logs. The server answers with its own handshake payload in
//! the HandshakeAck so both peers can compute the same capability
//! intersection.

use crate::error::ProtocolError;
use crate::types::{Capability, PeerRole};
use bytes::{BufMut, Bytes, BytesMut};

/// Minimum handshake payload: role + capabilities + expose length.
const MIN_HANDSHAKE_LEN: usize = 11;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub role: PeerRole,
    pub capabilities: Capability,
    pub expose_addr: String,
}

impl Handshake {
    #[must_use]
    pub fn new(role: PeerRole, capabilities: Capability, expose_addr: impl Into<String>) -> Self {
        Self {
            role,
            capabilities,
            expose_addr: expose_addr.into(),
        }
    }

    /// Whether this peer advertised the given capability.
    #[must_use]
    pub fn has(&self, cap: Capability) -> bool {
        self.capabilities.contains(cap)
    }

    #[must_use]
    pub fn encode(&self) -> Bytes {
        let expose = self.expose_addr.as_bytes();
        let mut buf = BytesMut::with_capacity(MIN_HANDSHAKE_LEN + expose.len());
        buf.put_u8(self.role as u8);
        buf.put_u64(self.capabilities.bits());
        #[allow(clippy::cast_possible_truncation)]
        buf.put_u16(expose.len() as u16);
        buf.extend_from_slice(expose);
        buf.freeze()
    }

    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        if payload.len() < MIN_HANDSHAKE_LEN {
            return Err(ProtocolError::InvalidLength);
        }

        let role = PeerRole::from_u8(payload[0]).ok_or(ProtocolError::InvalidLength)?;
        let caps = u64::from_be_bytes(
            payload[1..9].try_into().map_err(|_| ProtocolError::InvalidLength)?,
        );
        let expose_len = u16::from_be_bytes(
            payload[9..11].try_into().map_err(|_| ProtocolError::InvalidLength)?,
        ) as usize;

        if payload.len() < MIN_HANDSHAKE_LEN + expose_len {
            return Err(ProtocolError::InvalidLength);
        }

        let expose = std::str::from_utf8(&payload[11..11 + expose_len])
            .map_err(|_| ProtocolError::InvalidLength)?;

        Ok(Self {
            role,
            capabilities: Capability::from_bits_retain(caps),
            expose_addr: expose.to_string(),
        })
    }
}

/// Negotiated capability set: the bitwise AND of both peers' advertised
/// sets. An empty intersection means the peers share no feature at all and
/// the handshake fails.
pub fn negotiate(local: Capability, remote: Capability) -> Result<Capability, ProtocolError> {
    let common = local & remote;
    if common.is_empty() {
        return Err(ProtocolError::IncompatiblePeers);
    }
    Ok(common)
}

/// Encode the BindOk payload: the public port in big-endian.
#[must_use]
pub fn encode_bind_ok(port: u16) -> Bytes {
    Bytes::copy_from_slice(&port.to_be_bytes())
}

/// Decode the BindOk payload.
pub fn decode_bind_ok(payload: &[u8]) -> Result<u16, ProtocolError> {
    let bytes: [u8; 2] = payload
        .get(..2)
        .and_then(|b| b.try_into().ok())
        .ok_or(ProtocolError::InvalidLength)?;
    Ok(u16::from_be_bytes(bytes))
}
