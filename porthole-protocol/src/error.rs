//! Protocol error kinds
//!
//! Every failure the wire layer and session state machine can raise. All of
//! them are fatal for the session that observes them; `SessionExpired` is
//! additionally the error surfaced by any read or write attempted after the
//! session's closure signal has tripped.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Transport returned fewer bytes than a frame header requires.
    #[error("short frame header")]
    ShortHeader,

    /// Payload length mismatch or undersized typed payload.
    #[error("invalid payload length")]
    InvalidLength,

    /// Declared frame length exceeds the 16 MiB cap.
    #[error("payload exceeds maximum allowed size")]
    PayloadTooLarge,

    /// Version byte is not 1.
    #[error("unsupported protocol version")]
    UnsupportedProto,

    /// Non-handshake frame observed before the handshake completed.
    #[error("handshake required")]
    HandshakeRequired,

    /// Non-auth frame observed before authentication completed.
    #[error("authentication required")]
    AuthRequired,

    /// Capability intersection of the two peers is empty.
    #[error("incompatible peer capabilities")]
    IncompatiblePeers,

    /// Token policy rejected the presented token.
    #[error("authentication failed")]
    AuthFailed,

    /// Session closed by watchdog, teardown, or external cancellation.
    #[error("session expired")]
    SessionExpired,

    /// Transport-level failure while reading or writing a frame.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_stable() {
        assert_eq!(ProtocolError::ShortHeader.to_string(), "short frame header");
        assert_eq!(ProtocolError::SessionExpired.to_string(), "session expired");
    }

    #[test]
    fn io_errors_convert() {
        let err: ProtocolError = std::io::Error::other("boom").into();
        assert!(matches!(err, ProtocolError::Io(_)));
    }
}
