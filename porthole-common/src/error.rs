//! Error types for Porthole

use porthole_protocol::ProtocolError;
use thiserror::Error;

/// Main error type for Porthole operations
#[derive(Error, Debug)]
pub enum TunnelError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Wire protocol or session state machine error
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Connection establishment or transport failure
    #[error("connection failed: {0}")]
    Connection(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// TLS error
    #[error("TLS error: {0}")]
    Tls(String),

    /// Operation attempted in a state that forbids it
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Operation cancelled by the enclosing shutdown scope
    #[error("operation cancelled")]
    Cancelled,
}

impl TunnelError {
    /// Whether this error is the session-expired signal (watchdog trip or
    /// explicit close).
    #[must_use]
    pub fn is_session_expired(&self) -> bool {
        matches!(self, TunnelError::Protocol(ProtocolError::SessionExpired))
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, TunnelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_carries_context() {
        let err = TunnelError::Connection("refused".to_string());
        assert!(err.to_string().contains("refused"));
    }

    #[test]
    fn protocol_errors_convert() {
        let err: TunnelError = ProtocolError::SessionExpired.into();
        assert!(err.is_session_expired());

        let err: TunnelError = ProtocolError::ShortHeader.into();
        assert!(!err.is_session_expired());
    }

    #[test]
    fn io_errors_convert() {
        let err: TunnelError = std::io::Error::other("test").into();
        assert!(matches!(err, TunnelError::Io(_)));
    }
}
