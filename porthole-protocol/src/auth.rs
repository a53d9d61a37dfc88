//! Auth payload codec
//!
//! The auth payload is the raw token bytes. Validation policy lives with the
//! session; this module only enforces the wire rule that a token is never
//! empty.

use crate::error::ProtocolError;
use bytes::Bytes;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Auth {
    pub token: String,
}

impl Auth {
    #[must_use]
    pub fn encode(token: &str) -> Bytes {
        Bytes::copy_from_slice(token.as_bytes())
    }

    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        if payload.is_empty() {
            return Err(ProtocolError::InvalidLength);
        }

        let token = std::str::from_utf8(payload).map_err(|_| ProtocolError::InvalidLength)?;
        Ok(Self {
            token: token.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let decoded = Auth::decode(&Auth::encode("dev-token")).unwrap();
        assert_eq!(decoded.token, "dev-token");
    }

    #[test]
    fn empty_token_rejected() {
        assert!(matches!(
            Auth::decode(b"").unwrap_err(),
            ProtocolError::InvalidLength
        ));
    }

    #[test]
    fn non_utf8_rejected() {
        assert!(matches!(
            Auth::decode(&[0xFF, 0xFE]).unwrap_err(),
            ProtocolError::InvalidLength
        ));
    }
}
