//! Token validation policy
//!
//! The session consults a single policy hook: token in, verdict out. The
//! default policy only requires a non-empty token; deployments that
//! configure a shared secret get a constant-time comparison instead.

use subtle::ConstantTimeEq;

/// Policy hook deciding whether a presented bearer token is acceptable.
pub trait TokenValidator: Send + Sync {
    fn validate(&self, token: &str) -> bool;
}

/// Default policy: any non-empty token passes.
#[derive(Debug, Clone, Copy, Default)]
pub struct NonEmptyToken;

impl TokenValidator for NonEmptyToken {
    fn validate(&self, token: &str) -> bool {
        !token.is_empty()
    }
}

/// Compare against a configured secret without leaking how many bytes
/// matched through timing.
#[derive(Clone)]
pub struct SharedToken {
    secret: String,
}

impl SharedToken {
    #[must_use]
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }
}

impl TokenValidator for SharedToken {
    fn validate(&self, token: &str) -> bool {
        constant_time_eq(token.as_bytes(), self.secret.as_bytes())
    }
}

/// Constant-time comparison of two byte slices.
#[must_use]
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}
