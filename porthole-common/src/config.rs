//! Configuration types shared between the core and the CLI

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Reconnection behavior for the client.
///
/// Backoff grows geometrically from `initial_backoff` by `factor` per failed
/// attempt, clamped to `max_backoff`. The defaults retry for roughly five
/// minutes before giving up.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Attempts before the driver reports a terminal failure.
    pub max_retries: u32,
    /// Delay after the first failed attempt.
    pub initial_backoff: Duration,
    /// Upper bound on the delay between attempts.
    pub max_backoff: Duration,
    /// Multiplier applied to the delay after each failed attempt.
    pub factor: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_retries: 10,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            factor: 2.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_policy() {
        let config = ReconnectConfig::default();
        assert_eq!(config.max_retries, 10);
        assert_eq!(config.initial_backoff, Duration::from_secs(1));
        assert_eq!(config.max_backoff, Duration::from_secs(30));
        assert!((config.factor - 2.0).abs() < f64::EPSILON);
    }
}
