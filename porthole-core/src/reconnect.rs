//! Exponential backoff reconnection logic
//!
//! The driver establishes a fresh transport and drives the three-exchange
//! establishment (Handshake → HandshakeAck, Auth → AuthOk, then BindOk) on
//! every attempt. Failures before AuthOk are retryable; exhausting the
//! attempt budget is terminal. Every wait is cancellable.

use crate::metrics::Metrics;
use crate::transport::{self, TransportConfig};
use crate::tunnel::session::Session;
use porthole_common::{ReconnectConfig, Result, TunnelError};
use porthole_protocol::auth::Auth;
use porthole_protocol::handshake::{decode_bind_ok, Handshake};
use porthole_protocol::{Capability, Frame, MessageType, PeerRole};
use rand::RngExt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Backoff configuration
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Initial delay
    pub base: Duration,
    /// Maximum delay
    pub max: Duration,
    /// Multiplier for each attempt
    pub factor: f64,
    /// Jitter factor (0.0 - 1.0). Zero keeps the retry timing exact.
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(30),
            factor: 2.0,
            jitter: 0.0,
        }
    }
}

impl From<&ReconnectConfig> for BackoffConfig {
    fn from(config: &ReconnectConfig) -> Self {
        Self {
            base: config.initial_backoff,
            max: config.max_backoff,
            factor: config.factor,
            jitter: 0.0,
        }
    }
}

/// Exponential backoff calculator
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    #[must_use]
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Get the next delay and increment the attempt counter
    #[must_use]
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.calculate_delay();
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Reset the backoff (call after a successful connection)
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    fn calculate_delay(&self) -> Duration {
        // Exponential growth; cap the exponent to avoid i32 wrap.
        let base_secs = self.config.base.as_secs_f64();
        let attempt: i32 = self.attempt.min(1_000).try_into().unwrap_or(i32::MAX);
        let exp_delay = base_secs * self.config.factor.powi(attempt);

        let delay = if self.config.jitter > 0.0 {
            let jitter_range = exp_delay * self.config.jitter;
            let jitter = rand::rng().random_range(-jitter_range..=jitter_range);
            (exp_delay + jitter).max(0.0)
        } else {
            exp_delay
        };

        Duration::from_secs_f64(delay.min(self.config.max.as_secs_f64()))
    }
}

/// Establish a session, retrying with exponential backoff.
///
/// On success returns the authenticated session and the public port the
/// server bound for it. Cancellation through `cancel` returns immediately
/// from any wait.
pub async fn connect_with_retry(
    cancel: &CancellationToken,
    transport_config: &TransportConfig,
    server_addr: &str,
    local_addr: &str,
    token: &str,
    capabilities: Capability,
    config: &ReconnectConfig,
    metrics: Arc<Metrics>,
) -> Result<(Session, u16)> {
    let mut backoff = Backoff::new(BackoffConfig::from(config));

    for attempt in 1..=config.max_retries {
        if cancel.is_cancelled() {
            return Err(TunnelError::Cancelled);
        }

        info!("connection attempt {attempt}/{}...", config.max_retries);

        match attempt_connection(
            transport_config,
            server_addr,
            local_addr,
            token,
            capabilities,
            Arc::clone(&metrics),
        )
        .await
        {
            Ok(established) => {
                info!("connected successfully");
                return Ok(established);
            }
            Err(e) => warn!("connection failed: {e}"),
        }

        if attempt < config.max_retries {
            let delay = backoff.next_delay();
            info!("retrying in {delay:?}...");
            tokio::select! {
                () = cancel.cancelled() => return Err(TunnelError::Cancelled),
                () = tokio::time::sleep(delay) => {}
            }
        }
    }

    Err(TunnelError::Connection(format!(
        "failed to connect after {} attempts",
        config.max_retries
    )))
}

/// One establishment attempt: dial, handshake, authenticate, read the bound
/// public port.
async fn attempt_connection(
    transport_config: &TransportConfig,
    server_addr: &str,
    local_addr: &str,
    token: &str,
    capabilities: Capability,
    metrics: Arc<Metrics>,
) -> Result<(Session, u16)> {
    let stream = transport::connect(transport_config, server_addr).await?;
    let (read_half, write_half) = tokio::io::split(stream);
    let session = Session::new(read_half, write_half)
        .with_capabilities(capabilities)
        .with_metrics(metrics);

    let hello = Handshake::new(PeerRole::Client, capabilities, local_addr);
    session
        .write_frame(Frame::control(MessageType::Handshake, hello.encode()))
        .await?;

    // The state machine inside read_frame enforces each step: a frame of
    // the wrong type surfaces as HandshakeRequired/AuthRequired here.
    let frame = session.read_frame().await?;
    if frame.msg_type != MessageType::HandshakeAck {
        return Err(TunnelError::Connection("handshake rejected".into()));
    }

    session
        .write_frame(Frame::control(MessageType::Auth, Auth::encode(token)))
        .await?;
    let frame = session.read_frame().await?;
    if frame.msg_type != MessageType::AuthOk {
        return Err(TunnelError::Connection("authentication rejected".into()));
    }

    let frame = session.read_frame().await?;
    if frame.msg_type != MessageType::BindOk {
        return Err(TunnelError::Connection("failed to bind public port".into()));
    }
    let public_port = decode_bind_ok(&frame.payload)?;

    Ok((session, public_port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_growth() {
        let config = BackoffConfig {
            base: Duration::from_millis(10),
            max: Duration::from_millis(40),
            factor: 2.0,
            jitter: 0.0,
        };
        let mut backoff = Backoff::new(config);

        assert_eq!(backoff.next_delay(), Duration::from_millis(10));
        assert_eq!(backoff.next_delay(), Duration::from_millis(20));
        assert_eq!(backoff.next_delay(), Duration::from_millis(40));
        // Capped at max from here on.
        assert_eq!(backoff.next_delay(), Duration::from_millis(40));
    }

    #[test]
    fn backoff_reset() {
        let mut backoff = Backoff::new(BackoffConfig::default());
        let _ = backoff.next_delay();
        let _ = backoff.next_delay();
        assert_eq!(backoff.attempts(), 2);

        backoff.reset();
        assert_eq!(backoff.attempts(), 0);
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn jitter_stays_in_band() {
        let config = BackoffConfig {
            base: Duration::from_secs(10),
            max: Duration::from_secs(60),
            factor: 1.0,
            jitter: 0.3,
        };
        let mut backoff = Backoff::new(config);
        for _ in 0..32 {
            let d = backoff.next_delay().as_secs_f64();
            assert!((7.0..=13.0).contains(&d), "delay {d} outside jitter band");
        }
    }

    #[tokio::test]
    async fn exhausted_retries_report_terminal_failure() {
        // Grab a port with no listener behind it.
        let unused = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = unused.local_addr().unwrap().to_string();
        drop(unused);

        let config = ReconnectConfig {
            max_retries: 3,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(40),
            factor: 2.0,
        };

        let cancel = CancellationToken::new();
        let started = std::time::Instant::now();
        let err = connect_with_retry(
            &cancel,
            &TransportConfig::Tcp,
            &addr,
            "127.0.0.1:8080",
            "dev-token",
            Capability::HEARTBEAT,
            &config,
            Arc::new(Metrics::new()),
        )
        .await
        .unwrap_err();

        assert_eq!(
            err.to_string(),
            "connection failed: failed to connect after 3 attempts"
        );
        // Two waits: ~10ms then ~20ms.
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn cancellation_interrupts_the_backoff_wait() {
        let unused = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = unused.local_addr().unwrap().to_string();
        drop(unused);

        let config = ReconnectConfig {
            max_retries: 5,
            initial_backoff: Duration::from_secs(60),
            max_backoff: Duration::from_secs(60),
            factor: 2.0,
        };

        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let started = std::time::Instant::now();
        let err = connect_with_retry(
            &cancel,
            &TransportConfig::Tcp,
            &addr,
            "127.0.0.1:8080",
            "dev-token",
            Capability::HEARTBEAT,
            &config,
            Arc::new(Metrics::new()),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, TunnelError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
