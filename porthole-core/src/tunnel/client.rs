//! Tunnel client: reconnect loop and session driver

use crate::metrics::Metrics;
use crate::reconnect;
use crate::transport::{self, TransportConfig};
use crate::tunnel::forwarder::Forwarder;
use crate::tunnel::session::Session;
use porthole_common::{ReconnectConfig, Result, TunnelError};
use porthole_protocol::{Capability, MessageType};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Pause between a lost session and the next establishment attempt.
const RECONNECT_PAUSE: Duration = Duration::from_secs(2);

pub struct TunnelClient {
    server_addr: String,
    local_addr: String,
    token: String,
    transport_config: TransportConfig,
    reconnect: ReconnectConfig,
    reconnect_enabled: bool,
    cancel: CancellationToken,
    metrics: Arc<Metrics>,
}

/// Details of an established tunnel, reported per session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TunnelInfo {
    pub public_port: u16,
}

impl TunnelClient {
    #[must_use]
    pub fn new(server_addr: impl Into<String>, local_addr: impl Into<String>) -> Self {
        Self {
            server_addr: server_addr.into(),
            local_addr: local_addr.into(),
            token: porthole_common::DEFAULT_TOKEN.to_string(),
            transport_config: TransportConfig::default(),
            reconnect: ReconnectConfig::default(),
            reconnect_enabled: true,
            cancel: CancellationToken::new(),
            metrics: Arc::new(Metrics::new()),
        }
    }

    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = token.into();
        self
    }

    #[must_use]
    pub fn with_transport(mut self, config: TransportConfig) -> Self {
        self.transport_config = config;
        self
    }

    /// Connect to the server over TLS, trusting the given CA bundle.
    #[must_use]
    pub fn with_tls_ca(mut self, ca_cert_path: impl Into<String>) -> Self {
        self.transport_config = TransportConfig::Tls(transport::tls::TlsTransportConfig {
            ca_cert_path: Some(ca_cert_path.into()),
            ..Default::default()
        });
        self
    }

    #[must_use]
    pub fn with_reconnect(mut self, config: ReconnectConfig) -> Self {
        self.reconnect = config;
        self
    }

    /// Give up after the first session instead of re-establishing.
    #[must_use]
    pub fn without_reconnect(mut self) -> Self {
        self.reconnect_enabled = false;
        self
    }

    /// Root cancellation handle; tripping it ends the running session and
    /// any in-progress backoff wait.
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    #[must_use]
    pub fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.metrics)
    }

    fn capabilities(&self) -> Capability {
        let mut caps = Capability::HEARTBEAT | Capability::METRICS;
        if self.reconnect_enabled {
            caps |= Capability::RECONNECT;
        }
        caps
    }

    /// Run the client until cancellation, a terminal connect failure, or —
    /// with reconnect disabled — the end of the first session.
    pub async fn run(&self) -> Result<()> {
        self.run_with(|_| {}).await
    }

    /// Like [`TunnelClient::run`], reporting each established tunnel to the
    /// callback (the CLI prints its banner from it).
    pub async fn run_with(&self, mut on_established: impl FnMut(TunnelInfo)) -> Result<()> {
        loop {
            if self.cancel.is_cancelled() {
                return Ok(());
            }

            let (session, public_port) = reconnect::connect_with_retry(
                &self.cancel,
                &self.transport_config,
                &self.server_addr,
                &self.local_addr,
                &self.token,
                self.capabilities(),
                &self.reconnect,
                Arc::clone(&self.metrics),
            )
            .await?;

            info!(
                "tunnel established: public port {public_port} -> {}",
                self.local_addr
            );
            on_established(TunnelInfo { public_port });

            let result = self.run_session(&session).await;
            session.close().await;

            match result {
                Ok(()) => {}
                Err(e) if e.is_session_expired() => info!("session expired"),
                Err(e) => warn!("session lost: {e}"),
            }
            info!("{}", self.metrics.one_liner());

            if self.cancel.is_cancelled() {
                return Ok(());
            }
            if !self.reconnect_enabled {
                info!("auto-reconnect disabled, exiting");
                return Ok(());
            }

            info!("connection lost, reconnecting in {RECONNECT_PAUSE:?}...");
            tokio::select! {
                () = self.cancel.cancelled() => return Ok(()),
                () = tokio::time::sleep(RECONNECT_PAUSE) => {}
            }
        }
    }

    /// Drive one established session: route stream frames to the forwarder
    /// until the session ends.
    async fn run_session(&self, session: &Session) -> Result<()> {
        let forwarder = Forwarder::new(session.clone(), self.local_addr.clone());

        let result = loop {
            let frame = tokio::select! {
                () = self.cancel.cancelled() => break Err(TunnelError::Cancelled),
                result = session.read_frame() => match result {
                    Ok(frame) => frame,
                    Err(e) => break Err(e),
                },
            };

            match frame.msg_type {
                MessageType::Heartbeat => {}
                MessageType::StreamOpen | MessageType::StreamData | MessageType::StreamClose => {
                    forwarder.handle_frame(frame).await;
                }
                MessageType::Error => {
                    warn!("server error: {}", String::from_utf8_lossy(&frame.payload));
                }
                other => debug!("ignoring frame type {other:?}"),
            }
        };

        forwarder.close();
        match result {
            Err(TunnelError::Cancelled) => Ok(()),
            other => other,
        }
    }
}

impl std::fmt::Debug for TunnelClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelClient")
            .field("server_addr", &self.server_addr)
            .field("local_addr", &self.local_addr)
            .field("reconnect_enabled", &self.reconnect_enabled)
            .finish_non_exhaustive()
    }
}
