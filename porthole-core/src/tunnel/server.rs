//! Tunnel server: control-channel accept loop and session driver

use crate::auth::{NonEmptyToken, TokenValidator};
use crate::metrics::Metrics;
use crate::transport::{self, BoxedStream, TransportConfig};
use crate::tunnel::listener::PublicListener;
use crate::tunnel::router::Router;
use crate::tunnel::session::Session;
use bytes::Bytes;
use porthole_common::constants::DEFAULT_START_PORT;
use porthole_common::{Result, TunnelError};
use porthole_protocol::handshake::{encode_bind_ok, Handshake};
use porthole_protocol::{Capability, Frame, MessageType, PeerRole, ProtocolError};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub struct TunnelServer {
    addr: SocketAddr,
    start_port: u16,
    capabilities: Capability,
    transport_config: TransportConfig,
    validator: Arc<dyn TokenValidator>,
    router: Router,
    cancel: CancellationToken,
    metrics: Arc<Metrics>,
}

impl TunnelServer {
    #[must_use]
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            start_port: DEFAULT_START_PORT,
            capabilities: Capability::HEARTBEAT | Capability::RECONNECT | Capability::METRICS,
            transport_config: TransportConfig::default(),
            validator: Arc::new(NonEmptyToken),
            router: Router::new(DEFAULT_START_PORT),
            cancel: CancellationToken::new(),
            metrics: Arc::new(Metrics::new()),
        }
    }

    /// First public port handed to authenticated sessions.
    #[must_use]
    pub fn with_start_port(mut self, start_port: u16) -> Self {
        self.start_port = start_port;
        self.router = Router::new(start_port);
        self
    }

    #[must_use]
    pub fn with_transport(mut self, config: TransportConfig) -> Self {
        self.transport_config = config;
        self
    }

    /// Serve the control channel over TLS.
    #[must_use]
    pub fn with_tls(mut self, cert_path: impl Into<String>, key_path: impl Into<String>) -> Self {
        self.transport_config = TransportConfig::Tls(transport::tls::TlsTransportConfig {
            cert_path: cert_path.into(),
            key_path: key_path.into(),
            ..Default::default()
        });
        self
    }

    #[must_use]
    pub fn with_token_validator(mut self, validator: Arc<dyn TokenValidator>) -> Self {
        self.validator = validator;
        self
    }

    /// Root cancellation handle; tripping it drains the accept loop and
    /// closes every session.
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    #[must_use]
    pub fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.metrics)
    }

    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(self.addr).await?;
        info!("tunnel control channel listening on {}", self.addr);

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    info!("shutdown requested");
                    self.router.close_all().await;
                    return Ok(());
                }
                result = transport::accept(&self.transport_config, &listener) => match result {
                    Ok((stream, addr)) => {
                        let router = self.router.clone();
                        let validator = Arc::clone(&self.validator);
                        let capabilities = self.capabilities;
                        let metrics = Arc::clone(&self.metrics);
                        let cancel = self.cancel.clone();

                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(
                                stream, addr, router, capabilities, validator, metrics, cancel,
                            )
                            .await
                            {
                                warn!("connection error for {addr}: {e}");
                            }
                        });
                    }
                    Err(e) => {
                        error!("accept error: {e}");
                    }
                },
            }
        }
    }
}

async fn handle_connection(
    stream: BoxedStream,
    addr: SocketAddr,
    router: Router,
    capabilities: Capability,
    validator: Arc<dyn TokenValidator>,
    metrics: Arc<Metrics>,
    cancel: CancellationToken,
) -> Result<()> {
    let (read_half, write_half) = tokio::io::split(stream);
    let session = Session::new(read_half, write_half)
        .with_capabilities(capabilities)
        .with_token_validator(validator)
        .with_metrics(Arc::clone(&metrics));

    let result = drive_session(&session, &router, addr, capabilities, &cancel).await;

    if let Some(port) = session.public_port() {
        router.remove(port);
    }
    session.close().await;

    match result {
        Err(e) if e.is_session_expired() => {
            info!("session for {addr} expired");
            Ok(())
        }
        other => other,
    }
}

/// Drive one session through establishment and forwarding until it ends.
async fn drive_session(
    session: &Session,
    router: &Router,
    addr: SocketAddr,
    capabilities: Capability,
    cancel: &CancellationToken,
) -> Result<()> {
    loop {
        let frame = tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            result = session.read_frame() => match result {
                Ok(frame) => frame,
                Err(e) => {
                    report_failure(session, &e).await;
                    return Err(e);
                }
            },
        };

        match frame.msg_type {
            MessageType::Handshake => {
                // The ack carries this server's own handshake payload so
                // the client can run the same capability intersection.
                let hello = Handshake::new(PeerRole::Server, capabilities, "");
                session
                    .write_frame(Frame::control(MessageType::HandshakeAck, hello.encode()))
                    .await?;
                info!(
                    "handshake complete for {addr} (expose {}, caps {:?})",
                    session.expose_addr(),
                    session.capabilities()
                );
            }
            MessageType::Auth => {
                session
                    .write_frame(Frame::control(MessageType::AuthOk, Bytes::new()))
                    .await?;

                let port = router.allocate_port(session.clone())?;
                let listener = PublicListener::bind(port).await?;
                tokio::spawn(listener.serve(
                    router.clone(),
                    session.closed(),
                    session.metrics(),
                ));

                session
                    .write_frame(Frame::control(MessageType::BindOk, encode_bind_ok(port)))
                    .await?;
                info!("client {addr} bound to public port {port}");
            }
            MessageType::Heartbeat => {}
            MessageType::StreamOpen | MessageType::StreamData | MessageType::StreamClose => {
                session.handle_frame(frame).await?;
            }
            MessageType::Error => {
                warn!(
                    "peer error from {addr}: {}",
                    String::from_utf8_lossy(&frame.payload)
                );
            }
            other => {
                debug!("ignoring frame type {other:?} from {addr}");
            }
        }
    }
}

/// Tell the peer why the session is ending, where the protocol has a frame
/// for it. Best-effort: the connection is going away either way.
async fn report_failure(session: &Session, err: &TunnelError) {
    match err {
        TunnelError::Protocol(ProtocolError::AuthFailed) => {
            let _ = session
                .write_frame(Frame::control(
                    MessageType::AuthErr,
                    Bytes::from_static(b"authentication failed"),
                ))
                .await;
        }
        TunnelError::Protocol(ProtocolError::IncompatiblePeers) => {
            let _ = session
                .write_frame(Frame::control(
                    MessageType::Error,
                    Bytes::from_static(b"no common capabilities"),
                ))
                .await;
        }
        _ => {}
    }
}
