//! Public listener: one allocated port, many public connections
//!
//! Each accepted connection becomes one logical stream on the owning
//! session: a `StreamOpen` announces the id, a pump per direction copies
//! bytes, and a `StreamClose` follows the final byte of the public→tunnel
//! direction. Either pump observing closure ends the relay; the stream is
//! released once both pumps have exited.

use crate::httplog::HttpExchange;
use crate::metrics::Metrics;
use crate::transport::socket_tuning::configure_socket_silent;
use crate::tunnel::router::Router;
use crate::tunnel::session::Session;
use bytes::Bytes;
use porthole_common::Result;
use porthole_protocol::{Frame, MessageType};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Read size for both relay pumps.
const RELAY_BUF_SIZE: usize = 4096;

pub struct PublicListener {
    listener: TcpListener,
    port: u16,
}

impl PublicListener {
    /// Bind the public port. Binding completes before the server reports
    /// `BindOk`, so the port is usable the moment the client learns it.
    pub async fn bind(port: u16) -> Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        Ok(Self { listener, port })
    }

    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Accept public connections until the owning session closes. Dropping
    /// out of this loop releases the port.
    pub async fn serve(self, router: Router, closed: CancellationToken, metrics: Arc<Metrics>) {
        info!("public listener active on {}", self.port);

        loop {
            tokio::select! {
                () = closed.cancelled() => break,
                result = self.listener.accept() => match result {
                    Ok((conn, peer)) => {
                        configure_socket_silent(&conn);
                        debug!(port = self.port, %peer, "public connection accepted");
                        let router = router.clone();
                        let metrics = Arc::clone(&metrics);
                        tokio::spawn(async move {
                            handle_conn(conn, router, metrics).await;
                        });
                    }
                    Err(e) => {
                        debug!(port = self.port, "public accept error: {e}");
                    }
                },
            }
        }

        debug!("public listener on {} stopped", self.port);
    }
}

/// Relay one public connection over one logical stream.
async fn handle_conn(conn: TcpStream, router: Router, metrics: Arc<Metrics>) {
    let Ok(local) = conn.local_addr() else { return };
    let port = local.port();

    let Some(session) = router.get(port) else {
        debug!("no session for port {port}");
        return;
    };

    let stream = match session.streams().open() {
        Ok(stream) => stream,
        Err(e) => {
            warn!("failed to open stream for port {port}: {e}");
            return;
        }
    };
    let stream_id = stream.id();

    if let Err(e) = session
        .write_frame(Frame::stream(MessageType::StreamOpen, stream_id, Bytes::new()))
        .await
    {
        warn!(stream_id, "failed to announce stream: {e}");
        session.streams().close(stream_id);
        return;
    }

    metrics.connection_opened();
    metrics.stream_opened();

    let exchange = Arc::new(Mutex::new(HttpExchange::new()));
    let (conn_rd, conn_wr) = conn.into_split();

    let ingress = tokio::spawn(public_to_tunnel(
        session.clone(),
        stream_id,
        conn_rd,
        stream.closed(),
        Arc::clone(&exchange),
    ));
    let egress = tokio::spawn(tunnel_to_public(
        stream,
        conn_wr,
        exchange,
        Arc::clone(&metrics),
    ));

    let _ = tokio::join!(ingress, egress);

    session.streams().close(stream_id);
    metrics.stream_closed();
    debug!(stream_id, "public connection finished");
}

/// Public socket → tunnel frames. Sends `StreamClose` strictly after the
/// final data write so close ordering holds on the wire.
async fn public_to_tunnel(
    session: Session,
    stream_id: u32,
    mut conn: OwnedReadHalf,
    closed: CancellationToken,
    exchange: Arc<Mutex<HttpExchange>>,
) {
    let mut buf = vec![0u8; RELAY_BUF_SIZE];
    let mut first_packet = true;

    loop {
        let n = tokio::select! {
            () = closed.cancelled() => break,
            result = conn.read(&mut buf) => match result {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    debug!(stream_id, "public read error: {e}");
                    break;
                }
            },
        };

        if first_packet {
            first_packet = false;
            lock(&exchange).observe_request(&buf[..n]);
        }

        let frame = Frame::stream(
            MessageType::StreamData,
            stream_id,
            Bytes::copy_from_slice(&buf[..n]),
        );
        if let Err(e) = session.write_frame(frame).await {
            debug!(stream_id, "failed to forward to tunnel: {e}");
            break;
        }
    }

    let _ = session
        .write_frame(Frame::stream(MessageType::StreamClose, stream_id, Bytes::new()))
        .await;
}

/// Tunnel frames → public socket. Drains the inbound queue in FIFO order
/// until the stream closes or the socket rejects a write.
async fn tunnel_to_public(
    stream: crate::stream::Stream,
    mut conn: OwnedWriteHalf,
    exchange: Arc<Mutex<HttpExchange>>,
    metrics: Arc<Metrics>,
) {
    let mut first_packet = true;

    while let Some(data) = stream.recv().await {
        if first_packet {
            first_packet = false;
            if let Some((line, status, latency)) = lock(&exchange).observe_response(&data) {
                info!("│ HTTP  │ {line}");
                metrics.record_http(status, latency);
            }
        }

        if let Err(e) = conn.write_all(&data).await {
            debug!(stream_id = stream.id(), "failed to write to public: {e}");
            break;
        }
    }
}

fn lock(exchange: &Mutex<HttpExchange>) -> std::sync::MutexGuard<'_, HttpExchange> {
    exchange.lock().unwrap_or_else(PoisonError::into_inner)
}
