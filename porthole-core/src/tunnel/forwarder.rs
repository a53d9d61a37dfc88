//! Client-side forwarder: logical streams → local service connections
//!
//! Owns the mapping from stream id to the local TCP connection dialed for
//! that stream. A dial failure closes only the affected stream; the session
//! stays up.

use crate::transport::socket_tuning::configure_socket_silent;
use crate::tunnel::session::Session;
use bytes::Bytes;
use dashmap::DashMap;
use porthole_protocol::{Frame, MessageType};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const RELAY_BUF_SIZE: usize = 4096;

struct LocalConn {
    writer: Arc<tokio::sync::Mutex<OwnedWriteHalf>>,
    closed: CancellationToken,
}

#[derive(Clone)]
pub struct Forwarder {
    session: Session,
    target_addr: String,
    conns: Arc<DashMap<u32, LocalConn>>,
}

impl Forwarder {
    #[must_use]
    pub fn new(session: Session, target_addr: impl Into<String>) -> Self {
        Self {
            session,
            target_addr: target_addr.into(),
            conns: Arc::new(DashMap::new()),
        }
    }

    /// Dispatch one stream frame from the session.
    pub async fn handle_frame(&self, frame: Frame) {
        match frame.msg_type {
            MessageType::StreamOpen => self.open_stream(frame.stream_id).await,
            MessageType::StreamData => self.write_local(frame.stream_id, &frame.payload).await,
            MessageType::StreamClose => self.close_stream(frame.stream_id),
            _ => {}
        }
    }

    /// Dial the local target for a newly announced stream and start the
    /// local→tunnel pump.
    async fn open_stream(&self, stream_id: u32) {
        let conn = match TcpStream::connect(&self.target_addr).await {
            Ok(conn) => conn,
            Err(e) => {
                // Only this stream dies; tell the server so it can release
                // the public connection.
                warn!(stream_id, "local connect to {} failed: {e}", self.target_addr);
                let _ = self
                    .session
                    .write_frame(Frame::stream(MessageType::StreamClose, stream_id, Bytes::new()))
                    .await;
                return;
            }
        };
        configure_socket_silent(&conn);

        let (read_half, write_half) = conn.into_split();
        let closed = CancellationToken::new();
        self.conns.insert(
            stream_id,
            LocalConn {
                writer: Arc::new(tokio::sync::Mutex::new(write_half)),
                closed: closed.clone(),
            },
        );
        self.session.metrics().stream_opened();
        info!(stream_id, "connected to {}", self.target_addr);

        let forwarder = self.clone();
        tokio::spawn(async move {
            forwarder.pipe_local_to_tunnel(stream_id, read_half, closed).await;
        });
    }

    /// Write tunnel payload to the mapped local connection. Unknown ids are
    /// dropped: the peer has already closed that stream.
    async fn write_local(&self, stream_id: u32, data: &[u8]) {
        let Some(writer) = self
            .conns
            .get(&stream_id)
            .map(|entry| Arc::clone(&entry.writer))
        else {
            debug!(stream_id, "data for unknown stream dropped");
            return;
        };

        let mut guard = writer.lock().await;
        if let Err(e) = guard.write_all(data).await {
            warn!(stream_id, "failed to write to local service: {e}");
            self.close_stream(stream_id);
            let _ = self
                .session
                .write_frame(Frame::stream(MessageType::StreamClose, stream_id, Bytes::new()))
                .await;
        }
    }

    /// Close and evict one stream's local connection. Idempotent.
    fn close_stream(&self, stream_id: u32) {
        if let Some((_, conn)) = self.conns.remove(&stream_id) {
            conn.closed.cancel();
            self.session.metrics().stream_closed();
            debug!(stream_id, "stream closed");
        }
    }

    /// Local service → tunnel frames, `StreamClose` after the final read.
    async fn pipe_local_to_tunnel(
        &self,
        stream_id: u32,
        mut conn: OwnedReadHalf,
        closed: CancellationToken,
    ) {
        let mut buf = vec![0u8; RELAY_BUF_SIZE];

        loop {
            let n = tokio::select! {
                () = closed.cancelled() => break,
                result = conn.read(&mut buf) => match result {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) => {
                        debug!(stream_id, "local read error: {e}");
                        break;
                    }
                },
            };

            let frame = Frame::stream(
                MessageType::StreamData,
                stream_id,
                Bytes::copy_from_slice(&buf[..n]),
            );
            if let Err(e) = self.session.write_frame(frame).await {
                debug!(stream_id, "failed to forward to tunnel: {e}");
                break;
            }
        }

        let _ = self
            .session
            .write_frame(Frame::stream(MessageType::StreamClose, stream_id, Bytes::new()))
            .await;
        self.close_stream(stream_id);
    }

    /// Drop every local connection. Used when the session ends.
    pub fn close(&self) {
        self.conns.retain(|_, conn| {
            conn.closed.cancel();
            false
        });
    }

    #[must_use]
    pub fn active_streams(&self) -> usize {
        self.conns.len()
    }
}

impl std::fmt::Debug for Forwarder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Forwarder")
            .field("target_addr", &self.target_addr)
            .field("active", &self.conns.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use porthole_protocol::TunnelCodec;
    use tokio::net::TcpListener;
    use tokio_util::codec::FramedRead;

    fn session_with_peer() -> (
        Session,
        FramedRead<tokio::io::ReadHalf<tokio::io::DuplexStream>, TunnelCodec>,
    ) {
        let (near, far) = tokio::io::duplex(64 * 1024);
        let (near_rd, near_wr) = tokio::io::split(near);
        let (far_rd, _far_wr) = tokio::io::split(far);
        let session = Session::new(near_rd, near_wr);
        let peer = FramedRead::new(far_rd, TunnelCodec::new());
        (session, peer)
    }

    #[tokio::test]
    async fn dial_failure_closes_only_that_stream() {
        let (session, mut peer) = session_with_peer();

        // Nothing listens here; grab a port and release it again.
        let unused = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = unused.local_addr().unwrap();
        drop(unused);

        let forwarder = Forwarder::new(session, addr.to_string());
        forwarder
            .handle_frame(Frame::stream(MessageType::StreamOpen, 1, Bytes::new()))
            .await;

        let frame = peer.next().await.unwrap().unwrap();
        assert_eq!(frame.msg_type, MessageType::StreamClose);
        assert_eq!(frame.stream_id, 1);
        assert_eq!(forwarder.active_streams(), 0);
    }

    #[tokio::test]
    async fn relays_local_bytes_and_closes_after_eof() {
        let (session, mut peer) = session_with_peer();

        // A local service that answers once and hangs up.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let n = conn.read(&mut buf).await.unwrap();
            conn.write_all(&buf[..n]).await.unwrap();
        });

        let forwarder = Forwarder::new(session, addr.to_string());
        forwarder
            .handle_frame(Frame::stream(MessageType::StreamOpen, 1, Bytes::new()))
            .await;
        forwarder
            .handle_frame(Frame::stream(
                MessageType::StreamData,
                1,
                Bytes::from_static(b"ping"),
            ))
            .await;

        let frame = peer.next().await.unwrap().unwrap();
        assert_eq!(frame.msg_type, MessageType::StreamData);
        assert_eq!(frame.payload, Bytes::from_static(b"ping"));

        let frame = peer.next().await.unwrap().unwrap();
        assert_eq!(frame.msg_type, MessageType::StreamClose);
    }

    #[tokio::test]
    async fn unknown_stream_data_is_dropped() {
        let (session, _peer) = session_with_peer();
        let forwarder = Forwarder::new(session, "127.0.0.1:1");

        // Must not panic, dial, or emit anything.
        forwarder
            .handle_frame(Frame::stream(
                MessageType::StreamData,
                99,
                Bytes::from_static(b"stray"),
            ))
            .await;
        assert_eq!(forwarder.active_streams(), 0);
    }
}
