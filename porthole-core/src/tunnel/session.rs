//! Session state machine
//!
//! One `Session` is one end of one control connection after transport
//! establishment. It owns the framed read/write halves, the stream table,
//! the liveness timers and the closure signal. The handle is cheap to clone;
//! clones share the same underlying session.
//!
//! State machine: `Init → Handshaken → Authenticated`, advanced on the read
//! path by the frames a peer observes. The machine is symmetric: a server
//! advances on inbound `Handshake`/`Auth`, a client on inbound
//! `HandshakeAck`/`AuthOk`. Traffic in the wrong state surfaces as
//! `HandshakeRequired` or `AuthRequired` from `read_frame`.

use crate::auth::{NonEmptyToken, TokenValidator};
use crate::metrics::Metrics;
use crate::stream::StreamManager;
use futures::{SinkExt, StreamExt};
use porthole_common::{Result, TunnelError};
use porthole_protocol::auth::Auth;
use porthole_protocol::constants::{
    HEADER_SIZE, HEARTBEAT_INTERVAL, HEARTBEAT_TIMEOUT, PROTOCOL_VERSION,
};
use porthole_protocol::handshake::{negotiate, Handshake};
use porthole_protocol::{Capability, Frame, MessageType, PeerRole, ProtocolError, TunnelCodec};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::interval;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

type Reader = FramedRead<Box<dyn AsyncRead + Send + Unpin>, TunnelCodec>;
type Writer = FramedWrite<Box<dyn AsyncWrite + Send + Unpin>, TunnelCodec>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Init,
    Handshaken,
    Authenticated,
}

#[derive(Debug)]
struct Meta {
    state: SessionState,
    role: Option<PeerRole>,
    capabilities: Capability,
    expose_addr: String,
    public_port: Option<u16>,
}

/// One end of one control connection.
#[derive(Clone)]
pub struct Session {
    reader: Arc<tokio::sync::Mutex<Reader>>,
    writer: Arc<tokio::sync::Mutex<Writer>>,
    meta: Arc<Mutex<Meta>>,
    last_seen: Arc<Mutex<Instant>>,
    local_caps: Capability,
    validator: Arc<dyn TokenValidator>,
    streams: StreamManager,
    closed: CancellationToken,
    metrics: Arc<Metrics>,
}

impl Session {
    /// Build a session over an opaque byte-stream pair. Whether the pair is
    /// plaintext TCP or TLS is the caller's business.
    pub fn new(
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        let reader: Box<dyn AsyncRead + Send + Unpin> = Box::new(reader);
        let writer: Box<dyn AsyncWrite + Send + Unpin> = Box::new(writer);

        Self {
            reader: Arc::new(tokio::sync::Mutex::new(FramedRead::new(
                reader,
                TunnelCodec::new(),
            ))),
            writer: Arc::new(tokio::sync::Mutex::new(FramedWrite::new(
                writer,
                TunnelCodec::new(),
            ))),
            meta: Arc::new(Mutex::new(Meta {
                state: SessionState::Init,
                role: None,
                capabilities: Capability::empty(),
                expose_addr: String::new(),
                public_port: None,
            })),
            last_seen: Arc::new(Mutex::new(Instant::now())),
            local_caps: Capability::HEARTBEAT,
            validator: Arc::new(NonEmptyToken),
            streams: StreamManager::new(),
            closed: CancellationToken::new(),
            metrics: Arc::new(Metrics::new()),
        }
    }

    /// Capabilities this peer advertises and negotiates against.
    #[must_use]
    pub fn with_capabilities(mut self, caps: Capability) -> Self {
        self.local_caps = caps;
        self
    }

    #[must_use]
    pub fn with_token_validator(mut self, validator: Arc<dyn TokenValidator>) -> Self {
        self.validator = validator;
        self
    }

    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Read one frame, refresh liveness, and advance the state machine.
    ///
    /// Returns `SessionExpired` once the closure signal has tripped, even
    /// for a read already parked on the transport.
    pub async fn read_frame(&self) -> Result<Frame> {
        if self.closed.is_cancelled() {
            return Err(ProtocolError::SessionExpired.into());
        }

        let mut reader = self.reader.lock().await;
        let frame = tokio::select! {
            () = self.closed.cancelled() => return Err(ProtocolError::SessionExpired.into()),
            result = reader.next() => match result {
                Some(Ok(frame)) => frame,
                Some(Err(e)) => return Err(e.into()),
                None => return Err(TunnelError::Connection("connection closed by peer".into())),
            },
        };
        drop(reader);

        self.touch();
        self.metrics
            .add_bytes_received((HEADER_SIZE + frame.payload.len()) as u64);
        self.advance(&frame)?;
        Ok(frame)
    }

    /// Write one frame. Whole frames are serialized under the write lock;
    /// at most one writer completes a frame at a time.
    pub async fn write_frame(&self, mut frame: Frame) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(ProtocolError::SessionExpired.into());
        }

        frame.version = PROTOCOL_VERSION;
        let wire_bytes = (HEADER_SIZE + frame.payload.len()) as u64;

        let mut writer = self.writer.lock().await;
        tokio::select! {
            () = self.closed.cancelled() => return Err(ProtocolError::SessionExpired.into()),
            result = writer.send(frame) => result?,
        }
        drop(writer);

        self.metrics.add_bytes_sent(wire_bytes);
        Ok(())
    }

    /// Dispatch one frame in the authenticated state, server side. The
    /// client routes these to its forwarder instead.
    pub async fn handle_frame(&self, frame: Frame) -> Result<()> {
        match frame.msg_type {
            MessageType::StreamOpen => {
                // Streams originate on the public side only.
                warn!(stream_id = frame.stream_id, "peer-initiated stream rejected");
            }
            MessageType::StreamData => {
                // A close legitimately races in-flight data from the other
                // side, so an unknown id is dropped, not fatal.
                if !self.streams.push(frame.stream_id, frame.payload).await {
                    debug!(stream_id = frame.stream_id, "data for unknown stream dropped");
                }
            }
            MessageType::StreamClose => {
                self.streams.close(frame.stream_id);
            }
            _ => {}
        }
        Ok(())
    }

    fn advance(&self, frame: &Frame) -> Result<()> {
        match self.state() {
            SessionState::Init => match frame.msg_type {
                MessageType::Handshake => self.process_handshake(frame),
                MessageType::HandshakeAck => self.process_handshake_ack(frame),
                _ => Err(ProtocolError::HandshakeRequired.into()),
            },
            SessionState::Handshaken => match frame.msg_type {
                MessageType::Auth => self.process_auth(frame),
                MessageType::AuthOk => {
                    self.enter_authenticated();
                    Ok(())
                }
                MessageType::AuthErr => Err(ProtocolError::AuthFailed.into()),
                _ => Err(ProtocolError::AuthRequired.into()),
            },
            SessionState::Authenticated => match frame.msg_type {
                MessageType::Handshake | MessageType::Auth => Err(TunnelError::InvalidState(
                    "handshake traffic after authentication".into(),
                )),
                _ => Ok(()),
            },
        }
    }

    /// Inbound `Handshake` (server side): store the peer's identity and the
    /// negotiated capability intersection.
    fn process_handshake(&self, frame: &Frame) -> Result<()> {
        let hs = Handshake::decode(&frame.payload)?;
        let negotiated = negotiate(self.local_caps, hs.capabilities)?;

        let mut meta = self.lock_meta();
        meta.role = Some(hs.role);
        meta.capabilities = negotiated;
        meta.expose_addr = hs.expose_addr;
        meta.state = SessionState::Handshaken;
        Ok(())
    }

    /// Inbound `HandshakeAck` (client side): the ack carries the server's
    /// own handshake payload so both peers compute the same intersection.
    fn process_handshake_ack(&self, frame: &Frame) -> Result<()> {
        let hs = Handshake::decode(&frame.payload)?;
        let negotiated = negotiate(self.local_caps, hs.capabilities)?;

        let mut meta = self.lock_meta();
        meta.role = Some(hs.role);
        meta.capabilities = negotiated;
        meta.state = SessionState::Handshaken;
        Ok(())
    }

    /// Inbound `Auth` (server side): consult the token policy.
    fn process_auth(&self, frame: &Frame) -> Result<()> {
        let auth = Auth::decode(&frame.payload)?;
        if !self.validator.validate(&auth.token) {
            return Err(ProtocolError::AuthFailed.into());
        }
        self.enter_authenticated();
        Ok(())
    }

    fn enter_authenticated(&self) {
        let caps = {
            let mut meta = self.lock_meta();
            meta.state = SessionState::Authenticated;
            meta.capabilities
        };

        if caps.contains(Capability::HEARTBEAT) {
            self.start_heartbeat();
        }
    }

    /// Start the heartbeat sender and the watchdog. Both stop when the
    /// closure signal trips.
    fn start_heartbeat(&self) {
        self.touch();

        let session = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(HEARTBEAT_INTERVAL);
            ticker.tick().await; // the first tick is immediate
            loop {
                tokio::select! {
                    () = session.closed.cancelled() => break,
                    _ = ticker.tick() => {
                        if session.write_frame(Frame::heartbeat()).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        let session = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(HEARTBEAT_INTERVAL);
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = session.closed.cancelled() => break,
                    _ = ticker.tick() => {
                        if session.idle_time() > HEARTBEAT_TIMEOUT {
                            warn!("no frames for {HEARTBEAT_TIMEOUT:?}, expiring session");
                            session.closed.cancel();
                            break;
                        }
                    }
                }
            }
        });
    }

    /// Close the session. Idempotent; only the first caller performs
    /// teardown. The transport halves are dropped with the last handle, so
    /// closing the underlying sockets stays the caller's responsibility.
    pub async fn close(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();

        // Let an in-flight write finish before the streams go away.
        drop(self.writer.lock().await);
        self.streams.close_all();
    }

    fn touch(&self) {
        *self.lock(&self.last_seen) = Instant::now();
    }

    fn idle_time(&self) -> Duration {
        self.lock(&self.last_seen).elapsed()
    }

    fn lock_meta(&self) -> MutexGuard<'_, Meta> {
        self.lock(&self.meta)
    }

    fn lock<'a, T>(&self, mutex: &'a Mutex<T>) -> MutexGuard<'a, T> {
        mutex.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.lock_meta().state
    }

    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.state() == SessionState::Authenticated
    }

    /// The peer's role, known after the handshake.
    #[must_use]
    pub fn peer_role(&self) -> Option<PeerRole> {
        self.lock_meta().role
    }

    /// Negotiated capability intersection, empty before the handshake.
    #[must_use]
    pub fn capabilities(&self) -> Capability {
        self.lock_meta().capabilities
    }

    /// The client's local target address, as announced in the handshake.
    #[must_use]
    pub fn expose_addr(&self) -> String {
        self.lock_meta().expose_addr.clone()
    }

    #[must_use]
    pub fn public_port(&self) -> Option<u16> {
        self.lock_meta().public_port
    }

    pub fn set_public_port(&self, port: u16) {
        self.lock_meta().public_port = Some(port);
    }

    #[must_use]
    pub fn streams(&self) -> &StreamManager {
        &self.streams
    }

    #[must_use]
    pub fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.metrics)
    }

    /// The session's closure signal. Tripping it (close, watchdog, external
    /// cancellation) unwinds every task observing the session.
    #[must_use]
    pub fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.state())
            .field("streams", &self.streams.len())
            .field("closed", &self.closed.is_cancelled())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::{Bytes, BytesMut};
    use tokio::io::{AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
    use tokio_util::codec::Encoder;

    fn session_pair() -> (Session, ReadHalf<DuplexStream>, WriteHalf<DuplexStream>) {
        let (near, far) = tokio::io::duplex(64 * 1024);
        let (near_rd, near_wr) = tokio::io::split(near);
        let (far_rd, far_wr) = tokio::io::split(far);
        (Session::new(near_rd, near_wr), far_rd, far_wr)
    }

    async fn send_raw(writer: &mut WriteHalf<DuplexStream>, frame: Frame) {
        let mut buf = BytesMut::new();
        TunnelCodec::new().encode(frame, &mut buf).unwrap();
        writer.write_all(&buf).await.unwrap();
    }

    fn client_hello() -> Frame {
        let hs = Handshake::new(PeerRole::Client, Capability::HEARTBEAT, "localhost:6001");
        Frame::control(MessageType::Handshake, hs.encode())
    }

    fn auth(token: &str) -> Frame {
        Frame::control(MessageType::Auth, Auth::encode(token))
    }

    #[tokio::test]
    async fn handshake_is_enforced() {
        let (session, _rd, mut wr) = session_pair();

        send_raw(
            &mut wr,
            Frame::stream(MessageType::StreamData, 1, Bytes::from_static(b"data")),
        )
        .await;

        let err = session.read_frame().await.unwrap_err();
        assert!(matches!(
            err,
            TunnelError::Protocol(ProtocolError::HandshakeRequired)
        ));
    }

    #[tokio::test]
    async fn auth_is_enforced() {
        let (session, _rd, mut wr) = session_pair();

        send_raw(&mut wr, client_hello()).await;
        session.read_frame().await.unwrap();
        assert_eq!(session.state(), SessionState::Handshaken);

        send_raw(
            &mut wr,
            Frame::stream(MessageType::StreamData, 1, Bytes::from_static(b"data")),
        )
        .await;

        let err = session.read_frame().await.unwrap_err();
        assert!(matches!(
            err,
            TunnelError::Protocol(ProtocolError::AuthRequired)
        ));
    }

    #[tokio::test]
    async fn handshake_stores_peer_identity() {
        let (session, _rd, mut wr) = session_pair();

        send_raw(&mut wr, client_hello()).await;
        let frame = session.read_frame().await.unwrap();

        assert_eq!(frame.msg_type, MessageType::Handshake);
        assert_eq!(session.state(), SessionState::Handshaken);
        assert_eq!(session.peer_role(), Some(PeerRole::Client));
        assert_eq!(session.capabilities(), Capability::HEARTBEAT);
        assert_eq!(session.expose_addr(), "localhost:6001");
    }

    #[tokio::test]
    async fn incompatible_capabilities_fail_the_handshake() {
        let (session, _rd, mut wr) = session_pair();

        let hs = Handshake::new(PeerRole::Client, Capability::METRICS, "");
        send_raw(&mut wr, Frame::control(MessageType::Handshake, hs.encode())).await;

        let err = session.read_frame().await.unwrap_err();
        assert!(matches!(
            err,
            TunnelError::Protocol(ProtocolError::IncompatiblePeers)
        ));
    }

    #[tokio::test]
    async fn full_establishment_reaches_authenticated() {
        let (session, _rd, mut wr) = session_pair();

        send_raw(&mut wr, client_hello()).await;
        session.read_frame().await.unwrap();
        send_raw(&mut wr, auth("dev-token")).await;
        session.read_frame().await.unwrap();

        assert!(session.is_authenticated());
    }

    #[tokio::test]
    async fn token_policy_rejects() {
        let (near, far) = tokio::io::duplex(64 * 1024);
        let (near_rd, near_wr) = tokio::io::split(near);
        let (_far_rd, mut far_wr) = tokio::io::split(far);

        let session = Session::new(near_rd, near_wr)
            .with_token_validator(Arc::new(crate::auth::SharedToken::new("s3cret")));

        send_raw(&mut far_wr, client_hello()).await;
        session.read_frame().await.unwrap();
        send_raw(&mut far_wr, auth("wrong")).await;

        let err = session.read_frame().await.unwrap_err();
        assert!(matches!(
            err,
            TunnelError::Protocol(ProtocolError::AuthFailed)
        ));
    }

    #[tokio::test]
    async fn duplicate_handshake_is_a_violation() {
        let (session, _rd, mut wr) = session_pair();

        send_raw(&mut wr, client_hello()).await;
        session.read_frame().await.unwrap();
        send_raw(&mut wr, auth("dev-token")).await;
        session.read_frame().await.unwrap();

        send_raw(&mut wr, client_hello()).await;
        let err = session.read_frame().await.unwrap_err();
        assert!(matches!(err, TunnelError::InvalidState(_)));
    }

    #[tokio::test]
    async fn unknown_types_are_ignored_once_authenticated() {
        let (session, _rd, mut wr) = session_pair();

        send_raw(&mut wr, client_hello()).await;
        session.read_frame().await.unwrap();
        send_raw(&mut wr, auth("dev-token")).await;
        session.read_frame().await.unwrap();

        send_raw(
            &mut wr,
            Frame::control(MessageType::Unknown(42), Bytes::from_static(b"future")),
        )
        .await;
        let frame = session.read_frame().await.unwrap();
        assert_eq!(frame.msg_type, MessageType::Unknown(42));
    }

    #[tokio::test]
    async fn closed_session_refuses_io() {
        let (session, _rd, _wr) = session_pair();
        session.close().await;

        let err = session.read_frame().await.unwrap_err();
        assert!(err.is_session_expired());

        let err = session.write_frame(Frame::heartbeat()).await.unwrap_err();
        assert!(err.is_session_expired());
    }

    #[tokio::test]
    async fn close_unblocks_a_parked_reader() {
        let (session, _rd, _wr) = session_pair();

        let reader = session.clone();
        let parked = tokio::spawn(async move { reader.read_frame().await });

        tokio::task::yield_now().await;
        session.close().await;

        let err = parked.await.unwrap().unwrap_err();
        assert!(err.is_session_expired());
    }

    #[tokio::test(start_paused = true)]
    async fn watchdog_expires_an_idle_session() {
        let (session, _rd, mut wr) = session_pair();

        // Drive the client-side transitions: ack then auth-ok, after which
        // the heartbeat and watchdog are running with no live peer.
        let server_hello = Handshake::new(
            PeerRole::Server,
            Capability::HEARTBEAT | Capability::RECONNECT,
            "",
        );
        send_raw(
            &mut wr,
            Frame::control(MessageType::HandshakeAck, server_hello.encode()),
        )
        .await;
        session.read_frame().await.unwrap();
        send_raw(&mut wr, Frame::control(MessageType::AuthOk, Bytes::new())).await;
        session.read_frame().await.unwrap();
        assert!(session.is_authenticated());

        // Nothing arrives for more than the 30s idle budget.
        let result = tokio::time::timeout(Duration::from_secs(60), session.read_frame()).await;
        let err = result.expect("watchdog should have fired").unwrap_err();
        assert!(err.is_session_expired());
    }
}
