//! Socket tuning for relay performance
//!
//! Applied to every control and public connection:
//! - `TCP_NODELAY`: small frames (heartbeats, stream opens) must not wait
//!   for Nagle
//! - larger buffers: sustained relay throughput
//! - keepalive: detect dead peers between heartbeats

use socket2::SockRef;
use std::io;
use std::time::Duration;
use tokio::net::TcpStream;

const RECV_BUFFER_SIZE: usize = 1024 * 1024;
const SEND_BUFFER_SIZE: usize = 1024 * 1024;
const KEEPALIVE_TIME: Duration = Duration::from_secs(30);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);

pub fn configure_socket(stream: &TcpStream) -> io::Result<()> {
    stream.set_nodelay(true)?;

    let socket = SockRef::from(stream);

    socket.set_recv_buffer_size(RECV_BUFFER_SIZE)?;
    socket.set_send_buffer_size(SEND_BUFFER_SIZE)?;

    let keepalive = socket2::TcpKeepalive::new()
        .with_time(KEEPALIVE_TIME)
        .with_interval(KEEPALIVE_INTERVAL);
    socket.set_tcp_keepalive(&keepalive)?;

    Ok(())
}

pub fn configure_socket_silent(stream: &TcpStream) {
    let _ = configure_socket(stream);
}
