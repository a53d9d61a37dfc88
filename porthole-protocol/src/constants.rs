//! Protocol constants

use std::time::Duration;

/// Current (and only) protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Frame header size: version (1) + type (1) + stream id (4) + length (4).
pub const HEADER_SIZE: usize = 10;

/// Maximum payload size per frame (16 MiB). Frames declaring more are
/// rejected before the payload is read.
pub const MAX_PAYLOAD_SIZE: u32 = 16 * 1024 * 1024;

/// Interval between outbound heartbeat frames.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// Idle budget before the watchdog expires a session. Tolerates three
/// missed heartbeats.
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(30);
