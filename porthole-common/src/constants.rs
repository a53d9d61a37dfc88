//! Default addresses and ports for Porthole.
//!
//! Use these constants instead of magic numbers so defaults stay consistent
//! across the library and the CLI.

/// Default bind address for the tunnel control channel.
pub const DEFAULT_CONTROL_BIND: &str = "0.0.0.0:9000";

/// Default server address a client connects to.
pub const DEFAULT_SERVER_ADDR: &str = "localhost:9000";

/// First public port the server hands out to authenticated sessions.
pub const DEFAULT_START_PORT: u16 = 10_000;

/// Development default for the shared bearer token.
pub const DEFAULT_TOKEN: &str = "dev-token";
