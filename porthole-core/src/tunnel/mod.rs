pub mod client;
pub mod forwarder;
pub mod listener;
pub mod router;
pub mod server;
pub mod session;

pub use client::{TunnelClient, TunnelInfo};
pub use router::Router;
pub use server::TunnelServer;
pub use session::{Session, SessionState};
