pub mod auth;
pub mod httplog;
pub mod metrics;
pub mod reconnect;
pub mod stream;
pub mod transport;
pub mod tunnel;

// Re-export specific items for convenience
pub use metrics::Metrics;
pub use tunnel::client::TunnelClient;
pub use tunnel::server::TunnelServer;
pub use tunnel::session::Session;
