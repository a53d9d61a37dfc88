//! Common utilities and types for Porthole

pub mod config;
pub mod constants;
pub mod error;

pub use config::ReconnectConfig;
pub use constants::{
    DEFAULT_CONTROL_BIND, DEFAULT_SERVER_ADDR, DEFAULT_START_PORT, DEFAULT_TOKEN,
};
pub use error::{Result, TunnelError};
