//! Porthole wire protocol
//!
//! This crate defines the binary protocol spoken between Porthole clients
//! and servers: a length-delimited frame layout, the session establishment
//! payloads (handshake, auth, bind), and the capability bitfield negotiated
//! during the handshake.

pub mod auth;
pub mod codec;
pub mod constants;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod types;

pub use auth::Auth;
pub use codec::TunnelCodec;
pub use error::ProtocolError;
pub use frame::Frame;
pub use handshake::{negotiate, Handshake};
pub use types::{Capability, MessageType, PeerRole};
