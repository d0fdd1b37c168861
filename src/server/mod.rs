//! RPC surface: framed TCP protocol, access control, listener.

pub mod acl;
pub mod codec;
pub mod network;
pub mod protocol;

pub use network::{serve, serve_listener};
