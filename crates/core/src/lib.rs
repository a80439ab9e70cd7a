//! TunnelMux Core Types
//!
//! Destination descriptors and the two wire forms they travel in:
//! the SOCKS5 address block spoken to local applications and the
//! `host:port\n` header written at the start of every tunnel stream.

mod error;
mod socks;
mod tunnel;

pub use error::*;
pub use socks::*;
pub use tunnel::*;
