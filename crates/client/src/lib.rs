//! TunnelMux Client
//!
//! Local SOCKS5 front-end and the client side of the tunnel session.
//!
//! ## Features
//!
//! - SOCKS5 CONNECT (no authentication) on a local TCP listener
//! - One tunnel stream per local connection, opened on a shared session
//! - Session supervision with a pluggable reconnect policy

mod reconnect;
mod session;
mod socks5;

pub use reconnect::{policy_from_retries, ExponentialBackoff, FixedRetries, NeverReconnect, ReconnectPolicy};
pub use session::{SessionHandle, SessionSupervisor};
pub use socks5::{handle_socks5_connection, Socks5Server, Socks5State};

use std::net::SocketAddr;

use thiserror::Error;
use tunnelmux_core::TunnelError;
use tunnelmux_network::NetworkError;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Failed to bind SOCKS5 listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] TunnelError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Reconnect gave up after {0} attempts")]
    ReconnectExhausted(u32),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ClientError>;
