//! TunnelMux Network
//!
//! The tunnel session abstraction and its transports.
//!
//! ## Features
//!
//! - `TunnelSession`: one long-lived secure multiplexed connection;
//!   stream open/accept are safe to call concurrently without locking
//! - libp2p binding: TCP secured with Noise, multiplexed with yamux,
//!   one substream per tunnel stream (libp2p-stream)
//! - Peer pinning via `<peer_id>@<multiaddr>` remote addresses
//! - In-memory binding for running both ends in one process

mod addr;
pub mod memory;
mod p2p;
mod session;

pub use addr::{parse_multiaddr, socket_to_multiaddr, RemoteAddr};
pub use p2p::{
    Libp2pAcceptor, Libp2pDialer, Libp2pSession, Libp2pTransport, SecurityParams,
    DEFAULT_CONNECT_TIMEOUT, DEFAULT_PROTOCOL_ID,
};
pub use session::{
    SessionAcceptor, SessionDialer, SessionSignal, TunnelIo, TunnelSession, TunnelStream,
};

// Re-export commonly used libp2p types
pub use libp2p::{identity::Keypair, Multiaddr, PeerId};

use std::time::Duration;

use thiserror::Error;
use tunnelmux_core::TunnelError;

#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Dial failed: {0}")]
    DialFailed(String),

    #[error("Listen failed: {0}")]
    ListenFailed(String),

    #[error("Listener closed")]
    ListenerClosed,

    #[error("Stream open failed: {0}")]
    StreamOpenFailed(String),

    #[error("Session terminated")]
    SessionTerminated,

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Invalid protocol id: {0}")]
    InvalidProtocol(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),
}

impl From<NetworkError> for TunnelError {
    fn from(err: NetworkError) -> Self {
        match err {
            NetworkError::SessionTerminated => TunnelError::SessionTerminated,
            NetworkError::StreamOpenFailed(reason) => TunnelError::StreamOpenFailed(reason),
            other => TunnelError::StreamOpenFailed(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, NetworkError>;
