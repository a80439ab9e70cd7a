//! TunnelMux Exit Node
//!
//! Terminates tunnel sessions and completes each stream's connection to its
//! real destination.
//!
//! ## Responsibilities
//!
//! 1. Accept sessions from a transport listener
//! 2. Accept streams on every session, one task per stream
//! 3. Read the `host:port\n` header and dial the destination
//! 4. Relay the stream and the destination until both directions finish

mod handler;
mod stats;
mod tunnel_handler;

pub use handler::{serve_session, ExitConfig, ExitServer};
pub use stats::{ExitStats, ExitStatsSnapshot};
pub use tunnel_handler::dispatch_stream;

use thiserror::Error;
use tunnelmux_core::TunnelError;
use tunnelmux_network::NetworkError;

#[derive(Error, Debug)]
pub enum ExitError {
    #[error("Tunnel error: {0}")]
    Tunnel(#[from] TunnelError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),
}

pub type Result<T> = std::result::Result<T, ExitError>;
