//! TunnelMux Relay
//!
//! Bidirectional byte bridging between two duplex endpoints with
//! half-close propagation, plus the `Rewind` adapter used to hand bytes
//! that were read ahead of a protocol header back to the relay.

mod engine;
mod rewind;

pub use engine::{relay, DirectionOutcome, RelayOutcome, RELAY_BUFFER_SIZE};
pub use rewind::Rewind;
