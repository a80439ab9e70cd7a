//! Per-stream egress
//!
//! Reads the destination header off a freshly accepted stream, dials the
//! destination over TCP and relays until both directions finish. A failed
//! dial closes the stream without writing anything back.

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::debug;

use tunnelmux_core::{read_tunnel_header, TunnelError};
use tunnelmux_network::TunnelStream;
use tunnelmux_relay::{relay, RelayOutcome, Rewind};

use crate::{ExitConfig, ExitError, ExitStats, Result};

/// Handle one inbound tunnel stream end to end
pub async fn dispatch_stream(
    mut stream: TunnelStream,
    config: &ExitConfig,
    stats: &ExitStats,
) -> Result<RelayOutcome> {
    let stream_id = stream.id();
    let (target, surplus) = read_tunnel_header(&mut stream).await?;
    let addr = target.dial_addr();
    debug!("Stream {} opening tunnel to {}", stream_id, addr);

    let dialed = tokio::time::timeout(config.dial_timeout, TcpStream::connect(&addr))
        .await
        .map_err(|_| {
            TunnelError::DestinationDialFailed(format!(
                "{}: timed out after {:?}",
                addr, config.dial_timeout
            ))
        })
        .and_then(|r| r.map_err(|e| TunnelError::DestinationDialFailed(format!("{}: {}", addr, e))))
        .map_err(ExitError::from);

    let destination = match dialed {
        Ok(destination) => destination,
        Err(e) => {
            stats.dial_failed();
            let _ = stream.shutdown().await;
            return Err(e);
        }
    };
    let _ = destination.set_nodelay(true);

    // Payload that arrived with the header goes out first
    let outcome = relay(Rewind::new(stream, surplus), destination).await;
    stats.relay_completed(&outcome);
    debug!(
        "Stream {} to {} finished: {} bytes up, {} bytes down",
        stream_id, addr, outcome.a_to_b.bytes, outcome.b_to_a.bytes
    );
    if let Some(e) = outcome.error() {
        debug!("Stream {} to {} ended on error: {}", stream_id, addr, e);
    }
    Ok(outcome)
}
