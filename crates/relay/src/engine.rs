//! Relay engine
//!
//! Copies A → B and B → A concurrently. When one direction's source reaches
//! end-of-data or fails, that direction shuts down the write half of its
//! destination and stops; the opposite direction keeps running until its own
//! source finishes. `relay` returns once both directions are done.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use tunnelmux_core::TunnelError;

/// Transfer buffer per direction
pub const RELAY_BUFFER_SIZE: usize = 16 * 1024;

/// Result of one copy direction
#[derive(Debug, Default)]
pub struct DirectionOutcome {
    /// Bytes read from the source and fully written to the destination
    pub bytes: u64,
    /// Read or write failure that ended the direction, `None` on clean end-of-data
    pub error: Option<io::Error>,
}

/// Result of a completed relay
#[derive(Debug, Default)]
pub struct RelayOutcome {
    pub a_to_b: DirectionOutcome,
    pub b_to_a: DirectionOutcome,
}

impl RelayOutcome {
    pub fn total_bytes(&self) -> u64 {
        self.a_to_b.bytes + self.b_to_a.bytes
    }

    pub fn is_clean(&self) -> bool {
        self.a_to_b.error.is_none() && self.b_to_a.error.is_none()
    }

    /// First I/O failure observed, if any
    pub fn error(&self) -> Option<TunnelError> {
        self.a_to_b
            .error
            .as_ref()
            .or(self.b_to_a.error.as_ref())
            .map(|e| TunnelError::RelayIo(e.to_string()))
    }
}

/// Bridge two duplex endpoints until both directions complete.
///
/// No payload inspection, no idle timeout. Byte order within a direction is
/// preserved.
pub async fn relay<A, B>(a: A, b: B) -> RelayOutcome
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    let (a_to_b, b_to_a) = tokio::join!(
        copy_half("a->b", &mut a_read, &mut b_write),
        copy_half("b->a", &mut b_read, &mut a_write),
    );

    RelayOutcome { a_to_b, b_to_a }
}

async fn copy_half<R, W>(direction: &'static str, reader: &mut R, writer: &mut W) -> DirectionOutcome
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    let mut bytes = 0u64;

    let error = loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break None,
            Ok(n) => n,
            Err(e) => break Some(e),
        };
        if let Err(e) = writer.write_all(&buf[..n]).await {
            break Some(e);
        }
        bytes += n as u64;
    };

    // Signal end-of-data downstream; the other direction is left alone.
    if let Err(e) = writer.shutdown().await {
        trace!("{} shutdown after {} bytes failed: {}", direction, bytes, e);
    }

    match &error {
        None => trace!("{} finished after {} bytes", direction, bytes),
        Some(e) => trace!("{} aborted after {} bytes: {}", direction, bytes, e),
    }

    DirectionOutcome { bytes, error }
}
