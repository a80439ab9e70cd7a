//! Tunnel session abstraction
//!
//! A session is one secure multiplexed connection to a remote peer. Many
//! independent byte streams are opened and accepted over it. Once a session
//! terminates it never becomes usable again; callers discard it and dial a
//! new one.

use std::any::Any;
use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_util::sync::CancellationToken;

use crate::Result;

/// Byte channel usable as a tunnel stream
pub trait TunnelIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> TunnelIo for T {}

static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(1);

/// One bidirectional, independently closable channel over a session.
///
/// `shutdown()` closes the write half only; reads continue until the peer
/// closes its own write half.
pub struct TunnelStream {
    id: u64,
    io: Box<dyn TunnelIo>,
    _retain: Option<Box<dyn Any + Send>>,
}

impl TunnelStream {
    pub fn new(io: impl TunnelIo + 'static) -> Self {
        Self {
            id: NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed),
            io: Box::new(io),
            _retain: None,
        }
    }

    /// Keep `guard` alive for as long as the stream exists
    pub(crate) fn retain(mut self, guard: impl Any + Send) -> Self {
        self._retain = Some(Box::new(guard));
        self
    }

    /// Process-unique identifier, for logging
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl fmt::Debug for TunnelStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelStream").field("id", &self.id).finish()
    }
}

impl AsyncRead for TunnelStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for TunnelStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut *self.io).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.io).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.io).poll_shutdown(cx)
    }
}

/// Shared secure multiplexed connection.
///
/// All methods take `&self` and may be called from many tasks at once.
#[async_trait]
pub trait TunnelSession: Send + Sync {
    /// Identity of the remote peer, for logging
    fn remote_id(&self) -> String;

    /// Open a new outbound stream.
    ///
    /// Fails with `SessionTerminated` once the session is gone.
    async fn open_stream(&self) -> Result<TunnelStream>;

    /// Wait for the next stream opened by the peer.
    ///
    /// Returns `SessionTerminated` when the session closes; no stream is
    /// accepted after that.
    async fn accept_stream(&self) -> Result<TunnelStream>;

    /// Tear the session down. Streams in flight observe an error or
    /// end-of-data.
    fn close(&self);

    fn is_closed(&self) -> bool;

    /// Resolves once the session has terminated for any reason
    async fn closed(&self);
}

/// Source of inbound sessions, one per connected peer
#[async_trait]
pub trait SessionAcceptor: Send {
    async fn accept(&mut self) -> Result<Arc<dyn TunnelSession>>;

    /// Address the acceptor is bound to
    fn local_addr(&self) -> String;
}

/// Establishes outbound sessions against a fixed remote.
///
/// Captures the remote address and security parameters so a supervisor can
/// redial without knowing which transport is in use.
#[async_trait]
pub trait SessionDialer: Send + Sync {
    async fn dial(&self) -> Result<Arc<dyn TunnelSession>>;

    /// Human-readable remote description
    fn remote(&self) -> String;
}

/// Termination flag shared by a session and everything depending on it
#[derive(Debug, Clone, Default)]
pub struct SessionSignal {
    token: CancellationToken,
}

impl SessionSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn terminate(&self) {
        self.token.cancel();
    }

    pub fn is_terminated(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn terminated(&self) {
        self.token.cancelled().await
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.token
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_tunnel_stream_delegates_io() {
        let (a, b) = tokio::io::duplex(64);
        let mut a = TunnelStream::new(a);
        let mut b = TunnelStream::new(b);
        assert_ne!(a.id(), b.id());

        a.write_all(b"ping").await.unwrap();
        a.shutdown().await.unwrap();

        let mut out = Vec::new();
        b.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"ping");
    }

    #[tokio::test]
    async fn test_signal_wakes_waiters() {
        let signal = SessionSignal::new();
        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.terminated().await })
        };

        assert!(!signal.is_terminated());
        signal.terminate();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
        assert!(signal.is_terminated());
    }
}
