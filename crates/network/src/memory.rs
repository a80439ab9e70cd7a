//! In-process tunnel sessions
//!
//! Both ends live in the same process and exchange `tokio::io::duplex`
//! pipes instead of network substreams. Used to run the SOCKS5 front-end
//! and the egress dispatcher against each other without sockets, and to
//! inject session failures deterministically.

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::FutureExt;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::WaitForCancellationFutureOwned;
use tracing::debug;

use crate::{
    NetworkError, Result, SessionAcceptor, SessionDialer, SessionSignal, TunnelSession,
    TunnelStream,
};

/// Per-stream pipe capacity
const PIPE_CAPACITY: usize = 64 * 1024;

/// Create a connected dialer/acceptor pair.
///
/// Every `dial` yields a fresh session pair; the acceptor receives the
/// server end.
pub fn memory_transport(name: &str) -> (MemoryDialer, MemoryAcceptor) {
    let (tx, rx) = mpsc::unbounded_channel();
    let dialer = MemoryDialer {
        name: name.to_string(),
        sessions: tx,
        dials: Arc::new(AtomicUsize::new(0)),
    };
    let acceptor = MemoryAcceptor {
        name: name.to_string(),
        sessions: rx,
    };
    (dialer, acceptor)
}

/// Create one connected session pair directly, without an acceptor
pub fn memory_session_pair(name: &str) -> (Arc<MemorySession>, Arc<MemorySession>) {
    let signal = SessionSignal::new();
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();

    let client = Arc::new(MemorySession {
        remote: format!("{}/server", name),
        outbound: b_tx,
        inbound: Mutex::new(a_rx),
        signal: signal.clone(),
    });
    let server = Arc::new(MemorySession {
        remote: format!("{}/client", name),
        outbound: a_tx,
        inbound: Mutex::new(b_rx),
        signal,
    });
    (client, server)
}

#[derive(Clone)]
pub struct MemoryDialer {
    name: String,
    sessions: mpsc::UnboundedSender<Arc<dyn TunnelSession>>,
    dials: Arc<AtomicUsize>,
}

impl MemoryDialer {
    /// Number of dial attempts made so far
    pub fn dial_count(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionDialer for MemoryDialer {
    async fn dial(&self) -> Result<Arc<dyn TunnelSession>> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        let (client, server) = memory_session_pair(&self.name);
        self.sessions
            .send(server)
            .map_err(|_| NetworkError::DialFailed(format!("{}: listener closed", self.name)))?;
        debug!("Memory session dialed on {}", self.name);
        Ok(client)
    }

    fn remote(&self) -> String {
        format!("memory://{}", self.name)
    }
}

pub struct MemoryAcceptor {
    name: String,
    sessions: mpsc::UnboundedReceiver<Arc<dyn TunnelSession>>,
}

#[async_trait]
impl SessionAcceptor for MemoryAcceptor {
    async fn accept(&mut self) -> Result<Arc<dyn TunnelSession>> {
        self.sessions.recv().await.ok_or(NetworkError::ListenerClosed)
    }

    fn local_addr(&self) -> String {
        format!("memory://{}", self.name)
    }
}

/// One end of an in-process session
pub struct MemorySession {
    remote: String,
    outbound: mpsc::UnboundedSender<DuplexStream>,
    inbound: Mutex<mpsc::UnboundedReceiver<DuplexStream>>,
    signal: SessionSignal,
}

impl MemorySession {
    fn wrap(&self, pipe: DuplexStream) -> TunnelStream {
        TunnelStream::new(MemoryStream {
            pipe,
            closed: Box::pin(self.signal.token().clone().cancelled_owned()),
            terminated: false,
        })
    }
}

#[async_trait]
impl TunnelSession for MemorySession {
    fn remote_id(&self) -> String {
        self.remote.clone()
    }

    async fn open_stream(&self) -> Result<TunnelStream> {
        if self.signal.is_terminated() {
            return Err(NetworkError::SessionTerminated);
        }
        let (local, remote) = tokio::io::duplex(PIPE_CAPACITY);
        self.outbound
            .send(remote)
            .map_err(|_| NetworkError::SessionTerminated)?;
        Ok(self.wrap(local))
    }

    async fn accept_stream(&self) -> Result<TunnelStream> {
        let mut inbound = self.inbound.lock().await;
        tokio::select! {
            _ = self.signal.terminated() => Err(NetworkError::SessionTerminated),
            pipe = inbound.recv() => pipe
                .map(|p| self.wrap(p))
                .ok_or(NetworkError::SessionTerminated),
        }
    }

    fn close(&self) {
        self.signal.terminate();
    }

    fn is_closed(&self) -> bool {
        self.signal.is_terminated()
    }

    async fn closed(&self) {
        self.signal.terminated().await
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        self.signal.terminate();
    }
}

/// Duplex pipe that fails once its session is torn down
struct MemoryStream {
    pipe: DuplexStream,
    closed: Pin<Box<WaitForCancellationFutureOwned>>,
    terminated: bool,
}

impl MemoryStream {
    fn poll_terminated(&mut self, cx: &mut Context<'_>) -> bool {
        if !self.terminated && self.closed.poll_unpin(cx).is_ready() {
            self.terminated = true;
        }
        self.terminated
    }
}

fn reset() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionReset, "tunnel session terminated")
}

impl AsyncRead for MemoryStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.poll_terminated(cx) {
            return Poll::Ready(Err(reset()));
        }
        Pin::new(&mut self.pipe).poll_read(cx, buf)
    }
}

impl AsyncWrite for MemoryStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.poll_terminated(cx) {
            return Poll::Ready(Err(reset()));
        }
        Pin::new(&mut self.pipe).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if self.poll_terminated(cx) {
            return Poll::Ready(Err(reset()));
        }
        Pin::new(&mut self.pipe).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.pipe).poll_shutdown(cx)
    }
}
