//! SOCKS5 proxy server (RFC 1928, CONNECT only, NO AUTH)
//!
//! Listens for local application connections, performs the SOCKS5
//! handshake, opens one tunnel stream per connection, writes the
//! `host:port\n` header and then relays bytes in both directions.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, error, info, trace, warn};

use tunnelmux_core::{
    Result, Socks5Reply, TargetDescriptor, TunnelError, CMD_CONNECT, NO_AUTH_ACK, SOCKS5_VERSION,
};
use tunnelmux_network::{TunnelSession, TunnelStream};
use tunnelmux_relay::{relay, RelayOutcome};

use crate::{ClientError, SessionHandle};

/// Negotiation progress of one local connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Socks5State {
    AwaitingMethods,
    MethodsAcked,
    AwaitingRequest,
    Established,
    Relaying,
    Closed,
}

/// SOCKS5 proxy server
pub struct Socks5Server {
    listen_addr: SocketAddr,
    sessions: SessionHandle,
    /// Handle for the listener task
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl Socks5Server {
    pub fn new(listen_addr: SocketAddr, sessions: SessionHandle) -> Self {
        Self {
            listen_addr,
            sessions,
            handle: None,
        }
    }

    /// Start listening for SOCKS5 connections.
    ///
    /// Returns immediately; the server runs in a background task.
    pub async fn start(&mut self) -> crate::Result<()> {
        let bind = |source: std::io::Error| ClientError::Bind {
            addr: self.listen_addr,
            source,
        };
        let listener = TcpListener::bind(self.listen_addr).await.map_err(bind)?;
        let actual_addr = listener.local_addr().map_err(bind)?;
        info!("SOCKS5 proxy listening on {}", actual_addr);
        self.listen_addr = actual_addr;

        let sessions = self.sessions.clone();

        let handle = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer_addr)) => {
                        debug!("SOCKS5 connection from {}", peer_addr);
                        let _ = stream.set_nodelay(true);
                        // Each connection keeps the session it started with
                        let session = sessions.current();
                        tokio::spawn(async move {
                            match handle_socks5_connection(stream, session).await {
                                Ok(outcome) => debug!(
                                    "SOCKS5 connection from {} closed ({} bytes)",
                                    peer_addr,
                                    outcome.total_bytes()
                                ),
                                Err(e) if e.is_input_error() => {
                                    debug!("SOCKS5 connection from {} rejected: {}", peer_addr, e)
                                }
                                Err(e) => warn!("SOCKS5 connection from {} ended: {}", peer_addr, e),
                            }
                        });
                    }
                    Err(e) => {
                        error!("SOCKS5 accept error: {}", e);
                    }
                }
            }
        });

        self.handle = Some(handle);
        Ok(())
    }

    /// Stop the SOCKS5 server
    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
            info!("SOCKS5 proxy stopped");
        }
    }

    /// Get the listening address
    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }
}

impl Drop for Socks5Server {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Negotiate with one local application and relay it through `session`.
///
/// Returns the relay outcome once both directions have finished, or the
/// error that closed the connection early.
pub async fn handle_socks5_connection<S>(local: S, session: Arc<dyn TunnelSession>) -> Result<RelayOutcome>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut conn = Socks5Connection::new(local);
    let result = conn.run(session.as_ref()).await;
    conn.transition(Socks5State::Closed);
    result
}

struct Socks5Connection<S> {
    local: S,
    state: Socks5State,
}

impl<S> Socks5Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn new(local: S) -> Self {
        Self {
            local,
            state: Socks5State::AwaitingMethods,
        }
    }

    fn transition(&mut self, next: Socks5State) {
        trace!("SOCKS5 {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    async fn run(&mut self, session: &dyn TunnelSession) -> Result<RelayOutcome> {
        self.negotiate_methods().await?;
        self.transition(Socks5State::AwaitingRequest);
        let target = self.read_request().await?;
        self.transition(Socks5State::Established);
        let stream = self.open_tunnel(session, &target).await?;
        self.transition(Socks5State::Relaying);
        self.relay(stream, &target).await
    }

    /// Greeting: VER (1) | NMETHODS (1) | METHODS (1..255)
    async fn negotiate_methods(&mut self) -> Result<()> {
        let mut header = [0u8; 2];
        self.local.read_exact(&mut header).await?;
        check_version(header[0])?;

        // Only no-auth is ever offered, whatever the client lists
        let mut methods = vec![0u8; header[1] as usize];
        self.local.read_exact(&mut methods).await?;

        self.local.write_all(&NO_AUTH_ACK).await?;
        self.transition(Socks5State::MethodsAcked);
        Ok(())
    }

    /// Request: VER (1) | CMD (1) | RSV (1) | ATYP (1) | DST.ADDR | DST.PORT (2)
    async fn read_request(&mut self) -> Result<TargetDescriptor> {
        let mut header = [0u8; 3];
        self.local.read_exact(&mut header).await?;
        check_version(header[0])?;

        if header[1] != CMD_CONNECT {
            self.local
                .write_all(&Socks5Reply::CommandNotSupported.to_bytes())
                .await?;
            return Err(TunnelError::CommandNotSupported(header[1]));
        }

        let target = TargetDescriptor::read_socks_addr(&mut self.local).await?;
        debug!("SOCKS5 CONNECT to {}", target);
        Ok(target)
    }

    /// Open the stream and frame the destination onto it
    async fn open_tunnel(
        &mut self,
        session: &dyn TunnelSession,
        target: &TargetDescriptor,
    ) -> Result<TunnelStream> {
        let opened = match session.open_stream().await {
            Ok(mut stream) => stream
                .write_all(&target.to_tunnel_header())
                .await
                .map(|_| stream)
                .map_err(|e| TunnelError::StreamOpenFailed(e.to_string())),
            Err(e) => Err(TunnelError::from(e)),
        };

        match opened {
            Ok(stream) => Ok(stream),
            Err(e) => {
                // Best effort; the connection is closed either way
                let _ = self
                    .local
                    .write_all(&Socks5Reply::GeneralFailure.to_bytes())
                    .await;
                Err(e)
            }
        }
    }

    async fn relay(&mut self, stream: TunnelStream, target: &TargetDescriptor) -> Result<RelayOutcome> {
        self.local.write_all(&Socks5Reply::Succeeded.to_bytes()).await?;

        let stream_id = stream.id();
        debug!("Stream {} relaying to {}", stream_id, target);
        let outcome = relay(&mut self.local, stream).await;
        debug!(
            "Stream {} to {} finished: {} bytes up, {} bytes down",
            stream_id, target, outcome.a_to_b.bytes, outcome.b_to_a.bytes
        );
        if let Some(e) = outcome.error() {
            debug!("Stream {} to {} ended on error: {}", stream_id, target, e);
        }
        Ok(outcome)
    }
}

fn check_version(version: u8) -> Result<()> {
    if version != SOCKS5_VERSION {
        return Err(TunnelError::ProtocolVersionMismatch {
            expected: SOCKS5_VERSION,
            actual: version,
        });
    }
    Ok(())
}
