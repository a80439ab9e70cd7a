//! libp2p binding of the tunnel session
//!
//! TCP secured with Noise and multiplexed with yamux. Each tunnel stream is
//! a libp2p-stream substream negotiated on the configured protocol id. One
//! swarm backs either a single outbound session (client) or every inbound
//! session of a listener (server); a driver task owns the swarm and turns
//! connection events into session lifecycle.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use libp2p::swarm::dial_opts::DialOpts;
use libp2p::swarm::SwarmEvent;
use libp2p::{identity::Keypair, noise, tcp, yamux, Multiaddr, PeerId, StreamProtocol, Swarm, SwarmBuilder};
use libp2p_stream::{Control, IncomingStreams};
use tokio::sync::{mpsc, Mutex};
use tokio_util::compat::FuturesAsyncReadCompatExt;
use tracing::{debug, info, warn};

use crate::{
    NetworkError, RemoteAddr, Result, SessionAcceptor, SessionDialer, SessionSignal,
    TunnelSession, TunnelStream,
};

/// Protocol id negotiated for every tunnel stream
pub const DEFAULT_PROTOCOL_ID: &str = "/tunnelmux/stream/1.0.0";

/// How long `dial` waits for the secure connection to come up
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// How long `listen` waits for the first bound address
const LISTEN_TIMEOUT: Duration = Duration::from_secs(10);

/// Security parameters handed in by the credential layer.
///
/// The keypair is the local Noise identity; the protocol id separates
/// tunnel streams from anything else spoken on the connection. The remote
/// identity to pin travels with the remote address.
#[derive(Debug, Clone)]
pub struct SecurityParams {
    pub keypair: Keypair,
    pub protocol: StreamProtocol,
}

impl SecurityParams {
    pub fn new(keypair: Keypair) -> Self {
        Self {
            keypair,
            protocol: StreamProtocol::new(DEFAULT_PROTOCOL_ID),
        }
    }

    pub fn with_protocol(mut self, protocol_id: &str) -> Result<Self> {
        self.protocol = StreamProtocol::try_from_owned(protocol_id.to_string())
            .map_err(|e| NetworkError::InvalidProtocol(format!("{:?}: {}", protocol_id, e)))?;
        Ok(self)
    }

    pub fn local_peer_id(&self) -> PeerId {
        PeerId::from(self.keypair.public())
    }
}

/// Entry point for dialing and listening over libp2p
#[derive(Debug, Clone)]
pub struct Libp2pTransport {
    params: SecurityParams,
    connect_timeout: Duration,
}

impl Libp2pTransport {
    pub fn new(params: SecurityParams) -> Self {
        Self {
            params,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.params.local_peer_id()
    }

    /// Establish one outbound session.
    ///
    /// When the remote address pins a peer id, a remote presenting any other
    /// identity fails the Noise handshake and the dial errors out.
    pub async fn dial(&self, remote: &RemoteAddr) -> Result<Arc<Libp2pSession>> {
        let mut swarm = build_swarm(self.params.keypair.clone())?;
        let mut control = swarm.behaviour().new_control();
        let incoming = control
            .accept(self.params.protocol.clone())
            .map_err(|e| NetworkError::Transport(e.to_string()))?;

        let opts = match remote.peer_id {
            Some(peer_id) => DialOpts::peer_id(peer_id)
                .addresses(vec![remote.addr.clone()])
                .build(),
            None => DialOpts::unknown_peer_id()
                .address(remote.addr.clone())
                .build(),
        };
        swarm
            .dial(opts)
            .map_err(|e| NetworkError::DialFailed(format!("{}: {}", remote, e)))?;

        let (peer_id, remote_addr) = tokio::time::timeout(self.connect_timeout, async {
            loop {
                match swarm.select_next_some().await {
                    SwarmEvent::ConnectionEstablished { peer_id, endpoint, .. } => {
                        return Ok((peer_id, endpoint.get_remote_address().clone()));
                    }
                    SwarmEvent::OutgoingConnectionError { error, .. } => {
                        return Err(NetworkError::DialFailed(format!("{}: {}", remote, error)));
                    }
                    _ => {}
                }
            }
        })
        .await
        .map_err(|_| NetworkError::Timeout(self.connect_timeout))??;

        info!("Tunnel session established with {} at {}", peer_id, remote_addr);

        let (mut driver, commands) =
            SwarmDriver::new(swarm, control, incoming, self.params.protocol.clone(), None);
        let session = driver.register_peer(peer_id, remote_addr, commands);
        tokio::spawn(driver.run());

        Ok(session)
    }

    /// Bind a listener; every connecting peer becomes one inbound session
    pub async fn listen(&self, addr: Multiaddr) -> Result<Libp2pAcceptor> {
        let mut swarm = build_swarm(self.params.keypair.clone())?;
        let mut control = swarm.behaviour().new_control();
        let incoming = control
            .accept(self.params.protocol.clone())
            .map_err(|e| NetworkError::Transport(e.to_string()))?;

        swarm
            .listen_on(addr.clone())
            .map_err(|e| NetworkError::ListenFailed(format!("{}: {}", addr, e)))?;

        let bound = tokio::time::timeout(LISTEN_TIMEOUT, async {
            loop {
                match swarm.select_next_some().await {
                    SwarmEvent::NewListenAddr { address, .. } => return Ok(address),
                    SwarmEvent::ListenerClosed { reason, .. } => {
                        return Err(NetworkError::ListenFailed(format!("{}: {:?}", addr, reason)));
                    }
                    SwarmEvent::ListenerError { error, .. } => {
                        return Err(NetworkError::ListenFailed(format!("{}: {}", addr, error)));
                    }
                    _ => {}
                }
            }
        })
        .await
        .map_err(|_| NetworkError::Timeout(LISTEN_TIMEOUT))??;

        let peer_id = self.local_peer_id();
        info!("Tunnel listener bound on {}/p2p/{}", bound, peer_id);

        let (session_tx, session_rx) = mpsc::unbounded_channel();
        let (driver, commands) = SwarmDriver::new(
            swarm,
            control,
            incoming,
            self.params.protocol.clone(),
            Some(session_tx),
        );
        tokio::spawn(driver.run());

        Ok(Libp2pAcceptor {
            local_addr: bound,
            peer_id,
            sessions: session_rx,
            _commands: commands,
        })
    }

    /// Bind this transport to a fixed remote for repeated dialing
    pub fn dialer(self, remote: RemoteAddr) -> Libp2pDialer {
        Libp2pDialer {
            transport: self,
            remote,
        }
    }
}

fn build_swarm(keypair: Keypair) -> Result<Swarm<libp2p_stream::Behaviour>> {
    let swarm = SwarmBuilder::with_existing_identity(keypair)
        .with_tokio()
        .with_tcp(
            tcp::Config::default().nodelay(true),
            noise::Config::new,
            yamux::Config::default,
        )
        .map_err(|e| NetworkError::Transport(e.to_string()))?
        .with_dns()
        .map_err(|e| NetworkError::Transport(e.to_string()))?
        .with_behaviour(|_| libp2p_stream::Behaviour::new())
        .map_err(|e| NetworkError::Transport(e.to_string()))?
        // Sessions live until closed, not until idle
        .with_swarm_config(|c| c.with_idle_connection_timeout(Duration::from_secs(u64::MAX)))
        .build();
    Ok(swarm)
}

enum Command {
    Disconnect(PeerId),
}

/// Per-peer routing state kept by the driver
struct PeerChannels {
    streams: mpsc::UnboundedSender<libp2p::Stream>,
    signal: SessionSignal,
}

struct SwarmDriver {
    swarm: Swarm<libp2p_stream::Behaviour>,
    control: Control,
    incoming: IncomingStreams,
    protocol: StreamProtocol,
    peers: HashMap<PeerId, PeerChannels>,
    new_sessions: Option<mpsc::UnboundedSender<Arc<dyn TunnelSession>>>,
    /// Weak so that the driver alone never keeps itself running
    command_tx: mpsc::WeakUnboundedSender<Command>,
    commands: mpsc::UnboundedReceiver<Command>,
}

impl SwarmDriver {
    fn new(
        swarm: Swarm<libp2p_stream::Behaviour>,
        control: Control,
        incoming: IncomingStreams,
        protocol: StreamProtocol,
        new_sessions: Option<mpsc::UnboundedSender<Arc<dyn TunnelSession>>>,
    ) -> (Self, mpsc::UnboundedSender<Command>) {
        let (command_tx, commands) = mpsc::unbounded_channel();
        let driver = Self {
            swarm,
            control,
            incoming,
            protocol,
            peers: HashMap::new(),
            new_sessions,
            command_tx: command_tx.downgrade(),
            commands,
        };
        (driver, command_tx)
    }

    fn register_peer(
        &mut self,
        peer_id: PeerId,
        remote_addr: Multiaddr,
        commands: mpsc::UnboundedSender<Command>,
    ) -> Arc<Libp2pSession> {
        let (streams_tx, streams_rx) = mpsc::unbounded_channel();
        let signal = SessionSignal::new();

        self.peers.insert(
            peer_id,
            PeerChannels {
                streams: streams_tx,
                signal: signal.clone(),
            },
        );

        Arc::new(Libp2pSession {
            peer_id,
            remote_addr,
            protocol: self.protocol.clone(),
            control: self.control.clone(),
            incoming: Mutex::new(streams_rx),
            signal,
            commands,
        })
    }

    /// Runs until every handle (sessions, acceptor) holding a command sender
    /// has been dropped.
    async fn run(mut self) {
        loop {
            tokio::select! {
                event = self.swarm.select_next_some() => self.on_swarm_event(event),
                Some((peer_id, stream)) = self.incoming.next() => self.on_inbound_stream(peer_id, stream),
                command = self.commands.recv() => match command {
                    Some(Command::Disconnect(peer_id)) => {
                        debug!("Disconnecting tunnel peer {}", peer_id);
                        let _ = self.swarm.disconnect_peer_id(peer_id);
                    }
                    None => break,
                },
            }
        }

        for (_, peer) in self.peers.drain() {
            peer.signal.terminate();
        }
        debug!("Swarm driver stopped");
    }

    fn on_swarm_event(&mut self, event: SwarmEvent<()>) {
        match event {
            SwarmEvent::ConnectionEstablished {
                peer_id,
                endpoint,
                num_established,
                ..
            } => {
                if num_established.get() > 1 || self.peers.contains_key(&peer_id) {
                    return;
                }
                let Some(new_sessions) = self.new_sessions.clone() else {
                    debug!("Ignoring unsolicited connection from {}", peer_id);
                    return;
                };
                let Some(commands) = self.command_tx.upgrade() else {
                    return;
                };
                let remote_addr = endpoint.get_remote_address().clone();
                info!("Accepted tunnel peer {} from {}", peer_id, remote_addr);
                let session = self.register_peer(peer_id, remote_addr, commands);
                if new_sessions.send(session).is_err() {
                    warn!("Acceptor dropped, refusing peer {}", peer_id);
                    self.peers.remove(&peer_id);
                    let _ = self.swarm.disconnect_peer_id(peer_id);
                }
            }
            SwarmEvent::ConnectionClosed {
                peer_id,
                num_established: 0,
                cause,
                ..
            } => {
                if let Some(peer) = self.peers.remove(&peer_id) {
                    peer.signal.terminate();
                    match cause {
                        Some(e) => info!("Tunnel session with {} terminated: {}", peer_id, e),
                        None => info!("Tunnel session with {} closed", peer_id),
                    }
                }
            }
            SwarmEvent::NewListenAddr { address, .. } => {
                debug!("Listening on {}", address);
            }
            SwarmEvent::IncomingConnectionError { send_back_addr, error, .. } => {
                debug!("Incoming connection from {} failed: {}", send_back_addr, error);
            }
            _ => {}
        }
    }

    fn on_inbound_stream(&mut self, peer_id: PeerId, stream: libp2p::Stream) {
        match self.peers.get(&peer_id) {
            Some(peer) if !peer.signal.is_terminated() => {
                if peer.streams.send(stream).is_err() {
                    debug!("Session with {} no longer accepts streams", peer_id);
                }
            }
            _ => debug!("Dropping stream from unknown peer {}", peer_id),
        }
    }
}

/// One libp2p connection to a remote peer, viewed as a tunnel session
pub struct Libp2pSession {
    peer_id: PeerId,
    remote_addr: Multiaddr,
    protocol: StreamProtocol,
    control: Control,
    incoming: Mutex<mpsc::UnboundedReceiver<libp2p::Stream>>,
    signal: SessionSignal,
    commands: mpsc::UnboundedSender<Command>,
}

impl Libp2pSession {
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn remote_addr(&self) -> &Multiaddr {
        &self.remote_addr
    }

    /// Streams hold a driver handle so the connection outlives a dropped
    /// session while relays still use it.
    fn wrap(&self, stream: libp2p::Stream) -> TunnelStream {
        TunnelStream::new(stream.compat()).retain(self.commands.clone())
    }
}

#[async_trait]
impl TunnelSession for Libp2pSession {
    fn remote_id(&self) -> String {
        self.peer_id.to_string()
    }

    async fn open_stream(&self) -> Result<TunnelStream> {
        if self.signal.is_terminated() {
            return Err(NetworkError::SessionTerminated);
        }

        // Control is a cheap handle; a private clone per call keeps
        // concurrent opens independent.
        let mut control = self.control.clone();
        tokio::select! {
            _ = self.signal.terminated() => Err(NetworkError::SessionTerminated),
            result = control.open_stream(self.peer_id, self.protocol.clone()) => {
                let stream = result.map_err(|e| NetworkError::StreamOpenFailed(e.to_string()))?;
                Ok(self.wrap(stream))
            }
        }
    }

    async fn accept_stream(&self) -> Result<TunnelStream> {
        let mut incoming = self.incoming.lock().await;
        tokio::select! {
            _ = self.signal.terminated() => Err(NetworkError::SessionTerminated),
            stream = incoming.recv() => stream
                .map(|s| self.wrap(s))
                .ok_or(NetworkError::SessionTerminated),
        }
    }

    fn close(&self) {
        self.signal.terminate();
        let _ = self.commands.send(Command::Disconnect(self.peer_id));
    }

    fn is_closed(&self) -> bool {
        self.signal.is_terminated()
    }

    async fn closed(&self) {
        self.signal.terminated().await
    }
}

/// Inbound side of a libp2p listener
pub struct Libp2pAcceptor {
    local_addr: Multiaddr,
    peer_id: PeerId,
    sessions: mpsc::UnboundedReceiver<Arc<dyn TunnelSession>>,
    _commands: mpsc::UnboundedSender<Command>,
}

impl Libp2pAcceptor {
    /// Bound address including the `/p2p/<peer_id>` suffix clients pin
    pub fn listen_multiaddr(&self) -> Multiaddr {
        self.local_addr
            .clone()
            .with(libp2p::multiaddr::Protocol::P2p(self.peer_id))
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }
}

#[async_trait]
impl SessionAcceptor for Libp2pAcceptor {
    async fn accept(&mut self) -> Result<Arc<dyn TunnelSession>> {
        self.sessions.recv().await.ok_or(NetworkError::ListenerClosed)
    }

    fn local_addr(&self) -> String {
        self.local_addr.to_string()
    }
}

/// Redials a fixed remote over libp2p
#[derive(Debug, Clone)]
pub struct Libp2pDialer {
    transport: Libp2pTransport,
    remote: RemoteAddr,
}

#[async_trait]
impl SessionDialer for Libp2pDialer {
    async fn dial(&self) -> Result<Arc<dyn TunnelSession>> {
        let session = self.transport.dial(&self.remote).await?;
        Ok(session)
    }

    fn remote(&self) -> String {
        self.remote.to_string()
    }
}
