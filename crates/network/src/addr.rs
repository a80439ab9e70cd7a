//! Tunnel endpoint addresses
//!
//! Accepted forms:
//! - `<peer_id>@<multiaddr>`: dial and require the remote to prove that identity
//! - `<multiaddr>` (a trailing `/p2p/<peer_id>` also pins the identity)
//! - `ip:port` or `host:port`, converted to `/ip4|ip6|dns/.../tcp/<port>`

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use libp2p::multiaddr::Protocol;
use libp2p::{Multiaddr, PeerId};

use crate::{NetworkError, Result};

/// Remote tunnel endpoint with an optional pinned identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteAddr {
    pub peer_id: Option<PeerId>,
    pub addr: Multiaddr,
}

impl RemoteAddr {
    pub fn new(addr: Multiaddr) -> Self {
        let peer_id = addr.iter().find_map(|p| match p {
            Protocol::P2p(peer_id) => Some(peer_id),
            _ => None,
        });
        Self { peer_id, addr }
    }

    pub fn with_peer_id(mut self, peer_id: PeerId) -> Self {
        self.peer_id = Some(peer_id);
        self
    }
}

impl FromStr for RemoteAddr {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if let Some((peer_str, addr_str)) = s.split_once('@') {
            let peer_id: PeerId = peer_str
                .parse()
                .map_err(|e| NetworkError::InvalidAddress(format!("peer id {:?}: {}", peer_str, e)))?;
            return Ok(Self::new(parse_multiaddr(addr_str)?).with_peer_id(peer_id));
        }
        Ok(Self::new(parse_multiaddr(s)?))
    }
}

impl fmt::Display for RemoteAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.peer_id {
            Some(peer_id) => write!(f, "{}@{}", peer_id, self.addr),
            None => write!(f, "{}", self.addr),
        }
    }
}

/// Parse a multiaddr, a socket address or a `host:port` pair
pub fn parse_multiaddr(s: &str) -> Result<Multiaddr> {
    let s = s.trim();
    if s.starts_with('/') {
        return s
            .parse()
            .map_err(|e| NetworkError::InvalidAddress(format!("{:?}: {}", s, e)));
    }

    if let Ok(socket) = s.parse::<SocketAddr>() {
        return Ok(socket_to_multiaddr(socket));
    }

    let (host, port) = s
        .rsplit_once(':')
        .ok_or_else(|| NetworkError::InvalidAddress(format!("{:?}: missing port", s)))?;
    let port: u16 = port
        .parse()
        .map_err(|_| NetworkError::InvalidAddress(format!("{:?}: invalid port", s)))?;
    if host.is_empty() {
        // ":443" listens on every interface
        return Ok(socket_to_multiaddr(SocketAddr::new(
            IpAddr::from([0, 0, 0, 0]),
            port,
        )));
    }

    let mut addr = Multiaddr::empty();
    addr.push(Protocol::Dns(host.to_string().into()));
    addr.push(Protocol::Tcp(port));
    Ok(addr)
}

pub fn socket_to_multiaddr(socket: SocketAddr) -> Multiaddr {
    let mut addr = Multiaddr::empty();
    match socket.ip() {
        IpAddr::V4(ip) => addr.push(Protocol::Ip4(ip)),
        IpAddr::V6(ip) => addr.push(Protocol::Ip6(ip)),
    }
    addr.push(Protocol::Tcp(socket.port()));
    addr
}
