//! Shared fixtures: a TCP echo destination and a tunnel wired over the
//! in-memory transport.

#![allow(dead_code)]

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use tunnelmux_client::{SessionHandle, Socks5Server};
use tunnelmux_exit::{ExitConfig, ExitServer, ExitStats};
use tunnelmux_network::memory::{memory_transport, MemoryDialer};
use tunnelmux_network::{SessionDialer, TunnelSession};

pub const TIMEOUT: Duration = Duration::from_secs(5);

pub const SOCKS_SUCCESS: [u8; 10] = [0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0];

/// Echo every byte back, then close once the peer closes
pub async fn spawn_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = socket.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
                let _ = writer.shutdown().await;
            });
        }
    });
    addr
}

/// Like `spawn_echo_server`, but every reply starts with `<port>|` so a
/// client can tell which destination it reached
pub async fn spawn_tagged_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = socket.split();
                let tag = format!("{}|", addr.port());
                if writer.write_all(tag.as_bytes()).await.is_ok() {
                    let _ = tokio::io::copy(&mut reader, &mut writer).await;
                }
                let _ = writer.shutdown().await;
            });
        }
    });
    addr
}

/// A loopback address nothing is listening on
pub async fn unused_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

/// Client and exit joined by one in-memory session, with a SOCKS5
/// listener in front of the client side
pub struct Tunnel {
    pub dialer: MemoryDialer,
    pub handle: SessionHandle,
    pub stats: Arc<ExitStats>,
    pub socks: Socks5Server,
}

impl Tunnel {
    pub async fn start(name: &str) -> Self {
        let (dialer, acceptor) = memory_transport(name);
        let exit = ExitServer::new(ExitConfig {
            dial_timeout: Duration::from_secs(2),
        });
        let stats = exit.stats();
        tokio::spawn(async move {
            let _ = exit.run(acceptor).await;
        });

        let session = dialer.dial().await.unwrap();
        let handle = SessionHandle::new(session);
        let mut socks = Socks5Server::new("127.0.0.1:0".parse().unwrap(), handle.clone());
        socks.start().await.unwrap();

        Self {
            dialer,
            handle,
            stats,
            socks,
        }
    }

    pub fn session(&self) -> Arc<dyn TunnelSession> {
        self.handle.current()
    }

    pub fn proxy_addr(&self) -> SocketAddr {
        self.socks.listen_addr()
    }

    /// Wait until the exit has finished `count` relays
    pub async fn wait_for_relays(&self, count: u64) {
        tokio::time::timeout(TIMEOUT, async {
            while self.stats.snapshot().relays_completed < count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("exit relays should complete");
    }
}

pub fn connect_request(addr: SocketAddr) -> Vec<u8> {
    let mut request = vec![0x05, 0x01, 0x00];
    match addr.ip() {
        IpAddr::V4(ip) => {
            request.push(0x01);
            request.extend_from_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            request.push(0x04);
            request.extend_from_slice(&ip.octets());
        }
    }
    request.extend_from_slice(&addr.port().to_be_bytes());
    request
}

pub fn connect_request_domain(domain: &str, port: u16) -> Vec<u8> {
    let mut request = vec![0x05, 0x01, 0x00, 0x03, domain.len() as u8];
    request.extend_from_slice(domain.as_bytes());
    request.extend_from_slice(&port.to_be_bytes());
    request
}

/// Run the SOCKS5 handshake and return the reply to `request`
pub async fn socks_handshake(proxy: SocketAddr, request: &[u8]) -> (TcpStream, [u8; 10]) {
    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut method = [0u8; 2];
    stream.read_exact(&mut method).await.unwrap();
    assert_eq!(method, [0x05, 0x00]);

    stream.write_all(request).await.unwrap();
    let mut reply = [0u8; 10];
    stream.read_exact(&mut reply).await.unwrap();
    (stream, reply)
}

/// Handshake that must succeed
pub async fn socks_connect(proxy: SocketAddr, request: &[u8]) -> TcpStream {
    let (stream, reply) = socks_handshake(proxy, request).await;
    assert_eq!(reply, SOCKS_SUCCESS);
    stream
}

/// Send `payload`, close the write half and collect everything echoed back
pub async fn echo_roundtrip(stream: &mut TcpStream, payload: &[u8]) -> Vec<u8> {
    stream.write_all(payload).await.unwrap();
    stream.shutdown().await.unwrap();
    let mut echoed = Vec::new();
    tokio::time::timeout(TIMEOUT, stream.read_to_end(&mut echoed))
        .await
        .expect("echo should finish")
        .unwrap();
    echoed
}
