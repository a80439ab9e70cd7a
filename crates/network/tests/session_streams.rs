//! Stream semantics of a libp2p tunnel session between two local peers
//!
//! Streams are independent, half-close is per direction, and either side
//! may open streams once the session is up.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;

use tunnelmux_network::{
    Keypair, Libp2pSession, Libp2pTransport, Multiaddr, RemoteAddr, SecurityParams,
    SessionAcceptor, TunnelSession,
};

const TIMEOUT: Duration = Duration::from_secs(10);

/// Connect a fresh client to a fresh listener on loopback
async fn connected_pair() -> (Arc<Libp2pSession>, Arc<dyn TunnelSession>) {
    let listener = Libp2pTransport::new(SecurityParams::new(Keypair::generate_ed25519()));
    let addr: Multiaddr = "/ip4/127.0.0.1/tcp/0".parse().unwrap();
    let mut acceptor = listener.listen(addr).await.unwrap();
    let remote = RemoteAddr::new(acceptor.listen_multiaddr());

    let dialer = Libp2pTransport::new(SecurityParams::new(Keypair::generate_ed25519()));
    let client = dialer.dial(&remote).await.unwrap();
    let server = timeout(TIMEOUT, acceptor.accept()).await.unwrap().unwrap();
    (client, server)
}

#[tokio::test]
async fn test_half_close_is_per_direction() {
    let (client, server) = connected_pair().await;

    let mut outbound = client.open_stream().await.unwrap();
    outbound.write_all(b"request").await.unwrap();
    outbound.shutdown().await.unwrap();

    let mut inbound = timeout(TIMEOUT, server.accept_stream()).await.unwrap().unwrap();
    let mut request = Vec::new();
    inbound.read_to_end(&mut request).await.unwrap();
    assert_eq!(request, b"request");

    // The client's write half is closed; the server can still answer.
    inbound.write_all(b"response after eof").await.unwrap();
    inbound.shutdown().await.unwrap();

    let mut response = Vec::new();
    timeout(TIMEOUT, outbound.read_to_end(&mut response)).await.unwrap().unwrap();
    assert_eq!(response, b"response after eof");
}

#[tokio::test]
async fn test_concurrent_streams_stay_separate() {
    let (client, server) = connected_pair().await;

    let echo = tokio::spawn(async move {
        while let Ok(mut stream) = server.accept_stream().await {
            tokio::spawn(async move {
                let mut data = Vec::new();
                if stream.read_to_end(&mut data).await.is_ok() {
                    let _ = stream.write_all(&data).await;
                    let _ = stream.shutdown().await;
                }
            });
        }
    });

    let tasks = (0..20u8).map(|i| {
        let client = client.clone();
        tokio::spawn(async move {
            let payload = vec![i; 1024 + i as usize];
            let mut stream = client.open_stream().await.unwrap();
            stream.write_all(&payload).await.unwrap();
            stream.shutdown().await.unwrap();
            let mut echoed = Vec::new();
            timeout(TIMEOUT, stream.read_to_end(&mut echoed)).await.unwrap().unwrap();
            assert_eq!(echoed, payload);
        })
    });
    for task in futures::future::join_all(tasks).await {
        task.unwrap();
    }

    client.close();
    timeout(TIMEOUT, echo).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_listener_side_can_open_streams() {
    let (client, server) = connected_pair().await;

    let mut pushed = server.open_stream().await.unwrap();
    pushed.write_all(b"from the server").await.unwrap();
    pushed.shutdown().await.unwrap();

    let mut received = timeout(TIMEOUT, client.accept_stream()).await.unwrap().unwrap();
    let mut data = Vec::new();
    received.read_to_end(&mut data).await.unwrap();
    assert_eq!(data, b"from the server");
}

#[tokio::test]
async fn test_close_terminates_both_ends() {
    let (client, server) = connected_pair().await;
    let mut stream = client.open_stream().await.unwrap();
    stream.write_all(b"x").await.unwrap();
    let _inbound = timeout(TIMEOUT, server.accept_stream()).await.unwrap().unwrap();

    server.close();
    timeout(TIMEOUT, client.closed()).await.unwrap();
    assert!(client.is_closed());
    assert!(client.open_stream().await.is_err());

    let mut buf = [0u8; 8];
    let read = timeout(TIMEOUT, stream.read(&mut buf)).await.unwrap();
    assert!(matches!(read, Ok(0) | Err(_)));
}
