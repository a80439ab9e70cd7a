//! Destination descriptors and the tunnel stream header
//!
//! Every stream opened on a tunnel session starts with a single text line
//! naming the destination: `<host>:<port>\n`. Everything after the line feed
//! is relay payload. IPv6 hosts are bracketed so the last `:` always
//! separates the port.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::{Result, TunnelError};

/// Terminates the tunnel stream header line.
pub const TUNNEL_HEADER_DELIMITER: u8 = b'\n';

/// Longest domain name accepted in either wire form.
pub const MAX_DOMAIN_LEN: usize = 255;

/// Upper bound on the header line: longest domain, `:`, five port digits, `\n`.
pub const MAX_TUNNEL_HEADER_LEN: usize = MAX_DOMAIN_LEN + 1 + 5 + 1;

/// Kind of address carried in a descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressKind {
    Ipv4,
    Ipv6,
    DomainName,
}

/// Destination host: a literal IP address or a domain name
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Host {
    Ip(IpAddr),
    Domain(String),
}

impl Host {
    /// Classify a textual host. Literal addresses always win over the
    /// domain interpretation so the same destination has one representation.
    pub fn parse(text: &str) -> Result<Self> {
        if let Ok(ip) = text.parse::<IpAddr>() {
            return Ok(Host::Ip(ip));
        }
        validate_domain(text)?;
        Ok(Host::Domain(text.to_string()))
    }

    pub fn kind(&self) -> AddressKind {
        match self {
            Host::Ip(IpAddr::V4(_)) => AddressKind::Ipv4,
            Host::Ip(IpAddr::V6(_)) => AddressKind::Ipv6,
            Host::Domain(_) => AddressKind::DomainName,
        }
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Host::Ip(IpAddr::V4(ip)) => write!(f, "{}", ip),
            Host::Ip(IpAddr::V6(ip)) => write!(f, "[{}]", ip),
            Host::Domain(name) => f.write_str(name),
        }
    }
}

fn validate_domain(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(TunnelError::malformed("empty domain name"));
    }
    if name.len() > MAX_DOMAIN_LEN {
        return Err(TunnelError::malformed(format!(
            "domain name is {} bytes, limit is {}",
            name.len(),
            MAX_DOMAIN_LEN
        )));
    }
    if let Some(c) = name.chars().find(|c| matches!(c, '\n' | '\r' | ':' | '\0' | '[' | ']')) {
        return Err(TunnelError::malformed(format!(
            "domain name contains forbidden character {:?}",
            c
        )));
    }
    Ok(())
}

/// One destination endpoint.
///
/// Constructors enforce the descriptor invariants: the port is nonzero and a
/// domain name is 1-255 bytes without the header delimiter, `:` or brackets.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TargetDescriptor {
    host: Host,
    port: u16,
}

impl TargetDescriptor {
    pub fn new(host: Host, port: u16) -> Result<Self> {
        if port == 0 {
            return Err(TunnelError::malformed("port must be nonzero"));
        }
        if let Host::Domain(name) = &host {
            if name.parse::<IpAddr>().is_ok() {
                return Self::new(Host::parse(name)?, port);
            }
            validate_domain(name)?;
        }
        Ok(Self { host, port })
    }

    pub fn ip(ip: IpAddr, port: u16) -> Result<Self> {
        Self::new(Host::Ip(ip), port)
    }

    pub fn ipv4(ip: Ipv4Addr, port: u16) -> Result<Self> {
        Self::ip(IpAddr::V4(ip), port)
    }

    pub fn ipv6(ip: Ipv6Addr, port: u16) -> Result<Self> {
        Self::ip(IpAddr::V6(ip), port)
    }

    pub fn domain(name: impl Into<String>, port: u16) -> Result<Self> {
        let name = name.into();
        Self::new(Host::parse(&name)?, port)
    }

    pub fn host(&self) -> &Host {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn address_kind(&self) -> AddressKind {
        self.host.kind()
    }

    /// Address string suitable for `TcpStream::connect`
    pub fn dial_addr(&self) -> String {
        self.to_string()
    }

    /// Encode the header line written as the first bytes of a tunnel stream
    pub fn to_tunnel_header(&self) -> Bytes {
        let mut line = self.to_string().into_bytes();
        line.push(TUNNEL_HEADER_DELIMITER);
        Bytes::from(line)
    }

    /// Parse a header line with or without its trailing delimiter
    pub fn from_tunnel_line(line: &str) -> Result<Self> {
        let line = line
            .strip_suffix(TUNNEL_HEADER_DELIMITER as char)
            .unwrap_or(line);

        let (host, port) = line
            .rsplit_once(':')
            .ok_or_else(|| TunnelError::malformed(format!("missing port in {:?}", line)))?;

        let port: u16 = port
            .parse()
            .map_err(|_| TunnelError::malformed(format!("invalid port {:?}", port)))?;

        let host = match host.strip_prefix('[').and_then(|h| h.strip_suffix(']')) {
            Some(inner) => {
                let ip: Ipv6Addr = inner.parse().map_err(|_| {
                    TunnelError::malformed(format!("invalid IPv6 literal {:?}", inner))
                })?;
                Host::Ip(IpAddr::V6(ip))
            }
            None => Host::parse(host)?,
        };

        Self::new(host, port)
    }
}

impl fmt::Display for TargetDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for TargetDescriptor {
    type Err = TunnelError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_tunnel_line(s)
    }
}

/// Read the header line from the start of a tunnel stream.
///
/// Reads in chunks, so the underlying reader may hand over bytes that lie
/// past the delimiter. Those bytes are relay payload and are returned as
/// the surplus; the caller must replay them before reading the stream again.
pub async fn read_tunnel_header<R>(reader: &mut R) -> Result<(TargetDescriptor, Bytes)>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut buf = BytesMut::with_capacity(512);
    let mut scanned = 0;

    loop {
        if let Some(pos) = buf[scanned..]
            .iter()
            .position(|&b| b == TUNNEL_HEADER_DELIMITER)
        {
            let line = buf.split_to(scanned + pos + 1);
            let text = std::str::from_utf8(&line[..line.len() - 1])
                .map_err(|_| TunnelError::malformed("header is not valid UTF-8"))?;
            let target = TargetDescriptor::from_tunnel_line(text)?;
            return Ok((target, buf.freeze()));
        }
        scanned = buf.len();

        if buf.len() >= MAX_TUNNEL_HEADER_LEN {
            return Err(TunnelError::malformed(format!(
                "no header delimiter within {} bytes",
                MAX_TUNNEL_HEADER_LEN
            )));
        }

        let n = reader.read_buf(&mut buf).await?;
        if n == 0 {
            return Err(TunnelError::malformed(
                "stream ended before header delimiter",
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[test]
    fn test_domain_header() {
        let target = TargetDescriptor::domain("example.com", 80).unwrap();
        assert_eq!(target.address_kind(), AddressKind::DomainName);
        assert_eq!(&target.to_tunnel_header()[..], b"example.com:80\n");
    }

    #[test]
    fn test_ipv6_header_is_bracketed() {
        let target = TargetDescriptor::ipv6("2001:db8::1".parse().unwrap(), 443).unwrap();
        assert_eq!(&target.to_tunnel_header()[..], b"[2001:db8::1]:443\n");
        let parsed = TargetDescriptor::from_tunnel_line("[2001:db8::1]:443\n").unwrap();
        assert_eq!(parsed, target);
    }

    #[test]
    fn test_ipv6_canonical_form() {
        let parsed = TargetDescriptor::from_tunnel_line("[2001:0db8:0000::0001]:8080").unwrap();
        assert_eq!(parsed.to_string(), "[2001:db8::1]:8080");
    }

    #[test]
    fn test_header_roundtrip() {
        let targets = [
            TargetDescriptor::ipv4(Ipv4Addr::new(10, 0, 0, 1), 1).unwrap(),
            TargetDescriptor::ipv6(Ipv6Addr::LOCALHOST, 65535).unwrap(),
            TargetDescriptor::domain("a", 22).unwrap(),
            TargetDescriptor::domain("x".repeat(MAX_DOMAIN_LEN), 8443).unwrap(),
        ];
        for target in targets {
            let header = target.to_tunnel_header();
            let text = std::str::from_utf8(&header).unwrap();
            assert_eq!(TargetDescriptor::from_tunnel_line(text).unwrap(), target);
        }
    }

    #[test]
    fn test_domain_literal_normalizes_to_ip() {
        let target = TargetDescriptor::domain("127.0.0.1", 80).unwrap();
        assert_eq!(target.address_kind(), AddressKind::Ipv4);
        let target = TargetDescriptor::new(Host::Domain("::1".into()), 80).unwrap();
        assert_eq!(target.address_kind(), AddressKind::Ipv6);
    }

    #[test]
    fn test_rejects_invalid_descriptors() {
        assert!(TargetDescriptor::domain("example.com", 0).is_err());
        assert!(TargetDescriptor::domain("", 80).is_err());
        assert!(TargetDescriptor::domain("x".repeat(MAX_DOMAIN_LEN + 1), 80).is_err());
        assert!(TargetDescriptor::domain("evil\n.com", 80).is_err());
        assert!(TargetDescriptor::domain("[foo]", 80).is_err());
        assert!(TargetDescriptor::domain("foo]", 80).is_err());
        assert!(TargetDescriptor::from_tunnel_line("example.com").is_err());
        assert!(TargetDescriptor::from_tunnel_line("example.com:http").is_err());
        assert!(TargetDescriptor::from_tunnel_line("example.com:70000").is_err());
        assert!(TargetDescriptor::from_tunnel_line("[not-ipv6]:80").is_err());
    }

    #[tokio::test]
    async fn test_read_header_keeps_surplus() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        client
            .write_all(b"example.com:443\nGET / HTTP/1.1\r\n")
            .await
            .unwrap();

        let (target, surplus) = read_tunnel_header(&mut server).await.unwrap();
        assert_eq!(target, TargetDescriptor::domain("example.com", 443).unwrap());
        assert_eq!(&surplus[..], b"GET / HTTP/1.1\r\n");
    }

    #[tokio::test]
    async fn test_read_header_across_chunks() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let reader = tokio::spawn(async move { read_tunnel_header(&mut server).await });

        client.write_all(b"10.1.2.").await.unwrap();
        tokio::task::yield_now().await;
        client.write_all(b"3:53").await.unwrap();
        tokio::task::yield_now().await;
        client.write_all(b"\n").await.unwrap();

        let (target, surplus) = reader.await.unwrap().unwrap();
        assert_eq!(target.to_string(), "10.1.2.3:53");
        assert!(surplus.is_empty());
    }

    #[tokio::test]
    async fn test_read_header_eof_is_malformed() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        client.write_all(b"example.com:80").await.unwrap();
        drop(client);

        let err = read_tunnel_header(&mut server).await.unwrap_err();
        assert!(matches!(err, TunnelError::MalformedAddress(_)));
    }

    #[tokio::test]
    async fn test_read_header_too_long() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        client
            .write_all(&vec![b'a'; MAX_TUNNEL_HEADER_LEN + 10])
            .await
            .unwrap();

        let err = read_tunnel_header(&mut server).await.unwrap_err();
        assert!(matches!(err, TunnelError::MalformedAddress(_)));
    }
}
