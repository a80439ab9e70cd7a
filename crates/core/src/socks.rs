//! SOCKS5 wire constants and the address block codec (RFC 1928)
//!
//! Address block layout: `ATYP (1) | ADDR | PORT (2, big-endian)` where ADDR
//! is 4 bytes (IPv4), 16 bytes (IPv6) or a length byte followed by that many
//! bytes of domain name.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::{AddressKind, Host, Result, TargetDescriptor, TunnelError};

pub const SOCKS5_VERSION: u8 = 0x05;

pub const METHOD_NO_AUTH: u8 = 0x00;

pub const CMD_CONNECT: u8 = 0x01;

pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

/// Greeting acknowledgement selecting NO AUTH
pub const NO_AUTH_ACK: [u8; 2] = [SOCKS5_VERSION, METHOD_NO_AUTH];

/// Reply codes sent to the local application.
///
/// The bound address in every reply is `0.0.0.0:0`; applications do not
/// depend on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Socks5Reply {
    Succeeded,
    GeneralFailure,
    CommandNotSupported,
}

impl Socks5Reply {
    pub fn code(self) -> u8 {
        match self {
            Socks5Reply::Succeeded => 0x00,
            Socks5Reply::GeneralFailure => 0x01,
            Socks5Reply::CommandNotSupported => 0x07,
        }
    }

    pub fn to_bytes(self) -> [u8; 10] {
        [SOCKS5_VERSION, self.code(), 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0]
    }
}

impl AddressKind {
    /// SOCKS5 ATYP tag
    pub fn atyp(self) -> u8 {
        match self {
            AddressKind::Ipv4 => ATYP_IPV4,
            AddressKind::DomainName => ATYP_DOMAIN,
            AddressKind::Ipv6 => ATYP_IPV6,
        }
    }

    pub fn from_atyp(atyp: u8) -> Result<Self> {
        match atyp {
            ATYP_IPV4 => Ok(AddressKind::Ipv4),
            ATYP_DOMAIN => Ok(AddressKind::DomainName),
            ATYP_IPV6 => Ok(AddressKind::Ipv6),
            other => Err(TunnelError::malformed(format!(
                "unknown address type {:#04x}",
                other
            ))),
        }
    }
}

fn truncated(need: usize, have: usize) -> TunnelError {
    TunnelError::malformed(format!(
        "address block truncated: need {} bytes, have {}",
        need, have
    ))
}

fn domain_from_bytes(raw: &[u8], port: u16) -> Result<TargetDescriptor> {
    let name = std::str::from_utf8(raw)
        .map_err(|_| TunnelError::malformed("domain name is not valid UTF-8"))?;
    TargetDescriptor::domain(name, port)
}

impl TargetDescriptor {
    /// Decode an address block from the front of `buf`.
    ///
    /// Returns the descriptor and the number of bytes consumed.
    pub fn decode_socks_addr(buf: &[u8]) -> Result<(Self, usize)> {
        let atyp = *buf.first().ok_or_else(|| truncated(1, 0))?;
        let kind = AddressKind::from_atyp(atyp)?;

        let (addr_start, addr_len) = match kind {
            AddressKind::Ipv4 => (1, 4),
            AddressKind::Ipv6 => (1, 16),
            AddressKind::DomainName => {
                let len = *buf.get(1).ok_or_else(|| truncated(2, buf.len()))? as usize;
                (2, len)
            }
        };

        let total = addr_start + addr_len + 2;
        if buf.len() < total {
            return Err(truncated(total, buf.len()));
        }

        let addr = &buf[addr_start..addr_start + addr_len];
        let port = u16::from_be_bytes([buf[total - 2], buf[total - 1]]);

        let target = match kind {
            AddressKind::Ipv4 => {
                let octets: [u8; 4] = addr.try_into().map_err(|_| truncated(4, addr.len()))?;
                Self::ipv4(Ipv4Addr::from(octets), port)?
            }
            AddressKind::Ipv6 => {
                let octets: [u8; 16] = addr.try_into().map_err(|_| truncated(16, addr.len()))?;
                Self::ipv6(Ipv6Addr::from(octets), port)?
            }
            AddressKind::DomainName => domain_from_bytes(addr, port)?,
        };

        Ok((target, total))
    }

    /// Read an address block from a live connection.
    ///
    /// The connection closing before the block is complete is reported as
    /// a malformed address.
    pub async fn read_socks_addr<R>(reader: &mut R) -> Result<Self>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut atyp = [0u8; 1];
        read_exact_or_malformed(reader, &mut atyp).await?;

        match AddressKind::from_atyp(atyp[0])? {
            AddressKind::Ipv4 => {
                let mut raw = [0u8; 4 + 2];
                read_exact_or_malformed(reader, &mut raw).await?;
                let ip = Ipv4Addr::new(raw[0], raw[1], raw[2], raw[3]);
                Self::ipv4(ip, u16::from_be_bytes([raw[4], raw[5]]))
            }
            AddressKind::Ipv6 => {
                let mut raw = [0u8; 16 + 2];
                read_exact_or_malformed(reader, &mut raw).await?;
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&raw[..16]);
                Self::ipv6(Ipv6Addr::from(octets), u16::from_be_bytes([raw[16], raw[17]]))
            }
            AddressKind::DomainName => {
                let mut len = [0u8; 1];
                read_exact_or_malformed(reader, &mut len).await?;
                let len = len[0] as usize;
                let mut raw = vec![0u8; len + 2];
                read_exact_or_malformed(reader, &mut raw).await?;
                let port = u16::from_be_bytes([raw[len], raw[len + 1]]);
                domain_from_bytes(&raw[..len], port)
            }
        }
    }

    /// Append the address block for this descriptor
    pub fn encode_socks_addr(&self, dst: &mut BytesMut) {
        dst.put_u8(self.address_kind().atyp());
        match self.host() {
            Host::Ip(IpAddr::V4(ip)) => dst.put_slice(&ip.octets()),
            Host::Ip(IpAddr::V6(ip)) => dst.put_slice(&ip.octets()),
            Host::Domain(name) => {
                // Constructor guarantees the name fits in one length byte.
                dst.put_u8(name.len() as u8);
                dst.put_slice(name.as_bytes());
            }
        }
        dst.put_u16(self.port());
    }

    pub fn to_socks_addr(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(1 + 1 + 255 + 2);
        self.encode_socks_addr(&mut buf);
        buf
    }
}

async fn read_exact_or_malformed<R>(reader: &mut R, buf: &mut [u8]) -> Result<()>
where
    R: AsyncRead + Unpin + ?Sized,
{
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(TunnelError::malformed(
            format!("connection closed inside address block ({} bytes expected)", buf.len()),
        )),
        Err(e) => Err(TunnelError::Io(e)),
    }
}
