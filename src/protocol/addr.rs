//! Self-describing socket address: `[family u8][address][port u16 BE]`.
//!
//! Two family tables are in use. Stream headers use the SOCKS5 numbering,
//! UoT envelopes use sing's compact numbering.

use crate::util::{AnyTlsError, Result};
use bytes::{Buf, BufMut, BytesMut};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Destinations whose textual form contains this token are UoT envelopes
pub const UOT_MAGIC_DOMAIN: &str = "udp-over-tcp.arpa";

/// Family byte assignment for one encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddrFamilies {
    pub ipv4: u8,
    pub ipv6: u8,
    pub domain: u8,
}

/// SOCKS5 numbering used in per-stream destination headers
pub const SOCKS_FAMILIES: AddrFamilies = AddrFamilies {
    ipv4: 0x01,
    ipv6: 0x04,
    domain: 0x03,
};

/// Numbering used inside UoT v2 requests and datagrams
pub const UOT_FAMILIES: AddrFamilies = AddrFamilies {
    ipv4: 0x00,
    ipv6: 0x01,
    domain: 0x02,
};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Host {
    Ip(IpAddr),
    Domain(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SocksAddr {
    pub host: Host,
    pub port: u16,
}

impl SocksAddr {
    pub fn new(host: Host, port: u16) -> Self {
        Self { host, port }
    }

    pub fn from_ip(ip: IpAddr, port: u16) -> Self {
        Self::new(Host::Ip(ip), port)
    }

    pub fn from_domain(domain: impl Into<String>, port: u16) -> Self {
        Self::new(Host::Domain(domain.into()), port)
    }

    /// Whether this destination selects the UDP-over-TCP path
    pub fn is_uot(&self) -> bool {
        matches!(&self.host, Host::Domain(d) if d.contains(UOT_MAGIC_DOMAIN))
    }

    /// Read one address from `reader`.
    pub async fn read_from<R>(reader: &mut R, families: AddrFamilies) -> Result<Self>
    where
        R: AsyncRead + Unpin,
    {
        let family = reader
            .read_u8()
            .await
            .map_err(|e| AnyTlsError::Protocol(format!("Failed to read address type: {}", e)))?;

        let host = if family == families.ipv4 {
            let mut octets = [0u8; 4];
            read_field(reader, &mut octets, "IPv4 address").await?;
            Host::Ip(IpAddr::V4(Ipv4Addr::from(octets)))
        } else if family == families.ipv6 {
            let mut octets = [0u8; 16];
            read_field(reader, &mut octets, "IPv6 address").await?;
            Host::Ip(IpAddr::V6(Ipv6Addr::from(octets)))
        } else if family == families.domain {
            let mut len = [0u8; 1];
            read_field(reader, &mut len, "domain length").await?;
            let mut domain = vec![0u8; len[0] as usize];
            read_field(reader, &mut domain, "domain").await?;
            Host::Domain(parse_domain(domain)?)
        } else {
            return Err(AnyTlsError::Protocol(format!(
                "Unsupported address type: 0x{:02x}",
                family
            )));
        };

        let mut port = [0u8; 2];
        read_field(reader, &mut port, "port").await?;
        Ok(Self::new(host, u16::from_be_bytes(port)))
    }

    /// Decode one address from the front of `src`.
    ///
    /// Returns `Ok(None)` and consumes nothing when `src` is incomplete.
    pub fn decode(src: &mut BytesMut, families: AddrFamilies) -> Result<Option<Self>> {
        let Some(&family) = src.first() else {
            return Ok(None);
        };

        let (host_len, header_len) = if family == families.ipv4 {
            (4, 1)
        } else if family == families.ipv6 {
            (16, 1)
        } else if family == families.domain {
            match src.get(1) {
                Some(&len) => (len as usize, 2),
                None => return Ok(None),
            }
        } else {
            return Err(AnyTlsError::Protocol(format!(
                "Unsupported address type: 0x{:02x}",
                family
            )));
        };

        if src.len() < header_len + host_len + 2 {
            return Ok(None);
        }

        src.advance(header_len);
        let raw = src.split_to(host_len);
        let host = if family == families.ipv4 {
            let octets: [u8; 4] = raw[..].try_into().map_err(|_| truncated("IPv4"))?;
            Host::Ip(IpAddr::V4(Ipv4Addr::from(octets)))
        } else if family == families.ipv6 {
            let octets: [u8; 16] = raw[..].try_into().map_err(|_| truncated("IPv6"))?;
            Host::Ip(IpAddr::V6(Ipv6Addr::from(octets)))
        } else {
            Host::Domain(parse_domain(raw.to_vec())?)
        };
        let port = src.get_u16();
        Ok(Some(Self::new(host, port)))
    }

    pub fn encode(&self, dst: &mut BytesMut, families: AddrFamilies) {
        match &self.host {
            Host::Ip(IpAddr::V4(ip)) => {
                dst.put_u8(families.ipv4);
                dst.put_slice(&ip.octets());
            }
            Host::Ip(IpAddr::V6(ip)) => {
                dst.put_u8(families.ipv6);
                dst.put_slice(&ip.octets());
            }
            Host::Domain(domain) => {
                // domains longer than 255 bytes are never produced by decode
                let bytes = &domain.as_bytes()[..domain.len().min(u8::MAX as usize)];
                dst.put_u8(families.domain);
                dst.put_u8(bytes.len() as u8);
                dst.put_slice(bytes);
            }
        }
        dst.put_u16(self.port);
    }

    /// Host part as text, for resolution
    pub fn host_str(&self) -> String {
        match &self.host {
            Host::Ip(ip) => ip.to_string(),
            Host::Domain(domain) => domain.clone(),
        }
    }
}

impl fmt::Display for SocksAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.host {
            Host::Ip(IpAddr::V6(ip)) => write!(f, "[{}]:{}", ip, self.port),
            Host::Ip(IpAddr::V4(ip)) => write!(f, "{}:{}", ip, self.port),
            Host::Domain(domain) => write!(f, "{}:{}", domain, self.port),
        }
    }
}

async fn read_field<R>(reader: &mut R, buf: &mut [u8], what: &str) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    reader
        .read_exact(buf)
        .await
        .map(|_| ())
        .map_err(|e| AnyTlsError::Protocol(format!("Failed to read {}: {}", what, e)))
}

fn parse_domain(raw: Vec<u8>) -> Result<String> {
    if raw.is_empty() {
        return Err(AnyTlsError::Protocol("Invalid domain length".to_string()));
    }
    String::from_utf8(raw).map_err(|e| AnyTlsError::Protocol(format!("Invalid domain name: {}", e)))
}

fn truncated(what: &str) -> AnyTlsError {
    AnyTlsError::Protocol(format!("Truncated {} address", what))
}
