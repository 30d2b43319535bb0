//! Protocol definitions and constants
//!
//! The target of every proxied connection is carried internally as a
//! SOCKS5-style address header:
//!
//! ```text
//! +------+----------+----------+
//! | ATYP | DST.ADDR | DST.PORT |
//! +------+----------+----------+
//! |  1   | Variable |    2     |
//! +------+----------+----------+
//! ```
//!
//! `ATYP` is `0x01` (IPv4, 4 bytes), `0x03` (domain, 1 length byte + name)
//! or `0x04` (IPv6, 16 bytes). The port is big endian.

use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use thiserror::Error;

/// Protocol errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Address header truncated: need {needed} more bytes")]
    Truncated { needed: usize },

    #[error("Address type not supported: {0:#04x}")]
    UnsupportedAddressType(u8),

    #[error("Domain name too long: {0} bytes")]
    DomainTooLong(usize),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),
}

/// Flag OR-ed into the address type of the first tunnel header when the
/// session carries UDP datagrams over the TCP tunnel.
pub const UDP_OVER_TCP_FLAG: u8 = 0x08;

/// Handshake timeout in seconds
pub const HANDSHAKE_TIMEOUT: u64 = 10;

/// Idle timeout in seconds
pub const IDLE_TIMEOUT: u64 = 60;

/// Connect timeout in seconds
pub const CONNECT_TIMEOUT: u64 = 5;

/// Keepalive interval in seconds
pub const KEEPALIVE_INTERVAL: u64 = 30;

/// Address type byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AddressType {
    Ipv4 = 0x01,
    Domain = 0x03,
    Ipv6 = 0x04,
}

impl TryFrom<u8> for AddressType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(AddressType::Ipv4),
            0x03 => Ok(AddressType::Domain),
            0x04 => Ok(AddressType::Ipv6),
            _ => Err(ProtocolError::UnsupportedAddressType(value)),
        }
    }
}

/// Normalized target of a proxied connection
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TargetAddr {
    /// IPv4 address and port
    Ipv4(Ipv4Addr, u16),
    /// IPv6 address and port
    Ipv6(Ipv6Addr, u16),
    /// Domain name and port
    Domain(String, u16),
}

impl TargetAddr {
    /// Build a target from a host string that may be an IP literal
    pub fn from_host(host: &str, port: u16) -> Self {
        let trimmed = host.trim_start_matches('[').trim_end_matches(']');
        match trimmed.parse::<IpAddr>() {
            Ok(ip) => Self::from(SocketAddr::new(ip, port)),
            Err(_) => TargetAddr::Domain(host.to_string(), port),
        }
    }

    /// Parse `host:port` (IPv6 literals in brackets)
    pub fn parse(s: &str) -> Result<Self, ProtocolError> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| ProtocolError::InvalidAddress(s.to_string()))?;
        let port: u16 = port
            .parse()
            .map_err(|_| ProtocolError::InvalidAddress(s.to_string()))?;
        if host.is_empty() {
            return Err(ProtocolError::InvalidAddress(s.to_string()));
        }
        Ok(Self::from_host(host, port))
    }

    /// Get the port
    pub fn port(&self) -> u16 {
        match self {
            TargetAddr::Ipv4(_, port) => *port,
            TargetAddr::Ipv6(_, port) => *port,
            TargetAddr::Domain(_, port) => *port,
        }
    }

    /// Host part without the port
    pub fn host(&self) -> String {
        match self {
            TargetAddr::Ipv4(ip, _) => ip.to_string(),
            TargetAddr::Ipv6(ip, _) => ip.to_string(),
            TargetAddr::Domain(domain, _) => domain.clone(),
        }
    }

    /// IP address when the target is a literal
    pub fn ip(&self) -> Option<IpAddr> {
        match self {
            TargetAddr::Ipv4(ip, _) => Some(IpAddr::V4(*ip)),
            TargetAddr::Ipv6(ip, _) => Some(IpAddr::V6(*ip)),
            TargetAddr::Domain(..) => None,
        }
    }

    /// Socket address when the target is a literal
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        self.ip().map(|ip| SocketAddr::new(ip, self.port()))
    }

    /// Replace a domain by its resolved address, keeping the port
    pub fn with_resolved(&self, ip: IpAddr) -> Self {
        Self::from(SocketAddr::new(ip, self.port()))
    }

    /// Number of bytes `write_to` produces
    pub fn encoded_len(&self) -> usize {
        match self {
            TargetAddr::Ipv4(..) => 1 + 4 + 2,
            TargetAddr::Ipv6(..) => 1 + 16 + 2,
            TargetAddr::Domain(domain, _) => 1 + 1 + domain.len() + 2,
        }
    }

    /// Append the address header to `buf`
    pub fn write_to(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        self.write_with_type_flags(buf, 0)
    }

    /// Append the address header with extra bits OR-ed into the type byte
    pub fn write_with_type_flags(&self, buf: &mut BytesMut, flags: u8) -> Result<(), ProtocolError> {
        buf.reserve(self.encoded_len());
        match self {
            TargetAddr::Ipv4(ip, port) => {
                buf.put_u8(AddressType::Ipv4 as u8 | flags);
                buf.put_slice(&ip.octets());
                buf.put_u16(*port);
            }
            TargetAddr::Ipv6(ip, port) => {
                buf.put_u8(AddressType::Ipv6 as u8 | flags);
                buf.put_slice(&ip.octets());
                buf.put_u16(*port);
            }
            TargetAddr::Domain(domain, port) => {
                if domain.len() > u8::MAX as usize {
                    return Err(ProtocolError::DomainTooLong(domain.len()));
                }
                buf.put_u8(AddressType::Domain as u8 | flags);
                buf.put_u8(domain.len() as u8);
                buf.put_slice(domain.as_bytes());
                buf.put_u16(*port);
            }
        }
        Ok(())
    }

    /// Encode the address header into a fresh buffer
    pub fn to_bytes(&self) -> Result<Bytes, ProtocolError> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.write_to(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Decode an address header from the start of `buf`.
    ///
    /// Returns the target and the number of bytes consumed. Incomplete input
    /// yields [`ProtocolError::Truncated`] so callers can read more.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize), ProtocolError> {
        let Some(&atyp) = buf.first() else {
            return Err(ProtocolError::Truncated { needed: 1 });
        };

        match AddressType::try_from(atyp & !UDP_OVER_TCP_FLAG)? {
            AddressType::Ipv4 => {
                let total = 1 + 4 + 2;
                ensure_len(buf, total)?;
                let ip = Ipv4Addr::new(buf[1], buf[2], buf[3], buf[4]);
                let port = u16::from_be_bytes([buf[5], buf[6]]);
                Ok((TargetAddr::Ipv4(ip, port), total))
            }
            AddressType::Ipv6 => {
                let total = 1 + 16 + 2;
                ensure_len(buf, total)?;
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&buf[1..17]);
                let port = u16::from_be_bytes([buf[17], buf[18]]);
                Ok((TargetAddr::Ipv6(Ipv6Addr::from(octets), port), total))
            }
            AddressType::Domain => {
                ensure_len(buf, 2)?;
                let len = buf[1] as usize;
                let total = 1 + 1 + len + 2;
                ensure_len(buf, total)?;
                let domain = String::from_utf8_lossy(&buf[2..2 + len]).to_string();
                let port = u16::from_be_bytes([buf[2 + len], buf[3 + len]]);
                Ok((TargetAddr::Domain(domain, port), total))
            }
        }
    }
}

fn ensure_len(buf: &[u8], total: usize) -> Result<(), ProtocolError> {
    if buf.len() < total {
        Err(ProtocolError::Truncated {
            needed: total - buf.len(),
        })
    } else {
        Ok(())
    }
}

impl From<SocketAddr> for TargetAddr {
    fn from(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(v4) => TargetAddr::Ipv4(*v4.ip(), v4.port()),
            SocketAddr::V6(v6) => match v6.ip().to_ipv4_mapped() {
                Some(v4) => TargetAddr::Ipv4(v4, v6.port()),
                None => TargetAddr::Ipv6(*v6.ip(), v6.port()),
            },
        }
    }
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetAddr::Ipv4(ip, port) => write!(f, "{}:{}", ip, port),
            TargetAddr::Ipv6(ip, port) => write!(f, "[{}]:{}", ip, port),
            TargetAddr::Domain(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(addr: TargetAddr) {
        let encoded = addr.to_bytes().unwrap();
        assert_eq!(encoded.len(), addr.encoded_len());
        let (decoded, used) = TargetAddr::decode(&encoded).unwrap();
        assert_eq!(decoded, addr);
        assert_eq!(used, encoded.len());
    }

    #[test]
    fn test_round_trip_boundaries() {
        round_trip(TargetAddr::Ipv4(Ipv4Addr::new(1, 2, 3, 4), 0));
        round_trip(TargetAddr::Ipv4(Ipv4Addr::new(255, 255, 255, 255), 65535));
        round_trip(TargetAddr::Ipv6(Ipv6Addr::LOCALHOST, 0));
        round_trip(TargetAddr::Ipv6("2001:db8::1".parse().unwrap(), 65535));
        round_trip(TargetAddr::Domain(String::new(), 80));
        round_trip(TargetAddr::Domain("a".repeat(255), 65535));
    }

    #[test]
    fn test_domain_wire_format() {
        let addr = TargetAddr::Domain("example.com".to_string(), 443);
        let encoded = addr.to_bytes().unwrap();
        let mut expected = vec![0x03, 0x0b];
        expected.extend_from_slice(b"example.com");
        expected.extend_from_slice(&[0x01, 0xbb]);
        assert_eq!(&encoded[..], &expected[..]);
    }

    #[test]
    fn test_domain_too_long() {
        let addr = TargetAddr::Domain("a".repeat(256), 80);
        assert!(matches!(
            addr.to_bytes(),
            Err(ProtocolError::DomainTooLong(256))
        ));
    }

    #[test]
    fn test_truncated() {
        let err = TargetAddr::decode(&[0x01, 10, 0]).unwrap_err();
        assert!(matches!(err, ProtocolError::Truncated { needed: 4 }));

        let err = TargetAddr::decode(&[0x03]).unwrap_err();
        assert!(matches!(err, ProtocolError::Truncated { .. }));
    }

    #[test]
    fn test_unsupported_type() {
        assert!(matches!(
            TargetAddr::decode(&[0x07, 0, 0]),
            Err(ProtocolError::UnsupportedAddressType(0x07))
        ));
    }

    #[test]
    fn test_udp_flag_is_ignored_on_decode() {
        let addr = TargetAddr::Ipv4(Ipv4Addr::new(8, 8, 8, 8), 53);
        let mut buf = BytesMut::new();
        addr.write_with_type_flags(&mut buf, UDP_OVER_TCP_FLAG).unwrap();
        assert_eq!(buf[0], 0x09);
        let (decoded, _) = TargetAddr::decode(&buf).unwrap();
        assert_eq!(decoded, addr);
    }

    #[test]
    fn test_parse_host_port() {
        assert_eq!(
            TargetAddr::parse("example.com:443").unwrap(),
            TargetAddr::Domain("example.com".into(), 443)
        );
        assert_eq!(
            TargetAddr::parse("[::1]:8080").unwrap(),
            TargetAddr::Ipv6(Ipv6Addr::LOCALHOST, 8080)
        );
        assert_eq!(
            TargetAddr::parse("10.0.0.1:22").unwrap(),
            TargetAddr::Ipv4(Ipv4Addr::new(10, 0, 0, 1), 22)
        );
        assert!(TargetAddr::parse("nohost").is_err());
        assert!(TargetAddr::parse(":80").is_err());
    }

    #[test]
    fn test_with_resolved() {
        let addr = TargetAddr::Domain("example.com".into(), 443);
        let resolved = addr.with_resolved("93.184.216.34".parse().unwrap());
        assert_eq!(resolved.to_string(), "93.184.216.34:443");
    }
}
