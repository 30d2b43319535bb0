//! Protocol front door
//!
//! Turns an inbound connection into a [`Handshake`]: the normalized target,
//! the dialect the client expects its reply in, and any client bytes read
//! past the handshake. Handlers form a chain of responsibility probed with
//! the first bytes of the connection:
//! - SOCKS5 (RFC 1928, username/password per RFC 1929, UDP ASSOCIATE)
//! - SOCKS4 and SOCKS4a
//! - HTTP CONNECT and plain HTTP relaying
//! - raw SOCKS5-framed address headers and fixed forward ports

mod listener;
mod raw;
mod socks4;
mod socks5;

#[cfg(feature = "http-proxy")]
mod http;

pub use listener::{standard_handlers, ProxyListener};
pub use raw::{ForwardHandler, RawHandler};
pub use socks4::Socks4Handler;
pub use socks5::Socks5Handler;

#[cfg(feature = "http-proxy")]
pub use http::HttpHandler;

use crate::protocol::{ProtocolError, TargetAddr};
use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::{TcpStream, UdpSocket};

/// Reads that may end with an incomplete handshake before giving up
pub const MAX_INCOMPLETE_READS: usize = 3;

/// Proxy errors
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid SOCKS version: {0}")]
    InvalidSocksVersion(u8),

    #[error("Unsupported command: {0}")]
    UnsupportedCommand(u8),

    #[error("Authentication failed")]
    AuthenticationFailed,

    #[error("Malformed handshake: {0}")]
    Malformed(String),

    #[error("Handshake incomplete after {0} reads")]
    Incomplete(usize),

    #[error("Client closed during handshake")]
    ClientClosed,

    #[error("Handshake timed out")]
    Timeout,

    #[error("No handler claims first byte {0:#04x}")]
    Unclaimed(u8),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// How the client expects to hear that its target is connected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyDialect {
    Socks4,
    Socks5,
    HttpConnect,
    /// Plain HTTP: the request itself is the first tunnel payload
    HttpRelay,
    /// No handshake: raw address header or forward port
    Raw,
    /// SOCKS5 UDP ASSOCIATE, already answered
    Socks5Udp,
}

impl ReplyDialect {
    /// Bytes to send the client once the outbound side is connected
    pub fn success_reply(&self, target: &TargetAddr) -> Option<Bytes> {
        match self {
            ReplyDialect::Socks5 => Some(Bytes::from_static(&[
                0x05, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
            ])),
            ReplyDialect::Socks4 => {
                let mut reply = BytesMut::with_capacity(8);
                reply.put_u8(0x00);
                reply.put_u8(socks4::GRANTED);
                reply.put_u16(target.port());
                match target.ip() {
                    Some(IpAddr::V4(ip)) => reply.put_slice(&ip.octets()),
                    _ => reply.put_slice(&[0, 0, 0, 0]),
                }
                Some(reply.freeze())
            }
            ReplyDialect::HttpConnect => Some(Bytes::from_static(
                b"HTTP/1.1 200 Connection Established\r\n\r\n",
            )),
            ReplyDialect::HttpRelay | ReplyDialect::Raw | ReplyDialect::Socks5Udp => None,
        }
    }
}

/// Local UDP socket bound for a SOCKS5 UDP ASSOCIATE
#[derive(Debug, Clone)]
pub struct UdpAssociation {
    pub socket: Arc<UdpSocket>,
    /// Client address announced in the request, if any
    pub client_hint: Option<SocketAddr>,
}

/// Result of a completed front-door handshake
#[derive(Debug)]
pub struct Handshake {
    pub target: TargetAddr,
    pub dialect: ReplyDialect,
    /// Client bytes read past the handshake, to be sent first
    pub pending: Bytes,
    pub udp: Option<UdpAssociation>,
    /// Came in on a forward port
    pub forwarded: bool,
}

impl Handshake {
    pub fn new(target: TargetAddr, dialect: ReplyDialect) -> Self {
        Self {
            target,
            dialect,
            pending: Bytes::new(),
            udp: None,
            forwarded: false,
        }
    }

    pub fn with_pending(mut self, pending: Bytes) -> Self {
        self.pending = pending;
        self
    }
}

/// A connection whose handshake is complete
#[derive(Debug)]
pub struct Inbound {
    pub stream: TcpStream,
    pub peer: SocketAddr,
    /// Port of the listener that accepted it
    pub local_port: u16,
    pub handshake: Handshake,
}

/// Who may skip authentication
#[derive(Debug, Clone, Default)]
pub struct AuthPolicy {
    credentials: Option<(String, String)>,
}

impl AuthPolicy {
    pub fn new(credentials: Option<(String, String)>) -> Self {
        Self { credentials }
    }

    /// Loopback clients never authenticate
    pub fn required_for(&self, peer: &SocketAddr) -> bool {
        self.credentials.is_some() && !peer.ip().is_loopback()
    }

    pub fn check(&self, user: &str, pass: &str) -> bool {
        match &self.credentials {
            Some((u, p)) => u == user && p == pass,
            None => true,
        }
    }
}

/// One link of the front-door chain
#[async_trait]
pub trait ConnectionHandler: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether this handler owns a connection starting with `first`
    fn claims(&self, first: &[u8]) -> bool;

    /// Owns every connection without waiting for client bytes
    fn claims_without_data(&self) -> bool {
        false
    }

    /// Complete the handshake; `buf` holds the bytes read so far
    async fn handshake(
        &self,
        stream: &mut TcpStream,
        buf: BytesMut,
        peer: SocketAddr,
    ) -> Result<Handshake, ProxyError>;
}

/// Receives connections once their handshake is complete
#[async_trait]
pub trait SessionSink: Send + Sync {
    async fn dispatch(&self, inbound: Inbound);
}

/// Run an incremental parser over `buf`, reading more as needed.
///
/// `parse` returns `Ok(None)` while the input is incomplete, otherwise the
/// parsed value and the number of bytes it used; those are consumed from
/// `buf`.
pub(crate) async fn read_parsed<S, T, F>(
    stream: &mut S,
    buf: &mut BytesMut,
    mut parse: F,
) -> Result<T, ProxyError>
where
    S: AsyncRead + Unpin,
    F: FnMut(&[u8]) -> Result<Option<(T, usize)>, ProxyError>,
{
    let mut incomplete = 0;
    loop {
        if !buf.is_empty() {
            if let Some((value, used)) = parse(&buf[..])? {
                buf.advance(used);
                return Ok(value);
            }
            incomplete += 1;
            if incomplete > MAX_INCOMPLETE_READS {
                return Err(ProxyError::Incomplete(MAX_INCOMPLETE_READS));
            }
        }
        buf.reserve(1024);
        if stream.read_buf(buf).await? == 0 {
            return Err(ProxyError::ClientClosed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[test]
    fn test_success_replies() {
        let target = TargetAddr::Domain("example.com".into(), 443);
        assert_eq!(
            &ReplyDialect::Socks5.success_reply(&target).unwrap()[..],
            &[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0]
        );
        let v4 = TargetAddr::from_host("1.2.3.4", 80);
        assert_eq!(
            &ReplyDialect::Socks4.success_reply(&v4).unwrap()[..],
            &[0x00, 0x5A, 0x00, 0x50, 1, 2, 3, 4]
        );
        assert!(ReplyDialect::HttpConnect
            .success_reply(&target)
            .unwrap()
            .starts_with(b"HTTP/1.1 200"));
        assert!(ReplyDialect::Raw.success_reply(&target).is_none());
    }

    #[test]
    fn test_auth_policy_loopback_bypass() {
        let policy = AuthPolicy::new(Some(("u".into(), "p".into())));
        assert!(!policy.required_for(&"127.0.0.1:5000".parse().unwrap()));
        assert!(policy.required_for(&"192.168.1.5:5000".parse().unwrap()));
        assert!(policy.check("u", "p"));
        assert!(!policy.check("u", "x"));
        assert!(!AuthPolicy::default().required_for(&"10.0.0.1:1".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_read_parsed_gives_up() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let reader = tokio::spawn(async move {
            let mut buf = BytesMut::new();
            read_parsed(&mut server, &mut buf, |_| Ok(None::<((), usize)>)).await
        });
        for _ in 0..=MAX_INCOMPLETE_READS {
            client.write_all(b"x").await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        let result = reader.await.unwrap();
        assert!(matches!(result, Err(ProxyError::Incomplete(_))));
    }

    #[tokio::test]
    async fn test_read_parsed_consumes() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(b"abcdef").await.unwrap();
        let mut buf = BytesMut::new();
        let head = read_parsed(&mut server, &mut buf, |b| {
            Ok((b.len() >= 3).then(|| (b[..3].to_vec(), 3)))
        })
        .await
        .unwrap();
        assert_eq!(head, b"abc");
        assert_eq!(&buf[..], b"def");
    }
}
