//! SOCKS5 front door (RFC 1928, RFC 1929)

use super::{
    read_parsed, AuthPolicy, ConnectionHandler, Handshake, ProxyError, ReplyDialect,
    UdpAssociation,
};
use crate::protocol::{ProtocolError, TargetAddr};
use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, UdpSocket};
use tracing::debug;

/// SOCKS5 version
const SOCKS_VERSION: u8 = 0x05;

/// Username/password sub-negotiation version
const AUTH_VERSION: u8 = 0x01;

/// Authentication methods
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AuthMethod {
    NoAuth = 0x00,
    UsernamePassword = 0x02,
    NoAcceptable = 0xFF,
}

/// SOCKS5 commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    Connect = 0x01,
    Bind = 0x02,
    UdpAssociate = 0x03,
}

impl TryFrom<u8> for Command {
    type Error = ProxyError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Command::Connect),
            0x02 => Ok(Command::Bind),
            0x03 => Ok(Command::UdpAssociate),
            _ => Err(ProxyError::UnsupportedCommand(value)),
        }
    }
}

/// Reply codes
#[derive(Debug, Clone, Copy)]
#[repr(u8)]
pub enum Reply {
    Succeeded = 0x00,
    GeneralFailure = 0x01,
    CommandNotSupported = 0x07,
    AddressTypeNotSupported = 0x08,
}

/// Client greeting: offered methods
pub(crate) fn parse_greeting(buf: &[u8]) -> Result<Option<(Vec<u8>, usize)>, ProxyError> {
    if buf.len() < 2 {
        return Ok(None);
    }
    if buf[0] != SOCKS_VERSION {
        return Err(ProxyError::InvalidSocksVersion(buf[0]));
    }
    let total = 2 + buf[1] as usize;
    if buf.len() < total {
        return Ok(None);
    }
    Ok(Some((buf[2..total].to_vec(), total)))
}

/// Username/password sub-negotiation
pub(crate) fn parse_credentials(
    buf: &[u8],
) -> Result<Option<((String, String), usize)>, ProxyError> {
    if buf.len() < 2 {
        return Ok(None);
    }
    if buf[0] != AUTH_VERSION {
        return Err(ProxyError::Malformed(format!("auth version {}", buf[0])));
    }
    let ulen = buf[1] as usize;
    if buf.len() < 2 + ulen + 1 {
        return Ok(None);
    }
    let plen = buf[2 + ulen] as usize;
    let total = 3 + ulen + plen;
    if buf.len() < total {
        return Ok(None);
    }
    let user = String::from_utf8_lossy(&buf[2..2 + ulen]).into_owned();
    let pass = String::from_utf8_lossy(&buf[3 + ulen..total]).into_owned();
    Ok(Some(((user, pass), total)))
}

/// Request: command and target
pub(crate) fn parse_request(
    buf: &[u8],
) -> Result<Option<((u8, TargetAddr), usize)>, ProxyError> {
    if buf.len() < 4 {
        return Ok(None);
    }
    if buf[0] != SOCKS_VERSION {
        return Err(ProxyError::InvalidSocksVersion(buf[0]));
    }
    match TargetAddr::decode(&buf[3..]) {
        Ok((target, used)) => Ok(Some(((buf[1], target), 3 + used))),
        Err(ProtocolError::Truncated { .. }) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Reply carrying a bound address
pub(crate) fn make_reply(reply: Reply, bound: SocketAddr) -> BytesMut {
    let mut buf = BytesMut::with_capacity(22);
    buf.put_slice(&[SOCKS_VERSION, reply as u8, 0x00]);
    match bound.ip() {
        IpAddr::V4(ip) => {
            buf.put_u8(0x01);
            buf.put_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            buf.put_u8(0x04);
            buf.put_slice(&ip.octets());
        }
    }
    buf.put_u16(bound.port());
    buf
}

fn unspecified() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 0))
}

/// SOCKS5 handler
pub struct Socks5Handler {
    auth: AuthPolicy,
}

impl Socks5Handler {
    pub fn new(auth: AuthPolicy) -> Self {
        Self { auth }
    }

    async fn bind_udp(
        stream: &TcpStream,
        requested: &TargetAddr,
        peer: SocketAddr,
    ) -> Result<(UdpAssociation, SocketAddr), ProxyError> {
        let local = stream.local_addr()?;
        let socket = UdpSocket::bind(SocketAddr::new(local.ip(), 0)).await?;
        let bound = socket.local_addr()?;
        let client_hint = requested
            .socket_addr()
            .filter(|a| a.port() != 0)
            .map(|a| if a.ip().is_unspecified() { SocketAddr::new(peer.ip(), a.port()) } else { a });
        Ok((
            UdpAssociation {
                socket: Arc::new(socket),
                client_hint,
            },
            bound,
        ))
    }
}

#[async_trait]
impl ConnectionHandler for Socks5Handler {
    fn name(&self) -> &'static str {
        "socks5"
    }

    fn claims(&self, first: &[u8]) -> bool {
        first.first() == Some(&SOCKS_VERSION)
    }

    async fn handshake(
        &self,
        stream: &mut TcpStream,
        mut buf: BytesMut,
        peer: SocketAddr,
    ) -> Result<Handshake, ProxyError> {
        let methods = read_parsed(stream, &mut buf, parse_greeting).await?;

        let method = if self.auth.required_for(&peer) {
            if methods.contains(&(AuthMethod::UsernamePassword as u8)) {
                AuthMethod::UsernamePassword
            } else {
                AuthMethod::NoAcceptable
            }
        } else if methods.contains(&(AuthMethod::NoAuth as u8)) {
            AuthMethod::NoAuth
        } else if methods.contains(&(AuthMethod::UsernamePassword as u8)) {
            // Accept whatever the client sends
            AuthMethod::UsernamePassword
        } else {
            AuthMethod::NoAcceptable
        };

        stream.write_all(&[SOCKS_VERSION, method as u8]).await?;
        if method == AuthMethod::NoAcceptable {
            return Err(ProxyError::AuthenticationFailed);
        }

        if method == AuthMethod::UsernamePassword {
            let (user, pass) = read_parsed(stream, &mut buf, parse_credentials).await?;
            let success = !self.auth.required_for(&peer) || self.auth.check(&user, &pass);
            stream
                .write_all(&[AUTH_VERSION, if success { 0x00 } else { 0x01 }])
                .await?;
            if !success {
                debug!("SOCKS5 authentication failed for {} from {}", user, peer);
                return Err(ProxyError::AuthenticationFailed);
            }
        }

        let (command, target) = match read_parsed(stream, &mut buf, parse_request).await {
            Ok(request) => request,
            Err(ProxyError::Protocol(ProtocolError::UnsupportedAddressType(t))) => {
                stream
                    .write_all(&make_reply(Reply::AddressTypeNotSupported, unspecified()))
                    .await?;
                return Err(ProtocolError::UnsupportedAddressType(t).into());
            }
            Err(e) => return Err(e),
        };

        match Command::try_from(command) {
            Ok(Command::Connect) => {
                debug!("SOCKS5 CONNECT {} from {}", target, peer);
                Ok(Handshake::new(target, ReplyDialect::Socks5).with_pending(buf.freeze()))
            }
            Ok(Command::UdpAssociate) => {
                let (udp, bound) = match Self::bind_udp(stream, &target, peer).await {
                    Ok(bound) => bound,
                    Err(e) => {
                        stream
                            .write_all(&make_reply(Reply::GeneralFailure, unspecified()))
                            .await?;
                        return Err(e);
                    }
                };
                stream.write_all(&make_reply(Reply::Succeeded, bound)).await?;
                debug!("SOCKS5 UDP ASSOCIATE from {} bound {}", peer, bound);
                let mut handshake = Handshake::new(target, ReplyDialect::Socks5Udp);
                handshake.udp = Some(udp);
                Ok(handshake)
            }
            Ok(Command::Bind) | Err(_) => {
                stream
                    .write_all(&make_reply(Reply::CommandNotSupported, unspecified()))
                    .await?;
                Err(ProxyError::UnsupportedCommand(command))
            }
        }
    }
}
