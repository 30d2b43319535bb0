//! SOCKS4 and SOCKS4a front door

use super::{read_parsed, AuthPolicy, ConnectionHandler, Handshake, ProxyError, ReplyDialect};
use crate::protocol::TargetAddr;
use async_trait::async_trait;
use bytes::BytesMut;
use std::net::{Ipv4Addr, SocketAddr};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::debug;

const SOCKS4_VERSION: u8 = 0x04;
const CMD_CONNECT: u8 = 0x01;

/// Request granted
pub(crate) const GRANTED: u8 = 0x5A;

/// Request rejected or failed
pub(crate) const REJECTED: u8 = 0x5B;

/// Longest user id or domain accepted
const MAX_FIELD: usize = 255;

fn find_nul(buf: &[u8], from: usize) -> Result<Option<usize>, ProxyError> {
    match buf[from..].iter().position(|&b| b == 0) {
        Some(pos) => Ok(Some(from + pos)),
        None if buf.len() - from > MAX_FIELD => {
            Err(ProxyError::Malformed("SOCKS4 field too long".into()))
        }
        None => Ok(None),
    }
}

/// `04 CMD PORT(2) IP(4) USERID 00 [DOMAIN 00]`
pub(crate) fn parse_request(
    buf: &[u8],
) -> Result<Option<((u8, TargetAddr), usize)>, ProxyError> {
    if buf.len() < 9 {
        return Ok(None);
    }
    if buf[0] != SOCKS4_VERSION {
        return Err(ProxyError::InvalidSocksVersion(buf[0]));
    }
    let command = buf[1];
    let port = u16::from_be_bytes([buf[2], buf[3]]);
    let ip = Ipv4Addr::new(buf[4], buf[5], buf[6], buf[7]);

    let Some(user_end) = find_nul(buf, 8)? else {
        return Ok(None);
    };

    // 0.0.0.x with x != 0 announces a SOCKS4a domain
    let octets = ip.octets();
    if octets[..3] == [0, 0, 0] && octets[3] != 0 {
        let start = user_end + 1;
        if buf.len() <= start {
            return Ok(None);
        }
        let Some(domain_end) = find_nul(buf, start)? else {
            return Ok(None);
        };
        let domain = String::from_utf8_lossy(&buf[start..domain_end]).into_owned();
        if domain.is_empty() {
            return Err(ProxyError::Malformed("empty SOCKS4a domain".into()));
        }
        return Ok(Some((
            (command, TargetAddr::Domain(domain, port)),
            domain_end + 1,
        )));
    }

    Ok(Some(((command, TargetAddr::Ipv4(ip, port)), user_end + 1)))
}

fn reject_reply() -> [u8; 8] {
    [0x00, REJECTED, 0, 0, 0, 0, 0, 0]
}

/// SOCKS4/4a handler
pub struct Socks4Handler {
    auth: AuthPolicy,
}

impl Socks4Handler {
    pub fn new(auth: AuthPolicy) -> Self {
        Self { auth }
    }
}

#[async_trait]
impl ConnectionHandler for Socks4Handler {
    fn name(&self) -> &'static str {
        "socks4"
    }

    fn claims(&self, first: &[u8]) -> bool {
        first.first() == Some(&SOCKS4_VERSION)
    }

    async fn handshake(
        &self,
        stream: &mut TcpStream,
        mut buf: BytesMut,
        peer: SocketAddr,
    ) -> Result<Handshake, ProxyError> {
        let (command, target) = read_parsed(stream, &mut buf, parse_request).await?;

        // SOCKS4 carries no password
        if self.auth.required_for(&peer) {
            stream.write_all(&reject_reply()).await?;
            return Err(ProxyError::AuthenticationFailed);
        }
        if command != CMD_CONNECT {
            stream.write_all(&reject_reply()).await?;
            return Err(ProxyError::UnsupportedCommand(command));
        }

        debug!("SOCKS4 CONNECT {} from {}", target, peer);
        Ok(Handshake::new(target, ReplyDialect::Socks4).with_pending(buf.freeze()))
    }
}
