//! Handshake-free inbound connections

use super::{read_parsed, ConnectionHandler, Handshake, ProxyError, ReplyDialect};
use crate::protocol::{AddressType, ProtocolError, TargetAddr};
use async_trait::async_trait;
use bytes::BytesMut;
use std::net::SocketAddr;
use tokio::net::TcpStream;
use tracing::debug;

fn parse_header(buf: &[u8]) -> Result<Option<(TargetAddr, usize)>, ProxyError> {
    match TargetAddr::decode(buf) {
        Ok(parsed) => Ok(Some(parsed)),
        Err(ProtocolError::Truncated { .. }) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Connections that open with a SOCKS5-style address header
#[derive(Debug, Default)]
pub struct RawHandler;

impl RawHandler {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ConnectionHandler for RawHandler {
    fn name(&self) -> &'static str {
        "raw"
    }

    fn claims(&self, first: &[u8]) -> bool {
        matches!(
            first.first().map(|&b| AddressType::try_from(b)),
            Some(Ok(_))
        )
    }

    async fn handshake(
        &self,
        stream: &mut TcpStream,
        mut buf: BytesMut,
        peer: SocketAddr,
    ) -> Result<Handshake, ProxyError> {
        let target = read_parsed(stream, &mut buf, parse_header).await?;
        debug!("Raw header for {} from {}", target, peer);
        Ok(Handshake::new(target, ReplyDialect::Raw).with_pending(buf.freeze()))
    }
}

/// Every connection goes to one fixed target
#[derive(Debug)]
pub struct ForwardHandler {
    target: TargetAddr,
}

impl ForwardHandler {
    pub fn new(target: TargetAddr) -> Self {
        Self { target }
    }
}

#[async_trait]
impl ConnectionHandler for ForwardHandler {
    fn name(&self) -> &'static str {
        "forward"
    }

    fn claims(&self, _first: &[u8]) -> bool {
        true
    }

    fn claims_without_data(&self) -> bool {
        true
    }

    async fn handshake(
        &self,
        _stream: &mut TcpStream,
        buf: BytesMut,
        peer: SocketAddr,
    ) -> Result<Handshake, ProxyError> {
        debug!("Forwarding {} to {}", peer, self.target);
        let mut handshake =
            Handshake::new(self.target.clone(), ReplyDialect::Raw).with_pending(buf.freeze());
        handshake.forwarded = true;
        Ok(handshake)
    }
}
