//! Upstream proxy chaining
//!
//! Client side of the SOCKS5 (RFC 1928/1929) and HTTP CONNECT handshakes,
//! used to reach targets or tunnel servers through another proxy.

use super::{Dialer, TcpDialer, TransportConfig, TransportError};
use crate::config::UpstreamProxyConfig;
use crate::protocol::TargetAddr;
use async_trait::async_trait;
use base64::Engine;
use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

/// Largest HTTP response head accepted from the upstream
const MAX_RESPONSE_HEAD: usize = 8192;

/// Upstream proxy protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamKind {
    Socks5,
    Http,
}

/// A configured upstream proxy
#[derive(Debug, Clone)]
pub struct UpstreamProxy {
    kind: UpstreamKind,
    server: TargetAddr,
    credentials: Option<(String, String)>,
    tcp: TcpDialer,
}

impl UpstreamProxy {
    pub fn from_config(
        config: &UpstreamProxyConfig,
        transport: TransportConfig,
    ) -> Result<Self, TransportError> {
        let server = TargetAddr::parse(&config.server)?;
        let credentials = match (&config.username, &config.password) {
            (Some(user), Some(pass)) if !user.is_empty() => Some((user.clone(), pass.clone())),
            (Some(user), None) if !user.is_empty() => Some((user.clone(), String::new())),
            _ => None,
        };
        Ok(Self {
            kind: config.kind,
            server,
            credentials,
            tcp: TcpDialer::new(transport),
        })
    }

    pub fn kind(&self) -> UpstreamKind {
        self.kind
    }

    /// Run the upstream handshake for `target` over an open stream
    pub async fn handshake<S>(&self, stream: &mut S, target: &TargetAddr) -> Result<(), TransportError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let credentials = self.credentials.as_ref().map(|(u, p)| (u.as_str(), p.as_str()));
        let handshake = async {
            match self.kind {
                UpstreamKind::Socks5 => socks5_connect(stream, target, credentials).await,
                UpstreamKind::Http => http_connect(stream, target, credentials).await,
            }
        };
        tokio::time::timeout(self.tcp.config().connect_timeout, handshake)
            .await
            .map_err(|_| TransportError::Timeout)?
    }
}

#[async_trait]
impl Dialer for UpstreamProxy {
    async fn dial(&self, target: &TargetAddr) -> Result<TcpStream, TransportError> {
        let mut stream = self.tcp.dial(&self.server).await?;
        debug!("Upstream {:?} proxy {} -> {}", self.kind, self.server, target);
        self.handshake(&mut stream, target).await?;
        Ok(stream)
    }
}

/// SOCKS5 CONNECT through an upstream proxy
pub async fn socks5_connect<S>(
    stream: &mut S,
    target: &TargetAddr,
    credentials: Option<(&str, &str)>,
) -> Result<(), TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let method = if credentials.is_some() { 0x02 } else { 0x00 };
    stream.write_all(&[0x05, 0x01, method]).await?;

    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await?;
    if choice[0] != 0x05 {
        return Err(TransportError::Upstream(format!("bad SOCKS version {}", choice[0])));
    }
    match (choice[1], credentials) {
        (0x00, _) => {}
        (0x02, Some((user, pass))) => {
            if user.len() > 255 || pass.len() > 255 {
                return Err(TransportError::Upstream("credentials too long".into()));
            }
            let mut auth = Vec::with_capacity(3 + user.len() + pass.len());
            auth.push(0x01);
            auth.push(user.len() as u8);
            auth.extend_from_slice(user.as_bytes());
            auth.push(pass.len() as u8);
            auth.extend_from_slice(pass.as_bytes());
            stream.write_all(&auth).await?;

            let mut status = [0u8; 2];
            stream.read_exact(&mut status).await?;
            if status[1] != 0x00 {
                return Err(TransportError::AuthenticationFailed);
            }
        }
        (0xFF, _) | (0x02, None) => return Err(TransportError::AuthenticationFailed),
        (other, _) => {
            return Err(TransportError::Upstream(format!("unsupported method {:#04x}", other)))
        }
    }

    let mut request = BytesMut::with_capacity(3 + target.encoded_len());
    request.extend_from_slice(&[0x05, 0x01, 0x00]);
    target.write_to(&mut request)?;
    stream.write_all(&request).await?;

    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    if head[1] != 0x00 {
        return Err(TransportError::ConnectionFailed(format!(
            "upstream SOCKS5 reply {:#04x}",
            head[1]
        )));
    }
    // Drain the bound address
    let rest = match head[3] {
        0x01 => 4 + 2,
        0x04 => 16 + 2,
        0x03 => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            len[0] as usize + 2
        }
        other => {
            return Err(TransportError::Upstream(format!("bad address type {:#04x}", other)))
        }
    };
    let mut bound = vec![0u8; rest];
    stream.read_exact(&mut bound).await?;
    Ok(())
}

/// HTTP CONNECT through an upstream proxy
pub async fn http_connect<S>(
    stream: &mut S,
    target: &TargetAddr,
    credentials: Option<(&str, &str)>,
) -> Result<(), TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let authority = target.to_string();
    let mut request = format!(
        "CONNECT {0} HTTP/1.1\r\nHost: {0}\r\nProxy-Connection: keep-alive\r\n",
        authority
    );
    if let Some((user, pass)) = credentials {
        let token = base64::engine::general_purpose::STANDARD.encode(format!("{}:{}", user, pass));
        request.push_str(&format!("Proxy-Authorization: Basic {}\r\n", token));
    }
    request.push_str("\r\n");
    stream.write_all(request.as_bytes()).await?;

    // Byte at a time so nothing past the head is consumed
    let mut head = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_RESPONSE_HEAD {
            return Err(TransportError::Upstream("response head too large".into()));
        }
        if stream.read(&mut byte).await? == 0 {
            return Err(TransportError::Closed);
        }
        head.push(byte[0]);
    }

    let (code, reason) = response_status(&head)?;
    match code {
        200..=299 => Ok(()),
        407 => Err(TransportError::AuthenticationFailed),
        _ => Err(TransportError::ConnectionFailed(format!(
            "upstream answered {} {}",
            code, reason
        ))),
    }
}

/// Status code and reason of a complete response head
#[cfg(feature = "http-proxy")]
fn response_status(head: &[u8]) -> Result<(u16, String), TransportError> {
    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut response = httparse::Response::new(&mut headers);
    match response.parse(head) {
        Ok(httparse::Status::Complete(_)) => Ok((
            response.code.unwrap_or_default(),
            response.reason.unwrap_or_default().to_string(),
        )),
        Ok(httparse::Status::Partial) => {
            Err(TransportError::Upstream("truncated response head".into()))
        }
        Err(e) => Err(TransportError::Upstream(format!("bad response: {}", e))),
    }
}

#[cfg(not(feature = "http-proxy"))]
fn response_status(head: &[u8]) -> Result<(u16, String), TransportError> {
    let line = head.split(|&b| b == b'\n').next().unwrap_or_default();
    let line = String::from_utf8_lossy(line);
    let mut parts = line.trim().splitn(3, ' ');
    if !parts.next().unwrap_or_default().starts_with("HTTP/1.") {
        return Err(TransportError::Upstream(format!("bad status line '{}'", line.trim())));
    }
    let code = parts
        .next()
        .and_then(|c| c.parse::<u16>().ok())
        .ok_or_else(|| TransportError::Upstream(format!("bad status line '{}'", line.trim())))?;
    Ok((code, parts.next().unwrap_or_default().to_string()))
}
