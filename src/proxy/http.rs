//! HTTP proxy front door
//!
//! `CONNECT host:port` is answered once the outbound side is up. Any other
//! method is relayed: the request is rewritten to origin form without its
//! `Proxy-*` headers and becomes the first payload sent to the target.

use super::{read_parsed, AuthPolicy, ConnectionHandler, Handshake, ProxyError, ReplyDialect};
use crate::protocol::TargetAddr;
use async_trait::async_trait;
use base64::Engine;
use bytes::{BufMut, BytesMut};
use std::net::SocketAddr;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::debug;

/// Largest request head accepted
const MAX_HEAD: usize = 64 * 1024;

const MAX_HEADERS: usize = 96;

const METHODS: [&str; 9] = [
    "GET ", "POST ", "PUT ", "HEAD ", "DELETE ", "OPTIONS ", "CONNECT ", "PATCH ", "TRACE ",
];

const AUTH_REQUIRED: &[u8] = b"HTTP/1.1 407 Proxy Authentication Required\r\n\
Proxy-Authenticate: Basic realm=\"tunnel-gate\"\r\n\
Content-Length: 0\r\n\
Connection: close\r\n\r\n";

/// Request head as parsed
#[derive(Debug)]
pub(crate) struct RequestHead {
    pub method: String,
    pub path: String,
    pub version: u8,
    pub headers: Vec<(String, Vec<u8>)>,
}

impl RequestHead {
    fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_slice())
    }
}

pub(crate) fn parse_head(buf: &[u8]) -> Result<Option<(RequestHead, usize)>, ProxyError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut request = httparse::Request::new(&mut headers);
    match request.parse(buf) {
        Ok(httparse::Status::Complete(len)) => {
            let head = RequestHead {
                method: request.method.unwrap_or_default().to_string(),
                path: request.path.unwrap_or_default().to_string(),
                version: request.version.unwrap_or(1),
                headers: request
                    .headers
                    .iter()
                    .map(|h| (h.name.to_string(), h.value.to_vec()))
                    .collect(),
            };
            Ok(Some((head, len)))
        }
        Ok(httparse::Status::Partial) if buf.len() > MAX_HEAD => {
            Err(ProxyError::Malformed("HTTP request head too large".into()))
        }
        Ok(httparse::Status::Partial) => Ok(None),
        Err(e) => Err(ProxyError::Malformed(format!("HTTP request: {}", e))),
    }
}

/// `host[:port]`, IPv6 literals in brackets
fn parse_authority(authority: &str, default_port: u16) -> Result<TargetAddr, ProxyError> {
    let has_port = if authority.starts_with('[') {
        authority.contains("]:")
    } else {
        authority.matches(':').count() == 1
    };
    let target = if has_port {
        TargetAddr::parse(authority)?
    } else {
        TargetAddr::from_host(authority, default_port)
    };
    if target.host().is_empty() {
        return Err(ProxyError::Malformed(format!("empty host in {}", authority)));
    }
    Ok(target)
}

/// Target and origin-form path of a relayed request
fn relay_target(head: &RequestHead) -> Result<(TargetAddr, String), ProxyError> {
    let lower = head.path.to_ascii_lowercase();
    if lower.starts_with("http://") {
        let rest = &head.path[7..];
        let (authority, path) = match rest.find('/') {
            Some(slash) => (&rest[..slash], rest[slash..].to_string()),
            None => (rest, "/".to_string()),
        };
        return Ok((parse_authority(authority, 80)?, path));
    }
    if lower.starts_with("https://") {
        return Err(ProxyError::Malformed("https:// requires CONNECT".into()));
    }

    let host = head
        .header("Host")
        .map(|h| String::from_utf8_lossy(h).trim().to_string())
        .filter(|h| !h.is_empty())
        .ok_or_else(|| ProxyError::Malformed("request without host".into()))?;
    Ok((parse_authority(&host, 80)?, head.path.clone()))
}

/// Rewrite a proxy request for the origin server
pub(crate) fn rewrite_request(head: &RequestHead, path: &str, target: &TargetAddr) -> BytesMut {
    let mut out = BytesMut::with_capacity(512);
    out.put_slice(format!("{} {} HTTP/1.{}\r\n", head.method, path, head.version).as_bytes());
    if head.header("Host").is_none() {
        out.put_slice(format!("Host: {}\r\n", authority_of(target)).as_bytes());
    }
    for (name, value) in &head.headers {
        if name.len() >= 6 && name[..6].eq_ignore_ascii_case("proxy-") {
            continue;
        }
        out.put_slice(name.as_bytes());
        out.put_slice(b": ");
        out.put_slice(value);
        out.put_slice(b"\r\n");
    }
    out.put_slice(b"\r\n");
    out
}

fn authority_of(target: &TargetAddr) -> String {
    if target.port() == 80 {
        match target {
            TargetAddr::Ipv6(ip, _) => format!("[{}]", ip),
            _ => target.host(),
        }
    } else {
        target.to_string()
    }
}

fn basic_credentials(value: &[u8]) -> Option<(String, String)> {
    let value = std::str::from_utf8(value).ok()?.trim();
    let encoded = value
        .strip_prefix("Basic ")
        .or_else(|| value.strip_prefix("basic "))?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .ok()?;
    let credentials = String::from_utf8(decoded).ok()?;
    let (user, pass) = credentials.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}

/// HTTP proxy handler
pub struct HttpHandler {
    auth: AuthPolicy,
}

impl HttpHandler {
    pub fn new(auth: AuthPolicy) -> Self {
        Self { auth }
    }

    fn authenticated(&self, head: &RequestHead, peer: &SocketAddr) -> bool {
        if !self.auth.required_for(peer) {
            return true;
        }
        head.header("Proxy-Authorization")
            .and_then(basic_credentials)
            .map_or(false, |(user, pass)| self.auth.check(&user, &pass))
    }
}

#[async_trait]
impl ConnectionHandler for HttpHandler {
    fn name(&self) -> &'static str {
        "http"
    }

    fn claims(&self, first: &[u8]) -> bool {
        !first.is_empty()
            && METHODS.iter().any(|m| {
                let n = m.len().min(first.len());
                first[..n] == m.as_bytes()[..n]
            })
    }

    async fn handshake(
        &self,
        stream: &mut TcpStream,
        mut buf: BytesMut,
        peer: SocketAddr,
    ) -> Result<Handshake, ProxyError> {
        let head = read_parsed(stream, &mut buf, parse_head).await?;

        if !self.authenticated(&head, &peer) {
            stream.write_all(AUTH_REQUIRED).await?;
            debug!("HTTP proxy authentication failed from {}", peer);
            return Err(ProxyError::AuthenticationFailed);
        }

        if head.method.eq_ignore_ascii_case("CONNECT") {
            let target = parse_authority(&head.path, 443)?;
            debug!("HTTP CONNECT {} from {}", target, peer);
            return Ok(Handshake::new(target, ReplyDialect::HttpConnect).with_pending(buf.freeze()));
        }

        let (target, path) = relay_target(&head)?;
        debug!("HTTP {} {} via {} from {}", head.method, path, target, peer);
        let mut first = rewrite_request(&head, &path, &target);
        first.extend_from_slice(&buf);
        Ok(Handshake::new(target, ReplyDialect::HttpRelay).with_pending(first.freeze()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn head(raw: &[u8]) -> RequestHead {
        parse_head(raw).unwrap().unwrap().0
    }

    #[test]
    fn test_claims_methods() {
        let handler = HttpHandler::new(AuthPolicy::default());
        assert!(handler.claims(b"CONNECT example.com:443 HTTP/1.1"));
        assert!(handler.claims(b"GE"));
        assert!(!handler.claims(b"\x05\x01\x00"));
        assert!(!handler.claims(b"GOT /"));
    }

    #[test]
    fn test_partial_head() {
        assert!(parse_head(b"GET / HTTP/1.1\r\nHost: a").unwrap().is_none());
        assert!(parse_head(b"\x00\x01garbage\r\n\r\n").is_err());
    }

    #[test]
    fn test_connect_target() {
        let h = head(b"CONNECT example.com:8443 HTTP/1.1\r\nHost: example.com:8443\r\n\r\n");
        assert_eq!(
            parse_authority(&h.path, 443).unwrap(),
            TargetAddr::Domain("example.com".into(), 8443)
        );
        assert_eq!(
            parse_authority("[2001:db8::1]:443", 443).unwrap().to_string(),
            "[2001:db8::1]:443"
        );
        assert_eq!(
            parse_authority("[2001:db8::1]", 80).unwrap().to_string(),
            "[2001:db8::1]:80"
        );
        assert_eq!(parse_authority("example.com", 443).unwrap().port(), 443);
    }

    #[test]
    fn test_relay_rewrite() {
        let h = head(
            b"GET http://example.com:8080/index.html?q=1 HTTP/1.1\r\n\
Host: example.com:8080\r\n\
Proxy-Connection: keep-alive\r\n\
Proxy-Authorization: Basic dTpw\r\n\
Accept: */*\r\n\r\n",
        );
        let (target, path) = relay_target(&h).unwrap();
        assert_eq!(target, TargetAddr::Domain("example.com".into(), 8080));
        assert_eq!(path, "/index.html?q=1");

        let out = rewrite_request(&h, &path, &target);
        let text = String::from_utf8(out.to_vec()).unwrap();
        assert!(text.starts_with("GET /index.html?q=1 HTTP/1.1\r\n"));
        assert!(text.contains("Host: example.com:8080\r\n"));
        assert!(text.contains("Accept: */*\r\n"));
        assert!(!text.to_ascii_lowercase().contains("proxy-"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_relay_without_host_header() {
        let h = head(b"GET http://example.com HTTP/1.0\r\n\r\n");
        let (target, path) = relay_target(&h).unwrap();
        assert_eq!(path, "/");
        let text = String::from_utf8(rewrite_request(&h, &path, &target).to_vec()).unwrap();
        assert_eq!(text, "GET / HTTP/1.0\r\nHost: example.com\r\n\r\n");

        let no_host = head(b"GET /x HTTP/1.1\r\n\r\n");
        assert!(relay_target(&no_host).is_err());
    }

    #[test]
    fn test_basic_credentials() {
        assert_eq!(
            basic_credentials(b"Basic dTpw"),
            Some(("u".to_string(), "p".to_string()))
        );
        assert_eq!(basic_credentials(b"Bearer abc"), None);
        assert_eq!(basic_credentials(b"Basic !!!"), None);
    }

    #[test]
    fn test_auth_check() {
        let handler = HttpHandler::new(AuthPolicy::new(Some(("u".into(), "p".into()))));
        let remote: SocketAddr = "192.168.0.9:1234".parse().unwrap();
        let with = head(b"CONNECT a:1 HTTP/1.1\r\nProxy-Authorization: Basic dTpw\r\n\r\n");
        let without = head(b"CONNECT a:1 HTTP/1.1\r\n\r\n");
        assert!(handler.authenticated(&with, &remote));
        assert!(!handler.authenticated(&without, &remote));
        assert!(handler.authenticated(&without, &"127.0.0.1:1".parse().unwrap()));
    }
}
