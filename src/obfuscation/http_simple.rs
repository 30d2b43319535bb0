//! `http_simple` obfuscation: the first packet travels as an HTTP GET
//!
//! The head of the cipher stream is percent-encoded into the request path,
//! the rest follows the request head unchanged. The server answers with an
//! HTTP response head that is stripped before decryption.

use super::{ObfsPlugin, ObfuscationError, PluginContext};
use crate::crypto::random_bytes;
use bytes::{Bytes, BytesMut};
use std::fmt::Write;

const USER_AGENTS: [&str; 3] = [
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:109.0) Gecko/20100101 Firefox/115.0",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.1 Safari/605.1.15",
];

/// Upper bound on a buffered response head
const MAX_RESPONSE_HEAD: usize = 16 * 1024;

/// `http_simple` obfuscation plugin
pub struct HttpSimple {
    ctx: PluginContext,
    sent_header: bool,
    recv_header: bool,
    recv_buf: BytesMut,
}

impl HttpSimple {
    pub fn new(ctx: PluginContext) -> Self {
        Self {
            ctx,
            sent_header: false,
            recv_header: false,
            recv_buf: BytesMut::new(),
        }
    }

    fn random_index(len: usize) -> usize {
        let mut buf = [0u8; 2];
        random_bytes(&mut buf);
        u16::from_le_bytes(buf) as usize % len.max(1)
    }

    fn pick_host(&self) -> String {
        let hosts: Vec<&str> = self
            .ctx
            .param
            .split(',')
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .collect();
        if hosts.is_empty() {
            self.ctx.host.clone()
        } else {
            hosts[Self::random_index(hosts.len())].to_string()
        }
    }

    fn build_request(&self, head: &[u8]) -> String {
        let mut path = String::with_capacity(head.len() * 3);
        for b in head {
            let _ = write!(path, "%{:02x}", b);
        }

        let port = if self.ctx.port == 80 {
            String::new()
        } else {
            format!(":{}", self.ctx.port)
        };

        format!(
            "GET /{} HTTP/1.1\r\nHost: {}{}\r\nUser-Agent: {}\r\nAccept: text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8\r\nAccept-Language: en-US,en;q=0.8\r\nAccept-Encoding: gzip, deflate\r\nDNT: 1\r\nConnection: keep-alive\r\n\r\n",
            path,
            self.pick_host(),
            port,
            USER_AGENTS[Self::random_index(USER_AGENTS.len())],
        )
    }
}

impl ObfsPlugin for HttpSimple {
    fn name(&self) -> &'static str {
        "http_simple"
    }

    fn client_encode(&mut self, data: &[u8]) -> Result<Bytes, ObfuscationError> {
        if self.sent_header || data.is_empty() {
            return Ok(Bytes::copy_from_slice(data));
        }

        let head_size = self.ctx.iv_len + self.ctx.head_len;
        let head_len = if data.len() > head_size + 64 {
            head_size + Self::random_index(65)
        } else {
            data.len()
        };

        let request = self.build_request(&data[..head_len]);
        let mut out = BytesMut::with_capacity(request.len() + data.len() - head_len);
        out.extend_from_slice(request.as_bytes());
        out.extend_from_slice(&data[head_len..]);
        self.sent_header = true;
        Ok(out.freeze())
    }

    fn client_decode(&mut self, data: &[u8]) -> Result<(Bytes, bool), ObfuscationError> {
        if self.recv_header {
            return Ok((Bytes::copy_from_slice(data), false));
        }

        self.recv_buf.extend_from_slice(data);
        if let Some(pos) = find_subsequence(&self.recv_buf, b"\r\n\r\n") {
            if !self.recv_buf.starts_with(b"HTTP/") {
                return Err(ObfuscationError::Malformed(
                    "response is not HTTP".to_string(),
                ));
            }
            self.recv_header = true;
            let body = self.recv_buf.split_off(pos + 4);
            self.recv_buf.clear();
            return Ok((body.freeze(), false));
        }

        if self.recv_buf.len() > MAX_RESPONSE_HEAD {
            return Err(ObfuscationError::Malformed(
                "response head too large".to_string(),
            ));
        }
        Ok((Bytes::new(), false))
    }

    fn overhead(&self) -> usize {
        0
    }
}

pub(crate) fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plugin(param: &str) -> HttpSimple {
        let mut ctx = PluginContext::new("server.example", 8388, param);
        ctx.iv_len = 16;
        ctx.head_len = 7;
        HttpSimple::new(ctx)
    }

    fn decode_path(request: &[u8]) -> (Vec<u8>, usize) {
        let text = String::from_utf8_lossy(request);
        let path = text
            .strip_prefix("GET /")
            .and_then(|rest| rest.split(' ').next())
            .unwrap();
        let bytes: Vec<u8> = path
            .split('%')
            .filter(|s| !s.is_empty())
            .map(|h| u8::from_str_radix(h, 16).unwrap())
            .collect();
        let body_start = find_subsequence(request, b"\r\n\r\n").unwrap() + 4;
        (bytes, body_start)
    }

    #[test]
    fn test_first_packet_is_http_request() {
        let mut obfs = plugin("cdn.example.com");
        let data: Vec<u8> = (0..200u8).collect();
        let encoded = obfs.client_encode(&data).unwrap();

        assert!(encoded.starts_with(b"GET /%"));
        let text = String::from_utf8_lossy(&encoded);
        assert!(text.contains("Host: cdn.example.com:8388\r\n"));

        let (head, body_start) = decode_path(&encoded);
        let mut rebuilt = head;
        rebuilt.extend_from_slice(&encoded[body_start..]);
        assert_eq!(rebuilt, data);

        let next = obfs.client_encode(b"more").unwrap();
        assert_eq!(&next[..], b"more");
    }

    #[test]
    fn test_short_packet_fully_in_path() {
        let mut obfs = plugin("");
        let encoded = obfs.client_encode(b"tiny").unwrap();
        let (head, body_start) = decode_path(&encoded);
        assert_eq!(head, b"tiny");
        assert_eq!(body_start, encoded.len());
        assert!(String::from_utf8_lossy(&encoded).contains("Host: server.example:8388"));
    }

    #[test]
    fn test_response_head_stripped() {
        let mut obfs = plugin("");
        let (out, sendback) = obfs.client_decode(b"HTTP/1.1 200 OK\r\nServer: n").unwrap();
        assert!(out.is_empty());
        assert!(!sendback);

        let (out, _) = obfs.client_decode(b"ginx\r\n\r\nBODY").unwrap();
        assert_eq!(&out[..], b"BODY");

        let (out, _) = obfs.client_decode(b"rest").unwrap();
        assert_eq!(&out[..], b"rest");
    }

    #[test]
    fn test_non_http_response_rejected() {
        let mut obfs = plugin("");
        assert!(obfs.client_decode(b"garbage\r\n\r\n").is_err());
    }
}
