//! Integration tests for Tunnel Gate
//!
//! Drives the listener, router and tunnel engine end to end against
//! in-process mock servers:
//! - SOCKS5, SOCKS4a and HTTP CONNECT front doors
//! - Encrypted tunnel sessions and transparent reconnect
//! - Direct relay of LAN targets
//! - Rule compilation and configuration files

use async_trait::async_trait;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tunnel_gate::config::{Config, HostRuleConfig, RulesConfig, ServerConfig};
use tunnel_gate::crypto::{CipherKind, Encryptor};
use tunnel_gate::dns::{DnsError, Resolve};
use tunnel_gate::proxy::{standard_handlers, AuthPolicy, ProxyListener};
use tunnel_gate::router::Router;
use tunnel_gate::rules::{HostDecision, RuleMode, RuleTable, Verdict};
use tunnel_gate::ProxyContext;

const REQUEST: &[u8] = b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n";
const RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nhi";

/// Answers every lookup of `example.com` with a public address
struct StaticResolver;

#[async_trait]
impl Resolve for StaticResolver {
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>, DnsError> {
        match host {
            "example.com" => Ok(vec!["93.184.216.34".parse().unwrap()]),
            _ => Err(DnsError::NotFound(host.to_string())),
        }
    }
}

fn server(id: &str, port: u16, method: &str) -> ServerConfig {
    ServerConfig {
        id: id.to_string(),
        host: "127.0.0.1".to_string(),
        port,
        method: method.to_string(),
        password: "integration-secret".to_string(),
        ..ServerConfig::default()
    }
}

fn config(servers: Vec<ServerConfig>) -> Config {
    let mut config = Config {
        servers,
        ..Config::default()
    };
    config.balance.random = false;
    config.balance.current = 0;
    config.timeouts.reconnect_times = 3;
    config
}

/// Start a gate on an ephemeral port
async fn start_gate(config: Config) -> SocketAddr {
    let ctx = Arc::new(ProxyContext::with_resolver(config, Arc::new(StaticResolver)).unwrap());
    let router = Arc::new(Router::new(Arc::clone(&ctx)));
    let listener = ProxyListener::bind(
        "127.0.0.1:0".parse().unwrap(),
        standard_handlers(AuthPolicy::default()),
        router,
        Duration::from_secs(5),
    )
    .await
    .unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(listener.run());
    addr
}

/// Tunnel server that decrypts one HTTP request and answers it.
///
/// Resolves to the decrypted plaintext it received.
async fn mock_tunnel_server(listener: TcpListener, method: &'static str) -> JoinHandle<Vec<u8>> {
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let kind = CipherKind::from_str(method).unwrap();
        let mut decryptor = Encryptor::new(kind, "integration-secret");
        let mut encryptor = Encryptor::new(kind, "integration-secret");

        let mut plain = Vec::new();
        let mut buf = [0u8; 4096];
        while !plain.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = stream.read(&mut buf).await.unwrap();
            assert!(n > 0, "client closed before the request completed");
            plain.extend_from_slice(&decryptor.decrypt(&buf[..n]).unwrap());
        }

        let reply = encryptor.encrypt(RESPONSE).unwrap();
        stream.write_all(&reply).await.unwrap();
        plain
    })
}

fn domain_header(host: &str, port: u16) -> Vec<u8> {
    let mut header = vec![0x03, host.len() as u8];
    header.extend_from_slice(host.as_bytes());
    header.extend_from_slice(&port.to_be_bytes());
    header
}

#[tokio::test]
async fn test_socks5_domain_through_encrypted_tunnel() {
    let remote = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = remote.local_addr().unwrap().port();
    let server_task = mock_tunnel_server(remote, "aes-256-cfb").await;
    let gate = start_gate(config(vec![server("s0", port, "aes-256-cfb")])).await;

    let mut app = TcpStream::connect(gate).await.unwrap();
    app.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut method = [0u8; 2];
    app.read_exact(&mut method).await.unwrap();
    assert_eq!(method, [0x05, 0x00]);

    let mut request = vec![0x05, 0x01, 0x00];
    request.extend_from_slice(&domain_header("example.com", 80));
    app.write_all(&request).await.unwrap();
    let mut reply = [0u8; 10];
    app.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);

    app.write_all(REQUEST).await.unwrap();
    let mut response = Vec::new();
    app.read_to_end(&mut response).await.unwrap();
    assert_eq!(response, RESPONSE);

    let received = server_task.await.unwrap();
    let header = domain_header("example.com", 80);
    assert_eq!(&received[..header.len()], &header[..]);
    assert_eq!(&received[header.len()..], REQUEST);
}

#[tokio::test]
async fn test_socks4a_through_tunnel() {
    let remote = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = remote.local_addr().unwrap().port();
    let server_task = mock_tunnel_server(remote, "none").await;
    let gate = start_gate(config(vec![server("s0", port, "none")])).await;

    let mut app = TcpStream::connect(gate).await.unwrap();
    let mut request = vec![0x04, 0x01, 0x00, 0x50, 0, 0, 0, 1];
    request.extend_from_slice(b"user\0example.com\0");
    app.write_all(&request).await.unwrap();

    let mut reply = [0u8; 8];
    app.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply[..2], &[0x00, 0x5a]);

    app.write_all(REQUEST).await.unwrap();
    let mut response = Vec::new();
    app.read_to_end(&mut response).await.unwrap();
    assert_eq!(response, RESPONSE);

    let received = server_task.await.unwrap();
    assert!(received.starts_with(&domain_header("example.com", 80)));
}

#[cfg(feature = "http-proxy")]
#[tokio::test]
async fn test_http_connect_through_tunnel() {
    let remote = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = remote.local_addr().unwrap().port();
    let server_task = mock_tunnel_server(remote, "aes-128-cfb").await;
    let gate = start_gate(config(vec![server("s0", port, "aes-128-cfb")])).await;

    let mut app = TcpStream::connect(gate).await.unwrap();
    app.write_all(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n")
        .await
        .unwrap();
    let established = b"HTTP/1.1 200 Connection Established\r\n\r\n";
    let mut reply = vec![0u8; established.len()];
    app.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply[..], &established[..]);

    app.write_all(REQUEST).await.unwrap();
    let mut response = Vec::new();
    app.read_to_end(&mut response).await.unwrap();
    assert_eq!(response, RESPONSE);

    let received = server_task.await.unwrap();
    assert!(received.starts_with(&domain_header("example.com", 443)));
}

#[tokio::test]
async fn test_reconnect_to_second_server() {
    let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_port = dead.local_addr().unwrap().port();
    let live = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let live_port = live.local_addr().unwrap().port();

    // Accepts, swallows the opening bytes, and hangs up without answering
    tokio::spawn(async move {
        let (mut stream, _) = dead.accept().await.unwrap();
        let mut buf = [0u8; 256];
        let _ = stream.read(&mut buf).await;
    });
    let server_task = mock_tunnel_server(live, "none").await;
    let gate = start_gate(config(vec![
        server("dead", dead_port, "none"),
        server("live", live_port, "none"),
    ]))
    .await;

    let mut app = TcpStream::connect(gate).await.unwrap();
    app.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut method = [0u8; 2];
    app.read_exact(&mut method).await.unwrap();
    let mut request = vec![0x05, 0x01, 0x00];
    request.extend_from_slice(&domain_header("example.com", 80));
    app.write_all(&request).await.unwrap();
    let mut reply = [0u8; 10];
    app.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[1], 0x00);

    app.write_all(REQUEST).await.unwrap();
    let mut response = Vec::new();
    app.read_to_end(&mut response).await.unwrap();
    assert_eq!(response, RESPONSE);

    // The live server sees the full request replayed from the start
    let received = server_task.await.unwrap();
    let header = domain_header("example.com", 80);
    assert_eq!(&received[..header.len()], &header[..]);
    assert_eq!(&received[header.len()..], REQUEST);
}

#[tokio::test]
async fn test_lan_target_is_relayed_directly() {
    let echo = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let echo_port = echo.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (mut stream, _) = echo.accept().await.unwrap();
        let mut buf = [0u8; 64];
        let n = stream.read(&mut buf).await.unwrap();
        stream.write_all(&buf[..n]).await.unwrap();
    });

    // No servers: anything tunneled would fail
    let gate = start_gate(config(Vec::new())).await;

    let mut app = TcpStream::connect(gate).await.unwrap();
    app.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut method = [0u8; 2];
    app.read_exact(&mut method).await.unwrap();
    let mut request = vec![0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1];
    request.extend_from_slice(&echo_port.to_be_bytes());
    app.write_all(&request).await.unwrap();
    let mut reply = [0u8; 10];
    app.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[1], 0x00);

    app.write_all(b"ping").await.unwrap();
    let mut echoed = [0u8; 4];
    app.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"ping");
}

#[test]
fn test_rule_table_from_config() {
    let rules = RulesConfig {
        mode: RuleMode::BypassLanAndChina,
        china_cidrs: vec!["1.0.1.0/24".to_string()],
        host_rules: vec![
            HostRuleConfig {
                suffix: "ads.example".to_string(),
                verdict: "reject".to_string(),
            },
            HostRuleConfig {
                suffix: "cdn.example".to_string(),
                verdict: String::new(),
            },
        ],
        ..RulesConfig::default()
    };
    let table = RuleTable::from_config(&rules).unwrap();

    assert_eq!(table.classify_ip("1.0.1.7".parse().unwrap()), Verdict::LocalProxy);
    assert_eq!(table.classify_ip("192.168.0.9".parse().unwrap()), Verdict::Direct);
    assert_eq!(table.classify_ip("8.8.8.8".parse().unwrap()), Verdict::RemoteProxy);
    assert_eq!(
        table.classify_host("tracker.ads.example"),
        HostDecision::Decided(Verdict::Reject)
    );
    assert_eq!(
        table.classify_host("img.cdn.example"),
        HostDecision::Resolve {
            pollution_check: true
        }
    );
    assert_eq!(
        table.classify_resolved("10.0.0.1".parse().unwrap(), true),
        Verdict::RemoteProxy
    );
}

#[test]
fn test_config_file_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("gate.toml");

    let mut original = config(vec![server("tokyo", 8388, "aes-256-cfb")]);
    original.local.listen = "127.0.0.1:7070".to_string();
    original.rules.mode = RuleMode::UserCustom;
    original.save(&path).unwrap();

    let loaded = Config::load(&path).unwrap();
    assert_eq!(loaded.local.listen, "127.0.0.1:7070");
    assert_eq!(loaded.rules.mode, RuleMode::UserCustom);
    assert_eq!(loaded.servers.len(), 1);
    assert_eq!(loaded.servers[0].id, "tokyo");
    assert_eq!(loaded.servers[0].method, "aes-256-cfb");
    assert!(!loaded.balance.random);
}

#[test]
fn test_invalid_config_is_rejected() {
    let result = Config::from_toml(
        r#"
        [[servers]]
        id = "bad"
        host = "127.0.0.1"
        port = 8388
        method = "rot13"
        password = "x"
        "#,
    );
    assert!(result.is_err());
}
