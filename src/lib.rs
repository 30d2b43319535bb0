//! # Tunnel Gate
//!
//! A local proxy front-end that accepts SOCKS4a, SOCKS5, HTTP and raw
//! forwarded connections, routes each one by rule, and carries the
//! remote-bound ones through an encrypted, obfuscated tunnel with
//! health-driven server balancing.
//!
//! ## Architecture
//!
//! ```text
//! accept ──► proxy (front door) ──► router ──┬──► relay (direct / upstream proxy)
//!                                            └──► tunnel ──► codec ──► server
//!                        rules + dns ──┘         selector + server health ──┘
//! ```

pub mod codec;
pub mod config;
pub mod context;
pub mod crypto;
pub mod dns;
pub mod obfuscation;
pub mod protocol;
pub mod proxy;
pub mod router;
pub mod rules;
pub mod selector;
pub mod server;
pub mod transport;
pub mod tunnel;

pub use config::Config;
pub use context::ProxyContext;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Crypto error: {0}")]
    Crypto(#[from] crypto::CryptoError),

    #[error("Obfuscation error: {0}")]
    Obfuscation(#[from] obfuscation::ObfuscationError),

    #[error("Codec error: {0}")]
    Codec(#[from] codec::CodecError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] protocol::ProtocolError),

    #[error("Rule error: {0}")]
    Rule(#[from] rules::RuleError),

    #[error("DNS error: {0}")]
    Dns(#[from] dns::DnsError),

    #[error("Selector error: {0}")]
    Selector(#[from] selector::SelectorError),

    #[error("Transport error: {0}")]
    Transport(#[from] transport::TransportError),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] tunnel::TunnelError),

    #[error("Proxy error: {0}")]
    Proxy(#[from] proxy::ProxyError),

    #[error("Configuration error: {0}")]
    Config(String),
}
