//! Transport layer
//!
//! Outbound TCP connections:
//! - direct dialing with a connect deadline
//! - chaining through an upstream SOCKS5 or HTTP CONNECT proxy

mod tcp;
mod upstream;

pub use tcp::TcpDialer;
pub use upstream::{UpstreamKind, UpstreamProxy};

use crate::config::TimeoutConfig;
use crate::protocol::{ProtocolError, TargetAddr};
use crate::server::FailureKind;
use async_trait::async_trait;
use std::io;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;

/// Transport layer errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Host not found: {0}")]
    HostNotFound(String),

    #[error("Upstream proxy error: {0}")]
    Upstream(String),

    #[error("Upstream proxy rejected credentials")]
    AuthenticationFailed,

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Connection closed")]
    Closed,

    #[error("Timeout")]
    Timeout,
}

impl TransportError {
    /// Health bucket for a failed dial
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            TransportError::Io(e) => classify_io(e),
            TransportError::HostNotFound(_) => FailureKind::HostNotFound,
            TransportError::Timeout => FailureKind::Timeout,
            TransportError::Closed => FailureKind::EmptyResponse,
            _ => FailureKind::Other,
        }
    }
}

/// Map an I/O error onto a health bucket
pub fn classify_io(e: &io::Error) -> FailureKind {
    match e.kind() {
        io::ErrorKind::ConnectionRefused => FailureKind::ConnectionRefused,
        io::ErrorKind::NetworkUnreachable | io::ErrorKind::HostUnreachable => {
            FailureKind::NetworkUnreachable
        }
        io::ErrorKind::TimedOut => FailureKind::Timeout,
        io::ErrorKind::UnexpectedEof => FailureKind::EmptyResponse,
        _ => FailureKind::Other,
    }
}

/// Something that opens TCP streams to a target
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Open a stream to `target`
    async fn dial(&self, target: &TargetAddr) -> Result<TcpStream, TransportError>;
}

/// Transport configuration
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Dial deadline
    pub connect_timeout: Duration,
    /// Disable Nagle on new sockets
    pub nodelay: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(crate::protocol::CONNECT_TIMEOUT),
            nodelay: true,
        }
    }
}

impl From<&TimeoutConfig> for TransportConfig {
    fn from(config: &TimeoutConfig) -> Self {
        Self {
            connect_timeout: Duration::from_secs(config.connect_secs),
            nodelay: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_classification() {
        let refused = TransportError::Io(io::Error::from(io::ErrorKind::ConnectionRefused));
        assert_eq!(refused.failure_kind(), FailureKind::ConnectionRefused);
        assert_eq!(TransportError::Timeout.failure_kind(), FailureKind::Timeout);
        assert_eq!(
            TransportError::HostNotFound("x".into()).failure_kind(),
            FailureKind::HostNotFound
        );
        assert_eq!(
            TransportError::Upstream("bad".into()).failure_kind(),
            FailureKind::Other
        );
    }
}
