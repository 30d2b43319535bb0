//! Tunnel engine
//!
//! Owns one remote session per tunneled client connection:
//! - Server selection and dialing (optionally through the upstream proxy)
//! - Wire codec installation and bidirectional piping
//! - Transparent reconnect with replay of unanswered client bytes
//! - Health feedback into the server's log
//! - SOCKS5 UDP relay, direct or over the TCP tunnel

mod keepalive;
mod pipe;
mod session;
mod udp;

pub use keepalive::IdleTimer;
pub use pipe::{PipeStats, ResponseCheck};
pub use session::{ReplayBuffer, TunnelSession};
pub use udp::{parse_socks_datagram, socks_datagram, UdpFrameDecoder};

use crate::codec::CodecError;
use crate::config::Config;
use crate::context::{ProxyContext, Snapshot};
use crate::dns::DnsError;
use crate::protocol::ProtocolError;
use crate::proxy::{Inbound, ReplyDialect};
use crate::server::FailureKind;
use crate::transport::{classify_io, TransportError};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Tunnel layer errors
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("No server available")]
    NoServer,

    #[error("Client I/O error: {0}")]
    Client(std::io::Error),

    #[error("Server I/O error: {0}")]
    Remote(std::io::Error),

    #[error("Dial failed: {0}")]
    Transport(#[from] TransportError),

    #[error("Server host lookup failed: {0}")]
    Dns(#[from] DnsError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Response does not match the request protocol")]
    ResponseMismatch,

    #[error("Server closed without answering")]
    EmptyResponse,

    #[error("Server did not answer in time")]
    Timeout,

    #[error("Idle timeout")]
    Idle,

    #[error("Session closed")]
    Closed,
}

impl TunnelError {
    /// Health bucket for this error; `None` when the server is not to blame
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            TunnelError::Remote(e) => Some(classify_io(e)),
            TunnelError::Transport(e) => Some(e.failure_kind()),
            TunnelError::Dns(_) => Some(FailureKind::HostNotFound),
            TunnelError::Codec(_) | TunnelError::ResponseMismatch => Some(FailureKind::DecodeError),
            TunnelError::EmptyResponse => Some(FailureKind::EmptyResponse),
            TunnelError::Timeout => Some(FailureKind::Timeout),
            TunnelError::NoServer
            | TunnelError::Client(_)
            | TunnelError::Protocol(_)
            | TunnelError::Idle
            | TunnelError::Closed => None,
        }
    }
}

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Ready,
    /// Client bytes buffered, choosing a server
    Handshake,
    /// Dialing the server
    Connecting,
    /// Codec installed, piping
    Connected,
    End,
}

/// Per-direction read buffer
pub const BUFFER_SIZE: usize = 16 * 1024;

/// Most client bytes kept for replay before giving up on reconnects
pub const REPLAY_LIMIT: usize = 64 * 1024;

/// Session knobs taken from one configuration snapshot
#[derive(Debug, Clone)]
pub struct TunnelSettings {
    pub idle: Duration,
    pub keepalive: Duration,
    pub reconnect_times: u32,
    pub sticky_ttl: Duration,
    pub random: bool,
    pub current_index: usize,
    pub group: Option<String>,
    /// Disable a server after this many host-not-found errors in a row
    pub auto_disable: Option<u32>,
}

impl From<&Config> for TunnelSettings {
    fn from(config: &Config) -> Self {
        Self {
            idle: Duration::from_secs(config.timeouts.idle_secs),
            keepalive: Duration::from_secs(config.timeouts.keepalive_secs),
            reconnect_times: config.timeouts.reconnect_times,
            sticky_ttl: Duration::from_secs(config.balance.sticky_ttl_secs),
            random: config.balance.random,
            current_index: config.balance.current,
            group: config.balance.group.clone().filter(|g| !g.is_empty()),
            auto_disable: config
                .auto_disable
                .enabled
                .then_some(config.auto_disable.threshold),
        }
    }
}

/// Run a tunneled client connection to completion
pub async fn serve(
    ctx: Arc<ProxyContext>,
    snapshot: Arc<Snapshot>,
    inbound: Inbound,
) -> Result<(), TunnelError> {
    if inbound.handshake.dialect == ReplyDialect::Socks5Udp {
        return udp::serve(ctx, snapshot, inbound).await;
    }
    TunnelSession::new(ctx, snapshot, &inbound)?
        .run(inbound.stream)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_client_errors_spare_server_health() {
        let client = TunnelError::Client(io::Error::from(io::ErrorKind::BrokenPipe));
        assert_eq!(client.failure_kind(), None);
        assert_eq!(TunnelError::Idle.failure_kind(), None);
        assert_eq!(TunnelError::Closed.failure_kind(), None);
        assert_eq!(TunnelError::NoServer.failure_kind(), None);
    }

    #[test]
    fn test_remote_error_buckets() {
        let refused = TunnelError::Remote(io::Error::from(io::ErrorKind::ConnectionRefused));
        assert_eq!(refused.failure_kind(), Some(FailureKind::ConnectionRefused));
        assert_eq!(
            TunnelError::ResponseMismatch.failure_kind(),
            Some(FailureKind::DecodeError)
        );
        assert_eq!(
            TunnelError::Dns(DnsError::NotFound("x".into())).failure_kind(),
            Some(FailureKind::HostNotFound)
        );
        assert_eq!(
            TunnelError::EmptyResponse.failure_kind(),
            Some(FailureKind::EmptyResponse)
        );
    }

    #[test]
    fn test_settings_from_config() {
        let mut config = Config::default();
        config.auto_disable.enabled = true;
        config.auto_disable.threshold = 4;
        config.balance.group = Some(String::new());
        let settings = TunnelSettings::from(&config);
        assert_eq!(settings.auto_disable, Some(4));
        assert_eq!(settings.group, None);
        assert_eq!(settings.idle, Duration::from_secs(config.timeouts.idle_secs));
    }
}
