//! Direct TCP dialing

use super::{Dialer, TransportConfig, TransportError};
use crate::protocol::TargetAddr;
use async_trait::async_trait;
use std::net::SocketAddr;
use tokio::net::TcpStream;
use tracing::trace;

/// Dials targets directly
#[derive(Debug, Clone, Default)]
pub struct TcpDialer {
    config: TransportConfig,
}

impl TcpDialer {
    pub fn new(config: TransportConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Connect to a resolved address
    pub async fn connect_addr(&self, addr: SocketAddr) -> Result<TcpStream, TransportError> {
        let stream = tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(TransportError::Io)?;
        self.configure(&stream);
        Ok(stream)
    }

    fn configure(&self, stream: &TcpStream) {
        if self.config.nodelay {
            stream.set_nodelay(true).ok();
        }
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, target: &TargetAddr) -> Result<TcpStream, TransportError> {
        if let Some(addr) = target.socket_addr() {
            return self.connect_addr(addr).await;
        }

        trace!("Dialing {} through the system resolver", target);
        let host = target.host();
        let connect = TcpStream::connect((host.as_str(), target.port()));
        let stream = tokio::time::timeout(self.config.connect_timeout, connect)
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    TransportError::HostNotFound(host.clone())
                } else {
                    TransportError::Io(e)
                }
            })?;
        self.configure(&stream);
        Ok(stream)
    }
}
