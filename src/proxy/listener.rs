//! Accept loop and handler chain

use super::{
    AuthPolicy, ConnectionHandler, Inbound, ProxyError, RawHandler, SessionSink, Socks4Handler,
    Socks5Handler,
};
use bytes::BytesMut;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, trace};

/// First retry delay after a failed accept
const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(50);

/// Longest delay between accept retries
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(5);

/// The usual chain: SOCKS5, SOCKS4, HTTP, raw header
pub fn standard_handlers(auth: AuthPolicy) -> Vec<Arc<dyn ConnectionHandler>> {
    let mut handlers: Vec<Arc<dyn ConnectionHandler>> = vec![
        Arc::new(Socks5Handler::new(auth.clone())),
        Arc::new(Socks4Handler::new(auth.clone())),
    ];
    #[cfg(feature = "http-proxy")]
    handlers.push(Arc::new(super::HttpHandler::new(auth)));
    #[cfg(not(feature = "http-proxy"))]
    drop(auth);
    handlers.push(Arc::new(RawHandler::new()));
    handlers
}

/// Local proxy listener
pub struct ProxyListener {
    listener: TcpListener,
    handlers: Arc<Vec<Arc<dyn ConnectionHandler>>>,
    sink: Arc<dyn SessionSink>,
    handshake_timeout: Duration,
}

impl ProxyListener {
    /// Bind a listener
    pub async fn bind(
        addr: SocketAddr,
        handlers: Vec<Arc<dyn ConnectionHandler>>,
        sink: Arc<dyn SessionSink>,
        handshake_timeout: Duration,
    ) -> Result<Self, ProxyError> {
        let listener = TcpListener::bind(addr).await?;
        info!("Proxy listening on {}", listener.local_addr()?);
        Ok(Self {
            listener,
            handlers: Arc::new(handlers),
            sink,
            handshake_timeout,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ProxyError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until the task is dropped
    pub async fn run(self) {
        let local_port = self.listener.local_addr().map(|a| a.port()).unwrap_or(0);
        let mut backoff = ACCEPT_BACKOFF_MIN;

        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(accepted) => {
                    backoff = ACCEPT_BACKOFF_MIN;
                    accepted
                }
                Err(e) => {
                    error!("Accept failed on port {}: {}, retrying in {:?}", local_port, e, backoff);
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(ACCEPT_BACKOFF_MAX);
                    continue;
                }
            };
            trace!("Accepted {} on port {}", peer, local_port);

            let handlers = self.handlers.clone();
            let sink = self.sink.clone();
            let timeout = self.handshake_timeout;
            tokio::spawn(async move {
                match tokio::time::timeout(timeout, front_door(stream, peer, &handlers)).await {
                    Ok(Ok((stream, handshake))) => {
                        sink.dispatch(Inbound {
                            stream,
                            peer,
                            local_port,
                            handshake,
                        })
                        .await;
                    }
                    Ok(Err(e)) => debug!("Handshake from {} failed: {}", peer, e),
                    Err(_) => debug!("Handshake from {} failed: {}", peer, ProxyError::Timeout),
                }
            });
        }
    }
}

/// Find the handler that claims the connection and run its handshake
async fn front_door(
    mut stream: TcpStream,
    peer: SocketAddr,
    handlers: &[Arc<dyn ConnectionHandler>],
) -> Result<(TcpStream, super::Handshake), ProxyError> {
    stream.set_nodelay(true).ok();

    let mut buf = BytesMut::with_capacity(2048);
    let eager = handlers.iter().find(|h| h.claims_without_data()).cloned();
    let handler = match eager {
        Some(handler) => handler,
        None => {
            if stream.read_buf(&mut buf).await? == 0 {
                return Err(ProxyError::ClientClosed);
            }
            handlers
                .iter()
                .find(|h| h.claims(&buf))
                .cloned()
                .ok_or(ProxyError::Unclaimed(buf[0]))?
        }
    };

    trace!("{} handler owns {}", handler.name(), peer);
    let handshake = handler.handshake(&mut stream, buf, peer).await?;
    Ok((stream, handshake))
}
