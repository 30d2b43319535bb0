//! Plain two-socket relay for direct and local-proxy routes

use crate::proxy::Inbound;
use crate::protocol::TargetAddr;
use crate::transport::{Dialer, TransportError};
use std::io;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Read buffer per direction
const RELAY_BUFFER: usize = 16 * 1024;

/// Connect `inbound` to `target` through `dialer` and pipe until both sides close
pub async fn relay(
    inbound: Inbound,
    dialer: &dyn Dialer,
    target: &TargetAddr,
    idle: Duration,
) -> Result<(u64, u64), TransportError> {
    let Inbound {
        mut stream,
        peer,
        handshake,
        ..
    } = inbound;

    let mut remote = dialer.dial(target).await?;
    debug!("Relay {} -> {} connected", peer, target);

    if let Some(reply) = handshake.dialect.success_reply(&handshake.target) {
        stream.write_all(&reply).await?;
    }
    if !handshake.pending.is_empty() {
        remote.write_all(&handshake.pending).await?;
    }

    let (up, down) = pipe(&mut stream, &mut remote, idle).await?;
    trace!("Relay {} -> {} done: {} up, {} down", peer, target, up, down);
    Ok((up, down))
}

/// Copy both directions until both are closed or nothing moves for `idle`
pub async fn pipe(
    client: &mut TcpStream,
    remote: &mut TcpStream,
    idle: Duration,
) -> io::Result<(u64, u64)> {
    let (mut client_read, mut client_write) = client.split();
    let (mut remote_read, mut remote_write) = remote.split();
    let mut up_buf = vec![0u8; RELAY_BUFFER];
    let mut down_buf = vec![0u8; RELAY_BUFFER];
    let (mut up, mut down) = (0u64, 0u64);
    let (mut client_open, mut remote_open) = (true, true);

    let deadline = tokio::time::sleep(idle);
    tokio::pin!(deadline);

    while client_open || remote_open {
        tokio::select! {
            read = client_read.read(&mut up_buf), if client_open => {
                match read? {
                    0 => {
                        client_open = false;
                        remote_write.shutdown().await.ok();
                    }
                    n => {
                        remote_write.write_all(&up_buf[..n]).await?;
                        up += n as u64;
                    }
                }
            }
            read = remote_read.read(&mut down_buf), if remote_open => {
                match read? {
                    0 => {
                        remote_open = false;
                        client_write.shutdown().await.ok();
                    }
                    n => {
                        client_write.write_all(&down_buf[..n]).await?;
                        down += n as u64;
                    }
                }
            }
            _ = &mut deadline => {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "relay idle"));
            }
        }
        deadline.as_mut().reset(Instant::now() + idle);
    }

    Ok((up, down))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let a = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (b, _) = listener.accept().await.unwrap();
        (a, b)
    }

    #[tokio::test]
    async fn test_pipe_both_directions() {
        let (mut client_app, mut client_side) = pair().await;
        let (mut remote_side, mut remote_app) = pair().await;

        let task = tokio::spawn(async move {
            pipe(&mut client_side, &mut remote_side, Duration::from_secs(5)).await
        });

        client_app.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        remote_app.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        remote_app.write_all(b"pong!").await.unwrap();
        let mut buf = [0u8; 5];
        client_app.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong!");

        drop(client_app);
        drop(remote_app);
        let (up, down) = task.await.unwrap().unwrap();
        assert_eq!((up, down), (4, 5));
    }

    #[tokio::test]
    async fn test_pipe_idle_timeout() {
        let (_client_app, mut client_side) = pair().await;
        let (mut remote_side, _remote_app) = pair().await;
        let err = pipe(&mut client_side, &mut remote_side, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }
}
