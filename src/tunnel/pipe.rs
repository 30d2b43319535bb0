//! Encoded bidirectional piping between a client and a tunnel server

use super::{IdleTimer, ReplayBuffer, TunnelError, BUFFER_SIZE};
use crate::codec::WireCodec;
use crate::server::{ServerProfile, SessionHandle};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, trace};

const HTTP_METHODS: [&[u8]; 9] = [
    b"GET ", b"POST ", b"PUT ", b"HEAD ", b"DELETE ", b"OPTIONS ", b"PATCH ", b"CONNECT ",
    b"TRACE ",
];

/// What the first response must look like, judged from the first request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseCheck {
    None,
    Http,
    Tls,
}

impl ResponseCheck {
    pub fn from_request(request: &[u8]) -> Self {
        if HTTP_METHODS.iter().any(|m| request.starts_with(m)) {
            ResponseCheck::Http
        } else if request.len() >= 2 && request[0] == 0x16 && request[1] == 0x03 {
            ResponseCheck::Tls
        } else {
            ResponseCheck::None
        }
    }

    /// Whether the first response bytes fit the request
    pub fn accepts(&self, response: &[u8]) -> bool {
        match self {
            ResponseCheck::None => true,
            ResponseCheck::Http => {
                let n = response.len().min(5);
                response[..n] == b"HTTP/"[..n]
            }
            ResponseCheck::Tls => match response {
                [] => true,
                [kind] => (0x14..=0x17).contains(kind),
                [kind, major, ..] => (0x14..=0x17).contains(kind) && *major == 0x03,
            },
        }
    }
}

/// Byte counts of a finished pipe
#[derive(Debug, Clone, Copy, Default)]
pub struct PipeStats {
    pub upload: u64,
    pub download: u64,
}

/// One connected attempt of a session
pub(crate) struct Pipe<'a> {
    pub codec: WireCodec,
    pub server: &'a ServerProfile,
    pub replay: &'a mut ReplayBuffer,
    pub handle: &'a SessionHandle,
    /// Undecided until the first client payload is seen
    pub check: Option<ResponseCheck>,
    pub idle: Duration,
    pub keepalive: Duration,
}

impl Pipe<'_> {
    /// Send `opening` through the codec, then pipe until the session ends.
    ///
    /// Returns once both directions are closed; an error before the server
    /// answered leaves the replay buffer intact for a reconnect.
    pub async fn run(
        mut self,
        client: &mut TcpStream,
        remote: &mut TcpStream,
        opening: &[u8],
    ) -> Result<PipeStats, TunnelError> {
        let mut stats = PipeStats::default();
        let capacity = BUFFER_SIZE.saturating_sub(self.codec.overhead());
        let handle = self.handle;
        let mut up_buf = vec![0u8; capacity];
        let mut down_buf = vec![0u8; BUFFER_SIZE];
        let mut answered = false;
        let (mut client_open, mut remote_open) = (true, true);

        let mut timer = IdleTimer::new(self.idle);
        if self.codec.is_keep_alive() {
            timer = timer.with_keepalive(self.keepalive);
        }

        let first = self.codec.encode(opening)?;
        remote.write_all(&first).await.map_err(TunnelError::Remote)?;
        stats.upload += opening.len() as u64;

        let (mut client_read, mut client_write) = client.split();
        let (mut remote_read, mut remote_write) = remote.split();

        while client_open || remote_open {
            tokio::select! {
                _ = handle.closed() => return Err(TunnelError::Closed),

                read = client_read.read(&mut up_buf), if client_open => {
                    let n = read.map_err(TunnelError::Client)?;
                    if n == 0 {
                        trace!("Client finished sending");
                        client_open = false;
                        remote_write.shutdown().await.ok();
                        continue;
                    }
                    timer.record(n, capacity);
                    let data = &up_buf[..n];
                    if self.check.is_none() {
                        self.check = Some(ResponseCheck::from_request(data));
                    }
                    if !answered {
                        self.replay.push(data);
                    }
                    let encoded = self.codec.encode(data)?;
                    remote_write.write_all(&encoded).await.map_err(TunnelError::Remote)?;
                    stats.upload += n as u64;
                    self.server.health().add_upload(n as u64);
                }

                read = remote_read.read(&mut down_buf), if remote_open => {
                    let n = read.map_err(TunnelError::Remote)?;
                    if n == 0 {
                        if !answered {
                            return Err(TunnelError::EmptyResponse);
                        }
                        trace!("Server finished sending");
                        remote_open = false;
                        client_write.shutdown().await.ok();
                        continue;
                    }
                    timer.record(n, BUFFER_SIZE);
                    let (plain, sendback) = self.codec.decode(&down_buf[..n])?;
                    if sendback {
                        let flush = self.codec.encode(&[])?;
                        remote_write.write_all(&flush).await.map_err(TunnelError::Remote)?;
                    }
                    if plain.is_empty() {
                        continue;
                    }
                    if !answered {
                        let check = self.check.unwrap_or(ResponseCheck::None);
                        if !check.accepts(&plain) {
                            debug!("First response from {} does not match {:?}", self.server.id, check);
                            return Err(TunnelError::ResponseMismatch);
                        }
                        answered = true;
                        self.replay.seal();
                        self.server.health().record_success();
                    }
                    client_write.write_all(&plain).await.map_err(TunnelError::Client)?;
                    stats.download += plain.len() as u64;
                    self.server.health().add_download(plain.len() as u64);
                }

                _ = tokio::time::sleep_until(timer.wake_at()) => {
                    if timer.take_probe() {
                        trace!("Keepalive probe to {}", self.server.id);
                        let probe = self.codec.encode(&[])?;
                        remote_write.write_all(&probe).await.map_err(TunnelError::Remote)?;
                    } else if timer.expired() {
                        return Err(if answered { TunnelError::Idle } else { TunnelError::Timeout });
                    }
                }
            }
        }

        Ok(stats)
    }
}
