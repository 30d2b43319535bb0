//! SOCKS5 UDP relay
//!
//! Client datagrams arrive on the socket bound during UDP ASSOCIATE as
//! `[RSV 2][FRAG 1][addr header][data]`. They reach the server either as
//! codec-wrapped datagrams to its UDP port, or as `[u16 len][addr header][data]`
//! frames inside a TCP tunnel whose header carries the UDP-over-TCP flag.
//! The association lives until the client closes its TCP control stream.

use super::session::{dial_server, report_failure, select_server, ActiveConnection};
use super::{IdleTimer, TunnelError, TunnelSettings, BUFFER_SIZE};
use crate::codec::{UdpCodec, WireCodec};
use crate::context::{ProxyContext, Snapshot};
use crate::protocol::{TargetAddr, UDP_OVER_TCP_FLAG};
use crate::proxy::{Inbound, UdpAssociation};
use crate::server::{FailureKind, ServerProfile, SessionHandle};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tracing::{debug, trace};

/// Largest datagram relayed
const MAX_DATAGRAM: usize = 64 * 1024;

/// Address header and payload of a client datagram; `None` for fragments and junk
pub fn parse_socks_datagram(packet: &[u8]) -> Option<&[u8]> {
    if packet.len() < 4 || packet[0] != 0 || packet[1] != 0 {
        return None;
    }
    // Fragmented datagrams are not reassembled
    if packet[2] != 0 {
        return None;
    }
    let body = &packet[3..];
    TargetAddr::decode(body).ok().map(|_| body)
}

/// Wrap `[addr header][data]` for delivery to the client
pub fn socks_datagram(body: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(body.len() + 3);
    out.put_slice(&[0, 0, 0]);
    out.put_slice(body);
    out.freeze()
}

/// Frame `[addr header][data]` for the TCP tunnel
fn tcp_frame(body: &[u8]) -> Option<Bytes> {
    let len = u16::try_from(body.len()).ok()?;
    let mut out = BytesMut::with_capacity(body.len() + 2);
    out.put_u16(len);
    out.put_slice(body);
    Some(out.freeze())
}

/// Splits the decoded tunnel stream back into datagrams
#[derive(Debug, Default)]
pub struct UdpFrameDecoder {
    buf: BytesMut,
}

impl UdpFrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Next complete `[addr header][data]`, if any
    pub fn next_frame(&mut self) -> Option<Bytes> {
        if self.buf.len() < 2 {
            return None;
        }
        let len = u16::from_be_bytes([self.buf[0], self.buf[1]]) as usize;
        if self.buf.len() < 2 + len {
            return None;
        }
        self.buf.advance(2);
        Some(self.buf.split_to(len).freeze())
    }
}

/// Local end of the association
struct ClientSide {
    socket: Arc<UdpSocket>,
    peer_ip: IpAddr,
    reply_to: Option<SocketAddr>,
}

impl ClientSide {
    fn new(assoc: UdpAssociation, peer: SocketAddr) -> Self {
        let reply_to = assoc.client_hint.filter(|a| a.port() != 0 && !a.ip().is_unspecified());
        Self {
            socket: assoc.socket,
            peer_ip: peer.ip(),
            reply_to,
        }
    }

    /// Accept a datagram only from the host that opened the association
    fn accept(&mut self, from: SocketAddr) -> bool {
        if from.ip() != self.peer_ip {
            trace!("Dropping UDP datagram from stranger {}", from);
            return false;
        }
        self.reply_to.get_or_insert(from);
        true
    }

    async fn deliver(&self, body: &[u8]) -> Result<(), TunnelError> {
        if let Some(to) = self.reply_to {
            self.socket
                .send_to(&socks_datagram(body), to)
                .await
                .map_err(TunnelError::Client)?;
        }
        Ok(())
    }
}

/// Relay an associated UDP socket until the control stream closes
pub(crate) async fn serve(
    ctx: Arc<ProxyContext>,
    snapshot: Arc<Snapshot>,
    inbound: Inbound,
) -> Result<(), TunnelError> {
    let Inbound {
        stream,
        peer,
        local_port,
        handshake,
    } = inbound;
    let assoc = handshake.udp.ok_or_else(|| {
        TunnelError::Client(io::Error::new(
            io::ErrorKind::InvalidInput,
            "UDP relay without an association",
        ))
    })?;
    let settings = TunnelSettings::from(&snapshot.config);
    let (_, server) = select_server(
        &ctx,
        &snapshot,
        &settings,
        local_port,
        &handshake.target,
        None,
    )
    .ok_or(TunnelError::NoServer)?;

    let _active = ActiveConnection::start(&server);
    let handle = Arc::new(SessionHandle::new());
    let _registration = ctx.registry().register(&server.id, handle.clone());
    let client = ClientSide::new(assoc, peer);

    debug!(
        "UDP association {} via server {} ({})",
        peer,
        server,
        if server.wants_udp_over_tcp() { "over TCP" } else { "direct" }
    );

    let relay = UdpRelay {
        ctx: &ctx,
        snapshot: &snapshot,
        settings: &settings,
        server: &server,
        handle: &handle,
        control: stream,
        client,
    };
    let result = if server.wants_udp_over_tcp() {
        relay.over_tcp(&handshake.target).await
    } else {
        relay.direct().await
    };

    if let Err(e) = &result {
        if let Some(kind) = e.failure_kind() {
            report_failure(&settings, &server, kind);
        }
    }
    result
}

struct UdpRelay<'a> {
    ctx: &'a ProxyContext,
    snapshot: &'a Snapshot,
    settings: &'a TunnelSettings,
    server: &'a ServerProfile,
    handle: &'a SessionHandle,
    control: TcpStream,
    client: ClientSide,
}

impl UdpRelay<'_> {
    /// Datagrams to the server's UDP port, one IV each
    async fn direct(mut self) -> Result<(), TunnelError> {
        let ip = self.ctx.dns().resolve_server(self.server).await?;
        let port = self.server.udp_port.unwrap_or(self.server.port);
        let bind: SocketAddr = match ip {
            IpAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            IpAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let remote = UdpSocket::bind(bind).await.map_err(TunnelError::Remote)?;
        remote
            .connect((ip, port))
            .await
            .map_err(TunnelError::Remote)?;
        let mut codec = UdpCodec::new(self.server)?;

        let mut timer = IdleTimer::new(self.settings.idle);
        let mut control_buf = [0u8; 64];
        let mut local_buf = vec![0u8; MAX_DATAGRAM];
        let mut remote_buf = vec![0u8; MAX_DATAGRAM];
        let mut answered = false;
        let socket = self.client.socket.clone();

        loop {
            tokio::select! {
                _ = self.handle.closed() => return Err(TunnelError::Closed),

                read = self.control.read(&mut control_buf) => {
                    if matches!(read, Ok(0) | Err(_)) {
                        trace!("UDP control stream closed");
                        return Ok(());
                    }
                }

                received = socket.recv_from(&mut local_buf) => {
                    let (n, from) = received.map_err(TunnelError::Client)?;
                    if !self.client.accept(from) {
                        continue;
                    }
                    let Some(body) = parse_socks_datagram(&local_buf[..n]) else {
                        continue;
                    };
                    timer.record(n, MAX_DATAGRAM);
                    let packet = codec.encode(body)?;
                    remote.send(&packet).await.map_err(TunnelError::Remote)?;
                    self.server.health().add_upload(body.len() as u64);
                }

                received = remote.recv(&mut remote_buf) => {
                    let n = received.map_err(TunnelError::Remote)?;
                    let body = match codec.decode(&remote_buf[..n]) {
                        Ok(body) => body,
                        Err(e) => {
                            debug!("Undecodable UDP datagram from {}: {}", self.server.id, e);
                            self.server.health().record_failure(FailureKind::DecodeError);
                            continue;
                        }
                    };
                    timer.record(n, MAX_DATAGRAM);
                    if !answered {
                        answered = true;
                        self.server.health().record_success();
                    }
                    self.client.deliver(&body).await?;
                    self.server.health().add_download(body.len() as u64);
                }

                _ = tokio::time::sleep_until(timer.wake_at()) => {
                    if timer.expired() {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Length-prefixed datagrams inside one TCP tunnel
    async fn over_tcp(mut self, target: &TargetAddr) -> Result<(), TunnelError> {
        let started = Instant::now();
        let mut remote = dial_server(self.ctx, self.snapshot, self.server).await?;
        self.server.health().record_connected(started.elapsed());

        let mut header = BytesMut::new();
        target.write_with_type_flags(&mut header, UDP_OVER_TCP_FLAG)?;
        let mut codec = WireCodec::new(self.server, header.len())?;
        let opening = codec.encode(&header)?;
        remote.write_all(&opening).await.map_err(TunnelError::Remote)?;

        let mut timer = IdleTimer::new(self.settings.idle);
        let mut frames = UdpFrameDecoder::new();
        let mut control_buf = [0u8; 64];
        let mut local_buf = vec![0u8; MAX_DATAGRAM];
        let mut remote_buf = vec![0u8; BUFFER_SIZE];
        let mut answered = false;
        let socket = self.client.socket.clone();

        loop {
            tokio::select! {
                _ = self.handle.closed() => return Err(TunnelError::Closed),

                read = self.control.read(&mut control_buf) => {
                    if matches!(read, Ok(0) | Err(_)) {
                        trace!("UDP control stream closed");
                        return Ok(());
                    }
                }

                received = socket.recv_from(&mut local_buf) => {
                    let (n, from) = received.map_err(TunnelError::Client)?;
                    if !self.client.accept(from) {
                        continue;
                    }
                    let Some(frame) = parse_socks_datagram(&local_buf[..n]).and_then(tcp_frame) else {
                        continue;
                    };
                    timer.record(n, MAX_DATAGRAM);
                    let encoded = codec.encode(&frame)?;
                    remote.write_all(&encoded).await.map_err(TunnelError::Remote)?;
                    self.server.health().add_upload(frame.len() as u64);
                }

                read = remote.read(&mut remote_buf) => {
                    let n = read.map_err(TunnelError::Remote)?;
                    if n == 0 {
                        return if answered { Ok(()) } else { Err(TunnelError::EmptyResponse) };
                    }
                    timer.record(n, BUFFER_SIZE);
                    let (plain, sendback) = codec.decode(&remote_buf[..n])?;
                    if sendback {
                        let flush = codec.encode(&[])?;
                        remote.write_all(&flush).await.map_err(TunnelError::Remote)?;
                    }
                    if plain.is_empty() {
                        continue;
                    }
                    if !answered {
                        answered = true;
                        self.server.health().record_success();
                    }
                    frames.push(&plain);
                    while let Some(body) = frames.next_frame() {
                        self.client.deliver(&body).await?;
                        self.server.health().add_download(body.len() as u64);
                    }
                }

                _ = tokio::time::sleep_until(timer.wake_at()) => {
                    if timer.expired() {
                        return Ok(());
                    }
                }
            }
        }
    }
}
