//! One tunneled TCP session: select, dial, pipe, reconnect

use super::pipe::Pipe;
use super::{
    PipeStats, ResponseCheck, SessionState, TunnelError, TunnelSettings, REPLAY_LIMIT,
};
use crate::codec::WireCodec;
use crate::context::{ProxyContext, Snapshot};
use crate::protocol::TargetAddr;
use crate::proxy::{Inbound, ReplyDialect};
use crate::selector::SelectRequest;
use crate::server::{FailureKind, ServerProfile, SessionHandle};
use crate::transport::{Dialer, TcpDialer};
use bytes::BytesMut;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, trace, warn};

/// Client bytes that may still be replayed to a new server
#[derive(Debug)]
pub struct ReplayBuffer {
    data: BytesMut,
    header_len: usize,
    open: bool,
}

impl ReplayBuffer {
    /// Start with the tunnel header and the bytes the front door already read
    pub fn new(header: &[u8], pending: &[u8]) -> Self {
        let mut data = BytesMut::with_capacity(header.len() + pending.len());
        data.extend_from_slice(header);
        data.extend_from_slice(pending);
        let open = data.len() <= REPLAY_LIMIT;
        Self {
            data,
            header_len: header.len(),
            open,
        }
    }

    /// Remember client bytes sent before the server answered
    pub fn push(&mut self, chunk: &[u8]) {
        if !self.open {
            return;
        }
        if self.data.len() + chunk.len() > REPLAY_LIMIT {
            self.seal();
        } else {
            self.data.extend_from_slice(chunk);
        }
    }

    /// The server answered: nothing can be replayed any more
    pub fn seal(&mut self) {
        self.open = false;
        self.data.clear();
    }

    pub fn is_replayable(&self) -> bool {
        self.open
    }

    /// Everything to send as the opening of a connection
    pub fn contents(&self) -> &[u8] {
        &self.data
    }

    /// Client payload past the header
    pub fn payload(&self) -> &[u8] {
        self.data.get(self.header_len..).unwrap_or(&[])
    }
}

/// Live-connection count of a server for the span of one attempt
pub(crate) struct ActiveConnection<'a>(&'a ServerProfile);

impl<'a> ActiveConnection<'a> {
    pub(crate) fn start(server: &'a ServerProfile) -> Self {
        server.health().record_connect_start();
        Self(server)
    }
}

impl Drop for ActiveConnection<'_> {
    fn drop(&mut self) {
        self.0.health().record_disconnect();
    }
}

/// Tunnel session for one client connection
pub struct TunnelSession {
    ctx: Arc<ProxyContext>,
    snapshot: Arc<Snapshot>,
    settings: TunnelSettings,
    peer: SocketAddr,
    local_port: u16,
    target: TargetAddr,
    dialect: ReplyDialect,
    header_len: usize,
    replay: ReplayBuffer,
    state: SessionState,
    handle: Arc<SessionHandle>,
}

impl TunnelSession {
    pub fn new(
        ctx: Arc<ProxyContext>,
        snapshot: Arc<Snapshot>,
        inbound: &Inbound,
    ) -> Result<Self, TunnelError> {
        let handshake = &inbound.handshake;
        let header = handshake.target.to_bytes()?;
        Ok(Self {
            settings: TunnelSettings::from(&snapshot.config),
            ctx,
            snapshot,
            peer: inbound.peer,
            local_port: inbound.local_port,
            target: handshake.target.clone(),
            dialect: handshake.dialect,
            header_len: header.len(),
            replay: ReplayBuffer::new(&header, &handshake.pending),
            state: SessionState::Ready,
            handle: Arc::new(SessionHandle::new()),
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Close signal of this session
    pub fn handle(&self) -> &Arc<SessionHandle> {
        &self.handle
    }

    fn transition(&mut self, next: SessionState) {
        trace!("Session {} -> {}: {:?} -> {:?}", self.peer, self.target, self.state, next);
        self.state = next;
    }

    /// Drive the session until it ends; reconnects are invisible to the client
    pub async fn run(mut self, mut client: TcpStream) -> Result<(), TunnelError> {
        self.transition(SessionState::Handshake);
        let mut attempts = 0u32;
        let mut exclude = None;
        let mut replied = false;

        loop {
            let (index, server) = self.select(exclude).ok_or(TunnelError::NoServer)?;
            debug!("{} -> {} via server {}", self.peer, self.target, server);

            let result = self.attempt(&server, &mut client, &mut replied).await;
            let err = match result {
                Ok(stats) => {
                    trace!(
                        "Session {} -> {} done: {} up, {} down",
                        self.peer,
                        self.target,
                        stats.upload,
                        stats.download
                    );
                    self.transition(SessionState::End);
                    return Ok(());
                }
                Err(e) => e,
            };

            let kind = err.failure_kind();
            if let Some(kind) = kind {
                self.report_failure(&server, kind);
            }

            let retry = kind.is_some()
                && attempts < self.settings.reconnect_times
                && self.replay.is_replayable()
                && !self.handle.is_closed();
            if !retry {
                self.transition(SessionState::End);
                return match err {
                    TunnelError::Idle => Ok(()),
                    err => Err(err),
                };
            }

            attempts += 1;
            debug!(
                "Server {} failed for {} ({}), reconnect {}/{}",
                server.id, self.target, err, attempts, self.settings.reconnect_times
            );
            exclude = Some(index);
            self.transition(SessionState::Handshake);
        }
    }

    fn select(&self, exclude: Option<usize>) -> Option<(usize, Arc<ServerProfile>)> {
        select_server(
            &self.ctx,
            &self.snapshot,
            &self.settings,
            self.local_port,
            &self.target,
            exclude,
        )
    }

    async fn attempt(
        &mut self,
        server: &Arc<ServerProfile>,
        client: &mut TcpStream,
        replied: &mut bool,
    ) -> Result<PipeStats, TunnelError> {
        let _active = ActiveConnection::start(server);
        let _registration = self.ctx.registry().register(&server.id, self.handle.clone());

        self.transition(SessionState::Connecting);
        let started = Instant::now();
        let handle = self.handle.clone();
        let mut remote = tokio::select! {
            connected = dial_server(&self.ctx, &self.snapshot, server) => connected?,
            _ = handle.closed() => return Err(TunnelError::Closed),
        };
        server.health().record_connected(started.elapsed());

        let codec = WireCodec::new(server, self.header_len)?;
        self.transition(SessionState::Connected);
        trace!(
            "Connected to {} with {}/{}",
            server.id,
            codec.protocol_name(),
            codec.obfs_name()
        );

        if !*replied {
            if let Some(reply) = self.dialect.success_reply(&self.target) {
                client.write_all(&reply).await.map_err(TunnelError::Client)?;
            }
            *replied = true;
        }

        let opening = self.replay.contents().to_vec();
        let payload = self.replay.payload();
        let check = (!payload.is_empty()).then(|| ResponseCheck::from_request(payload));

        Pipe {
            codec,
            server,
            replay: &mut self.replay,
            handle: &self.handle,
            check,
            idle: self.settings.idle,
            keepalive: self.settings.keepalive,
        }
        .run(client, &mut remote, &opening)
        .await
    }

    fn report_failure(&self, server: &ServerProfile, kind: FailureKind) {
        report_failure(&self.settings, server, kind);
    }
}

/// Choose a server; a pinned port always uses its server
pub(crate) fn select_server(
    ctx: &ProxyContext,
    snapshot: &Snapshot,
    settings: &TunnelSettings,
    local_port: u16,
    target: &TargetAddr,
    exclude: Option<usize>,
) -> Option<(usize, Arc<ServerProfile>)> {
    let servers = &snapshot.servers;
    if let Some(id) = snapshot.pinned_server(local_port) {
        let index = servers.index_of(id)?;
        return servers.get(index).map(|s| (index, s.clone()));
    }

    let target_key = target.to_string();
    let req = SelectRequest {
        random: settings.random,
        current_index: settings.current_index,
        group: settings.group.as_deref(),
        target: Some(&target_key),
        exclude,
        sticky_ttl: settings.sticky_ttl,
        ..SelectRequest::new(snapshot.algorithm)
    };
    let index = ctx.selector(local_port).select(servers.as_slice(), &req)?;
    servers.get(index).map(|s| (index, s.clone()))
}

/// Dial a server, through the upstream proxy when configured for tunnels
pub(crate) async fn dial_server(
    ctx: &ProxyContext,
    snapshot: &Snapshot,
    server: &ServerProfile,
) -> Result<TcpStream, TunnelError> {
    let ip = ctx.dns().resolve_server(server).await?;
    let addr = SocketAddr::new(ip, server.port);
    let stream = match snapshot.tunnel_upstream() {
        Some(upstream) => upstream.dial(&TargetAddr::from(addr)).await?,
        None => {
            TcpDialer::new(snapshot.transport.clone())
                .connect_addr(addr)
                .await?
        }
    };
    Ok(stream)
}

/// Record a failure and apply the auto-disable policy
pub(crate) fn report_failure(settings: &TunnelSettings, server: &ServerProfile, kind: FailureKind) {
    let streak = {
        let mut health = server.health();
        health.record_failure(kind);
        health.host_not_found_streak()
    };

    if let Some(threshold) = settings.auto_disable {
        if kind == FailureKind::HostNotFound
            && streak >= u64::from(threshold)
            && server.is_enabled()
        {
            server.set_enabled(false);
            warn!(
                "Disabled server {} after {} host-not-found errors",
                server, streak
            );
        }
    }
}
