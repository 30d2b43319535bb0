//! Routing of completed handshakes
//!
//! Applies the rule table to each target and hands the connection to a
//! direct relay, a relay through the local upstream proxy, or the tunnel.

mod relay;

pub use relay::{pipe, relay};

use crate::context::{ProxyContext, Snapshot};
use crate::protocol::TargetAddr;
use crate::proxy::{Handshake, Inbound, ReplyDialect, SessionSink};
use crate::rules::{HostDecision, Verdict};
use crate::transport::{Dialer, TcpDialer};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

/// Where a connection goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Reject,
    /// Connect here directly (domains replaced by their resolved address)
    Direct(TargetAddr),
    /// Through the configured upstream proxy
    LocalProxy,
    /// Through a tunnel server
    Tunnel,
}

/// Routes inbound connections
pub struct Router {
    ctx: Arc<ProxyContext>,
}

impl Router {
    pub fn new(ctx: Arc<ProxyContext>) -> Self {
        Self { ctx }
    }

    /// Decide the route of a handshake against a snapshot
    pub async fn decide(&self, snapshot: &Snapshot, handshake: &Handshake) -> Route {
        // Forward ports and UDP always use the tunnel
        if handshake.forwarded || handshake.dialect == ReplyDialect::Socks5Udp {
            return Route::Tunnel;
        }

        let target = &handshake.target;
        let rules = &snapshot.rules;
        let (verdict, resolved) = match target.ip() {
            Some(ip) => (rules.classify_ip(ip), None),
            None => match rules.classify_host(&target.host()) {
                HostDecision::Decided(verdict) => (verdict, None),
                HostDecision::Resolve { pollution_check } => {
                    match self.ctx.dns().lookup(&target.host()).await {
                        Ok(ip) => (rules.classify_resolved(ip, pollution_check), Some(ip)),
                        Err(e) => {
                            // The tunnel server resolves it remotely
                            debug!("Cannot resolve {} locally: {}", target, e);
                            (Verdict::RemoteProxy, None)
                        }
                    }
                }
            },
        };
        trace!("Verdict for {}: {}", target, verdict);

        match verdict {
            Verdict::Reject => Route::Reject,
            Verdict::RemoteProxy => Route::Tunnel,
            Verdict::LocalProxy if snapshot.upstream.is_some() => Route::LocalProxy,
            Verdict::Direct | Verdict::LocalProxy => Route::Direct(match resolved {
                Some(ip) => target.with_resolved(ip),
                None => target.clone(),
            }),
        }
    }
}

#[async_trait]
impl SessionSink for Router {
    async fn dispatch(&self, inbound: Inbound) {
        let snapshot = self.ctx.snapshot();
        let route = self.decide(&snapshot, &inbound.handshake).await;
        let peer = inbound.peer;
        let target = inbound.handshake.target.clone();
        debug!("{} -> {} via {:?}", peer, target, route);

        let idle = Duration::from_secs(snapshot.config.timeouts.idle_secs);
        let result = match route {
            Route::Reject => {
                debug!("Rejected {} from {}", target, peer);
                return;
            }
            Route::Direct(dial_target) => {
                let dialer = TcpDialer::new(snapshot.transport.clone());
                relay(inbound, &dialer, &dial_target, idle)
                    .await
                    .map(|_| ())
                    .map_err(crate::Error::from)
            }
            Route::LocalProxy => match snapshot.upstream.clone() {
                Some(upstream) => relay(inbound, upstream.as_ref() as &dyn Dialer, &target, idle)
                    .await
                    .map(|_| ())
                    .map_err(crate::Error::from),
                None => Ok(()),
            },
            Route::Tunnel => crate::tunnel::serve(self.ctx.clone(), snapshot.clone(), inbound)
                .await
                .map_err(crate::Error::from),
        };

        if let Err(e) = result {
            debug!("Session {} -> {} ended: {}", peer, target, e);
        }
    }
}
