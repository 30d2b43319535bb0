//! Runtime context
//!
//! Holds the swappable [`Snapshot`] (configuration, compiled rules, server
//! arena, upstream proxy) and the state that outlives reloads: the DNS cache,
//! the connection registry and the per-port selectors.

use crate::config::Config;
use crate::dns::{self, DnsCache, DnsCacheSettings, Resolve};
use crate::rules::RuleTable;
use crate::selector::{BalanceAlgorithm, ServerSelector};
use crate::server::{ConnectionRegistry, HealthSnapshot, ServerArena};
use crate::transport::{TransportConfig, UpstreamProxy};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info};

/// Everything a session reads from configuration, fixed for its lifetime
#[derive(Debug)]
pub struct Snapshot {
    pub config: Config,
    pub rules: RuleTable,
    pub servers: ServerArena,
    pub algorithm: BalanceAlgorithm,
    pub upstream: Option<Arc<UpstreamProxy>>,
    pub transport: TransportConfig,
}

impl Snapshot {
    /// Compile a validated configuration
    pub fn build(config: Config, previous: Option<&Snapshot>) -> crate::Result<Self> {
        config.validate()?;
        let rules = RuleTable::from_config(&config.rules)?;
        let servers =
            ServerArena::from_configs(&config.servers, previous.map(|p| &p.servers))?;
        let algorithm = BalanceAlgorithm::from_str(&config.balance.algorithm)
            .map_err(|e| crate::Error::Config(e.to_string()))?;
        let transport = TransportConfig::from(&config.timeouts);
        let upstream = match &config.upstream_proxy {
            Some(upstream) => Some(Arc::new(UpstreamProxy::from_config(
                upstream,
                transport.clone(),
            )?)),
            None => None,
        };
        Ok(Self {
            config,
            rules,
            servers,
            algorithm,
            upstream,
            transport,
        })
    }

    /// Upstream proxy to use in front of tunnel servers
    pub fn tunnel_upstream(&self) -> Option<&Arc<UpstreamProxy>> {
        self.upstream.as_ref().filter(|_| {
            self.config
                .upstream_proxy
                .as_ref()
                .map_or(false, |u| u.use_for_tunnel)
        })
    }

    /// Server id pinned to a listen port
    pub fn pinned_server(&self, port: u16) -> Option<&str> {
        self.config
            .port_map
            .iter()
            .find(|m| {
                m.listen
                    .parse::<std::net::SocketAddr>()
                    .map_or(false, |a| a.port() == port)
            })
            .and_then(|m| m.server_id.as_deref())
    }
}

/// Shared runtime state
pub struct ProxyContext {
    snapshot: RwLock<Arc<Snapshot>>,
    dns: DnsCache,
    registry: Arc<ConnectionRegistry>,
    selectors: Mutex<HashMap<u16, Arc<ServerSelector>>>,
}

impl ProxyContext {
    /// Build from configuration with the configured resolver
    pub fn new(config: Config) -> crate::Result<Self> {
        let resolver = dns::resolver_from_config(&config.dns)?;
        Self::with_resolver(config, resolver)
    }

    /// Build with an explicit resolver
    pub fn with_resolver(config: Config, resolver: Arc<dyn Resolve>) -> crate::Result<Self> {
        let settings = DnsCacheSettings::from(&config.dns);
        let snapshot = Snapshot::build(config, None)?;
        info!(
            "Loaded {} servers, rule mode {:?}, balance {}",
            snapshot.servers.len(),
            snapshot.rules.mode(),
            snapshot.algorithm
        );
        Ok(Self {
            snapshot: RwLock::new(Arc::new(snapshot)),
            dns: DnsCache::new(resolver, settings),
            registry: Arc::new(ConnectionRegistry::new()),
            selectors: Mutex::new(HashMap::new()),
        })
    }

    /// Current snapshot
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.snapshot.read().clone()
    }

    pub fn dns(&self) -> &DnsCache {
        &self.dns
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Selector state of a listen port
    pub fn selector(&self, port: u16) -> Arc<ServerSelector> {
        self.selectors
            .lock()
            .entry(port)
            .or_insert_with(|| Arc::new(ServerSelector::new()))
            .clone()
    }

    /// Swap in a new configuration.
    ///
    /// Sessions keep the snapshot they started with; sessions on servers
    /// that no longer exist are closed.
    pub fn reload(&self, config: Config) -> crate::Result<()> {
        let current = self.snapshot();
        let next = Snapshot::build(config, Some(&current))?;
        let removed = current.servers.removed_ids(&next.servers);

        info!(
            "Reloaded configuration: {} servers, rule mode {:?}",
            next.servers.len(),
            next.rules.mode()
        );
        *self.snapshot.write() = Arc::new(next);

        for id in removed {
            let closed = self.registry.close_server(&id);
            debug!("Server {} removed, closed {} sessions", id, closed);
        }
        Ok(())
    }

    /// Health of every configured server
    pub fn health_report(&self) -> Vec<HealthSnapshot> {
        self.snapshot()
            .servers
            .iter()
            .map(|s| s.health_snapshot())
            .collect()
    }

    /// Close every session on a server
    pub fn disconnect_server(&self, id: &str) -> usize {
        let closed = self.registry.close_server(id);
        info!("Disconnected {} sessions on {}", closed, id);
        closed
    }

    /// Close every tunnel session
    pub fn disconnect_all(&self) -> usize {
        let closed = self.registry.close_all();
        info!("Disconnected {} sessions", closed);
        closed
    }
}
