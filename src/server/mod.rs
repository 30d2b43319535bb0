//! Remote tunnel servers
//!
//! A [`ServerProfile`] is immutable apart from its enabled flag, its
//! [`HealthLog`] and its DNS entry, each behind its own lock so sessions on
//! different servers never contend. Profiles live in a [`ServerArena`] and
//! are addressed by index or by their stable id.

mod health;
mod registry;

pub use health::{FailureKind, HealthLog, HealthSnapshot};
pub use registry::{ConnectionRegistry, SessionGuard, SessionHandle};

use crate::config::ServerConfig;
use crate::crypto::CipherKind;
use parking_lot::{Mutex, MutexGuard};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Resolved address of a server host
#[derive(Debug, Clone, Default)]
pub struct ServerDnsEntry {
    pub ip: Option<IpAddr>,
    pub updated: Option<Instant>,
    /// Host the address belongs to
    pub host: String,
    /// Ignore the entry on next use
    pub force_expire: bool,
}

/// One remote tunnel endpoint
pub struct ServerProfile {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub udp_port: Option<u16>,
    pub method: CipherKind,
    pub password: String,
    pub protocol: String,
    pub protocol_param: String,
    pub obfs: String,
    pub obfs_param: String,
    pub group: String,
    pub udp_over_tcp: bool,
    pub remarks: String,
    enabled: AtomicBool,
    health: Arc<Mutex<HealthLog>>,
    dns: Mutex<ServerDnsEntry>,
}

impl ServerProfile {
    /// Build a profile from configuration
    pub fn from_config(config: &ServerConfig) -> Result<Self, crate::Error> {
        let method = CipherKind::from_str(&config.method)?;
        Ok(Self {
            id: config.id.clone(),
            host: config.host.clone(),
            port: config.port,
            udp_port: config.udp_port,
            method,
            password: config.password.clone(),
            protocol: config.protocol.clone(),
            protocol_param: config.protocol_param.clone(),
            obfs: config.obfs.clone(),
            obfs_param: config.obfs_param.clone(),
            group: config.group.clone(),
            udp_over_tcp: config.udp_over_tcp,
            remarks: config.remarks.clone(),
            enabled: AtomicBool::new(config.enabled),
            health: Arc::new(Mutex::new(HealthLog::new())),
            dns: Mutex::new(ServerDnsEntry::default()),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    pub fn health(&self) -> MutexGuard<'_, HealthLog> {
        self.health.lock()
    }

    pub fn dns_entry(&self) -> MutexGuard<'_, ServerDnsEntry> {
        self.dns.lock()
    }

    /// Whether UDP should travel inside the TCP tunnel
    pub fn wants_udp_over_tcp(&self) -> bool {
        self.udp_over_tcp || self.udp_port.is_none()
    }

    /// Health snapshot labelled with this server
    pub fn health_snapshot(&self) -> HealthSnapshot {
        let mut snapshot = self.health().snapshot();
        snapshot.server_id = self.id.clone();
        snapshot.enabled = self.is_enabled();
        snapshot
    }

    /// Keep the statistics of a previous profile with the same id
    fn inherit(&mut self, previous: &ServerProfile) {
        self.health = previous.health.clone();
        if previous.host == self.host {
            *self.dns.get_mut() = previous.dns_entry().clone();
        }
    }

    #[cfg(test)]
    pub(crate) fn for_test(id: &str, host: &str, port: u16) -> Self {
        let config = ServerConfig {
            id: id.to_string(),
            host: host.to_string(),
            port,
            password: "test-password".to_string(),
            ..ServerConfig::default()
        };
        Self::from_config(&config).unwrap()
    }
}

impl fmt::Debug for ServerProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerProfile")
            .field("id", &self.id)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("method", &self.method)
            .field("protocol", &self.protocol)
            .field("obfs", &self.obfs)
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

impl fmt::Display for ServerProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.remarks.is_empty() {
            write!(f, "{} ({}:{})", self.id, self.host, self.port)
        } else {
            write!(f, "{} ({})", self.id, self.remarks)
        }
    }
}

/// All configured servers, in configuration order
#[derive(Debug, Default, Clone)]
pub struct ServerArena {
    servers: Vec<Arc<ServerProfile>>,
}

impl ServerArena {
    /// Build from configuration, carrying health over from `previous` by id
    pub fn from_configs(
        configs: &[ServerConfig],
        previous: Option<&ServerArena>,
    ) -> Result<Self, crate::Error> {
        let mut servers = Vec::with_capacity(configs.len());
        for config in configs {
            let mut profile = ServerProfile::from_config(config)?;
            if let Some(old) = previous.and_then(|p| p.by_id(&config.id)) {
                profile.inherit(&old);
            }
            servers.push(Arc::new(profile));
        }
        Ok(Self { servers })
    }

    pub fn get(&self, index: usize) -> Option<&Arc<ServerProfile>> {
        self.servers.get(index)
    }

    pub fn by_id(&self, id: &str) -> Option<Arc<ServerProfile>> {
        self.servers.iter().find(|s| s.id == id).cloned()
    }

    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.servers.iter().position(|s| s.id == id)
    }

    pub fn as_slice(&self) -> &[Arc<ServerProfile>] {
        &self.servers
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<ServerProfile>> {
        self.servers.iter()
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    /// Ids present here but missing from `next`
    pub fn removed_ids(&self, next: &ServerArena) -> Vec<String> {
        self.servers
            .iter()
            .filter(|s| next.by_id(&s.id).is_none())
            .map(|s| s.id.clone())
            .collect()
    }
}
