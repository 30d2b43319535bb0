//! Address and host rule table
//!
//! Classifies a target into one of four verdicts. Literal addresses are
//! checked against loopback, user CIDR rules, LAN ranges and the China
//! range set according to the active [`RuleMode`]. Host names are checked
//! against suffix rules first; when no rule decides, the caller resolves the
//! name and classifies the address.

mod host;
mod ip_range;

pub use host::HostRules;
pub use ip_range::{parse_net, IpRangeTable};

use crate::config::RulesConfig;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use thiserror::Error;

/// Rule errors
#[derive(Debug, Error)]
pub enum RuleError {
    #[error("Invalid CIDR: {0}")]
    InvalidCidr(String),

    #[error("Invalid verdict: {0}")]
    InvalidVerdict(String),

    #[error("Failed to read rule file {path}: {source}")]
    File {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Where a connection goes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    /// Close the connection
    Reject,
    /// Connect straight to the target
    Direct,
    /// Connect through the local-network upstream proxy
    LocalProxy,
    /// Tunnel through a remote server
    RemoteProxy,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Reject => "reject",
            Verdict::Direct => "direct",
            Verdict::LocalProxy => "localproxy",
            Verdict::RemoteProxy => "remoteproxy",
        }
    }
}

impl FromStr for Verdict {
    type Err = RuleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reject" => Ok(Verdict::Reject),
            "direct" => Ok(Verdict::Direct),
            "localproxy" => Ok(Verdict::LocalProxy),
            "remoteproxy" => Ok(Verdict::RemoteProxy),
            _ => Err(RuleError::InvalidVerdict(s.to_string())),
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Routing mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RuleMode {
    /// Everything except loopback goes through the tunnel
    Disabled,
    /// LAN addresses go direct
    #[default]
    BypassLan,
    /// LAN direct, China ranges through the local proxy
    BypassLanAndChina,
    /// LAN direct, everything outside China through the local proxy
    BypassLanAndNotChina,
    /// LAN direct, user rules only
    UserCustom,
}

/// Outcome of a host rule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostMatch {
    /// The rule names a verdict
    Verdict(Verdict),
    /// Public name with no verdict: decide by its address, distrusting LAN answers
    Public,
}

/// Host classification before any resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostDecision {
    /// Decided by name alone
    Decided(Verdict),
    /// Resolve the name and classify the address
    Resolve {
        /// A LAN answer means the resolver is lying
        pollution_check: bool,
    },
}

/// Compiled rule table, read-only for the life of a snapshot
#[derive(Debug, Clone, Default)]
pub struct RuleTable {
    mode: RuleMode,
    user_cidrs: IpRangeTable<Verdict>,
    china: IpRangeTable<()>,
    hosts: HostRules,
}

impl RuleTable {
    /// Empty table in the given mode
    pub fn new(mode: RuleMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    /// Compile the configured rules, reading the China range file if set
    pub fn from_config(config: &RulesConfig) -> Result<Self, RuleError> {
        let mut table = Self::new(config.mode);

        for rule in &config.cidr_rules {
            table.add_cidr_rule(parse_net(&rule.cidr)?, Verdict::from_str(&rule.verdict)?);
        }
        for rule in &config.host_rules {
            let decision = if rule.verdict.trim().is_empty() {
                HostMatch::Public
            } else {
                HostMatch::Verdict(Verdict::from_str(&rule.verdict)?)
            };
            table.add_host_rule(&rule.suffix, decision);
        }

        table
            .china
            .extend_lines(config.china_cidrs.iter().map(String::as_str))?;
        if let Some(path) = &config.china_cidr_file {
            let content = std::fs::read_to_string(path).map_err(|source| RuleError::File {
                path: path.clone(),
                source,
            })?;
            let added = table.china.extend_lines(content.lines())?;
            tracing::debug!("Loaded {} China ranges from {}", added, path);
        }

        Ok(table)
    }

    pub fn mode(&self) -> RuleMode {
        self.mode
    }

    pub fn add_cidr_rule(&mut self, net: ipnet::IpNet, verdict: Verdict) {
        self.user_cidrs.insert(net, verdict);
    }

    pub fn add_china_range(&mut self, net: ipnet::IpNet) {
        self.china.insert(net, ());
    }

    pub fn add_host_rule(&mut self, suffix: &str, decision: HostMatch) {
        self.hosts.insert(suffix, decision);
    }

    /// Classify a literal address
    pub fn classify_ip(&self, ip: IpAddr) -> Verdict {
        if ip.is_loopback() {
            return Verdict::Direct;
        }
        if self.mode == RuleMode::Disabled {
            return Verdict::RemoteProxy;
        }
        if let Some(verdict) = self.user_cidrs.lookup(ip) {
            return *verdict;
        }
        if is_lan(ip) {
            return Verdict::Direct;
        }
        match self.mode {
            RuleMode::BypassLanAndChina if self.china.contains(ip) => Verdict::LocalProxy,
            RuleMode::BypassLanAndNotChina if !self.china.contains(ip) => Verdict::LocalProxy,
            _ => Verdict::RemoteProxy,
        }
    }

    /// Classify a host name before resolution
    pub fn classify_host(&self, host: &str) -> HostDecision {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return HostDecision::Decided(self.classify_ip(ip));
        }
        if host.eq_ignore_ascii_case("localhost") {
            return HostDecision::Decided(Verdict::Direct);
        }
        if self.mode == RuleMode::Disabled {
            return HostDecision::Decided(Verdict::RemoteProxy);
        }
        match self.hosts.query(host) {
            Some(HostMatch::Verdict(verdict)) => HostDecision::Decided(verdict),
            Some(HostMatch::Public) => HostDecision::Resolve {
                pollution_check: true,
            },
            None => HostDecision::Resolve {
                pollution_check: false,
            },
        }
    }

    /// Classify the resolved address of a host
    pub fn classify_resolved(&self, ip: IpAddr, pollution_check: bool) -> Verdict {
        if pollution_check && (is_lan(ip) || ip.is_loopback() || ip.is_unspecified()) {
            return Verdict::RemoteProxy;
        }
        self.classify_ip(ip)
    }
}

/// Private, link-local, shared and unique-local ranges
pub fn is_lan(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            v4.is_private()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
                || (o[0] == 100 && (o[1] & 0xc0) == 64)
        }
        IpAddr::V6(v6) => {
            if let Some(v4) = v6.to_ipv4_mapped() {
                return is_lan(IpAddr::V4(v4));
            }
            let first = v6.segments()[0];
            (first & 0xfe00) == 0xfc00 || (first & 0xffc0) == 0xfe80 || v6.is_unspecified()
        }
    }
}
