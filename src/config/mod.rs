//! Configuration management
//!
//! The whole runtime is driven by one TOML document. A loaded [`Config`] is
//! validated once and then treated as a read-only snapshot; a reload builds
//! a fresh snapshot and swaps it in.

use crate::crypto::CipherKind;
use crate::obfuscation;
use crate::rules::{self, RuleMode, Verdict};
use crate::selector::BalanceAlgorithm;
use crate::transport::UpstreamKind;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Local listener
    #[serde(default)]
    pub local: LocalConfig,
    /// Remote tunnel servers
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
    /// Server selection
    #[serde(default)]
    pub balance: BalanceConfig,
    /// Routing rules
    #[serde(default)]
    pub rules: RulesConfig,
    /// Upstream proxy used for `localproxy` targets and optionally the tunnel
    #[serde(default)]
    pub upstream_proxy: Option<UpstreamProxyConfig>,
    /// Timeouts and reconnect policy
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    /// Local DNS resolution
    #[serde(default)]
    pub dns: DnsConfig,
    /// Extra listen ports
    #[serde(default)]
    pub port_map: Vec<PortMapConfig>,
    /// Automatic server disabling
    #[serde(default)]
    pub auto_disable: AutoDisableConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load and validate configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config: {}", e)))?;

        Self::from_toml(&content)
    }

    /// Parse and validate configuration from a TOML string
    pub fn from_toml(content: &str) -> Result<Self, crate::Error> {
        let config: Config = toml::from_str(content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), crate::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| crate::Error::Config(format!("Failed to write config: {}", e)))
    }

    /// Reject anything the runtime would otherwise trip over mid-session
    pub fn validate(&self) -> Result<(), crate::Error> {
        let err = |msg: String| Err(crate::Error::Config(msg));

        self.local.listen_addr()?;

        let mut ids = HashSet::new();
        for server in &self.servers {
            if server.id.is_empty() {
                return err(format!("Server {}:{} has no id", server.host, server.port));
            }
            if !ids.insert(server.id.as_str()) {
                return err(format!("Duplicate server id: {}", server.id));
            }
            if server.host.is_empty() {
                return err(format!("Server {} has no host", server.id));
            }
            CipherKind::from_str(&server.method)
                .map_err(|e| crate::Error::Config(format!("Server {}: {}", server.id, e)))?;
            obfuscation::validate_names(&server.protocol, &server.obfs)
                .map_err(|e| crate::Error::Config(format!("Server {}: {}", server.id, e)))?;
        }

        BalanceAlgorithm::from_str(&self.balance.algorithm)
            .map_err(|e| crate::Error::Config(e.to_string()))?;

        for rule in &self.rules.cidr_rules {
            rules::parse_net(&rule.cidr).map_err(|e| crate::Error::Config(e.to_string()))?;
            Verdict::from_str(&rule.verdict).map_err(|e| crate::Error::Config(e.to_string()))?;
        }
        for rule in &self.rules.host_rules {
            if rule.suffix.trim().is_empty() {
                return err("Host rule with empty suffix".to_string());
            }
            if !rule.verdict.is_empty() {
                Verdict::from_str(&rule.verdict)
                    .map_err(|e| crate::Error::Config(e.to_string()))?;
            }
        }
        for cidr in &self.rules.china_cidrs {
            rules::parse_net(cidr).map_err(|e| crate::Error::Config(e.to_string()))?;
        }

        if let Some(upstream) = &self.upstream_proxy {
            if upstream.server.is_empty() {
                return err("Upstream proxy has no server".to_string());
            }
        }

        let mut ports = HashSet::new();
        for map in &self.port_map {
            let addr: SocketAddr = map
                .listen
                .parse()
                .map_err(|e| crate::Error::Config(format!("Bad port map {}: {}", map.listen, e)))?;
            if !ports.insert(addr.port()) {
                return err(format!("Port {} mapped twice", addr.port()));
            }
            if map.server_id.is_none() && map.forward.is_none() {
                return err(format!("Port map {} needs server_id or forward", map.listen));
            }
            if let Some(id) = &map.server_id {
                if !ids.contains(id.as_str()) {
                    return err(format!("Port map {} names unknown server {}", map.listen, id));
                }
            }
            if let Some(target) = &map.forward {
                crate::protocol::TargetAddr::parse(target)
                    .map_err(|e| crate::Error::Config(format!("Bad forward target: {}", e)))?;
            }
        }

        if self.timeouts.idle_secs == 0 || self.timeouts.connect_secs == 0 {
            return err("Timeouts must be non-zero".to_string());
        }

        Ok(())
    }
}

/// Local listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalConfig {
    /// Listen address
    pub listen: String,
    /// Accept connections from other hosts
    pub share_over_lan: bool,
    /// Username required from non-loopback clients
    pub auth_user: Option<String>,
    /// Password required from non-loopback clients
    pub auth_pass: Option<String>,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:1080".to_string(),
            share_over_lan: false,
            auth_user: None,
            auth_pass: None,
        }
    }
}

impl LocalConfig {
    /// Address to bind, widened to all interfaces when sharing over LAN
    pub fn listen_addr(&self) -> Result<SocketAddr, crate::Error> {
        let mut addr: SocketAddr = self
            .listen
            .parse()
            .map_err(|e| crate::Error::Config(format!("Bad listen address {}: {}", self.listen, e)))?;
        if self.share_over_lan && addr.ip().is_loopback() {
            addr.set_ip(std::net::Ipv4Addr::UNSPECIFIED.into());
        }
        Ok(addr)
    }

    /// Credentials, when both halves are configured
    pub fn credentials(&self) -> Option<(String, String)> {
        match (&self.auth_user, &self.auth_pass) {
            (Some(user), Some(pass)) if !user.is_empty() => Some((user.clone(), pass.clone())),
            _ => None,
        }
    }
}

/// Remote tunnel server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Stable identifier, unique across the list
    pub id: String,
    /// Host name or IP address
    pub host: String,
    /// TCP port
    pub port: u16,
    /// UDP port, when the server relays UDP natively
    #[serde(default)]
    pub udp_port: Option<u16>,
    /// Cipher method
    #[serde(default = "default_method")]
    pub method: String,
    /// Shared secret
    #[serde(default)]
    pub password: String,
    /// Protocol plugin
    #[serde(default = "default_protocol")]
    pub protocol: String,
    #[serde(default)]
    pub protocol_param: String,
    /// Obfuscation plugin
    #[serde(default = "default_obfs")]
    pub obfs: String,
    #[serde(default)]
    pub obfs_param: String,
    /// Group tag used by the balance filter
    #[serde(default)]
    pub group: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Carry UDP inside the TCP tunnel even if a UDP port is set
    #[serde(default)]
    pub udp_over_tcp: bool,
    #[serde(default)]
    pub remarks: String,
}

fn default_method() -> String {
    "aes-256-cfb".to_string()
}

fn default_protocol() -> String {
    "origin".to_string()
}

fn default_obfs() -> String {
    "plain".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            id: "server-1".to_string(),
            host: "127.0.0.1".to_string(),
            port: 8388,
            udp_port: None,
            method: default_method(),
            password: String::new(),
            protocol: default_protocol(),
            protocol_param: String::new(),
            obfs: default_obfs(),
            obfs_param: String::new(),
            group: String::new(),
            enabled: true,
            udp_over_tcp: false,
            remarks: String::new(),
        }
    }
}

/// Server selection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BalanceConfig {
    /// Balance between servers; otherwise always use `current`
    pub random: bool,
    /// Algorithm name (OneByOne, Random, FastDownloadSpeed, LowException, SelectedFirst, Timer)
    pub algorithm: String,
    /// Index of the preferred server
    pub current: usize,
    /// Only consider servers of this group
    pub group: Option<String>,
    /// How long a destination keeps its server, in seconds (0 disables)
    pub sticky_ttl_secs: u64,
}

impl Default for BalanceConfig {
    fn default() -> Self {
        Self {
            random: true,
            algorithm: "LowException".to_string(),
            current: 0,
            group: None,
            sticky_ttl_secs: 180,
        }
    }
}

/// Routing rules configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RulesConfig {
    pub mode: RuleMode,
    /// Inline China ranges
    pub china_cidrs: Vec<String>,
    /// File with one China range per line
    pub china_cidr_file: Option<String>,
    /// User CIDR rules, applied before the mode
    pub cidr_rules: Vec<CidrRuleConfig>,
    /// User host suffix rules
    pub host_rules: Vec<HostRuleConfig>,
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            mode: RuleMode::BypassLan,
            china_cidrs: Vec::new(),
            china_cidr_file: None,
            cidr_rules: Vec::new(),
            host_rules: Vec::new(),
        }
    }
}

/// `cidr = verdict`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CidrRuleConfig {
    pub cidr: String,
    pub verdict: String,
}

/// `suffix = verdict`; an empty verdict decides by address
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostRuleConfig {
    pub suffix: String,
    #[serde(default)]
    pub verdict: String,
}

/// Upstream proxy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamProxyConfig {
    pub kind: UpstreamKind,
    /// `host:port`
    pub server: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Reach tunnel servers through this proxy
    #[serde(default)]
    pub use_for_tunnel: bool,
}

/// Timeouts and reconnect policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Client handshake deadline in seconds
    pub handshake_secs: u64,
    /// Dial deadline in seconds
    pub connect_secs: u64,
    /// Idle session lifetime in seconds
    pub idle_secs: u64,
    /// Quiet period before a keepalive probe, in seconds
    pub keepalive_secs: u64,
    /// Reconnect attempts after the first failure
    pub reconnect_times: u32,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            handshake_secs: crate::protocol::HANDSHAKE_TIMEOUT,
            connect_secs: crate::protocol::CONNECT_TIMEOUT,
            idle_secs: crate::protocol::IDLE_TIMEOUT,
            keepalive_secs: crate::protocol::KEEPALIVE_INTERVAL,
            reconnect_times: 2,
        }
    }
}

/// Local DNS configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DnsConfig {
    /// Upstream resolvers (`ip:port`); empty uses the system resolver
    pub servers: Vec<String>,
    /// Cache lifetime in seconds
    pub cache_ttl_secs: u64,
    /// Wait for an in-flight resolution of the same host, in milliseconds
    pub lock_wait_ms: u64,
    /// Per-query timeout in milliseconds
    pub query_timeout_ms: u64,
    /// Cached host limit
    pub cache_size: usize,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            cache_ttl_secs: 300,
            lock_wait_ms: 500,
            query_timeout_ms: 3000,
            cache_size: 1024,
        }
    }
}

/// Extra listen port
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortMapConfig {
    pub listen: String,
    /// Pin every session on this port to one server
    #[serde(default)]
    pub server_id: Option<String>,
    /// Forward raw TCP to this `host:port` through the tunnel
    #[serde(default)]
    pub forward: Option<String>,
}

/// Automatic server disabling
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoDisableConfig {
    pub enabled: bool,
    /// Consecutive host-not-found errors before a server is disabled
    pub threshold: u32,
}

impl Default for AutoDisableConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            threshold: 5,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (pretty, json, compact)
    pub format: String,
    /// Log file path (optional)
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file: None,
        }
    }
}

/// Generate example configuration
pub fn generate_example_config() -> Config {
    Config {
        servers: vec![
            ServerConfig {
                password: "change-me".to_string(),
                ..ServerConfig::default()
            },
            ServerConfig {
                id: "server-2".to_string(),
                host: "tunnel.example.com".to_string(),
                port: 443,
                udp_port: Some(443),
                password: "change-me".to_string(),
                protocol: "verify_simple".to_string(),
                obfs: "http_simple".to_string(),
                obfs_param: "cdn.example.com".to_string(),
                ..ServerConfig::default()
            },
        ],
        rules: RulesConfig {
            mode: RuleMode::BypassLanAndChina,
            host_rules: vec![HostRuleConfig {
                suffix: "example.org".to_string(),
                verdict: "direct".to_string(),
            }],
            ..RulesConfig::default()
        },
        ..Config::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_example_config_is_valid() {
        let config = generate_example_config();
        config.validate().unwrap();
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed = Config::from_toml(&text).unwrap();
        assert_eq!(parsed.servers.len(), 2);
        assert_eq!(parsed.rules.mode, RuleMode::BypassLanAndChina);
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = Config::from_toml(
            r#"
            [[servers]]
            id = "a"
            host = "1.2.3.4"
            port = 8388
            password = "pw"
            "#,
        )
        .unwrap();
        assert_eq!(config.local.listen, "127.0.0.1:1080");
        assert_eq!(config.servers[0].method, "aes-256-cfb");
        assert_eq!(config.balance.algorithm, "LowException");
        assert_eq!(config.timeouts.reconnect_times, 2);
        assert_eq!(config.rules.mode, RuleMode::BypassLan);
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let mut config = generate_example_config();
        config.servers[1].id = config.servers[0].id.clone();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_names_rejected() {
        let mut config = generate_example_config();
        config.servers[0].method = "rot13".to_string();
        assert!(config.validate().is_err());

        let mut config = generate_example_config();
        config.servers[0].obfs = "tls9".to_string();
        assert!(config.validate().is_err());

        let mut config = generate_example_config();
        config.balance.algorithm = "Fastest".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rule_validation() {
        let mut config = generate_example_config();
        config.rules.cidr_rules.push(CidrRuleConfig {
            cidr: "10.0.0.0/8".to_string(),
            verdict: "sideways".to_string(),
        });
        assert!(config.validate().is_err());

        let mut config = generate_example_config();
        config.rules.host_rules.push(HostRuleConfig {
            suffix: "example.net".to_string(),
            verdict: String::new(),
        });
        config.validate().unwrap();
    }

    #[test]
    fn test_bare_address_rules_accepted() {
        let mut config = generate_example_config();
        config.rules.cidr_rules.push(CidrRuleConfig {
            cidr: "198.51.100.7".to_string(),
            verdict: "reject".to_string(),
        });
        config.rules.china_cidrs.push("36.0.0.1".to_string());
        config.validate().unwrap();
        crate::rules::RuleTable::from_config(&config.rules).unwrap();

        config.rules.china_cidrs.push("36.0.0.1/33".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_port_map_validation() {
        let mut config = generate_example_config();
        config.port_map.push(PortMapConfig {
            listen: "127.0.0.1:2080".to_string(),
            server_id: Some("nope".to_string()),
            forward: None,
        });
        assert!(config.validate().is_err());

        config.port_map[0].server_id = Some("server-2".to_string());
        config.port_map[0].forward = Some("10.0.0.1:22".to_string());
        config.validate().unwrap();
    }

    #[test]
    fn test_share_over_lan_widens_listen() {
        let local = LocalConfig {
            share_over_lan: true,
            ..LocalConfig::default()
        };
        assert_eq!(local.listen_addr().unwrap().to_string(), "0.0.0.0:1080");
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let config = generate_example_config();
        config.save(&path).unwrap();
        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.servers[1].obfs, "http_simple");
        assert_eq!(loaded.servers[1].udp_port, Some(443));
    }
}
