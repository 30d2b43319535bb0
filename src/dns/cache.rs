//! TTL cache with single-flight resolution

use super::{preferred, DnsError, Resolve};
use crate::config::DnsConfig;
use crate::server::ServerProfile;
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, trace};

/// Consecutive server errors after which its cached address is distrusted
pub const FORCE_EXPIRE_ERRORS: u64 = 10;

/// Cache tuning
#[derive(Debug, Clone, Copy)]
pub struct DnsCacheSettings {
    /// Entry lifetime
    pub ttl: Duration,
    /// How long to wait for another task resolving the same host
    pub lock_wait: Duration,
    /// Maximum cached hosts
    pub capacity: usize,
}

impl Default for DnsCacheSettings {
    fn default() -> Self {
        Self::from(&DnsConfig::default())
    }
}

impl From<&DnsConfig> for DnsCacheSettings {
    fn from(config: &DnsConfig) -> Self {
        Self {
            ttl: Duration::from_secs(config.cache_ttl_secs),
            lock_wait: Duration::from_millis(config.lock_wait_ms),
            capacity: config.cache_size,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    ip: IpAddr,
    updated: Instant,
}

/// Shared host name cache
pub struct DnsCache {
    resolver: Arc<dyn Resolve>,
    settings: DnsCacheSettings,
    entries: Mutex<LruCache<String, Entry>>,
    inflight: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl DnsCache {
    pub fn new(resolver: Arc<dyn Resolve>, settings: DnsCacheSettings) -> Self {
        let capacity = NonZeroUsize::new(settings.capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            resolver,
            settings,
            entries: Mutex::new(LruCache::new(capacity)),
            inflight: Mutex::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> DnsCacheSettings {
        self.settings
    }

    /// Unexpired cached address
    pub fn get(&self, host: &str) -> Option<IpAddr> {
        let key = host.to_ascii_lowercase();
        let mut entries = self.entries.lock();
        match entries.get(&key) {
            Some(e) if e.updated.elapsed() < self.settings.ttl => Some(e.ip),
            _ => None,
        }
    }

    fn stale(&self, key: &str) -> Option<IpAddr> {
        self.entries.lock().peek(key).map(|e| e.ip)
    }

    pub fn insert(&self, host: &str, ip: IpAddr) {
        self.insert_at(host, ip, Instant::now());
    }

    fn insert_at(&self, host: &str, ip: IpAddr, updated: Instant) {
        self.entries
            .lock()
            .put(host.to_ascii_lowercase(), Entry { ip, updated });
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock_for(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.inflight
            .lock()
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn release(&self, key: &str, lock: &Arc<tokio::sync::Mutex<()>>) {
        let mut inflight = self.inflight.lock();
        // Only the map and the caller still hold it
        if Arc::strong_count(lock) <= 2 {
            inflight.remove(key);
        }
    }

    async fn query(&self, host: &str) -> Result<IpAddr, DnsError> {
        let ips = self.resolver.resolve(host).await?;
        let ip = preferred(&ips).ok_or_else(|| DnsError::NotFound(host.to_string()))?;
        trace!("Resolved {} -> {}", host, ip);
        Ok(ip)
    }

    async fn query_and_store(&self, key: &str) -> Result<IpAddr, DnsError> {
        let ip = self.query(key).await?;
        self.insert(key, ip);
        Ok(ip)
    }

    /// Resolve a host, collapsing concurrent lookups of the same name
    pub async fn lookup(&self, host: &str) -> Result<IpAddr, DnsError> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(ip);
        }
        if let Some(ip) = self.get(host) {
            return Ok(ip);
        }

        let key = host.to_ascii_lowercase();
        let lock = self.lock_for(&key);

        let result = match timeout(self.settings.lock_wait, lock.lock()).await {
            Ok(_guard) => match self.get(&key) {
                Some(ip) => Ok(ip),
                None => self.query_and_store(&key).await,
            },
            Err(_) => match self.stale(&key) {
                Some(ip) => {
                    debug!("DNS lock busy for {}, using stale {}", key, ip);
                    Ok(ip)
                }
                None => self.query_and_store(&key).await,
            },
        };

        self.release(&key, &lock);
        result
    }

    /// Resolve a tunnel server's host through its own cache entry
    pub async fn resolve_server(&self, server: &ServerProfile) -> Result<IpAddr, DnsError> {
        if let Ok(ip) = server.host.parse::<IpAddr>() {
            return Ok(ip);
        }

        let errors = server.health().consecutive_errors();
        if let Some(ip) = self.server_entry(server, errors) {
            return Ok(ip);
        }

        let key = server.host.to_ascii_lowercase();
        let lock = self.lock_for(&key);

        let result = match timeout(self.settings.lock_wait, lock.lock()).await {
            Ok(_guard) => match self.server_entry(server, errors) {
                Some(ip) => Ok(ip),
                None => self.refresh_server(server, &key).await,
            },
            Err(_) => {
                let stale = server.dns_entry().ip;
                match stale {
                    Some(ip) => Ok(ip),
                    None => self.refresh_server(server, &key).await,
                }
            }
        };

        self.release(&key, &lock);
        result
    }

    fn server_entry(&self, server: &ServerProfile, errors: u64) -> Option<IpAddr> {
        let mut entry = server.dns_entry();
        if errors >= FORCE_EXPIRE_ERRORS && !entry.force_expire {
            debug!(
                "Server {} has {} consecutive errors, re-resolving {}",
                server.id, errors, server.host
            );
            entry.force_expire = true;
        }
        let fresh = entry
            .updated
            .map(|at| at.elapsed() < self.settings.ttl)
            .unwrap_or(false);
        match entry.ip {
            Some(ip) if fresh && !entry.force_expire && entry.host == server.host => Some(ip),
            _ => None,
        }
    }

    async fn refresh_server(&self, server: &ServerProfile, key: &str) -> Result<IpAddr, DnsError> {
        let ip = self.query(key).await?;
        let mut entry = server.dns_entry();
        entry.ip = Some(ip);
        entry.host = server.host.clone();
        entry.updated = Some(Instant::now());
        entry.force_expire = false;
        drop(entry);
        self.insert(key, ip);
        Ok(ip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::FailureKind;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingResolver {
        calls: AtomicUsize,
        delay: Duration,
        answer: IpAddr,
    }

    impl CountingResolver {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                delay,
                answer: "93.184.216.34".parse().unwrap(),
            })
        }
    }

    #[async_trait]
    impl Resolve for CountingResolver {
        async fn resolve(&self, _host: &str) -> Result<Vec<IpAddr>, DnsError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(vec![self.answer])
        }
    }

    fn settings(lock_wait: Duration) -> DnsCacheSettings {
        DnsCacheSettings {
            ttl: Duration::from_secs(60),
            lock_wait,
            capacity: 16,
        }
    }

    #[tokio::test]
    async fn test_concurrent_lookups_collapse() {
        let resolver = CountingResolver::new(Duration::from_millis(50));
        let cache = Arc::new(DnsCache::new(resolver.clone(), settings(Duration::from_secs(2))));

        let mut tasks = Vec::new();
        for _ in 0..10 {
            let cache = cache.clone();
            tasks.push(tokio::spawn(async move { cache.lookup("Example.com").await }));
        }
        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap(), resolver.answer);
        }
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.get("example.com"), Some(resolver.answer));
    }

    #[tokio::test]
    async fn test_literal_ip_skips_resolver() {
        let resolver = CountingResolver::new(Duration::ZERO);
        let cache = DnsCache::new(resolver.clone(), settings(Duration::from_millis(10)));
        assert_eq!(
            cache.lookup("10.0.0.1").await.unwrap(),
            "10.0.0.1".parse::<IpAddr>().unwrap()
        );
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_expired_entry_not_returned() {
        let resolver = CountingResolver::new(Duration::ZERO);
        let cache = DnsCache::new(resolver.clone(), settings(Duration::from_millis(100)));
        let old = Instant::now()
            .checked_sub(Duration::from_secs(120))
            .unwrap_or_else(Instant::now);
        cache.insert_at("example.com", "1.1.1.1".parse().unwrap(), old);

        assert_eq!(cache.get("example.com"), None);
        assert_eq!(cache.lookup("example.com").await.unwrap(), resolver.answer);
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stale_entry_under_contention() {
        let resolver = CountingResolver::new(Duration::from_millis(300));
        let cache = Arc::new(DnsCache::new(resolver.clone(), settings(Duration::from_millis(20))));
        let stale: IpAddr = "1.1.1.1".parse().unwrap();
        let old = Instant::now()
            .checked_sub(Duration::from_secs(120))
            .unwrap_or_else(Instant::now);
        cache.insert_at("example.com", stale, old);

        let slow = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.lookup("example.com").await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(cache.lookup("example.com").await.unwrap(), stale);
        assert_eq!(slow.await.unwrap().unwrap(), resolver.answer);
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_server_entry_force_expired_after_errors() {
        let resolver = CountingResolver::new(Duration::ZERO);
        let cache = DnsCache::new(resolver.clone(), settings(Duration::from_secs(1)));
        let server = ServerProfile::for_test("s1", "tunnel.example", 8388);

        cache.resolve_server(&server).await.unwrap();
        cache.resolve_server(&server).await.unwrap();
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 1);

        for _ in 0..FORCE_EXPIRE_ERRORS {
            server.health().record_failure(FailureKind::Timeout);
        }
        cache.resolve_server(&server).await.unwrap();
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 2);
        assert!(!server.dns_entry().force_expire);
    }
}
