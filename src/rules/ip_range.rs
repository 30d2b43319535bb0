//! Longest-prefix-match CIDR table

use ipnet::IpNet;
use std::collections::HashMap;
use std::net::IpAddr;

/// Networks of one prefix length, keyed by masked address
#[derive(Debug, Clone)]
struct Bucket<K, V> {
    prefix_len: u8,
    nets: HashMap<K, V>,
}

/// CIDR table mapping networks to values
///
/// Lookups return the value of the most specific network containing the
/// address.
#[derive(Debug, Clone)]
pub struct IpRangeTable<V> {
    v4: Vec<Bucket<u32, V>>,
    v6: Vec<Bucket<u128, V>>,
    len: usize,
}

impl<V> Default for IpRangeTable<V> {
    fn default() -> Self {
        Self {
            v4: Vec::new(),
            v6: Vec::new(),
            len: 0,
        }
    }
}

fn mask_v4(bits: u8) -> u32 {
    if bits == 0 {
        0
    } else {
        (!0u32) << (32 - bits as u32)
    }
}

fn mask_v6(bits: u8) -> u128 {
    if bits == 0 {
        0
    } else {
        (!0u128) << (128 - bits as u32)
    }
}

fn bucket_for<K: std::hash::Hash + Eq, V>(
    buckets: &mut Vec<Bucket<K, V>>,
    prefix_len: u8,
) -> &mut HashMap<K, V> {
    let pos = match buckets.iter().position(|b| b.prefix_len <= prefix_len) {
        Some(pos) if buckets[pos].prefix_len == prefix_len => pos,
        Some(pos) => {
            buckets.insert(
                pos,
                Bucket {
                    prefix_len,
                    nets: HashMap::new(),
                },
            );
            pos
        }
        None => {
            buckets.push(Bucket {
                prefix_len,
                nets: HashMap::new(),
            });
            buckets.len() - 1
        }
    };
    &mut buckets[pos].nets
}

impl<V> IpRangeTable<V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a network, replacing any value stored for the same network
    pub fn insert(&mut self, net: IpNet, value: V) {
        let prefix_len = net.prefix_len();
        let replaced = match net {
            IpNet::V4(n) => {
                let key = u32::from(n.network()) & mask_v4(prefix_len);
                bucket_for(&mut self.v4, prefix_len).insert(key, value)
            }
            IpNet::V6(n) => {
                let key = u128::from(n.network()) & mask_v6(prefix_len);
                bucket_for(&mut self.v6, prefix_len).insert(key, value)
            }
        };
        if replaced.is_none() {
            self.len += 1;
        }
    }

    /// Value of the most specific network containing `ip`
    pub fn lookup(&self, ip: IpAddr) -> Option<&V> {
        match ip {
            IpAddr::V4(v4) => {
                let x = u32::from(v4);
                self.v4
                    .iter()
                    .find_map(|b| b.nets.get(&(x & mask_v4(b.prefix_len))))
            }
            IpAddr::V6(v6) => {
                if let Some(v4) = v6.to_ipv4_mapped() {
                    return self.lookup(IpAddr::V4(v4));
                }
                let x = u128::from(v6);
                self.v6
                    .iter()
                    .find_map(|b| b.nets.get(&(x & mask_v6(b.prefix_len))))
            }
        }
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        self.lookup(ip).is_some()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl IpRangeTable<()> {
    /// Build a set from CIDR lines
    pub fn from_lines<'a, I>(lines: I) -> Result<Self, super::RuleError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut table = Self::new();
        table.extend_lines(lines)?;
        Ok(table)
    }

    /// Add CIDR lines, skipping blank lines and `#` comments; returns how many were added
    pub fn extend_lines<'a, I>(&mut self, lines: I) -> Result<usize, super::RuleError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut added = 0;
        for line in lines {
            let s = line.trim();
            if s.is_empty() || s.starts_with('#') {
                continue;
            }
            self.insert(parse_net(s)?, ());
            added += 1;
        }
        Ok(added)
    }
}

/// Parse `a.b.c.d/len`, or a bare address as a host route
pub fn parse_net(s: &str) -> Result<IpNet, super::RuleError> {
    let s = s.trim();
    if let Ok(net) = s.parse::<IpNet>() {
        return Ok(net.trunc());
    }
    s.parse::<IpAddr>()
        .map(IpNet::from)
        .map_err(|_| super::RuleError::InvalidCidr(s.to_string()))
}
