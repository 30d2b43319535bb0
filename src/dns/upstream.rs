//! Plain UDP DNS client
//!
//! Sends an A query (then AAAA if there is no A answer) to each configured
//! resolver in turn until one answers.

use super::{DnsError, Resolve};
use async_trait::async_trait;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, trace};

/// DNS record types used here
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum QueryType {
    A = 1,
    Aaaa = 28,
}

/// Resolver speaking DNS over UDP to a fixed server list
pub struct UpstreamResolver {
    servers: Vec<SocketAddr>,
    query_timeout: Duration,
}

/// Parse `ip` or `ip:port`; port defaults to 53
pub fn parse_server(s: &str) -> Result<SocketAddr, DnsError> {
    if let Ok(addr) = s.parse::<SocketAddr>() {
        return Ok(addr);
    }
    s.parse::<IpAddr>()
        .map(|ip| SocketAddr::new(ip, 53))
        .map_err(|_| DnsError::InvalidServer(s.to_string()))
}

impl UpstreamResolver {
    pub fn new(servers: Vec<SocketAddr>, query_timeout: Duration) -> Self {
        Self {
            servers,
            query_timeout,
        }
    }

    async fn query(
        &self,
        server: SocketAddr,
        host: &str,
        qtype: QueryType,
    ) -> Result<Vec<IpAddr>, DnsError> {
        let bind: SocketAddr = if server.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(bind).await?;
        socket.connect(server).await?;

        let tx_id = rand::random::<u16>();
        let packet = build_query(tx_id, host, qtype)?;
        socket.send(&packet).await?;

        let mut buf = [0u8; 1500];
        let len = timeout(self.query_timeout, socket.recv(&mut buf))
            .await
            .map_err(|_| DnsError::Timeout(host.to_string()))??;

        trace!("DNS {} answered {} bytes for {}", server, len, host);
        parse_response(&buf[..len], tx_id, qtype)
    }
}

#[async_trait]
impl Resolve for UpstreamResolver {
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>, DnsError> {
        let mut last_err = DnsError::NotFound(host.to_string());

        for &server in &self.servers {
            for qtype in [QueryType::A, QueryType::Aaaa] {
                match self.query(server, host, qtype).await {
                    Ok(ips) if !ips.is_empty() => return Ok(ips),
                    Ok(_) => {}
                    Err(e) => {
                        debug!("DNS query to {} for {} failed: {}", server, host, e);
                        last_err = e;
                        break;
                    }
                }
            }
        }

        Err(last_err)
    }
}

/// Build a DNS query packet
pub fn build_query(tx_id: u16, qname: &str, qtype: QueryType) -> Result<Vec<u8>, DnsError> {
    let mut packet = Vec::with_capacity(32 + qname.len());

    packet.extend_from_slice(&tx_id.to_be_bytes());
    // Flags: standard query, recursion desired
    packet.extend_from_slice(&[0x01, 0x00]);
    // QDCOUNT 1, ANCOUNT/NSCOUNT/ARCOUNT 0
    packet.extend_from_slice(&[0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);

    for label in qname.trim_end_matches('.').split('.') {
        if label.is_empty() || label.len() > 63 {
            return Err(DnsError::Malformed(format!("bad label in {}", qname)));
        }
        packet.push(label.len() as u8);
        packet.extend_from_slice(label.as_bytes());
    }
    packet.push(0);

    packet.extend_from_slice(&(qtype as u16).to_be_bytes());
    // Class IN
    packet.extend_from_slice(&[0x00, 0x01]);

    Ok(packet)
}

fn skip_name(packet: &[u8], mut pos: usize) -> Result<usize, DnsError> {
    while pos < packet.len() {
        let b = packet[pos];
        if b == 0 {
            return Ok(pos + 1);
        } else if b >= 0xC0 {
            return Ok(pos + 2);
        }
        pos += (b as usize) + 1;
    }
    Err(DnsError::Malformed("name runs past end".to_string()))
}

/// Extract the addresses of the requested type from a response
pub fn parse_response(packet: &[u8], tx_id: u16, qtype: QueryType) -> Result<Vec<IpAddr>, DnsError> {
    if packet.len() < 12 {
        return Err(DnsError::Malformed("response too short".to_string()));
    }
    if u16::from_be_bytes([packet[0], packet[1]]) != tx_id {
        return Err(DnsError::Malformed("transaction ID mismatch".to_string()));
    }

    let rcode = packet[3] & 0x0F;
    if rcode == 3 {
        return Err(DnsError::NotFound("NXDOMAIN".to_string()));
    }
    if rcode != 0 {
        return Err(DnsError::Malformed(format!("RCODE={}", rcode)));
    }

    let qdcount = u16::from_be_bytes([packet[4], packet[5]]) as usize;
    let ancount = u16::from_be_bytes([packet[6], packet[7]]) as usize;

    let mut pos = 12;
    for _ in 0..qdcount {
        pos = skip_name(packet, pos)? + 4;
    }

    let mut ips = Vec::new();
    for _ in 0..ancount {
        pos = skip_name(packet, pos)?;
        if pos + 10 > packet.len() {
            break;
        }
        let rtype = u16::from_be_bytes([packet[pos], packet[pos + 1]]);
        let rdlength = u16::from_be_bytes([packet[pos + 8], packet[pos + 9]]) as usize;
        pos += 10;
        if pos + rdlength > packet.len() {
            break;
        }

        let rdata = &packet[pos..pos + rdlength];
        match (rtype, qtype) {
            (1, QueryType::A) if rdlength == 4 => {
                ips.push(IpAddr::V4(Ipv4Addr::new(rdata[0], rdata[1], rdata[2], rdata[3])));
            }
            (28, QueryType::Aaaa) if rdlength == 16 => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(rdata);
                ips.push(IpAddr::V6(Ipv6Addr::from(octets)));
            }
            _ => {}
        }
        pos += rdlength;
    }

    Ok(ips)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn answer(tx_id: u16, query: &[u8], records: &[(u16, &[u8])]) -> Vec<u8> {
        let mut packet = query.to_vec();
        packet[0..2].copy_from_slice(&tx_id.to_be_bytes());
        packet[2] = 0x81;
        packet[3] = 0x80;
        packet[6..8].copy_from_slice(&(records.len() as u16).to_be_bytes());
        for (rtype, rdata) in records {
            packet.extend_from_slice(&[0xC0, 0x0C]);
            packet.extend_from_slice(&rtype.to_be_bytes());
            packet.extend_from_slice(&[0x00, 0x01, 0x00, 0x00, 0x01, 0x2C]);
            packet.extend_from_slice(&(rdata.len() as u16).to_be_bytes());
            packet.extend_from_slice(rdata);
        }
        packet
    }

    #[test]
    fn test_build_query() {
        let packet = build_query(0x1234, "example.com", QueryType::A).unwrap();
        assert_eq!(&packet[0..2], &[0x12, 0x34]);
        assert_eq!(&packet[12..20], b"\x07example");
        assert_eq!(&packet[packet.len() - 4..], &[0x00, 0x01, 0x00, 0x01]);
        assert!(build_query(1, "bad..name", QueryType::A).is_err());
    }

    #[test]
    fn test_parse_a_records() {
        let query = build_query(7, "example.com", QueryType::A).unwrap();
        let packet = answer(7, &query, &[(5, &b"\x03www\x00"[..]), (1, &[93, 184, 216, 34][..])]);
        let ips = parse_response(&packet, 7, QueryType::A).unwrap();
        assert_eq!(ips, vec![IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34))]);

        assert!(parse_response(&packet, 8, QueryType::A).is_err());
    }

    #[test]
    fn test_parse_nxdomain() {
        let query = build_query(9, "nope.invalid", QueryType::A).unwrap();
        let mut packet = answer(9, &query, &[]);
        packet[3] = 0x83;
        assert!(matches!(
            parse_response(&packet, 9, QueryType::A),
            Err(DnsError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_resolve_against_local_server() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();

        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            let (len, peer) = server.recv_from(&mut buf).await.unwrap();
            let tx_id = u16::from_be_bytes([buf[0], buf[1]]);
            let reply = answer(tx_id, &buf[..len], &[(1, &[10, 1, 2, 3][..])]);
            server.send_to(&reply, peer).await.unwrap();
        });

        let resolver = UpstreamResolver::new(vec![addr], Duration::from_secs(2));
        let ips = resolver.resolve("intranet.test").await.unwrap();
        assert_eq!(ips, vec![IpAddr::V4(Ipv4Addr::new(10, 1, 2, 3))]);
    }

    #[test]
    fn test_parse_server() {
        assert_eq!(parse_server("8.8.8.8").unwrap().port(), 53);
        assert_eq!(parse_server("1.1.1.1:5353").unwrap().port(), 5353);
        assert!(parse_server("dns.google").is_err());
    }
}
