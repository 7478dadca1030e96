//! Candidate backend registry.
//!
//! Parsed once at startup from the `CANDIDATES` list and never resized.
//! The prober refreshes each candidate's cached resolved address when it
//! reopens a probe channel; the accept path reads the cached address when
//! dispatching a new client.

use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::RwLock;

use crate::config::ProbeConfig;
use crate::metrics;

/// One configured backend endpoint; not necessarily the primary.
#[derive(Debug)]
pub struct Candidate {
    pub host: String,
    pub port: u16,
    /// Precomputed libpq-style connection string for the probe channel.
    pub conninfo: String,
    /// Last resolved socket address, refreshed by the prober.
    resolved: RwLock<Option<SocketAddr>>,
}

impl Candidate {
    /// Cached resolved address, if resolution has ever succeeded.
    pub fn resolved(&self) -> Option<SocketAddr> {
        *self.resolved.read().unwrap()
    }

    /// Resolve the candidate's host and refresh the cache.
    pub fn resolve(&self) -> Result<SocketAddr, std::io::Error> {
        let addr = resolve_host(&self.host, self.port)?;
        *self.resolved.write().unwrap() = Some(addr);
        Ok(addr)
    }

    /// `host:port` form for logs.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Immutable post-startup list of candidate backends.
#[derive(Debug)]
pub struct Registry {
    candidates: Vec<Candidate>,
}

impl Registry {
    /// Parse a comma-separated `host:port` list. Leading spaces per
    /// element are trimmed; a malformed entry aborts startup.
    pub fn parse(list: &str, probe: &ProbeConfig) -> Result<Self, ParseError> {
        if list.trim().is_empty() {
            return Err(ParseError::Empty);
        }

        let mut candidates = Vec::new();
        for raw in list.split(',') {
            let entry = raw.trim_start();
            let (host, port) = entry
                .rsplit_once(':')
                .ok_or_else(|| ParseError::Malformed(entry.to_string()))?;
            if host.is_empty() {
                return Err(ParseError::Malformed(entry.to_string()));
            }
            let port: u16 = port
                .parse()
                .map_err(|_| ParseError::Malformed(entry.to_string()))?;

            let conninfo = probe.conninfo(host, port);
            candidates.push(Candidate {
                host: host.to_string(),
                port,
                conninfo,
                resolved: RwLock::new(None),
            });
        }

        let registry = Self { candidates };

        // Initial DNS resolution; failures are retried by the prober.
        for cand in &registry.candidates {
            if cand.resolve().is_err() {
                tracing::warn!(
                    endpoint = %cand.endpoint(),
                    "initial DNS resolution failed"
                );
            }
            tracing::info!(endpoint = %cand.endpoint(), "configured backend");
        }

        metrics::SERVERS_TOTAL.set(registry.len() as i64);
        metrics::SERVERS_HEALTHY.set(0);
        metrics::SERVERS_UNHEALTHY.set(registry.len() as i64);

        Ok(registry)
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<&Candidate> {
        self.candidates.get(idx)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Candidate> {
        self.candidates.iter()
    }

    /// Index of the candidate whose cached resolved address structurally
    /// equals `addr`.
    pub fn index_of_addr(&self, addr: &SocketAddr) -> Option<usize> {
        self.candidates
            .iter()
            .position(|c| c.resolved().is_some_and(|r| addr_eq(&r, addr)))
    }
}

/// Resolve `host:port` to the first usable socket address.
pub fn resolve_host(host: &str, port: u16) -> Result<SocketAddr, std::io::Error> {
    (host, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses resolved"))
}

/// Structural socket-address equality: family, port and address bytes.
///
/// Deliberately ignores IPv6 flowinfo and scope so equality never depends
/// on how the address was written.
pub fn addr_eq(a: &SocketAddr, b: &SocketAddr) -> bool {
    match (a, b) {
        (SocketAddr::V4(a), SocketAddr::V4(b)) => {
            a.port() == b.port() && a.ip() == b.ip()
        }
        (SocketAddr::V6(a), SocketAddr::V6(b)) => {
            a.port() == b.port() && a.ip() == b.ip()
        }
        _ => false,
    }
}

/// Candidate-list parse failure; fatal at startup.
#[derive(Debug)]
pub enum ParseError {
    Empty,
    Malformed(String),
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::Empty => write!(f, "CANDIDATES is required and must not be empty"),
            ParseError::Malformed(entry) => {
                write!(f, "invalid candidate '{}' (expected host:port)", entry)
            }
        }
    }
}

impl std::error::Error for ParseError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProbeConfig;
    use std::net::{Ipv4Addr, Ipv6Addr, SocketAddrV4, SocketAddrV6};

    fn probe() -> ProbeConfig {
        ProbeConfig::default()
    }

    #[test]
    fn parses_candidate_list_with_leading_spaces() {
        let reg = Registry::parse("127.0.0.1:5432, 127.0.0.2:5433", &probe()).unwrap();
        assert_eq!(reg.len(), 2);
        assert_eq!(reg.get(0).unwrap().host, "127.0.0.1");
        assert_eq!(reg.get(0).unwrap().port, 5432);
        assert_eq!(reg.get(1).unwrap().host, "127.0.0.2");
        assert_eq!(reg.get(1).unwrap().port, 5433);
    }

    #[test]
    fn rejects_malformed_entries() {
        assert!(Registry::parse("", &probe()).is_err());
        assert!(Registry::parse("nocolon", &probe()).is_err());
        assert!(Registry::parse("host:notaport", &probe()).is_err());
        assert!(Registry::parse(":5432", &probe()).is_err());
        assert!(Registry::parse("ok:5432,bad", &probe()).is_err());
    }

    #[test]
    fn conninfo_carries_probe_settings() {
        let reg = Registry::parse("db1:5432", &probe()).unwrap();
        let conninfo = &reg.get(0).unwrap().conninfo;
        assert!(conninfo.contains("host=db1"));
        assert!(conninfo.contains("port=5432"));
        assert!(conninfo.contains("dbname=postgres"));
        assert!(conninfo.contains("application_name=pg-gateway"));
    }

    #[test]
    fn literal_addresses_resolve_immediately() {
        let reg = Registry::parse("127.0.0.1:5432", &probe()).unwrap();
        let addr = reg.get(0).unwrap().resolved().unwrap();
        assert_eq!(addr, "127.0.0.1:5432".parse().unwrap());
        assert_eq!(reg.index_of_addr(&addr), Some(0));
    }

    #[test]
    fn addr_eq_is_structural() {
        let a = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 5432));
        let b = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 5432));
        let c = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 5432));
        assert!(addr_eq(&a, &b));
        assert!(!addr_eq(&a, &c));

        // Same v6 address, different scope ids: still equal.
        let v6a = SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::LOCALHOST, 5432, 0, 0));
        let v6b = SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::LOCALHOST, 5432, 0, 7));
        assert!(addr_eq(&v6a, &v6b));

        // Family mismatch is never equal.
        assert!(!addr_eq(&a, &v6a));

        // Port mismatch is never equal.
        let d = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 5433));
        assert!(!addr_eq(&a, &d));
    }
}
