//! Endpoint addresses: IP host/port pairs and Unix-domain paths.
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::error::{Error, Result};

/// An endpoint a connection can bind, listen on, or connect to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    /// An IP host/port endpoint, optionally carrying an IPv6 scope id.
    Ip {
        /// The resolved socket address.
        addr: SocketAddr,
        /// IPv6 zone index (`%eth0`-style suffix), if present.
        scope: Option<u32>,
    },
    /// A Unix-domain endpoint.
    Unix(UnixEndpoint),
}

/// The three flavors of Unix-domain socket address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum UnixEndpoint {
    /// A filesystem path.
    Path(String),
    /// A Linux abstract-namespace name (no leading NUL in the stored string).
    Abstract(String),
    /// An anonymous endpoint, e.g. the peer of a `socketpair`.
    Unnamed,
}

/// Coarse reachability classification of an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Loopback interface only (`127.0.0.0/8`, `::1`, or any Unix socket).
    Loopback,
    /// RFC 1918 / link-local / unique-local space.
    Private,
    /// Globally routable.
    Public,
}

impl Address {
    /// Parse `host:port`, with IPv6 hosts in `[...]` brackets. `default_host`
    /// and `default_port` fill in an omitted half (an input of just `:1234`
    /// or just `example.org` is legal if the caller supplies the missing
    /// default); a fully empty input still fails.
    pub fn parse(input: &str, default_host: &str, default_port: u16) -> Result<Self> {
        let input = input.trim();
        if input.is_empty() {
            return Err(Error::InvalidAddress("empty address".to_string()));
        }

        let (host_part, port_part) = split_host_port(input)?;
        let host = if host_part.is_empty() {
            default_host
        } else {
            host_part
        };
        let port = match port_part {
            Some(p) => p
                .parse::<u16>()
                .map_err(|_| Error::InvalidAddress(format!("invalid port `{p}`")))?,
            None => default_port,
        };

        let (ip, scope) = parse_host(host)?;
        Ok(Address::Ip {
            addr: SocketAddr::new(ip, port),
            scope,
        })
    }

    /// Build a Unix-path endpoint.
    pub fn unix_path(path: impl Into<String>) -> Self {
        Address::Unix(UnixEndpoint::Path(path.into()))
    }

    /// Build a Linux abstract-namespace endpoint.
    pub fn unix_abstract(name: impl Into<String>) -> Self {
        Address::Unix(UnixEndpoint::Abstract(name.into()))
    }

    /// Build an unnamed Unix endpoint.
    pub fn unix_unnamed() -> Self {
        Address::Unix(UnixEndpoint::Unnamed)
    }

    /// The underlying [`SocketAddr`], if this is an IP endpoint.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        match self {
            Address::Ip { addr, .. } => Some(*addr),
            Address::Unix(_) => None,
        }
    }

    /// Classify this address's reachability.
    pub fn scope(&self) -> Scope {
        match self {
            Address::Unix(_) => Scope::Loopback,
            Address::Ip { addr, .. } => match addr.ip() {
                IpAddr::V4(v4) => classify_v4(v4),
                IpAddr::V6(v6) => classify_v6(v6),
            },
        }
    }

    /// True if this address can only be reached from the same host.
    pub fn is_loopback(&self) -> bool {
        self.scope() == Scope::Loopback
    }

    /// True if this address is in private addressing space (not loopback,
    /// not globally routable).
    pub fn is_private(&self) -> bool {
        self.scope() == Scope::Private
    }

    /// True if this address is globally routable.
    pub fn is_public(&self) -> bool {
        self.scope() == Scope::Public
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Ip { addr, scope } => match (addr, scope) {
                (SocketAddr::V6(v6), Some(scope)) => {
                    write!(f, "[{}%{}]:{}", v6.ip(), scope, v6.port())
                }
                (SocketAddr::V6(v6), None) => write!(f, "[{}]:{}", v6.ip(), v6.port()),
                (SocketAddr::V4(v4), _) => write!(f, "{}:{}", v4.ip(), v4.port()),
            },
            Address::Unix(UnixEndpoint::Path(path)) => write!(f, "{path}"),
            Address::Unix(UnixEndpoint::Abstract(name)) => write!(f, "@{name}"),
            Address::Unix(UnixEndpoint::Unnamed) => write!(f, "<unnamed>"),
        }
    }
}

fn split_host_port(input: &str) -> Result<(&str, Option<&str>)> {
    if let Some(rest) = input.strip_prefix('[') {
        let close = rest
            .find(']')
            .ok_or_else(|| Error::InvalidAddress(format!("unterminated `[` in `{input}`")))?;
        let host = &rest[..close];
        let after = &rest[close + 1..];
        let port = match after.strip_prefix(':') {
            Some(p) => Some(p),
            None if after.is_empty() => None,
            None => {
                return Err(Error::InvalidAddress(format!(
                    "unexpected trailing data after `]` in `{input}`"
                )))
            }
        };
        return Ok((host, port));
    }

    // Bracketless input: a bare IPv6 literal has more than one colon.
    if input.matches(':').count() > 1 {
        return Ok((input, None));
    }

    match input.rsplit_once(':') {
        Some((host, port)) => Ok((host, Some(port))),
        None => Ok((input, None)),
    }
}

fn parse_host(host: &str) -> Result<(IpAddr, Option<u32>)> {
    if let Some((addr, scope)) = host.split_once('%') {
        let ip: Ipv6Addr = addr
            .parse()
            .map_err(|_| Error::InvalidAddress(format!("invalid IPv6 host `{host}`")))?;
        let scope_id = scope
            .parse::<u32>()
            .map_err(|_| Error::InvalidAddress(format!("invalid scope id `{scope}`")))?;
        return Ok((IpAddr::V6(ip), Some(scope_id)));
    }

    host.parse::<IpAddr>()
        .map(|ip| (ip, None))
        .map_err(|_| Error::InvalidAddress(format!("invalid host `{host}`")))
}

fn classify_v4(ip: Ipv4Addr) -> Scope {
    if ip.is_loopback() {
        Scope::Loopback
    } else if ip.is_private() || ip.is_link_local() {
        Scope::Private
    } else {
        Scope::Public
    }
}

fn classify_v6(ip: Ipv6Addr) -> Scope {
    if ip.is_loopback() {
        Scope::Loopback
    } else if let Some(v4) = ip.to_ipv4_mapped() {
        classify_v4(v4)
    } else if (ip.segments()[0] & 0xfe00) == 0xfc00 || ip.is_unicast_link_local() {
        Scope::Private
    } else {
        Scope::Public
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_host_port() {
        let addr = Address::parse("127.0.0.1:8080", "0.0.0.0", 0).unwrap();
        assert_eq!(addr.socket_addr().unwrap().to_string(), "127.0.0.1:8080");
        assert!(addr.is_loopback());
    }

    #[test]
    fn parses_bracketed_ipv6() {
        let addr = Address::parse("[::1]:9", "::", 0).unwrap();
        assert_eq!(addr.socket_addr().unwrap().port(), 9);
        assert!(addr.is_loopback());
    }

    #[test]
    fn applies_defaults() {
        let addr = Address::parse(":4242", "192.168.1.1", 0).unwrap();
        assert_eq!(addr.socket_addr().unwrap().port(), 4242);
        assert!(addr.is_private());

        let addr = Address::parse("10.0.0.5", "0.0.0.0", 100).unwrap();
        assert_eq!(addr.socket_addr().unwrap().port(), 100);
    }

    #[test]
    fn rejects_empty_and_malformed() {
        assert!(Address::parse("", "0.0.0.0", 0).is_err());
        assert!(Address::parse("[::1", "::", 0).is_err());
        assert!(Address::parse("not-an-ip:80", "0.0.0.0", 0).is_err());
    }

    #[test]
    fn classifies_public_address() {
        let addr = Address::parse("8.8.8.8:53", "0.0.0.0", 0).unwrap();
        assert!(addr.is_public());
    }

    #[test]
    fn unix_endpoints_round_trip_display() {
        assert_eq!(Address::unix_path("/tmp/sock").to_string(), "/tmp/sock");
        assert_eq!(Address::unix_abstract("svc").to_string(), "@svc");
        assert_eq!(Address::unix_unnamed().to_string(), "<unnamed>");
        assert!(Address::unix_path("/tmp/sock").is_loopback());
    }
}
