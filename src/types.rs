//! Core type definitions for the Regatta consensus engine.
//!
//! Identifiers:
//!
//! - [`ServerId`]: unique identifier of one server (UUID-based)
//! - [`ClusterId`]: unique identifier of a cluster, immutable for its lifetime
//! - [`Term`] = `u64`: Raft logical clock, incremented at each election
//! - [`LogIndex`] = `u64`: position in the replicated log, dense and >= 2 for
//!   real entries (index 1 is the sentinel prior to any entry)
//!
//! Plus [`Address`], the `tcp:HOST[:PORT]` / `ssl:HOST[:PORT]` endpoint
//! syntax used in cluster configurations, including the derived passive
//! (listening) form.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Raft term number.
pub type Term = u64;

/// Raft log position.
pub type LogIndex = u64;

/// Default TCP port for cluster traffic.
pub const DEFAULT_PORT: u16 = 6641;

/// Unique identifier for a server.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct ServerId(pub Uuid);

impl ServerId {
    /// Generate a fresh random server ID.
    pub fn generate() -> Self {
        ServerId(Uuid::new_v4())
    }

    /// Short prefix used in log messages.
    pub fn short(&self) -> String {
        self.0.to_string()[..4].to_string()
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Unique identifier for a cluster.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct ClusterId(pub Uuid);

impl ClusterId {
    /// Generate a fresh random cluster ID.
    pub fn generate() -> Self {
        ClusterId(Uuid::new_v4())
    }

    /// Short prefix used in log messages.
    pub fn short(&self) -> String {
        self.0.to_string()[..4].to_string()
    }
}

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Connection scheme for a server address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Tcp,
    Ssl,
}

impl Scheme {
    fn as_str(&self) -> &'static str {
        match self {
            Scheme::Tcp => "tcp",
            Scheme::Ssl => "ssl",
        }
    }
}

/// A parsed server address, `tcp:HOST[:PORT]` or `ssl:HOST[:PORT]`.
///
/// `HOST` is an IPv4 address, a `[`-bracketed IPv6 address, or a name.
/// `PORT` defaults to [`DEFAULT_PORT`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
}

impl Address {
    /// Parse and validate an active address.
    pub fn parse(address: &str) -> crate::Result<Address> {
        let err = |message: &str| crate::RegattaError::InvalidAddress {
            address: address.to_string(),
            message: message.to_string(),
        };

        let (scheme, rest) = if let Some(rest) = address.strip_prefix("tcp:") {
            (Scheme::Tcp, rest)
        } else if let Some(rest) = address.strip_prefix("ssl:") {
            (Scheme::Ssl, rest)
        } else {
            return Err(err("expected \"tcp\" or \"ssl\" address"));
        };

        let (host, port_str) = if let Some(rest) = rest.strip_prefix('[') {
            let close = rest.find(']').ok_or_else(|| err("unbalanced '[' in host"))?;
            let host = &rest[..close];
            let tail = &rest[close + 1..];
            let port = match tail.strip_prefix(':') {
                Some(p) => Some(p),
                None if tail.is_empty() => None,
                None => return Err(err("garbage after bracketed host")),
            };
            (host, port)
        } else {
            match rest.rsplit_once(':') {
                Some((host, port)) => {
                    if host.contains(':') {
                        return Err(err("IPv6 address must be bracketed"));
                    }
                    (host, Some(port))
                }
                None => (rest, None),
            }
        };

        if host.is_empty() {
            return Err(err("empty host"));
        }
        let port = match port_str {
            Some(p) => p.parse::<u16>().map_err(|_| err("bad port number"))?,
            None => DEFAULT_PORT,
        };

        Ok(Address {
            scheme,
            host: host.to_string(),
            port,
        })
    }

    /// The passive (listening) form of this address, derived by prefixing
    /// `p` to the scheme and reordering host and port.
    pub fn passive(&self) -> String {
        if self.host.contains(':') {
            format!("p{}:{}:[{}]", self.scheme.as_str(), self.port, self.host)
        } else {
            format!("p{}:{}:{}", self.scheme.as_str(), self.port, self.host)
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "{}:[{}]:{}", self.scheme.as_str(), self.host, self.port)
        } else {
            write!(f, "{}:{}:{}", self.scheme.as_str(), self.host, self.port)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_id_roundtrip() {
        let sid = ServerId::generate();
        let json = serde_json::to_string(&sid).unwrap();
        let back: ServerId = serde_json::from_str(&json).unwrap();
        assert_eq!(sid, back);
        assert_eq!(sid.short().len(), 4);
    }

    #[test]
    fn test_parse_tcp_address() {
        let addr = Address::parse("tcp:10.0.0.1:6642").unwrap();
        assert_eq!(addr.scheme, Scheme::Tcp);
        assert_eq!(addr.host, "10.0.0.1");
        assert_eq!(addr.port, 6642);
        assert_eq!(addr.to_string(), "tcp:10.0.0.1:6642");
    }

    #[test]
    fn test_parse_default_port() {
        let addr = Address::parse("ssl:db.example.org").unwrap();
        assert_eq!(addr.scheme, Scheme::Ssl);
        assert_eq!(addr.port, DEFAULT_PORT);
    }

    #[test]
    fn test_parse_ipv6() {
        let addr = Address::parse("tcp:[fe80::1]:4000").unwrap();
        assert_eq!(addr.host, "fe80::1");
        assert_eq!(addr.port, 4000);
        assert_eq!(addr.to_string(), "tcp:[fe80::1]:4000");

        let addr = Address::parse("tcp:[fe80::1]").unwrap();
        assert_eq!(addr.port, DEFAULT_PORT);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(Address::parse("udp:1.2.3.4").is_err());
        assert!(Address::parse("tcp:").is_err());
        assert!(Address::parse("tcp:fe80::1").is_err());
        assert!(Address::parse("tcp:host:notaport").is_err());
        assert!(Address::parse("tcp:[fe80::1").is_err());
    }

    #[test]
    fn test_passive_form() {
        let addr = Address::parse("tcp:10.0.0.1:6642").unwrap();
        assert_eq!(addr.passive(), "ptcp:6642:10.0.0.1");

        let addr = Address::parse("ssl:[fe80::1]:6642").unwrap();
        assert_eq!(addr.passive(), "pssl:6642:[fe80::1]");
    }
}
