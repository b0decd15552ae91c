//! Node identity.
//!
//! A [`NodeID`] identifies a cluster member by its advertised TCP endpoint. It is both the
//! connection key used by the connection pool and the value type stored in the subscription
//! map.

use std::fmt;
use std::net::SocketAddr;

/// Identity of a cluster member: the host and port a peer should dial to reach it.
///
/// Two nodes are equal iff `host` and `port` match; `host` is compared as a plain string, so
/// `"127.0.0.1"` and `"localhost"` are treated as distinct identities (the bus never resolves
/// DNS to compare nodes).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeID {
    /// Advertised host (may be overridden by `BusOptions::public_host`).
    pub host: String,
    /// Advertised port (may be overridden by `BusOptions::public_port`).
    pub port: u16,
}

impl NodeID {
    /// Create a new node identity.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse a `host:port` socket address into a node identity for dialing.
    ///
    /// # Errors
    ///
    /// Returns an error if `self` does not parse as a valid socket address (e.g. a DNS name
    /// without prior resolution).
    pub fn to_socket_addr(&self) -> std::io::Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|_| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("cannot resolve node id {self} to a socket address"),
                )
            })
    }
}

impl fmt::Display for NodeID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl From<SocketAddr> for NodeID {
    fn from(addr: SocketAddr) -> Self {
        Self {
            host: addr.ip().to_string(),
            port: addr.port(),
        }
    }
}
