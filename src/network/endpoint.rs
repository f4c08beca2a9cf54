//! Stream endpoints
//!
//! An endpoint names one Source or Sink on a remote (or local) node: its
//! transport address plus the numeric id of the object on that node.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;

use super::addr::IpAddress;

/// Remote Source or Sink
///
/// Equality and hashing use the address and id only; the optional relay
/// address is routing information.
#[derive(Debug, Clone, Copy)]
pub struct Endpoint {
    pub address: IpAddress,
    pub id: i32,
    /// Server that forwards traffic when the peer is not directly reachable
    pub relay: Option<SocketAddr>,
}

impl Endpoint {
    pub fn new(address: impl Into<IpAddress>, id: i32) -> Self {
        Self {
            address: address.into(),
            id,
            relay: None,
        }
    }

    pub fn with_relay(mut self, relay: Option<SocketAddr>) -> Self {
        self.relay = relay;
        self
    }

    pub fn socket_addr(&self) -> SocketAddr {
        self.address.unmapped()
    }

    pub fn is_relayed(&self) -> bool {
        self.relay.is_some()
    }
}

impl PartialEq for Endpoint {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.address == other.address
    }
}

impl Eq for Endpoint {}

impl Hash for Endpoint {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address.hash(state);
        self.id.hash(state);
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.relay {
            Some(relay) => write!(f, "{}#{} (via {})", self.address, self.id, relay),
            None => write!(f, "{}#{}", self.address, self.id),
        }
    }
}
