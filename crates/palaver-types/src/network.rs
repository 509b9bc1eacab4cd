//! Network address records.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use serde::{Deserialize, Serialize};

use crate::PublicKey;

/// An IP address and port pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpPort {
    pub ip: IpAddr,
    pub port: u16,
}

impl IpPort {
    /// Build from parts.
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self { ip, port }
    }

    /// A zeroed placeholder address, used when a peer is relay-only.
    pub fn unspecified() -> Self {
        Self {
            ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 0,
        }
    }

    /// True if this address carries no routing information.
    pub fn is_unspecified(&self) -> bool {
        self.ip.is_unspecified() && self.port == 0
    }
}

impl From<SocketAddr> for IpPort {
    fn from(addr: SocketAddr) -> Self {
        Self {
            ip: addr.ip(),
            port: addr.port(),
        }
    }
}

impl From<IpPort> for SocketAddr {
    fn from(ipp: IpPort) -> Self {
        SocketAddr::new(ipp.ip, ipp.port)
    }
}

impl fmt::Display for IpPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// A TCP relay node: the relay's public key and its address.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayNode {
    /// The relay's long-term public key.
    pub public_key: PublicKey,
    /// The relay's address.
    pub ip_port: IpPort,
}

/// A persisted peer address: the peer's identity plus a relay it was
/// last reachable through.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedPeer {
    /// The peer's long-term encryption public key.
    pub public_key: PublicKey,
    /// A TCP relay the peer shared with us.
    pub relay: RelayNode,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unspecified_detection() {
        assert!(IpPort::unspecified().is_unspecified());

        let real = IpPort::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 33445);
        assert!(!real.is_unspecified());
    }

    #[test]
    fn socket_addr_round_trip() {
        let addr: SocketAddr = "192.168.1.5:8080".parse().expect("addr");
        let ipp = IpPort::from(addr);
        assert_eq!(SocketAddr::from(ipp), addr);
    }
}
