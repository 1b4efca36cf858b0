//! Node identity and membership views.

use {
    serde::{Deserialize, Serialize},
    std::{
        fmt,
        net::{IpAddr, SocketAddr},
    },
};

/// Identifies a cluster node by IP and port.
///
/// Ordering compares the IP first and the port second. Both sides of a
/// handshake use this ordering to agree on which of them sends the
/// [`ConnectInfo`](crate::connection::ConnectInfo).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Address(SocketAddr);

impl Address {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self(SocketAddr::new(ip, port))
    }

    pub fn ip(&self) -> IpAddr {
        self.0.ip()
    }

    pub fn port(&self) -> u16 {
        self.0.port()
    }

    pub fn socket_addr(&self) -> SocketAddr {
        self.0
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Self(addr)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for Address {
    type Err = std::net::AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<SocketAddr>().map(Self)
    }
}

/// A membership snapshot delivered by the group membership service.
///
/// Members are listed in join order; the first one is the coordinator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct View {
    pub id: u64,
    pub members: Vec<Address>,
}

impl View {
    pub fn new(id: u64, members: Vec<Address>) -> Self {
        Self { id, members }
    }

    pub fn contains(&self, addr: &Address) -> bool {
        self.members.contains(addr)
    }

    pub fn coordinator(&self) -> Option<&Address> {
        self.members.first()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordering_is_ip_then_port() {
        let a: Address = "10.0.0.1:100".parse().unwrap();
        let b: Address = "10.0.0.2:100".parse().unwrap();
        let c: Address = "10.0.0.1:200".parse().unwrap();
        assert!(a < b);
        assert!(a < c);
        assert!(c < b);
    }

    #[test]
    fn test_view_coordinator() {
        let a: Address = "10.0.0.1:100".parse().unwrap();
        let b: Address = "10.0.0.2:100".parse().unwrap();
        let view = View::new(7, vec![b, a]);
        assert_eq!(view.coordinator(), Some(&b));
        assert!(view.contains(&a));
        assert!(!View::default().contains(&a));
    }
}
