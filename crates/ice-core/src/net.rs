//! Address helpers and local address discovery

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};

use serde::{Deserialize, Serialize};
use tracing::debug;

/// IP address family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AddressFamily {
    V4,
    V6,
}

impl AddressFamily {
    pub fn of(ip: &IpAddr) -> Self {
        match ip {
            IpAddr::V4(_) => Self::V4,
            IpAddr::V6(_) => Self::V6,
        }
    }
}

/// `10/8`, `172.16/12` or `192.168/16`
pub fn is_private_ipv4(ip: &Ipv4Addr) -> bool {
    let [a, b, ..] = ip.octets();
    a == 10 || (a == 172 && (16..=31).contains(&b)) || (a == 192 && b == 168)
}

/// Source of this host's own addresses
pub trait LocalAddressSource: Send + Sync {
    /// The address this host would use to reach the internet over `family`
    fn local_ip(&self, family: AddressFamily) -> Option<IpAddr>;
}

/// Finds the outbound interface address by connecting an unbound UDP socket.
///
/// No packet is sent; the kernel only selects a route.
#[derive(Debug, Clone)]
pub struct UdpProbeAddressSource {
    v4_probe: SocketAddr,
    v6_probe: SocketAddr,
}

impl Default for UdpProbeAddressSource {
    fn default() -> Self {
        Self {
            v4_probe: SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)), 9),
            v6_probe: SocketAddr::new(IpAddr::V6(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1)), 9),
        }
    }
}

impl LocalAddressSource for UdpProbeAddressSource {
    fn local_ip(&self, family: AddressFamily) -> Option<IpAddr> {
        let (bind, probe): (SocketAddr, SocketAddr) = match family {
            AddressFamily::V4 => ((Ipv4Addr::UNSPECIFIED, 0).into(), self.v4_probe),
            AddressFamily::V6 => ((Ipv6Addr::UNSPECIFIED, 0).into(), self.v6_probe),
        };

        let socket = UdpSocket::bind(bind).ok()?;
        if let Err(e) = socket.connect(probe) {
            debug!("No {:?} route for local address discovery: {}", family, e);
            return None;
        }
        socket.local_addr().ok().map(|a| a.ip()).filter(|ip| !ip.is_unspecified())
    }
}

/// Fixed addresses, for hosts where discovery is done elsewhere
#[derive(Debug, Clone, Default)]
pub struct StaticAddressSource {
    pub ipv4: Option<IpAddr>,
    pub ipv6: Option<IpAddr>,
}

impl LocalAddressSource for StaticAddressSource {
    fn local_ip(&self, family: AddressFamily) -> Option<IpAddr> {
        match family {
            AddressFamily::V4 => self.ipv4,
            AddressFamily::V6 => self.ipv6,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn private_ranges() {
        for ip in ["10.0.0.1", "10.255.255.255", "172.16.0.1", "172.31.255.254", "192.168.1.1"] {
            assert!(is_private_ipv4(&ip.parse().unwrap()), "{} should be private", ip);
        }
        for ip in ["9.255.255.255", "172.15.0.1", "172.32.0.1", "192.169.0.1", "203.0.113.5", "8.8.8.8"] {
            assert!(!is_private_ipv4(&ip.parse().unwrap()), "{} should be public", ip);
        }
    }

    #[test]
    fn family_of() {
        assert_eq!(AddressFamily::of(&"1.2.3.4".parse().unwrap()), AddressFamily::V4);
        assert_eq!(AddressFamily::of(&"::1".parse().unwrap()), AddressFamily::V6);
    }

    #[test]
    fn static_source() {
        let source = StaticAddressSource {
            ipv4: Some("192.168.1.20".parse().unwrap()),
            ipv6: None,
        };
        assert_eq!(source.local_ip(AddressFamily::V4), Some("192.168.1.20".parse().unwrap()));
        assert_eq!(source.local_ip(AddressFamily::V6), None);
    }
}
