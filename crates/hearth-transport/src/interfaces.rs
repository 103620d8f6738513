//! Local interface-address registry.
//!
//! Multicast fan-out needs the set of local addresses, their owning
//! interfaces, and whether each interface is multicast-capable. The
//! embedding platform populates this registry at startup and after
//! interface changes; the message layer only reads it.

use std::net::IpAddr;

/// One local address and the interface that owns it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceAddr {
    /// The local address.
    pub addr: IpAddr,
    /// OS interface index owning the address.
    pub interface_index: u32,
    /// Whether the interface supports multicast.
    pub multicast_capable: bool,
}

/// Registry of local interface addresses.
#[derive(Debug, Clone, Default)]
pub struct InterfaceRegistry {
    addrs: Vec<InterfaceAddr>,
}

impl InterfaceRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the full address list (platform interface-change event).
    pub fn set_addresses(&mut self, addrs: Vec<InterfaceAddr>) {
        self.addrs = addrs;
    }

    /// Add a single address.
    pub fn add(&mut self, addr: InterfaceAddr) {
        self.addrs.push(addr);
    }

    /// All registered addresses.
    pub fn iter(&self) -> impl Iterator<Item = &InterfaceAddr> {
        self.addrs.iter()
    }

    /// Addresses on multicast-capable interfaces.
    pub fn multicast_capable(&self) -> impl Iterator<Item = &InterfaceAddr> {
        self.addrs.iter().filter(|a| a.multicast_capable)
    }

    /// Whether any address is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_filtering() {
        let mut reg = InterfaceRegistry::new();
        assert!(reg.is_empty());

        reg.add(InterfaceAddr {
            addr: "192.168.4.10".parse().unwrap(),
            interface_index: 2,
            multicast_capable: true,
        });
        reg.add(InterfaceAddr {
            addr: "fd00::10".parse().unwrap(),
            interface_index: 3,
            multicast_capable: true,
        });
        reg.add(InterfaceAddr {
            addr: "10.0.0.1".parse().unwrap(),
            interface_index: 4,
            multicast_capable: false,
        });

        assert_eq!(reg.iter().count(), 3);
        assert_eq!(reg.multicast_capable().count(), 2);
    }

    #[test]
    fn test_set_addresses_replaces() {
        let mut reg = InterfaceRegistry::new();
        reg.add(InterfaceAddr {
            addr: "192.168.4.10".parse().unwrap(),
            interface_index: 2,
            multicast_capable: true,
        });

        reg.set_addresses(vec![]);
        assert!(reg.is_empty());
    }
}
