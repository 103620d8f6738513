//! Message layer configuration.

use crate::{NODE_ID_NOT_SPECIFIED, WELL_KNOWN_PORT};
use std::net::{Ipv4Addr, Ipv6Addr};

/// Configuration consumed at init and at every endpoint refresh.
#[derive(Debug, Clone)]
pub struct Config {
    /// Accept inbound TCP connections.
    pub listen_tcp: bool,

    /// Receive UDP datagrams.
    pub listen_udp: bool,

    /// Enable IPv4 endpoints.
    pub listen_ipv4: bool,

    /// Enable IPv6 endpoints.
    pub listen_ipv6: bool,

    /// Also open ephemeral-port UDP endpoints for outbound-only traffic.
    pub ephemeral_udp: bool,

    /// Also listen for unsecured TCP connections on the dedicated port.
    pub unsecured_tcp: bool,

    /// Bind to this IPv4 address instead of the wildcard.
    pub bound_addr_v4: Option<Ipv4Addr>,

    /// Bind to this IPv6 address instead of the wildcard.
    pub bound_addr_v6: Option<Ipv6Addr>,

    /// Interface index accompanying the bound addresses.
    pub bound_interface: Option<u32>,

    /// Listening port for the well-known endpoints.
    pub port: u16,

    /// This node's 64-bit identifier.
    pub local_node_id: u64,
}

impl Config {
    /// Whether the layer is bound to specific local addresses rather than
    /// the wildcard.
    #[must_use]
    pub fn is_bound_to_address(&self) -> bool {
        self.bound_addr_v4.is_some() || self.bound_addr_v6.is_some()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_tcp: true,
            listen_udp: true,
            listen_ipv4: true,
            listen_ipv6: true,
            ephemeral_udp: false,
            unsecured_tcp: false,
            bound_addr_v4: None,
            bound_addr_v6: None,
            bound_interface: None,
            port: WELL_KNOWN_PORT,
            local_node_id: NODE_ID_NOT_SPECIFIED,
        }
    }
}
