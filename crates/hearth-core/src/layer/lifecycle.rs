//! Endpoint lifecycle management.
//!
//! Nine endpoint slots are managed, one per (transport, family,
//! port-class) tuple. [`MessageLayer::refresh_endpoints`] converges each
//! slot to the state the configuration implies and may be called
//! repeatedly; an unchanged configuration causes no socket churn.

use super::MessageLayer;
use crate::error::Error;
use crate::{ALL_NODES_MULTICAST_V6, UNSECURED_PORT};
use hearth_transport::{TcpListenEndpoint, UdpEndpoint};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// The managed endpoint table. At most one live instance per tuple.
#[derive(Debug, Default)]
pub(crate) struct EndpointSlots {
    pub tcp_v6: Option<TcpListenEndpoint>,
    pub tcp_v4: Option<TcpListenEndpoint>,
    pub tcp_unsecured_v6: Option<TcpListenEndpoint>,
    pub udp_v6: Option<UdpEndpoint>,
    pub udp_v4: Option<UdpEndpoint>,
    pub udp_ephemeral_v6: Option<UdpEndpoint>,
    pub udp_ephemeral_v4: Option<UdpEndpoint>,
    pub udp_multicast_v6: Option<UdpEndpoint>,
    pub udp_broadcast_v4: Option<UdpEndpoint>,
}

/// Receive-side identifier for one UDP endpoint slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UdpSlot {
    V6,
    V4,
    EphemeralV6,
    EphemeralV4,
    MulticastV6,
    BroadcastV4,
}

impl EndpointSlots {
    /// The sending endpoint for a destination family and port class.
    pub fn udp_for(&mut self, ipv4: bool, ephemeral: bool) -> Option<&mut UdpEndpoint> {
        match (ipv4, ephemeral) {
            (true, false) => self.udp_v4.as_mut(),
            (true, true) => self.udp_ephemeral_v4.as_mut(),
            (false, false) => self.udp_v6.as_mut(),
            (false, true) => self.udp_ephemeral_v6.as_mut(),
        }
    }

    /// A UDP slot by receive-side identifier.
    pub fn udp_slot_mut(&mut self, slot: UdpSlot) -> Option<&mut UdpEndpoint> {
        match slot {
            UdpSlot::V6 => self.udp_v6.as_mut(),
            UdpSlot::V4 => self.udp_v4.as_mut(),
            UdpSlot::EphemeralV6 => self.udp_ephemeral_v6.as_mut(),
            UdpSlot::EphemeralV4 => self.udp_ephemeral_v4.as_mut(),
            UdpSlot::MulticastV6 => self.udp_multicast_v6.as_mut(),
            UdpSlot::BroadcastV4 => self.udp_broadcast_v4.as_mut(),
        }
    }

    fn drop_udp(&mut self) {
        self.udp_v6 = None;
        self.udp_v4 = None;
        self.udp_ephemeral_v6 = None;
        self.udp_ephemeral_v4 = None;
        self.udp_multicast_v6 = None;
        self.udp_broadcast_v4 = None;
    }
}

/// Converge one slot: release when no longer wanted, create when newly
/// wanted, leave alone otherwise. A failed create leaves the slot empty.
fn converge<T>(
    slot: &mut Option<T>,
    desired: bool,
    name: &str,
    create: impl FnOnce() -> Result<T, Error>,
) -> Result<(), Error> {
    match (slot.is_some(), desired) {
        (true, false) => {
            *slot = None;
            tracing::info!(endpoint = name, "endpoint released");
        }
        (false, true) => {
            *slot = Some(create().map_err(|e| {
                tracing::warn!(endpoint = name, error = %e, "endpoint bind failed");
                e
            })?);
            tracing::info!(endpoint = name, "endpoint listening");
        }
        _ => {}
    }
    Ok(())
}

impl MessageLayer {
    /// Converge every endpoint slot to the current configuration.
    ///
    /// Idempotent: calling twice with an unchanged configuration touches
    /// no socket the second time. A pending UDP force-refresh (broken-pipe
    /// recovery) recycles all UDP slots first.
    ///
    /// # Errors
    ///
    /// The first bind/listen failure is returned; already-converged slots
    /// keep their state and the failing slot is left empty.
    pub fn refresh_endpoints(&mut self) -> Result<(), Error> {
        if std::mem::take(&mut self.udp_refresh_pending) {
            tracing::info!("recycling all UDP endpoints on force-refresh");
            self.endpoints.drop_udp();
        }

        let cfg = self.config.clone();
        let v6_addr = IpAddr::V6(cfg.bound_addr_v6.unwrap_or(Ipv6Addr::UNSPECIFIED));
        let v4_addr = IpAddr::V4(cfg.bound_addr_v4.unwrap_or(Ipv4Addr::UNSPECIFIED));

        converge(
            &mut self.endpoints.tcp_v6,
            cfg.listen_tcp && cfg.listen_ipv6,
            "tcp-v6",
            || TcpListenEndpoint::bind(SocketAddr::new(v6_addr, cfg.port)).map_err(Error::from),
        )?;

        converge(
            &mut self.endpoints.tcp_v4,
            cfg.listen_tcp && cfg.listen_ipv4,
            "tcp-v4",
            || TcpListenEndpoint::bind(SocketAddr::new(v4_addr, cfg.port)).map_err(Error::from),
        )?;

        converge(
            &mut self.endpoints.tcp_unsecured_v6,
            cfg.listen_tcp && cfg.listen_ipv6 && cfg.unsecured_tcp,
            "tcp-unsecured-v6",
            || {
                TcpListenEndpoint::bind(SocketAddr::new(v6_addr, UNSECURED_PORT))
                    .map_err(Error::from)
            },
        )?;

        converge(
            &mut self.endpoints.udp_v6,
            cfg.listen_udp && cfg.listen_ipv6,
            "udp-v6",
            || UdpEndpoint::bind(SocketAddr::new(v6_addr, cfg.port)).map_err(Error::from),
        )?;

        converge(
            &mut self.endpoints.udp_v4,
            cfg.listen_udp && cfg.listen_ipv4,
            "udp-v4",
            || UdpEndpoint::bind(SocketAddr::new(v4_addr, cfg.port)).map_err(Error::from),
        )?;

        converge(
            &mut self.endpoints.udp_ephemeral_v6,
            cfg.listen_udp && cfg.listen_ipv6 && cfg.ephemeral_udp,
            "udp-ephemeral-v6",
            || UdpEndpoint::bind(SocketAddr::new(v6_addr, 0)).map_err(Error::from),
        )?;

        converge(
            &mut self.endpoints.udp_ephemeral_v4,
            cfg.listen_udp && cfg.listen_ipv4 && cfg.ephemeral_udp,
            "udp-ephemeral-v4",
            || UdpEndpoint::bind(SocketAddr::new(v4_addr, 0)).map_err(Error::from),
        )?;

        // When bound to a specific address the main UDP socket no longer
        // sees group traffic, so a dedicated wildcard receiver joins the
        // all-nodes group.
        converge(
            &mut self.endpoints.udp_multicast_v6,
            cfg.listen_udp && cfg.listen_ipv6 && cfg.bound_addr_v6.is_some(),
            "udp-multicast-v6",
            || {
                UdpEndpoint::bind_multicast(
                    SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), cfg.port),
                    ALL_NODES_MULTICAST_V6,
                    cfg.bound_interface,
                )
                .map_err(Error::from)
            },
        )?;

        converge(
            &mut self.endpoints.udp_broadcast_v4,
            cfg.listen_udp && cfg.listen_ipv4 && cfg.bound_addr_v4.is_some(),
            "udp-broadcast-v4",
            || {
                UdpEndpoint::bind_broadcast(SocketAddr::new(
                    IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                    cfg.port,
                ))
                .map_err(Error::from)
            },
        )?;

        Ok(())
    }

    /// Release every endpoint, reset both pools, and clear lifecycle
    /// flags.
    ///
    /// Teardown order: TCP listeners, the unsecured listener, well-known
    /// UDP, ephemeral UDP, then the multicast/broadcast receivers.
    pub fn shutdown(&mut self) {
        tracing::info!("message layer shutting down");

        self.endpoints.tcp_v6 = None;
        self.endpoints.tcp_v4 = None;
        self.endpoints.tcp_unsecured_v6 = None;
        self.endpoints.udp_v6 = None;
        self.endpoints.udp_v4 = None;
        self.endpoints.udp_ephemeral_v6 = None;
        self.endpoints.udp_ephemeral_v4 = None;
        self.endpoints.udp_multicast_v6 = None;
        self.endpoints.udp_broadcast_v4 = None;

        self.connections.reset_all();
        self.tunnels.reset_all();
        self.udp_refresh_pending = false;

        #[cfg(feature = "fault-injection")]
        {
            self.drop_outbound = false;
            self.drop_inbound = false;
        }
    }

    /// Local address of the well-known UDP endpoint for a family, mostly
    /// for diagnostics and tests.
    #[must_use]
    pub fn udp_local_addr(&self, ipv4: bool) -> Option<SocketAddr> {
        let ep = if ipv4 {
            self.endpoints.udp_v4.as_ref()
        } else {
            self.endpoints.udp_v6.as_ref()
        };
        ep.and_then(|e| e.local_addr().ok())
    }

    /// Local address of the TCP listener for a family.
    #[must_use]
    pub fn tcp_local_addr(&self, ipv4: bool) -> Option<SocketAddr> {
        let ep = if ipv4 {
            self.endpoints.tcp_v4.as_ref()
        } else {
            self.endpoints.tcp_v6.as_ref()
        };
        ep.and_then(|e| e.local_addr().ok())
    }
}
