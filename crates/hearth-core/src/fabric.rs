//! Fabric and session directory interface.
//!
//! A fabric is the logical mesh-local addressing domain shared by a set of
//! paired nodes. The directory owning fabric membership, session keys, and
//! message counters lives outside this layer; the message layer consumes
//! it through the [`FabricDirectory`] trait and never mutates key material.

use crate::error::Error;
use hearth_crypto::SessionKeys;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};

/// How the peer was authenticated, derived from the session lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PeerAuthMode {
    /// No authentication (unprotected message).
    #[default]
    Unauthenticated,
    /// Per-peer session key established by the security collaborator.
    SessionKey,
    /// Fabric-wide group key.
    GroupKey,
}

/// Whether a received (peer, message id) pair was seen before.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicateStatus {
    /// First sighting.
    New,
    /// Already observed in this session.
    Duplicate,
}

/// Session material and status for one (peer, key id) binding.
#[derive(Debug, Clone)]
pub struct SessionState {
    /// Key material for the session's protection scheme.
    pub keys: SessionKeys,
    /// Authentication mode behind the key material.
    pub auth_mode: PeerAuthMode,
    /// Whether the outbound message counter is synchronized with the
    /// peer; when false, sends carry a counter-sync request.
    pub message_id_synchronized: bool,
}

/// The fabric/session directory consumed by the message layer.
pub trait FabricDirectory {
    /// Look up session state for a peer and key id.
    ///
    /// # Errors
    ///
    /// [`Error::NoSession`] when no binding exists.
    fn session_state(&mut self, peer_node_id: u64, key_id: u16) -> Result<SessionState, Error>;

    /// Draw the next outbound message id for a session.
    fn next_message_id(&mut self, peer_node_id: u64, key_id: u16) -> u32;

    /// Record a received message id and classify it.
    fn note_received(&mut self, peer_node_id: u64, key_id: u16, message_id: u32)
        -> DuplicateStatus;

    /// Whether `addr` belongs to the local fabric's address block.
    fn is_fabric_address(&self, addr: IpAddr) -> bool;

    /// Resolve a node id to its currently preferred address.
    fn select_node_address(&self, node_id: u64) -> Option<SocketAddr>;

    /// Whether this node has joined a fabric.
    fn in_fabric(&self) -> bool;
}

/// Extract the node id from a mesh-local IPv6 address.
///
/// Fabric addresses embed the node id in the low 64 bits (the interface
/// identifier).
#[must_use]
pub fn node_id_from_mesh_local(addr: &Ipv6Addr) -> u64 {
    u64::from_be_bytes(addr.octets()[8..16].try_into().expect("fixed slice"))
}

/// Build the mesh-local IPv6 address for a node id under a fabric prefix.
///
/// The prefix supplies the high 64 bits.
#[must_use]
pub fn mesh_local_address(prefix: &Ipv6Addr, node_id: u64) -> Ipv6Addr {
    let mut octets = prefix.octets();
    octets[8..16].copy_from_slice(&node_id.to_be_bytes());
    Ipv6Addr::from(octets)
}

/// Whether `addr` is a mesh-local (site-scoped) multicast destination,
/// which triggers fabric-scoped fan-out.
#[must_use]
pub fn is_mesh_local_multicast(addr: &IpAddr) -> bool {
    match addr {
        IpAddr::V6(v6) => {
            let seg0 = v6.segments()[0];
            (seg0 & 0xFF00) == 0xFF00 && (seg0 & 0x000F) == 0x0005
        }
        IpAddr::V4(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_round_trip() {
        let prefix: Ipv6Addr = "fd42:1234:5678:9abc::".parse().unwrap();
        let node_id = 0x0011_2233_4455_6677;
        let addr = mesh_local_address(&prefix, node_id);
        assert_eq!(node_id_from_mesh_local(&addr), node_id);
        assert_eq!(addr.segments()[..4], prefix.segments()[..4]);
    }

    #[test]
    fn test_mesh_local_multicast_detection() {
        let site: IpAddr = "ff05::1".parse().unwrap();
        assert!(is_mesh_local_multicast(&site));

        let link: IpAddr = "ff02::1".parse().unwrap();
        assert!(!is_mesh_local_multicast(&link));

        let global: IpAddr = "ff0e::1".parse().unwrap();
        assert!(!is_mesh_local_multicast(&global));

        let unicast: IpAddr = "fd00::1".parse().unwrap();
        assert!(!is_mesh_local_multicast(&unicast));

        let v4: IpAddr = "224.0.0.1".parse().unwrap();
        assert!(!is_mesh_local_multicast(&v4));
    }
}
