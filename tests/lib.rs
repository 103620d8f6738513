//! Shared helpers for the Hearth integration tests.

use hearth_core::fabric::{DuplicateStatus, FabricDirectory, PeerAuthMode, SessionState};
use hearth_core::{Config, Error, MessageLayer};
use hearth_crypto::{Aes128CtrHmacSha1Keys, SessionKeys};
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

/// Key id every test session uses.
pub const TEST_KEY_ID: u16 = 4;

/// Fabric prefix used by the test directory.
pub const TEST_FABRIC_PREFIX: u16 = 0xfd42;

/// A fabric directory where every node shares one session key, with real
/// duplicate tracking and sequential message ids.
pub struct SharedKeyDirectory {
    seen: HashSet<(u64, u16, u32)>,
    next_id: u32,
    peers: Vec<(u64, SocketAddr)>,
}

impl SharedKeyDirectory {
    /// Create a directory with no known peers.
    #[must_use]
    pub fn new() -> Self {
        Self {
            seen: HashSet::new(),
            next_id: 1000,
            peers: Vec::new(),
        }
    }

    /// Register a peer's address for node-id resolution.
    pub fn add_peer(&mut self, node_id: u64, addr: SocketAddr) {
        self.peers.push((node_id, addr));
    }

    /// The session key material all test nodes share.
    #[must_use]
    pub fn keys() -> Aes128CtrHmacSha1Keys {
        Aes128CtrHmacSha1Keys::new(*b"test-session-key", *b"test-integrity-key!!")
    }
}

impl Default for SharedKeyDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl FabricDirectory for SharedKeyDirectory {
    fn session_state(&mut self, _peer: u64, key_id: u16) -> Result<SessionState, Error> {
        if key_id != TEST_KEY_ID {
            return Err(Error::NoSession);
        }
        Ok(SessionState {
            keys: SessionKeys::Aes128CtrHmacSha1(Self::keys()),
            auth_mode: PeerAuthMode::SessionKey,
            message_id_synchronized: true,
        })
    }

    fn next_message_id(&mut self, _peer: u64, _key_id: u16) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn note_received(&mut self, peer: u64, key_id: u16, message_id: u32) -> DuplicateStatus {
        if self.seen.insert((peer, key_id, message_id)) {
            DuplicateStatus::New
        } else {
            DuplicateStatus::Duplicate
        }
    }

    fn is_fabric_address(&self, addr: IpAddr) -> bool {
        matches!(addr, IpAddr::V6(v6) if v6.segments()[0] == TEST_FABRIC_PREFIX)
    }

    fn select_node_address(&self, node_id: u64) -> Option<SocketAddr> {
        self.peers
            .iter()
            .find(|(id, _)| *id == node_id)
            .map(|(_, addr)| *addr)
    }

    fn in_fabric(&self) -> bool {
        true
    }
}

/// Build a layer listening on loopback-reachable wildcard sockets with
/// auto-selected ports.
#[must_use]
pub fn test_layer(node_id: u64) -> MessageLayer {
    let mut layer = MessageLayer::new(
        Config {
            port: 0,
            listen_ipv6: false,
            local_node_id: node_id,
            ..Config::default()
        },
        Box::new(SharedKeyDirectory::new()),
    );
    layer.refresh_endpoints().expect("endpoints bind");
    layer
}

/// The loopback address of a layer's IPv4 UDP endpoint.
#[must_use]
pub fn udp_addr(layer: &MessageLayer) -> SocketAddr {
    let port = layer.udp_local_addr(true).expect("udp endpoint").port();
    SocketAddr::new("127.0.0.1".parse().unwrap(), port)
}

/// The loopback address of a layer's IPv4 TCP listener.
#[must_use]
pub fn tcp_addr(layer: &MessageLayer) -> SocketAddr {
    let port = layer.tcp_local_addr(true).expect("tcp endpoint").port();
    SocketAddr::new("127.0.0.1".parse().unwrap(), port)
}

/// Poll a layer a few times with short pauses, letting localhost traffic
/// land.
pub fn settle(layer: &mut MessageLayer) {
    for _ in 0..5 {
        std::thread::sleep(Duration::from_millis(10));
        layer.poll();
    }
}
