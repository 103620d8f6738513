//! # Hearth Core
//!
//! The Hearth message layer: the secure message-transport core of a
//! home-mesh device protocol stack.
//!
//! This crate provides:
//! - Versioned binary message framing with conditional header fields
//! - In-place message protection (AES-128-CTR + HMAC-SHA1, via
//!   `hearth-crypto`)
//! - Transport selection across unicast UDP, multicast fan-out variants,
//!   and connection-oriented bearers
//! - Listening-endpoint lifecycle management driven by configuration flags
//! - Fixed-capacity connection and tunnel pools
//! - The inbound receive dispatcher with duplicate classification
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       MessageLayer                           │
//! │  (endpoint slots, pools, callbacks, fabric directory hookup) │
//! ├──────────────────────────────────────────────────────────────┤
//! │          MessageInfo codec  +  protection engine             │
//! │     (header encode/decode, in-place encrypt/authenticate)    │
//! ├──────────────────────────────────────────────────────────────┤
//! │                    hearth-transport                          │
//! │        (UDP/TCP sockets, interface-address registry)         │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Everything runs on one event-loop thread: the embedder calls
//! [`MessageLayer::poll`] when sockets are readable and the send entry
//! points complete synchronously.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod buffer;
pub mod config;
pub mod error;
pub mod fabric;
pub mod layer;
pub mod message;
pub mod pool;

pub use buffer::PayloadBuf;
pub use config::Config;
pub use error::{Error, SendError};
pub use fabric::{DuplicateStatus, FabricDirectory, PeerAuthMode, SessionState};
pub use layer::MessageLayer;
pub use message::{EncryptionType, MessageFlags, MessageInfo, MessageVersion};
pub use pool::{
    Connection, ConnectionHandle, ConnectionPool, ConnectionState, ConnectionTransport,
    ConnectionTunnel, ShortRangeChannel, TunnelHandle, TunnelPool,
};

use std::net::Ipv6Addr;

/// Well-known protocol port.
pub const WELL_KNOWN_PORT: u16 = 9776;

/// Well-known port for the unsecured TCP listen feature.
pub const UNSECURED_PORT: u16 = 9777;

/// Fixed header prefix: packed header field plus message id.
pub const MSG_HEADER_MIN_SIZE: usize = 6;

/// Largest possible header: fixed prefix, source id, dest id, key id.
pub const MSG_HEADER_MAX_SIZE: usize = MSG_HEADER_MIN_SIZE + 8 + 8 + 2;

/// Maximum encoded message size accepted by the protocol.
pub const MAX_MESSAGE_SIZE: usize = 4096;

/// Maximum datagram size sent over UDP (Ethernet MTU minus IPv6+UDP headers).
pub const UDP_MAX_PAYLOAD: usize = 1452;

/// Wildcard node id: "any node may consume this message".
pub const NODE_ID_ANY: u64 = u64::MAX;

/// Sentinel for a node id that is not (yet) known.
pub const NODE_ID_NOT_SPECIFIED: u64 = 0;

/// Mesh-local all-nodes multicast group joined by multicast-receive
/// endpoints.
pub const ALL_NODES_MULTICAST_V6: Ipv6Addr = Ipv6Addr::new(0xff05, 0, 0, 0, 0, 0, 0, 1);
