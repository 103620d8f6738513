//! The message layer instance.
//!
//! One `MessageLayer` owns the endpoint table, the connection and tunnel
//! pools, the callback registrations, and the fabric-directory hookup. It
//! is constructed once per process (or per test) and torn down with
//! [`MessageLayer::shutdown`]; all entry points run on the single
//! event-loop thread.

mod lifecycle;
mod recv;
mod send;

use crate::buffer::PayloadBuf;
use crate::config::Config;
use crate::error::Error;
use crate::fabric::FabricDirectory;
use crate::message::MessageInfo;
use crate::pool::{ConnectionHandle, ConnectionPool, TunnelHandle, TunnelPool};
use hearth_transport::InterfaceRegistry;
use lifecycle::EndpointSlots;
use std::net::SocketAddr;
use std::time::Duration;

/// Handler for a received payload or tunneled-data message.
pub type MessageHandler = Box<dyn FnMut(MessageInfo, PayloadBuf)>;
/// Handler for inbound decode/verify failures.
pub type ReceiveErrorHandler = Box<dyn FnMut(&Error, SocketAddr)>;
/// Handler for a newly accepted connection.
pub type ConnectionHandler = Box<dyn FnMut(ConnectionHandle)>;
/// Handler for listener accept failures.
pub type AcceptErrorHandler = Box<dyn FnMut(&Error)>;
/// Request to send a peer-facing key-error notification.
pub type KeyErrorHandler = Box<dyn FnMut(&MessageInfo, SocketAddr, &Error)>;

/// One settable/clearable slot per event type.
#[derive(Default)]
pub(crate) struct Callbacks {
    pub on_message_received: Option<MessageHandler>,
    pub on_tunneled_message: Option<MessageHandler>,
    pub on_receive_error: Option<ReceiveErrorHandler>,
    pub on_connection_received: Option<ConnectionHandler>,
    pub on_unsecured_connection_received: Option<ConnectionHandler>,
    pub on_accept_error: Option<AcceptErrorHandler>,
    pub on_key_error_request: Option<KeyErrorHandler>,
}

/// The message layer: encode/decode, transport selection, endpoint
/// lifecycle, and the receive dispatcher.
pub struct MessageLayer {
    pub(crate) config: Config,
    pub(crate) directory: Box<dyn FabricDirectory>,
    pub(crate) interfaces: InterfaceRegistry,
    pub(crate) endpoints: EndpointSlots,
    pub(crate) connections: ConnectionPool,
    pub(crate) tunnels: TunnelPool,
    pub(crate) callbacks: Callbacks,
    pub(crate) next_unencrypted_id: u32,
    pub(crate) udp_refresh_pending: bool,
    #[cfg(feature = "fault-injection")]
    pub(crate) drop_outbound: bool,
    #[cfg(feature = "fault-injection")]
    pub(crate) drop_inbound: bool,
}

impl MessageLayer {
    /// Create a layer with no endpoints open.
    ///
    /// Call [`refresh_endpoints`](Self::refresh_endpoints) afterwards to
    /// bring up the listeners the configuration asks for.
    #[must_use]
    pub fn new(config: Config, directory: Box<dyn FabricDirectory>) -> Self {
        // Unencrypted message ids start at a random point so restarts do
        // not replay the same id sequence to peers.
        let mut seed = [0u8; 4];
        getrandom::getrandom(&mut seed).expect("CSPRNG failure");

        Self {
            config,
            directory,
            interfaces: InterfaceRegistry::new(),
            endpoints: EndpointSlots::default(),
            connections: ConnectionPool::new(),
            tunnels: TunnelPool::new(),
            callbacks: Callbacks::default(),
            next_unencrypted_id: u32::from_le_bytes(seed),
            udp_refresh_pending: false,
            #[cfg(feature = "fault-injection")]
            drop_outbound: false,
            #[cfg(feature = "fault-injection")]
            drop_inbound: false,
        }
    }

    /// Current configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Mutable configuration; call
    /// [`refresh_endpoints`](Self::refresh_endpoints) after changing
    /// listen-related fields.
    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    /// The interface-address registry.
    #[must_use]
    pub fn interfaces(&self) -> &InterfaceRegistry {
        &self.interfaces
    }

    /// Mutable registry access for platform interface-change events.
    pub fn interfaces_mut(&mut self) -> &mut InterfaceRegistry {
        &mut self.interfaces
    }

    /// The connection pool.
    #[must_use]
    pub fn connections(&self) -> &ConnectionPool {
        &self.connections
    }

    /// Mutable connection pool access.
    pub fn connections_mut(&mut self) -> &mut ConnectionPool {
        &mut self.connections
    }

    /// The tunnel pool.
    #[must_use]
    pub fn tunnels(&self) -> &TunnelPool {
        &self.tunnels
    }

    /// Draw a fresh connection from the pool. `None` when exhausted.
    pub fn new_connection(&mut self) -> Option<ConnectionHandle> {
        self.connections.acquire()
    }

    /// Start an outbound TCP connection to `addr` on a fresh pool slot.
    ///
    /// The connect completes asynchronously: [`poll`](Self::poll) moves
    /// the connection to `Connected` once the handshake finishes.
    ///
    /// # Errors
    ///
    /// [`Error::PoolExhausted`] with no free slot; transport errors when
    /// the connect cannot even start.
    pub fn connect(
        &mut self,
        addr: SocketAddr,
        peer_node_id: u64,
    ) -> Result<ConnectionHandle, Error> {
        use crate::pool::{ConnectionState, ConnectionTransport};
        use hearth_transport::TcpChannel;

        let handle = self.connections.acquire().ok_or(Error::PoolExhausted)?;
        let chan = match TcpChannel::connect(addr) {
            Ok(chan) => chan,
            Err(e) => {
                self.connections.release(handle);
                return Err(e.into());
            }
        };
        if let Some(conn) = self.connections.get_mut(handle) {
            conn.attach(ConnectionTransport::Tcp(chan), ConnectionState::Connecting);
            conn.peer_node_id = peer_node_id;
        }
        tracing::info!(%addr, "outbound connection started");
        Ok(handle)
    }

    /// Couple two connected connections into a tunnel; see
    /// [`TunnelPool::create_tunnel`].
    ///
    /// # Errors
    ///
    /// Propagates the pool's `IncorrectState`/`PoolExhausted` results.
    pub fn create_tunnel(
        &mut self,
        a: ConnectionHandle,
        b: ConnectionHandle,
        idle_timeout: Option<Duration>,
    ) -> Result<TunnelHandle, Error> {
        self.tunnels
            .create_tunnel(&mut self.connections, a, b, idle_timeout)
    }

    /// Flag the next [`refresh_endpoints`](Self::refresh_endpoints) to
    /// recycle all UDP endpoints unconditionally.
    ///
    /// Set whenever the platform reports existing UDP sockets unusable;
    /// broken-pipe send failures set it automatically.
    pub fn request_udp_refresh(&mut self) {
        self.udp_refresh_pending = true;
    }

    /// Register or clear the payload-message handler.
    pub fn set_on_message_received(&mut self, handler: Option<MessageHandler>) {
        self.callbacks.on_message_received = handler;
    }

    /// Register or clear the tunneled-data handler.
    pub fn set_on_tunneled_message(&mut self, handler: Option<MessageHandler>) {
        self.callbacks.on_tunneled_message = handler;
    }

    /// Register or clear the receive-error handler.
    pub fn set_on_receive_error(&mut self, handler: Option<ReceiveErrorHandler>) {
        self.callbacks.on_receive_error = handler;
    }

    /// Register or clear the inbound-connection handler.
    pub fn set_on_connection_received(&mut self, handler: Option<ConnectionHandler>) {
        self.callbacks.on_connection_received = handler;
    }

    /// Register or clear the unsecured inbound-connection handler.
    pub fn set_on_unsecured_connection_received(&mut self, handler: Option<ConnectionHandler>) {
        self.callbacks.on_unsecured_connection_received = handler;
    }

    /// Register or clear the accept-error handler.
    pub fn set_on_accept_error(&mut self, handler: Option<AcceptErrorHandler>) {
        self.callbacks.on_accept_error = handler;
    }

    /// Register or clear the key-error-request hook. The security
    /// collaborator sends the actual peer-facing notification.
    pub fn set_on_key_error_request(&mut self, handler: Option<KeyErrorHandler>) {
        self.callbacks.on_key_error_request = handler;
    }

    /// Discard outbound messages while reporting success.
    #[cfg(feature = "fault-injection")]
    pub fn set_drop_outbound(&mut self, drop: bool) {
        self.drop_outbound = drop;
    }

    /// Discard inbound messages before dispatch.
    #[cfg(feature = "fault-injection")]
    pub fn set_drop_inbound(&mut self, drop: bool) {
        self.drop_inbound = drop;
    }
}

impl std::fmt::Debug for MessageLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageLayer")
            .field("config", &self.config)
            .field("connections_in_use", &self.connections.in_use())
            .field("tunnels_in_use", &self.tunnels.in_use())
            .field("udp_refresh_pending", &self.udp_refresh_pending)
            .finish_non_exhaustive()
    }
}
