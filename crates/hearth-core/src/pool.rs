//! Fixed-capacity connection and tunnel pools.
//!
//! Both pools are fixed arrays scanned linearly for a free slot. A
//! connection slot with refcount 0 is free and is fully reset before
//! reuse; exhaustion is reported to the caller, never queued. Handles are
//! plain indices, valid until the slot's refcount returns to zero.

use crate::error::Error;
use crate::NODE_ID_NOT_SPECIFIED;
use hearth_transport::TcpChannel;
use std::io;
use std::time::{Duration, Instant};

/// Number of connection slots.
pub const CONNECTION_POOL_SIZE: usize = 16;

/// Number of tunnel slots.
pub const TUNNEL_POOL_SIZE: usize = 8;

/// Relay copy buffer; one protocol message always fits.
const RELAY_BUF_SIZE: usize = 4096;

/// Index handle into the connection pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionHandle(pub(crate) usize);

/// Index handle into the tunnel pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TunnelHandle(pub(crate) usize);

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Freshly acquired, no transport attached.
    #[default]
    Ready,
    /// Outbound connect in flight.
    Connecting,
    /// Transport established; messages may flow.
    Connected,
    /// Closed; slot lives on until the last reference is released.
    Closed,
}

/// A short-range radio bearer supplied by the embedding platform.
///
/// Radio-backed connections carry the same framed messages as TCP; the
/// platform owns the link layer underneath.
pub trait ShortRangeChannel {
    /// Send one framed message.
    fn send_framed(&mut self, msg: &[u8]) -> io::Result<()>;

    /// Poll for one complete inbound message.
    fn poll_message(&mut self) -> io::Result<Option<Vec<u8>>>;

    /// Read raw bytes (tunnel relay path).
    fn recv_raw(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write raw bytes (tunnel relay path).
    fn send_raw(&mut self, buf: &[u8]) -> io::Result<()>;

    /// Tear the bearer down.
    fn close(&mut self);

    /// Test-only downcast hook so pool tests can inspect the concrete bearer.
    #[cfg(test)]
    fn as_any(&self) -> &dyn std::any::Any;
}

/// The transport handle behind a connection.
pub enum ConnectionTransport {
    /// A framed TCP channel.
    Tcp(TcpChannel),
    /// A platform radio bearer.
    Radio(Box<dyn ShortRangeChannel>),
}

impl ConnectionTransport {
    fn close(&mut self) {
        match self {
            Self::Tcp(chan) => chan.close(),
            Self::Radio(chan) => chan.close(),
        }
    }

    pub(crate) fn send_framed(&mut self, msg: &[u8]) -> Result<(), Error> {
        match self {
            Self::Tcp(chan) => chan.send_framed(msg).map_err(Error::from),
            Self::Radio(chan) => chan.send_framed(msg).map_err(Error::from),
        }
    }

    pub(crate) fn poll_message(&mut self) -> io::Result<Option<Vec<u8>>> {
        match self {
            Self::Tcp(chan) => chan.poll_message(),
            Self::Radio(chan) => chan.poll_message(),
        }
    }

    pub(crate) fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Tcp(chan) => chan.flush(),
            Self::Radio(_) => Ok(()),
        }
    }

    fn recv_raw(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(chan) => chan.recv_raw(buf),
            Self::Radio(chan) => chan.recv_raw(buf),
        }
    }

    fn send_raw(&mut self, buf: &[u8]) -> io::Result<()> {
        match self {
            Self::Tcp(chan) => chan.send_raw(buf),
            Self::Radio(chan) => chan.send_raw(buf),
        }
    }
}

impl std::fmt::Debug for ConnectionTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tcp(chan) => f.debug_tuple("Tcp").field(chan).finish(),
            Self::Radio(_) => f.write_str("Radio(..)"),
        }
    }
}

/// A stateful bidirectional channel drawn from the pool.
#[derive(Debug, Default)]
pub struct Connection {
    /// Lifecycle state.
    pub state: ConnectionState,
    /// Peer node, once known.
    pub peer_node_id: u64,
    transport: Option<ConnectionTransport>,
}

impl Connection {
    /// Attach an established or connecting transport.
    pub fn attach(&mut self, transport: ConnectionTransport, state: ConnectionState) {
        self.transport = Some(transport);
        self.state = state;
    }

    /// The attached transport, if any.
    pub fn transport_mut(&mut self) -> Option<&mut ConnectionTransport> {
        self.transport.as_mut()
    }

    /// Send an already-encoded message over the connection's framing.
    ///
    /// # Errors
    ///
    /// [`Error::IncorrectState`] unless the connection is `Connected`.
    pub fn send_encoded(&mut self, msg: &[u8]) -> Result<(), Error> {
        if self.state != ConnectionState::Connected {
            return Err(Error::IncorrectState);
        }
        match self.transport.as_mut() {
            Some(t) => t.send_framed(msg),
            None => Err(Error::IncorrectState),
        }
    }

    /// Close the connection without freeing its pool slot.
    pub fn close(&mut self) {
        if let Some(mut t) = self.transport.take() {
            t.close();
        }
        self.state = ConnectionState::Closed;
    }

    fn take_transport(&mut self) -> Option<ConnectionTransport> {
        self.transport.take()
    }

    fn reset(&mut self) {
        self.close();
        self.state = ConnectionState::Ready;
        self.peer_node_id = NODE_ID_NOT_SPECIFIED;
    }
}

#[derive(Debug, Default)]
struct Slot {
    refcount: u8,
    conn: Connection,
}

/// Fixed-capacity pool of reusable connections.
#[derive(Debug)]
pub struct ConnectionPool {
    slots: Vec<Slot>,
}

impl ConnectionPool {
    /// Create a pool with [`CONNECTION_POOL_SIZE`] free slots.
    #[must_use]
    pub fn new() -> Self {
        let mut slots = Vec::with_capacity(CONNECTION_POOL_SIZE);
        slots.resize_with(CONNECTION_POOL_SIZE, Slot::default);
        Self { slots }
    }

    /// Claim a free slot, resetting it for use. `None` when exhausted.
    pub fn acquire(&mut self) -> Option<ConnectionHandle> {
        for (idx, slot) in self.slots.iter_mut().enumerate() {
            if slot.refcount == 0 {
                slot.conn.reset();
                slot.refcount = 1;
                return Some(ConnectionHandle(idx));
            }
        }
        None
    }

    /// Add a reference to a live slot.
    pub fn retain(&mut self, handle: ConnectionHandle) {
        let slot = &mut self.slots[handle.0];
        debug_assert!(slot.refcount > 0);
        slot.refcount = slot.refcount.saturating_add(1);
    }

    /// Drop a reference; at zero the slot is closed, reset, and freed.
    pub fn release(&mut self, handle: ConnectionHandle) {
        let slot = &mut self.slots[handle.0];
        debug_assert!(slot.refcount > 0);
        slot.refcount = slot.refcount.saturating_sub(1);
        if slot.refcount == 0 {
            slot.conn.reset();
        }
    }

    /// Access a live connection.
    #[must_use]
    pub fn get(&self, handle: ConnectionHandle) -> Option<&Connection> {
        let slot = self.slots.get(handle.0)?;
        (slot.refcount > 0).then_some(&slot.conn)
    }

    /// Mutable access to a live connection.
    pub fn get_mut(&mut self, handle: ConnectionHandle) -> Option<&mut Connection> {
        let slot = self.slots.get_mut(handle.0)?;
        (slot.refcount > 0).then_some(&mut slot.conn)
    }

    /// Number of slots currently in use.
    #[must_use]
    pub fn in_use(&self) -> usize {
        self.slots.iter().filter(|s| s.refcount > 0).count()
    }

    /// Close and free every slot (layer shutdown).
    pub fn reset_all(&mut self) {
        for slot in &mut self.slots {
            slot.conn.reset();
            slot.refcount = 0;
        }
    }

    pub(crate) fn handles(&self) -> impl Iterator<Item = ConnectionHandle> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.refcount > 0)
            .map(|(idx, _)| ConnectionHandle(idx))
    }
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new()
    }
}

/// A relay coupling two previously-connected transports.
pub struct ConnectionTunnel {
    in_use: bool,
    sides: [Option<ConnectionTransport>; 2],
    idle_timeout: Option<Duration>,
    last_activity: Instant,
}

impl ConnectionTunnel {
    fn idle() -> Self {
        Self {
            in_use: false,
            sides: [None, None],
            idle_timeout: None,
            last_activity: Instant::now(),
        }
    }

    /// Move pending bytes between the two sides.
    ///
    /// Returns false once the tunnel has died: either side closed, a relay
    /// write failed, or the idle timeout elapsed with no traffic.
    pub fn relay(&mut self) -> bool {
        let mut moved = false;
        let mut buf = [0u8; RELAY_BUF_SIZE];

        for from in 0..2 {
            let to = 1 - from;
            loop {
                let n = {
                    let Some(side) = self.sides[from].as_mut() else {
                        return false;
                    };
                    match side.recv_raw(&mut buf) {
                        Ok(0) => return false,
                        Ok(n) => n,
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                        Err(_) => return false,
                    }
                };
                let Some(side) = self.sides[to].as_mut() else {
                    return false;
                };
                if side.send_raw(&buf[..n]).is_err() {
                    return false;
                }
                moved = true;
            }
        }

        if moved {
            self.last_activity = Instant::now();
        } else if let Some(timeout) = self.idle_timeout {
            if self.last_activity.elapsed() >= timeout {
                tracing::debug!("tunnel idle timeout elapsed");
                return false;
            }
        }
        true
    }

    fn teardown(&mut self) {
        for side in &mut self.sides {
            if let Some(mut t) = side.take() {
                t.close();
            }
        }
        self.in_use = false;
        self.idle_timeout = None;
    }
}

impl std::fmt::Debug for ConnectionTunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionTunnel")
            .field("in_use", &self.in_use)
            .field("idle_timeout", &self.idle_timeout)
            .finish_non_exhaustive()
    }
}

/// Fixed-capacity pool of connection tunnels.
#[derive(Debug)]
pub struct TunnelPool {
    slots: Vec<ConnectionTunnel>,
}

impl TunnelPool {
    /// Create a pool with [`TUNNEL_POOL_SIZE`] free slots.
    #[must_use]
    pub fn new() -> Self {
        let mut slots = Vec::with_capacity(TUNNEL_POOL_SIZE);
        slots.resize_with(TUNNEL_POOL_SIZE, ConnectionTunnel::idle);
        Self { slots }
    }

    /// Claim a free tunnel slot. `None` when exhausted.
    pub fn acquire(&mut self) -> Option<TunnelHandle> {
        for (idx, slot) in self.slots.iter_mut().enumerate() {
            if !slot.in_use {
                slot.in_use = true;
                slot.idle_timeout = None;
                slot.last_activity = Instant::now();
                return Some(TunnelHandle(idx));
            }
        }
        None
    }

    /// Close both sides and free the slot.
    pub fn release(&mut self, handle: TunnelHandle) {
        if let Some(slot) = self.slots.get_mut(handle.0) {
            slot.teardown();
        }
    }

    /// Number of tunnels currently in use.
    #[must_use]
    pub fn in_use(&self) -> usize {
        self.slots.iter().filter(|s| s.in_use).count()
    }

    /// Close and free every tunnel (layer shutdown).
    pub fn reset_all(&mut self) {
        for slot in &mut self.slots {
            slot.teardown();
        }
    }

    pub(crate) fn relay_all(&mut self) {
        for slot in &mut self.slots {
            if slot.in_use && !slot.relay() {
                tracing::debug!("tunnel closed during relay");
                slot.teardown();
            }
        }
    }

    /// Couple two connected connections into a tunnel.
    ///
    /// Both connections must be in the `Connected` state. Once the
    /// transplant begins, both source connections are closed (not freed)
    /// unconditionally, so a half-coupled transport handle can never leak.
    ///
    /// # Errors
    ///
    /// [`Error::IncorrectState`] when either connection is not connected
    /// (both are left untouched), [`Error::PoolExhausted`] when no tunnel
    /// slot is free.
    pub fn create_tunnel(
        &mut self,
        connections: &mut ConnectionPool,
        a: ConnectionHandle,
        b: ConnectionHandle,
        idle_timeout: Option<Duration>,
    ) -> Result<TunnelHandle, Error> {
        if a == b {
            return Err(Error::InvalidArgument);
        }

        let a_ok = connections
            .get(a)
            .is_some_and(|c| c.state == ConnectionState::Connected);
        let b_ok = connections
            .get(b)
            .is_some_and(|c| c.state == ConnectionState::Connected);
        if !a_ok || !b_ok {
            return Err(Error::IncorrectState);
        }

        let handle = self.acquire().ok_or(Error::PoolExhausted)?;

        // Transplant both transport handles, then close the sources no
        // matter what happened in between.
        let ta = connections.get_mut(a).and_then(Connection::take_transport);
        let tb = connections.get_mut(b).and_then(Connection::take_transport);
        if let Some(c) = connections.get_mut(a) {
            c.close();
        }
        if let Some(c) = connections.get_mut(b) {
            c.close();
        }

        match (ta, tb) {
            (Some(ta), Some(tb)) => {
                let slot = &mut self.slots[handle.0];
                slot.sides = [Some(ta), Some(tb)];
                slot.idle_timeout = idle_timeout;
                slot.last_activity = Instant::now();
                tracing::debug!(?idle_timeout, "tunnel established");
                Ok(handle)
            }
            (ta, tb) => {
                // A connected connection without a transport is an
                // invariant breach; drop whatever was transplanted and
                // free the tunnel slot.
                drop(ta);
                drop(tb);
                self.release(handle);
                Err(Error::IncorrectState)
            }
        }
    }
}

impl Default for TunnelPool {
    fn default() -> Self {
        Self::new()
    }
}
