//! UDP endpoints.
//!
//! One `UdpEndpoint` wraps one bound datagram socket: well-known-port
//! listen/send, ephemeral-port send, multicast receive, or broadcast
//! receive. Sockets are built with `socket2` for the options the message
//! layer needs (reuse, buffer sizing, multicast egress selection) and then
//! driven through `std::net::UdpSocket` in non-blocking mode.

use crate::{EndpointStats, TransportResult};
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};

/// Socket buffer size requested for each endpoint.
///
/// Home-mesh traffic is small-datagram; 256 KiB absorbs bursts from a full
/// fan-out without asking the kernel for server-class buffers.
const SOCKET_BUFFER_SIZE: usize = 256 * 1024;

/// Receive buffer large enough for any protocol message plus headroom.
const RECV_BUF_SIZE: usize = 8192;

/// Egress selection for one multicast send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MulticastEgress {
    /// Route through the interface owning this IPv4 address.
    V4(Ipv4Addr),
    /// Route through the interface with this index.
    V6(u32),
}

/// A bound UDP socket endpoint.
pub struct UdpEndpoint {
    socket: UdpSocket,
    recv_buf: Vec<u8>,
    stats: EndpointStats,
}

impl UdpEndpoint {
    /// Create an endpoint bound to `addr`.
    ///
    /// Port 0 selects an ephemeral port. The socket is non-blocking and has
    /// enlarged send/receive buffers.
    pub fn bind(addr: SocketAddr) -> TransportResult<Self> {
        Self::bind_with(addr, false)
    }

    /// Create a multicast-receive endpoint bound to `addr`, joining `group`.
    ///
    /// `interface` restricts the join to one interface: an index for IPv6,
    /// ignored for IPv4 (the bound address selects the interface there).
    pub fn bind_multicast(
        addr: SocketAddr,
        group: Ipv6Addr,
        interface: Option<u32>,
    ) -> TransportResult<Self> {
        let ep = Self::bind_with(addr, true)?;
        ep.socket.join_multicast_v6(&group, interface.unwrap_or(0))?;
        tracing::info!(%group, ?interface, "joined multicast group");
        Ok(ep)
    }

    /// Create a broadcast-receive endpoint bound to `addr`.
    pub fn bind_broadcast(addr: SocketAddr) -> TransportResult<Self> {
        Self::bind_with(addr, true)
    }

    fn bind_with(addr: SocketAddr, reuse: bool) -> TransportResult<Self> {
        let domain = if addr.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };

        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_nonblocking(true)?;
        if addr.is_ipv6() {
            socket.set_only_v6(true)?;
        }
        if reuse {
            socket.set_reuse_address(true)?;
        }
        // IPv4 endpoints may be asked to fan out to the broadcast address.
        if addr.is_ipv4() {
            socket.set_broadcast(true)?;
        }

        socket.set_recv_buffer_size(SOCKET_BUFFER_SIZE)?;
        socket.set_send_buffer_size(SOCKET_BUFFER_SIZE)?;

        socket.bind(&addr.into())?;

        Ok(Self {
            socket: socket.into(),
            recv_buf: vec![0u8; RECV_BUF_SIZE],
            stats: EndpointStats::new(),
        })
    }

    /// Receive one datagram.
    ///
    /// Returns the byte count and sender address; `WouldBlock` when nothing
    /// is pending. Data is in [`recv_buffer`](Self::recv_buffer).
    pub fn recv_from(&mut self) -> io::Result<(usize, SocketAddr)> {
        match self.socket.recv_from(&mut self.recv_buf) {
            Ok((n, from)) => {
                self.stats.record_recv(n);
                Ok((n, from))
            }
            Err(e) => {
                if e.kind() != io::ErrorKind::WouldBlock {
                    self.stats.record_recv_error();
                }
                Err(e)
            }
        }
    }

    /// Send one datagram to `addr`.
    pub fn send_to(&mut self, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
        match self.socket.send_to(buf, addr) {
            Ok(n) => {
                self.stats.record_send(n);
                Ok(n)
            }
            Err(e) => {
                self.stats.record_send_error();
                Err(e)
            }
        }
    }

    /// Send one multicast datagram through a specific egress interface.
    ///
    /// Pins the kernel's outgoing-interface (and thereby source-address)
    /// selection before the send, so each copy of a fan-out leaves with the
    /// intended source.
    pub fn send_multicast(
        &mut self,
        buf: &[u8],
        addr: SocketAddr,
        egress: MulticastEgress,
    ) -> io::Result<usize> {
        let sock = SockRef::from(&self.socket);
        match egress {
            MulticastEgress::V4(local) => sock.set_multicast_if_v4(&local)?,
            MulticastEgress::V6(index) => sock.set_multicast_if_v6(index)?,
        }
        self.send_to(buf, addr)
    }

    /// Multicast hop limit for outgoing IPv6 packets.
    pub fn set_multicast_hops_v6(&self, hops: u32) -> io::Result<()> {
        SockRef::from(&self.socket).set_multicast_hops_v6(hops)
    }

    /// The receive buffer shared across `recv_from` calls.
    #[must_use]
    pub fn recv_buffer(&self) -> &[u8] {
        &self.recv_buf
    }

    /// Local address the socket is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Traffic counters for this endpoint.
    #[must_use]
    pub fn stats(&self) -> EndpointStats {
        self.stats
    }
}

impl std::fmt::Debug for UdpEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpEndpoint")
            .field("local_addr", &self.socket.local_addr().ok())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_bind_ephemeral() {
        let ep = UdpEndpoint::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = ep.local_addr().unwrap();
        assert!(addr.is_ipv4());
        assert_ne!(addr.port(), 0);
    }

    #[test]
    fn test_bind_ipv6() {
        let ep = UdpEndpoint::bind("[::1]:0".parse().unwrap()).unwrap();
        assert!(ep.local_addr().unwrap().is_ipv6());
    }

    #[test]
    fn test_send_recv() {
        let mut server = UdpEndpoint::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let server_addr = server.local_addr().unwrap();
        let mut client = UdpEndpoint::bind("127.0.0.1:0".parse().unwrap()).unwrap();

        let sent = client.send_to(b"hearth", server_addr).unwrap();
        assert_eq!(sent, 6);

        std::thread::sleep(Duration::from_millis(10));

        let (n, from) = server.recv_from().unwrap();
        assert_eq!(n, 6);
        assert_eq!(&server.recv_buffer()[..n], b"hearth");
        assert_eq!(from, client.local_addr().unwrap());

        assert_eq!(client.stats().packets_sent, 1);
        assert_eq!(server.stats().packets_received, 1);
    }

    #[test]
    fn test_nonblocking_recv() {
        let mut ep = UdpEndpoint::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let err = ep.recv_from().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
        // WouldBlock is not an error worth counting
        assert_eq!(ep.stats().recv_errors, 0);
    }

    #[test]
    fn test_broadcast_bind() {
        let ep = UdpEndpoint::bind_broadcast("0.0.0.0:0".parse().unwrap()).unwrap();
        assert!(ep.local_addr().unwrap().is_ipv4());
    }

    #[test]
    fn test_multicast_bind_loopback() {
        // Joining on loopback (index of lo is 1 on Linux); group join may be
        // refused on constrained CI kernels, so only assert the bind path.
        let res = UdpEndpoint::bind_multicast(
            "[::]:0".parse().unwrap(),
            "ff05::1".parse().unwrap(),
            Some(1),
        );
        if let Ok(ep) = res {
            assert!(ep.local_addr().unwrap().is_ipv6());
        }
    }

    #[test]
    fn test_large_datagram() {
        let mut server = UdpEndpoint::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let server_addr = server.local_addr().unwrap();
        let mut client = UdpEndpoint::bind("127.0.0.1:0".parse().unwrap()).unwrap();

        let data = vec![0xA5u8; 4096];
        client.send_to(&data, server_addr).unwrap();
        std::thread::sleep(Duration::from_millis(10));

        let (n, _) = server.recv_from().unwrap();
        assert_eq!(n, 4096);
        assert_eq!(&server.recv_buffer()[..n], &data[..]);
    }
}
