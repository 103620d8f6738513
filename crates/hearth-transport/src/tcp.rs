//! TCP listen endpoints and length-framed channels.
//!
//! Stream transports carry protocol messages behind a 2-byte little-endian
//! total-length prefix. `TcpChannel` owns the reassembly buffer for inbound
//! frames and a pending-write buffer so sends never block the event loop.

use crate::{EndpointStats, TransportError, TransportResult};
use socket2::{Domain, Protocol, Socket, Type};
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};

/// Length-prefix size for stream framing.
pub const FRAME_LEN_SIZE: usize = 2;

const LISTEN_BACKLOG: i32 = 8;
const READ_CHUNK: usize = 4096;

/// A non-blocking TCP listening socket.
pub struct TcpListenEndpoint {
    listener: TcpListener,
}

impl TcpListenEndpoint {
    /// Create a listener bound to `addr`.
    pub fn bind(addr: SocketAddr) -> TransportResult<Self> {
        let domain = if addr.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };

        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_nonblocking(true)?;
        socket.set_reuse_address(true)?;
        if addr.is_ipv6() {
            socket.set_only_v6(true)?;
        }
        socket.bind(&addr.into())?;
        socket.listen(LISTEN_BACKLOG)?;

        Ok(Self {
            listener: socket.into(),
        })
    }

    /// Accept one pending connection, if any.
    pub fn accept(&self) -> io::Result<Option<(TcpChannel, SocketAddr)>> {
        match self.listener.accept() {
            Ok((stream, peer)) => {
                stream.set_nonblocking(true)?;
                stream.set_nodelay(true)?;
                Ok(Some((TcpChannel::from_stream(stream), peer)))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Local address the listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}

impl std::fmt::Debug for TcpListenEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpListenEndpoint")
            .field("local_addr", &self.listener.local_addr().ok())
            .finish()
    }
}

/// A connected (or connecting) non-blocking TCP stream with message framing.
pub struct TcpChannel {
    stream: TcpStream,
    read_buf: Vec<u8>,
    write_buf: Vec<u8>,
    stats: EndpointStats,
}

impl TcpChannel {
    /// Wrap an already-connected stream (inbound accept path).
    #[must_use]
    pub fn from_stream(stream: TcpStream) -> Self {
        Self {
            stream,
            read_buf: Vec::new(),
            write_buf: Vec::new(),
            stats: EndpointStats::new(),
        }
    }

    /// Start a non-blocking connect to `addr`.
    ///
    /// The returned channel may still be mid-handshake; poll
    /// [`connect_complete`](Self::connect_complete) until it reports true.
    pub fn connect(addr: SocketAddr) -> TransportResult<Self> {
        let domain = if addr.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };

        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_nonblocking(true)?;
        match socket.connect(&addr.into()) {
            Ok(()) => {}
            Err(e) if e.raw_os_error() == Some(115) => {} // EINPROGRESS
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(TransportError::ConnectionFailed(e.to_string())),
        }

        let stream: TcpStream = socket.into();
        stream.set_nodelay(true)?;
        Ok(Self::from_stream(stream))
    }

    /// Whether an in-progress connect has finished.
    ///
    /// Returns `Ok(true)` once the three-way handshake completed, `Ok(false)`
    /// while still pending, and the socket error if the connect failed.
    pub fn connect_complete(&self) -> io::Result<bool> {
        if let Some(err) = self.stream.take_error()? {
            return Err(err);
        }
        match self.stream.peer_addr() {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(false),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Queue one framed message for sending and push as much as the socket
    /// accepts right now.
    pub fn send_framed(&mut self, msg: &[u8]) -> TransportResult<()> {
        if msg.len() > usize::from(u16::MAX) {
            return Err(TransportError::FrameTooLong(msg.len()));
        }

        let len = msg.len() as u16;
        self.write_buf.reserve(FRAME_LEN_SIZE + msg.len());
        self.write_buf.extend_from_slice(&len.to_le_bytes());
        self.write_buf.extend_from_slice(msg);
        self.stats.record_send(FRAME_LEN_SIZE + msg.len());

        self.flush().map_err(TransportError::from)
    }

    /// Drain the pending-write buffer as far as the socket allows.
    pub fn flush(&mut self) -> io::Result<()> {
        while !self.write_buf.is_empty() {
            match self.stream.write(&self.write_buf) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    self.write_buf.drain(..n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    self.stats.record_send_error();
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Read available bytes and return the next complete framed message.
    ///
    /// `Ok(None)` means no complete frame yet. A peer close surfaces as
    /// `UnexpectedEof` once buffered frames are drained.
    pub fn poll_message(&mut self) -> io::Result<Option<Vec<u8>>> {
        let mut eof = false;
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    eof = true;
                    break;
                }
                Ok(n) => self.read_buf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    self.stats.record_recv_error();
                    return Err(e);
                }
            }
        }

        if let Some(msg) = self.take_frame() {
            self.stats.record_recv(FRAME_LEN_SIZE + msg.len());
            return Ok(Some(msg));
        }
        if eof {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        Ok(None)
    }

    fn take_frame(&mut self) -> Option<Vec<u8>> {
        if self.read_buf.len() < FRAME_LEN_SIZE {
            return None;
        }
        let len = usize::from(u16::from_le_bytes([self.read_buf[0], self.read_buf[1]]));
        if self.read_buf.len() < FRAME_LEN_SIZE + len {
            return None;
        }
        let msg = self.read_buf[FRAME_LEN_SIZE..FRAME_LEN_SIZE + len].to_vec();
        self.read_buf.drain(..FRAME_LEN_SIZE + len);
        Some(msg)
    }

    /// Read raw bytes, bypassing framing (tunnel relay path).
    pub fn recv_raw(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }

    /// Write raw bytes, bypassing framing (tunnel relay path).
    ///
    /// Bytes the socket does not accept immediately are queued behind any
    /// pending framed writes.
    pub fn send_raw(&mut self, buf: &[u8]) -> io::Result<()> {
        self.write_buf.extend_from_slice(buf);
        self.flush()
    }

    /// Shut down both directions of the stream.
    pub fn close(&mut self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }

    /// Local address of the stream.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.stream.local_addr()
    }

    /// Peer address of the stream.
    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream.peer_addr()
    }

    /// Traffic counters for this channel.
    #[must_use]
    pub fn stats(&self) -> EndpointStats {
        self.stats
    }
}

impl std::fmt::Debug for TcpChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpChannel")
            .field("peer_addr", &self.stream.peer_addr().ok())
            .field("pending_write", &self.write_buf.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn connected_pair() -> (TcpChannel, TcpChannel) {
        let listener = TcpListenEndpoint::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpChannel::connect(addr).unwrap();

        let mut server = None;
        for _ in 0..100 {
            if let Some((chan, _)) = listener.accept().unwrap() {
                server = Some(chan);
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        (client, server.expect("accept timed out"))
    }

    #[test]
    fn test_listen_and_accept() {
        let listener = TcpListenEndpoint::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        assert!(listener.accept().unwrap().is_none());

        let addr = listener.local_addr().unwrap();
        let client = TcpChannel::connect(addr).unwrap();

        std::thread::sleep(Duration::from_millis(20));
        assert!(listener.accept().unwrap().is_some());
        assert!(client.connect_complete().unwrap());
    }

    #[test]
    fn test_framed_roundtrip() {
        let (mut client, mut server) = connected_pair();

        client.send_framed(b"hello mesh").unwrap();

        let mut got = None;
        for _ in 0..100 {
            if let Some(msg) = server.poll_message().unwrap() {
                got = Some(msg);
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(got.unwrap(), b"hello mesh");
    }

    #[test]
    fn test_framed_multiple_messages() {
        let (mut client, mut server) = connected_pair();

        client.send_framed(b"one").unwrap();
        client.send_framed(b"two").unwrap();
        client.send_framed(&[]).unwrap();

        let mut msgs = Vec::new();
        for _ in 0..200 {
            match server.poll_message() {
                Ok(Some(msg)) => {
                    msgs.push(msg);
                    if msgs.len() == 3 {
                        break;
                    }
                }
                Ok(None) => std::thread::sleep(Duration::from_millis(5)),
                Err(e) => panic!("poll failed: {e}"),
            }
        }
        assert_eq!(msgs, vec![b"one".to_vec(), b"two".to_vec(), Vec::new()]);
    }

    #[test]
    fn test_frame_too_long() {
        let (mut client, _server) = connected_pair();
        let huge = vec![0u8; usize::from(u16::MAX) + 1];
        assert!(matches!(
            client.send_framed(&huge),
            Err(TransportError::FrameTooLong(_))
        ));
    }

    #[test]
    fn test_peer_close_surfaces_eof() {
        let (mut client, mut server) = connected_pair();
        client.close();
        drop(client);

        let mut seen_eof = false;
        for _ in 0..100 {
            match server.poll_message() {
                Ok(Some(_)) => {}
                Ok(None) => std::thread::sleep(Duration::from_millis(5)),
                Err(e) => {
                    assert_eq!(e.kind(), io::ErrorKind::UnexpectedEof);
                    seen_eof = true;
                    break;
                }
            }
        }
        assert!(seen_eof);
    }
}
