//! # Hearth Transport
//!
//! Socket-level endpoints for the Hearth message layer.
//!
//! This crate provides:
//! - UDP endpoints (unicast, multicast receive, broadcast receive, ephemeral)
//! - TCP listen endpoints and length-framed TCP channels
//! - A registry of local interface addresses used for multicast fan-out
//!
//! Everything here is synchronous and non-blocking: the message layer drives
//! all sockets from a single event-loop thread and treats `WouldBlock` as
//! "nothing to do right now".

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod interfaces;
pub mod tcp;
pub mod udp;

pub use interfaces::{InterfaceAddr, InterfaceRegistry};
pub use tcp::{TcpChannel, TcpListenEndpoint};
pub use udp::{MulticastEgress, UdpEndpoint};

use std::io;

/// Transport layer errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// I/O error from the underlying socket
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Endpoint has been closed
    #[error("endpoint is closed")]
    Closed,

    /// Address binding failed
    #[error("failed to bind to address: {0}")]
    BindFailed(String),

    /// Connection failed
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// A framed message exceeds the 16-bit length prefix
    #[error("framed message too long: {0} bytes")]
    FrameTooLong(usize),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Per-endpoint traffic counters
#[derive(Debug, Clone, Copy, Default)]
pub struct EndpointStats {
    /// Total bytes sent
    pub bytes_sent: u64,
    /// Total bytes received
    pub bytes_received: u64,
    /// Total datagrams/messages sent
    pub packets_sent: u64,
    /// Total datagrams/messages received
    pub packets_received: u64,
    /// Send errors
    pub send_errors: u64,
    /// Receive errors
    pub recv_errors: u64,
}

impl EndpointStats {
    /// Create new empty counters
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successful send
    pub fn record_send(&mut self, bytes: usize) {
        self.bytes_sent += bytes as u64;
        self.packets_sent += 1;
    }

    /// Record a successful receive
    pub fn record_recv(&mut self, bytes: usize) {
        self.bytes_received += bytes as u64;
        self.packets_received += 1;
    }

    /// Record a send error
    pub fn record_send_error(&mut self) {
        self.send_errors += 1;
    }

    /// Record a receive error
    pub fn record_recv_error(&mut self) {
        self.recv_errors += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_stats() {
        let mut stats = EndpointStats::new();
        assert_eq!(stats.bytes_sent, 0);

        stats.record_send(100);
        stats.record_recv(40);
        stats.record_send_error();

        assert_eq!(stats.bytes_sent, 100);
        assert_eq!(stats.packets_sent, 1);
        assert_eq!(stats.bytes_received, 40);
        assert_eq!(stats.packets_received, 1);
        assert_eq!(stats.send_errors, 1);
        assert_eq!(stats.recv_errors, 0);
    }

    #[test]
    fn test_transport_error_display() {
        let err = TransportError::Closed;
        assert_eq!(err.to_string(), "endpoint is closed");

        let err = TransportError::BindFailed("1.2.3.4:1".to_string());
        assert!(err.to_string().contains("failed to bind"));

        let err = TransportError::FrameTooLong(70_000);
        assert!(err.to_string().contains("70000"));
    }

    #[test]
    fn test_transport_error_from_io() {
        let io_err = io::Error::new(io::ErrorKind::BrokenPipe, "pipe");
        let err = TransportError::from(io_err);
        assert!(matches!(err, TransportError::Io(_)));
    }
}
