//! The receive dispatcher.
//!
//! [`MessageLayer::poll`] drains every readable endpoint on the event-loop
//! thread: pending accepts on the TCP listeners, datagrams on the UDP
//! endpoints, framed messages on connected channels, and tunnel relays.
//! Inbound datagrams are decoded, unprotected, checked against the local
//! node id, classified for duplicates, and handed to the registered
//! handler; failures free the buffer and reach the error handler instead.

use super::lifecycle::UdpSlot;
use super::MessageLayer;
use crate::buffer::PayloadBuf;
use crate::error::Error;
use crate::fabric::{node_id_from_mesh_local, DuplicateStatus};
use crate::message::{EncryptionType, MessageFlags, MessageInfo};
use crate::pool::{ConnectionHandle, ConnectionState, ConnectionTransport};
use crate::NODE_ID_ANY;
use hearth_crypto::{counter_block, decrypt_verify, SessionKeys};
use hearth_transport::TcpChannel;
use std::io;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Listener {
    V4,
    V6,
    UnsecuredV6,
}

impl MessageLayer {
    /// Service every endpoint once: accept pending connections, dispatch
    /// readable datagrams and framed messages, progress in-flight
    /// connects, and run tunnel relays.
    ///
    /// Call whenever the platform reports socket readiness; all receive
    /// callbacks fire from inside this method.
    pub fn poll(&mut self) {
        self.poll_accepts();
        self.poll_udp();
        self.poll_connections();
        self.tunnels.relay_all();
    }

    fn poll_accepts(&mut self) {
        for kind in [Listener::V4, Listener::V6, Listener::UnsecuredV6] {
            loop {
                let accepted = {
                    let listener = match kind {
                        Listener::V4 => self.endpoints.tcp_v4.as_ref(),
                        Listener::V6 => self.endpoints.tcp_v6.as_ref(),
                        Listener::UnsecuredV6 => self.endpoints.tcp_unsecured_v6.as_ref(),
                    };
                    let Some(listener) = listener else { break };
                    listener.accept()
                };
                match accepted {
                    Ok(Some((chan, peer))) => {
                        self.admit_connection(chan, peer, kind == Listener::UnsecuredV6);
                    }
                    Ok(None) => break,
                    Err(e) => {
                        let error = Error::from(e);
                        tracing::warn!(?kind, error = %error, "accept failed");
                        if let Some(cb) = &mut self.callbacks.on_accept_error {
                            cb(&error);
                        }
                        break;
                    }
                }
            }
        }
    }

    fn admit_connection(&mut self, mut chan: TcpChannel, peer: SocketAddr, unsecured: bool) {
        let Some(handle) = self.connections.acquire() else {
            tracing::warn!(%peer, "connection pool exhausted; refusing inbound connection");
            chan.close();
            let error = Error::PoolExhausted;
            if let Some(cb) = &mut self.callbacks.on_accept_error {
                cb(&error);
            }
            return;
        };

        if let Some(conn) = self.connections.get_mut(handle) {
            conn.attach(ConnectionTransport::Tcp(chan), ConnectionState::Connected);
        }
        tracing::info!(%peer, unsecured, "inbound connection accepted");

        let cb = if unsecured {
            &mut self.callbacks.on_unsecured_connection_received
        } else {
            &mut self.callbacks.on_connection_received
        };
        match cb {
            Some(cb) => cb(handle),
            None => {
                tracing::debug!("no connection handler registered; releasing");
                self.connections.release(handle);
            }
        }
    }

    fn poll_udp(&mut self) {
        const SLOTS: [UdpSlot; 6] = [
            UdpSlot::V6,
            UdpSlot::V4,
            UdpSlot::EphemeralV6,
            UdpSlot::EphemeralV4,
            UdpSlot::MulticastV6,
            UdpSlot::BroadcastV4,
        ];

        for slot in SLOTS {
            let from_multicast = matches!(slot, UdpSlot::MulticastV6 | UdpSlot::BroadcastV4);
            loop {
                let next = {
                    let Some(ep) = self.endpoints.udp_slot_mut(slot) else {
                        break;
                    };
                    match ep.recv_from() {
                        Ok((n, peer)) => Some((ep.recv_buffer()[..n].to_vec(), peer)),
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => None,
                        Err(e) => {
                            tracing::warn!(?slot, error = %e, "datagram receive failed");
                            None
                        }
                    }
                };
                let Some((data, peer)) = next else { break };
                self.handle_inbound(data, peer, from_multicast);
            }
        }
    }

    fn poll_connections(&mut self) {
        let handles: Vec<ConnectionHandle> = self.connections.handles().collect();
        for handle in handles {
            self.progress_connect(handle);
            self.drain_connection(handle);
        }
    }

    fn progress_connect(&mut self, handle: ConnectionHandle) {
        let Some(conn) = self.connections.get_mut(handle) else {
            return;
        };
        if conn.state != ConnectionState::Connecting {
            return;
        }
        if let Some(ConnectionTransport::Tcp(chan)) = conn.transport_mut() {
            match chan.connect_complete() {
                Ok(true) => {
                    conn.state = ConnectionState::Connected;
                    tracing::info!("outbound connection established");
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "outbound connect failed");
                    conn.close();
                }
            }
        }
    }

    fn drain_connection(&mut self, handle: ConnectionHandle) {
        loop {
            let next = {
                let Some(conn) = self.connections.get_mut(handle) else {
                    break;
                };
                if conn.state != ConnectionState::Connected {
                    break;
                }
                let peer = match conn.transport_mut() {
                    Some(ConnectionTransport::Tcp(chan)) => chan.peer_addr().ok(),
                    _ => None,
                };
                let Some(transport) = conn.transport_mut() else {
                    break;
                };
                let _ = transport.flush();
                match transport.poll_message() {
                    Ok(Some(msg)) => Some((msg, peer)),
                    Ok(None) => None,
                    Err(e) => {
                        if e.kind() == io::ErrorKind::UnexpectedEof {
                            tracing::info!("peer closed connection");
                        } else {
                            tracing::warn!(error = %e, "connection receive failed");
                        }
                        conn.close();
                        None
                    }
                }
            };
            let Some((msg, peer)) = next else { break };
            let peer =
                peer.unwrap_or_else(|| SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0));
            self.handle_inbound(msg, peer, false);
        }
    }

    /// Decode, unprotect, and dispatch one inbound message.
    pub(crate) fn handle_inbound(&mut self, data: Vec<u8>, peer: SocketAddr, from_multicast: bool) {
        #[cfg(feature = "fault-injection")]
        if self.drop_inbound {
            tracing::debug!(%peer, "fault injection: inbound message dropped");
            return;
        }

        let mut partial = None;
        match self.process_inbound(data, peer, &mut partial) {
            Ok((info, payload)) => {
                tracing::trace!(
                    %peer,
                    message_id = info.message_id,
                    len = payload.len(),
                    "message received"
                );
                let cb = if info.flags.has(MessageFlags::TUNNELED_DATA) {
                    &mut self.callbacks.on_tunneled_message
                } else {
                    &mut self.callbacks.on_message_received
                };
                match cb {
                    Some(cb) => cb(info, payload),
                    None => tracing::debug!("no message handler registered; dropping payload"),
                }
            }
            Err(error) => {
                tracing::warn!(%peer, error = %error, "inbound message rejected");
                if !from_multicast && error.is_key_error() {
                    if let (Some(cb), Some(info)) =
                        (&mut self.callbacks.on_key_error_request, partial.as_ref())
                    {
                        cb(info, peer, &error);
                    }
                }
                if let Some(cb) = &mut self.callbacks.on_receive_error {
                    cb(&error, peer);
                }
            }
        }
    }

    fn process_inbound(
        &mut self,
        data: Vec<u8>,
        peer: SocketAddr,
        partial: &mut Option<MessageInfo>,
    ) -> Result<(MessageInfo, PayloadBuf), Error> {
        let (mut info, payload_off) = MessageInfo::decode(&data)?;
        *partial = Some(info);

        // A header without a source id still identifies the sender when
        // the peer speaks from its mesh-local address.
        if !info.flags.has(MessageFlags::HAS_SOURCE_NODE_ID) {
            if let IpAddr::V6(v6) = peer.ip() {
                if self.directory.is_fabric_address(peer.ip()) {
                    info.source_node_id = node_id_from_mesh_local(&v6);
                }
            }
        }

        let local = self.config.local_node_id;
        if info.flags.has(MessageFlags::HAS_DEST_NODE_ID) {
            if info.dest_node_id != local && info.dest_node_id != NODE_ID_ANY {
                return Err(Error::InvalidDestinationNode);
            }
        } else if info.encryption_type != EncryptionType::None {
            // Encrypted and unaddressed means "the node this key targets".
            info.dest_node_id = local;
        }

        let mut buf = PayloadBuf::from_vec(data);
        match info.encryption_type {
            EncryptionType::None => buf.advance(payload_off),
            EncryptionType::Aes128CtrHmacSha1 => {
                let session = self
                    .directory
                    .session_state(info.source_node_id, info.key_id)?;
                let SessionKeys::Aes128CtrHmacSha1(keys) = session.keys else {
                    return Err(Error::NoSession);
                };
                info.peer_auth_mode = session.auth_mode;

                let (aad, aad_len) = info.integrity_aad();
                let counter = counter_block(info.source_node_id, info.message_id);
                let region = &mut buf.as_mut_slice()[payload_off..];
                let payload_len = decrypt_verify(&keys, &counter, &aad[..aad_len], region)?;
                buf.advance(payload_off);
                buf.truncate(payload_len);
            }
        }

        let status =
            self.directory
                .note_received(info.source_node_id, info.key_id, info.message_id);
        if status == DuplicateStatus::Duplicate {
            tracing::debug!(message_id = info.message_id, "duplicate message tagged");
            info.flags.set(MessageFlags::DUPLICATE);
        }

        *partial = Some(info);
        Ok((info, buf))
    }
}
