//! Transport selection and the outbound send path.
//!
//! A send resolves the destination, encodes and protects the buffer in
//! place, then classifies the transmission: unicast, single-interface
//! multicast, fabric-scoped multicast, or all-interfaces multicast.
//! Multicast fan-out issues one copy per selected egress and suppresses
//! per-interface routing failures; unicast failures always propagate.

use super::MessageLayer;
use crate::buffer::PayloadBuf;
use crate::error::{Error, SendError};
use crate::fabric::is_mesh_local_multicast;
use crate::message::{EncryptionType, MessageFlags, MessageInfo};
use crate::pool::ConnectionHandle;
use crate::{NODE_ID_ANY, NODE_ID_NOT_SPECIFIED, UDP_MAX_PAYLOAD};
use hearth_crypto::{counter_block, encrypt_authenticate, SessionKeys};
use std::io;
use std::net::{IpAddr, SocketAddr};

/// Platform errors meaning "this interface cannot route there": expected
/// during multi-interface fan-out, fatal for unicast. Egress-selection
/// failures for a vanished interface (ENODEV/EINVAL from the multicast-if
/// option) fall in the same bucket.
fn is_routing_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::NetworkUnreachable
            | io::ErrorKind::HostUnreachable
            | io::ErrorKind::AddrNotAvailable
            | io::ErrorKind::InvalidInput
    ) || matches!(e.raw_os_error(), Some(19 | 22 | 99 | 101 | 113))
    // ENODEV, EINVAL, EADDRNOTAVAIL, ENETUNREACH, EHOSTUNREACH
}

impl MessageLayer {
    /// Send a message towards `dest`, or towards the address the fabric
    /// directory selects for `info.dest_node_id` when `dest` is `None`.
    ///
    /// On success the buffer is consumed unless the retain-buffer or
    /// delay-send flag asks for it back. On failure the buffer is dropped,
    /// except that retain-buffer returns it inside the [`SendError`].
    ///
    /// # Errors
    ///
    /// See [`Error`]; notably `InvalidAddress` for an unresolvable
    /// destination and `NoEndpoint` when no matching transport is ready.
    pub fn send_message(
        &mut self,
        dest: Option<SocketAddr>,
        send_interface: Option<u32>,
        info: &mut MessageInfo,
        mut buf: PayloadBuf,
    ) -> Result<Option<PayloadBuf>, SendError> {
        match self.send_inner(dest, send_interface, info, &mut buf) {
            Ok(()) => {
                let keep = info.flags.has(MessageFlags::RETAIN_BUFFER)
                    || info.flags.has(MessageFlags::DELAY_SEND);
                Ok(keep.then_some(buf))
            }
            Err(error) => Err(SendError {
                buffer: info.flags.has(MessageFlags::RETAIN_BUFFER).then_some(buf),
                error,
            }),
        }
    }

    /// Send a message over a pooled connection (TCP or radio bearer),
    /// using the stream framing.
    ///
    /// # Errors
    ///
    /// `IncorrectState` when the connection is not connected.
    pub fn send_message_over_connection(
        &mut self,
        handle: ConnectionHandle,
        info: &mut MessageInfo,
        mut buf: PayloadBuf,
    ) -> Result<Option<PayloadBuf>, SendError> {
        match self.send_connection_inner(handle, info, &mut buf) {
            Ok(()) => {
                let keep = info.flags.has(MessageFlags::RETAIN_BUFFER)
                    || info.flags.has(MessageFlags::DELAY_SEND);
                Ok(keep.then_some(buf))
            }
            Err(error) => Err(SendError {
                buffer: info.flags.has(MessageFlags::RETAIN_BUFFER).then_some(buf),
                error,
            }),
        }
    }

    fn send_inner(
        &mut self,
        dest: Option<SocketAddr>,
        send_interface: Option<u32>,
        info: &mut MessageInfo,
        buf: &mut PayloadBuf,
    ) -> Result<(), Error> {
        let dest = match dest {
            Some(addr) => addr,
            None => {
                if info.dest_node_id == NODE_ID_NOT_SPECIFIED
                    || info.dest_node_id == NODE_ID_ANY
                {
                    return Err(Error::InvalidAddress);
                }
                self.directory
                    .select_node_address(info.dest_node_id)
                    .ok_or(Error::InvalidAddress)?
            }
        };

        self.prepare_message(info, buf)?;

        if info.flags.has(MessageFlags::DELAY_SEND) {
            return Ok(());
        }

        #[cfg(feature = "fault-injection")]
        if self.drop_outbound {
            tracing::debug!(%dest, "fault injection: outbound message dropped");
            return Ok(());
        }

        if buf.len() > UDP_MAX_PAYLOAD {
            return Err(Error::MessageTooLong {
                len: buf.len(),
                max: UDP_MAX_PAYLOAD,
            });
        }

        self.transmit(dest, send_interface, info, buf)
    }

    fn send_connection_inner(
        &mut self,
        handle: ConnectionHandle,
        info: &mut MessageInfo,
        buf: &mut PayloadBuf,
    ) -> Result<(), Error> {
        self.prepare_message(info, buf)?;

        if info.flags.has(MessageFlags::DELAY_SEND) {
            return Ok(());
        }

        #[cfg(feature = "fault-injection")]
        if self.drop_outbound {
            tracing::debug!("fault injection: outbound message dropped");
            return Ok(());
        }

        let conn = self
            .connections
            .get_mut(handle)
            .ok_or(Error::IncorrectState)?;
        conn.send_encoded(buf.as_slice())
    }

    /// Encode and protect `buf` in place: assign source and message ids,
    /// look up session material, write the header, apply the tag and
    /// encryption pass.
    ///
    /// A buffer already carrying [`MessageFlags::MESSAGE_ENCODED`] is left
    /// untouched apart from re-extracting its destination node id.
    pub(crate) fn prepare_message(
        &mut self,
        info: &mut MessageInfo,
        buf: &mut PayloadBuf,
    ) -> Result<(), Error> {
        if info.flags.has(MessageFlags::MESSAGE_ENCODED) {
            return info.encode(buf);
        }

        if !info.flags.has(MessageFlags::REUSE_SOURCE_ID) {
            info.source_node_id = self.config.local_node_id;
        }

        let keys = match info.encryption_type {
            EncryptionType::None => {
                if !info.flags.has(MessageFlags::REUSE_MESSAGE_ID) {
                    info.message_id = self.next_unencrypted_id;
                    self.next_unencrypted_id = self.next_unencrypted_id.wrapping_add(1);
                }
                None
            }
            EncryptionType::Aes128CtrHmacSha1 => {
                let session = self
                    .directory
                    .session_state(info.dest_node_id, info.key_id)?;
                let SessionKeys::Aes128CtrHmacSha1(keys) = session.keys else {
                    return Err(Error::NoSession);
                };
                info.peer_auth_mode = session.auth_mode;
                if !session.message_id_synchronized {
                    info.flags.set(MessageFlags::COUNTER_SYNC_REQUEST);
                }
                if !info.flags.has(MessageFlags::REUSE_MESSAGE_ID) {
                    info.message_id = self
                        .directory
                        .next_message_id(info.dest_node_id, info.key_id);
                }
                Some(keys)
            }
        };

        info.encode(buf)?;

        if let Some(keys) = keys {
            let (aad, aad_len) = info.integrity_aad();
            let counter = counter_block(info.source_node_id, info.message_id);
            let header_len = info.header_len();
            let region = &mut buf.as_mut_slice()[header_len..];
            encrypt_authenticate(&keys, &counter, &aad[..aad_len], region)?;
        }

        Ok(())
    }

    fn transmit(
        &mut self,
        dest: SocketAddr,
        send_interface: Option<u32>,
        info: &MessageInfo,
        buf: &PayloadBuf,
    ) -> Result<(), Error> {
        let ip = dest.ip();
        let multicast =
            ip.is_multicast() || matches!(ip, IpAddr::V4(v4) if v4.is_broadcast());
        let ephemeral = info.flags.has(MessageFlags::VIA_EPHEMERAL_UDP);

        if !multicast {
            let ep = self
                .endpoints
                .udp_for(dest.is_ipv4(), ephemeral)
                .ok_or(Error::NoEndpoint)?;
            return match ep.send_to(buf.as_slice(), dest) {
                Ok(_) => {
                    tracing::trace!(%dest, len = buf.len(), "unicast message sent");
                    Ok(())
                }
                Err(e) => {
                    if e.kind() == io::ErrorKind::BrokenPipe {
                        self.udp_refresh_pending = true;
                    }
                    Err(e.into())
                }
            };
        }

        let plan = self.multicast_plan(dest, send_interface, info);
        tracing::debug!(%dest, copies = plan.len(), "multicast fan-out");

        let ep = self
            .endpoints
            .udp_for(dest.is_ipv4(), ephemeral)
            .ok_or(Error::NoEndpoint)?;

        let mut first_err = None;
        let mut broken_pipe = false;

        if plan.is_empty() {
            // No interface information: one send on the default route.
            if let Err(e) = ep.send_to(buf.as_slice(), dest) {
                if is_routing_error(&e) {
                    tracing::debug!(%dest, error = %e, "multicast routing error suppressed");
                } else {
                    broken_pipe |= e.kind() == io::ErrorKind::BrokenPipe;
                    first_err = Some(e);
                }
            }
        }

        for egress in plan {
            match ep.send_multicast(buf.as_slice(), dest, egress) {
                Ok(_) => {}
                Err(e) if is_routing_error(&e) => {
                    tracing::debug!(%dest, ?egress, error = %e, "multicast routing error suppressed");
                }
                Err(e) => {
                    broken_pipe |= e.kind() == io::ErrorKind::BrokenPipe;
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                }
            }
        }

        if broken_pipe {
            self.udp_refresh_pending = true;
        }
        match first_err {
            None => Ok(()),
            Some(e) => Err(e.into()),
        }
    }

    /// Choose the egress list for a multicast/broadcast destination.
    ///
    /// - Bound to a specific address, or an explicit send interface: one
    ///   copy over that interface (an empty result means the bound socket
    ///   itself already pins the egress).
    /// - Mesh-local multicast from a fabric member without the
    ///   default-source override: one copy per fabric address on a
    ///   multicast-capable interface, pinning each copy's source.
    /// - Otherwise: one copy per multicast-capable interface.
    fn multicast_plan(
        &self,
        dest: SocketAddr,
        send_interface: Option<u32>,
        info: &MessageInfo,
    ) -> Vec<hearth_transport::MulticastEgress> {
        use hearth_transport::MulticastEgress;

        if self.config.is_bound_to_address() || send_interface.is_some() {
            let egress = if dest.is_ipv4() {
                self.config.bound_addr_v4.map(MulticastEgress::V4)
            } else {
                send_interface
                    .or(self.config.bound_interface)
                    .map(MulticastEgress::V6)
            };
            return egress.into_iter().collect();
        }

        if is_mesh_local_multicast(&dest.ip())
            && self.directory.in_fabric()
            && !info.flags.has(MessageFlags::DEFAULT_MULTICAST_SOURCE)
        {
            return self
                .interfaces
                .multicast_capable()
                .filter(|ifa| ifa.addr.is_ipv6() && self.directory.is_fabric_address(ifa.addr))
                .map(|ifa| MulticastEgress::V6(ifa.interface_index))
                .collect();
        }

        let mut seen = Vec::new();
        let mut plan = Vec::new();
        for ifa in self.interfaces.multicast_capable() {
            if ifa.addr.is_ipv4() != dest.is_ipv4() || seen.contains(&ifa.interface_index) {
                continue;
            }
            seen.push(ifa.interface_index);
            plan.push(match ifa.addr {
                IpAddr::V4(v4) => MulticastEgress::V4(v4),
                IpAddr::V6(_) => MulticastEgress::V6(ifa.interface_index),
            });
        }
        plan
    }
}
