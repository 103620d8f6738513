//! Message metadata and the wire header codec.
//!
//! The header is a little-endian, bit-packed 16-bit field followed by a
//! 32-bit message id and three conditional fields:
//!
//! ```text
//! u16 header   version<<12 | wire flags (0x0F00) | enc type<<4 | reserved
//! u32 message id
//! [u64 source node id]    iff HAS_SOURCE_NODE_ID
//! [u64 dest node id]      iff HAS_DEST_NODE_ID
//! [u16 key id]            iff encryption type != None
//! payload
//! [20-byte integrity tag] iff encryption type = AES-128-CTR + HMAC-SHA1
//! ```
//!
//! Reserved bits must be zero on decode. The tag is encrypted together
//! with the payload; its presence is implied by the encryption type, never
//! by a length field.

use crate::buffer::PayloadBuf;
use crate::error::Error;
use crate::{MAX_MESSAGE_SIZE, MSG_HEADER_MIN_SIZE, NODE_ID_ANY, NODE_ID_NOT_SPECIFIED};
use hearth_crypto::TAG_LEN;

const HEADER_VERSION_SHIFT: u16 = 12;
const HEADER_VERSION_MASK: u16 = 0xF000;
const HEADER_FLAGS_MASK: u16 = 0x0F00;
const HEADER_ENC_SHIFT: u16 = 4;
const HEADER_ENC_MASK: u16 = 0x00F0;
const HEADER_RESERVED_MASK: u16 = 0x000F;

/// Message protection scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum EncryptionType {
    /// No encryption, no integrity tag.
    #[default]
    None = 0,
    /// AES-128-CTR encryption with a trailing HMAC-SHA1 tag.
    Aes128CtrHmacSha1 = 1,
}

impl EncryptionType {
    /// Length of the trailing integrity tag for this scheme.
    #[must_use]
    pub fn tag_len(self) -> usize {
        match self {
            Self::None => 0,
            Self::Aes128CtrHmacSha1 => TAG_LEN,
        }
    }
}

impl TryFrom<u8> for EncryptionType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Error> {
        match value {
            0 => Ok(Self::None),
            1 => Ok(Self::Aes128CtrHmacSha1),
            other => Err(Error::UnsupportedEncryptionType(other)),
        }
    }
}

/// Wire format revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum MessageVersion {
    /// Original format.
    #[default]
    V1 = 1,
    /// Adds the masked header field and message id to the integrity
    /// pseudo-header.
    V2 = 2,
}

impl TryFrom<u8> for MessageVersion {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Error> {
        match value {
            1 => Ok(Self::V1),
            2 => Ok(Self::V2),
            other => Err(Error::UnsupportedMessageVersion(other)),
        }
    }
}

/// Per-message flag bitmap.
///
/// Bits in `0x0F00` travel on the wire inside the packed header field; all
/// other bits only steer the local send/receive paths.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MessageFlags(u32);

impl MessageFlags {
    /// Return the buffer to the caller instead of consuming it.
    pub const RETAIN_BUFFER: u32 = 0x0001;
    /// Encode and protect only; do not transmit.
    pub const DELAY_SEND: u32 = 0x0002;
    /// Keep the message id already present in the info.
    pub const REUSE_MESSAGE_ID: u32 = 0x0004;
    /// Keep the source node id already present in the info.
    pub const REUSE_SOURCE_ID: u32 = 0x0008;
    /// Receive side: this (peer, message id) was seen before.
    pub const DUPLICATE: u32 = 0x0010;
    /// Send through the ephemeral-port UDP endpoint.
    pub const VIA_EPHEMERAL_UDP: u32 = 0x0020;
    /// Let the platform pick the multicast source address.
    pub const DEFAULT_MULTICAST_SOURCE: u32 = 0x0040;
    /// Buffer already holds the encoded (and protected) message.
    pub const MESSAGE_ENCODED: u32 = 0x0080;

    /// Wire: destination node id field present.
    pub const HAS_DEST_NODE_ID: u32 = 0x0100;
    /// Wire: source node id field present.
    pub const HAS_SOURCE_NODE_ID: u32 = 0x0200;
    /// Wire: payload is tunneled data for a connection tunnel.
    pub const TUNNELED_DATA: u32 = 0x0400;
    /// Wire: sender requests a message-counter synchronization.
    pub const COUNTER_SYNC_REQUEST: u32 = 0x0800;

    const WIRE_MASK: u32 = 0x0F00;

    /// Create an empty flag set.
    #[must_use]
    pub fn new() -> Self {
        Self(0)
    }

    /// Create from a raw bit pattern.
    #[must_use]
    pub fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Raw bit pattern.
    #[must_use]
    pub fn bits(self) -> u32 {
        self.0
    }

    /// Whether all bits in `flag` are set.
    #[must_use]
    pub fn has(self, flag: u32) -> bool {
        self.0 & flag == flag
    }

    /// Set all bits in `flag`.
    pub fn set(&mut self, flag: u32) {
        self.0 |= flag;
    }

    /// Clear all bits in `flag`.
    pub fn clear(&mut self, flag: u32) {
        self.0 &= !flag;
    }

    /// Builder-style set.
    #[must_use]
    pub fn with(mut self, flag: u32) -> Self {
        self.set(flag);
        self
    }

    fn wire_bits(self) -> u16 {
        (self.0 & Self::WIRE_MASK) as u16
    }
}

/// Per-message metadata, created for each send or receive call.
#[derive(Debug, Clone, Copy)]
pub struct MessageInfo {
    /// Flag bitmap; see [`MessageFlags`].
    pub flags: MessageFlags,
    /// Protection scheme.
    pub encryption_type: EncryptionType,
    /// Wire format revision.
    pub version: MessageVersion,
    /// Per-session message counter value.
    pub message_id: u32,
    /// Sending node.
    pub source_node_id: u64,
    /// Receiving node, or [`NODE_ID_ANY`](crate::NODE_ID_ANY).
    pub dest_node_id: u64,
    /// Session key selector; meaningful only when encrypted.
    pub key_id: u16,
    /// Output of the session lookup; never an input.
    pub peer_auth_mode: crate::fabric::PeerAuthMode,
}

impl Default for MessageInfo {
    fn default() -> Self {
        Self {
            flags: MessageFlags::new(),
            encryption_type: EncryptionType::None,
            version: MessageVersion::V1,
            message_id: 0,
            source_node_id: NODE_ID_NOT_SPECIFIED,
            dest_node_id: NODE_ID_NOT_SPECIFIED,
            key_id: 0,
            peer_auth_mode: crate::fabric::PeerAuthMode::Unauthenticated,
        }
    }
}

impl MessageInfo {
    /// Header length this info encodes to, excluding payload and tag.
    #[must_use]
    pub fn header_len(&self) -> usize {
        let mut len = MSG_HEADER_MIN_SIZE;
        if self.flags.has(MessageFlags::HAS_SOURCE_NODE_ID) {
            len += 8;
        }
        if self.flags.has(MessageFlags::HAS_DEST_NODE_ID) {
            len += 8;
        }
        if self.encryption_type != EncryptionType::None {
            len += 2;
        }
        len
    }

    /// The packed 16-bit header field.
    #[must_use]
    pub fn packed_header(&self) -> u16 {
        (u16::from(self.version as u8) << HEADER_VERSION_SHIFT)
            | self.flags.wire_bits()
            | (u16::from(self.encryption_type as u8) << HEADER_ENC_SHIFT)
    }

    /// The integrity pseudo-header: source id, dest id, and (V2) the
    /// masked header field plus message id. Returns the backing array and
    /// the valid length.
    #[must_use]
    pub fn integrity_aad(&self) -> ([u8; 22], usize) {
        let mut aad = [0u8; 22];
        aad[..8].copy_from_slice(&self.source_node_id.to_le_bytes());
        aad[8..16].copy_from_slice(&self.dest_node_id.to_le_bytes());
        match self.version {
            MessageVersion::V1 => (aad, 16),
            MessageVersion::V2 => {
                let masked = self.packed_header() & !HEADER_FLAGS_MASK;
                aad[16..18].copy_from_slice(&masked.to_le_bytes());
                aad[18..22].copy_from_slice(&self.message_id.to_le_bytes());
                (aad, 22)
            }
        }
    }

    /// Encode the header into `buf`'s head reserve and open tag room in
    /// its tail reserve.
    ///
    /// When [`MessageFlags::MESSAGE_ENCODED`] is already set the buffer is
    /// assumed to hold a complete encoded message: the only action is
    /// re-extracting the destination node id from the existing header, so
    /// a prepared buffer can be resubmitted without re-deriving anything.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArgument`] for an empty payload with a non-None
    /// encryption type, [`Error::MessageTooLong`] past the protocol
    /// maximum, [`Error::BufferTooSmall`] when reserves are short.
    pub fn encode(&mut self, buf: &mut PayloadBuf) -> Result<(), Error> {
        if self.flags.has(MessageFlags::MESSAGE_ENCODED) {
            let (decoded, _) = Self::decode(buf.as_slice())?;
            self.dest_node_id = decoded.dest_node_id;
            return Ok(());
        }

        if self.encryption_type != EncryptionType::None && buf.is_empty() {
            return Err(Error::InvalidArgument);
        }

        let tag_len = self.encryption_type.tag_len();
        let total = self.header_len() + buf.len() + tag_len;
        if total > MAX_MESSAGE_SIZE {
            return Err(Error::MessageTooLong {
                len: total,
                max: MAX_MESSAGE_SIZE,
            });
        }

        // Checked up front so a failed encode never leaves the buffer
        // partially prepended.
        if buf.head_room() < self.header_len() || buf.tail_room() < tag_len {
            return Err(Error::BufferTooSmall);
        }

        // Conditional fields prepend in reverse wire order.
        if self.encryption_type != EncryptionType::None {
            buf.prepend(&self.key_id.to_le_bytes())?;
        }
        if self.flags.has(MessageFlags::HAS_DEST_NODE_ID) {
            buf.prepend(&self.dest_node_id.to_le_bytes())?;
        }
        if self.flags.has(MessageFlags::HAS_SOURCE_NODE_ID) {
            buf.prepend(&self.source_node_id.to_le_bytes())?;
        }
        buf.prepend(&self.message_id.to_le_bytes())?;
        buf.prepend(&self.packed_header().to_le_bytes())?;

        buf.grow_tail(tag_len)?;

        self.flags.set(MessageFlags::MESSAGE_ENCODED);
        Ok(())
    }

    /// Decode a header from `buffer`, returning the info and the payload
    /// offset. For encrypted messages the payload runs from the offset to
    /// `buffer.len() - tag_len`.
    ///
    /// # Errors
    ///
    /// [`Error::MessageIncomplete`] when the buffer cannot hold the fields
    /// its header declares, [`Error::UnsupportedMessageVersion`] /
    /// [`Error::UnsupportedEncryptionType`] for unknown nibbles,
    /// [`Error::InvalidArgument`] for nonzero reserved bits.
    pub fn decode(buffer: &[u8]) -> Result<(Self, usize), Error> {
        if buffer.len() < MSG_HEADER_MIN_SIZE {
            return Err(Error::MessageIncomplete {
                expected: MSG_HEADER_MIN_SIZE,
                actual: buffer.len(),
            });
        }

        let header = u16::from_le_bytes([buffer[0], buffer[1]]);
        if header & HEADER_RESERVED_MASK != 0 {
            return Err(Error::InvalidArgument);
        }

        let version = MessageVersion::try_from(((header & HEADER_VERSION_MASK) >> HEADER_VERSION_SHIFT) as u8)?;
        let encryption_type =
            EncryptionType::try_from(((header & HEADER_ENC_MASK) >> HEADER_ENC_SHIFT) as u8)?;
        let flags = MessageFlags::from_bits(u32::from(header & HEADER_FLAGS_MASK));

        let message_id = u32::from_le_bytes([buffer[2], buffer[3], buffer[4], buffer[5]]);

        let mut info = Self {
            flags,
            encryption_type,
            version,
            message_id,
            ..Self::default()
        };

        let mut offset = MSG_HEADER_MIN_SIZE;
        let need = |offset: usize, n: usize| -> Result<(), Error> {
            if offset + n > buffer.len() {
                return Err(Error::MessageIncomplete {
                    expected: offset + n,
                    actual: buffer.len(),
                });
            }
            Ok(())
        };

        if flags.has(MessageFlags::HAS_SOURCE_NODE_ID) {
            need(offset, 8)?;
            info.source_node_id =
                u64::from_le_bytes(buffer[offset..offset + 8].try_into().expect("length checked"));
            offset += 8;
        }

        if flags.has(MessageFlags::HAS_DEST_NODE_ID) {
            need(offset, 8)?;
            info.dest_node_id =
                u64::from_le_bytes(buffer[offset..offset + 8].try_into().expect("length checked"));
            offset += 8;
        } else if encryption_type == EncryptionType::None {
            // Unprotected and unaddressed: any node may consume it.
            info.dest_node_id = NODE_ID_ANY;
        }

        if encryption_type != EncryptionType::None {
            need(offset, 2)?;
            info.key_id = u16::from_le_bytes([buffer[offset], buffer[offset + 1]]);
            offset += 2;
        }

        // The declared scheme implies a trailing tag and at least one
        // payload byte; a shorter buffer is structurally incomplete.
        let tag_len = encryption_type.tag_len();
        if tag_len > 0 {
            need(offset, tag_len + 1)?;
        }

        Ok((info, offset))
    }
}
